use std::fs::File;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use gatewayd::{application::Application, cli::Cli, config::ConfigManager};
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};

const DAEMON_LOG: &str = "/var/tmp/gatewayd.log";

fn init_log(verbose: bool) -> Result<()> {
    let logger = syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "gatewayd".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("syslog unavailable: {e}"))?;

    log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
        .map_err(|e| anyhow!("{e}"))?;
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    Ok(())
}

fn into_daemon() -> Result<()> {
    let stdout = File::create(DAEMON_LOG).with_context(|| format!("Failed to create {DAEMON_LOG}"))?;
    let stderr = stdout.try_clone()?;
    Daemonize::new()
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|e| anyhow!("daemonize: {e}"))
}

async fn run(cli: Cli) -> Result<()> {
    let config_manager = ConfigManager::load(cli.config).await?;
    Application::builder()
        .with_config_manager(config_manager)
        .build()?
        .run()
        .await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // fork before any runtime threads exist
    if cli.daemonize {
        into_daemon()?;
    }
    init_log(cli.verbose)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gatewayd")
        .build()
        .context("Failed to build the tokio runtime")?;

    runtime.block_on(async {
        #[cfg(feature = "tokio-console")]
        console_subscriber::init();

        info!("gatewayd {} starting", env!("CARGO_PKG_VERSION"));
        let result = run(cli).await;
        if let Err(e) = &result {
            error!("gatewayd stopped: {e:#}");
        }
        result
    })
}
