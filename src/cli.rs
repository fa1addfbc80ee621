use clap::Parser;
use std::path::PathBuf;

/// gatewayd: LED, battery, modem and power key coordinator for the gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file (default: $GATEWAYD_CONFIG, then /etc/gatewayd/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and log stdio to /var/tmp/gatewayd.log
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Log debug messages
    #[arg(short = 'v', long = "verbose", default_value = "false")]
    pub verbose: bool,
}
