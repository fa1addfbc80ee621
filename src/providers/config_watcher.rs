use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify::{Event, EventHandler, RecursiveMode, Watcher, recommended_watcher};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    event::{ConfigChangeType, Event as AppEvent, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Quiet period before a burst of file events is treated as one edit.
const DEBOUNCE: Duration = Duration::from_millis(2000);

/// Watches the configuration file and publishes
/// [`AppEvent::ConfigChangeDetected`] after each debounced edit.
///
/// Hot-reloadable edits are already applied to the shared config when the
/// event is published; edits to hardware sections are reported and ignored.
///
/// # Priority and Criticality
///
/// - **Priority**: 6
/// - **Critical**: No
pub struct ConfigWatcherServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl ConfigWatcherServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for ConfigWatcherServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_config_watcher_service(state, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ConfigWatcherService"
    }

    fn priority(&self) -> i32 {
        6
    }

    fn is_critical(&self) -> bool {
        false
    }
}

/// Bridges notify's callback thread into the async loop.
#[derive(Debug)]
struct ChannelHandler {
    sender: mpsc::UnboundedSender<notify::Result<Event>>,
}

impl EventHandler for ChannelHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Err(e) = self.sender.send(event) {
            error!("Failed to forward filesystem event: {e}");
        }
    }
}

fn touches_config(event: &Event, config_path: &Path) -> bool {
    let relevant_kind = event.kind.is_modify() || event.kind.is_create();
    relevant_kind
        && event
            .paths
            .iter()
            .any(|path| path == config_path || path.file_name() == config_path.file_name())
}

async fn run_config_watcher_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let config_path = state.config_manager().path().to_path_buf();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(ChannelHandler { sender: event_tx })?;

    // Editors replace the file, so watch the directory instead.
    let watch_path = config_path
        .parent()
        .map_or_else(|| config_path.clone(), Path::to_path_buf);
    watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
    info!("Watching {} for configuration changes", config_path.display());

    let mut debounce = tokio::time::interval(DEBOUNCE);
    debounce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending = false;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Config watcher service cancelled");
                break;
            }

            event = event_rx.recv() => match event {
                Some(Ok(event)) => {
                    debug!("Filesystem event {:?} on {:?}", event.kind, event.paths);
                    if touches_config(&event, &config_path) {
                        pending = true;
                        debounce.reset();
                    }
                }
                Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                None => {
                    warn!("Filesystem event channel closed");
                    break;
                }
            },

            _ = debounce.tick(), if pending => {
                pending = false;
                if !config_path.exists() {
                    warn!("Configuration file {} disappeared", config_path.display());
                    continue;
                }

                match state.config_manager().analyze_config_changes().await {
                    Ok(change) => {
                        match &change {
                            ConfigChangeType::HotReload => info!("Configuration reloaded"),
                            ConfigChangeType::ColdRestart { changed_sections } => warn!(
                                "Sections {changed_sections:?} changed; restart gatewayd to apply them"
                            ),
                        }
                        if let Err(e) = event_bus.publish(AppEvent::ConfigChangeDetected(change)) {
                            error!("Failed to publish config change: {e}");
                        }
                    }
                    Err(e) => error!("Ignoring configuration edit: {e:#}"),
                }
            }
        }
    }

    if let Err(e) = watcher.unwatch(&watch_path) {
        warn!("Failed to unwatch {}: {e}", watch_path.display());
    }
    Ok(())
}
