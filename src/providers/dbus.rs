//! D-Bus control surface.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use zbus::Connection;

use crate::{
    app_context::AppState,
    config::BusKind,
    event::{Event, EventBus},
    interface::GatewayInterface,
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

pub const SERVICE_NAME: &str = "io.github.gatewayd";
pub const OBJECT_PATH: &str = "/io/github/gatewayd";

/// Publishes [`GatewayInterface`] and forwards power key gestures as
/// `GestureDetected` signals.
///
/// # Priority and Criticality
///
/// - **Priority**: 8
/// - **Critical**: No (the LEDs keep working without a bus)
pub struct DBusServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
    connection: Connection,
}

impl DBusServiceProvider {
    /// Connects to the bus named in the configuration.
    pub async fn new(state: Arc<AppState>, event_bus: EventBus) -> Result<Self> {
        let bus = state.config().await.dbus.bus;
        let connection = connect(bus).await?;
        Ok(Self {
            state,
            event_bus,
            connection,
        })
    }
}

async fn connect(bus: BusKind) -> Result<Connection> {
    let connection = match bus {
        BusKind::System => Connection::system().await,
        BusKind::Session => Connection::session().await,
    };
    connection.with_context(|| format!("Failed to connect to the {bus:?} bus"))
}

#[async_trait]
impl ServiceProvider for DBusServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let interface = GatewayInterface::new(
            self.state.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        self.connection
            .object_server()
            .at(OBJECT_PATH, interface)
            .await?;
        self.connection
            .request_name(SERVICE_NAME)
            .await
            .with_context(|| format!("Failed to own {SERVICE_NAME}"))?;
        info!("D-Bus interface published at {OBJECT_PATH}");

        let event_bus = self.event_bus.clone();
        let connection = self.connection.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_dbus_service(event_bus, connection, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "DBusService"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn is_critical(&self) -> bool {
        false
    }
}

/// Relays gestures from the event bus until cancelled, then releases the name.
async fn run_dbus_service(
    event_bus: EventBus,
    connection: Connection,
    cancel_token: CancellationToken,
) -> Result<()> {
    let iface_ref = connection
        .object_server()
        .interface::<_, GatewayInterface>(OBJECT_PATH)
        .await?;
    let mut events = BroadcastStream::new(event_bus.subscribe());

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("D-Bus service cancelled");
                break;
            }
            next = events.next() => match next {
                Some(Ok(Event::GestureDetected(gesture))) => {
                    if let Err(e) = GatewayInterface::gesture_detected(
                        iface_ref.signal_emitter(),
                        gesture.as_str(),
                    )
                    .await
                    {
                        warn!("Failed to emit GestureDetected: {e}");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => debug!("D-Bus relay lagged: {e}"),
                None => break,
            }
        }
    }

    if let Err(e) = connection.release_name(SERVICE_NAME).await {
        debug!("Failed to release {SERVICE_NAME}: {e}");
    }
    Ok(())
}
