//! oFono transport for the command bus.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use log::{info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use zbus::Connection;
use zvariant::{DynamicType, OwnedObjectPath, OwnedValue, Type, Value};

use super::command_bus::{AT_TIMEOUT, ModemEndpoint, ModemTransport, TransportError};

const MANAGER_INTERFACE: &str = "org.ofono.Manager";
const MODEM_INTERFACE: &str = "org.ofono.Modem";
const NETWORK_REGISTRATION_INTERFACE: &str = "org.ofono.NetworkRegistration";
const RADIO_SETTINGS_INTERFACE: &str = "org.ofono.RadioSettings";

/// Talks to the modem through oFono on the system bus.
///
/// The bus connection is opened lazily and dropped by [`reconnect`](ModemTransport::reconnect).
pub struct OfonoTransport {
    service: String,
    default_endpoint: ModemEndpoint,
    connection: Mutex<Option<Connection>>,
}

impl OfonoTransport {
    pub fn new(service: impl Into<String>, default_endpoint: ModemEndpoint) -> Self {
        Self {
            service: service.into(),
            default_endpoint,
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Connection, TransportError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let connection = Connection::system().await.map_err(classify)?;
        info!("Connected to system bus for {}", self.service);
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn call<B, R>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        B: serde::Serialize + DynamicType,
        R: DeserializeOwned + Type,
    {
        let connection = self.connection().await?;
        let call = connection.call_method(
            Some(self.service.as_str()),
            path,
            Some(interface),
            method,
            body,
        );

        let reply = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(classify)?;

        decode_reply(&reply)
    }

    async fn properties(
        &self,
        endpoint: &ModemEndpoint,
        interface: &str,
    ) -> Result<HashMap<String, OwnedValue>, TransportError> {
        self.call(endpoint.path(), interface, "GetProperties", &(), AT_TIMEOUT)
            .await
    }
}

fn decode_reply<R>(reply: &zbus::Message) -> Result<R, TransportError>
where
    R: DeserializeOwned + Type,
{
    reply.body().deserialize::<R>().map_err(classify)
}

#[async_trait]
impl ModemTransport for OfonoTransport {
    async fn resolve_endpoint(&self) -> Result<ModemEndpoint, TransportError> {
        let card: Result<OwnedObjectPath, _> = self
            .call("/", MANAGER_INTERFACE, "GetDataCard", &(), AT_TIMEOUT)
            .await;

        match card {
            Ok(path) => Ok(ModemEndpoint::new(path.as_str())),
            Err(e) => {
                warn!(
                    "Data card query failed ({e}), using {}",
                    self.default_endpoint
                );
                Ok(self.default_endpoint.clone())
            }
        }
    }

    async fn send_at(
        &self,
        endpoint: &ModemEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        self.call(endpoint.path(), MODEM_INTERFACE, "SendAtcmd", &command, timeout)
            .await
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.connection.lock().await.take().is_some() {
            info!("Dropped system bus connection to {}", self.service);
        }
        Ok(())
    }

    async fn signal_strength(&self, endpoint: &ModemEndpoint) -> Result<u8, TransportError> {
        let properties = self
            .properties(endpoint, NETWORK_REGISTRATION_INTERFACE)
            .await?;

        match properties.get("Strength").map(|value| &**value) {
            Some(Value::U8(strength)) => Ok(*strength),
            Some(other) => Err(TransportError::Other(format!(
                "unexpected Strength value {other:?}"
            ))),
            None => Err(TransportError::Other("Strength not reported".to_string())),
        }
    }

    async fn technology(&self, endpoint: &ModemEndpoint) -> Result<String, TransportError> {
        let properties = self.properties(endpoint, RADIO_SETTINGS_INTERFACE).await?;

        match properties.get("TechnologyPreference").map(|value| &**value) {
            Some(Value::Str(technology)) => Ok(technology.as_str().to_string()),
            Some(other) => Err(TransportError::Other(format!(
                "unexpected TechnologyPreference value {other:?}"
            ))),
            None => Err(TransportError::Other(
                "TechnologyPreference not reported".to_string(),
            )),
        }
    }
}

fn classify(error: zbus::Error) -> TransportError {
    match error {
        zbus::Error::InputOutput(e) => TransportError::Closed(e.to_string()),
        other => TransportError::classify(&other.to_string()),
    }
}
