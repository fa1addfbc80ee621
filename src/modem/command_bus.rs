//! Serialized AT command channel to the cellular modem.
//!
//! Every modem RPC issued by the daemon goes through [`CommandBus`], which
//! holds a single lock for the whole duration of a command, including its
//! recovery attempts. Callers queue on that lock and never interleave.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Upper bound for a single modem RPC.
pub const AT_TIMEOUT: Duration = Duration::from_secs(8);

/// Wait before retrying a command the modem reported as already in progress.
pub const BUSY_BACKOFF: Duration = Duration::from_millis(500);

/// Pause between dependent steps of a multi-command sequence.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Extra attempts shared by the closed-transport and busy recovery paths.
pub const MAX_RETRIES: u8 = 1;

/// Tagged failure of a modem command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid AT command: {0:?}")]
    InvalidCommand(String),

    #[error("modem did not answer within {0:?}")]
    Timeout(Duration),

    #[error("modem transport closed: {0}")]
    TransportClosed(String),

    #[error("modem busy: {0}")]
    Busy(String),

    #[error("modem returned an empty response")]
    EmptyResponse,

    #[error("no modem available: {0}")]
    DeviceUnavailable(String),

    #[error("modem call failed: {0}")]
    Rpc(String),
}

/// Failure reported by a [`ModemTransport`] before recovery policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("operation already in progress: {0}")]
    Busy(String),

    #[error("call timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classifies a raw transport message by the markers the modem stack uses.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("connection closed") {
            Self::Closed(message.to_string())
        } else if lower.contains("already in progress") {
            Self::Busy(message.to_string())
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else {
            Self::Other(message.to_string())
        }
    }
}

/// Object path of the modem the daemon is currently talking to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModemEndpoint(String);

impl ModemEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// SIM slot served by this endpoint, if it is one of the radio interfaces.
    pub fn slot(&self) -> Option<&'static str> {
        match self.0.as_str() {
            "/ril_0" => Some("slot1"),
            "/ril_1" => Some("slot2"),
            _ => None,
        }
    }
}

impl fmt::Display for ModemEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated AT command with its per-call limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    text: String,
    timeout: Duration,
}

impl AtCommand {
    /// Builds a command, rejecting anything that does not start with "AT"
    /// once leading spaces and tabs are stripped.
    pub fn new(text: impl Into<String>) -> Result<Self, CommandError> {
        let mut text = text.into();
        let indent = text.len() - text.trim_start_matches([' ', '\t']).len();
        text.drain(..indent);

        let has_prefix = text
            .get(..2)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("AT"));
        if !has_prefix {
            return Err(CommandError::InvalidCommand(text));
        }

        Ok(Self {
            text,
            timeout: AT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Raw signal and radio technology as reported by the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReading {
    /// Signal strength in modem units; zero means no service.
    pub strength: u8,
    /// Current technology preference, e.g. "NR 5G/LTE auto".
    pub technology: String,
}

impl NetworkReading {
    pub fn is_connected(&self) -> bool {
        self.strength > 0
    }

    pub fn is_5g(&self) -> bool {
        is_5g_technology(&self.technology)
    }

    /// Received signal strength in dBm.
    pub fn rssi_dbm(&self) -> i16 {
        2 * i16::from(self.strength) - 113
    }
}

/// True when a technology preference string selects an NR radio.
pub fn is_5g_technology(technology: &str) -> bool {
    let lower = technology.to_ascii_lowercase();
    lower.contains("nr") || lower.contains("5g")
}

/// RPC surface of the modem stack.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModemTransport: Send + Sync {
    /// Looks up the endpoint currently carrying data.
    async fn resolve_endpoint(&self) -> Result<ModemEndpoint, TransportError>;

    /// Sends one AT command and returns the raw response text.
    async fn send_at(
        &self,
        endpoint: &ModemEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError>;

    /// Tears down the underlying connection so the next call starts fresh.
    async fn reconnect(&self) -> Result<(), TransportError>;

    async fn signal_strength(&self, endpoint: &ModemEndpoint) -> Result<u8, TransportError>;

    async fn technology(&self, endpoint: &ModemEndpoint) -> Result<String, TransportError>;
}

/// Single-flight command channel to the modem.
pub struct CommandBus {
    transport: Arc<dyn ModemTransport>,
    binding: Mutex<Option<ModemEndpoint>>,
    rpc_timeout: Duration,
}

impl CommandBus {
    pub fn new(transport: Arc<dyn ModemTransport>) -> Self {
        Self {
            transport,
            binding: Mutex::new(None),
            rpc_timeout: AT_TIMEOUT,
        }
    }

    /// Overrides the timeout used by [`execute_text`](Self::execute_text)
    /// and network queries.
    pub fn with_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// Validates and executes a textual command with the bus timeout.
    pub async fn execute_text(&self, text: &str) -> Result<String, CommandError> {
        let command = AtCommand::new(text)?.with_timeout(self.rpc_timeout);
        self.execute(&command).await
    }

    /// Executes one command, recovering once from a closed transport or a
    /// busy modem. Returns the trimmed response text.
    pub async fn execute(&self, command: &AtCommand) -> Result<String, CommandError> {
        let mut binding = self.binding.lock().await;
        let mut retries_left = MAX_RETRIES;

        loop {
            let endpoint = self.bound_endpoint(&mut binding).await?;
            debug!("AT -> {} on {}", command.text(), endpoint);

            let outcome = tokio::time::timeout(
                command.timeout(),
                self.transport
                    .send_at(&endpoint, command.text(), command.timeout()),
            )
            .await;

            let error = match outcome {
                Err(_) => return Err(CommandError::Timeout(command.timeout())),
                Ok(Ok(response)) => {
                    let response = response.trim();
                    if response.is_empty() {
                        return Err(CommandError::EmptyResponse);
                    }
                    debug!("AT <- {response}");
                    return Ok(response.to_string());
                }
                Ok(Err(error)) => error,
            };

            match error {
                TransportError::Closed(message) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!("Modem connection closed ({message}), rebinding and retrying");
                    *binding = None;
                    self.transport
                        .reconnect()
                        .await
                        .map_err(|e| CommandError::TransportClosed(e.to_string()))?;
                }
                TransportError::Busy(message) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!("Modem busy ({message}), retrying in {BUSY_BACKOFF:?}");
                    tokio::time::sleep(BUSY_BACKOFF).await;
                }
                TransportError::Closed(message) => {
                    *binding = None;
                    return Err(CommandError::TransportClosed(message));
                }
                TransportError::Busy(message) => return Err(CommandError::Busy(message)),
                TransportError::Timeout => return Err(CommandError::Timeout(command.timeout())),
                TransportError::Other(message) => return Err(CommandError::Rpc(message)),
            }
        }
    }

    /// Reads signal strength and technology under the same lock as AT commands.
    ///
    /// Any transport failure drops the endpoint binding so the next query
    /// resolves the data card again.
    pub async fn query_network(&self) -> Result<NetworkReading, CommandError> {
        let mut binding = self.binding.lock().await;
        let endpoint = self.bound_endpoint(&mut binding).await?;

        let reading = async {
            let strength = self.transport.signal_strength(&endpoint).await?;
            let technology = self.transport.technology(&endpoint).await?;
            Ok::<_, TransportError>(NetworkReading {
                strength,
                technology,
            })
        };

        match tokio::time::timeout(self.rpc_timeout, reading).await {
            Ok(Ok(reading)) => Ok(reading),
            Ok(Err(error)) => {
                *binding = None;
                Err(match error {
                    TransportError::Closed(message) => CommandError::TransportClosed(message),
                    TransportError::Busy(message) => CommandError::Busy(message),
                    TransportError::Timeout => CommandError::Timeout(self.rpc_timeout),
                    TransportError::Other(message) => CommandError::Rpc(message),
                })
            }
            Err(_) => {
                *binding = None;
                Err(CommandError::Timeout(self.rpc_timeout))
            }
        }
    }

    async fn bound_endpoint(
        &self,
        binding: &mut MutexGuard<'_, Option<ModemEndpoint>>,
    ) -> Result<ModemEndpoint, CommandError> {
        if let Some(endpoint) = binding.as_ref() {
            return Ok(endpoint.clone());
        }

        let endpoint = self
            .transport
            .resolve_endpoint()
            .await
            .map_err(|e| CommandError::DeviceUnavailable(e.to_string()))?;
        debug!("Bound modem endpoint {endpoint}");
        **binding = Some(endpoint.clone());
        Ok(endpoint)
    }
}
