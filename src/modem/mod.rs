//! Cellular modem access.
//!
//! - [`command_bus`] serializes every RPC to the modem
//! - [`ofono`] is the production transport
//! - [`ops`] holds the multi-command procedures (band and cell locks)

pub mod command_bus;
pub mod ofono;
pub mod ops;

pub use command_bus::{
    AtCommand, CommandBus, CommandError, ModemEndpoint, ModemTransport, NetworkReading,
    TransportError,
};
pub use ofono::OfonoTransport;
