//! Network state derived from periodic modem queries.

use serde::Serialize;

use crate::{
    modem::{CommandError, NetworkReading},
    status::NetworkState,
};

/// One classified poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkSample {
    pub state: NetworkState,
    pub is_5g: Option<bool>,
}

impl NetworkSample {
    pub const UNKNOWN: Self = Self {
        state: NetworkState::Unknown,
        is_5g: None,
    };

    /// A failed query is `Unknown`; a reading with zero strength is `Offline`.
    pub fn classify(reading: &Result<NetworkReading, CommandError>) -> Self {
        match reading {
            Ok(reading) => Self {
                state: if reading.is_connected() {
                    NetworkState::Connected
                } else {
                    NetworkState::Offline
                },
                is_5g: Some(reading.is_5g()),
            },
            Err(_) => Self::UNKNOWN,
        }
    }
}

/// Suppresses repeated samples so only changes are emitted.
#[derive(Debug, Default)]
pub struct NetworkLatch {
    last: Option<NetworkSample>,
}

impl NetworkLatch {
    pub fn observe(&mut self, sample: NetworkSample) -> Option<NetworkSample> {
        if self.last == Some(sample) {
            return None;
        }
        self.last = Some(sample);
        Some(sample)
    }

    /// Forgets the last sample so the next one is emitted unconditionally.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
