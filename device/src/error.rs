use thiserror::Error;

/// Failure kinds surfaced by the uplink core.
///
/// Only `NotConfigured` and `Storage` should end a process; everything else is
/// handled inside a reporting cycle by queueing or re-probing.
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("sensor is not configured: {0}")]
    NotConfigured(String),

    #[error("no transport is currently usable")]
    TransportUnavailable,

    #[error("publish was not acknowledged: {0}")]
    PublishFailed(String),

    #[error("LoRa modem timed out: {0}")]
    ModemTimeout(String),

    #[error("LoRa modem error: {0}")]
    ModemError(String),

    #[error("transport driver failed: {0}")]
    Driver(String),

    #[error("malformed downlink payload: {0}")]
    Protocol(String),

    #[error("local store error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, UplinkError>;

impl UplinkError {
    /// Whether a later cycle can be expected to succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NotConfigured(_) | Self::Storage(_))
    }
}

impl From<rusqlite::Error> for UplinkError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for UplinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
