//! Error types for relay link setup.

use thiserror::Error;

use tabrelay_core::BrokerError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("relay url must use ws:// or wss://: {0}")]
    InvalidUrl(String),

    #[error("relay handshake timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("relay handshake failed: {0}")]
    Connect(String),
}

impl From<LinkError> for BrokerError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout { timeout_ms } => BrokerError::ConnectTimeout { timeout_ms },
            LinkError::InvalidUrl(_) | LinkError::Connect(_) => {
                BrokerError::ConnectError(err.to_string())
            }
        }
    }
}
