//! Relay connector seam and its WebSocket implementation.

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;

use tabrelay_core::BrokerError;
use tabrelay_core::broker::RelayLink;
use tabrelay_link::WsRelayLink;

/// Resolves once with the close reason when a link reaches its terminal state.
pub(crate) type LinkClosed = LocalBoxFuture<'static, String>;

pub(crate) trait RelayConnector {
    type Link: RelayLink + 'static;

    /// Open a link to `url`. The caller enforces the handshake budget.
    async fn open(&self, url: &str) -> Result<(Self::Link, LinkClosed), BrokerError>;
}

/// Opens relay links over WebSocket.
#[derive(Debug, Clone)]
pub(crate) struct WsConnector {
    handshake_timeout: Duration,
}

impl WsConnector {
    pub(crate) fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl RelayConnector for WsConnector {
    type Link = WsRelayLink;

    async fn open(&self, url: &str) -> Result<(WsRelayLink, LinkClosed), BrokerError> {
        let (link, signal) = tabrelay_link::connect(url, self.handshake_timeout).await?;
        Ok((link, signal.closed().boxed_local()))
    }
}
