//! Broker error taxonomy.

use thiserror::Error;

use crate::types::TabId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The relay link did not reach the open state within the handshake budget.
    #[error("relay connection timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// The relay link failed to open.
    #[error("failed to connect to relay: {0}")]
    ConnectError(String),

    /// bind-tab was requested for a selector tab with no pending selection.
    #[error("No active MCP relay connection")]
    NoPendingConnection { selector: TabId },

    /// A host-side tab operation failed because the tab no longer exists.
    #[error("tab {tab_id} is no longer available: {detail}")]
    TabVanished { tab_id: TabId, detail: String },

    /// The relay link went away while bind-tab was still in flight.
    #[error("relay connection for tab {tab_id} closed before it was bound")]
    LinkClosed { tab_id: TabId },

    /// The request is missing context it needs (e.g. a sender tab).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The host failed an operation that is not tied to a single tab.
    #[error("host error: {0}")]
    Host(String),
}
