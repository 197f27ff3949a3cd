//! Host environment seam: tab queries, focus, badges and tab messaging.
//!
//! The broker never talks to the browser directly; every host operation
//! goes through [`Host`], which the native-messaging bridge implements and
//! tests replace with an in-memory fake.

use thiserror::Error;

use tabrelay_core::protocol::Notification;
use tabrelay_core::types::{Badge, TabId, TabSummary, WindowId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("no tab with id {0}")]
    NoSuchTab(TabId),

    #[error("host call {call} timed out")]
    Timeout { call: &'static str },

    #[error("host call failed: {0}")]
    Failed(String),

    #[error("host bridge disconnected")]
    Disconnected,
}

pub(crate) trait Host {
    async fn query_tabs(&self) -> Result<Vec<TabSummary>, HostError>;

    async fn focus_tab(&self, tab_id: TabId) -> Result<(), HostError>;

    async fn focus_window(&self, window_id: WindowId) -> Result<(), HostError>;

    /// Set text, color and title of a tab's badge.
    async fn set_badge(&self, tab_id: TabId, badge: &Badge) -> Result<(), HostError>;

    async fn send_to_tab(&self, tab_id: TabId, notification: Notification) -> Result<(), HostError>;
}
