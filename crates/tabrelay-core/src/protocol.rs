//! RPC request/response shapes exchanged with the browser side.
//!
//! Requests are tagged by `type` (`{"type":"connectToTab","tabId":2,...}`);
//! responses are plain objects whose shape depends on the request. Field
//! names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::{TabId, TabSummary, WindowId};

// ─── Requests ─────────────────────────────────────────────────────

/// Context of the caller that sent a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
}

impl Sender {
    pub fn tab(tab_id: TabId, window_id: WindowId) -> Self {
        Self {
            tab_id: Some(tab_id),
            window_id: Some(window_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Open a relay link and park it as the sender tab's pending selection.
    #[serde(rename = "connectToMCPRelay", rename_all = "camelCase")]
    ConnectToRelay { mcp_relay_url: String },

    /// List tabs the user may pick as a target.
    #[serde(rename = "getTabs")]
    GetTabs,

    /// Bind the sender's pending selection to a target tab.
    #[serde(rename = "connectToTab", rename_all = "camelCase")]
    ConnectToTab {
        #[serde(default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        window_id: Option<WindowId>,
        #[serde(default)]
        mcp_relay_url: Option<String>,
    },

    #[serde(rename = "getConnectionStatus")]
    GetConnectionStatus,

    #[serde(rename = "getAllConnections")]
    GetAllConnections,

    #[serde(rename = "disconnect", rename_all = "camelCase")]
    Disconnect {
        #[serde(default)]
        tab_id: Option<TabId>,
    },
}

impl Request {
    /// Wire name of the request type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectToRelay { .. } => "connectToMCPRelay",
            Self::GetTabs => "getTabs",
            Self::ConnectToTab { .. } => "connectToTab",
            Self::GetConnectionStatus => "getConnectionStatus",
            Self::GetAllConnections => "getAllConnections",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

// ─── Responses ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabsResponse {
    pub success: bool,
    #[serde(default)]
    pub tabs: Vec<TabSummary>,
    #[serde(default)]
    pub current_tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTabResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Legacy single-tab view plus the full set of bound tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected_tab_id: Option<TabId>,
    pub connected_tab_ids: Vec<TabId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub tab_id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionSummary>,
}

/// Any response the dispatcher can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ack(AckResponse),
    Tabs(TabsResponse),
    ConnectTab(ConnectTabResponse),
    Status(ConnectionStatus),
    Connections(ConnectionsResponse),
}

impl Response {
    pub fn ack(result: Result<(), BrokerError>) -> Self {
        Self::Ack(match result {
            Ok(()) => AckResponse {
                success: true,
                error: None,
            },
            Err(e) => AckResponse {
                success: false,
                error: Some(e.to_string()),
            },
        })
    }

    pub fn tabs(result: Result<Vec<TabSummary>, BrokerError>, current: Option<TabId>) -> Self {
        Self::Tabs(match result {
            Ok(tabs) => TabsResponse {
                success: true,
                tabs,
                current_tab_id: current,
                error: None,
            },
            Err(e) => TabsResponse {
                success: false,
                tabs: Vec::new(),
                current_tab_id: current,
                error: Some(e.to_string()),
            },
        })
    }

    pub fn connect_tab(result: Result<TabId, BrokerError>) -> Self {
        Self::ConnectTab(match result {
            Ok(tab_id) => ConnectTabResponse {
                success: true,
                tab_id: Some(tab_id),
                error: None,
            },
            Err(e) => ConnectTabResponse {
                success: false,
                tab_id: None,
                error: Some(e.to_string()),
            },
        })
    }

    /// `false` only for responses that carry an explicit failure.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Ack(r) => r.success,
            Self::Tabs(r) => r.success,
            Self::ConnectTab(r) => r.success,
            Self::Status(_) | Self::Connections(_) => true,
        }
    }
}

// ─── Host events ──────────────────────────────────────────────────

/// Tab lifecycle notification delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TabEvent {
    #[serde(rename = "tabClosed", rename_all = "camelCase")]
    Closed { tab_id: TabId },
    /// Navigation or any other in-place change of the tab.
    #[serde(rename = "tabUpdated", rename_all = "camelCase")]
    Updated { tab_id: TabId },
    /// The host focused this tab.
    #[serde(rename = "tabActivated", rename_all = "camelCase")]
    Activated { tab_id: TabId },
}

impl TabEvent {
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::Closed { tab_id } | Self::Updated { tab_id } | Self::Activated { tab_id } => {
                *tab_id
            }
        }
    }
}

// ─── Outbound notifications ───────────────────────────────────────

/// Message pushed to a tab outside any request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// The tab's pending selection was dropped after losing focus too long.
    ConnectionTimeout,
}
