use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ─── Identifiers ──────────────────────────────────────────────────

/// Browser tab identifier as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Browser window identifier as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub i64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of a relay link.
///
/// Close notifications carry this id; the broker uses it to find the map
/// that currently holds the link instead of trusting the stage the link
/// was in when the notification was subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Identity of one armed pending-selection timer.
///
/// An expiry whose token no longer matches the pending entry is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(pub u64);

// ─── Tabs ─────────────────────────────────────────────────────────

/// URL scheme prefixes of internal browser pages that can never be driven.
pub const EXCLUDED_URL_SCHEMES: [&str; 3] = ["chrome:", "edge:", "devtools:"];

/// A host tab as offered to the selection UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSummary {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
}

impl TabSummary {
    /// Returns `true` if the tab has a URL outside the privileged schemes.
    pub fn is_candidate(&self) -> bool {
        !self.url.is_empty()
            && !EXCLUDED_URL_SCHEMES
                .iter()
                .any(|scheme| self.url.starts_with(scheme))
    }
}

/// Keep only the tabs a user may pick as a relay target.
pub fn candidate_tabs(tabs: Vec<TabSummary>) -> Vec<TabSummary> {
    tabs.into_iter().filter(TabSummary::is_candidate).collect()
}

// ─── Badge ────────────────────────────────────────────────────────

/// Connection state shown on a tab's action icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeState {
    Connected,
    Disconnected,
}

impl BadgeState {
    pub fn badge(self) -> Badge {
        match self {
            Self::Connected => Badge {
                text: "✓".into(),
                color: Some("#4CAF50".into()),
                title: Some("Connected to MCP client".into()),
            },
            Self::Disconnected => Badge {
                text: String::new(),
                color: None,
                title: Some(String::new()),
            },
        }
    }
}

/// Concrete badge payload handed to the presenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

// ─── Config ───────────────────────────────────────────────────────

/// Default time budget for a relay handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default inactivity window for a pending selection whose tab lost focus.
pub const DEFAULT_PENDING_TIMEOUT_MS: u64 = 5_000;

/// Broker timing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// How long a relay link may take to reach the open state.
    pub handshake_timeout: Duration,
    /// How long a pending selection survives while its tab is not focused.
    pub pending_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            pending_timeout: Duration::from_millis(DEFAULT_PENDING_TIMEOUT_MS),
        }
    }
}

impl BrokerConfig {
    /// Close reason used when a pending selection times out.
    pub fn inactivity_reason(&self) -> String {
        let ms = self.pending_timeout.as_millis();
        match (ms / 1_000, ms % 1_000) {
            (1, 0) => "inactive for 1 second".to_string(),
            (secs, 0) if secs > 0 => format!("inactive for {secs} seconds"),
            _ => format!("inactive for {ms} ms"),
        }
    }
}
