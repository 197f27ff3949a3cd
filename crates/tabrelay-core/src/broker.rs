//! Connection broker state machine.
//!
//! Tracks relay links from handshake to teardown:
//!
//! - **Pending selection**: keyed by the selector tab that initiated the
//!   handshake; the link is open but not yet bound to a tab.
//! - **Active connection**: keyed by the tab the link is bound to.
//!
//! ## Key transitions
//!
//! - handshake done: `∅ -> pending[selector]` (a stale pending link for the
//!   same selector is closed first). A handshake whose selector tab closed
//!   while the link was opening never reaches the pending map.
//! - bind-tab: `pending[selector] -> active[target]` (a previous link on
//!   `target` is closed with reason `superseded`)
//! - disconnect / tab closed / link closed: `active[tab] -> ∅`
//! - tab closed / inactivity timeout / link closed: `pending[selector] -> ∅`
//!
//! Links are owned values moved between the two maps, so a link can never
//! sit in both. Every transition is synchronous and returns the [`Effect`]s
//! the runtime must carry out afterwards; the maps are already consistent by
//! the time any of those effects is awaited.
//!
//! ## Legacy pointer
//!
//! `last_connected_tab_id` is derived from the active map on every read:
//! each promotion stamps a sequence number and the pointer is the active tab
//! with the highest one.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::BrokerError;
use crate::protocol::{ConnectionStatus, ConnectionSummary, Notification};
use crate::types::{BadgeState, BrokerConfig, LinkId, TabId, TimerToken};

// ─── Close reasons ───────────────────────────────────────────────────

pub const SUPERSEDED_REASON: &str = "superseded";
pub const TAB_CLOSED_REASON: &str = "tab closed";
pub const DISCONNECT_REASON: &str = "disconnected";
pub const SHUTDOWN_REASON: &str = "broker shutting down";
pub const BIND_FAILED_REASON: &str = "bind failed";

// ─── Relay link seam ─────────────────────────────────────────────────

/// The broker's view of a relay link.
///
/// `close` must be idempotent and must not block; implementations hand the
/// actual socket teardown to their own IO task. The one-shot close
/// notification is delivered to the broker separately, as
/// [`Broker::link_closed`] with the link's id.
pub trait RelayLink {
    fn id(&self) -> LinkId;

    /// Tab this link was bound to, if any.
    fn tab_id(&self) -> Option<TabId>;

    /// Bind the link to `tab_id`. Called at most once per link.
    fn bind_tab(&mut self, tab_id: TabId);

    fn close(&mut self, reason: &str);

    fn is_closed(&self) -> bool;
}

// ─── Effects ─────────────────────────────────────────────────────────

/// Work the runtime performs after a transition has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Best-effort badge update; failures are swallowed.
    SetBadge { tab_id: TabId, state: BadgeState },
    /// Best-effort message to a tab.
    Notify {
        tab_id: TabId,
        notification: Notification,
    },
    /// Start the inactivity timer of a pending selection.
    ArmTimer {
        selector: TabId,
        token: TimerToken,
        after: Duration,
    },
    CancelTimer { token: TimerToken },
}

// ─── Records ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PendingSelection<L> {
    pub selector_tab_id: TabId,
    pub link: L,
    pub timer: Option<TimerToken>,
}

/// Claim on an in-flight relay handshake, redeemed once the link is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTicket {
    selector: TabId,
    generation: u64,
}

#[derive(Debug)]
pub struct ActiveConnection<L> {
    pub tab_id: TabId,
    pub link: L,
    pub connected_at: DateTime<Utc>,
    seq: u64,
}

// ─── Broker ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Broker<L> {
    config: BrokerConfig,
    pending: BTreeMap<TabId, PendingSelection<L>>,
    active: BTreeMap<TabId, ActiveConnection<L>>,
    /// Last tab reported focused by the host.
    focused_tab: Option<TabId>,
    /// Handshakes still opening their link, by generation.
    handshakes: BTreeMap<u64, TabId>,
    shutting_down: bool,
    next_handshake: u64,
    next_timer: u64,
    next_seq: u64,
}

impl<L: RelayLink> Broker<L> {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            pending: BTreeMap::new(),
            active: BTreeMap::new(),
            focused_tab: None,
            handshakes: BTreeMap::new(),
            shutting_down: false,
            next_handshake: 0,
            next_timer: 0,
            next_seq: 0,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// `selector` starts opening a relay link. The ticket must be handed
    /// back to [`Broker::complete_handshake`] or
    /// [`Broker::abandon_handshake`].
    pub fn begin_handshake(&mut self, selector: TabId) -> HandshakeTicket {
        self.next_handshake += 1;
        self.handshakes.insert(self.next_handshake, selector);
        HandshakeTicket {
            selector,
            generation: self.next_handshake,
        }
    }

    /// Park the link opened under `ticket`. If the selector tab closed while
    /// the link was opening, the link is closed and never becomes pending.
    pub fn complete_handshake(
        &mut self,
        ticket: HandshakeTicket,
        mut link: L,
    ) -> Result<Vec<Effect>, BrokerError> {
        if self.handshakes.remove(&ticket.generation).is_none() {
            let reason = if self.shutting_down {
                SHUTDOWN_REASON
            } else {
                TAB_CLOSED_REASON
            };
            link.close(reason);
            return Err(BrokerError::TabVanished {
                tab_id: ticket.selector,
                detail: "closed during relay handshake".to_string(),
            });
        }
        Ok(self.insert_pending(ticket.selector, link))
    }

    /// The handshake behind `ticket` failed; forget it.
    pub fn abandon_handshake(&mut self, ticket: HandshakeTicket) {
        self.handshakes.remove(&ticket.generation);
    }

    pub fn handshakes_in_flight(&self) -> usize {
        self.handshakes.len()
    }

    /// Park a freshly opened link as `selector`'s pending selection.
    pub fn insert_pending(&mut self, selector: TabId, link: L) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(stale) = self.pending.remove(&selector) {
            effects.extend(close_pending(stale, SUPERSEDED_REASON));
        }
        self.pending.insert(
            selector,
            PendingSelection {
                selector_tab_id: selector,
                link,
                timer: None,
            },
        );
        effects
    }

    // ── Bind ─────────────────────────────────────────────────────────

    /// Promote `selector`'s pending selection to an active connection on
    /// `target`, evicting whatever link `target` held before.
    pub fn promote(
        &mut self,
        selector: TabId,
        target: TabId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, BrokerError> {
        let mut entry = self
            .pending
            .remove(&selector)
            .ok_or(BrokerError::NoPendingConnection { selector })?;

        let mut effects = Vec::new();
        if let Some(token) = entry.timer.take() {
            effects.push(Effect::CancelTimer { token });
        }
        if let Some(mut previous) = self.active.remove(&target) {
            previous.link.close(SUPERSEDED_REASON);
            effects.push(Effect::SetBadge {
                tab_id: target,
                state: BadgeState::Disconnected,
            });
        }

        entry.link.bind_tab(target);
        self.next_seq += 1;
        self.active.insert(
            target,
            ActiveConnection {
                tab_id: target,
                link: entry.link,
                connected_at: now,
                seq: self.next_seq,
            },
        );
        effects.push(Effect::SetBadge {
            tab_id: target,
            state: BadgeState::Connected,
        });
        Ok(effects)
    }

    /// Roll back a promotion whose foreground step failed.
    ///
    /// Only acts if `active[tab_id]` still holds `link_id`; another handler
    /// may have replaced or removed it in the meantime. Returns `true` if the
    /// connection was torn down.
    pub fn abandon(&mut self, tab_id: TabId, link_id: LinkId, reason: &str) -> bool {
        if self
            .active
            .get(&tab_id)
            .is_none_or(|conn| conn.link.id() != link_id)
        {
            return false;
        }
        if let Some(mut conn) = self.active.remove(&tab_id) {
            conn.link.close(reason);
        }
        true
    }

    // ── Disconnect ───────────────────────────────────────────────────

    /// Close the active connection on `tab_id`. No effects if there is none.
    pub fn disconnect(&mut self, tab_id: TabId) -> Vec<Effect> {
        self.close_active(tab_id, DISCONNECT_REASON)
            .into_iter()
            .collect()
    }

    /// Close every active connection.
    pub fn disconnect_all(&mut self) -> Vec<Effect> {
        let tabs: Vec<TabId> = self.active.keys().copied().collect();
        tabs.into_iter()
            .filter_map(|tab_id| self.close_active(tab_id, DISCONNECT_REASON))
            .collect()
    }

    // ── Host tab lifecycle ───────────────────────────────────────────

    /// The host closed `tab_id`: drop its pending selection and its active
    /// connection, whichever exist.
    pub fn tab_closed(&mut self, tab_id: TabId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.focused_tab == Some(tab_id) {
            self.focused_tab = None;
        }
        self.handshakes.retain(|_, selector| *selector != tab_id);
        if let Some(entry) = self.pending.remove(&tab_id) {
            effects.extend(close_pending(entry, TAB_CLOSED_REASON));
        }
        effects.extend(self.close_active(tab_id, TAB_CLOSED_REASON));
        effects
    }

    /// The host updated `tab_id` (e.g. navigated); re-assert its badge.
    pub fn tab_updated(&mut self, tab_id: TabId) -> Vec<Effect> {
        if self.active.contains_key(&tab_id) {
            vec![Effect::SetBadge {
                tab_id,
                state: BadgeState::Connected,
            }]
        } else {
            Vec::new()
        }
    }

    /// The host focused `focused`. Every pending selection is re-evaluated:
    /// the focused selector's timer is cancelled, every other selector
    /// without a timer gets one.
    pub fn tab_activated(&mut self, focused: TabId) -> Vec<Effect> {
        self.focused_tab = Some(focused);
        let after = self.config.pending_timeout;
        let mut effects = Vec::new();
        for (selector, entry) in &mut self.pending {
            if *selector == focused {
                if let Some(token) = entry.timer.take() {
                    effects.push(Effect::CancelTimer { token });
                }
            } else if entry.timer.is_none() {
                self.next_timer += 1;
                let token = TimerToken(self.next_timer);
                entry.timer = Some(token);
                effects.push(Effect::ArmTimer {
                    selector: *selector,
                    token,
                    after,
                });
            }
        }
        effects
    }

    /// An inactivity timer fired. Stale tokens are ignored.
    pub fn pending_expired(&mut self, selector: TabId, token: TimerToken) -> Vec<Effect> {
        if self
            .pending
            .get(&selector)
            .is_none_or(|entry| entry.timer != Some(token))
        {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if let Some(mut entry) = self.pending.remove(&selector) {
            entry.timer = None;
            entry.link.close(&self.config.inactivity_reason());
            effects.push(Effect::Notify {
                tab_id: selector,
                notification: Notification::ConnectionTimeout,
            });
        }
        effects
    }

    // ── Link lifecycle ───────────────────────────────────────────────

    /// A link reported its one-shot close. Removes it from whichever map
    /// still holds it; a link the broker already evicted is a no-op.
    pub fn link_closed(&mut self, link_id: LinkId) -> Vec<Effect> {
        let pending_key = self
            .pending
            .iter()
            .find(|(_, entry)| entry.link.id() == link_id)
            .map(|(selector, _)| *selector);
        if let Some(selector) = pending_key {
            return self
                .pending
                .remove(&selector)
                .and_then(|entry| entry.timer)
                .map(|token| Effect::CancelTimer { token })
                .into_iter()
                .collect();
        }

        let active_key = self
            .active
            .iter()
            .find(|(_, conn)| conn.link.id() == link_id)
            .map(|(tab_id, _)| *tab_id);
        match active_key {
            Some(tab_id) => {
                self.active.remove(&tab_id);
                vec![Effect::SetBadge {
                    tab_id,
                    state: BadgeState::Disconnected,
                }]
            }
            None => Vec::new(),
        }
    }

    /// Close every link the broker holds.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        self.shutting_down = true;
        self.handshakes.clear();
        let mut effects = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        for entry in pending.into_values() {
            effects.extend(close_pending(entry, SHUTDOWN_REASON));
        }
        let tabs: Vec<TabId> = self.active.keys().copied().collect();
        for tab_id in tabs {
            effects.extend(self.close_active(tab_id, SHUTDOWN_REASON));
        }
        effects
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Most recently promoted tab that is still active.
    pub fn last_connected_tab_id(&self) -> Option<TabId> {
        self.active
            .values()
            .max_by_key(|conn| conn.seq)
            .map(|conn| conn.tab_id)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected_tab_id: self.last_connected_tab_id(),
            connected_tab_ids: self.active.keys().copied().collect(),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        self.active
            .values()
            .map(|conn| ConnectionSummary {
                tab_id: conn.tab_id,
                connected_at: Some(conn.connected_at),
            })
            .collect()
    }

    pub fn is_pending(&self, selector: TabId) -> bool {
        self.pending.contains_key(&selector)
    }

    pub fn is_active(&self, tab_id: TabId) -> bool {
        self.active.contains_key(&tab_id)
    }

    pub fn pending_selectors(&self) -> Vec<TabId> {
        self.pending.keys().copied().collect()
    }

    pub fn pending_link_id(&self, selector: TabId) -> Option<LinkId> {
        self.pending.get(&selector).map(|entry| entry.link.id())
    }

    pub fn active_link_id(&self, tab_id: TabId) -> Option<LinkId> {
        self.active.get(&tab_id).map(|conn| conn.link.id())
    }

    pub fn has_timer(&self, selector: TabId) -> bool {
        self.pending
            .get(&selector)
            .is_some_and(|entry| entry.timer.is_some())
    }

    /// Verify the map invariants. Meant for tests and debug assertions; a
    /// link closed remotely is only guaranteed gone once its close
    /// notification has been processed.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for (selector, entry) in &self.pending {
            let id = entry.link.id();
            if !seen.insert(id) {
                return Err(format!("{id} referenced twice"));
            }
            if entry.selector_tab_id != *selector {
                return Err(format!("pending[{selector}] keyed under wrong selector"));
            }
            if let Some(tab) = entry.link.tab_id() {
                return Err(format!("pending[{selector}] link already bound to {tab}"));
            }
            if entry.link.is_closed() {
                return Err(format!("pending[{selector}] holds closed {id}"));
            }
            if entry.timer.is_some() && self.focused_tab == Some(*selector) {
                return Err(format!("pending[{selector}] timed while focused"));
            }
        }
        for (tab_id, conn) in &self.active {
            let id = conn.link.id();
            if !seen.insert(id) {
                return Err(format!("{id} referenced twice"));
            }
            if conn.tab_id != *tab_id || conn.link.tab_id() != Some(*tab_id) {
                return Err(format!("active[{tab_id}] link bound to {:?}", conn.link.tab_id()));
            }
            if conn.link.is_closed() {
                return Err(format!("active[{tab_id}] holds closed {id}"));
            }
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn close_active(&mut self, tab_id: TabId, reason: &str) -> Option<Effect> {
        let mut conn = self.active.remove(&tab_id)?;
        conn.link.close(reason);
        Some(Effect::SetBadge {
            tab_id,
            state: BadgeState::Disconnected,
        })
    }
}

fn close_pending<L: RelayLink>(mut entry: PendingSelection<L>, reason: &str) -> Option<Effect> {
    entry.link.close(reason);
    entry
        .timer
        .take()
        .map(|token| Effect::CancelTimer { token })
}

// ─── Tests ───────────────────────────────────────────────────────────
