//! In-memory host and relay fakes shared by the runtime tests.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use futures_util::FutureExt;
use tokio::sync::{Notify, oneshot};

use tabrelay_core::BrokerError;
use tabrelay_core::broker::RelayLink;
use tabrelay_core::protocol::Notification;
use tabrelay_core::types::{Badge, BadgeState, LinkId, TabId, TabSummary, WindowId};

use crate::host::{Host, HostError};
use crate::relay::{LinkClosed, RelayConnector};

// ─── Host ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    pub tabs: RefCell<Vec<TabSummary>>,
    /// Tabs the host no longer knows; every call naming them fails.
    pub gone: RefCell<HashSet<TabId>>,
    pub badges: RefCell<Vec<(TabId, Badge)>>,
    pub focused_tabs: RefCell<Vec<TabId>>,
    pub focused_windows: RefCell<Vec<WindowId>>,
    pub notified: RefCell<Vec<(TabId, Notification)>>,
    /// Hold `focus_tab` until [`FakeHost::release_focus`].
    pub focus_gated: Cell<bool>,
    focus_release: Notify,
}

impl FakeHost {
    pub fn with_tabs(tabs: Vec<TabSummary>) -> Self {
        Self {
            tabs: RefCell::new(tabs),
            ..Self::default()
        }
    }

    pub fn last_badge(&self, tab_id: TabId) -> Option<Badge> {
        self.badges
            .borrow()
            .iter()
            .rev()
            .find(|(t, _)| *t == tab_id)
            .map(|(_, b)| b.clone())
    }

    pub fn shows_connected(&self, tab_id: TabId) -> bool {
        self.last_badge(tab_id) == Some(BadgeState::Connected.badge())
    }

    pub fn release_focus(&self) {
        self.focus_release.notify_one();
    }

    fn check(&self, tab_id: TabId) -> Result<(), HostError> {
        if self.gone.borrow().contains(&tab_id) {
            Err(HostError::NoSuchTab(tab_id))
        } else {
            Ok(())
        }
    }
}

impl Host for FakeHost {
    async fn query_tabs(&self) -> Result<Vec<TabSummary>, HostError> {
        Ok(self.tabs.borrow().clone())
    }

    async fn focus_tab(&self, tab_id: TabId) -> Result<(), HostError> {
        if self.focus_gated.get() {
            self.focus_release.notified().await;
        }
        self.check(tab_id)?;
        self.focused_tabs.borrow_mut().push(tab_id);
        Ok(())
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), HostError> {
        self.focused_windows.borrow_mut().push(window_id);
        Ok(())
    }

    async fn set_badge(&self, tab_id: TabId, badge: &Badge) -> Result<(), HostError> {
        self.check(tab_id)?;
        self.badges.borrow_mut().push((tab_id, badge.clone()));
        Ok(())
    }

    async fn send_to_tab(&self, tab_id: TabId, notification: Notification) -> Result<(), HostError> {
        self.check(tab_id)?;
        self.notified.borrow_mut().push((tab_id, notification));
        Ok(())
    }
}

pub(crate) fn tab(id: i64, window: i64, url: &str) -> TabSummary {
    TabSummary {
        id: TabId(id),
        window_id: WindowId(window),
        title: format!("Tab {id}"),
        url: url.to_string(),
        fav_icon_url: None,
    }
}

// ─── Relay ───────────────────────────────────────────────────────────

/// Shared view of one fake link, kept by the connector after the broker
/// takes ownership of the link itself.
#[derive(Debug, Clone)]
pub(crate) struct LinkRecord {
    pub id: LinkId,
    pub url: String,
    pub close_reason: Rc<RefCell<Option<String>>>,
    notifier: Rc<RefCell<Option<oneshot::Sender<String>>>>,
}

impl LinkRecord {
    fn fire(&self, reason: &str) {
        if let Some(tx) = self.notifier.borrow_mut().take() {
            let _ = tx.send(reason.to_string());
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.close_reason.borrow().clone()
    }
}

#[derive(Debug)]
pub(crate) struct FakeLink {
    record: LinkRecord,
    tab_id: Option<TabId>,
}

impl RelayLink for FakeLink {
    fn id(&self) -> LinkId {
        self.record.id
    }

    fn tab_id(&self) -> Option<TabId> {
        self.tab_id
    }

    fn bind_tab(&mut self, tab_id: TabId) {
        self.tab_id = Some(tab_id);
    }

    fn close(&mut self, reason: &str) {
        let mut slot = self.record.close_reason.borrow_mut();
        if slot.is_none() {
            *slot = Some(reason.to_string());
            drop(slot);
            self.record.fire(reason);
        }
    }

    fn is_closed(&self) -> bool {
        self.record.close_reason.borrow().is_some() || self.record.notifier.borrow().is_none()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    pub links: RefCell<Vec<LinkRecord>>,
    next_id: Cell<u64>,
    /// Fail every open with a connect error.
    pub refuse: Cell<bool>,
    /// Never complete the handshake.
    pub hang: Cell<bool>,
    /// Hold the handshake until [`FakeConnector::finish_handshake`].
    pub gated: Cell<bool>,
    handshake_release: Notify,
}

impl FakeConnector {
    pub fn link(&self, n: usize) -> LinkRecord {
        self.links.borrow()[n].clone()
    }

    pub fn finish_handshake(&self) {
        self.handshake_release.notify_one();
    }

    /// Simulate the relay closing link `n` from its side.
    pub fn remote_close(&self, n: usize, reason: &str) {
        self.link(n).fire(reason);
    }
}

impl RelayConnector for Rc<FakeConnector> {
    type Link = FakeLink;

    async fn open(&self, url: &str) -> Result<(FakeLink, LinkClosed), BrokerError> {
        if self.hang.get() {
            std::future::pending::<()>().await;
        }
        if self.gated.get() {
            self.handshake_release.notified().await;
        }
        if self.refuse.get() {
            return Err(BrokerError::ConnectError(format!("connection refused: {url}")));
        }
        self.next_id.set(self.next_id.get() + 1);
        let (tx, rx) = oneshot::channel();
        let record = LinkRecord {
            id: LinkId(self.next_id.get()),
            url: url.to_string(),
            close_reason: Rc::default(),
            notifier: Rc::new(RefCell::new(Some(tx))),
        };
        self.links.borrow_mut().push(record.clone());
        let closed = async move { rx.await.unwrap_or_else(|_| "dropped".to_string()) };
        Ok((
            FakeLink {
                record,
                tab_id: None,
            },
            closed.boxed_local(),
        ))
    }
}
