//! Broker service: drives the core state machine against a host and a relay
//! connector.
//!
//! Everything here runs on one thread inside a `LocalSet`. Each request,
//! host event, timer and link watcher is its own local task; they share the
//! broker through a `RefCell` that is never held across an `.await`, so a
//! transition is always applied in full before any effect is awaited.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use tabrelay_core::broker::{BIND_FAILED_REASON, Effect, RelayLink};
use tabrelay_core::protocol::{
    ConnectionStatus, ConnectionSummary, ConnectionsResponse, Request, Response, Sender, TabEvent,
};
use tabrelay_core::types::{BadgeState, LinkId, TabSummary, TimerToken, WindowId, candidate_tabs};
use tabrelay_core::{Broker, BrokerConfig, BrokerError, TabId};

use crate::host::{Host, HostError};
use crate::relay::{LinkClosed, RelayConnector};

pub(crate) struct BrokerService<H, C: RelayConnector> {
    broker: RefCell<Broker<C::Link>>,
    host: Rc<H>,
    connector: C,
    timers: RefCell<HashMap<TimerToken, JoinHandle<()>>>,
}

impl<H, C> BrokerService<H, C>
where
    H: Host + 'static,
    C: RelayConnector + 'static,
{
    pub(crate) fn new(config: BrokerConfig, host: Rc<H>, connector: C) -> Rc<Self> {
        Rc::new(Self {
            broker: RefCell::new(Broker::new(config)),
            host,
            connector,
            timers: RefCell::new(HashMap::new()),
        })
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Open a relay link to `url` and park it as `selector`'s pending
    /// selection. If the selector tab closes before the link is open, the
    /// link is closed and the call fails.
    pub(crate) async fn initiate_relay(
        self: &Rc<Self>,
        selector: TabId,
        url: &str,
    ) -> Result<(), BrokerError> {
        let (ticket, timeout) = {
            let mut broker = self.broker.borrow_mut();
            (broker.begin_handshake(selector), broker.config().handshake_timeout)
        };
        tracing::info!(selector = %selector, url, "opening relay link");

        let opened = match tokio::time::timeout(timeout, self.connector.open(url)).await {
            Ok(opened) => opened,
            Err(_) => Err(BrokerError::ConnectTimeout {
                timeout_ms: millis(timeout),
            }),
        };
        let (link, closed) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.broker.borrow_mut().abandon_handshake(ticket);
                return Err(e);
            }
        };

        let link_id = link.id();
        let completed = self.broker.borrow_mut().complete_handshake(ticket, link);
        self.watch_link(link_id, closed);
        let effects = completed.inspect_err(|_| {
            tracing::info!(selector = %selector, link = %link_id, "selector closed during handshake");
        })?;
        self.apply(effects).await;
        tracing::info!(selector = %selector, link = %link_id, "relay link awaiting tab selection");
        Ok(())
    }

    /// Bind `selector`'s pending link to `target` and bring the tab to the
    /// foreground.
    pub(crate) async fn bind_tab(
        self: &Rc<Self>,
        selector: TabId,
        target: TabId,
        window_id: Option<WindowId>,
    ) -> Result<TabId, BrokerError> {
        let (effects, link_id) = {
            let mut broker = self.broker.borrow_mut();
            let effects = broker.promote(selector, target, Utc::now())?;
            let link_id = broker
                .active_link_id(target)
                .ok_or(BrokerError::LinkClosed { tab_id: target })?;
            (effects, link_id)
        };
        tracing::info!(selector = %selector, tab = %target, link = %link_id, "relay link bound");
        self.apply(effects).await;

        let outcome = match self.bring_to_front(target, window_id).await {
            Ok(()) if self.holds(target, link_id) => return Ok(target),
            Ok(()) => Err(BrokerError::LinkClosed { tab_id: target }),
            Err(e) => Err(BrokerError::TabVanished {
                tab_id: target,
                detail: e.to_string(),
            }),
        };

        tracing::warn!(tab = %target, link = %link_id, "bind failed: {outcome:?}");
        let abandoned = self
            .broker
            .borrow_mut()
            .abandon(target, link_id, BIND_FAILED_REASON);
        if abandoned || !self.broker.borrow().is_active(target) {
            self.set_badge(target, BadgeState::Disconnected).await;
        }
        outcome
    }

    /// Close the connection on `tab_id`, or every connection when `None`.
    pub(crate) async fn disconnect(self: &Rc<Self>, tab_id: Option<TabId>) {
        let effects = {
            let mut broker = self.broker.borrow_mut();
            match tab_id {
                Some(tab_id) => broker.disconnect(tab_id),
                None => broker.disconnect_all(),
            }
        };
        tracing::info!(tab = ?tab_id, closed = effects.len(), "disconnect");
        self.apply(effects).await;
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.broker.borrow().status()
    }

    pub(crate) fn connections(&self) -> Vec<ConnectionSummary> {
        self.broker.borrow().connections()
    }

    /// Tabs a user may bind to, internal browser pages excluded.
    pub(crate) async fn candidate_tabs(&self) -> Result<Vec<TabSummary>, BrokerError> {
        self.host
            .query_tabs()
            .await
            .map(candidate_tabs)
            .map_err(|e| BrokerError::Host(e.to_string()))
    }

    // ── Events ───────────────────────────────────────────────────────

    pub(crate) async fn on_tab_event(self: &Rc<Self>, event: TabEvent) {
        let effects = {
            let mut broker = self.broker.borrow_mut();
            match event {
                TabEvent::Closed { tab_id } => broker.tab_closed(tab_id),
                TabEvent::Updated { tab_id } => broker.tab_updated(tab_id),
                TabEvent::Activated { tab_id } => broker.tab_activated(tab_id),
            }
        };
        tracing::debug!(tab = %event.tab_id(), ?event, effects = effects.len(), "tab event");
        self.apply(effects).await;
    }

    async fn on_link_closed(self: &Rc<Self>, link_id: LinkId, reason: &str) {
        let effects = self.broker.borrow_mut().link_closed(link_id);
        tracing::debug!(link = %link_id, reason, effects = effects.len(), "relay link close observed");
        self.apply(effects).await;
    }

    async fn on_pending_expired(self: &Rc<Self>, selector: TabId, token: TimerToken) {
        self.timers.borrow_mut().remove(&token);
        let effects = self.broker.borrow_mut().pending_expired(selector, token);
        if !effects.is_empty() {
            tracing::info!(selector = %selector, "pending selection timed out");
        }
        self.apply(effects).await;
    }

    /// Close every link and stop all timers.
    pub(crate) async fn shutdown(self: &Rc<Self>) {
        let (effects, handshakes) = {
            let mut broker = self.broker.borrow_mut();
            let handshakes = broker.handshakes_in_flight();
            (broker.shutdown(), handshakes)
        };
        tracing::info!(handshakes, "broker shutting down");
        self.apply(effects).await;
        for (_, handle) in self.timers.borrow_mut().drain() {
            handle.abort();
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Answer one request. Failures are reported inside the response.
    pub(crate) async fn dispatch(self: &Rc<Self>, sender: Sender, request: Request) -> Response {
        let kind = request.kind();
        let response = match request {
            Request::ConnectToRelay { mcp_relay_url } => Response::ack(match sender.tab_id {
                Some(selector) => self.initiate_relay(selector, &mcp_relay_url).await,
                None => Err(missing_sender(kind)),
            }),
            Request::GetTabs => Response::tabs(self.candidate_tabs().await, sender.tab_id),
            Request::ConnectToTab {
                tab_id,
                window_id,
                mcp_relay_url,
            } => {
                if let Some(url) = mcp_relay_url {
                    tracing::debug!(url = %url, "connectToTab relay url ignored; binding pending link");
                }
                let result = match sender.tab_id {
                    Some(selector) => {
                        // With no explicit target the selector binds itself.
                        let (target, window) = match tab_id {
                            Some(target) => (target, window_id),
                            None => (selector, window_id.or(sender.window_id)),
                        };
                        self.bind_tab(selector, target, window).await
                    }
                    None => Err(missing_sender(kind)),
                };
                Response::connect_tab(result)
            }
            Request::GetConnectionStatus => Response::Status(self.status()),
            Request::GetAllConnections => Response::Connections(ConnectionsResponse {
                connections: self.connections(),
            }),
            Request::Disconnect { tab_id } => {
                self.disconnect(tab_id).await;
                Response::ack(Ok(()))
            }
        };
        if !response.is_success() {
            tracing::warn!(kind, ?response, "request failed");
        }
        response
    }

    // ── Effects ──────────────────────────────────────────────────────

    /// Carry out effects returned by a transition. Timers are handled first
    /// and synchronously; host calls are best-effort.
    async fn apply(self: &Rc<Self>, effects: Vec<Effect>) {
        let mut host_calls = Vec::new();
        for effect in effects {
            match effect {
                Effect::ArmTimer {
                    selector,
                    token,
                    after,
                } => self.arm_timer(selector, token, after),
                Effect::CancelTimer { token } => self.cancel_timer(token),
                other => host_calls.push(other),
            }
        }
        for effect in host_calls {
            match effect {
                Effect::SetBadge { tab_id, state } => self.set_badge(tab_id, state).await,
                Effect::Notify {
                    tab_id,
                    notification,
                } => {
                    if let Err(e) = self.host.send_to_tab(tab_id, notification).await {
                        tracing::debug!(tab = %tab_id, "notification not delivered: {e}");
                    }
                }
                Effect::ArmTimer { .. } | Effect::CancelTimer { .. } => {}
            }
        }
    }

    async fn set_badge(&self, tab_id: TabId, state: BadgeState) {
        if let Err(e) = self.host.set_badge(tab_id, &state.badge()).await {
            tracing::debug!(tab = %tab_id, ?state, "badge not updated: {e}");
        }
    }

    async fn bring_to_front(&self, tab_id: TabId, window_id: Option<WindowId>) -> Result<(), HostError> {
        self.host.focus_tab(tab_id).await?;
        if let Some(window_id) = window_id {
            self.host.focus_window(window_id).await?;
        }
        Ok(())
    }

    fn holds(&self, tab_id: TabId, link_id: LinkId) -> bool {
        self.broker.borrow().active_link_id(tab_id) == Some(link_id)
    }

    fn arm_timer(self: &Rc<Self>, selector: TabId, token: TimerToken, after: Duration) {
        let this = Rc::clone(self);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(after).await;
            this.on_pending_expired(selector, token).await;
        });
        if let Some(previous) = self.timers.borrow_mut().insert(token, handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, token: TimerToken) {
        if let Some(handle) = self.timers.borrow_mut().remove(&token) {
            handle.abort();
        }
    }

    fn watch_link(self: &Rc<Self>, link_id: LinkId, closed: LinkClosed) {
        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let reason = closed.await;
            this.on_link_closed(link_id, &reason).await;
        });
    }

    #[cfg(test)]
    pub(crate) fn with_broker<R>(&self, f: impl FnOnce(&Broker<C::Link>) -> R) -> R {
        f(&self.broker.borrow())
    }

    #[cfg(test)]
    pub(crate) fn live_timers(&self) -> usize {
        self.timers.borrow().len()
    }
}

fn missing_sender(kind: &str) -> BrokerError {
    BrokerError::InvalidRequest(format!("{kind} needs a sender tab"))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeHost, tab};
    use tabrelay_core::protocol::Notification;
    use tokio::task::LocalSet;

    const URL: &str = "ws://127.0.0.1:9000/relay";

    type Service = Rc<BrokerService<FakeHost, Rc<FakeConnector>>>;

    fn service() -> (Service, Rc<FakeHost>, Rc<FakeConnector>) {
        let host = Rc::new(FakeHost::with_tabs(vec![
            tab(1, 10, "https://app.example/select"),
            tab(2, 10, "https://docs.example/"),
            tab(3, 11, "https://mail.example/"),
            tab(4, 11, "chrome://settings"),
        ]));
        let connector = Rc::new(FakeConnector::default());
        let svc = BrokerService::new(BrokerConfig::default(), Rc::clone(&host), Rc::clone(&connector));
        (svc, host, connector)
    }

    /// Let spawned local tasks run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn from(tab_id: i64) -> Sender {
        Sender::tab(TabId(tab_id), WindowId(10))
    }

    fn connect_to(tab_id: i64, window_id: i64) -> Request {
        Request::ConnectToTab {
            tab_id: Some(TabId(tab_id)),
            window_id: Some(WindowId(window_id)),
            mcp_relay_url: None,
        }
    }

    // =================================================================
    // 1. Handshake and bind
    // =================================================================

    #[tokio::test(start_paused = true)]
    async fn connect_then_bind_end_to_end() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                let resp = svc
                    .dispatch(
                        from(1),
                        Request::ConnectToRelay {
                            mcp_relay_url: URL.into(),
                        },
                    )
                    .await;
                assert!(resp.is_success(), "{resp:?}");
                assert_eq!(connector.link(0).url, URL);
                assert!(svc.with_broker(|b| b.is_pending(TabId(1))));

                let resp = svc.dispatch(from(1), connect_to(2, 10)).await;
                assert_eq!(resp, Response::connect_tab(Ok(TabId(2))));

                let Response::Connections(all) = svc.dispatch(from(1), Request::GetAllConnections).await
                else {
                    panic!("expected connections response");
                };
                assert_eq!(all.connections.len(), 1);
                assert_eq!(all.connections[0].tab_id, TabId(2));
                assert!(all.connections[0].connected_at.is_some());

                assert!(host.shows_connected(TabId(2)));
                assert_eq!(*host.focused_tabs.borrow(), vec![TabId(2)]);
                assert_eq!(*host.focused_windows.borrow(), vec![WindowId(10)]);
                assert!(!svc.with_broker(|b| b.is_pending(TabId(1))));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handshake_times_out() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                connector.hang.set(true);
                let err = svc.initiate_relay(TabId(1), URL).await.expect_err("timeout");
                assert_eq!(err, BrokerError::ConnectTimeout { timeout_ms: 5_000 });
                assert!(!svc.with_broker(|b| b.is_pending(TabId(1))));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn selector_closing_mid_handshake_discards_link() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                connector.gated.set(true);
                let handshake = {
                    let svc = Rc::clone(&svc);
                    tokio::task::spawn_local(async move { svc.initiate_relay(TabId(1), URL).await })
                };
                settle().await;
                assert_eq!(svc.with_broker(|b| b.handshakes_in_flight()), 1);

                svc.on_tab_event(TabEvent::Closed { tab_id: TabId(1) }).await;
                connector.finish_handshake();
                let err = handshake.await.expect("join").expect_err("selector closed");
                settle().await;

                assert!(matches!(err, BrokerError::TabVanished { tab_id: TabId(1), .. }));
                assert_eq!(connector.link(0).reason().as_deref(), Some("tab closed"));
                assert!(svc.with_broker(|b| b.pending_selectors().is_empty()));
                assert_eq!(svc.with_broker(|b| b.handshakes_in_flight()), 0);
                assert_eq!(svc.live_timers(), 0);
                svc.with_broker(|b| b.check_invariants()).expect("invariants");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshake_is_not_left_in_flight() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                connector.hang.set(true);
                svc.initiate_relay(TabId(1), URL).await.expect_err("timeout");
                connector.hang.set(false);
                connector.refuse.set(true);
                svc.initiate_relay(TabId(1), URL).await.expect_err("refused");
                assert_eq!(svc.with_broker(|b| b.handshakes_in_flight()), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_handshake_reports_failure() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                connector.refuse.set(true);
                let resp = svc
                    .dispatch(
                        from(1),
                        Request::ConnectToRelay {
                            mcp_relay_url: URL.into(),
                        },
                    )
                    .await;
                assert!(!resp.is_success());
                assert!(svc.with_broker(|b| b.pending_selectors().is_empty()));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bind_without_pending_fails() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, _connector) = service();
                let resp = svc.dispatch(from(1), connect_to(2, 10)).await;
                assert_eq!(
                    resp,
                    Response::connect_tab(Err(BrokerError::NoPendingConnection {
                        selector: TabId(1)
                    }))
                );
                assert!(host.badges.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn requests_without_sender_are_invalid() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                let resp = svc
                    .dispatch(
                        Sender::default(),
                        Request::ConnectToRelay {
                            mcp_relay_url: URL.into(),
                        },
                    )
                    .await;
                assert!(!resp.is_success());
                assert!(connector.links.borrow().is_empty());

                let resp = svc.dispatch(Sender::default(), connect_to(2, 10)).await;
                assert!(matches!(
                    resp,
                    Response::ConnectTab(ref r) if r.error.as_deref().is_some_and(|e| e.contains("sender"))
                ));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_to_tab_defaults_to_sender() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, _connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                let resp = svc
                    .dispatch(
                        from(1),
                        Request::ConnectToTab {
                            tab_id: None,
                            window_id: None,
                            mcp_relay_url: Some(URL.into()),
                        },
                    )
                    .await;
                assert_eq!(resp, Response::connect_tab(Ok(TabId(1))));
                assert_eq!(*host.focused_windows.borrow(), vec![WindowId(10)]);
            })
            .await;
    }

    // =================================================================
    // 2. Rebinding and eviction
    // =================================================================

    #[tokio::test(start_paused = true)]
    async fn rebinding_evicts_previous_link() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("first");
                svc.bind_tab(TabId(1), TabId(3), None).await.expect("bind first");
                svc.initiate_relay(TabId(1), URL).await.expect("second");
                svc.bind_tab(TabId(1), TabId(3), None).await.expect("bind second");

                assert_eq!(connector.link(0).reason().as_deref(), Some("superseded"));
                assert_eq!(connector.link(1).reason(), None);

                // The evicted link's close notification must not touch the
                // new connection.
                settle().await;
                assert_eq!(
                    svc.with_broker(|b| b.active_link_id(TabId(3))),
                    Some(connector.link(1).id)
                );
                assert!(host.shows_connected(TabId(3)));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_selector_supersedes_pending_link() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("first");
                svc.initiate_relay(TabId(1), URL).await.expect("second");
                settle().await;
                assert_eq!(connector.link(0).reason().as_deref(), Some("superseded"));
                assert_eq!(
                    svc.with_broker(|b| b.pending_link_id(TabId(1))),
                    Some(connector.link(1).id)
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn focus_failure_abandons_binding() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                host.gone.borrow_mut().insert(TabId(2));

                let err = svc
                    .bind_tab(TabId(1), TabId(2), Some(WindowId(10)))
                    .await
                    .expect_err("tab vanished");
                assert!(matches!(err, BrokerError::TabVanished { tab_id: TabId(2), .. }));
                assert!(svc.with_broker(|b| !b.is_active(TabId(2)) && !b.is_pending(TabId(1))));
                assert_eq!(connector.link(0).reason().as_deref(), Some(BIND_FAILED_REASON));
                svc.with_broker(|b| b.check_invariants()).expect("invariants");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn target_closing_during_focus_fails_bind() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                host.focus_gated.set(true);
                let bind = {
                    let svc = Rc::clone(&svc);
                    tokio::task::spawn_local(async move {
                        svc.bind_tab(TabId(1), TabId(2), Some(WindowId(10))).await
                    })
                };
                settle().await;
                assert!(svc.with_broker(|b| b.is_active(TabId(2))));

                svc.on_tab_event(TabEvent::Closed { tab_id: TabId(2) }).await;
                host.release_focus();
                let err = bind.await.expect("join").expect_err("target closed");

                assert_eq!(err, BrokerError::LinkClosed { tab_id: TabId(2) });
                assert!(svc.connections().is_empty());
                assert!(svc.with_broker(|b| b.pending_selectors().is_empty()));
                assert_eq!(connector.link(0).reason().as_deref(), Some("tab closed"));
                assert_eq!(host.last_badge(TabId(2)), Some(BadgeState::Disconnected.badge()));
                svc.with_broker(|b| b.check_invariants()).expect("invariants");
            })
            .await;
    }

    // =================================================================
    // 3. Disconnect and status
    // =================================================================

    #[tokio::test(start_paused = true)]
    async fn legacy_pointer_follows_latest_bind() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, _connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("a");
                svc.bind_tab(TabId(1), TabId(3), None).await.expect("bind 3");
                svc.initiate_relay(TabId(1), URL).await.expect("b");
                svc.bind_tab(TabId(1), TabId(7), None).await.expect("bind 7");

                let status = svc.status();
                assert_eq!(status.connected_tab_id, Some(TabId(7)));
                assert_eq!(status.connected_tab_ids, vec![TabId(3), TabId(7)]);

                svc.disconnect(Some(TabId(7))).await;
                assert_eq!(svc.status().connected_tab_id, Some(TabId(3)));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_of_unknown_tab_is_silent() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, _connector) = service();
                let resp = svc
                    .dispatch(
                        from(1),
                        Request::Disconnect {
                            tab_id: Some(TabId(42)),
                        },
                    )
                    .await;
                assert!(resp.is_success());
                assert!(host.badges.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_clears_badges() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                for target in [2, 3] {
                    svc.initiate_relay(TabId(1), URL).await.expect("connect");
                    svc.bind_tab(TabId(1), TabId(target), None).await.expect("bind");
                }
                svc.dispatch(from(1), Request::Disconnect { tab_id: None }).await;

                assert!(svc.connections().is_empty());
                assert_eq!(svc.status().connected_tab_id, None);
                for (n, target) in [(0, 2), (1, 3)] {
                    assert_eq!(connector.link(n).reason().as_deref(), Some("disconnected"));
                    assert_eq!(host.last_badge(TabId(target)), Some(BadgeState::Disconnected.badge()));
                }
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_clears_active_connection() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                svc.bind_tab(TabId(1), TabId(2), None).await.expect("bind");

                connector.remote_close(0, "relay shutting down");
                settle().await;

                assert!(svc.connections().is_empty());
                assert_eq!(host.last_badge(TabId(2)), Some(BadgeState::Disconnected.badge()));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn get_tabs_filters_internal_pages() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, _connector) = service();
                let Response::Tabs(resp) = svc.dispatch(from(1), Request::GetTabs).await else {
                    panic!("expected tabs response");
                };
                assert!(resp.success);
                assert_eq!(resp.current_tab_id, Some(TabId(1)));
                let ids: Vec<TabId> = resp.tabs.iter().map(|t| t.id).collect();
                assert_eq!(ids, vec![TabId(1), TabId(2), TabId(3)]);
            })
            .await;
    }

    // =================================================================
    // 4. Tab lifecycle and inactivity timers
    // =================================================================

    #[tokio::test(start_paused = true)]
    async fn unfocused_selection_times_out() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                svc.on_tab_event(TabEvent::Activated { tab_id: TabId(2) }).await;
                assert_eq!(svc.live_timers(), 1);

                tokio::time::sleep(Duration::from_secs(6)).await;

                assert!(!svc.with_broker(|b| b.is_pending(TabId(1))));
                assert_eq!(
                    connector.link(0).reason().as_deref(),
                    Some("inactive for 5 seconds")
                );
                assert_eq!(
                    *host.notified.borrow(),
                    vec![(TabId(1), Notification::ConnectionTimeout)]
                );
                assert_eq!(svc.live_timers(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn refocusing_selector_cancels_timer() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, _connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                svc.on_tab_event(TabEvent::Activated { tab_id: TabId(2) }).await;
                tokio::time::sleep(Duration::from_secs(3)).await;
                svc.on_tab_event(TabEvent::Activated { tab_id: TabId(1) }).await;
                assert_eq!(svc.live_timers(), 0);

                tokio::time::sleep(Duration::from_secs(10)).await;
                assert!(svc.with_broker(|b| b.is_pending(TabId(1))));
                assert!(host.notified.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn binding_cancels_pending_timer() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, _connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                svc.on_tab_event(TabEvent::Activated { tab_id: TabId(2) }).await;
                svc.bind_tab(TabId(1), TabId(2), None).await.expect("bind");
                assert_eq!(svc.live_timers(), 0);

                tokio::time::sleep(Duration::from_secs(10)).await;
                assert!(svc.with_broker(|b| b.is_active(TabId(2))));
                assert!(host.notified.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn closing_tab_tears_down_both_roles() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                svc.initiate_relay(TabId(2), URL).await.expect("a");
                svc.bind_tab(TabId(2), TabId(2), None).await.expect("bind self");
                svc.initiate_relay(TabId(2), URL).await.expect("b");

                svc.on_tab_event(TabEvent::Closed { tab_id: TabId(2) }).await;
                settle().await;

                assert!(svc.with_broker(|b| !b.is_active(TabId(2)) && !b.is_pending(TabId(2))));
                assert_eq!(connector.link(0).reason().as_deref(), Some("tab closed"));
                assert_eq!(connector.link(1).reason().as_deref(), Some("tab closed"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_reasserts_badge() {
        LocalSet::new()
            .run_until(async {
                let (svc, host, _connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("connect");
                svc.bind_tab(TabId(1), TabId(3), None).await.expect("bind");
                let before = host.badges.borrow().len();

                svc.on_tab_event(TabEvent::Updated { tab_id: TabId(3) }).await;
                svc.on_tab_event(TabEvent::Updated { tab_id: TabId(2) }).await;

                assert_eq!(host.badges.borrow().len(), before + 1);
                assert!(host.shows_connected(TabId(3)));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything() {
        LocalSet::new()
            .run_until(async {
                let (svc, _host, connector) = service();
                svc.initiate_relay(TabId(1), URL).await.expect("a");
                svc.bind_tab(TabId(1), TabId(2), None).await.expect("bind");
                svc.initiate_relay(TabId(3), URL).await.expect("b");
                svc.on_tab_event(TabEvent::Activated { tab_id: TabId(2) }).await;

                svc.shutdown().await;
                settle().await;

                assert_eq!(svc.live_timers(), 0);
                assert!(svc.connections().is_empty());
                assert!(svc.with_broker(|b| b.pending_selectors().is_empty()));
                for n in 0..2 {
                    assert_eq!(
                        connector.link(n).reason().as_deref(),
                        Some("broker shutting down")
                    );
                }
            })
            .await;
    }
}
