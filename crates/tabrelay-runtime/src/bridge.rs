//! Native-messaging bridge between the browser and the broker.
//!
//! Frames are a 4-byte native-endian length prefix followed by a UTF-8 JSON
//! object tagged by `kind`. The browser sends requests, tab events and
//! replies to host calls; the bridge sends responses and host calls. Both
//! directions are multiplexed on the same stdio pair, so every request and
//! every host call carries its own id.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use tabrelay_core::BrokerError;
use tabrelay_core::protocol::{Notification, Request, Response, Sender, TabEvent};
use tabrelay_core::types::{Badge, TabId, TabSummary, WindowId};

use crate::host::{Host, HostError};
use crate::relay::RelayConnector;
use crate::service::BrokerService;

/// Largest frame the browser accepts from a native host.
pub(crate) const MAX_OUTBOUND_FRAME: usize = 1024 * 1024;
/// Largest frame the browser sends to a native host.
pub(crate) const MAX_INBOUND_FRAME: usize = 64 * 1024 * 1024;

pub(crate) const DEFAULT_HOST_CALL_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge io: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostCallConfig {
    /// How long a host call may wait for the browser's reply.
    pub timeout: Duration,
}

impl Default for HostCallConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_HOST_CALL_TIMEOUT_MS),
        }
    }
}

// ─── Wire messages ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub(crate) enum Inbound {
    /// Kept as raw JSON so a malformed request still gets an answer.
    Request {
        id: u64,
        #[serde(default)]
        sender: Sender,
        request: serde_json::Value,
    },
    Event {
        event: TabEvent,
    },
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub(crate) enum Outbound {
    Response { id: u64, response: Response },
    Call { id: u64, call: HostCall },
}

/// Operation the broker asks the browser to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum HostCall {
    QueryTabs,
    #[serde(rename_all = "camelCase")]
    FocusTab { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    FocusWindow { window_id: WindowId },
    #[serde(rename_all = "camelCase")]
    SetBadge {
        tab_id: TabId,
        #[serde(flatten)]
        badge: Badge,
    },
    #[serde(rename_all = "camelCase")]
    SendToTab {
        tab_id: TabId,
        message: Notification,
    },
}

impl HostCall {
    fn name(&self) -> &'static str {
        match self {
            Self::QueryTabs => "queryTabs",
            Self::FocusTab { .. } => "focusTab",
            Self::FocusWindow { .. } => "focusWindow",
            Self::SetBadge { .. } => "setBadge",
            Self::SendToTab { .. } => "sendToTab",
        }
    }

    fn tab_id(&self) -> Option<TabId> {
        match self {
            Self::FocusTab { tab_id }
            | Self::SetBadge { tab_id, .. }
            | Self::SendToTab { tab_id, .. } => Some(*tab_id),
            Self::QueryTabs | Self::FocusWindow { .. } => None,
        }
    }
}

// ─── Framing ─────────────────────────────────────────────────────────

/// Read one frame. `Ok(None)` on a clean end of input.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = usize::try_from(u32::from_ne_bytes(prefix)).unwrap_or(usize::MAX);
    if len > MAX_INBOUND_FRAME {
        return Err(BridgeError::FrameTooLarge {
            len,
            limit: MAX_INBOUND_FRAME,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let too_large = BridgeError::FrameTooLarge {
        len: payload.len(),
        limit: MAX_OUTBOUND_FRAME,
    };
    if payload.len() > MAX_OUTBOUND_FRAME {
        return Err(too_large);
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large)?;
    writer.write_all(&len.to_ne_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn encode(message: &Outbound) -> Result<Vec<u8>, BridgeError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() <= MAX_OUTBOUND_FRAME {
        return Ok(payload);
    }
    match message {
        Outbound::Response { id, .. } => {
            tracing::warn!(id, len = payload.len(), "response exceeds frame limit");
            let fallback = Outbound::Response {
                id: *id,
                response: Response::ack(Err(BrokerError::Host(format!(
                    "response of {} bytes exceeds the {MAX_OUTBOUND_FRAME} byte frame limit",
                    payload.len()
                )))),
            };
            Ok(serde_json::to_vec(&fallback)?)
        }
        Outbound::Call { .. } => Err(BridgeError::FrameTooLarge {
            len: payload.len(),
            limit: MAX_OUTBOUND_FRAME,
        }),
    }
}

// ─── Host implementation ─────────────────────────────────────────────

type ReplySlot = oneshot::Sender<Result<serde_json::Value, HostError>>;

/// [`Host`] backed by calls to the browser over the bridge.
pub(crate) struct BridgeHost {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: RefCell<HashMap<u64, ReplySlot>>,
    next_id: Cell<u64>,
    disconnected: Cell<bool>,
    config: HostCallConfig,
}

impl BridgeHost {
    pub(crate) fn new(config: HostCallConfig) -> (Rc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let host = Rc::new(Self {
            outbound,
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            disconnected: Cell::new(false),
            config,
        });
        (host, rx)
    }

    fn respond(&self, id: u64, response: Response) {
        if self.outbound.send(Outbound::Response { id, response }).is_err() {
            tracing::debug!(id, "bridge writer gone; response dropped");
        }
    }

    async fn call(&self, call: HostCall) -> Result<serde_json::Value, HostError> {
        if self.disconnected.get() {
            return Err(HostError::Disconnected);
        }
        let name = call.name();
        let tab_id = call.tab_id();
        self.next_id.set(self.next_id.get() + 1);
        let id = self.next_id.get();

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(id, tx);
        if self.outbound.send(Outbound::Call { id, call }).is_err() {
            self.pending.borrow_mut().remove(&id);
            return Err(HostError::Disconnected);
        }
        tracing::trace!(id, call = name, "host call");

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(Err(HostError::Failed(msg)))) if is_missing_tab(&msg) => match tab_id {
                Some(tab_id) => Err(HostError::NoSuchTab(tab_id)),
                None => Err(HostError::Failed(msg)),
            },
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::Disconnected),
            Err(_) => {
                self.pending.borrow_mut().remove(&id);
                Err(HostError::Timeout { call: name })
            }
        }
    }

    /// Deliver the browser's reply to host call `id`.
    pub(crate) fn complete(&self, id: u64, ok: bool, result: serde_json::Value, error: Option<String>) {
        let Some(slot) = self.pending.borrow_mut().remove(&id) else {
            tracing::debug!(id, "reply for unknown or expired host call");
            return;
        };
        let outcome = if ok {
            Ok(result)
        } else {
            Err(HostError::Failed(
                error.unwrap_or_else(|| "unspecified host error".to_string()),
            ))
        };
        let _ = slot.send(outcome);
    }

    /// Fail every outstanding call and refuse new ones.
    pub(crate) fn fail_all(&self) {
        self.disconnected.set(true);
        self.pending.borrow_mut().clear();
    }
}

fn is_missing_tab(message: &str) -> bool {
    message.starts_with("No tab with id")
}

impl Host for BridgeHost {
    async fn query_tabs(&self) -> Result<Vec<TabSummary>, HostError> {
        let value = self.call(HostCall::QueryTabs).await?;
        serde_json::from_value(value).map_err(|e| HostError::Failed(format!("malformed tab list: {e}")))
    }

    async fn focus_tab(&self, tab_id: TabId) -> Result<(), HostError> {
        self.call(HostCall::FocusTab { tab_id }).await.map(drop)
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), HostError> {
        self.call(HostCall::FocusWindow { window_id }).await.map(drop)
    }

    async fn set_badge(&self, tab_id: TabId, badge: &Badge) -> Result<(), HostError> {
        self.call(HostCall::SetBadge {
            tab_id,
            badge: badge.clone(),
        })
        .await
        .map(drop)
    }

    async fn send_to_tab(&self, tab_id: TabId, notification: Notification) -> Result<(), HostError> {
        self.call(HostCall::SendToTab {
            tab_id,
            message: notification,
        })
        .await
        .map(drop)
    }
}

// ─── Serve loop ──────────────────────────────────────────────────────

/// Run the bridge until the browser closes its end or `stop` resolves, then
/// shut the broker down. Outstanding browser calls fail first so shutdown
/// never waits on a browser that is no longer reading.
pub(crate) async fn serve<R, W, C, S>(
    mut reader: R,
    writer: W,
    host: Rc<BridgeHost>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    service: Rc<BrokerService<BridgeHost, C>>,
    stop: S,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + 'static,
    C: RelayConnector + 'static,
    S: Future<Output = ()>,
{
    let writer_task = tokio::task::spawn_local(async move {
        if let Err(e) = write_loop(writer, outbound).await {
            tracing::warn!("bridge writer stopped: {e}");
        }
    });

    let result = tokio::select! {
        result = read_loop(&mut reader, &host, &service) => {
            match &result {
                Ok(()) => tracing::info!("browser closed the bridge"),
                Err(e) => tracing::error!("bridge input failed: {e}"),
            }
            result
        }
        () = stop => {
            tracing::info!("bridge stopped");
            Ok(())
        }
    };

    host.fail_all();
    service.shutdown().await;
    writer_task.abort();
    result
}

async fn read_loop<R, C>(
    reader: &mut R,
    host: &Rc<BridgeHost>,
    service: &Rc<BrokerService<BridgeHost, C>>,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    C: RelayConnector + 'static,
{
    while let Some(frame) = read_frame(reader).await? {
        let inbound: Inbound = match serde_json::from_slice(&frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(len = frame.len(), "dropping malformed frame: {e}");
                continue;
            }
        };
        match inbound {
            Inbound::Request {
                id,
                sender,
                request,
            } => {
                let host = Rc::clone(host);
                let service = Rc::clone(service);
                tokio::task::spawn_local(async move {
                    let response = match serde_json::from_value::<Request>(request) {
                        Ok(request) => service.dispatch(sender, request).await,
                        Err(e) => Response::ack(Err(BrokerError::InvalidRequest(e.to_string()))),
                    };
                    host.respond(id, response);
                });
            }
            Inbound::Event { event } => {
                let service = Rc::clone(service);
                tokio::task::spawn_local(async move { service.on_tab_event(event).await });
            }
            Inbound::Reply {
                id,
                ok,
                result,
                error,
            } => host.complete(id, ok, result, error),
        }
    }
    Ok(())
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let payload = encode(&message)?;
        write_frame(&mut writer, &payload).await?;
    }
    Ok(())
}
