//! WebSocket relay link.
//!
//! Each link owns a spawned IO task that holds the socket. The
//! [`WsRelayLink`] handle talks to that task over a command channel, so
//! `close` never blocks and can be called from synchronous broker code.
//! When the task ends, for whatever reason, it resolves the link's
//! [`CloseSignal`] exactly once with the close reason.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tabrelay_core::broker::RelayLink;
use tabrelay_core::types::{LinkId, TabId};

use crate::error::LinkError;

/// Control frames may carry at most 125 bytes; two go to the close code.
const MAX_CLOSE_REASON_BYTES: usize = 123;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum LinkCommand {
    Bind(TabId),
    Close(String),
}

// ---------------------------------------------------------------------------
// CloseSignal
// ---------------------------------------------------------------------------

/// One-shot notification that a link has reached its terminal state.
#[derive(Debug)]
pub struct CloseSignal {
    link_id: LinkId,
    rx: oneshot::Receiver<String>,
}

impl CloseSignal {
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Wait for the link to close and return the close reason.
    pub async fn closed(self) -> String {
        self.rx
            .await
            .unwrap_or_else(|_| "relay link task ended".to_string())
    }
}

// ---------------------------------------------------------------------------
// WsRelayLink
// ---------------------------------------------------------------------------

/// Handle to an open WebSocket relay link.
///
/// Dropping the handle without closing it closes the socket.
#[derive(Debug)]
pub struct WsRelayLink {
    id: LinkId,
    tab_id: Option<TabId>,
    closed: bool,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl RelayLink for WsRelayLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn tab_id(&self) -> Option<TabId> {
        self.tab_id
    }

    fn bind_tab(&mut self, tab_id: TabId) {
        if let Some(bound) = self.tab_id {
            tracing::warn!(link = %self.id, %bound, requested = %tab_id, "relay link already bound");
            return;
        }
        self.tab_id = Some(tab_id);
        let _ = self.commands.send(LinkCommand::Bind(tab_id));
    }

    fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(link = %self.id, reason, "closing relay link");
        // The IO task may already be gone after a remote close.
        let _ = self.commands.send(LinkCommand::Close(reason.to_string()));
    }

    fn is_closed(&self) -> bool {
        self.closed || self.commands.is_closed()
    }
}

/// Open a relay link to `url`, failing if the handshake takes longer than
/// `timeout`.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsRelayLink, CloseSignal), LinkError> {
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(LinkError::InvalidUrl(url.to_string()));
    }

    let socket = match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(e)) => return Err(LinkError::Connect(e.to_string())),
        Err(_) => {
            return Err(LinkError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
    };

    let id = LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed));
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(drive(id, socket, command_rx, done_tx));
    tracing::info!(link = %id, url, "relay link open");

    Ok((
        WsRelayLink {
            id,
            tab_id: None,
            closed: false,
            commands,
        },
        CloseSignal { link_id: id, rx: done_rx },
    ))
}

async fn drive(
    id: LinkId,
    socket: RelaySocket,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    done: oneshot::Sender<String>,
) {
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Bind(tab_id)) => {
                    tracing::debug!(link = %id, tab = %tab_id, "relay link bound");
                }
                Some(LinkCommand::Close(reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Owned(truncate_reason(&reason).to_string()),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        tracing::debug!(link = %id, "close frame not sent: {e}");
                    }
                    break reason;
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break "relay link dropped".to_string();
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.into_owned())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by relay".to_string());
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(link = %id, len = text.len(), "relay message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("relay error: {e}"),
                None => break "relay stream ended".to_string(),
            },
        }
    };

    tracing::info!(link = %id, reason = %reason, "relay link closed");
    // Handles must observe `is_closed` by the time the signal resolves.
    drop(commands);
    let _ = done.send(reason);
}

/// Cut `reason` to fit in a close frame without splitting a character.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
