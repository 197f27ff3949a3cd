//! tabrelay-link: relay link IO boundary.
//! Opens WebSocket links to the relay endpoint and owns their sockets.
//! No broker logic — the broker only sees [`tabrelay_core::RelayLink`].

pub mod error;
pub mod ws;

pub use error::LinkError;
pub use ws::{CloseSignal, WsRelayLink, connect};
