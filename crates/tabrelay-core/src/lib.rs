//! tabrelay-core: connection broker state machine, wire protocol and types.
//!
//! Pure crate: every broker transition mutates its maps synchronously and
//! hands back an ordered list of [`broker::Effect`]s for the runtime to carry
//! out. Nothing here awaits, so no other handler can ever observe a
//! half-applied transition.

pub mod broker;
pub mod error;
pub mod protocol;
pub mod types;

pub use broker::{ActiveConnection, Broker, Effect, HandshakeTicket, PendingSelection, RelayLink};
pub use error::BrokerError;
pub use types::{Badge, BadgeState, BrokerConfig, LinkId, TabId, TabSummary, TimerToken, WindowId};
