//! Session events delivered to subscribers.

use segwire_protocol::Entity;
use segwire_schema::State;

/// Something that happened on a session outside of a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer pushed an entity; it is now in the local cache.
    EntityUpdated(Entity),
    /// A completed call moved the session to a new state.
    StateChanged { from: State, to: State },
    /// A non-fatal problem no caller is waiting on, or the reason the
    /// session is about to terminate.
    Error(String),
    Closed,
}
