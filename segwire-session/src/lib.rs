//! # segwire-session
//!
//! Session engine for segwire.
//!
//! This crate provides:
//! - Per-connection sessions over any async byte stream
//! - Transaction id allocation and lifecycle tracking
//! - Server-side dispatch with state gating, validation and rate limits
//! - Confirmation round trips that suspend only their own transaction
//! - Client-side invocation with request timeouts
//! - A TCP server running one session per connection

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod server;
pub mod session;
pub mod transaction;

pub use config::{Config, ConfigError, NetworkConfig, SessionConfig};
pub use error::SessionError;
pub use events::SessionEvent;
pub use handler::{
    BoxFuture, CallContext, ConfirmationHandler, ConfirmationRequest, HandlerRegistry,
    HandlerResult, MethodHandler, Reply,
};
pub use server::{Server, ServerStats};
pub use session::{MethodCall, Role, Session};
pub use transaction::{Origin, Phase, Transaction, TransactionManager};
