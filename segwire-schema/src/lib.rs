//! # segwire-schema
//!
//! Compiled schema model for segwire.
//!
//! This crate provides:
//! - Schema parsing (YAML/JSON) and validation
//! - Field validators (range, length, pattern, list elements)
//! - The method dispatch table, including get-by-id pseudo-methods
//! - Sliding-window rate limiters
//! - Session-level state gating

pub mod definition;
pub mod dispatch;
pub mod error;
pub mod rate_limit;
pub mod state;
pub mod validator;

pub use definition::{
    ConfirmationDescriptor, EntityDescriptor, FieldArrayDescriptor, GetById, MethodDescriptor,
    Schema, SchemaRaw, GET_BY_ID_METHOD,
};
pub use dispatch::DispatchTable;
pub use error::{SchemaError, ValidationError};
pub use rate_limit::{RateLimit, RateLimiters, RateScope, SlidingWindow};
pub use state::{is_permitted, State, StateMachine};
pub use validator::{ArrayValidator, LengthBound, Validator};
