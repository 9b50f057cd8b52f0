//! # segwire-protocol
//!
//! Wire format for segwire, a schema-driven binary RPC protocol.
//!
//! This crate provides:
//! - Primitive field types and values
//! - Field arrays with normal and high-packing optional encodings
//! - Segment types for both directions, with an incremental decoder
//! - Error codes and protocol constants

pub mod codec;
pub mod error;
pub mod field_array;
pub mod segment;
pub mod value;

pub use codec::{decode, Segment, SegmentDecoder, SegmentEncoder};
pub use error::{ErrorCode, ProtocolError};
pub use field_array::{ArrayBits, FieldArray, FieldArraySchema, FieldSpec, MAX_OPTIONAL_ID};
pub use segment::{
    ClientboundSegment, Direction, Entity, EntityLayout, Inbound, InvokeMethod, MethodError,
    MethodKind, MethodRef, Prefix, Rejection, SchemaResolver, SegmentKind, ServerboundSegment,
    MAX_CONFIRMATION_ID, MAX_ENTITY_TYPE, MAX_METHOD_ID, SEGMENT_HEADER_SIZE,
};
pub use value::{FieldType, Value, MAX_BLOB_LEN};

/// Number of transaction ids per connection.
pub const TRANSACTION_ID_SPACE: usize = 256;

/// Default port for segwire servers.
pub const DEFAULT_PORT: u16 = 7411;

/// Largest segment the decoder will buffer (16 MiB).
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
