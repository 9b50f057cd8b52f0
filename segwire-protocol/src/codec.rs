//! Encoder and incremental decoder for segment streams.

use crate::error::ProtocolError;
use crate::field_array::{FieldArray, FieldArraySchema};
use crate::segment::{
    encode_conf_req, encode_conf_resp, encode_method_ret, ClientboundSegment, Direction, Entity,
    EntityLayout, Inbound, InvokeMethod, MethodError, SchemaResolver, ServerboundSegment,
};
use crate::value::{FieldType, Reader};
use crate::MAX_SEGMENT_SIZE;
use bytes::{Buf, Bytes, BytesMut};

/// Encodes segments into wire bytes.
pub struct SegmentEncoder;

impl SegmentEncoder {
    pub fn invoke_method(
        transaction_id: u8,
        invoke: &InvokeMethod,
        params: &FieldArraySchema,
        entity_id_type: Option<&FieldType>,
    ) -> Result<BytesMut, ProtocolError> {
        invoke.encode(transaction_id, params, entity_id_type)
    }

    pub fn entity_update(
        direction: Direction,
        transaction_id: u8,
        entity: &Entity,
        layout: &EntityLayout,
    ) -> Result<BytesMut, ProtocolError> {
        entity.encode(direction, transaction_id, layout)
    }

    pub fn conf_resp(
        transaction_id: u8,
        fields: &FieldArray,
        schema: &FieldArraySchema,
    ) -> Result<BytesMut, ProtocolError> {
        encode_conf_resp(transaction_id, fields, schema)
    }

    pub fn method_ret(
        transaction_id: u8,
        fields: &FieldArray,
        schema: &FieldArraySchema,
    ) -> Result<BytesMut, ProtocolError> {
        encode_method_ret(transaction_id, fields, schema)
    }

    pub fn conf_req(
        transaction_id: u8,
        confirmation: u8,
        fields: &FieldArray,
        schema: &FieldArraySchema,
    ) -> Result<BytesMut, ProtocolError> {
        encode_conf_req(transaction_id, confirmation, fields, schema)
    }

    pub fn method_err(transaction_id: u8, err: &MethodError) -> Result<BytesMut, ProtocolError> {
        err.encode(transaction_id)
    }

    /// Encodes any serverbound segment, resolving schemas through `resolver`.
    pub fn encode_serverbound(
        transaction_id: u8,
        segment: &ServerboundSegment,
        resolver: &dyn SchemaResolver,
    ) -> Result<BytesMut, ProtocolError> {
        segment.encode(transaction_id, resolver)
    }

    /// Encodes any clientbound segment, resolving schemas through `resolver`.
    pub fn encode_clientbound(
        transaction_id: u8,
        segment: &ClientboundSegment,
        resolver: &dyn SchemaResolver,
    ) -> Result<BytesMut, ProtocolError> {
        segment.encode(transaction_id, resolver)
    }
}

/// Decodes segments from a byte stream.
///
/// Segments carry no length prefix, so the decoder re-parses from the start
/// of the buffer until a whole segment is available. Bytes are consumed only
/// once a segment decodes completely. A truncated parse records how many
/// bytes the segment needs at least, and the next parse waits for them.
pub struct SegmentDecoder {
    buffer: BytesMut,
    max_segment_size: usize,
    /// Lower bound on the length of the segment at the front of the buffer.
    awaiting: usize,
}

impl SegmentDecoder {
    pub fn new() -> Self {
        Self::with_max_segment_size(MAX_SEGMENT_SIZE)
    }

    pub fn with_max_segment_size(max_segment_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_segment_size,
            awaiting: 0,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next segment sent by a client.
    pub fn decode_serverbound(
        &mut self,
        resolver: &dyn SchemaResolver,
    ) -> Result<Option<Inbound<ServerboundSegment>>, ProtocolError> {
        self.decode_with(|reader| ServerboundSegment::read(reader, resolver))
    }

    /// Attempts to decode the next segment sent by a server.
    pub fn decode_clientbound(
        &mut self,
        resolver: &dyn SchemaResolver,
    ) -> Result<Option<Inbound<ClientboundSegment>>, ProtocolError> {
        self.decode_with(|reader| ClientboundSegment::read(reader, resolver))
    }

    fn decode_with<S>(
        &mut self,
        read: impl FnOnce(&mut Reader<'_>) -> Result<Inbound<S>, ProtocolError>,
    ) -> Result<Option<Inbound<S>>, ProtocolError> {
        if self.buffer.is_empty() || self.buffer.len() < self.awaiting {
            return Ok(None);
        }
        let mut reader = Reader::new(&self.buffer);
        match read(&mut reader) {
            Ok(inbound) => {
                let consumed = reader.position();
                self.buffer.advance(consumed);
                self.awaiting = 0;
                Ok(Some(inbound))
            }
            Err(ProtocolError::Incomplete { needed }) => {
                let awaiting = self.buffer.len().saturating_add(needed);
                if awaiting > self.max_segment_size {
                    return Err(ProtocolError::MalformedSegment(format!(
                        "segment exceeds {} bytes",
                        self.max_segment_size
                    )));
                }
                self.awaiting = awaiting;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.awaiting = 0;
    }
}

impl Default for SegmentDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A segment of either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Serverbound(ServerboundSegment),
    Clientbound(ClientboundSegment),
}

/// Decodes exactly one segment travelling in `direction` from `bytes`.
pub fn decode(
    direction: Direction,
    bytes: &[u8],
    resolver: &dyn SchemaResolver,
) -> Result<Inbound<Segment>, ProtocolError> {
    fn lift<S>(inbound: Inbound<S>, wrap: fn(S) -> Segment) -> Inbound<Segment> {
        match inbound {
            Inbound::Segment {
                transaction_id,
                segment,
            } => Inbound::Segment {
                transaction_id,
                segment: wrap(segment),
            },
            Inbound::Rejected {
                transaction_id,
                kind,
                rejection,
            } => Inbound::Rejected {
                transaction_id,
                kind,
                rejection,
            },
        }
    }

    match direction {
        Direction::Serverbound => Ok(lift(
            ServerboundSegment::decode(bytes, resolver)?,
            Segment::Serverbound,
        )),
        Direction::Clientbound => Ok(lift(
            ClientboundSegment::decode(bytes, resolver)?,
            Segment::Clientbound,
        )),
    }
}
