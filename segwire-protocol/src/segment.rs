//! Segment format.
//!
//! Every segment starts with a two byte header:
//!
//! ```text
//! +----------------+---------------------------------------+
//! | transaction id | prefix                                |
//! | 1 byte         | type:2 | H:1 | O:1 | type-specific:4  |
//! +----------------+---------------------------------------+
//! | payload (type specific)                                |
//! +--------------------------------------------------------+
//! ```
//!
//! The 2-bit type code is direction-relative:
//!
//! | code | serverbound        | clientbound    |
//! |------|--------------------|----------------|
//! | 0    | `InvokeMethod`     | `MethodRet`    |
//! | 1    | `EntityUpdatePush` | `EntityUpdate` |
//! | 2    | `ConfResp`         | `ConfReq`      |
//! | 3    | -                  | `MethodErr`    |

use crate::error::ProtocolError;
use crate::field_array::{ArrayBits, FieldArray, FieldArraySchema, FieldSpec};
use crate::value::{FieldType, Reader, Value};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 2;

/// Highest entity type id.
pub const MAX_ENTITY_TYPE: u8 = 63;

/// Highest method id.
pub const MAX_METHOD_ID: u8 = 127;

/// Highest confirmation id (fits the 4 type-specific prefix bits).
pub const MAX_CONFIRMATION_ID: u8 = 15;

/// Which way a segment travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Serverbound,
    /// Server to client.
    Clientbound,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Serverbound => Direction::Clientbound,
            Direction::Clientbound => Direction::Serverbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Serverbound => write!(f, "serverbound"),
            Direction::Clientbound => write!(f, "clientbound"),
        }
    }
}

/// The seven segment kinds across both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    InvokeMethod,
    EntityUpdatePush,
    ConfResp,
    MethodRet,
    EntityUpdate,
    ConfReq,
    MethodErr,
}

impl SegmentKind {
    pub fn from_code(direction: Direction, code: u8) -> Option<Self> {
        match (direction, code) {
            (Direction::Serverbound, 0) => Some(SegmentKind::InvokeMethod),
            (Direction::Serverbound, 1) => Some(SegmentKind::EntityUpdatePush),
            (Direction::Serverbound, 2) => Some(SegmentKind::ConfResp),
            (Direction::Clientbound, 0) => Some(SegmentKind::MethodRet),
            (Direction::Clientbound, 1) => Some(SegmentKind::EntityUpdate),
            (Direction::Clientbound, 2) => Some(SegmentKind::ConfReq),
            (Direction::Clientbound, 3) => Some(SegmentKind::MethodErr),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            SegmentKind::InvokeMethod | SegmentKind::MethodRet => 0,
            SegmentKind::EntityUpdatePush | SegmentKind::EntityUpdate => 1,
            SegmentKind::ConfResp | SegmentKind::ConfReq => 2,
            SegmentKind::MethodErr => 3,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            SegmentKind::InvokeMethod | SegmentKind::EntityUpdatePush | SegmentKind::ConfResp => {
                Direction::Serverbound
            }
            _ => Direction::Clientbound,
        }
    }

    /// Whether this kind ends its transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentKind::MethodRet | SegmentKind::MethodErr)
    }
}

/// The prefix byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefix(u8);

impl Prefix {
    const HIGH_PACKED: u8 = 1 << 5;
    const HAS_OPTIONAL: u8 = 1 << 4;
    const SPECIFIC_MASK: u8 = 0x0F;

    pub fn new(kind: SegmentKind) -> Self {
        Self(kind.code() << 6)
    }

    pub fn with_array_bits(mut self, bits: ArrayBits) -> Self {
        if bits.high_packed {
            self.0 |= Self::HIGH_PACKED;
        }
        if bits.has_optional {
            self.0 |= Self::HAS_OPTIONAL;
        }
        self
    }

    pub fn with_specific(mut self, specific: u8) -> Self {
        self.0 = (self.0 & !Self::SPECIFIC_MASK) | (specific & Self::SPECIFIC_MASK);
        self
    }

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }

    pub fn code(&self) -> u8 {
        self.0 >> 6
    }

    pub fn array_bits(&self) -> ArrayBits {
        ArrayBits::new(
            self.0 & Self::HIGH_PACKED != 0,
            self.0 & Self::HAS_OPTIONAL != 0,
        )
    }

    pub fn specific(&self) -> u8 {
        self.0 & Self::SPECIFIC_MASK
    }
}

/// Whether a method belongs to the schema root or to an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodKind {
    Global,
    /// Entity method that is not bound to an instance.
    Static(u8),
    /// Entity method bound to the instance named in the segment.
    Dynamic(u8),
}

/// Identifies a callable method on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef {
    pub kind: MethodKind,
    pub id: u8,
}

impl MethodRef {
    const ENTITY_BOUND: u8 = 1 << 7;
    const DYNAMIC: u8 = 1 << 7;
    const RESERVED: u8 = 1 << 6;

    pub fn global(id: u8) -> Self {
        Self {
            kind: MethodKind::Global,
            id,
        }
    }

    pub fn static_method(entity_type: u8, id: u8) -> Self {
        Self {
            kind: MethodKind::Static(entity_type),
            id,
        }
    }

    pub fn dynamic_method(entity_type: u8, id: u8) -> Self {
        Self {
            kind: MethodKind::Dynamic(entity_type),
            id,
        }
    }

    pub fn entity_type(&self) -> Option<u8> {
        match self.kind {
            MethodKind::Global => None,
            MethodKind::Static(t) | MethodKind::Dynamic(t) => Some(t),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, MethodKind::Dynamic(_))
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.id > MAX_METHOD_ID {
            return Err(ProtocolError::Encode(format!("method id {} out of range", self.id)));
        }
        match self.kind {
            MethodKind::Global => buf.put_u8(self.id),
            MethodKind::Static(t) | MethodKind::Dynamic(t) => {
                if t > MAX_ENTITY_TYPE {
                    return Err(ProtocolError::Encode(format!("entity type {} out of range", t)));
                }
                buf.put_u8(Self::ENTITY_BOUND | self.id);
                let dynamic = if self.is_dynamic() { Self::DYNAMIC } else { 0 };
                buf.put_u8(dynamic | t);
            }
        }
        Ok(())
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let method = reader.u8()?;
        let id = method & MAX_METHOD_ID;
        if method & Self::ENTITY_BOUND == 0 {
            return Ok(Self::global(id));
        }
        let entity = reader.u8()?;
        if entity & Self::RESERVED != 0 {
            return Err(ProtocolError::MalformedSegment(
                "reserved bit set in entity octet".to_string(),
            ));
        }
        let entity_type = entity & MAX_ENTITY_TYPE;
        if entity & Self::DYNAMIC != 0 {
            Ok(Self::dynamic_method(entity_type, id))
        } else {
            Ok(Self::static_method(entity_type, id))
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MethodKind::Global => write!(f, "global#{}", self.id),
            MethodKind::Static(t) => write!(f, "entity{}::static#{}", t, self.id),
            MethodKind::Dynamic(t) => write!(f, "entity{}::dynamic#{}", t, self.id),
        }
    }
}

/// Wire layout of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLayout {
    pub id: FieldSpec,
    pub fields: Arc<FieldArraySchema>,
}

/// An entity instance as carried by update segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub type_id: u8,
    pub id: Value,
    pub fields: FieldArray,
}

impl Entity {
    pub fn new(type_id: u8, id: impl Into<Value>, fields: FieldArray) -> Self {
        Self {
            type_id,
            id: id.into(),
            fields,
        }
    }

    /// Encodes an entity update in either direction. H and O live in the
    /// first payload octet, not in the prefix.
    pub fn encode(
        &self,
        direction: Direction,
        transaction_id: u8,
        layout: &EntityLayout,
    ) -> Result<BytesMut, ProtocolError> {
        if self.type_id > MAX_ENTITY_TYPE {
            return Err(ProtocolError::Encode(format!(
                "entity type {} out of range",
                self.type_id
            )));
        }
        let kind = match direction {
            Direction::Serverbound => SegmentKind::EntityUpdatePush,
            Direction::Clientbound => SegmentKind::EntityUpdate,
        };
        let mut body = BytesMut::new();
        layout.id.ty.encode(&self.id, &mut body)?;
        let bits = self.fields.encode_into(&layout.fields, &mut body)?;

        let mut octet = self.type_id;
        if bits.high_packed {
            octet |= 1 << 7;
        }
        if bits.has_optional {
            octet |= 1 << 6;
        }

        let mut buf = header(transaction_id, Prefix::new(kind), 1 + body.len());
        buf.put_u8(octet);
        buf.put_slice(&body);
        Ok(buf)
    }

    fn read(
        reader: &mut Reader<'_>,
        prefix: Prefix,
        resolver: &dyn SchemaResolver,
    ) -> Result<Self, ProtocolError> {
        if prefix.byte() & 0x3F != 0 {
            return Err(ProtocolError::MalformedSegment(
                "entity update carries prefix flags".to_string(),
            ));
        }
        let octet = reader.u8()?;
        let type_id = octet & MAX_ENTITY_TYPE;
        let bits = ArrayBits::new(octet & (1 << 7) != 0, octet & (1 << 6) != 0);
        let layout = resolver.entity_layout(type_id).ok_or_else(|| {
            ProtocolError::MalformedSegment(format!("unknown entity type {}", type_id))
        })?;
        let id = layout.id.ty.decode(reader)?;
        let fields = FieldArray::read(reader, bits, &layout.fields)?;
        Ok(Self {
            type_id,
            id,
            fields,
        })
    }
}

/// An `InvokeMethod` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeMethod {
    pub method: MethodRef,
    /// Instance id, present iff the method is dynamic.
    pub entity_id: Option<Value>,
    pub params: FieldArray,
}

impl InvokeMethod {
    pub fn new(method: MethodRef, params: FieldArray) -> Self {
        Self {
            method,
            entity_id: None,
            params,
        }
    }

    pub fn with_entity_id(mut self, id: impl Into<Value>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn encode(
        &self,
        transaction_id: u8,
        params: &FieldArraySchema,
        entity_id_type: Option<&FieldType>,
    ) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::new();
        self.method.write(&mut body)?;
        match (self.method.is_dynamic(), &self.entity_id, entity_id_type) {
            (true, Some(id), Some(ty)) => ty.encode(id, &mut body)?,
            (false, None, _) => {}
            (true, _, _) => {
                return Err(ProtocolError::Encode(format!(
                    "dynamic method {} needs an entity id and its type",
                    self.method
                )))
            }
            (false, Some(_), _) => {
                return Err(ProtocolError::Encode(format!(
                    "method {} does not take an entity id",
                    self.method
                )))
            }
        }
        let bits = self.params.encode_into(params, &mut body)?;
        let prefix = Prefix::new(SegmentKind::InvokeMethod).with_array_bits(bits);
        let mut buf = header(transaction_id, prefix, body.len());
        buf.put_slice(&body);
        Ok(buf)
    }
}

/// A `MethodErr` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    pub code: u16,
    pub message: String,
}

impl MethodError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self, transaction_id: u8) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u16(self.code);
        FieldType::Str.encode(&Value::Str(self.message.clone()), &mut body)?;
        let mut buf = header(transaction_id, Prefix::new(SegmentKind::MethodErr), body.len());
        buf.put_slice(&body);
        Ok(buf)
    }
}

/// Segments sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerboundSegment {
    InvokeMethod(InvokeMethod),
    EntityUpdatePush(Entity),
    ConfResp(FieldArray),
}

/// Segments sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientboundSegment {
    MethodRet(FieldArray),
    EntityUpdate(Entity),
    ConfReq {
        confirmation: u8,
        fields: FieldArray,
    },
    MethodErr(MethodError),
}

impl ServerboundSegment {
    pub fn kind(&self) -> SegmentKind {
        match self {
            ServerboundSegment::InvokeMethod(_) => SegmentKind::InvokeMethod,
            ServerboundSegment::EntityUpdatePush(_) => SegmentKind::EntityUpdatePush,
            ServerboundSegment::ConfResp(_) => SegmentKind::ConfResp,
        }
    }

    /// Encodes the segment, looking up schemas through `resolver`.
    pub fn encode(
        &self,
        transaction_id: u8,
        resolver: &dyn SchemaResolver,
    ) -> Result<BytesMut, ProtocolError> {
        match self {
            ServerboundSegment::InvokeMethod(invoke) => {
                let params = resolver
                    .method_params(invoke.method)
                    .map_err(|r| ProtocolError::Encode(format!("{}: {}", invoke.method, r)))?;
                let layout = invoke
                    .method
                    .entity_type()
                    .and_then(|t| resolver.entity_layout(t));
                invoke.encode(transaction_id, &params, layout.as_ref().map(|l| &l.id.ty))
            }
            ServerboundSegment::EntityUpdatePush(entity) => {
                let layout = resolver.entity_layout(entity.type_id).ok_or_else(|| {
                    ProtocolError::Encode(format!("unknown entity type {}", entity.type_id))
                })?;
                entity.encode(Direction::Serverbound, transaction_id, &layout)
            }
            ServerboundSegment::ConfResp(fields) => {
                let schema = resolver
                    .confirmation_response(transaction_id)
                    .map_err(|r| ProtocolError::Encode(r.to_string()))?;
                encode_array_segment(
                    transaction_id,
                    Prefix::new(SegmentKind::ConfResp),
                    fields,
                    &schema,
                )
            }
        }
    }

    /// Decodes one complete segment from `bytes`.
    pub fn decode(
        bytes: &[u8],
        resolver: &dyn SchemaResolver,
    ) -> Result<Inbound<Self>, ProtocolError> {
        decode_complete(bytes, |reader| Self::read(reader, resolver))
    }

    pub(crate) fn read(
        reader: &mut Reader<'_>,
        resolver: &dyn SchemaResolver,
    ) -> Result<Inbound<Self>, ProtocolError> {
        let transaction_id = reader.u8()?;
        let prefix = Prefix::from_byte(reader.u8()?);
        let kind = SegmentKind::from_code(Direction::Serverbound, prefix.code()).ok_or(
            ProtocolError::UnknownSegmentType {
                direction: Direction::Serverbound,
                code: prefix.code(),
            },
        )?;
        let bits = prefix.array_bits();

        match kind {
            SegmentKind::InvokeMethod => {
                expect_no_specific(prefix)?;
                let method = MethodRef::read(reader)?;
                let entity_id = match method.kind {
                    MethodKind::Dynamic(t) => {
                        let layout = resolver.entity_layout(t).ok_or_else(|| {
                            ProtocolError::MalformedSegment(format!("unknown entity type {}", t))
                        })?;
                        Some(layout.id.ty.decode(reader)?)
                    }
                    _ => None,
                };
                let rejected = match resolver.method_params(method) {
                    Ok(schema) => {
                        let params = FieldArray::read(reader, bits, &schema)?;
                        return Ok(Inbound::Segment {
                            transaction_id,
                            segment: ServerboundSegment::InvokeMethod(InvokeMethod {
                                method,
                                entity_id,
                                params,
                            }),
                        });
                    }
                    Err(rejection) => rejection,
                };
                reject(transaction_id, kind, bits, rejected)
            }
            SegmentKind::EntityUpdatePush => Ok(Inbound::Segment {
                transaction_id,
                segment: ServerboundSegment::EntityUpdatePush(Entity::read(
                    reader, prefix, resolver,
                )?),
            }),
            SegmentKind::ConfResp => {
                expect_no_specific(prefix)?;
                match resolver.confirmation_response(transaction_id) {
                    Ok(schema) => Ok(Inbound::Segment {
                        transaction_id,
                        segment: ServerboundSegment::ConfResp(FieldArray::read(
                            reader, bits, &schema,
                        )?),
                    }),
                    Err(rejection) => reject(transaction_id, kind, bits, rejection),
                }
            }
            _ => unreachable!("clientbound kind decoded as serverbound"),
        }
    }
}

impl ClientboundSegment {
    pub fn kind(&self) -> SegmentKind {
        match self {
            ClientboundSegment::MethodRet(_) => SegmentKind::MethodRet,
            ClientboundSegment::EntityUpdate(_) => SegmentKind::EntityUpdate,
            ClientboundSegment::ConfReq { .. } => SegmentKind::ConfReq,
            ClientboundSegment::MethodErr(_) => SegmentKind::MethodErr,
        }
    }

    /// Encodes the segment, looking up schemas through `resolver`.
    pub fn encode(
        &self,
        transaction_id: u8,
        resolver: &dyn SchemaResolver,
    ) -> Result<BytesMut, ProtocolError> {
        match self {
            ClientboundSegment::MethodRet(fields) => {
                let schema = resolver
                    .method_return(transaction_id)
                    .map_err(|r| ProtocolError::Encode(r.to_string()))?;
                encode_method_ret(transaction_id, fields, &schema)
            }
            ClientboundSegment::EntityUpdate(entity) => {
                let layout = resolver.entity_layout(entity.type_id).ok_or_else(|| {
                    ProtocolError::Encode(format!("unknown entity type {}", entity.type_id))
                })?;
                entity.encode(Direction::Clientbound, transaction_id, &layout)
            }
            ClientboundSegment::ConfReq {
                confirmation,
                fields,
            } => {
                let schema = resolver
                    .confirmation_request(transaction_id, *confirmation)
                    .map_err(|r| ProtocolError::Encode(r.to_string()))?;
                encode_conf_req(transaction_id, *confirmation, fields, &schema)
            }
            ClientboundSegment::MethodErr(err) => err.encode(transaction_id),
        }
    }

    /// Decodes one complete segment from `bytes`.
    pub fn decode(
        bytes: &[u8],
        resolver: &dyn SchemaResolver,
    ) -> Result<Inbound<Self>, ProtocolError> {
        decode_complete(bytes, |reader| Self::read(reader, resolver))
    }

    pub(crate) fn read(
        reader: &mut Reader<'_>,
        resolver: &dyn SchemaResolver,
    ) -> Result<Inbound<Self>, ProtocolError> {
        let transaction_id = reader.u8()?;
        let prefix = Prefix::from_byte(reader.u8()?);
        // All four codes are assigned clientbound.
        let kind = SegmentKind::from_code(Direction::Clientbound, prefix.code()).ok_or(
            ProtocolError::UnknownSegmentType {
                direction: Direction::Clientbound,
                code: prefix.code(),
            },
        )?;
        let bits = prefix.array_bits();

        let segment = match kind {
            SegmentKind::MethodRet => {
                expect_no_specific(prefix)?;
                match resolver.method_return(transaction_id) {
                    Ok(schema) => {
                        ClientboundSegment::MethodRet(FieldArray::read(reader, bits, &schema)?)
                    }
                    Err(rejection) => return reject(transaction_id, kind, bits, rejection),
                }
            }
            SegmentKind::EntityUpdate => {
                ClientboundSegment::EntityUpdate(Entity::read(reader, prefix, resolver)?)
            }
            SegmentKind::ConfReq => {
                let confirmation = prefix.specific();
                match resolver.confirmation_request(transaction_id, confirmation) {
                    Ok(schema) => ClientboundSegment::ConfReq {
                        confirmation,
                        fields: FieldArray::read(reader, bits, &schema)?,
                    },
                    Err(rejection) => return reject(transaction_id, kind, bits, rejection),
                }
            }
            SegmentKind::MethodErr => {
                if prefix.byte() & 0x3F != 0 {
                    return Err(ProtocolError::MalformedSegment(
                        "method error carries prefix flags".to_string(),
                    ));
                }
                if let Err(Rejection::Orphan) = resolver.method_error(transaction_id) {
                    return Err(ProtocolError::OrphanSegment(transaction_id));
                }
                let code = reader.uint(2)? as u16;
                let message = match FieldType::Str.decode(reader)? {
                    Value::Str(s) => s,
                    _ => unreachable!("string type decodes to a string"),
                };
                ClientboundSegment::MethodErr(MethodError { code, message })
            }
            _ => unreachable!("serverbound kind decoded as clientbound"),
        };

        Ok(Inbound::Segment {
            transaction_id,
            segment,
        })
    }
}

/// Encodes a `MethodRet` segment.
pub fn encode_method_ret(
    transaction_id: u8,
    fields: &FieldArray,
    schema: &FieldArraySchema,
) -> Result<BytesMut, ProtocolError> {
    encode_array_segment(transaction_id, Prefix::new(SegmentKind::MethodRet), fields, schema)
}

/// Encodes a `ConfReq` segment for the given confirmation id.
pub fn encode_conf_req(
    transaction_id: u8,
    confirmation: u8,
    fields: &FieldArray,
    schema: &FieldArraySchema,
) -> Result<BytesMut, ProtocolError> {
    if confirmation > MAX_CONFIRMATION_ID {
        return Err(ProtocolError::Encode(format!(
            "confirmation id {} out of range",
            confirmation
        )));
    }
    let prefix = Prefix::new(SegmentKind::ConfReq).with_specific(confirmation);
    encode_array_segment(transaction_id, prefix, fields, schema)
}

/// Encodes a `ConfResp` segment.
pub fn encode_conf_resp(
    transaction_id: u8,
    fields: &FieldArray,
    schema: &FieldArraySchema,
) -> Result<BytesMut, ProtocolError> {
    encode_array_segment(transaction_id, Prefix::new(SegmentKind::ConfResp), fields, schema)
}

fn encode_array_segment(
    transaction_id: u8,
    prefix: Prefix,
    fields: &FieldArray,
    schema: &FieldArraySchema,
) -> Result<BytesMut, ProtocolError> {
    let (body, bits) = fields.encode(schema)?;
    let mut buf = header(transaction_id, prefix.with_array_bits(bits), body.len());
    buf.put_slice(&body);
    Ok(buf)
}

fn header(transaction_id: u8, prefix: Prefix, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE + payload_len);
    buf.put_u8(transaction_id);
    buf.put_u8(prefix.byte());
    buf
}

fn expect_no_specific(prefix: Prefix) -> Result<(), ProtocolError> {
    if prefix.specific() != 0 {
        return Err(ProtocolError::MalformedSegment(format!(
            "unexpected type-specific bits {:#x}",
            prefix.specific()
        )));
    }
    Ok(())
}

/// Consumes a rejected segment. Only a segment with an empty field array
/// can be delimited without its schema.
fn reject<S>(
    transaction_id: u8,
    kind: SegmentKind,
    bits: ArrayBits,
    rejection: Rejection,
) -> Result<Inbound<S>, ProtocolError> {
    if rejection == Rejection::Orphan {
        return Err(ProtocolError::OrphanSegment(transaction_id));
    }
    if bits.has_optional || bits.high_packed {
        return Err(ProtocolError::MalformedSegment(format!(
            "{:?} on transaction {} rejected ({}) with an undelimited payload",
            kind, transaction_id, rejection
        )));
    }
    Ok(Inbound::Rejected {
        transaction_id,
        kind,
        rejection,
    })
}

fn decode_complete<S>(
    bytes: &[u8],
    read: impl FnOnce(&mut Reader<'_>) -> Result<Inbound<S>, ProtocolError>,
) -> Result<Inbound<S>, ProtocolError> {
    let mut reader = Reader::new(bytes);
    let inbound = read(&mut reader).map_err(|e| match e {
        ProtocolError::Incomplete { .. } => {
            ProtocolError::MalformedSegment("truncated segment".to_string())
        }
        other => other,
    })?;
    if reader.remaining() != 0 {
        return Err(ProtocolError::MalformedSegment(format!(
            "{} trailing bytes",
            reader.remaining()
        )));
    }
    Ok(inbound)
}

/// Why a resolver could not provide a schema for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No method is registered under the requested reference.
    UnknownMethod,
    /// A confirmation segment does not match the transaction's state.
    ConfirmationMismatch,
    /// The transaction id is not tracked at all.
    Orphan,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownMethod => write!(f, "unknown method"),
            Rejection::ConfirmationMismatch => write!(f, "confirmation mismatch"),
            Rejection::Orphan => write!(f, "no such transaction"),
        }
    }
}

/// Outcome of decoding one inbound segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<S> {
    Segment { transaction_id: u8, segment: S },
    /// A well-delimited segment the local peer cannot act on. The engine
    /// answers it on `transaction_id` instead of dropping the connection.
    Rejected {
        transaction_id: u8,
        kind: SegmentKind,
        rejection: Rejection,
    },
}

/// Supplies the field-array layouts needed to encode and decode segments.
///
/// Decoding is schema-driven: field arrays are not self-describing, so the
/// decoder asks the resolver what a given segment carries. The defaults
/// reject everything, so implementations only override what their side of
/// the connection can receive.
pub trait SchemaResolver {
    /// Parameter layout of an invoked method.
    fn method_params(&self, _method: MethodRef) -> Result<Arc<FieldArraySchema>, Rejection> {
        Err(Rejection::UnknownMethod)
    }

    fn entity_layout(&self, _entity_type: u8) -> Option<EntityLayout> {
        None
    }

    /// Return layout of the method invoked on `transaction_id`.
    fn method_return(&self, _transaction_id: u8) -> Result<Arc<FieldArraySchema>, Rejection> {
        Err(Rejection::Orphan)
    }

    fn confirmation_request(
        &self,
        _transaction_id: u8,
        _confirmation: u8,
    ) -> Result<Arc<FieldArraySchema>, Rejection> {
        Err(Rejection::Orphan)
    }

    /// Response layout of the confirmation `transaction_id` is waiting for.
    fn confirmation_response(
        &self,
        _transaction_id: u8,
    ) -> Result<Arc<FieldArraySchema>, Rejection> {
        Err(Rejection::Orphan)
    }

    fn method_error(&self, _transaction_id: u8) -> Result<(), Rejection> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    /// Fixed-table resolver for codec tests.
    #[derive(Default)]
    struct TableResolver {
        methods: HashMap<MethodRef, Arc<FieldArraySchema>>,
        entities: HashMap<u8, EntityLayout>,
        returns: HashMap<u8, Arc<FieldArraySchema>>,
        confirmations: HashMap<(u8, u8), Arc<FieldArraySchema>>,
        awaiting: HashMap<u8, Arc<FieldArraySchema>>,
    }

    impl SchemaResolver for TableResolver {
        fn method_params(&self, method: MethodRef) -> Result<Arc<FieldArraySchema>, Rejection> {
            self.methods.get(&method).cloned().ok_or(Rejection::UnknownMethod)
        }

        fn entity_layout(&self, entity_type: u8) -> Option<EntityLayout> {
            self.entities.get(&entity_type).cloned()
        }

        fn method_return(&self, transaction_id: u8) -> Result<Arc<FieldArraySchema>, Rejection> {
            self.returns.get(&transaction_id).cloned().ok_or(Rejection::Orphan)
        }

        fn confirmation_request(
            &self,
            transaction_id: u8,
            confirmation: u8,
        ) -> Result<Arc<FieldArraySchema>, Rejection> {
            self.confirmations
                .get(&(transaction_id, confirmation))
                .cloned()
                .ok_or(Rejection::ConfirmationMismatch)
        }

        fn confirmation_response(
            &self,
            transaction_id: u8,
        ) -> Result<Arc<FieldArraySchema>, Rejection> {
            if self.returns.contains_key(&transaction_id) {
                self.awaiting
                    .get(&transaction_id)
                    .cloned()
                    .ok_or(Rejection::ConfirmationMismatch)
            } else {
                Err(Rejection::Orphan)
            }
        }
    }

    fn login_params() -> Arc<FieldArraySchema> {
        Arc::new(
            FieldArraySchema::new(
                vec![
                    FieldSpec::new("email", FieldType::Str),
                    FieldSpec::new("password", FieldType::Str),
                ],
                BTreeMap::from([(0, FieldSpec::new("remember", FieldType::Bool))]),
            )
            .unwrap(),
        )
    }

    fn user_layout() -> EntityLayout {
        EntityLayout {
            id: FieldSpec::new("id", FieldType::Int(8)),
            fields: Arc::new(
                FieldArraySchema::new(
                    vec![FieldSpec::new("name", FieldType::Str)],
                    BTreeMap::from([(0, FieldSpec::new("status", FieldType::Str))]),
                )
                .unwrap(),
            ),
        }
    }

    fn resolver() -> TableResolver {
        let mut r = TableResolver::default();
        r.methods.insert(MethodRef::global(1), login_params());
        r.methods
            .insert(MethodRef::dynamic_method(0, 3), Arc::new(FieldArraySchema::empty()));
        r.entities.insert(0, user_layout());
        r
    }

    #[test]
    fn test_prefix_bits() {
        let prefix = Prefix::new(SegmentKind::ConfReq)
            .with_array_bits(ArrayBits::new(true, true))
            .with_specific(0x0B);
        assert_eq!(prefix.byte(), 0b1011_1011);
        assert_eq!(prefix.code(), 2);
        assert_eq!(prefix.array_bits(), ArrayBits::new(true, true));
        assert_eq!(prefix.specific(), 0x0B);
    }

    #[test]
    fn test_kind_codes_are_direction_relative() {
        assert_eq!(
            SegmentKind::from_code(Direction::Serverbound, 0),
            Some(SegmentKind::InvokeMethod)
        );
        assert_eq!(
            SegmentKind::from_code(Direction::Clientbound, 0),
            Some(SegmentKind::MethodRet)
        );
        assert_eq!(SegmentKind::from_code(Direction::Serverbound, 3), None);
        for kind in [
            SegmentKind::InvokeMethod,
            SegmentKind::EntityUpdatePush,
            SegmentKind::ConfResp,
            SegmentKind::MethodRet,
            SegmentKind::EntityUpdate,
            SegmentKind::ConfReq,
            SegmentKind::MethodErr,
        ] {
            assert_eq!(SegmentKind::from_code(kind.direction(), kind.code()), Some(kind));
        }
    }

    #[test]
    fn test_invoke_global_method_bytes() {
        let invoke = InvokeMethod::new(
            MethodRef::global(1),
            FieldArray::new(vec![Value::from("a@b"), Value::from("pw")]),
        );
        let buf = invoke.encode(9, &login_params(), None).unwrap();
        assert_eq!(buf[0], 9);
        assert_eq!(buf[1], 0b0000_0000);
        assert_eq!(buf[2], 1);

        let decoded = ServerboundSegment::decode(&buf, &resolver()).unwrap();
        assert_eq!(
            decoded,
            Inbound::Segment {
                transaction_id: 9,
                segment: ServerboundSegment::InvokeMethod(invoke),
            }
        );
    }

    #[test]
    fn test_invoke_dynamic_method_carries_entity_id() {
        let invoke = InvokeMethod::new(MethodRef::dynamic_method(0, 3), FieldArray::empty())
            .with_entity_id(42u64);
        let buf = invoke
            .encode(4, &FieldArraySchema::empty(), Some(&FieldType::Int(8)))
            .unwrap();
        assert_eq!(&buf[..4], &[4, 0, 0x80 | 3, 0x80]);
        assert_eq!(&buf[4..], &[0, 0, 0, 0, 0, 0, 0, 42]);

        match ServerboundSegment::decode(&buf, &resolver()).unwrap() {
            Inbound::Segment {
                segment: ServerboundSegment::InvokeMethod(decoded),
                ..
            } => assert_eq!(decoded.entity_id, Some(Value::Int(42))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_is_consumed_and_rejected() {
        let buf = [5u8, 0x00, 77];
        let decoded = ServerboundSegment::decode(&buf, &resolver()).unwrap();
        assert_eq!(
            decoded,
            Inbound::Rejected {
                transaction_id: 5,
                kind: SegmentKind::InvokeMethod,
                rejection: Rejection::UnknownMethod,
            }
        );
    }

    #[test]
    fn test_unknown_method_with_optional_payload_is_structural() {
        let buf = [5u8, 0x10, 77, 1, 0, 1];
        let result = ServerboundSegment::decode(&buf, &resolver());
        assert!(matches!(result, Err(ProtocolError::MalformedSegment(_))));
    }

    #[test]
    fn test_unknown_serverbound_type() {
        let buf = [1u8, 0b1100_0000];
        let result = ServerboundSegment::decode(&buf, &resolver());
        assert_eq!(
            result,
            Err(ProtocolError::UnknownSegmentType {
                direction: Direction::Serverbound,
                code: 3
            })
        );
    }

    #[test]
    fn test_entity_update_bits_live_in_payload() {
        let entity = Entity::new(
            0,
            7u64,
            FieldArray::new(vec![Value::from("ana")]).with_optional(0, "online"),
        );
        let buf = entity
            .encode(Direction::Clientbound, 200, &user_layout())
            .unwrap();
        // prefix: type 1, no flags
        assert_eq!(buf[1], 0b0100_0000);
        // payload octet: H set (bitfield of 1 byte < 2), O set, type 0
        assert_eq!(buf[2], 0b1100_0000);

        let decoded = ClientboundSegment::decode(&buf, &resolver()).unwrap();
        assert_eq!(
            decoded,
            Inbound::Segment {
                transaction_id: 200,
                segment: ClientboundSegment::EntityUpdate(entity),
            }
        );
    }

    #[test]
    fn test_entity_update_rejects_prefix_flags() {
        let entity = Entity::new(0, 7u64, FieldArray::new(vec![Value::from("ana")]));
        let mut buf = entity.encode(Direction::Serverbound, 1, &user_layout()).unwrap();
        buf[1] |= 0b0001_0000;
        let result = ServerboundSegment::decode(&buf, &resolver());
        assert!(matches!(result, Err(ProtocolError::MalformedSegment(_))));
    }

    #[test]
    fn test_method_err_layout() {
        let err = MethodError::new(0xFF04, "nope");
        let buf = err.encode(3).unwrap();
        assert_eq!(&buf[..], &[3, 0xC0, 0xFF, 0x04, 0, 4, b'n', b'o', b'p', b'e']);

        let decoded = ClientboundSegment::decode(&buf, &resolver()).unwrap();
        assert_eq!(
            decoded,
            Inbound::Segment {
                transaction_id: 3,
                segment: ClientboundSegment::MethodErr(err),
            }
        );
    }

    #[test]
    fn test_method_ret_requires_tracked_transaction() {
        let buf = encode_method_ret(8, &FieldArray::empty(), &FieldArraySchema::empty()).unwrap();
        let result = ClientboundSegment::decode(&buf, &resolver());
        assert_eq!(result, Err(ProtocolError::OrphanSegment(8)));

        let mut r = resolver();
        r.returns.insert(8, Arc::new(FieldArraySchema::empty()));
        assert!(ClientboundSegment::decode(&buf, &r).is_ok());
    }

    #[test]
    fn test_conf_req_carries_confirmation_id() {
        let schema = Arc::new(
            FieldArraySchema::new(vec![FieldSpec::new("code", FieldType::Int(2))], BTreeMap::new())
                .unwrap(),
        );
        let mut r = resolver();
        r.confirmations.insert((6, 9), schema.clone());

        let fields = FieldArray::new(vec![Value::Int(1234)]);
        let buf = encode_conf_req(6, 9, &fields, &schema).unwrap();
        assert_eq!(buf[1], 0b1000_1001);
        assert_eq!(
            ClientboundSegment::decode(&buf, &r).unwrap(),
            Inbound::Segment {
                transaction_id: 6,
                segment: ClientboundSegment::ConfReq {
                    confirmation: 9,
                    fields
                },
            }
        );

        assert!(encode_conf_req(6, 16, &FieldArray::empty(), &schema).is_err());
    }

    #[test]
    fn test_conf_resp_without_pending_confirmation() {
        let mut r = resolver();
        r.returns.insert(2, Arc::new(FieldArraySchema::empty()));
        let buf = encode_conf_resp(2, &FieldArray::empty(), &FieldArraySchema::empty()).unwrap();
        assert_eq!(
            ServerboundSegment::decode(&buf, &r).unwrap(),
            Inbound::Rejected {
                transaction_id: 2,
                kind: SegmentKind::ConfResp,
                rejection: Rejection::ConfirmationMismatch,
            }
        );

        let orphan = encode_conf_resp(3, &FieldArray::empty(), &FieldArraySchema::empty()).unwrap();
        assert_eq!(
            ServerboundSegment::decode(&orphan, &r),
            Err(ProtocolError::OrphanSegment(3))
        );
    }

    #[test]
    fn test_truncated_and_trailing_segments() {
        let invoke = InvokeMethod::new(
            MethodRef::global(1),
            FieldArray::new(vec![Value::from("a@b"), Value::from("pw")]),
        );
        let buf = invoke.encode(9, &login_params(), None).unwrap();
        let result = ServerboundSegment::decode(&buf[..buf.len() - 1], &resolver());
        assert!(matches!(result, Err(ProtocolError::MalformedSegment(_))));

        let mut longer = buf.to_vec();
        longer.push(0);
        let result = ServerboundSegment::decode(&longer, &resolver());
        assert!(matches!(result, Err(ProtocolError::MalformedSegment(_))));
    }

    #[test]
    fn test_generic_encode_uses_resolver() {
        let mut r = resolver();
        r.returns.insert(1, Arc::new(FieldArraySchema::empty()));
        let seg = ClientboundSegment::MethodRet(FieldArray::empty());
        let buf = seg.encode(1, &r).unwrap();
        assert_eq!(&buf[..], &[1, 0]);

        let seg = ServerboundSegment::InvokeMethod(InvokeMethod::new(
            MethodRef::global(99),
            FieldArray::empty(),
        ));
        assert!(matches!(seg.encode(1, &r), Err(ProtocolError::Encode(_))));
    }
}
