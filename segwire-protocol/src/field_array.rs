//! Field array encoding.
//!
//! A field array is an ordered list of required values followed by an
//! unordered set of identified optional values. Two auxiliary bits travel
//! outside the array body (in the segment prefix or the entity octet):
//!
//! - `O`: set iff at least one optional field is present.
//! - `H`: high-packing; only ever set together with `O`.
//!
//! Normal mode:
//!
//! ```text
//! +-----------------+-------+------+-------+-----+------+-------+
//! | required values | count | id_0 | val_0 | ... | id_k | val_k |
//! +-----------------+-------+------+-------+-----+------+-------+
//! ```
//!
//! High-packing mode:
//!
//! ```text
//! +-----------------+-------------------+-----------------------------+
//! | required values | presence bitfield | present values, ascending id|
//! +-----------------+-------------------+-----------------------------+
//! ```
//!
//! The bitfield covers every optional id the schema declares, one bit per
//! id, LSB-first within each byte.

use crate::error::ProtocolError;
use crate::value::{FieldType, Reader, Value};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest optional field id representable on the wire.
pub const MAX_OPTIONAL_ID: u8 = 127;

/// A named, typed field slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Structural layout of a field array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldArraySchema {
    required: Vec<FieldSpec>,
    optional: BTreeMap<u8, FieldSpec>,
}

impl FieldArraySchema {
    pub fn new(
        required: Vec<FieldSpec>,
        optional: BTreeMap<u8, FieldSpec>,
    ) -> Result<Self, ProtocolError> {
        if let Some(id) = optional.keys().find(|id| **id > MAX_OPTIONAL_ID) {
            return Err(ProtocolError::Encode(format!(
                "optional field id {} exceeds {}",
                id, MAX_OPTIONAL_ID
            )));
        }
        for spec in required.iter().chain(optional.values()) {
            spec.ty.check()?;
        }
        Ok(Self { required, optional })
    }

    /// A schema with no fields at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn required(&self) -> &[FieldSpec] {
        &self.required
    }

    pub fn optional(&self) -> &BTreeMap<u8, FieldSpec> {
        &self.optional
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }

    /// Width in bytes of the high-packing presence bitfield.
    pub fn bitfield_len(&self) -> usize {
        match self.optional.keys().next_back() {
            Some(max) => (*max as usize) / 8 + 1,
            None => 0,
        }
    }

    /// Returns whether the encoder packs `present` optional fields with a
    /// bitfield. Chosen iff the bitfield is strictly smaller than the count
    /// byte plus one id byte per field.
    pub fn prefers_high_packing(&self, present: usize) -> bool {
        present > 0 && self.bitfield_len() < 1 + present
    }
}

/// The `H` and `O` bits that accompany an encoded field array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayBits {
    pub high_packed: bool,
    pub has_optional: bool,
}

impl ArrayBits {
    pub fn new(high_packed: bool, has_optional: bool) -> Self {
        Self {
            high_packed,
            has_optional,
        }
    }
}

/// Decoded or to-be-encoded field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldArray {
    /// Required values in schema order.
    pub required: Vec<Value>,
    /// Optional values keyed by field id.
    pub optional: BTreeMap<u8, Value>,
}

impl FieldArray {
    pub fn new(required: Vec<Value>) -> Self {
        Self {
            required,
            optional: BTreeMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_optional(mut self, id: u8, value: impl Into<Value>) -> Self {
        self.optional.insert(id, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }

    /// Looks up a value by field name, required or optional.
    pub fn get<'a>(&'a self, schema: &FieldArraySchema, name: &str) -> Option<&'a Value> {
        if let Some(idx) = schema.required.iter().position(|f| f.name == name) {
            return self.required.get(idx);
        }
        schema
            .optional
            .iter()
            .find(|(_, f)| f.name == name)
            .and_then(|(id, _)| self.optional.get(id))
    }

    /// Encodes the array and returns its bytes with the auxiliary bits.
    pub fn encode(
        &self,
        schema: &FieldArraySchema,
    ) -> Result<(BytesMut, ArrayBits), ProtocolError> {
        let mut buf = BytesMut::new();
        let bits = self.encode_into(schema, &mut buf)?;
        Ok((buf, bits))
    }

    /// Appends the encoded array to `buf`.
    pub fn encode_into(
        &self,
        schema: &FieldArraySchema,
        buf: &mut BytesMut,
    ) -> Result<ArrayBits, ProtocolError> {
        if self.required.len() != schema.required.len() {
            return Err(ProtocolError::Encode(format!(
                "expected {} required fields, got {}",
                schema.required.len(),
                self.required.len()
            )));
        }
        for (spec, value) in schema.required.iter().zip(&self.required) {
            spec.ty.encode(value, buf)?;
        }

        if self.optional.is_empty() {
            return Ok(ArrayBits::default());
        }

        let mut present = Vec::with_capacity(self.optional.len());
        for (id, value) in &self.optional {
            let spec = schema.optional.get(id).ok_or_else(|| {
                ProtocolError::Encode(format!("optional field {} is not declared", id))
            })?;
            present.push((*id, spec, value));
        }

        let high_packed = schema.prefers_high_packing(present.len());
        if high_packed {
            let mut bitfield = vec![0u8; schema.bitfield_len()];
            for (id, _, _) in &present {
                bitfield[*id as usize / 8] |= 1 << (id % 8);
            }
            buf.put_slice(&bitfield);
            for (_, spec, value) in &present {
                spec.ty.encode(value, buf)?;
            }
        } else {
            buf.put_u8(present.len() as u8);
            for (id, spec, value) in &present {
                buf.put_u8(*id);
                spec.ty.encode(value, buf)?;
            }
        }

        Ok(ArrayBits::new(high_packed, true))
    }

    /// Decodes a complete buffer. Truncation and trailing bytes are both
    /// reported as `MalformedFieldArray`.
    pub fn decode(
        bytes: &[u8],
        bits: ArrayBits,
        schema: &FieldArraySchema,
    ) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let array = Self::read(&mut reader, bits, schema).map_err(|e| match e {
            ProtocolError::Incomplete { .. } => ProtocolError::malformed("truncated buffer"),
            other => other,
        })?;
        if reader.remaining() != 0 {
            return Err(ProtocolError::malformed(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }
        Ok(array)
    }

    pub(crate) fn read(
        reader: &mut Reader<'_>,
        bits: ArrayBits,
        schema: &FieldArraySchema,
    ) -> Result<Self, ProtocolError> {
        if bits.high_packed && !bits.has_optional {
            return Err(ProtocolError::malformed("high-packing bit set without optional bit"));
        }

        let mut required = Vec::with_capacity(schema.required.len());
        for spec in &schema.required {
            required.push(spec.ty.decode(reader)?);
        }

        let mut optional = BTreeMap::new();
        if bits.has_optional && bits.high_packed {
            let width = schema.bitfield_len();
            if width == 0 {
                return Err(ProtocolError::malformed(
                    "high-packing bitfield for a schema without optional fields",
                ));
            }
            let bitfield = reader.take(width)?;
            let mut ids = Vec::new();
            for (byte_idx, byte) in bitfield.iter().enumerate() {
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        ids.push((byte_idx * 8 + bit) as u8);
                    }
                }
            }
            if ids.is_empty() {
                return Err(ProtocolError::malformed("optional bit set but bitfield is empty"));
            }
            for id in ids {
                let spec = schema.optional.get(&id).ok_or_else(|| {
                    ProtocolError::malformed(format!(
                        "bitfield marks undeclared optional field {}",
                        id
                    ))
                })?;
                optional.insert(id, spec.ty.decode(reader)?);
            }
        } else if bits.has_optional {
            let count = reader.u8()?;
            if count == 0 || count > MAX_OPTIONAL_ID + 1 {
                return Err(ProtocolError::malformed(format!(
                    "invalid optional field count {}",
                    count
                )));
            }
            for _ in 0..count {
                let id = reader.u8()?;
                if id > MAX_OPTIONAL_ID {
                    return Err(ProtocolError::malformed(format!(
                        "optional field id {} out of range",
                        id
                    )));
                }
                let spec = schema.optional.get(&id).ok_or_else(|| {
                    ProtocolError::malformed(format!("undeclared optional field {}", id))
                })?;
                let value = spec.ty.decode(reader)?;
                if optional.insert(id, value).is_some() {
                    return Err(ProtocolError::malformed(format!(
                        "duplicate optional field {}",
                        id
                    )));
                }
            }
        }

        Ok(Self { required, optional })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Eight optional fields with ids 0..8, plus two required fields.
    fn profile_schema() -> FieldArraySchema {
        let optional = (0u8..8)
            .map(|id| (id, FieldSpec::new(format!("opt{}", id), FieldType::Int(2))))
            .collect();
        FieldArraySchema::new(
            vec![
                FieldSpec::new("id", FieldType::Int(4)),
                FieldSpec::new("name", FieldType::Str),
            ],
            optional,
        )
        .unwrap()
    }

    fn sparse_schema() -> FieldArraySchema {
        let optional = BTreeMap::from([
            (3, FieldSpec::new("bio", FieldType::Str)),
            (64, FieldSpec::new("tags", FieldType::list(FieldType::Str, 1))),
        ]);
        FieldArraySchema::new(vec![], optional).unwrap()
    }

    fn required_only() -> FieldArray {
        FieldArray::new(vec![Value::Int(7), Value::from("ana")])
    }

    #[test]
    fn test_no_optional_fields_clears_both_bits() {
        let (buf, bits) = required_only().encode(&profile_schema()).unwrap();
        assert_eq!(bits, ArrayBits::new(false, false));
        assert_eq!(&buf[..], &[0, 0, 0, 7, 0, 3, b'a', b'n', b'a']);
    }

    #[test]
    fn test_normal_mode_layout() {
        // The sparse schema needs a 9-byte bitfield, so a single field is
        // cheaper with a count byte and an id byte.
        let schema = sparse_schema();
        let array = FieldArray::empty().with_optional(3, "hi");
        let (buf, bits) = array.encode(&schema).unwrap();

        assert_eq!(schema.bitfield_len(), 9);
        assert_eq!(bits, ArrayBits::new(false, true));
        assert_eq!(&buf[..], &[1, 3, 0, 2, b'h', b'i']);
        assert_eq!(FieldArray::decode(&buf, bits, &schema).unwrap(), array);
    }

    #[test]
    fn test_high_packing_layout() {
        let schema = profile_schema();
        let array = required_only().with_optional(1, 10u64).with_optional(6, 11u64);
        let (buf, bits) = array.encode(&schema).unwrap();

        assert_eq!(bits, ArrayBits::new(true, true));
        // required (4 + 5 bytes), bitfield 0b0100_0010, then values for ids 1, 6
        assert_eq!(&buf[9..], &[0b0100_0010, 0, 10, 0, 11]);
        assert_eq!(FieldArray::decode(&buf, bits, &schema).unwrap(), array);
    }

    #[test]
    fn test_normal_mode_decoding_is_accepted_for_any_schema() {
        // Decoding is driven only by the bits, regardless of what this
        // encoder would have picked.
        let schema = profile_schema();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 7, 0, 3, b'a', b'n', b'a']);
        buf.put_slice(&[2, 6, 0, 11, 1, 0, 10]);
        let decoded = FieldArray::decode(&buf, ArrayBits::new(false, true), &schema).unwrap();
        assert_eq!(
            decoded,
            required_only().with_optional(1, 10u64).with_optional(6, 11u64)
        );
    }

    #[test]
    fn test_optional_id_200_is_malformed() {
        let schema = profile_schema();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 7, 0, 3, b'a', b'n', b'a']);
        buf.put_slice(&[1, 200, 0, 1]);
        let result = FieldArray::decode(&buf, ArrayBits::new(false, true), &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_undeclared_optional_id_is_malformed() {
        let schema = profile_schema();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 7, 0, 0]);
        buf.put_slice(&[1, 9, 0, 1]);
        let result = FieldArray::decode(&buf, ArrayBits::new(false, true), &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_duplicate_optional_id_is_malformed() {
        let schema = profile_schema();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 7, 0, 0]);
        buf.put_slice(&[2, 1, 0, 1, 1, 0, 2]);
        let result = FieldArray::decode(&buf, ArrayBits::new(false, true), &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_bitfield_width_mismatch_is_malformed() {
        // Sparse schema declares ids 3 and 64: bit 5 of byte 0 is undeclared.
        let schema = sparse_schema();
        let mut buf = vec![0u8; 9];
        buf[0] = 1 << 5;
        let result = FieldArray::decode(&buf, ArrayBits::new(true, true), &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));

        // Empty bitfield while O is set.
        let buf = vec![0u8; 9];
        let result = FieldArray::decode(&buf, ArrayBits::new(true, true), &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));

        // Schema without optional fields cannot carry a bitfield.
        let result =
            FieldArray::decode(&[], ArrayBits::new(true, true), &FieldArraySchema::empty());
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_high_without_optional_is_malformed() {
        let result =
            FieldArray::decode(&[], ArrayBits::new(true, false), &FieldArraySchema::empty());
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_truncated_and_trailing_bytes() {
        let schema = profile_schema();
        let (buf, bits) = required_only().encode(&schema).unwrap();

        let result = FieldArray::decode(&buf[..buf.len() - 1], bits, &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));

        let mut longer = buf.clone();
        longer.put_u8(0);
        let result = FieldArray::decode(&longer, bits, &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_zero_count_is_malformed() {
        let schema = profile_schema();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 7, 0, 0, 0]);
        let result = FieldArray::decode(&buf, ArrayBits::new(false, true), &schema);
        assert!(matches!(result, Err(ProtocolError::MalformedFieldArray(_))));
    }

    #[test]
    fn test_every_optional_subset_roundtrips() {
        let schema = profile_schema();
        for mask in 0u16..256 {
            let mut array = required_only();
            for id in 0u8..8 {
                if mask & (1 << id) != 0 {
                    array = array.with_optional(id, id as u64 * 100);
                }
            }
            let (buf, bits) = array.encode(&schema).unwrap();
            assert_eq!(bits.has_optional, mask != 0, "mask {:#x}", mask);
            if !bits.has_optional {
                assert!(!bits.high_packed);
            }
            let decoded = FieldArray::decode(&buf, bits, &schema).unwrap();
            assert_eq!(
                decoded.optional.keys().collect::<Vec<_>>(),
                array.optional.keys().collect::<Vec<_>>()
            );
            assert_eq!(decoded, array);
        }
    }

    #[test]
    fn test_encode_rejects_undeclared_and_missing() {
        let schema = profile_schema();
        let result = required_only().with_optional(42, 1u64).encode(&schema);
        assert!(matches!(result, Err(ProtocolError::Encode(_))));

        let result = FieldArray::new(vec![Value::Int(1)]).encode(&schema);
        assert!(matches!(result, Err(ProtocolError::Encode(_))));
    }

    #[test]
    fn test_schema_rejects_out_of_range_id() {
        let optional = BTreeMap::from([(128, FieldSpec::new("x", FieldType::Bool))]);
        assert!(FieldArraySchema::new(vec![], optional).is_err());
    }

    #[test]
    fn test_get_by_name() {
        let schema = profile_schema();
        let array = required_only().with_optional(2, 5u64);
        assert_eq!(array.get(&schema, "name"), Some(&Value::from("ana")));
        assert_eq!(array.get(&schema, "opt2"), Some(&Value::Int(5)));
        assert_eq!(array.get(&schema, "opt3"), None);
        assert_eq!(array.get(&schema, "missing"), None);
    }

    fn arb_optional() -> impl Strategy<Value = BTreeMap<u8, Value>> {
        proptest::collection::btree_map(
            prop_oneof![0u8..8, Just(64u8), Just(127u8)],
            any::<u16>().prop_map(|v| Value::Int(v as u64)),
            0..11,
        )
    }

    proptest! {
        #[test]
        fn prop_roundtrip(id in any::<u32>(), name in "\\PC{0,24}", optional in arb_optional()) {
            let mut declared: BTreeMap<u8, FieldSpec> = (0u8..8)
                .map(|i| (i, FieldSpec::new(format!("opt{}", i), FieldType::Int(2))))
                .collect();
            declared.insert(64, FieldSpec::new("far", FieldType::Int(2)));
            declared.insert(127, FieldSpec::new("last", FieldType::Int(2)));
            let schema = FieldArraySchema::new(
                vec![
                    FieldSpec::new("id", FieldType::Int(4)),
                    FieldSpec::new("name", FieldType::Str),
                ],
                declared,
            ).unwrap();

            let array = FieldArray {
                required: vec![Value::Int(id as u64), Value::Str(name)],
                optional,
            };
            let (buf, bits) = array.encode(&schema).unwrap();
            prop_assert_eq!(bits.has_optional, !array.optional.is_empty());
            prop_assert_eq!(FieldArray::decode(&buf, bits, &schema).unwrap(), array);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(
            bytes in proptest::collection::vec(any::<u8>(), 0..64),
            h in any::<bool>(),
            o in any::<bool>(),
        ) {
            let _ = FieldArray::decode(&bytes, ArrayBits::new(h, o), &profile_schema());
        }
    }
}
