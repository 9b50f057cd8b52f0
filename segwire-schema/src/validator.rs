//! Field validators.
//!
//! Validators are declared next to a field in the schema and compiled once:
//!
//! ```yaml
//! - name: email
//!   type: str
//!   validate:
//!     length: "3..254"
//!     pattern: { regex: "[^@]+@[^@]+", case_insensitive: true }
//! - name: tags
//!   type: { list: { element: str, count_len: 1 } }
//!   validate:
//!     length: "..8"
//!     elements: { length: "1+" }
//! ```
//!
//! Supported checks:
//!
//! - `range: [min, max]` - inclusive bounds on an integer
//! - `length` - `"a..b"`, `"..b"`, `"a+"` or `"a"`; counts codepoints for
//!   strings, octets for binary, elements for lists
//! - `pattern` - a regex that must match the whole string
//! - `elements` - validators applied to each list member

use crate::error::{SchemaError, ValidationError};
use regex::{Regex, RegexBuilder};
use segwire_protocol::{FieldArray, FieldArraySchema, FieldType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

/// Validator declaration as written in the schema file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorsRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[u64; 2]>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<PatternRaw>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Box<ValidatorsRaw>>,
}

/// A pattern, either bare or with flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternRaw {
    Plain(String),
    Flagged {
        regex: String,
        #[serde(default)]
        case_insensitive: bool,
        #[serde(default)]
        multiline: bool,
        #[serde(default)]
        dot_all: bool,
    },
}

/// Inclusive length bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthBound {
    pub min: usize,
    pub max: Option<usize>,
}

impl LengthBound {
    /// Parses `"a..b"`, `"..b"`, `"a+"` or `"a"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let num = |part: &str| -> Result<usize, String> {
            part.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid length bound '{}'", s))
        };

        let bound = if let Some((lo, hi)) = s.split_once("..") {
            let min = if lo.trim().is_empty() { 0 } else { num(lo)? };
            Self {
                min,
                max: Some(num(hi)?),
            }
        } else if let Some(lo) = s.strip_suffix('+') {
            Self {
                min: num(lo)?,
                max: None,
            }
        } else {
            let exact = num(s)?;
            Self {
                min: exact,
                max: Some(exact),
            }
        };

        if let Some(max) = bound.max {
            if max < bound.min {
                return Err(format!("empty length range '{}'", s));
            }
        }
        Ok(bound)
    }

    pub fn contains(&self, len: usize) -> bool {
        len >= self.min && self.max.map_or(true, |max| len <= max)
    }
}

impl fmt::Display for LengthBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{}", max),
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}+", self.min),
        }
    }
}

/// Compiled validators for one field.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    range: Option<RangeInclusive<u64>>,
    length: Option<LengthBound>,
    pattern: Option<Regex>,
    elements: Option<Box<Validator>>,
}

impl Validator {
    /// Compiles `raw` for a field of type `ty`. Checks that do not apply to
    /// the type are rejected.
    pub fn compile(field: &str, ty: &FieldType, raw: &ValidatorsRaw) -> Result<Self, SchemaError> {
        let reject = |reason: &str| SchemaError::InvalidValidator {
            field: field.to_string(),
            reason: format!("{} on a {} field", reason, ty),
        };

        let range = match raw.range {
            Some([min, max]) => {
                if !matches!(ty, FieldType::Int(_)) {
                    return Err(reject("range"));
                }
                if max < min {
                    return Err(SchemaError::InvalidValidator {
                        field: field.to_string(),
                        reason: format!("empty range [{}, {}]", min, max),
                    });
                }
                Some(min..=max)
            }
            None => None,
        };

        let length = match &raw.length {
            Some(spec) => {
                if !matches!(ty, FieldType::Str | FieldType::Bin | FieldType::List { .. }) {
                    return Err(reject("length"));
                }
                Some(LengthBound::parse(spec).map_err(|reason| {
                    SchemaError::InvalidValidator {
                        field: field.to_string(),
                        reason,
                    }
                })?)
            }
            None => None,
        };

        let pattern = match &raw.pattern {
            Some(pattern) => {
                if !matches!(ty, FieldType::Str) {
                    return Err(reject("pattern"));
                }
                Some(compile_pattern(field, pattern)?)
            }
            None => None,
        };

        let elements = match (&raw.elements, ty) {
            (Some(inner), FieldType::List { element, .. }) => Some(Box::new(Self::compile(
                &format!("{}[]", field),
                element,
                inner,
            )?)),
            (Some(_), _) => return Err(reject("elements")),
            (None, _) => None,
        };

        Ok(Self {
            range,
            length,
            pattern,
            elements,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_none()
            && self.length.is_none()
            && self.pattern.is_none()
            && self.elements.is_none()
    }

    /// Checks `value`, reporting the first failure under `path`.
    pub fn validate(&self, path: &str, value: &Value) -> Result<(), ValidationError> {
        if let Some(range) = &self.range {
            if let Value::Int(v) = value {
                if !range.contains(v) {
                    return Err(ValidationError::new(
                        path,
                        format!("{} outside [{}, {}]", v, range.start(), range.end()),
                    ));
                }
            }
        }

        if let Some(length) = &self.length {
            let len = match value {
                Value::Str(s) => Some(s.chars().count()),
                Value::Bin(b) => Some(b.len()),
                Value::List(items) => Some(items.len()),
                _ => None,
            };
            if let Some(len) = len {
                if !length.contains(len) {
                    return Err(ValidationError::new(
                        path,
                        format!("length {} outside {}", len, length),
                    ));
                }
            }
        }

        if let (Some(pattern), Value::Str(s)) = (&self.pattern, value) {
            if !pattern.is_match(s) {
                return Err(ValidationError::new(path, "does not match pattern"));
            }
        }

        if let (Some(elements), Value::List(items)) = (&self.elements, value) {
            for (i, item) in items.iter().enumerate() {
                elements.validate(&format!("{}[{}]", path, i), item)?;
            }
        }

        Ok(())
    }
}

fn compile_pattern(field: &str, raw: &PatternRaw) -> Result<Regex, SchemaError> {
    let (source, case_insensitive, multiline, dot_all) = match raw {
        PatternRaw::Plain(regex) => (regex, false, false, false),
        PatternRaw::Flagged {
            regex,
            case_insensitive,
            multiline,
            dot_all,
        } => (regex, *case_insensitive, *multiline, *dot_all),
    };
    // \A and \z stay whole-string anchors under multiline mode.
    RegexBuilder::new(&format!(r"\A(?:{})\z", source))
        .case_insensitive(case_insensitive)
        .multi_line(multiline)
        .dot_matches_new_line(dot_all)
        .build()
        .map_err(|source| SchemaError::Pattern {
            field: field.to_string(),
            source,
        })
}

/// Validators for every field of a field array.
#[derive(Debug, Clone, Default)]
pub struct ArrayValidator {
    required: Vec<Option<Validator>>,
    optional: BTreeMap<u8, Validator>,
}

impl ArrayValidator {
    pub fn new(required: Vec<Option<Validator>>, optional: BTreeMap<u8, Validator>) -> Self {
        Self { required, optional }
    }

    /// Returns a copy with `first` validating a new leading required field.
    pub fn with_leading(&self, first: Option<Validator>) -> Self {
        let mut required = Vec::with_capacity(self.required.len() + 1);
        required.push(first);
        required.extend(self.required.iter().cloned());
        Self {
            required,
            optional: self.optional.clone(),
        }
    }

    /// Validates the values of `array`, which must already be
    /// structurally valid against `schema`.
    pub fn validate(
        &self,
        schema: &FieldArraySchema,
        array: &FieldArray,
    ) -> Result<(), ValidationError> {
        for ((spec, value), validator) in schema
            .required()
            .iter()
            .zip(&array.required)
            .zip(&self.required)
        {
            if let Some(validator) = validator {
                validator.validate(&spec.name, value)?;
            }
        }

        for (id, value) in &array.optional {
            let declared = (self.optional.get(id), schema.optional().get(id));
            if let (Some(validator), Some(spec)) = declared {
                validator.validate(&spec.name, value)?;
            }
        }

        Ok(())
    }
}
