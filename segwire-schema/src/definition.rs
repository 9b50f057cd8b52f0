//! Schema definition types.
//!
//! Schemas are written in YAML or JSON and compiled once into an immutable
//! [`Schema`] shared by every session:
//!
//! ```yaml
//! states: [awaiting_login, normal]
//! default_state: awaiting_login
//! confirmations:
//!   - id: 3
//!     name: confirm_terms
//!     request: { required: [{ name: terms_version, type: { int: 2 } }] }
//!     response: { required: [{ name: accepted, type: bool }] }
//! methods:
//!   - id: 1
//!     name: log_in
//!     states: [awaiting_login]
//!     params:
//!       required:
//!         - { name: email, type: str }
//!         - { name: password, type: str }
//!     errors: { bad_credentials: 2 }
//!     rate_limit: { count: 3, window_ms: 1000 }
//! entities:
//!   - id: 0
//!     name: user
//!     id_field: { name: id, type: { int: 8 } }
//!     get_by_id: static
//!     fields: { required: [{ name: email, type: str }] }
//! ```

use crate::dispatch::DispatchTable;
use crate::error::{SchemaError, ValidationError};
use crate::rate_limit::RateLimit;
use crate::state::{is_permitted, State, StateMachine};
use crate::validator::{ArrayValidator, Validator, ValidatorsRaw};
use segwire_protocol::{
    Direction, Entity, EntityLayout, ErrorCode, FieldArray, FieldArraySchema, FieldSpec,
    FieldType, MethodRef, Rejection, SchemaResolver, Value, MAX_CONFIRMATION_ID,
    MAX_ENTITY_TYPE, MAX_METHOD_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Method id reserved for the get-entity-by-id pseudo-method.
pub const GET_BY_ID_METHOD: u8 = MAX_METHOD_ID;

/// Name of the implicit state of schemas that declare none.
pub const IMPLICIT_STATE: &str = "default";

/// A field as written in the schema file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRaw {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: FieldType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<ValidatorsRaw>,
}

/// A field array as written in the schema file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldArrayRaw {
    #[serde(default)]
    pub required: Vec<FieldRaw>,

    #[serde(default)]
    pub optional: BTreeMap<u8, FieldRaw>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRaw {
    pub id: u8,
    pub name: String,

    #[serde(default)]
    pub params: FieldArrayRaw,

    #[serde(default)]
    pub returns: FieldArrayRaw,

    /// Application error names and their codes.
    #[serde(default)]
    pub errors: BTreeMap<String, u16>,

    /// States in which the method may be called. Empty means any.
    #[serde(default)]
    pub states: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// Confirmations the method's handler may request.
    #[serde(default)]
    pub confirmations: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRaw {
    pub id: u8,
    pub name: String,

    #[serde(default)]
    pub request: FieldArrayRaw,

    #[serde(default)]
    pub response: FieldArrayRaw,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// How an entity exposes the get-by-id pseudo-method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GetById {
    #[default]
    None,
    /// Static method 127, the id is its single parameter.
    Static,
    /// Dynamic method 127, the id travels in the segment.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRaw {
    /// Entity type id.
    pub id: u8,
    pub name: String,
    pub id_field: FieldRaw,

    #[serde(default)]
    pub fields: FieldArrayRaw,

    #[serde(default)]
    pub get_by_id: GetById,

    #[serde(default)]
    pub static_methods: Vec<MethodRaw>,

    #[serde(default)]
    pub dynamic_methods: Vec<MethodRaw>,
}

/// Raw schema as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRaw {
    #[serde(default)]
    pub states: Vec<String>,

    /// Defaults to the first declared state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_state: Option<String>,

    #[serde(default)]
    pub methods: Vec<MethodRaw>,

    #[serde(default)]
    pub confirmations: Vec<ConfirmationRaw>,

    #[serde(default)]
    pub entities: Vec<EntityRaw>,
}

/// A field array layout together with its validators.
#[derive(Debug, Clone, Default)]
pub struct FieldArrayDescriptor {
    schema: Arc<FieldArraySchema>,
    validator: ArrayValidator,
}

impl FieldArrayDescriptor {
    pub fn new(schema: FieldArraySchema, validator: ArrayValidator) -> Self {
        Self {
            schema: Arc::new(schema),
            validator,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn compile(raw: &FieldArrayRaw) -> Result<Self, SchemaError> {
        let mut names = HashSet::new();
        let mut check_name = |name: &str| {
            if names.insert(name.to_string()) {
                Ok(())
            } else {
                Err(SchemaError::invalid(format!("duplicate field name '{}'", name)))
            }
        };

        let mut required = Vec::with_capacity(raw.required.len());
        let mut required_validators = Vec::with_capacity(raw.required.len());
        for field in &raw.required {
            check_name(&field.name)?;
            required_validators.push(compile_validator(field)?);
            required.push(FieldSpec::new(&field.name, field.ty.clone()));
        }

        let mut optional = BTreeMap::new();
        let mut optional_validators = BTreeMap::new();
        for (id, field) in &raw.optional {
            check_name(&field.name)?;
            if let Some(validator) = compile_validator(field)? {
                optional_validators.insert(*id, validator);
            }
            optional.insert(*id, FieldSpec::new(&field.name, field.ty.clone()));
        }

        Ok(Self::new(
            FieldArraySchema::new(required, optional)?,
            ArrayValidator::new(required_validators, optional_validators),
        ))
    }

    pub fn schema(&self) -> &Arc<FieldArraySchema> {
        &self.schema
    }

    pub fn validate(&self, array: &FieldArray) -> Result<(), ValidationError> {
        self.validator.validate(&self.schema, array)
    }
}

fn compile_validator(field: &FieldRaw) -> Result<Option<Validator>, SchemaError> {
    match &field.validate {
        Some(raw) => {
            let validator = Validator::compile(&field.name, &field.ty, raw)?;
            Ok((!validator.is_empty()).then_some(validator))
        }
        None => Ok(None),
    }
}

/// A compiled, callable method.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    /// Qualified name: `log_in` for globals, `user.rename` for entity methods.
    pub name: String,
    pub method: MethodRef,
    pub params: FieldArrayDescriptor,
    pub returns: FieldArrayDescriptor,
    pub errors: BTreeMap<u16, String>,
    pub states: BTreeSet<State>,
    pub rate_limit: Option<RateLimit>,
    pub confirmations: BTreeSet<u8>,
    /// Set for the engine-served get-by-id pseudo-method.
    pub get_by_id: bool,
}

impl MethodDescriptor {
    pub fn is_permitted(&self, current: &State) -> bool {
        is_permitted(&self.states, current)
    }

    pub fn declares_error(&self, code: u16) -> bool {
        self.errors.contains_key(&code)
    }

    /// Looks up an application error code by name.
    pub fn error_code(&self, name: &str) -> Option<u16> {
        self.errors
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(code, _)| *code)
    }

    pub fn may_confirm(&self, confirmation: u8) -> bool {
        self.confirmations.contains(&confirmation)
    }

    fn compile(
        raw: &MethodRaw,
        method: MethodRef,
        name: String,
        states: &StateMachine,
        confirmations: &BTreeMap<u8, Arc<ConfirmationDescriptor>>,
    ) -> Result<Self, SchemaError> {
        if raw.id >= GET_BY_ID_METHOD {
            return Err(SchemaError::invalid(format!(
                "method '{}' uses id {}; ids above {} are reserved",
                name,
                raw.id,
                GET_BY_ID_METHOD - 1
            )));
        }

        let mut errors = BTreeMap::new();
        for (error_name, code) in &raw.errors {
            if *code >= ErrorCode::RESERVED_START {
                return Err(SchemaError::invalid(format!(
                    "error '{}' of method '{}' uses reserved code {:#06x}",
                    error_name, name, code
                )));
            }
            if errors.insert(*code, error_name.clone()).is_some() {
                return Err(SchemaError::invalid(format!(
                    "method '{}' declares error code {} twice",
                    name, code
                )));
            }
        }

        let mut permitted = BTreeSet::new();
        for state in &raw.states {
            let state = State::from(state.as_str());
            if !states.has_state(&state) {
                return Err(SchemaError::invalid(format!(
                    "method '{}' permits undeclared state '{}'",
                    name, state
                )));
            }
            permitted.insert(state);
        }

        for id in &raw.confirmations {
            if !confirmations.contains_key(id) {
                return Err(SchemaError::invalid(format!(
                    "method '{}' references undeclared confirmation {}",
                    name, id
                )));
            }
        }

        Ok(Self {
            params: FieldArrayDescriptor::compile(&raw.params)?,
            returns: FieldArrayDescriptor::compile(&raw.returns)?,
            name,
            method,
            errors,
            states: permitted,
            rate_limit: raw.rate_limit,
            confirmations: raw.confirmations.iter().copied().collect(),
            get_by_id: false,
        })
    }
}

/// A nested request/response exchange a handler may start.
#[derive(Debug, Clone)]
pub struct ConfirmationDescriptor {
    pub id: u8,
    pub name: String,
    pub request: FieldArrayDescriptor,
    pub response: FieldArrayDescriptor,
    /// Overrides the session's default confirmation timeout.
    pub timeout: Option<Duration>,
}

/// A compiled entity type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub type_id: u8,
    pub name: String,
    pub fields: FieldArrayDescriptor,
    pub get_by_id: GetById,
    layout: EntityLayout,
    id_validator: Option<Validator>,
}

impl EntityDescriptor {
    pub fn id_field(&self) -> &FieldSpec {
        &self.layout.id
    }

    pub fn layout(&self) -> &EntityLayout {
        &self.layout
    }

    pub fn validate_id(&self, id: &Value) -> Result<(), ValidationError> {
        match &self.id_validator {
            Some(validator) => validator.validate(&self.layout.id.name, id),
            None => Ok(()),
        }
    }

    pub fn validate(&self, entity: &Entity) -> Result<(), ValidationError> {
        self.validate_id(&entity.id)?;
        self.fields.validate(&entity.fields)
    }

    /// Builds the return array of get-by-id: the id, then the fields.
    pub fn get_by_id_return(&self, entity: &Entity) -> FieldArray {
        let mut required = Vec::with_capacity(1 + entity.fields.required.len());
        required.push(entity.id.clone());
        required.extend(entity.fields.required.iter().cloned());
        FieldArray {
            required,
            optional: entity.fields.optional.clone(),
        }
    }

    fn get_by_id_descriptor(&self) -> Result<Option<MethodDescriptor>, SchemaError> {
        let method = match self.get_by_id {
            GetById::None => return Ok(None),
            GetById::Static => MethodRef::static_method(self.type_id, GET_BY_ID_METHOD),
            GetById::Dynamic => MethodRef::dynamic_method(self.type_id, GET_BY_ID_METHOD),
        };

        let params = match self.get_by_id {
            GetById::Static => FieldArrayDescriptor::new(
                FieldArraySchema::new(vec![self.layout.id.clone()], BTreeMap::new())?,
                ArrayValidator::new(vec![self.id_validator.clone()], BTreeMap::new()),
            ),
            _ => FieldArrayDescriptor::empty(),
        };

        let fields = self.fields.schema();
        let mut required = vec![self.layout.id.clone()];
        required.extend(fields.required().iter().cloned());
        let returns = FieldArrayDescriptor::new(
            FieldArraySchema::new(required, fields.optional().clone())?,
            self.fields.validator.with_leading(self.id_validator.clone()),
        );

        Ok(Some(MethodDescriptor {
            name: format!("{}.get_by_id", self.name),
            method,
            params,
            returns,
            errors: BTreeMap::new(),
            states: BTreeSet::new(),
            rate_limit: None,
            confirmations: BTreeSet::new(),
            get_by_id: true,
        }))
    }
}

/// A validated, indexed schema.
#[derive(Debug, Clone)]
pub struct Schema {
    states: StateMachine,
    dispatch: DispatchTable,
    confirmations: BTreeMap<u8, Arc<ConfirmationDescriptor>>,
    entities: BTreeMap<u8, Arc<EntityDescriptor>>,
}

impl Schema {
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let raw: SchemaRaw = serde_json::from_str(json)?;
        Self::compile(&raw)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SchemaError> {
        let raw: SchemaRaw = serde_yaml::from_str(yaml)?;
        Self::compile(&raw)
    }

    /// Loads a schema file; `.json` files are parsed as JSON, anything else
    /// as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Validates and indexes a raw schema.
    pub fn compile(raw: &SchemaRaw) -> Result<Self, SchemaError> {
        let states = compile_states(raw)?;

        let mut confirmations = BTreeMap::new();
        let mut confirmation_names = HashSet::new();
        for c in &raw.confirmations {
            if c.id > MAX_CONFIRMATION_ID {
                return Err(SchemaError::invalid(format!(
                    "confirmation '{}' id {} exceeds {}",
                    c.name, c.id, MAX_CONFIRMATION_ID
                )));
            }
            if !confirmation_names.insert(c.name.as_str()) {
                return Err(SchemaError::invalid(format!(
                    "duplicate confirmation name '{}'",
                    c.name
                )));
            }
            let descriptor = ConfirmationDescriptor {
                id: c.id,
                name: c.name.clone(),
                request: FieldArrayDescriptor::compile(&c.request)?,
                response: FieldArrayDescriptor::compile(&c.response)?,
                timeout: c.timeout_ms.map(Duration::from_millis),
            };
            if confirmations.insert(c.id, Arc::new(descriptor)).is_some() {
                return Err(SchemaError::invalid(format!(
                    "duplicate confirmation id {}",
                    c.id
                )));
            }
        }

        let mut dispatch = DispatchTable::new();
        for m in &raw.methods {
            let descriptor = MethodDescriptor::compile(
                m,
                MethodRef::global(m.id),
                m.name.clone(),
                &states,
                &confirmations,
            )?;
            dispatch.insert(descriptor)?;
        }

        let mut entities = BTreeMap::new();
        let mut entity_names = HashSet::new();
        for e in &raw.entities {
            if e.id > MAX_ENTITY_TYPE {
                return Err(SchemaError::invalid(format!(
                    "entity '{}' type id {} exceeds {}",
                    e.name, e.id, MAX_ENTITY_TYPE
                )));
            }
            if !entity_names.insert(e.name.as_str()) {
                return Err(SchemaError::invalid(format!(
                    "duplicate entity name '{}'",
                    e.name
                )));
            }
            if !matches!(e.id_field.ty, FieldType::Int(_) | FieldType::Str | FieldType::Bin) {
                return Err(SchemaError::invalid(format!(
                    "entity '{}' id must be an int, str or bin, not {}",
                    e.name, e.id_field.ty
                )));
            }
            e.id_field.ty.check()?;

            let fields = FieldArrayDescriptor::compile(&e.fields)?;
            let descriptor = EntityDescriptor {
                type_id: e.id,
                name: e.name.clone(),
                layout: EntityLayout {
                    id: FieldSpec::new(&e.id_field.name, e.id_field.ty.clone()),
                    fields: fields.schema().clone(),
                },
                fields,
                get_by_id: e.get_by_id,
                id_validator: compile_validator(&e.id_field)?,
            };

            for m in &e.static_methods {
                dispatch.insert(MethodDescriptor::compile(
                    m,
                    MethodRef::static_method(e.id, m.id),
                    format!("{}.{}", e.name, m.name),
                    &states,
                    &confirmations,
                )?)?;
            }
            for m in &e.dynamic_methods {
                dispatch.insert(MethodDescriptor::compile(
                    m,
                    MethodRef::dynamic_method(e.id, m.id),
                    format!("{}.{}", e.name, m.name),
                    &states,
                    &confirmations,
                )?)?;
            }
            if let Some(get) = descriptor.get_by_id_descriptor()? {
                dispatch.insert(get)?;
            }

            if entities.insert(e.id, Arc::new(descriptor)).is_some() {
                return Err(SchemaError::invalid(format!("duplicate entity type id {}", e.id)));
            }
        }

        tracing::debug!(
            methods = dispatch.len(),
            entities = entities.len(),
            confirmations = confirmations.len(),
            "compiled schema"
        );

        Ok(Self {
            states,
            dispatch,
            confirmations,
            entities,
        })
    }

    pub fn states(&self) -> &StateMachine {
        &self.states
    }

    pub fn default_state(&self) -> &State {
        self.states.default_state()
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn method(&self, method: MethodRef) -> Option<&Arc<MethodDescriptor>> {
        self.dispatch.get(method)
    }

    pub fn method_by_name(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.dispatch.by_name(name)
    }

    pub fn confirmation(&self, id: u8) -> Option<&Arc<ConfirmationDescriptor>> {
        self.confirmations.get(&id)
    }

    pub fn confirmation_by_name(&self, name: &str) -> Option<&Arc<ConfirmationDescriptor>> {
        self.confirmations.values().find(|c| c.name == name)
    }

    pub fn entity(&self, type_id: u8) -> Option<&Arc<EntityDescriptor>> {
        self.entities.get(&type_id)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<&Arc<EntityDescriptor>> {
        self.entities.values().find(|e| e.name == name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }
}

fn compile_states(raw: &SchemaRaw) -> Result<StateMachine, SchemaError> {
    if raw.states.is_empty() {
        if let Some(default) = &raw.default_state {
            return Err(SchemaError::invalid(format!(
                "default state '{}' given without a states list",
                default
            )));
        }
        return Ok(StateMachine::single(State::from(IMPLICIT_STATE)));
    }

    let mut states = BTreeSet::new();
    for s in &raw.states {
        if !states.insert(State::from(s.as_str())) {
            return Err(SchemaError::invalid(format!("duplicate state '{}'", s)));
        }
    }
    let default = match &raw.default_state {
        Some(s) => State::from(s.as_str()),
        None => State::from(raw.states[0].as_str()),
    };
    StateMachine::new(states, default)
}

/// Resolves what the schema alone can answer: invoked method parameters
/// and entity layouts.
impl SchemaResolver for Schema {
    fn method_params(&self, method: MethodRef) -> Result<Arc<FieldArraySchema>, Rejection> {
        self.dispatch
            .resolve(Direction::Serverbound, method)
            .map(|m| m.params.schema().clone())
    }

    fn entity_layout(&self, entity_type: u8) -> Option<EntityLayout> {
        self.entities.get(&entity_type).map(|e| e.layout.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = include_str!("../../schemas/account.yaml");

    fn account() -> Schema {
        Schema::from_yaml(ACCOUNT).unwrap()
    }

    fn compile_yaml(yaml: &str) -> Result<Schema, SchemaError> {
        Schema::from_yaml(yaml)
    }

    #[test]
    fn test_parse_account_schema() {
        let schema = account();
        assert_eq!(schema.default_state().as_str(), "awaiting_login");
        assert!(schema.states().has_state(&State::from("normal")));

        let sign_up = schema.method_by_name("sign_up").unwrap();
        assert_eq!(sign_up.method, MethodRef::global(0));
        assert_eq!(sign_up.params.schema().required().len(), 2);
        assert_eq!(sign_up.error_code("email_taken"), Some(1));
        assert!(sign_up.may_confirm(3));
        assert!(sign_up.may_confirm(7));
        assert!(!sign_up.is_permitted(&State::from("normal")));

        let echo = schema.method_by_name("echo").unwrap();
        assert!(echo.is_permitted(&State::from("normal")));
        assert!(echo.is_permitted(&State::from("awaiting_login")));

        let rename = schema.method_by_name("user.rename").unwrap();
        assert_eq!(rename.method, MethodRef::dynamic_method(0, 0));

        assert_eq!(
            schema.confirmation(7).unwrap().timeout,
            Some(Duration::from_secs(60))
        );
        assert_eq!(schema.confirmation(3).unwrap().timeout, None);
    }

    #[test]
    fn test_get_by_id_layout() {
        let schema = account();
        let get = schema
            .method(MethodRef::static_method(0, GET_BY_ID_METHOD))
            .unwrap();
        assert!(get.get_by_id);
        assert_eq!(get.name, "user.get_by_id");
        assert_eq!(get.params.schema().required()[0].name, "id");

        let names: Vec<_> = get
            .returns
            .schema()
            .required()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "email"]);
        assert_eq!(get.returns.schema().optional().len(), 2);

        assert!(schema
            .method(MethodRef::dynamic_method(0, GET_BY_ID_METHOD))
            .is_none());

        let user = schema.entity(0).unwrap();
        let entity = Entity::new(
            0,
            9u64,
            FieldArray::new(vec![Value::from("a@b")]).with_optional(0, "Ana"),
        );
        let ret = user.get_by_id_return(&entity);
        assert!(get.returns.validate(&ret).is_ok());
        assert_eq!(ret.required, vec![Value::Int(9), Value::from("a@b")]);
    }

    #[test]
    fn test_validation_through_descriptors() {
        let schema = account();
        let sign_up = schema.method_by_name("sign_up").unwrap();

        let ok = FieldArray::new(vec![Value::from("ana@example.com"), Value::from("hunter22")]);
        assert!(sign_up.params.validate(&ok).is_ok());

        let bad = FieldArray::new(vec![Value::from("ana"), Value::from("hunter22")]);
        assert_eq!(sign_up.params.validate(&bad).unwrap_err().field, "email");

        let user = schema.entity_by_name("user").unwrap();
        let tags = Value::List(vec![Value::from("ok"), Value::from("")]);
        let entity = Entity::new(
            0,
            1u64,
            FieldArray::new(vec![Value::from("a@b")]).with_optional(1, tags),
        );
        assert_eq!(user.validate(&entity).unwrap_err().field, "tags[1]");
    }

    #[test]
    fn test_schema_resolver() {
        let schema = account();
        let params = schema.method_params(MethodRef::global(1)).unwrap();
        assert_eq!(params.required()[0].name, "email");
        assert_eq!(
            schema.method_params(MethodRef::global(50)),
            Err(Rejection::UnknownMethod)
        );
        assert_eq!(schema.entity_layout(0).unwrap().id.ty, FieldType::Int(8));
        assert!(schema.entity_layout(1).is_none());
    }

    #[test]
    fn test_field_types_in_yaml() {
        let schema = account();
        let terms = schema.confirmation(3).unwrap();
        assert_eq!(terms.request.schema().required()[0].ty, FieldType::Int(2));
        assert_eq!(terms.response.schema().required()[0].ty, FieldType::Bool);

        let user = schema.entity_layout(0).unwrap();
        assert_eq!(
            user.fields.optional()[&1].ty,
            FieldType::list(FieldType::Str, 1)
        );

        let schema = compile_yaml(
            r#"
methods:
  - id: 0
    name: m
    params:
      required:
        - { name: xs, type: { list: { element: { int: 4 }, count_len: 2 } } }
"#,
        )
        .unwrap();
        let params = schema.method_params(MethodRef::global(0)).unwrap();
        assert_eq!(
            params.required()[0].ty,
            FieldType::list(FieldType::Int(4), 2)
        );
    }

    #[test]
    fn test_json_schema() {
        let json = r#"{
            "methods": [
                {"id": 0, "name": "ping", "returns": {"optional": {"5": {"name": "note", "type": "str"}}}}
            ]
        }"#;
        let schema = Schema::from_json(json).unwrap();
        assert_eq!(schema.default_state().as_str(), IMPLICIT_STATE);
        let ping = schema.method(MethodRef::global(0)).unwrap();
        assert_eq!(ping.returns.schema().optional()[&5].name, "note");
    }

    #[test]
    fn test_reserved_method_id() {
        let result = compile_yaml("methods: [{ id: 127, name: get }]");
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_duplicate_method_id() {
        let result = compile_yaml(
            "methods: [{ id: 1, name: a }, { id: 1, name: b }]",
        );
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_duplicate_field_name() {
        let result = compile_yaml(
            r#"
methods:
  - id: 0
    name: a
    params:
      required: [{ name: x, type: bool }]
      optional: { 0: { name: x, type: bool } }
"#,
        );
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_optional_id_out_of_range() {
        let result = compile_yaml(
            "methods: [{ id: 0, name: a, params: { optional: { 200: { name: x, type: bool } } } }]",
        );
        assert!(matches!(result, Err(SchemaError::Layout(_))));
    }

    #[test]
    fn test_undeclared_state() {
        let result = compile_yaml(
            "states: [a]\nmethods: [{ id: 0, name: m, states: [b] }]",
        );
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));

        let result = compile_yaml("states: [a]\ndefault_state: b");
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_undeclared_confirmation() {
        let result = compile_yaml("methods: [{ id: 0, name: m, confirmations: [4] }]");
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_confirmation_id_range() {
        let result = compile_yaml("confirmations: [{ id: 16, name: c }]");
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_entity_type_range() {
        let result = compile_yaml(
            "entities: [{ id: 64, name: e, id_field: { name: id, type: { int: 4 } } }]",
        );
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_reserved_error_code() {
        let result = compile_yaml("methods: [{ id: 0, name: m, errors: { oops: 65281 } }]");
        assert!(matches!(result, Err(SchemaError::Invalid { .. })));
    }

    #[test]
    fn test_bad_pattern() {
        let result = compile_yaml(
            r#"methods: [{ id: 0, name: m, params: { required: [{ name: s, type: str, validate: { pattern: "[" } }] } }]"#,
        );
        assert!(matches!(result, Err(SchemaError::Pattern { .. })));
    }
}
