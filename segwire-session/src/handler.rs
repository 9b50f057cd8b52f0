//! Method and confirmation handlers.

use crate::error::SessionError;
use crate::session::Session;
use segwire_protocol::{FieldArray, MethodRef, Value};
use segwire_schema::{ConfirmationDescriptor, MethodDescriptor, Schema, State};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future type for handler return values.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type HandlerResult = Result<Reply, SessionError>;

/// What a handler sends back on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub fields: FieldArray,
    /// State the session moves to once the reply is sent.
    pub state: Option<State>,
}

impl Reply {
    pub fn new(fields: FieldArray) -> Self {
        Self {
            fields,
            state: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: impl Into<State>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// Everything a handler learns about the call it serves.
pub struct CallContext {
    pub(crate) session: Session,
    pub(crate) transaction_id: u8,
    pub(crate) method: Arc<MethodDescriptor>,
    pub params: FieldArray,
    /// Instance id for dynamic methods.
    pub entity_id: Option<Value>,
    /// Session state at dispatch time.
    pub state: State,
}

impl CallContext {
    pub fn transaction_id(&self) -> u8 {
        self.transaction_id
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Looks up a parameter by field name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(self.method.params.schema(), name)
    }

    /// Asks the caller to confirm and waits for the response. Only this
    /// call's transaction is suspended.
    pub async fn confirm(
        &self,
        confirmation: &str,
        fields: FieldArray,
    ) -> Result<FieldArray, SessionError> {
        self.session
            .request_confirmation(self.transaction_id, confirmation, fields)
            .await
    }

    /// Builds the application error declared under `name` for this method.
    pub fn error(&self, name: &str, message: impl Into<String>) -> SessionError {
        match self.method.error_code(name) {
            Some(code) => SessionError::application(code, message),
            None => SessionError::internal(format!(
                "method '{}' does not declare error '{}'",
                self.method.name, name
            )),
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("transaction_id", &self.transaction_id)
            .field("method", &self.method.name)
            .field("params", &self.params)
            .field("entity_id", &self.entity_id)
            .field("state", &self.state)
            .finish()
    }
}

/// Serves one method on the server side.
pub trait MethodHandler: Send + Sync {
    fn call(&self, ctx: CallContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> MethodHandler for F
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(ctx))
    }
}

/// Handlers keyed by the method they serve.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MethodRef, Arc<dyn MethodHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: MethodRef, handler: impl MethodHandler + 'static) {
        self.handlers.insert(method, Arc::new(handler));
    }

    /// Registers a handler for the schema method called `name`
    /// (`entity.method` for entity methods).
    pub fn register_named(
        &mut self,
        schema: &Schema,
        name: &str,
        handler: impl MethodHandler + 'static,
    ) -> Result<(), SessionError> {
        let descriptor = schema
            .method_by_name(name)
            .ok_or_else(|| SessionError::UnknownMethod(name.to_string()))?;
        self.register(descriptor.method, handler);
        Ok(())
    }

    pub fn get(&self, method: MethodRef) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(&method).cloned()
    }

    pub fn contains(&self, method: MethodRef) -> bool {
        self.handlers.contains_key(&method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A `ConfReq` delivered to the client.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub transaction_id: u8,
    pub confirmation: Arc<ConfirmationDescriptor>,
    pub fields: FieldArray,
}

impl ConfirmationRequest {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(self.confirmation.request.schema(), name)
    }
}

/// Answers confirmation requests on the client side. An `Err` sends no
/// response; the server's confirmation timeout then applies.
pub trait ConfirmationHandler: Send + Sync {
    fn call(
        &self,
        request: ConfirmationRequest,
    ) -> BoxFuture<'static, Result<FieldArray, SessionError>>;
}

impl<F, Fut> ConfirmationHandler for F
where
    F: Fn(ConfirmationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FieldArray, SessionError>> + Send + 'static,
{
    fn call(
        &self,
        request: ConfirmationRequest,
    ) -> BoxFuture<'static, Result<FieldArray, SessionError>> {
        Box::pin(self(request))
    }
}
