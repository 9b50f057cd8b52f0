//! One session per connection.
//!
//! A session runs two tasks over its stream: a reader that decodes inbound
//! segments strictly in arrival order, and a writer that puts whole encoded
//! segments on the wire one at a time. Everything the two sides of the
//! engine share (transactions, state, rate limiters, entity cache) lives in
//! one mutex that is never held across an `.await`.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::handler::{
    CallContext, ConfirmationHandler, ConfirmationRequest, HandlerRegistry, HandlerResult, Reply,
};
use crate::transaction::{Origin, Phase, TransactionManager};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use segwire_protocol::{
    ClientboundSegment, Direction, Entity, EntityLayout, ErrorCode, FieldArray, FieldArraySchema,
    FieldType, Inbound, InvokeMethod, MethodError, MethodRef, ProtocolError, Rejection,
    SchemaResolver, SegmentDecoder, SegmentEncoder, SegmentKind, ServerboundSegment, Value,
};
use segwire_schema::{MethodDescriptor, RateLimiters, RateScope, Schema, State, ValidationError};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;

/// Which end of the connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Direction of the segments this side receives.
    pub fn inbound(self) -> Direction {
        match self {
            Role::Client => Direction::Clientbound,
            Role::Server => Direction::Serverbound,
        }
    }

    pub fn outbound(self) -> Direction {
        self.inbound().reverse()
    }
}

/// A method invocation issued by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    /// Schema name: `log_in`, or `user.rename` for entity methods.
    pub method: String,
    /// Instance id, required for dynamic methods.
    pub entity_id: Option<Value>,
    pub params: FieldArray,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, params: FieldArray) -> Self {
        Self {
            method: method.into(),
            entity_id: None,
            params,
        }
    }

    /// Targets one entity instance.
    pub fn on(mut self, entity_id: impl Into<Value>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

enum Outbound {
    Segment(Bytes),
    Shutdown,
}

/// Last-write-wins entity cache holding at most `capacity` instances.
/// Updates to a cached instance keep its place; new instances evict the
/// oldest.
struct EntityCache {
    entries: HashMap<(u8, Value), Entity>,
    order: VecDeque<(u8, Value)>,
    capacity: usize,
}

impl EntityCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, type_id: u8, id: &Value) -> Option<&Entity> {
        self.entries.get(&(type_id, id.clone()))
    }

    fn insert(&mut self, entity: Entity) {
        let key = (entity.type_id, entity.id.clone());
        if self.entries.insert(key.clone(), entity).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State shared by the read loop, handler tasks and callers.
struct Domain {
    transactions: TransactionManager,
    state: State,
    limiters: RateLimiters,
    entities: EntityCache,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
    reader: Option<AbortHandle>,
    closed: bool,
}

struct Inner {
    role: Role,
    schema: Arc<Schema>,
    handlers: HandlerRegistry,
    config: SessionConfig,
    domain: Mutex<Domain>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<SessionEvent>,
    closed: watch::Sender<bool>,
}

/// Handle to a session. Cheap to clone; all clones drive the same
/// connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Starts a client session over `stream`. Must be called from within a
    /// tokio runtime.
    pub fn client<S>(stream: S, schema: Arc<Schema>, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(Role::Client, stream, schema, HandlerRegistry::new(), config)
    }

    /// Starts a server session over `stream`, dispatching inbound calls to
    /// `handlers`.
    pub fn server<S>(
        stream: S,
        schema: Arc<Schema>,
        handlers: HandlerRegistry,
        config: SessionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(Role::Server, stream, schema, handlers, config)
    }

    fn start<S>(
        role: Role,
        stream: S,
        schema: Arc<Schema>,
        handlers: HandlerRegistry,
        config: SessionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (closed, _) = watch::channel(false);

        let domain = Domain {
            transactions: TransactionManager::new(),
            state: schema.default_state().clone(),
            limiters: RateLimiters::new(),
            entities: EntityCache::new(config.max_cached_entities),
            confirmation_handler: None,
            reader: None,
            closed: false,
        };

        let session = Session {
            inner: Arc::new(Inner {
                role,
                schema,
                handlers,
                config,
                domain: Mutex::new(domain),
                outbound,
                events,
                closed,
            }),
        };

        tokio::spawn(write_loop(writer, outbound_rx));
        let read_task = tokio::spawn(read_loop(session.clone(), reader));
        session.inner.domain.lock().reader = Some(read_task.abort_handle());

        tracing::debug!(role = ?role, "session started");
        session
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Current session state. A client cannot observe the server's state
    /// transitions, so client sessions always report the default state.
    pub fn current_state(&self) -> State {
        self.inner.domain.lock().state.clone()
    }

    /// Looks up an entity in the local cache.
    pub fn entity(&self, type_id: u8, id: &Value) -> Option<Entity> {
        self.inner.domain.lock().entities.get(type_id, id).cloned()
    }

    /// Number of transactions currently open.
    pub fn live_transactions(&self) -> usize {
        self.inner.domain.lock().transactions.live_count()
    }

    /// Subscribes to entity pushes, state changes, errors and close.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Installs the handler that answers the server's confirmation
    /// requests. Without one, requests go unanswered.
    pub fn on_confirmation_request(&self, handler: impl ConfirmationHandler + 'static) {
        self.inner.domain.lock().confirmation_handler = Some(Arc::new(handler));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.domain.lock().closed
    }

    /// Closes the session, failing every live transaction with
    /// `SessionClosed`.
    pub fn close(&self) {
        self.shutdown(None);
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Invokes a method on the server and waits for its result.
    ///
    /// On `Timeout` the transaction stays open until the server's reply
    /// arrives and is dropped.
    pub async fn invoke(&self, call: MethodCall) -> Result<FieldArray, SessionError> {
        if self.inner.role != Role::Client {
            return Err(SessionError::internal("only clients invoke methods"));
        }

        let descriptor = self
            .inner
            .schema
            .method_by_name(&call.method)
            .cloned()
            .ok_or_else(|| SessionError::UnknownMethod(call.method.clone()))?;
        descriptor.params.validate(&call.params)?;
        let entity_id_type = self.check_entity_id(&descriptor, call.entity_id.as_ref())?;

        let invoke = InvokeMethod {
            method: descriptor.method,
            entity_id: call.entity_id,
            params: call.params,
        };

        let (transaction_id, rx) = {
            let mut domain = self.inner.domain.lock();
            if domain.closed {
                return Err(SessionError::SessionClosed);
            }
            let transaction_id = domain.transactions.allocate(descriptor.clone())?;
            let bytes = match SegmentEncoder::invoke_method(
                transaction_id,
                &invoke,
                descriptor.params.schema(),
                entity_id_type.as_ref(),
            ) {
                Ok(bytes) => bytes,
                Err(e) => {
                    domain.transactions.close(transaction_id);
                    return Err(e.into());
                }
            };
            let (waiter, rx) = oneshot::channel();
            if let Some(tx) = domain.transactions.get_mut(transaction_id) {
                tx.set_entity_id(invoke.entity_id.clone());
                tx.set_reply_waiter(waiter);
            }
            self.send(bytes);
            (transaction_id, rx)
        };

        tracing::debug!(
            transaction = transaction_id,
            method = %descriptor.name,
            "invoked"
        );

        match tokio::time::timeout(self.inner.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::SessionClosed),
            Err(_) => {
                tracing::warn!(
                    transaction = transaction_id,
                    method = %descriptor.name,
                    "request timed out"
                );
                Err(SessionError::Timeout)
            }
        }
    }

    /// Sends an entity update to the peer and caches it locally. Updates
    /// open no transaction; they ride on a currently free id.
    pub fn push_entity(&self, entity: Entity) -> Result<(), SessionError> {
        let descriptor = self
            .inner
            .schema
            .entity(entity.type_id)
            .cloned()
            .ok_or_else(|| {
                SessionError::internal(format!("unknown entity type {}", entity.type_id))
            })?;
        descriptor.validate(&entity)?;

        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return Err(SessionError::SessionClosed);
        }
        let transaction_id = domain.transactions.ephemeral_id();
        let bytes = SegmentEncoder::entity_update(
            self.inner.role.outbound(),
            transaction_id,
            &entity,
            descriptor.layout(),
        )?;
        self.send(bytes);
        tracing::debug!(
            entity = %descriptor.name,
            id = %entity.id,
            "entity pushed"
        );
        domain.entities.insert(entity);
        Ok(())
    }

    /// Validates the instance id of a dynamic call and returns its wire
    /// type.
    fn check_entity_id(
        &self,
        descriptor: &MethodDescriptor,
        entity_id: Option<&Value>,
    ) -> Result<Option<FieldType>, SessionError> {
        let entity_type = match descriptor.method.entity_type() {
            Some(t) if descriptor.method.is_dynamic() => t,
            _ => return Ok(None),
        };
        let entity = self.inner.schema.entity(entity_type).ok_or_else(|| {
            SessionError::internal(format!("unknown entity type {}", entity_type))
        })?;
        let id = entity_id.ok_or_else(|| {
            ValidationError::new(
                entity.id_field().name.as_str(),
                format!("'{}' needs an entity id", descriptor.name),
            )
        })?;
        entity.validate_id(id)?;
        Ok(Some(entity.id_field().ty.clone()))
    }

    fn send(&self, bytes: BytesMut) {
        // The writer only goes away once the session is shutting down.
        let _ = self.inner.outbound.send(Outbound::Segment(bytes.freeze()));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn shutdown(&self, reason: Option<SessionError>) {
        let (abandoned, reader) = {
            let mut domain = self.inner.domain.lock();
            if domain.closed {
                return;
            }
            domain.closed = true;
            domain.confirmation_handler = None;
            (domain.transactions.drain(), domain.reader.take())
        };

        let _ = self.inner.outbound.send(Outbound::Shutdown);
        match &reason {
            Some(err) => {
                tracing::error!(
                    role = ?self.inner.role,
                    error = %err,
                    abandoned,
                    "session terminated"
                );
                self.emit(SessionEvent::Error(err.to_string()));
            }
            None => tracing::info!(role = ?self.inner.role, abandoned, "session closed"),
        }
        self.emit(SessionEvent::Closed);
        self.inner.closed.send_replace(true);

        if let Some(reader) = reader {
            reader.abort();
        }
    }

    /// Decodes and handles one buffered segment. `Ok(false)` means more
    /// bytes are needed; `Err` is fatal for the session.
    fn process_next(&self, decoder: &mut SegmentDecoder) -> Result<bool, SessionError> {
        let resolver = SessionResolver::new(&self.inner);
        match self.inner.role {
            Role::Server => match decoder.decode_serverbound(&resolver)? {
                Some(inbound) => self
                    .on_serverbound(inbound, resolver.response_layout.get())
                    .map(|()| true),
                None => Ok(false),
            },
            Role::Client => match decoder.decode_clientbound(&resolver)? {
                Some(inbound) => {
                    self.on_clientbound(inbound);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// Reports an error raised while handling an inbound segment. Returns
    /// whether the session survives it.
    fn on_segment_error(&self, err: SessionError) -> bool {
        if err.is_fatal() {
            self.shutdown(Some(err));
            return false;
        }
        tracing::warn!(role = ?self.inner.role, error = %err, "segment dropped");
        self.emit(SessionEvent::Error(err.to_string()));
        true
    }

    fn on_entity(&self, entity: Entity) {
        let Some(descriptor) = self.inner.schema.entity(entity.type_id) else {
            return;
        };
        if let Err(e) = descriptor.validate(&entity) {
            tracing::warn!(entity = %descriptor.name, error = %e, "invalid entity update dropped");
            self.emit(SessionEvent::Error(format!(
                "invalid {} update: {}",
                descriptor.name, e
            )));
            return;
        }

        {
            let mut domain = self.inner.domain.lock();
            if domain.closed {
                return;
            }
            domain.entities.insert(entity.clone());
        }
        tracing::debug!(entity = %descriptor.name, id = %entity.id, "entity updated");
        self.emit(SessionEvent::EntityUpdated(entity));
    }
}

// Server side.
impl Session {
    /// `response_layout` is the confirmation whose response layout decoded
    /// a `ConfResp`.
    fn on_serverbound(
        &self,
        inbound: Inbound<ServerboundSegment>,
        response_layout: Option<u8>,
    ) -> Result<(), SessionError> {
        match inbound {
            Inbound::Segment {
                transaction_id,
                segment,
            } => match segment {
                ServerboundSegment::InvokeMethod(invoke) => self.on_invoke(transaction_id, invoke),
                ServerboundSegment::EntityUpdatePush(entity) => {
                    self.on_entity(entity);
                    Ok(())
                }
                ServerboundSegment::ConfResp(fields) => {
                    self.on_conf_resp(transaction_id, fields, response_layout);
                    Ok(())
                }
            },
            Inbound::Rejected {
                transaction_id,
                rejection,
                ..
            } => {
                let mut domain = self.inner.domain.lock();
                if domain.closed {
                    return Ok(());
                }
                match rejection {
                    Rejection::UnknownMethod => {
                        if domain.transactions.is_live(transaction_id) {
                            return Err(SessionError::DuplicateTransaction(transaction_id));
                        }
                        tracing::warn!(transaction = transaction_id, "unknown method");
                        self.send_method_error(
                            transaction_id,
                            ErrorCode::UnknownMethod,
                            "unknown method".to_string(),
                        );
                        Ok(())
                    }
                    Rejection::ConfirmationMismatch => {
                        self.reject_confirmation(&mut domain, transaction_id);
                        Ok(())
                    }
                    Rejection::Orphan => Err(ProtocolError::OrphanSegment(transaction_id).into()),
                }
            }
        }
    }

    fn on_invoke(&self, transaction_id: u8, invoke: InvokeMethod) -> Result<(), SessionError> {
        let descriptor = self
            .inner
            .schema
            .method(invoke.method)
            .cloned()
            .ok_or_else(|| {
                SessionError::internal(format!("method {} has no descriptor", invoke.method))
            })?;

        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return Ok(());
        }
        domain
            .transactions
            .open_remote(transaction_id, descriptor.clone())?;
        if let Some(tx) = domain.transactions.get_mut(transaction_id) {
            tx.set_entity_id(invoke.entity_id.clone());
        }
        tracing::debug!(
            transaction = transaction_id,
            method = %descriptor.name,
            "method invoked"
        );

        if let Err(err) = self.admit(&mut domain, &descriptor, &invoke) {
            tracing::warn!(
                transaction = transaction_id,
                method = %descriptor.name,
                error = %err,
                "call rejected"
            );
            self.finish(&mut domain, transaction_id, Err(err));
            return Ok(());
        }

        match self.inner.handlers.get(descriptor.method) {
            Some(handler) => {
                let ctx = CallContext {
                    session: self.clone(),
                    transaction_id,
                    method: descriptor,
                    params: invoke.params,
                    entity_id: invoke.entity_id,
                    state: domain.state.clone(),
                };
                let session = self.clone();
                let task = tokio::spawn(async move {
                    let result = handler.call(ctx).await;
                    session.complete(transaction_id, result);
                });
                if let Some(tx) = domain.transactions.get_mut(transaction_id) {
                    tx.set_handler(task.abort_handle());
                }
            }
            None if descriptor.get_by_id => {
                let result = self.get_by_id(&domain, &descriptor, &invoke);
                self.finish(&mut domain, transaction_id, result);
            }
            None => {
                let err = SessionError::Unimplemented(descriptor.name.clone());
                self.finish(&mut domain, transaction_id, Err(err));
            }
        }
        Ok(())
    }

    /// Gates a call: state, then validation, then rate limit. A call that
    /// fails an earlier gate is not counted against the limit.
    fn admit(
        &self,
        domain: &mut Domain,
        descriptor: &MethodDescriptor,
        invoke: &InvokeMethod,
    ) -> Result<(), SessionError> {
        if !descriptor.is_permitted(&domain.state) {
            return Err(SessionError::StateNotPermitted {
                method: descriptor.name.clone(),
                state: domain.state.to_string(),
            });
        }

        descriptor.params.validate(&invoke.params)?;
        if let (Some(entity_type), Some(id)) = (descriptor.method.entity_type(), &invoke.entity_id)
        {
            if let Some(entity) = self.inner.schema.entity(entity_type) {
                entity.validate_id(id)?;
            }
        }

        if let Some(limit) = descriptor.rate_limit {
            let scope = RateScope::for_call(descriptor.method, invoke.entity_id.as_ref());
            if !domain
                .limiters
                .admit(descriptor.method, scope, limit, Instant::now())
            {
                return Err(SessionError::RateLimitExceeded(descriptor.name.clone()));
            }
        }
        Ok(())
    }

    /// Serves get-by-id from the entity cache when no handler overrides it.
    fn get_by_id(
        &self,
        domain: &Domain,
        descriptor: &MethodDescriptor,
        invoke: &InvokeMethod,
    ) -> HandlerResult {
        let entity_type = descriptor
            .method
            .entity_type()
            .ok_or_else(|| SessionError::internal("get-by-id on a global method"))?;
        let entity = self.inner.schema.entity(entity_type).ok_or_else(|| {
            SessionError::internal(format!("unknown entity type {}", entity_type))
        })?;
        let id = match &invoke.entity_id {
            Some(id) => id.clone(),
            None => invoke
                .params
                .required
                .first()
                .cloned()
                .ok_or_else(|| SessionError::internal("get-by-id without an id"))?,
        };

        match domain.entities.get(entity_type, &id) {
            Some(found) => Ok(Reply::new(entity.get_by_id_return(found))),
            None => Err(ValidationError::new(
                entity.id_field().name.as_str(),
                format!("no {} with id {}", entity.name, id),
            )
            .into()),
        }
    }

    /// Called by a handler task when it returns.
    fn complete(&self, transaction_id: u8, result: HandlerResult) {
        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return;
        }
        self.finish(&mut domain, transaction_id, result);
    }

    /// Sends the terminal segment of a transaction and closes it. A state
    /// change carried by the reply is applied before the lock is released,
    /// so the next dispatched call observes it.
    fn finish(&self, domain: &mut Domain, transaction_id: u8, result: HandlerResult) {
        let descriptor = match domain.transactions.get(transaction_id) {
            Some(tx) => tx.method().clone(),
            None => {
                tracing::debug!(
                    transaction = transaction_id,
                    "result for a closed transaction dropped"
                );
                return;
            }
        };

        let result = result.and_then(|reply| {
            self.encode_reply(domain, &descriptor, transaction_id, reply)
                .map_err(|e| {
                    tracing::error!(
                        method = %descriptor.name,
                        error = %e,
                        "handler reply rejected"
                    );
                    e
                })
        });

        match result {
            Ok(bytes) => {
                if let Some(tx) = domain.transactions.get_mut(transaction_id) {
                    tx.record(SegmentKind::MethodRet);
                }
                self.send(bytes);
            }
            Err(err) => {
                let (code, message) = wire_error(&descriptor, &err);
                if let Some(tx) = domain.transactions.get_mut(transaction_id) {
                    tx.record(SegmentKind::MethodErr);
                }
                self.send_method_error(transaction_id, code, message);
            }
        }
        domain.transactions.close(transaction_id);
    }

    fn encode_reply(
        &self,
        domain: &mut Domain,
        descriptor: &MethodDescriptor,
        transaction_id: u8,
        reply: Reply,
    ) -> Result<BytesMut, SessionError> {
        descriptor
            .returns
            .validate(&reply.fields)
            .map_err(|e| SessionError::internal(format!("invalid return value: {}", e)))?;
        if let Some(state) = &reply.state {
            if !self.inner.schema.states().has_state(state) {
                return Err(SessionError::internal(format!(
                    "undeclared state '{}'",
                    state
                )));
            }
        }

        let bytes =
            SegmentEncoder::method_ret(transaction_id, &reply.fields, descriptor.returns.schema())?;

        if let Some(state) = reply.state {
            if state != domain.state {
                let from = std::mem::replace(&mut domain.state, state.clone());
                tracing::info!(from = %from, to = %state, "session state changed");
                self.emit(SessionEvent::StateChanged { from, to: state });
            }
        }
        Ok(bytes)
    }

    fn send_method_error(&self, transaction_id: u8, code: ErrorCode, message: String) {
        let err = MethodError::new(code.as_u16(), message);
        let encoded = SegmentEncoder::method_err(transaction_id, &err).or_else(|e| {
            tracing::warn!(
                transaction = transaction_id,
                error = %e,
                "error message not encodable"
            );
            SegmentEncoder::method_err(
                transaction_id,
                &MethodError::new(ErrorCode::InternalError.as_u16(), "internal error"),
            )
        });
        match encoded {
            Ok(bytes) => self.send(bytes),
            Err(e) => tracing::error!(
                transaction = transaction_id,
                error = %e,
                "failed to encode method error"
            ),
        }
    }

    fn on_conf_resp(&self, transaction_id: u8, fields: FieldArray, decoded_as: Option<u8>) {
        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return;
        }
        // A request issued after the response was decoded would otherwise
        // receive fields laid out for another confirmation.
        let resumed = domain
            .transactions
            .get_mut(transaction_id)
            .filter(|tx| tx.pending_confirmation().map(|c| c.id) == decoded_as)
            .and_then(|tx| tx.resume());

        match resumed {
            Some((descriptor, waiter)) => {
                tracing::debug!(
                    transaction = transaction_id,
                    confirmation = %descriptor.name,
                    "confirmation response"
                );
                let result = descriptor
                    .response
                    .validate(&fields)
                    .map(|()| fields)
                    .map_err(SessionError::from);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(result);
                }
            }
            None => self.reject_confirmation(&mut domain, transaction_id),
        }
    }

    /// A `ConfResp` on a transaction that is not awaiting one fails that
    /// transaction and nothing else.
    fn reject_confirmation(&self, domain: &mut Domain, transaction_id: u8) {
        let Some(mut tx) = domain.transactions.close(transaction_id) else {
            return;
        };
        tx.abort_handler();
        tracing::warn!(
            transaction = transaction_id,
            method = %tx.method().name,
            "confirmation response without a pending request"
        );
        let err = SessionError::ConfirmationMismatch(transaction_id);
        self.send_method_error(transaction_id, err.error_code(), err.to_string());
    }

    /// Sends a `ConfReq` on `transaction_id` and suspends until the matching
    /// `ConfResp`, the confirmation timeout, or session close.
    pub(crate) async fn request_confirmation(
        &self,
        transaction_id: u8,
        name: &str,
        fields: FieldArray,
    ) -> Result<FieldArray, SessionError> {
        let descriptor = self
            .inner
            .schema
            .confirmation_by_name(name)
            .cloned()
            .ok_or_else(|| SessionError::internal(format!("unknown confirmation '{}'", name)))?;
        descriptor.request.validate(&fields).map_err(|e| {
            SessionError::internal(format!("invalid confirmation request: {}", e))
        })?;

        let rx = {
            let mut domain = self.inner.domain.lock();
            if domain.closed {
                return Err(SessionError::SessionClosed);
            }
            let tx = domain.transactions.get_mut(transaction_id).ok_or_else(|| {
                SessionError::internal(format!("transaction {} is closed", transaction_id))
            })?;
            if !tx.method().may_confirm(descriptor.id) {
                return Err(SessionError::internal(format!(
                    "method '{}' may not request confirmation '{}'",
                    tx.method().name,
                    descriptor.name
                )));
            }
            if tx.phase() != Phase::Open {
                return Err(SessionError::internal("a confirmation is already pending"));
            }
            let bytes = SegmentEncoder::conf_req(
                transaction_id,
                descriptor.id,
                &fields,
                descriptor.request.schema(),
            )?;
            let (waiter, rx) = oneshot::channel();
            tx.await_confirmation(descriptor.clone(), Some(waiter));
            self.send(bytes);
            rx
        };
        tracing::debug!(
            transaction = transaction_id,
            confirmation = %descriptor.name,
            "confirmation requested"
        );

        let timeout = descriptor
            .timeout
            .unwrap_or_else(|| self.inner.config.confirmation_timeout());
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::SessionClosed),
            Err(_) => {
                if let Some(tx) = self.inner.domain.lock().transactions.get_mut(transaction_id) {
                    tx.cancel_confirmation();
                }
                tracing::warn!(
                    transaction = transaction_id,
                    confirmation = %descriptor.name,
                    "confirmation timed out"
                );
                Err(SessionError::ConfirmationTimeout(descriptor.name.clone()))
            }
        }
    }
}

// Client side.
impl Session {
    fn on_clientbound(&self, inbound: Inbound<ClientboundSegment>) {
        match inbound {
            Inbound::Segment {
                transaction_id,
                segment,
            } => match segment {
                ClientboundSegment::MethodRet(fields) => {
                    self.on_reply(transaction_id, SegmentKind::MethodRet, |method| {
                        method
                            .returns
                            .validate(&fields)
                            .map(|()| fields)
                            .map_err(SessionError::from)
                    })
                }
                ClientboundSegment::MethodErr(err) => {
                    self.on_reply(transaction_id, SegmentKind::MethodErr, |_| {
                        Err(SessionError::Remote {
                            code: ErrorCode::from_u16(err.code),
                            message: err.message,
                        })
                    })
                }
                ClientboundSegment::ConfReq {
                    confirmation,
                    fields,
                } => self.on_conf_req(transaction_id, confirmation, fields),
                ClientboundSegment::EntityUpdate(entity) => self.on_entity(entity),
            },
            Inbound::Rejected {
                transaction_id,
                kind,
                rejection,
            } => {
                tracing::warn!(
                    transaction = transaction_id,
                    kind = ?kind,
                    %rejection,
                    "segment rejected"
                );
                self.emit(SessionEvent::Error(format!(
                    "{:?} on transaction {} rejected: {}",
                    kind, transaction_id, rejection
                )));
            }
        }
    }

    /// Closes a local transaction on its terminal segment and wakes the
    /// caller, if it is still waiting.
    fn on_reply(
        &self,
        transaction_id: u8,
        kind: SegmentKind,
        result: impl FnOnce(&MethodDescriptor) -> Result<FieldArray, SessionError>,
    ) {
        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return;
        }
        if let Some(tx) = domain.transactions.get_mut(transaction_id) {
            tx.record(kind);
        }
        let Some(mut tx) = domain.transactions.close(transaction_id) else {
            return;
        };
        let result = result(tx.method().as_ref());
        let delivered = match tx.take_reply_waiter() {
            Some(waiter) => waiter.send(result).is_ok(),
            None => false,
        };
        if !delivered {
            tracing::debug!(transaction = transaction_id, "late reply dropped");
        }
    }

    fn on_conf_req(&self, transaction_id: u8, confirmation: u8, fields: FieldArray) {
        let Some(descriptor) = self.inner.schema.confirmation(confirmation).cloned() else {
            return;
        };

        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return;
        }
        let handler = domain.confirmation_handler.clone();
        let Some(tx) = domain.transactions.get_mut(transaction_id) else {
            return;
        };

        let problem = if tx.phase() != Phase::Open || !tx.method().may_confirm(confirmation) {
            Some(format!(
                "unexpected confirmation '{}' on transaction {}",
                descriptor.name, transaction_id
            ))
        } else if let Err(e) = descriptor.request.validate(&fields) {
            Some(format!("invalid confirmation '{}': {}", descriptor.name, e))
        } else if handler.is_none() {
            Some(format!(
                "no handler for confirmation '{}' on transaction {}",
                descriptor.name, transaction_id
            ))
        } else {
            None
        };
        let handler = match (problem, handler) {
            (None, Some(handler)) => handler,
            (problem, _) => {
                let problem = problem.unwrap_or_default();
                tracing::warn!(transaction = transaction_id, "{}", problem);
                self.emit(SessionEvent::Error(problem));
                return;
            }
        };

        tx.await_confirmation(descriptor.clone(), None);
        let request = ConfirmationRequest {
            transaction_id,
            confirmation: descriptor,
            fields,
        };
        let session = self.clone();
        tokio::spawn(async move {
            let response = handler.call(request).await;
            session.respond_confirmation(transaction_id, response);
        });
    }

    fn respond_confirmation(
        &self,
        transaction_id: u8,
        response: Result<FieldArray, SessionError>,
    ) {
        let mut domain = self.inner.domain.lock();
        if domain.closed {
            return;
        }
        let Some(tx) = domain.transactions.get_mut(transaction_id) else {
            tracing::debug!(transaction = transaction_id, "confirmation answered after close");
            return;
        };
        let Some(descriptor) = tx.pending_confirmation().cloned() else {
            return;
        };

        let encoded = response.and_then(|fields| {
            descriptor.response.validate(&fields)?;
            Ok(SegmentEncoder::conf_resp(
                transaction_id,
                &fields,
                descriptor.response.schema(),
            )?)
        });
        match encoded {
            Ok(bytes) => {
                tx.resume();
                self.send(bytes);
            }
            Err(e) => {
                tx.cancel_confirmation();
                tracing::warn!(
                    transaction = transaction_id,
                    confirmation = %descriptor.name,
                    error = %e,
                    "confirmation left unanswered"
                );
                self.emit(SessionEvent::Error(format!(
                    "confirmation '{}' left unanswered: {}",
                    descriptor.name, e
                )));
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Maps a failed call to the `(code, message)` pair sent in `MethodErr`.
/// Application codes the method does not declare become `InternalError`.
fn wire_error(descriptor: &MethodDescriptor, err: &SessionError) -> (ErrorCode, String) {
    match err {
        SessionError::Application { code, message } if descriptor.declares_error(*code) => {
            (ErrorCode::Application(*code), message.clone())
        }
        SessionError::Application { code, .. } => {
            tracing::warn!(
                method = %descriptor.name,
                code,
                "handler returned an undeclared error code"
            );
            (ErrorCode::InternalError, "internal error".to_string())
        }
        other => (other.error_code(), other.to_string()),
    }
}

/// Answers the decoder's schema questions from the session's live
/// transactions.
struct SessionResolver<'a> {
    inner: &'a Inner,
    response_layout: Cell<Option<u8>>,
}

impl<'a> SessionResolver<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self {
            inner,
            response_layout: Cell::new(None),
        }
    }
}

impl SchemaResolver for SessionResolver<'_> {
    fn method_params(&self, method: MethodRef) -> Result<Arc<FieldArraySchema>, Rejection> {
        self.inner.schema.method_params(method)
    }

    fn entity_layout(&self, entity_type: u8) -> Option<EntityLayout> {
        self.inner.schema.entity_layout(entity_type)
    }

    fn method_return(&self, transaction_id: u8) -> Result<Arc<FieldArraySchema>, Rejection> {
        let domain = self.inner.domain.lock();
        match domain.transactions.get(transaction_id) {
            Some(tx) if tx.origin() == Origin::Local => Ok(tx.method().returns.schema().clone()),
            _ => Err(Rejection::Orphan),
        }
    }

    // Any declared confirmation is delimited with its own schema; whether
    // the transaction may receive it is decided when it is handled.
    fn confirmation_request(
        &self,
        transaction_id: u8,
        confirmation: u8,
    ) -> Result<Arc<FieldArraySchema>, Rejection> {
        let domain = self.inner.domain.lock();
        match domain.transactions.get(transaction_id) {
            Some(tx) if tx.origin() == Origin::Local => self
                .inner
                .schema
                .confirmation(confirmation)
                .map(|c| c.request.schema().clone())
                .ok_or(Rejection::ConfirmationMismatch),
            _ => Err(Rejection::Orphan),
        }
    }

    fn confirmation_response(
        &self,
        transaction_id: u8,
    ) -> Result<Arc<FieldArraySchema>, Rejection> {
        let domain = self.inner.domain.lock();
        match domain.transactions.get(transaction_id) {
            Some(tx) if tx.origin() == Origin::Remote => {
                let confirmation = tx
                    .last_confirmation()
                    .ok_or(Rejection::ConfirmationMismatch)?;
                self.response_layout.set(Some(confirmation.id));
                Ok(confirmation.response.schema().clone())
            }
            _ => Err(Rejection::Orphan),
        }
    }

    fn method_error(&self, transaction_id: u8) -> Result<(), Rejection> {
        let domain = self.inner.domain.lock();
        match domain.transactions.get(transaction_id) {
            Some(tx) if tx.origin() == Origin::Local => Ok(()),
            _ => Err(Rejection::Orphan),
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Segment(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!(error = %e, "write failed");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    tracing::debug!(error = %e, "flush failed");
                    break;
                }
            }
            Outbound::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

async fn read_loop<R>(session: Session, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = SegmentDecoder::with_max_segment_size(session.inner.config.max_segment_size);
    let mut buf = vec![0u8; session.inner.config.read_buffer_size];

    loop {
        loop {
            match session.process_next(&mut decoder) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    if !session.on_segment_error(e) {
                        return;
                    }
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(role = ?session.inner.role, "peer closed the connection");
                session.shutdown(None);
                return;
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                session.shutdown(Some(e.into()));
                return;
            }
        }
    }
}
