//! Transaction table.
//!
//! Every method invocation runs on its own transaction id. The table owns
//! the live transactions of one session, recycles ids least-recently-closed
//! first, and parks the continuations waiting on a reply or a confirmation.

use crate::error::SessionError;
use segwire_protocol::{FieldArray, SegmentKind, Value, TRANSACTION_ID_SPACE};
use segwire_schema::{ConfirmationDescriptor, MethodDescriptor};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Wakes a parked caller with the field array it was waiting for.
pub(crate) type Waiter = oneshot::Sender<Result<FieldArray, SessionError>>;

/// Which peer opened the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Opened by a local `invoke`.
    Local,
    /// Opened by an `InvokeMethod` from the peer.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    AwaitingConfirmationResponse,
    Closed,
}

/// One method invocation in flight.
#[derive(Debug)]
pub struct Transaction {
    id: u8,
    origin: Origin,
    phase: Phase,
    log: Vec<SegmentKind>,
    method: Arc<MethodDescriptor>,
    entity_id: Option<Value>,
    /// The confirmation most recently requested on this transaction.
    confirmation: Option<Arc<ConfirmationDescriptor>>,
    confirmation_waiter: Option<Waiter>,
    reply: Option<Waiter>,
    handler: Option<AbortHandle>,
}

impl Transaction {
    fn new(id: u8, origin: Origin, method: Arc<MethodDescriptor>) -> Self {
        Self {
            id,
            origin,
            phase: Phase::Open,
            log: vec![SegmentKind::InvokeMethod],
            method,
            entity_id: None,
            confirmation: None,
            confirmation_waiter: None,
            reply: None,
            handler: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Kinds of the segments exchanged so far, in order.
    pub fn log(&self) -> &[SegmentKind] {
        &self.log
    }

    pub fn method(&self) -> &Arc<MethodDescriptor> {
        &self.method
    }

    pub fn entity_id(&self) -> Option<&Value> {
        self.entity_id.as_ref()
    }

    /// The confirmation this transaction is suspended on, if any.
    pub fn pending_confirmation(&self) -> Option<&Arc<ConfirmationDescriptor>> {
        match self.phase {
            Phase::AwaitingConfirmationResponse => self.confirmation.as_ref(),
            _ => None,
        }
    }

    /// The confirmation most recently requested, even if no longer pending.
    pub fn last_confirmation(&self) -> Option<&Arc<ConfirmationDescriptor>> {
        self.confirmation.as_ref()
    }

    pub(crate) fn record(&mut self, kind: SegmentKind) {
        self.log.push(kind);
    }

    pub(crate) fn set_entity_id(&mut self, id: Option<Value>) {
        self.entity_id = id;
    }

    pub(crate) fn set_reply_waiter(&mut self, waiter: Waiter) {
        self.reply = Some(waiter);
    }

    pub(crate) fn take_reply_waiter(&mut self) -> Option<Waiter> {
        self.reply.take()
    }

    pub(crate) fn set_handler(&mut self, handle: AbortHandle) {
        self.handler = Some(handle);
    }

    /// Suspends the transaction on `descriptor`. Servers park the handler's
    /// continuation in `waiter`; clients have none.
    pub(crate) fn await_confirmation(
        &mut self,
        descriptor: Arc<ConfirmationDescriptor>,
        waiter: Option<Waiter>,
    ) {
        self.phase = Phase::AwaitingConfirmationResponse;
        self.confirmation = Some(descriptor);
        self.confirmation_waiter = waiter;
        self.log.push(SegmentKind::ConfReq);
    }

    /// Returns to `Open` after a `ConfResp`, handing back the confirmation
    /// and the parked continuation. `None` if nothing was pending.
    pub(crate) fn resume(&mut self) -> Option<(Arc<ConfirmationDescriptor>, Option<Waiter>)> {
        if self.phase != Phase::AwaitingConfirmationResponse {
            return None;
        }
        let descriptor = self.confirmation.clone()?;
        self.phase = Phase::Open;
        self.log.push(SegmentKind::ConfResp);
        Some((descriptor, self.confirmation_waiter.take()))
    }

    /// Abandons a pending confirmation without a response.
    pub(crate) fn cancel_confirmation(&mut self) {
        if self.phase == Phase::AwaitingConfirmationResponse {
            self.phase = Phase::Open;
            self.confirmation_waiter = None;
        }
    }

    /// Stops the handler task, if any.
    pub(crate) fn abort_handler(&mut self) {
        if let Some(handle) = self.handler.take() {
            handle.abort();
        }
    }

    /// Fails every parked continuation with `SessionClosed`.
    fn abandon(&mut self) {
        if let Some(waiter) = self.reply.take() {
            let _ = waiter.send(Err(SessionError::SessionClosed));
        }
        if let Some(waiter) = self.confirmation_waiter.take() {
            let _ = waiter.send(Err(SessionError::SessionClosed));
        }
        self.abort_handler();
        self.phase = Phase::Closed;
    }
}

/// Live transactions of one session plus the free id list.
#[derive(Debug)]
pub struct TransactionManager {
    live: HashMap<u8, Transaction>,
    /// Ids not in use, least recently closed at the front.
    free: VecDeque<u8>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            free: (0..TRANSACTION_ID_SPACE).map(|id| id as u8).collect(),
        }
    }

    /// Opens a local transaction on the least recently closed free id.
    pub fn allocate(&mut self, method: Arc<MethodDescriptor>) -> Result<u8, SessionError> {
        let id = self
            .free
            .pop_front()
            .ok_or(SessionError::NoFreeTransactionId)?;
        self.live.insert(id, Transaction::new(id, Origin::Local, method));
        Ok(id)
    }

    /// Opens the transaction the peer chose for an inbound invocation.
    pub fn open_remote(
        &mut self,
        id: u8,
        method: Arc<MethodDescriptor>,
    ) -> Result<(), SessionError> {
        if self.live.contains_key(&id) {
            return Err(SessionError::DuplicateTransaction(id));
        }
        self.free.retain(|&free| free != id);
        self.live.insert(id, Transaction::new(id, Origin::Remote, method));
        Ok(())
    }

    pub fn get(&self, id: u8) -> Option<&Transaction> {
        self.live.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Transaction> {
        self.live.get_mut(&id)
    }

    pub fn is_live(&self, id: u8) -> bool {
        self.live.contains_key(&id)
    }

    /// Closes a transaction and puts its id at the back of the free list.
    pub fn close(&mut self, id: u8) -> Option<Transaction> {
        let mut tx = self.live.remove(&id)?;
        tx.phase = Phase::Closed;
        self.free.push_back(id);
        tracing::debug!(transaction = id, segments = ?tx.log, "transaction closed");
        Some(tx)
    }

    /// Closes everything, failing parked continuations with `SessionClosed`.
    pub fn drain(&mut self) -> usize {
        let mut ids: Vec<u8> = self.live.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            if let Some(mut tx) = self.live.remove(id) {
                tx.abandon();
                self.free.push_back(*id);
            }
        }
        ids.len()
    }

    /// An id for a segment that opens no transaction, such as an entity
    /// push. Never collides with a live transaction while one is free.
    pub fn ephemeral_id(&self) -> u8 {
        self.free.front().copied().unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
