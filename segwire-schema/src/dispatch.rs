//! Method dispatch table.

use crate::definition::MethodDescriptor;
use crate::error::SchemaError;
use segwire_protocol::{Direction, MethodRef, Rejection};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps wire method references to compiled descriptors. Built once per
/// schema and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    methods: HashMap<MethodRef, Arc<MethodDescriptor>>,
    names: HashMap<String, MethodRef>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, descriptor: MethodDescriptor) -> Result<(), SchemaError> {
        if self.methods.contains_key(&descriptor.method) {
            return Err(SchemaError::invalid(format!(
                "duplicate method id: {} ('{}')",
                descriptor.method, descriptor.name
            )));
        }
        if self.names.contains_key(&descriptor.name) {
            return Err(SchemaError::invalid(format!(
                "duplicate method name '{}'",
                descriptor.name
            )));
        }
        self.names.insert(descriptor.name.clone(), descriptor.method);
        self.methods.insert(descriptor.method, Arc::new(descriptor));
        Ok(())
    }

    /// Resolves an `InvokeMethod` arriving in `direction`. Only servers
    /// accept invocations.
    pub fn resolve(
        &self,
        direction: Direction,
        method: MethodRef,
    ) -> Result<&Arc<MethodDescriptor>, Rejection> {
        if direction != Direction::Serverbound {
            return Err(Rejection::UnknownMethod);
        }
        self.methods.get(&method).ok_or(Rejection::UnknownMethod)
    }

    pub fn get(&self, method: MethodRef) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(&method)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.names.get(name).and_then(|m| self.methods.get(m))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MethodDescriptor>> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
