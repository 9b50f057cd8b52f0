//! Session-level state machine.

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A named session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The declared states of a schema and the one sessions start in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    states: BTreeSet<State>,
    default: State,
}

impl StateMachine {
    pub fn new(states: BTreeSet<State>, default: State) -> Result<Self, SchemaError> {
        if !states.contains(&default) {
            return Err(SchemaError::invalid(format!(
                "default state '{}' not in states list",
                default
            )));
        }
        Ok(Self { states, default })
    }

    /// A machine with a single state, used when a schema declares none.
    pub fn single(state: State) -> Self {
        Self {
            states: BTreeSet::from([state.clone()]),
            default: state,
        }
    }

    pub fn default_state(&self) -> &State {
        &self.default
    }

    pub fn has_state(&self, state: &State) -> bool {
        self.states.contains(state)
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }
}

/// Returns whether a method gated on `permitted` may run in `current`.
/// An empty set permits every state.
pub fn is_permitted(permitted: &BTreeSet<State>, current: &State) -> bool {
    permitted.is_empty() || permitted.contains(current)
}
