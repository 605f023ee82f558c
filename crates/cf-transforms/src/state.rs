//! State extraction for step functions bound to external state.

use cf_core::{StateSnapshot, Value};
use std::sync::{Arc, PoisonError, RwLock};

use crate::{Procedure, StatefulProcedure, TransformError};

/// External storage a stateful step function reads and writes.
pub trait StateHolder: Send + Sync {
    /// Current value of every entry.
    fn state(&self) -> StateSnapshot;

    /// Overwrite the entries present in `state`; other entries are untouched.
    fn load_state(&self, state: &StateSnapshot);
}

/// Attribute storage backed by a lock-protected snapshot.
#[derive(Debug, Default)]
pub struct SharedState {
    entries: RwLock<StateSnapshot>,
}

impl SharedState {
    #[must_use]
    pub fn new(initial: StateSnapshot) -> Self {
        Self {
            entries: RwLock::new(initial),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
    }
}

impl StateHolder for SharedState {
    fn state(&self) -> StateSnapshot {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn load_state(&self, state: &StateSnapshot) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(state.clone());
    }
}

/// Extract `procedure` into an explicit `(state, operands) -> (state, results)` form.
///
/// Returns the holder's current state and the extracted procedure. Each call
/// loads the entries of the given state the holder knows about, runs
/// `procedure`, captures the holder's state and puts the previous contents
/// back, so the holder looks untouched afterwards.
pub fn use_state(
    holder: Arc<dyn StateHolder>,
    procedure: Procedure,
) -> (StateSnapshot, StatefulProcedure) {
    let initial = holder.state();
    let extracted: StatefulProcedure = Arc::new(
        move |state: &StateSnapshot,
              args: &[Value]|
              -> Result<(StateSnapshot, Vec<Value>), TransformError> {
            let saved = holder.state();
            holder.load_state(&state.restricted_to(&saved));
            let outcome = procedure(args);
            let captured = holder.state();
            holder.load_state(&saved);
            Ok((captured, outcome?))
        },
    );
    (initial, extracted)
}
