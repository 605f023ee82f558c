//! Trace compilation seam.
//!
//! A [`TraceCompiler`] turns a procedure plus example operands into a
//! procedure specialized for operands of the same rank, dtype and device. The
//! engine never looks inside the result; it only calls it.

use cf_cache::OperandKey;
use cf_core::{StateSnapshot, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Procedure, StatefulProcedure, TransformError};

pub trait TraceCompiler: Send + Sync {
    fn compile(
        &self,
        name: &str,
        procedure: Procedure,
        example_inputs: &[Value],
    ) -> Result<Procedure, TransformError>;

    fn compile_stateful(
        &self,
        name: &str,
        procedure: StatefulProcedure,
        example_state: &StateSnapshot,
        example_inputs: &[Value],
    ) -> Result<StatefulProcedure, TransformError>;
}

/// Reference compiler: the compiled form is the original procedure behind a
/// guard that rejects operands whose rank, dtype or device differ from the
/// examples.
///
/// Compilation never runs the procedure.
#[derive(Debug, Default)]
pub struct SpecializingCompiler {
    compilations: AtomicUsize,
}

impl SpecializingCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of procedures compiled so far.
    #[must_use]
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

fn check_inputs(name: &str, keys: &[OperandKey], inputs: &[Value]) -> Result<(), TransformError> {
    if keys.len() != inputs.len() {
        return Err(TransformError::ArityMismatch {
            procedure: name.to_owned(),
            expected: keys.len(),
            actual: inputs.len(),
        });
    }
    for (position, (key, value)) in keys.iter().zip(inputs).enumerate() {
        if !key.admits(value) {
            return Err(TransformError::SpecializationMismatch {
                procedure: name.to_owned(),
                detail: format!(
                    "operand {position}: compiled for rank {} {} on {}, got rank {} {} on {}",
                    key.rank,
                    key.dtype.as_str(),
                    key.device,
                    value.rank(),
                    value.dtype().as_str(),
                    value.device()
                ),
            });
        }
    }
    Ok(())
}

fn check_state(
    name: &str,
    keys: &BTreeMap<String, OperandKey>,
    state: &StateSnapshot,
) -> Result<(), TransformError> {
    if state.len() != keys.len() || keys.keys().any(|entry| !state.contains_key(entry)) {
        return Err(TransformError::SpecializationMismatch {
            procedure: name.to_owned(),
            detail: format!(
                "state entries {:?} differ from compiled entries {:?}",
                state.keys().collect::<Vec<_>>(),
                keys.keys().collect::<Vec<_>>()
            ),
        });
    }
    for (entry, value) in state.iter() {
        if keys.get(entry).is_some_and(|key| !key.admits(value)) {
            return Err(TransformError::SpecializationMismatch {
                procedure: name.to_owned(),
                detail: format!("state entry '{entry}' changed rank, dtype or device"),
            });
        }
    }
    Ok(())
}

impl TraceCompiler for SpecializingCompiler {
    fn compile(
        &self,
        name: &str,
        procedure: Procedure,
        example_inputs: &[Value],
    ) -> Result<Procedure, TransformError> {
        let keys: Vec<OperandKey> = example_inputs.iter().map(OperandKey::of).collect();
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(procedure = name, arity = keys.len(), "compiled procedure");

        let name = name.to_owned();
        Ok(Arc::new(move |inputs: &[Value]| {
            check_inputs(&name, &keys, inputs)?;
            procedure(inputs)
        }))
    }

    fn compile_stateful(
        &self,
        name: &str,
        procedure: StatefulProcedure,
        example_state: &StateSnapshot,
        example_inputs: &[Value],
    ) -> Result<StatefulProcedure, TransformError> {
        let keys: Vec<OperandKey> = example_inputs.iter().map(OperandKey::of).collect();
        let state_keys: BTreeMap<String, OperandKey> = example_state
            .iter()
            .map(|(entry, value)| (entry.to_owned(), OperandKey::of(value)))
            .collect();
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            procedure = name,
            arity = keys.len(),
            state_entries = state_keys.len(),
            "compiled stateful procedure"
        );

        let name = name.to_owned();
        Ok(Arc::new(move |state: &StateSnapshot, inputs: &[Value]| {
            check_state(&name, &state_keys, state)?;
            check_inputs(&name, &keys, inputs)?;
            procedure(state, inputs)
        }))
    }
}
