#![forbid(unsafe_code)]

//! Collaborator seams of the control-flow engine.
//!
//! Control-flow tracers only ever see opaque procedures. Compiling them,
//! lifting them over batch lanes and extracting their external state all go
//! through the traits defined here, so a different backend can be plugged in
//! without touching the tracers.

pub mod batch_map;
pub mod compile;
pub mod error;
pub mod state;

use cf_core::{StateSnapshot, Value};
use std::sync::Arc;

pub use batch_map::{AxisSpec, BatchMapper, LoopAndStackMapper, VmapAxes};
pub use compile::{SpecializingCompiler, TraceCompiler};
pub use error::TransformError;
pub use state::{SharedState, StateHolder, use_state};

/// Shared, thread-safe procedure over a sequence of operands.
pub type Procedure = Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, TransformError> + Send + Sync>;

/// Procedure with external state threaded through explicitly.
pub type StatefulProcedure = Arc<
    dyn Fn(&StateSnapshot, &[Value]) -> Result<(StateSnapshot, Vec<Value>), TransformError>
        + Send
        + Sync,
>;

/// Wrap a closure as a [`Procedure`].
pub fn procedure<F>(func: F) -> Procedure
where
    F: Fn(&[Value]) -> Result<Vec<Value>, TransformError> + Send + Sync + 'static,
{
    Arc::new(func)
}
