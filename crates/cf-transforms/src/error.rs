use cf_core::ValueError;
use cf_lax::EvalError;
use std::sync::Arc;

/// Failure raised by a compiled or batch-mapped procedure, or while building one.
#[derive(Debug, Clone)]
pub enum TransformError {
    /// A compiled procedure received operands outside its specialization.
    SpecializationMismatch {
        procedure: String,
        detail: String,
    },
    ArityMismatch {
        procedure: String,
        expected: usize,
        actual: usize,
    },
    /// A compiler refused to build a procedure.
    CompileFailed {
        procedure: String,
        detail: String,
    },
    AxisOutOfBounds {
        position: usize,
        axis: i32,
        rank: usize,
    },
    BatchedScalar {
        position: usize,
    },
    LaneCountMismatch {
        position: usize,
        expected: usize,
        actual: usize,
    },
    NoBatchedInputs,
    EmptyBatch,
    InconsistentOutputArity {
        expected: usize,
        actual: usize,
    },
    OutAxesArity {
        expected: usize,
        actual: usize,
    },
    Eval(EvalError),
    Value(ValueError),
    /// Error raised by a nested layer (for example a control-flow tracer run
    /// inside a batch-mapped procedure).
    Nested(Arc<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpecializationMismatch { procedure, detail } => {
                write!(f, "{procedure}: operands outside specialization: {detail}")
            }
            Self::ArityMismatch {
                procedure,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "{procedure}: expected {expected} operands, got {actual}"
                )
            }
            Self::CompileFailed { procedure, detail } => {
                write!(f, "failed to compile {procedure}: {detail}")
            }
            Self::AxisOutOfBounds {
                position,
                axis,
                rank,
            } => {
                write!(
                    f,
                    "batch axis {axis} out of bounds for rank {rank} (argument {position})"
                )
            }
            Self::BatchedScalar { position } => {
                write!(f, "argument {position} is a scalar but was marked batched")
            }
            Self::LaneCountMismatch {
                position,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "argument {position} has {actual} lanes, expected {expected}"
                )
            }
            Self::NoBatchedInputs => write!(f, "batch map needs at least one batched argument"),
            Self::EmptyBatch => write!(f, "batch map over zero lanes"),
            Self::InconsistentOutputArity { expected, actual } => {
                write!(
                    f,
                    "lane produced {actual} outputs, earlier lanes produced {expected}"
                )
            }
            Self::OutAxesArity { expected, actual } => {
                write!(
                    f,
                    "out axes describe {actual} outputs, procedure produced {expected}"
                )
            }
            Self::Eval(err) => write!(f, "eval error: {err}"),
            Self::Value(err) => write!(f, "value error: {err}"),
            Self::Nested(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Eval(err) => Some(err),
            Self::Value(err) => Some(err),
            Self::Nested(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<EvalError> for TransformError {
    fn from(err: EvalError) -> Self {
        Self::Eval(err)
    }
}

impl From<ValueError> for TransformError {
    fn from(err: ValueError) -> Self {
        Self::Value(err)
    }
}
