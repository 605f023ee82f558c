use cf_cache::CacheKeyError;
use cf_core::ValueError;
use cf_transforms::TransformError;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ControlFlowError {
    /// More operands than the fixed maximum arity.
    UnsupportedArity {
        max: usize,
        requested: usize,
    },
    EmptyOperands,
    /// Operand at `position` cannot be used in the active execution context.
    TypeMismatch {
        position: usize,
        detail: &'static str,
    },
    /// The two step functions of a pair declare different arities.
    ArityMismatch {
        first: usize,
        second: usize,
    },
    /// Operand count differs from the arity a step function declared.
    OperandCountMismatch {
        function: &'static str,
        declared: usize,
        actual: usize,
    },
    NonScalarPredicate {
        detail: String,
    },
    CarryArityChanged {
        expected: usize,
        actual: usize,
    },
    CarryShapeChanged {
        position: usize,
        detail: String,
    },
    BatchLevelMismatch {
        position: usize,
        expected: usize,
        actual: usize,
    },
    InvalidBatchAxes {
        position: usize,
        source: ValueError,
    },
    BranchArityMismatch {
        on_true: usize,
        on_false: usize,
    },
    BranchShapeMismatch {
        position: usize,
        detail: String,
    },
    /// Pure entry point called on a stateful tracer or the reverse.
    StatefulnessMismatch {
        stateful: bool,
    },
    StatefulBatchingUnsupported,
    Cache(CacheKeyError),
    Transform(TransformError),
}

impl std::fmt::Display for ControlFlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedArity { max, requested } => {
                write!(
                    f,
                    "unsupported arity: {requested} operands requested, at most {max} supported"
                )
            }
            Self::EmptyOperands => write!(f, "control flow needs at least one operand"),
            Self::TypeMismatch { position, detail } => {
                write!(f, "type mismatch for operand {position}: {detail}")
            }
            Self::ArityMismatch { first, second } => {
                write!(
                    f,
                    "step functions declare different arities: {first} and {second}"
                )
            }
            Self::OperandCountMismatch {
                function,
                declared,
                actual,
            } => {
                write!(
                    f,
                    "{function} declares {declared} operands, called with {actual}"
                )
            }
            Self::NonScalarPredicate { detail } => {
                write!(f, "predicate must be a single boolean-like value: {detail}")
            }
            Self::CarryArityChanged { expected, actual } => {
                write!(
                    f,
                    "loop body returned {actual} values for a carry of {expected}"
                )
            }
            Self::CarryShapeChanged { position, detail } => {
                write!(f, "loop body changed carry element {position}: {detail}")
            }
            Self::BatchLevelMismatch {
                position,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "operand {position} carries {actual} batch levels, expected {expected}"
                )
            }
            Self::InvalidBatchAxes { position, source } => {
                write!(f, "operand {position} has invalid batch axes: {source}")
            }
            Self::BranchArityMismatch { on_true, on_false } => {
                write!(
                    f,
                    "branches return different result counts: {on_true} and {on_false}"
                )
            }
            Self::BranchShapeMismatch { position, detail } => {
                write!(f, "branches disagree on result {position}: {detail}")
            }
            Self::StatefulnessMismatch { stateful: true } => {
                write!(f, "stateful tracer must be driven with an explicit state")
            }
            Self::StatefulnessMismatch { stateful: false } => {
                write!(f, "pure tracer cannot thread external state")
            }
            Self::StatefulBatchingUnsupported => {
                write!(f, "stateful loops cannot run in a batched context")
            }
            Self::Cache(err) => write!(f, "cache key error: {err}"),
            Self::Transform(err) => write!(f, "transform error: {err}"),
        }
    }
}

impl std::error::Error for ControlFlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidBatchAxes { source, .. } => Some(source),
            Self::Cache(err) => Some(err),
            Self::Transform(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CacheKeyError> for ControlFlowError {
    fn from(value: CacheKeyError) -> Self {
        Self::Cache(value)
    }
}

/// Control-flow errors raised inside a nested procedure come back wrapped in
/// [`TransformError::Nested`]; they are unwrapped here so callers see the
/// original variant.
impl From<TransformError> for ControlFlowError {
    fn from(value: TransformError) -> Self {
        if let TransformError::Nested(inner) = &value
            && let Some(err) = inner.downcast_ref::<ControlFlowError>()
        {
            return err.clone();
        }
        Self::Transform(value)
    }
}

impl From<ControlFlowError> for TransformError {
    fn from(value: ControlFlowError) -> Self {
        match value {
            ControlFlowError::Transform(inner) => inner,
            other => TransformError::Nested(Arc::new(other)),
        }
    }
}
