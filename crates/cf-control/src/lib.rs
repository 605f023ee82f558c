#![forbid(unsafe_code)]

//! Tracing `while`/`cond` control flow.
//!
//! The same step functions run unchanged under three disciplines, picked by
//! the [`ExecutionContext`] passed to each call:
//!
//! - `Eager`: one step at a time, the reference semantics;
//! - `Trace`: condition, body and the whole loop are compiled once per operand
//!   signature and cached on the tracer;
//! - `Batched`: independent lanes whose predicates may diverge advance
//!   together through masked updates.
//!
//! Tracers are deduplicated per function pair: building one for a pair that
//! already has a live tracer returns that tracer.

mod batched;
mod cond;
mod direct;
mod error;
mod registry;
mod step;
mod while_loop;

use cf_core::{CompatibilityMode, Operand, Value};
use cf_transforms::{BatchMapper, TraceCompiler};
use std::sync::Arc;

pub use cond::{CondTracer, make_cond, make_cond_with};
pub use error::ControlFlowError;
pub use step::StepFn;
pub use while_loop::{WhileTracer, make_while, make_while_with};

/// Largest operand count a loop or branch accepts.
pub const MAX_ARITY: usize = 9;

/// Which discipline a `while_loop`/`cond` call runs under.
#[derive(Clone, Default)]
pub enum ExecutionContext {
    #[default]
    Eager,
    Trace {
        compiler: Arc<dyn TraceCompiler>,
    },
    Batched {
        compiler: Arc<dyn TraceCompiler>,
        mapper: Arc<dyn BatchMapper>,
    },
}

impl ExecutionContext {
    #[must_use]
    pub fn eager() -> Self {
        Self::Eager
    }

    #[must_use]
    pub fn trace(compiler: Arc<dyn TraceCompiler>) -> Self {
        Self::Trace { compiler }
    }

    #[must_use]
    pub fn batched(compiler: Arc<dyn TraceCompiler>, mapper: Arc<dyn BatchMapper>) -> Self {
        Self::Batched { compiler, mapper }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Trace { .. } => "trace",
            Self::Batched { .. } => "batched",
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionContext::{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhileOptions {
    /// `None` resolves to whether either step function is bound to state.
    pub stateful: Option<bool>,
    pub mode: CompatibilityMode,
}

impl WhileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stateful(mut self, stateful: bool) -> Self {
        self.stateful = Some(stateful);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CompatibilityMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CondOptions {
    pub mode: CompatibilityMode,
}

impl CondOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CompatibilityMode) -> Self {
        self.mode = mode;
        self
    }
}

pub(crate) fn check_operand_count(count: usize) -> Result<(), ControlFlowError> {
    match count {
        0 => Err(ControlFlowError::EmptyOperands),
        n if n > MAX_ARITY => Err(ControlFlowError::UnsupportedArity {
            max: MAX_ARITY,
            requested: n,
        }),
        _ => Ok(()),
    }
}

/// Declared arities of a function pair must agree and stay within bounds.
pub(crate) fn check_pair_arity(first: &StepFn, second: &StepFn) -> Result<(), ControlFlowError> {
    if let (Some(a), Some(b)) = (first.arity(), second.arity())
        && a != b
    {
        return Err(ControlFlowError::ArityMismatch {
            first: a,
            second: b,
        });
    }
    match first.arity().or(second.arity()) {
        Some(declared) => check_operand_count(declared),
        None => Ok(()),
    }
}

/// Operands outside a batched context must not carry batch axes.
pub(crate) fn plain_values(operands: Vec<Operand>) -> Result<Vec<Value>, ControlFlowError> {
    operands
        .into_iter()
        .enumerate()
        .map(|(position, operand)| {
            if operand.is_batched() {
                Err(ControlFlowError::TypeMismatch {
                    position,
                    detail: "batch-tagged operand outside a batched context",
                })
            } else {
                Ok(operand.value)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        ControlFlowError, ExecutionContext, MAX_ARITY, StepFn, WhileOptions, WhileTracer,
        make_cond, make_while, make_while_with,
    };
    use cf_core::{BatchAxes, CompatibilityMode, Operand, StateSnapshot, Value};
    use cf_lax::{Primitive, eval_binary};
    use cf_test_utils::{FailingCompiler, init_test_tracing, property_test_case_count};
    use cf_transforms::{
        LoopAndStackMapper, SharedState, SpecializingCompiler, StateHolder, TransformError,
    };
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn below(limit: i64) -> StepFn {
        StepFn::pure("below", move |args: &[Value]| {
            Ok(vec![eval_binary(
                Primitive::Lt,
                &args[0],
                &Value::scalar_i64(limit),
            )?])
        })
    }

    fn increment() -> StepFn {
        StepFn::pure("increment", |args: &[Value]| {
            let mut out = args.to_vec();
            out[0] = eval_binary(Primitive::Add, &args[0], &Value::scalar_i64(1))?;
            Ok(out)
        })
    }

    fn trace_ctx() -> ExecutionContext {
        ExecutionContext::trace(Arc::new(SpecializingCompiler::new()))
    }

    fn batched_ctx() -> ExecutionContext {
        ExecutionContext::batched(
            Arc::new(SpecializingCompiler::new()),
            Arc::new(LoopAndStackMapper::new()),
        )
    }

    fn plain(values: &[i64]) -> Vec<Operand> {
        values
            .iter()
            .copied()
            .map(|v| Operand::plain(Value::scalar_i64(v)))
            .collect()
    }

    #[test]
    fn counts_to_ten_in_every_mode() {
        init_test_tracing();
        let tracer = make_while(below(10), increment(), None).expect("tracer");

        let eager = tracer
            .while_loop(&ExecutionContext::Eager, plain(&[0]))
            .expect("eager");
        assert_eq!(eager, plain(&[10]));

        let traced = tracer.while_loop(&trace_ctx(), plain(&[0])).expect("trace");
        assert_eq!(traced, plain(&[10]));

        let lanes = Operand::batched(
            Value::vector_i64(&[0, 5, 9]).expect("vector"),
            BatchAxes::single(0),
        );
        let batched = tracer.while_loop(&batched_ctx(), vec![lanes]).expect("batched");
        assert_eq!(
            batched,
            vec![Operand::batched(
                Value::vector_i64(&[10, 10, 10]).expect("vector"),
                BatchAxes::single(0),
            )]
        );
    }

    #[test]
    fn same_pair_yields_same_tracer() {
        let cond = below(3);
        let body = increment();
        let a = make_while(cond.clone(), body.clone(), None).expect("tracer");
        let b = make_while(cond.clone(), body.clone(), Some(true)).expect("tracer");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!b.is_stateful(), "flag of the first construction wins");

        let c = make_while(cond.clone(), increment(), None).expect("tracer");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn dropped_tracer_leaves_registry() {
        let cond = below(3);
        let body = increment();
        let tracer = make_while(cond.clone(), body.clone(), None).expect("tracer");
        assert!(WhileTracer::is_registered(&cond, &body));
        drop(tracer);
        assert!(!WhileTracer::is_registered(&cond, &body));
    }

    #[test]
    fn arity_bound_is_nine() {
        let cond = below(1);
        let body = StepFn::pure("identity", |args: &[Value]| Ok(args.to_vec()));
        let tracer = make_while(cond, body, None).expect("tracer");

        let err = tracer
            .while_loop(&ExecutionContext::Eager, plain(&[5; MAX_ARITY + 1]))
            .expect_err("ten operands");
        assert!(matches!(
            err,
            ControlFlowError::UnsupportedArity {
                max: 9,
                requested: 10
            }
        ));
        assert!(
            tracer
                .while_loop(&ExecutionContext::Eager, plain(&[5; MAX_ARITY]))
                .is_ok()
        );
    }

    #[test]
    fn declared_arities_must_agree() {
        let err = make_while(below(1).with_arity(1), increment().with_arity(2), None)
            .expect_err("arities differ");
        assert!(matches!(
            err,
            ControlFlowError::ArityMismatch {
                first: 1,
                second: 2
            }
        ));

        let err = make_cond(below(1).with_arity(10), increment().with_arity(10))
            .expect_err("too many");
        assert!(matches!(err, ControlFlowError::UnsupportedArity { .. }));
    }

    #[test]
    fn declared_arity_is_checked_at_call() {
        let tracer = make_while(below(1).with_arity(2), increment(), None).expect("tracer");
        let err = tracer
            .while_loop(&ExecutionContext::Eager, plain(&[0]))
            .expect_err("one operand for a two-operand condition");
        assert!(matches!(
            err,
            ControlFlowError::OperandCountMismatch {
                declared: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn trace_builds_once_per_signature() {
        let tracer = make_while(below(10), increment(), None).expect("tracer");
        let ctx = trace_ctx();
        tracer.while_loop(&ctx, plain(&[0])).expect("first");
        tracer.while_loop(&ctx, plain(&[4])).expect("second");
        assert_eq!(tracer.trace_builds(), 1);

        let float = vec![Operand::plain(Value::scalar_f64(0.5))];
        let out = tracer.while_loop(&ctx, float).expect("float");
        assert_eq!(out, vec![Operand::plain(Value::scalar_f64(10.5))]);
        assert_eq!(tracer.trace_builds(), 2);
        assert_eq!(tracer.trace_cache_len(), 2);
    }

    #[test]
    fn failed_build_is_retried() {
        let tracer = make_while(below(2), increment(), None).expect("tracer");
        let ctx = ExecutionContext::trace(Arc::new(FailingCompiler::failing_first(1)));
        let err = tracer.while_loop(&ctx, plain(&[0])).expect_err("first build fails");
        assert!(matches!(
            err,
            ControlFlowError::Transform(TransformError::CompileFailed { .. })
        ));
        assert_eq!(tracer.trace_cache_len(), 0);

        let out = tracer.while_loop(&ctx, plain(&[0])).expect("rebuild");
        assert_eq!(out, plain(&[2]));
        assert_eq!(tracer.trace_builds(), 1);
    }

    #[test]
    fn strict_mode_rejects_carry_dtype_change() {
        let to_float = StepFn::pure("to_float", |args: &[Value]| {
            Ok(vec![eval_binary(Primitive::Add, &args[0], &Value::scalar_f64(1.0))?])
        });
        let strict = make_while(below(3), to_float.clone(), None).expect("tracer");
        let err = strict
            .while_loop(&ExecutionContext::Eager, plain(&[0]))
            .expect_err("i64 carry became f64");
        assert!(matches!(err, ControlFlowError::CarryShapeChanged { position: 0, .. }));

        let hardened = make_while_with(
            below(3),
            to_float,
            WhileOptions::new().with_mode(CompatibilityMode::Hardened),
        )
        .expect("tracer");
        let out = hardened
            .while_loop(&ExecutionContext::Eager, plain(&[0]))
            .expect("hardened loop");
        assert_eq!(out, vec![Operand::plain(Value::scalar_f64(3.0))]);
    }

    #[test]
    fn tagged_operand_outside_batched_context_is_rejected() {
        let tracer = make_while(below(1), increment(), None).expect("tracer");
        let tagged = Operand::batched(
            Value::vector_i64(&[0]).expect("vector"),
            BatchAxes::single(0),
        );
        let err = tracer
            .while_loop(&ExecutionContext::Eager, vec![tagged])
            .expect_err("tagged operand");
        assert!(matches!(err, ControlFlowError::TypeMismatch { position: 0, .. }));
    }

    #[test]
    fn batched_loop_rejects_scalar_operand() {
        let tracer = make_while(below(1), increment(), None).expect("tracer");
        let err = tracer
            .while_loop(&batched_ctx(), plain(&[0]))
            .expect_err("scalar operand");
        assert!(matches!(err, ControlFlowError::TypeMismatch { position: 0, .. }));
    }

    #[test]
    fn cond_picks_branch_in_eager_and_trace() {
        let double = StepFn::pure("double", |args: &[Value]| {
            Ok(vec![eval_binary(Primitive::Mul, &args[0], &Value::scalar_i64(2))?])
        });
        let negate = StepFn::pure("negate", |args: &[Value]| {
            Ok(vec![cf_lax::eval_primitive(
                Primitive::Neg,
                args,
                &std::collections::BTreeMap::new(),
            )?])
        });
        let tracer = make_cond(double, negate).expect("tracer");
        for ctx in [ExecutionContext::Eager, trace_ctx()] {
            let yes = tracer
                .cond(&ctx, Operand::plain(Value::scalar_bool(true)), plain(&[4]))
                .expect("true branch");
            assert_eq!(yes, plain(&[8]));
            let no = tracer
                .cond(&ctx, Operand::plain(Value::scalar_i64(0)), plain(&[4]))
                .expect("false branch");
            assert_eq!(no, plain(&[-4]));
        }
    }

    #[test]
    fn batched_cond_runs_both_branches() {
        let true_calls = Arc::new(AtomicUsize::new(0));
        let false_calls = Arc::new(AtomicUsize::new(0));
        let on_true = {
            let calls = Arc::clone(&true_calls);
            StepFn::pure("plus_hundred", move |args: &[Value]| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![eval_binary(Primitive::Add, &args[0], &Value::scalar_i64(100))?])
            })
        };
        let on_false = {
            let calls = Arc::clone(&false_calls);
            StepFn::pure("minus_hundred", move |args: &[Value]| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![eval_binary(Primitive::Sub, &args[0], &Value::scalar_i64(100))?])
            })
        };
        let tracer = make_cond(on_true, on_false).expect("tracer");
        let predicate = Operand::batched(
            Value::vector_bool(&[true, true, true]).expect("vector"),
            BatchAxes::single(0),
        );
        let x = Operand::batched(
            Value::vector_i64(&[1, 2, 3]).expect("vector"),
            BatchAxes::single(0),
        );
        let out = tracer
            .cond(&batched_ctx(), predicate, vec![x])
            .expect("batched cond");
        assert_eq!(
            out,
            vec![Operand::batched(
                Value::vector_i64(&[101, 102, 103]).expect("vector"),
                BatchAxes::single(0),
            )]
        );
        assert_eq!(true_calls.load(Ordering::SeqCst), 3);
        assert_eq!(false_calls.load(Ordering::SeqCst), 3);
        assert_eq!(tracer.batched_builds(), 1);
    }

    #[test]
    fn stateful_loop_in_trace_mode_leaves_holder_untouched() {
        let mut initial = StateSnapshot::new();
        initial.insert("steps", Value::scalar_i64(0));
        let holder = Arc::new(SharedState::new(initial.clone()));

        let body = {
            let state = Arc::clone(&holder);
            StepFn::bound("counted_increment", holder.clone(), move |args: &[Value]| {
                let steps = state.get("steps").unwrap_or(Value::scalar_i64(0));
                state.set("steps", eval_binary(Primitive::Add, &steps, &Value::scalar_i64(1))?);
                Ok(vec![eval_binary(Primitive::Add, &args[0], &Value::scalar_i64(1))?])
            })
        };
        let tracer = make_while(below(4), body, None).expect("tracer");
        assert!(tracer.is_stateful());

        for ctx in [ExecutionContext::Eager, trace_ctx()] {
            let (state, out) = tracer
                .while_loop_stateful(&ctx, holder.state(), plain(&[0]))
                .expect("stateful loop");
            assert_eq!(out, plain(&[4]));
            assert_eq!(state.get("steps"), Some(&Value::scalar_i64(4)));
            assert_eq!(holder.state(), initial, "{} run mutated the holder", ctx.as_str());
        }

        let err = tracer
            .while_loop(&ExecutionContext::Eager, plain(&[0]))
            .expect_err("stateful tracer needs state");
        assert!(matches!(
            err,
            ControlFlowError::StatefulnessMismatch { stateful: true }
        ));
        let err = tracer
            .while_loop_stateful(&batched_ctx(), StateSnapshot::new(), plain(&[0]))
            .expect_err("no stateful batching");
        assert!(matches!(err, ControlFlowError::StatefulBatchingUnsupported));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(property_test_case_count()))]

        #[test]
        fn every_mode_agrees_with_eager(
            limit in -3_i64..15,
            starts in proptest::collection::vec(-5_i64..20, 1..6),
        ) {
            let tracer = make_while(below(limit), increment(), None).expect("tracer");
            let ctx = trace_ctx();
            let mut expected = Vec::with_capacity(starts.len());
            for start in &starts {
                let eager = tracer
                    .while_loop(&ExecutionContext::Eager, plain(&[*start]))
                    .expect("eager");
                let traced = tracer.while_loop(&ctx, plain(&[*start])).expect("trace");
                prop_assert_eq!(&eager, &traced);
                expected.push(eager[0].value.as_i64_scalar().expect("scalar"));
            }

            let lanes = Operand::batched(
                Value::vector_i64(&starts).expect("vector"),
                BatchAxes::single(0),
            );
            let batched = tracer.while_loop(&batched_ctx(), vec![lanes]).expect("batched");
            prop_assert_eq!(
                batched,
                vec![Operand::batched(
                    Value::vector_i64(&expected).expect("vector"),
                    BatchAxes::single(0),
                )]
            );
        }
    }
}
