use cf_cache::{OperandSignature, SpecializationCache};
use cf_core::{BatchAxes, CompatibilityMode, Operand, Value};
use cf_lax::select;
use cf_transforms::{AxisSpec, BatchMapper, Procedure, TraceCompiler, TransformError, VmapAxes};
use std::sync::{Arc, LazyLock};

use crate::batched::{lift_through_levels, mask_for, predicate_lanes, tag_operands, unwrap_batched};
use crate::direct::{check_branches, run_branch};
use crate::registry::{InstanceCache, PairKey};
use crate::{
    CondOptions, ControlFlowError, ExecutionContext, StepFn, check_operand_count,
    check_pair_arity, plain_values,
};

static COND_TRACERS: LazyLock<InstanceCache<CondTracer>> =
    LazyLock::new(|| InstanceCache::new("cond"));

/// `on_true(x) if predicate else on_false(x)` over a fixed pair of branches.
pub struct CondTracer {
    key: PairKey,
    on_true: StepFn,
    on_false: StepFn,
    mode: CompatibilityMode,
    traced: SpecializationCache<Procedure>,
    batched: SpecializationCache<Procedure>,
}

pub fn make_cond(on_true: StepFn, on_false: StepFn) -> Result<Arc<CondTracer>, ControlFlowError> {
    make_cond_with(on_true, on_false, CondOptions::default())
}

pub fn make_cond_with(
    on_true: StepFn,
    on_false: StepFn,
    options: CondOptions,
) -> Result<Arc<CondTracer>, ControlFlowError> {
    check_pair_arity(&on_true, &on_false)?;
    let key = (on_true.identity(), on_false.identity());
    Ok(COND_TRACERS.get_or_create(key, || {
        tracing::debug!(
            on_true = on_true.name(),
            on_false = on_false.name(),
            "creating cond tracer"
        );
        CondTracer {
            key,
            on_true,
            on_false,
            mode: options.mode,
            traced: SpecializationCache::new("cond/trace"),
            batched: SpecializationCache::new("cond/batched"),
        }
    }))
}

impl CondTracer {
    #[must_use]
    pub fn is_registered(on_true: &StepFn, on_false: &StepFn) -> bool {
        COND_TRACERS.contains_live((on_true.identity(), on_false.identity()))
    }

    /// Pick a branch by `predicate` and run it on `operands`.
    ///
    /// In a batched context both branches run for every lane and each lane
    /// keeps the result its own predicate selects. Operand positions in errors
    /// count the predicate as position 0.
    pub fn cond(
        &self,
        ctx: &ExecutionContext,
        predicate: Operand,
        operands: Vec<Operand>,
    ) -> Result<Vec<Operand>, ControlFlowError> {
        self.check_operands(operands.len())?;

        let mut all = Vec::with_capacity(operands.len() + 1);
        all.push(predicate);
        all.extend(operands);

        match ctx {
            ExecutionContext::Eager => {
                let values = plain_values(all)?;
                let out = run_branch(
                    &values[0],
                    &values[1..],
                    |args| self.on_true.call(args),
                    |args| self.on_false.call(args),
                )?;
                Ok(out.into_iter().map(Operand::plain).collect())
            }
            ExecutionContext::Trace { compiler } => {
                let values = plain_values(all)?;
                let signature = OperandSignature::for_values(&values, false);
                let procedure = self.traced.get_or_try_build(&signature, || {
                    self.build_traced(compiler.as_ref(), &values)
                })?;
                let out = procedure(&values)?;
                Ok(out.into_iter().map(Operand::plain).collect())
            }
            ExecutionContext::Batched { compiler, mapper } => {
                let (values, axes, levels) = unwrap_batched(all)?;
                let signature = OperandSignature::for_batched(&values, &axes)?;
                let procedure = self.batched.get_or_try_build(&signature, || {
                    self.build_batched(compiler.as_ref(), mapper.as_ref(), &values, &axes, levels)
                })?;
                let out = procedure(&values)?;
                let leading = BatchAxes::leading(levels);
                Ok(out
                    .into_iter()
                    .map(|value| Operand::batched(value, leading.clone()))
                    .collect())
            }
        }
    }

    /// This tracer as a procedure taking `[predicate, operands..]`.
    ///
    /// In a batched context every argument, the predicate included, holds its
    /// lanes along axis 0; see [`Self::as_batched_procedure`] for other layouts.
    pub fn as_procedure(self: &Arc<Self>, ctx: ExecutionContext) -> Procedure {
        if matches!(ctx, ExecutionContext::Batched { .. }) {
            return self.lanes_procedure(ctx, None);
        }
        let tracer = Arc::clone(self);
        Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
            let Some((predicate, operands)) = args.split_first() else {
                return Err(ControlFlowError::EmptyOperands.into());
            };
            let out = tracer.cond(
                &ctx,
                Operand::plain(predicate.clone()),
                operands.iter().cloned().map(Operand::plain).collect(),
            )?;
            Ok(out.into_iter().map(Operand::into_value).collect())
        })
    }

    /// Batched procedure taking `[predicate, operands..]`, argument `i`
    /// carrying its lanes on `axes[i]`. Outputs hold the lanes on the leading
    /// axes and come back untagged.
    pub fn as_batched_procedure(
        self: &Arc<Self>,
        ctx: ExecutionContext,
        axes: Vec<BatchAxes>,
    ) -> Procedure {
        self.lanes_procedure(ctx, Some(axes))
    }

    fn lanes_procedure(
        self: &Arc<Self>,
        ctx: ExecutionContext,
        axes: Option<Vec<BatchAxes>>,
    ) -> Procedure {
        let tracer = Arc::clone(self);
        Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
            let mut operands = tag_operands(args, axes.as_deref())?.into_iter();
            let Some(predicate) = operands.next() else {
                return Err(ControlFlowError::EmptyOperands.into());
            };
            let out = tracer.cond(&ctx, predicate, operands.collect())?;
            Ok(out.into_iter().map(Operand::into_value).collect())
        })
    }

    #[must_use]
    pub fn mode(&self) -> CompatibilityMode {
        self.mode
    }

    #[must_use]
    pub fn trace_builds(&self) -> usize {
        self.traced.build_count()
    }

    #[must_use]
    pub fn batched_builds(&self) -> usize {
        self.batched.build_count()
    }

    #[must_use]
    pub fn trace_cache_len(&self) -> usize {
        self.traced.len()
    }

    #[must_use]
    pub fn batched_cache_len(&self) -> usize {
        self.batched.len()
    }

    fn check_operands(&self, count: usize) -> Result<(), ControlFlowError> {
        check_operand_count(count)?;
        for (function, step) in [("true branch", &self.on_true), ("false branch", &self.on_false)] {
            if let Some(declared) = step.arity()
                && declared != count
            {
                return Err(ControlFlowError::OperandCountMismatch {
                    function,
                    declared,
                    actual: count,
                });
            }
        }
        Ok(())
    }

    fn build_traced(
        &self,
        compiler: &dyn TraceCompiler,
        example: &[Value],
    ) -> Result<Procedure, ControlFlowError> {
        let operands = &example[1..];
        let on_true = compiler.compile("cond_true", self.on_true.procedure().clone(), operands)?;
        let on_false = compiler.compile("cond_false", self.on_false.procedure().clone(), operands)?;
        let fused: Procedure =
            Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
                Ok(run_branch(
                    &args[0],
                    &args[1..],
                    |a| on_true(a),
                    |a| on_false(a),
                )?)
            });
        let name = format!("cond/{}", operands.len());
        Ok(compiler.compile(&name, fused, example)?)
    }

    /// Both branches lifted over every lane, selected per lane.
    ///
    /// Branch outputs come back with the lane axes leading, one per level.
    fn build_batched(
        &self,
        compiler: &dyn TraceCompiler,
        mapper: &dyn BatchMapper,
        example: &[Value],
        axes: &[BatchAxes],
        levels: usize,
    ) -> Result<Procedure, ControlFlowError> {
        let operand_axes = &axes[1..];
        let lane_out = |_: &[AxisSpec]| VmapAxes::Uniform(AxisSpec::Batched(0));
        let on_true = lift_through_levels(
            mapper,
            self.on_true.procedure(),
            operand_axes,
            levels,
            lane_out,
        )?;
        let on_false = lift_through_levels(
            mapper,
            self.on_false.procedure(),
            operand_axes,
            levels,
            lane_out,
        )?;
        let on_true = compiler.compile("cond_true_batched", on_true, &example[1..])?;
        let on_false = compiler.compile("cond_false_batched", on_false, &example[1..])?;

        let mode = self.mode;
        let predicate_axes = axes[0].clone();
        let leading: Vec<usize> = (0..levels).collect();
        let fused: Procedure =
            Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
                let operands = &args[1..];
                let taken = on_true(operands)?;
                let skipped = on_false(operands)?;
                check_branches(mode, &taken, &skipped)?;
                let flags = predicate_lanes(&args[0], &predicate_axes)?;
                let mut out = Vec::with_capacity(taken.len());
                for (yes, no) in taken.iter().zip(&skipped) {
                    let mask = mask_for(&flags, &leading, yes)?;
                    out.push(select(&mask, yes, no)?);
                }
                Ok(out)
            });
        let name = format!("cond_batched/{}", operand_axes.len());
        Ok(compiler.compile(&name, fused, example)?)
    }
}

impl Drop for CondTracer {
    fn drop(&mut self) {
        COND_TRACERS.evict(self.key);
    }
}

impl std::fmt::Debug for CondTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondTracer")
            .field("on_true", &self.on_true)
            .field("on_false", &self.on_false)
            .field("mode", &self.mode)
            .field("traced", &self.traced)
            .field("batched", &self.batched)
            .finish()
    }
}
