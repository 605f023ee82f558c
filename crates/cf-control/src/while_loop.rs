use cf_cache::{OperandSignature, SpecializationCache};
use cf_core::{BatchAxes, CompatibilityMode, Operand, StateSnapshot, Value};
use cf_lax::{any, select};
use cf_transforms::{
    AxisSpec, BatchMapper, Procedure, StatefulProcedure, TraceCompiler, TransformError, VmapAxes,
};
use std::sync::{Arc, LazyLock};

use crate::batched::{
    has_no_lanes, lane_dims, lane_flags, lift_through_levels, mask_for, rewrap, tag_operands,
    unwrap_batched,
};
use crate::direct::{check_carry, drive_loop, drive_loop_stateful};
use crate::registry::{InstanceCache, PairKey};
use crate::{
    ControlFlowError, ExecutionContext, StepFn, WhileOptions, check_operand_count,
    check_pair_arity, plain_values,
};

static WHILE_TRACERS: LazyLock<InstanceCache<WhileTracer>> =
    LazyLock::new(|| InstanceCache::new("while"));

/// Trace-compiled loop together with the state it was specialized for.
#[derive(Clone)]
enum TracedLoop {
    Pure(Procedure),
    Stateful {
        init: StateSnapshot,
        procedure: StatefulProcedure,
    },
}

/// `while cond(x): x = body(x)` over a fixed pair of step functions.
///
/// Obtain one through [`make_while`]; the same pair always maps to the same
/// live tracer.
pub struct WhileTracer {
    key: PairKey,
    cond: StepFn,
    body: StepFn,
    stateful: bool,
    mode: CompatibilityMode,
    traced: SpecializationCache<TracedLoop>,
    batched: SpecializationCache<Procedure>,
}

/// Tracer for the `(cond, body)` pair.
///
/// `stateful = None` resolves to `true` when either function is bound to a
/// state holder. An existing live tracer for the pair is returned as is.
pub fn make_while(
    cond: StepFn,
    body: StepFn,
    stateful: Option<bool>,
) -> Result<Arc<WhileTracer>, ControlFlowError> {
    make_while_with(
        cond,
        body,
        WhileOptions {
            stateful,
            ..WhileOptions::default()
        },
    )
}

pub fn make_while_with(
    cond: StepFn,
    body: StepFn,
    options: WhileOptions,
) -> Result<Arc<WhileTracer>, ControlFlowError> {
    check_pair_arity(&cond, &body)?;
    let key = (cond.identity(), body.identity());
    Ok(WHILE_TRACERS.get_or_create(key, || {
        let stateful = options
            .stateful
            .unwrap_or(cond.is_bound() || body.is_bound());
        tracing::debug!(
            cond = cond.name(),
            body = body.name(),
            stateful,
            "creating while tracer"
        );
        WhileTracer {
            key,
            cond,
            body,
            stateful,
            mode: options.mode,
            traced: SpecializationCache::new("while/trace"),
            batched: SpecializationCache::new("while/batched"),
        }
    }))
}

impl WhileTracer {
    /// Whether a live tracer exists for this exact pair.
    #[must_use]
    pub fn is_registered(cond: &StepFn, body: &StepFn) -> bool {
        WHILE_TRACERS.contains_live((cond.identity(), body.identity()))
    }

    /// Run the loop on `operands` in the given context.
    pub fn while_loop(
        &self,
        ctx: &ExecutionContext,
        operands: Vec<Operand>,
    ) -> Result<Vec<Operand>, ControlFlowError> {
        if self.stateful {
            return Err(ControlFlowError::StatefulnessMismatch { stateful: true });
        }
        self.check_operands(operands.len())?;

        match ctx {
            ExecutionContext::Eager => {
                let values = plain_values(operands)?;
                let out = drive_loop(
                    self.mode,
                    values,
                    |carry| self.cond.call(carry),
                    |carry| self.body.call(carry),
                )?;
                Ok(out.into_iter().map(Operand::plain).collect())
            }
            ExecutionContext::Trace { compiler } => {
                let values = plain_values(operands)?;
                let signature = OperandSignature::for_values(&values, false);
                let traced = self.traced.get_or_try_build(&signature, || {
                    self.build_traced(compiler.as_ref(), &values)
                })?;
                let TracedLoop::Pure(procedure) = traced else {
                    return Err(ControlFlowError::StatefulnessMismatch { stateful: true });
                };
                let out = procedure(&values)?;
                Ok(out.into_iter().map(Operand::plain).collect())
            }
            ExecutionContext::Batched { compiler, mapper } => {
                let (values, axes, levels) = unwrap_batched(operands)?;
                if has_no_lanes(&values, &axes) {
                    // No lane ever enters the loop.
                    return Ok(rewrap(values, &axes));
                }
                let signature = OperandSignature::for_batched(&values, &axes)?;
                let procedure = self.batched.get_or_try_build(&signature, || {
                    self.build_batched(compiler.as_ref(), mapper.as_ref(), &values, &axes, levels)
                })?;
                let out = procedure(&values)?;
                Ok(rewrap(out, &axes))
            }
        }
    }

    /// Run a stateful loop, threading `state` through every step.
    ///
    /// Only entries the step functions report are read from `state`; the
    /// returned snapshot holds their final values and the caller merges it
    /// back into the state owners.
    pub fn while_loop_stateful(
        &self,
        ctx: &ExecutionContext,
        state: StateSnapshot,
        operands: Vec<Operand>,
    ) -> Result<(StateSnapshot, Vec<Operand>), ControlFlowError> {
        if !self.stateful {
            return Err(ControlFlowError::StatefulnessMismatch { stateful: false });
        }
        self.check_operands(operands.len())?;

        let (final_state, out) = match ctx {
            ExecutionContext::Eager => {
                let values = plain_values(operands)?;
                let (init, cond, body) = self.extract_pair();
                drive_loop_stateful(
                    self.mode,
                    seeded_state(init, &state),
                    values,
                    |s, carry| cond(s, carry),
                    |s, carry| body(s, carry),
                )?
            }
            ExecutionContext::Trace { compiler } => {
                let values = plain_values(operands)?;
                let signature = OperandSignature::for_values(&values, true);
                let traced = self.traced.get_or_try_build(&signature, || {
                    self.build_traced_stateful(compiler.as_ref(), &values)
                })?;
                let TracedLoop::Stateful { init, procedure } = traced else {
                    return Err(ControlFlowError::StatefulnessMismatch { stateful: false });
                };
                procedure(&seeded_state(init, &state), &values)?
            }
            ExecutionContext::Batched { .. } => {
                return Err(ControlFlowError::StatefulBatchingUnsupported);
            }
        };
        Ok((final_state, out.into_iter().map(Operand::plain).collect()))
    }

    /// This tracer as a plain procedure bound to `ctx`, for nesting under an
    /// outer compile or batch map.
    ///
    /// In a batched context every argument holds its lanes along axis 0; see
    /// [`Self::as_batched_procedure`] for other layouts.
    pub fn as_procedure(self: &Arc<Self>, ctx: ExecutionContext) -> Procedure {
        if matches!(ctx, ExecutionContext::Batched { .. }) {
            return self.lanes_procedure(ctx, None);
        }
        let tracer = Arc::clone(self);
        Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
            let operands = args.iter().cloned().map(Operand::plain).collect();
            let out = tracer.while_loop(&ctx, operands)?;
            Ok(out.into_iter().map(Operand::into_value).collect())
        })
    }

    /// Batched procedure whose argument `i` carries its lanes on `axes[i]`.
    /// Outputs keep the same physical layout and come back untagged.
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
            let operands = tag_operands(args, axes.as_deref())?;
            let out = tracer.while_loop(&ctx, operands)?;
            Ok(out.into_iter().map(Operand::into_value).collect())
        })
    }

    #[must_use]
    pub fn is_stateful(&self) -> bool {
        self.stateful
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
        for (function, step) in [("condition", &self.cond), ("body", &self.body)] {
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

    /// Extracted condition and body plus the union of their initial states.
    fn extract_pair(&self) -> (StateSnapshot, StatefulProcedure, StatefulProcedure) {
        let (mut init, cond) = self.cond.extract();
        let (body_init, body) = self.body.extract();
        init.merge(body_init);
        (init, cond, body)
    }

    fn build_traced(
        &self,
        compiler: &dyn TraceCompiler,
        example: &[Value],
    ) -> Result<TracedLoop, ControlFlowError> {
        let cond = compiler.compile("while_cond", self.cond.procedure().clone(), example)?;
        let body = compiler.compile("while_body", self.body.procedure().clone(), example)?;
        let mode = self.mode;
        let fused: Procedure =
            Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
                Ok(drive_loop(mode, args.to_vec(), |c| cond(c), |c| body(c))?)
            });
        let name = format!("while_loop/{}", example.len());
        Ok(TracedLoop::Pure(compiler.compile(&name, fused, example)?))
    }

    fn build_traced_stateful(
        &self,
        compiler: &dyn TraceCompiler,
        example: &[Value],
    ) -> Result<TracedLoop, ControlFlowError> {
        let (init, cond, body) = self.extract_pair();
        let cond = compiler.compile_stateful("while_cond", cond, &init, example)?;
        let body = compiler.compile_stateful("while_body", body, &init, example)?;
        let mode = self.mode;
        let fused: StatefulProcedure = Arc::new(
            move |state: &StateSnapshot,
                  args: &[Value]|
                  -> Result<(StateSnapshot, Vec<Value>), TransformError> {
                Ok(drive_loop_stateful(
                    mode,
                    state.clone(),
                    args.to_vec(),
                    |s, c| cond(s, c),
                    |s, c| body(s, c),
                )?)
            },
        );
        let name = format!("while_loop_stateful/{}", example.len());
        let procedure = compiler.compile_stateful(&name, fused, &init, example)?;
        Ok(TracedLoop::Stateful { init, procedure })
    }

    /// Predicated loop over batched operands.
    ///
    /// Every lane runs the body each iteration; a lane keeps the new value
    /// only while its own condition holds.
    fn build_batched(
        &self,
        compiler: &dyn TraceCompiler,
        mapper: &dyn BatchMapper,
        example: &[Value],
        axes: &[BatchAxes],
        levels: usize,
    ) -> Result<Procedure, ControlFlowError> {
        let cond = lift_through_levels(mapper, self.cond.procedure(), axes, levels, |_| {
            VmapAxes::Uniform(AxisSpec::Batched(0))
        })?;
        let body = lift_through_levels(mapper, self.body.procedure(), axes, levels, |in_axes| {
            VmapAxes::PerArg(in_axes.to_vec())
        })?;

        // Outputs: lane flags first, then one selection mask per operand.
        let mask_axes = axes.to_vec();
        let masks: Procedure =
            Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
                let outputs = cond(args)?;
                let [predicate] = outputs.as_slice() else {
                    return Err(ControlFlowError::NonScalarPredicate {
                        detail: format!("condition returned {} values", outputs.len()),
                    }
                    .into());
                };
                let flags = lane_flags(predicate, &lane_dims(&args[0], &mask_axes[0]))?;
                let mut out = Vec::with_capacity(args.len() + 1);
                for (arg, axes) in args.iter().zip(&mask_axes) {
                    out.push(mask_for(&flags, axes.as_slice(), arg)?);
                }
                out.insert(0, Value::Tensor(flags));
                Ok(out)
            });

        let masks = compiler.compile("while_cond_masks", masks, example)?;
        let body = compiler.compile("while_body_batched", body, example)?;
        let mode = self.mode;
        let fused: Procedure =
            Arc::new(move |args: &[Value]| -> Result<Vec<Value>, TransformError> {
                let mut carry = args.to_vec();
                let mut current = masks(&carry)?;
                while any(&current[0])? {
                    let candidate = body(&carry)?;
                    check_carry(mode, &carry, &candidate)?;
                    carry = carry
                        .iter()
                        .zip(&candidate)
                        .zip(&current[1..])
                        .map(|((old, new), mask)| select(mask, new, old))
                        .collect::<Result<Vec<_>, _>>()?;
                    current = masks(&carry)?;
                }
                Ok(carry)
            });
        let name = format!("while_loop_batched/{}", example.len());
        Ok(compiler.compile(&name, fused, example)?)
    }
}

impl Drop for WhileTracer {
    fn drop(&mut self) {
        WHILE_TRACERS.evict(self.key);
    }
}

impl std::fmt::Debug for WhileTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhileTracer")
            .field("cond", &self.cond)
            .field("body", &self.body)
            .field("stateful", &self.stateful)
            .field("mode", &self.mode)
            .field("traced", &self.traced)
            .field("batched", &self.batched)
            .finish()
    }
}

/// The step functions' initial state, overridden by the caller's entries.
fn seeded_state(init: StateSnapshot, given: &StateSnapshot) -> StateSnapshot {
    let mut state = init;
    state.merge(given.restricted_to(&state));
    state
}
