//! Batch-map seam and the loop-and-stack reference mapper.

use cf_core::Value;
use cf_lax::{slice_along_axis, stack_along_axis};
use std::sync::Arc;

use crate::{Procedure, TransformError};

/// Batch axis of one input or output of a batch-mapped procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSpec {
    /// Batched along the given axis. Negative axes count from the end.
    Batched(i32),
    /// Not batched: inputs are broadcast to every lane, outputs are taken
    /// from the first lane.
    NotBatched,
}

impl AxisSpec {
    /// Resolve to a concrete axis for a value of `rank`; `None` when out of range.
    #[must_use]
    pub fn resolve(self, rank: usize) -> Option<usize> {
        match self {
            Self::NotBatched => None,
            Self::Batched(axis) => {
                let resolved = if axis >= 0 {
                    axis as i64
                } else {
                    rank as i64 + i64::from(axis)
                };
                (0..rank as i64)
                    .contains(&resolved)
                    .then_some(resolved as usize)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmapAxes {
    /// Same axis for every output.
    Uniform(AxisSpec),
    /// One axis per output.
    PerArg(Vec<AxisSpec>),
}

impl Default for VmapAxes {
    fn default() -> Self {
        Self::Uniform(AxisSpec::Batched(0))
    }
}

impl VmapAxes {
    fn for_outputs(&self, count: usize) -> Result<Vec<AxisSpec>, TransformError> {
        match self {
            Self::Uniform(spec) => Ok(vec![*spec; count]),
            Self::PerArg(specs) if specs.len() == count => Ok(specs.clone()),
            Self::PerArg(specs) => Err(TransformError::OutAxesArity {
                expected: count,
                actual: specs.len(),
            }),
        }
    }
}

pub trait BatchMapper: Send + Sync {
    /// Lift `procedure` so it runs independently for every lane of the
    /// batched inputs.
    fn batch_map(
        &self,
        procedure: Procedure,
        in_axes: &[AxisSpec],
        out_axes: &VmapAxes,
    ) -> Result<Procedure, TransformError>;
}

/// Runs the procedure once per lane and stacks the results.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopAndStackMapper;

impl LoopAndStackMapper {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Lane count shared by every batched argument, plus each argument's resolved axis.
fn resolve_lanes(
    args: &[Value],
    in_axes: &[AxisSpec],
) -> Result<(usize, Vec<Option<usize>>), TransformError> {
    let mut lanes: Option<usize> = None;
    let mut resolved = Vec::with_capacity(args.len());
    for (position, (arg, spec)) in args.iter().zip(in_axes).enumerate() {
        let AxisSpec::Batched(axis) = *spec else {
            resolved.push(None);
            continue;
        };
        let Value::Tensor(tensor) = arg else {
            return Err(TransformError::BatchedScalar { position });
        };
        let resolved_axis = spec
            .resolve(tensor.rank())
            .ok_or(TransformError::AxisOutOfBounds {
                position,
                axis,
                rank: tensor.rank(),
            })?;
        let size = tensor.shape.dims[resolved_axis] as usize;
        match lanes {
            None => lanes = Some(size),
            Some(expected) if expected != size => {
                return Err(TransformError::LaneCountMismatch {
                    position,
                    expected,
                    actual: size,
                });
            }
            Some(_) => {}
        }
        resolved.push(Some(resolved_axis));
    }

    match lanes {
        None => Err(TransformError::NoBatchedInputs),
        Some(0) => Err(TransformError::EmptyBatch),
        Some(lanes) => Ok((lanes, resolved)),
    }
}

fn run_loop_and_stack(
    procedure: &Procedure,
    in_axes: &[AxisSpec],
    out_axes: &VmapAxes,
    args: &[Value],
) -> Result<Vec<Value>, TransformError> {
    if args.len() != in_axes.len() {
        return Err(TransformError::ArityMismatch {
            procedure: "batch_map".to_owned(),
            expected: in_axes.len(),
            actual: args.len(),
        });
    }
    let (lanes, resolved) = resolve_lanes(args, in_axes)?;

    let mut per_output: Vec<Vec<Value>> = Vec::new();
    for lane in 0..lanes {
        let mapped = args
            .iter()
            .zip(&resolved)
            .map(|(arg, axis)| match axis {
                Some(axis) => slice_along_axis(arg, *axis, lane).map_err(TransformError::from),
                None => Ok(arg.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = procedure(&mapped)?;
        if lane == 0 {
            per_output = vec![Vec::with_capacity(lanes); outputs.len()];
        } else if outputs.len() != per_output.len() {
            return Err(TransformError::InconsistentOutputArity {
                expected: per_output.len(),
                actual: outputs.len(),
            });
        }
        for (slot, value) in per_output.iter_mut().zip(outputs) {
            slot.push(value);
        }
    }

    let out_specs = out_axes.for_outputs(per_output.len())?;
    per_output
        .into_iter()
        .zip(out_specs)
        .enumerate()
        .map(|(position, (values, spec))| match spec {
            AxisSpec::NotBatched => values.into_iter().next().ok_or(TransformError::EmptyBatch),
            AxisSpec::Batched(axis) => {
                let rank = values.first().map_or(0, Value::rank) + 1;
                let target = spec.resolve(rank).ok_or(TransformError::AxisOutOfBounds {
                    position,
                    axis,
                    rank,
                })?;
                Ok(stack_along_axis(&values, target)?)
            }
        })
        .collect()
}

impl BatchMapper for LoopAndStackMapper {
    fn batch_map(
        &self,
        procedure: Procedure,
        in_axes: &[AxisSpec],
        out_axes: &VmapAxes,
    ) -> Result<Procedure, TransformError> {
        let in_axes = in_axes.to_vec();
        let out_axes = out_axes.clone();
        tracing::trace!(inputs = in_axes.len(), "lifted procedure through batch map");
        Ok(Arc::new(move |args: &[Value]| {
            run_loop_and_stack(&procedure, &in_axes, &out_axes, args)
        }))
    }
}
