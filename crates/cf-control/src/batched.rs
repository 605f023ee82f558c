//! Helpers for the predicated batch executor.
//!
//! A batched operand is a physical tensor plus the axis carrying each nesting
//! level. Step functions are lifted through the batch mapper once per level
//! so that they see one lane at a time, and per-lane predicates are spread
//! back over the physical layout as selection masks.

use cf_core::{BatchAxes, DType, Literal, Operand, Shape, TensorValue, Value};
use cf_lax::{broadcast_lanes, move_axes_to_front};
use cf_transforms::{AxisSpec, BatchMapper, Procedure, TransformError, VmapAxes};

use crate::ControlFlowError;

/// Unwrap batch-tagged operands into physical values and their axes.
///
/// Every operand must be a tensor tagged with the same number of levels.
pub(crate) fn unwrap_batched(
    operands: Vec<Operand>,
) -> Result<(Vec<Value>, Vec<BatchAxes>, usize), ControlFlowError> {
    let mut levels: Option<usize> = None;
    let mut values = Vec::with_capacity(operands.len());
    let mut axes = Vec::with_capacity(operands.len());
    for (position, operand) in operands.into_iter().enumerate() {
        let Value::Tensor(tensor) = &operand.value else {
            return Err(ControlFlowError::TypeMismatch {
                position,
                detail: "batched operands must be tensors",
            });
        };
        if !operand.is_batched() {
            return Err(ControlFlowError::TypeMismatch {
                position,
                detail: "operand carries no batch axes in a batched context",
            });
        }
        operand
            .batch_axes
            .validate(tensor.rank())
            .map_err(|source| ControlFlowError::InvalidBatchAxes { position, source })?;

        let operand_levels = operand.batch_axes.levels();
        match levels {
            None => levels = Some(operand_levels),
            Some(expected) if expected != operand_levels => {
                return Err(ControlFlowError::BatchLevelMismatch {
                    position,
                    expected,
                    actual: operand_levels,
                });
            }
            Some(_) => {}
        }
        values.push(operand.value);
        axes.push(operand.batch_axes);
    }
    let levels = levels.ok_or(ControlFlowError::EmptyOperands)?;
    Ok((values, axes, levels))
}

/// Per-level input axes: the axis each operand uses once outer levels are gone.
pub(crate) fn level_in_axes(axes: &[BatchAxes], level: usize) -> Vec<AxisSpec> {
    axes.iter()
        .map(|axes| AxisSpec::Batched(axes.relative_axis(level) as i32))
        .collect()
}

/// Lift `procedure` through one batch map per level, innermost level first,
/// so the outermost level ends up as the outer wrapper.
pub(crate) fn lift_through_levels(
    mapper: &dyn BatchMapper,
    procedure: &Procedure,
    axes: &[BatchAxes],
    levels: usize,
    out_axes: impl Fn(&[AxisSpec]) -> VmapAxes,
) -> Result<Procedure, TransformError> {
    let mut lifted = procedure.clone();
    for level in (0..levels).rev() {
        let in_axes = level_in_axes(axes, level);
        lifted = mapper.batch_map(lifted, &in_axes, &out_axes(&in_axes))?;
    }
    Ok(lifted)
}

/// Lane sizes of a batched value, outermost level first.
pub(crate) fn lane_dims(value: &Value, axes: &BatchAxes) -> Vec<u32> {
    let dims = value.shape().dims;
    axes.as_slice()
        .iter()
        .map(|axis| dims.get(*axis).copied().unwrap_or(0))
        .collect()
}

/// Collapse a lifted predicate (lane axes first, then the per-lane result)
/// into a boolean tensor with exactly the lane dimensions.
pub(crate) fn lane_flags(
    predicate: &Value,
    lanes: &[u32],
) -> Result<TensorValue, ControlFlowError> {
    let lane_count = lanes.iter().map(|dim| *dim as usize).product::<usize>();
    let elements = match predicate {
        Value::Scalar(literal) if lane_count == 1 => vec![*literal],
        Value::Scalar(_) => Vec::new(),
        Value::Tensor(tensor) => {
            let leading_match = tensor.shape.dims.len() >= lanes.len()
                && tensor.shape.dims[..lanes.len()] == *lanes;
            if leading_match {
                tensor.elements.clone()
            } else {
                Vec::new()
            }
        }
    };
    if elements.len() != lane_count {
        return Err(ControlFlowError::NonScalarPredicate {
            detail: format!(
                "per-lane predicate of shape {:?} does not reduce to lanes {:?}",
                predicate.shape().dims,
                lanes
            ),
        });
    }

    let flags = elements
        .into_iter()
        .map(|literal| Literal::Bool(literal.truthy()))
        .collect::<Vec<_>>();
    Ok(TensorValue::new(
        DType::Bool,
        Shape {
            dims: lanes.to_vec(),
        },
        flags,
    )
    .map_err(TransformError::from)?)
}

/// Lane flags of a batch-tagged predicate: its lane axes are moved to the
/// front in level order before collapsing.
pub(crate) fn predicate_lanes(
    predicate: &Value,
    axes: &BatchAxes,
) -> Result<TensorValue, ControlFlowError> {
    let lanes = lane_dims(predicate, axes);
    let front = move_axes_to_front(predicate, axes.as_slice()).map_err(TransformError::from)?;
    lane_flags(&front, &lanes)
}

/// Selection mask for `target` from lane flags, following `lane_axes`.
pub(crate) fn mask_for(
    flags: &TensorValue,
    lane_axes: &[usize],
    target: &Value,
) -> Result<Value, ControlFlowError> {
    let Value::Tensor(tensor) = target else {
        return Err(ControlFlowError::NonScalarPredicate {
            detail: "cannot spread lane flags over a scalar result".to_owned(),
        });
    };
    let mask = broadcast_lanes(flags, lane_axes, tensor).map_err(TransformError::from)?;
    Ok(Value::Tensor(mask))
}

/// Tag procedure arguments for a batched call: argument `i` carries its
/// lanes on `axes[i]`, or on axis 0 when no layout is given.
pub(crate) fn tag_operands(
    args: &[Value],
    axes: Option<&[BatchAxes]>,
) -> Result<Vec<Operand>, ControlFlowError> {
    let Some(axes) = axes else {
        return Ok(args
            .iter()
            .map(|value| Operand::batched(value.clone(), BatchAxes::single(0)))
            .collect());
    };
    if axes.len() != args.len() {
        return Err(ControlFlowError::OperandCountMismatch {
            function: "batched procedure",
            declared: axes.len(),
            actual: args.len(),
        });
    }
    Ok(args
        .iter()
        .zip(axes)
        .map(|(value, axes)| Operand::batched(value.clone(), axes.clone()))
        .collect())
}

/// Whether any nesting level of the first operand has no lanes.
pub(crate) fn has_no_lanes(values: &[Value], axes: &[BatchAxes]) -> bool {
    match (values.first(), axes.first()) {
        (Some(value), Some(axes)) => lane_dims(value, axes).contains(&0),
        _ => false,
    }
}

/// Tag every output with the same batch axes.
pub(crate) fn rewrap(values: Vec<Value>, axes: &[BatchAxes]) -> Vec<Operand> {
    values
        .into_iter()
        .zip(axes)
        .map(|(value, axes)| Operand::batched(value, axes.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{lane_flags, predicate_lanes, unwrap_batched};
    use crate::ControlFlowError;
    use cf_core::{BatchAxes, DType, Literal, Operand, Shape, TensorValue, Value};

    #[test]
    fn unwrap_rejects_scalars_and_untagged_tensors() {
        let err = unwrap_batched(vec![Operand::batched(
            Value::scalar_i64(1),
            BatchAxes::single(0),
        )])
        .expect_err("scalar");
        assert!(matches!(err, ControlFlowError::TypeMismatch { position: 0, .. }));

        let err = unwrap_batched(vec![
            Operand::batched(Value::vector_i64(&[1]).expect("vector"), BatchAxes::single(0)),
            Operand::plain(Value::vector_i64(&[1]).expect("vector")),
        ])
        .expect_err("untagged");
        assert!(matches!(err, ControlFlowError::TypeMismatch { position: 1, .. }));
    }

    #[test]
    fn unwrap_rejects_mixed_levels() {
        let matrix = Value::Tensor(
            TensorValue::new(DType::I64, Shape { dims: vec![2, 2] }, vec![Literal::I64(0); 4])
                .expect("matrix"),
        );
        let err = unwrap_batched(vec![
            Operand::batched(matrix.clone(), BatchAxes::leading(2)),
            Operand::batched(matrix, BatchAxes::single(0)),
        ])
        .expect_err("levels differ");
        assert!(matches!(
            err,
            ControlFlowError::BatchLevelMismatch {
                position: 1,
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn predicate_lanes_follow_level_order() {
        // Lanes tagged at axis 1 then axis 0: flags come out transposed.
        let predicate = Value::Tensor(
            TensorValue::new(
                DType::Bool,
                Shape { dims: vec![2, 3] },
                [true, false, false, false, true, false]
                    .into_iter()
                    .map(Literal::Bool)
                    .collect(),
            )
            .expect("predicate"),
        );
        let flags = predicate_lanes(&predicate, &BatchAxes::new([1, 0])).expect("lanes");
        assert_eq!(flags.shape.dims, vec![3, 2]);
        assert_eq!(
            flags.to_bool_vec().expect("bools"),
            vec![true, false, false, true, false, false]
        );
    }

    #[test]
    fn lane_flags_reject_wide_predicates() {
        let wide = Value::Tensor(
            TensorValue::new(DType::Bool, Shape { dims: vec![2, 2] }, vec![Literal::Bool(true); 4])
                .expect("predicate"),
        );
        let err = lane_flags(&wide, &[2]).expect_err("per-lane predicate is a vector");
        assert!(matches!(err, ControlFlowError::NonScalarPredicate { .. }));
        let flags = lane_flags(&Value::vector_i64(&[0, 3]).expect("vector"), &[2]).expect("flags");
        assert_eq!(flags.to_bool_vec().expect("bools"), vec![false, true]);
    }
}
