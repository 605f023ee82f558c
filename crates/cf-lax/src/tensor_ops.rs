//! Layout operations used to move batch axes around.

use cf_core::{Literal, Shape, TensorValue, Value};
use std::collections::BTreeMap;

use crate::arithmetic::expect_arity;
use crate::{EvalError, Primitive};

pub(crate) fn parse_usize_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    let raw = params.get(key).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("missing required param '{key}'"),
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| EvalError::Unsupported {
                    primitive,
                    detail: format!("invalid usize in param '{key}': '{s}'"),
                })
        })
        .collect()
}

pub(crate) fn format_csv(values: &[usize]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn row_major_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as usize;
    }
    strides
}

/// Transpose by `permutation` (comma-separated). Defaults to reversing the axes.
pub(crate) fn eval_transpose(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Transpose;
    expect_arity(primitive, inputs, 1)?;

    let tensor = match &inputs[0] {
        Value::Scalar(_) => return Ok(inputs[0].clone()),
        Value::Tensor(tensor) => tensor,
    };

    let rank = tensor.rank();
    let permutation = if params.contains_key("permutation") {
        parse_usize_param(primitive, "permutation", params)?
    } else {
        (0..rank).rev().collect()
    };

    if permutation.len() != rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "permutation length {} does not match rank {}",
                permutation.len(),
                rank
            ),
        });
    }
    let mut seen = vec![false; rank];
    for &p in &permutation {
        if p >= rank || seen[p] {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("invalid permutation: {permutation:?} for rank {rank}"),
            });
        }
        seen[p] = true;
    }

    let old_strides = row_major_strides(&tensor.shape.dims);
    let new_dims: Vec<u32> = permutation.iter().map(|&p| tensor.shape.dims[p]).collect();
    let new_strides = row_major_strides(&new_dims);

    let elements = (0..tensor.len())
        .map(|flat| {
            let mut remaining = flat;
            let mut source = 0_usize;
            for (new_axis, &old_axis) in permutation.iter().enumerate() {
                let coord = remaining / new_strides[new_axis];
                remaining %= new_strides[new_axis];
                source += coord * old_strides[old_axis];
            }
            tensor.elements[source]
        })
        .collect::<Vec<_>>();

    Ok(Value::Tensor(
        TensorValue::new(tensor.dtype, Shape { dims: new_dims }, elements)?
            .on_device(tensor.device),
    ))
}

fn expect_tensor(primitive: Primitive, value: &Value) -> Result<&TensorValue, EvalError> {
    value.as_tensor().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected a tensor operand",
    })
}

/// Move axis `from` of `value` to position `to`, shifting the axes between.
pub fn move_axis(value: &Value, from: usize, to: usize) -> Result<Value, EvalError> {
    if from == to {
        return Ok(value.clone());
    }
    let tensor = expect_tensor(Primitive::Transpose, value)?;
    let rank = tensor.rank();
    if from >= rank || to >= rank {
        return Err(EvalError::AxisOutOfBounds {
            axis: from.max(to),
            rank,
        });
    }

    let mut permutation: Vec<usize> = (0..rank).filter(|axis| *axis != from).collect();
    permutation.insert(to, from);
    let params = BTreeMap::from([("permutation".to_owned(), format_csv(&permutation))]);
    eval_transpose(std::slice::from_ref(value), &params)
}

/// Move the listed axes, in order, to the front of `value`.
///
/// The remaining axes keep their relative order behind them.
pub fn move_axes_to_front(value: &Value, axes: &[usize]) -> Result<Value, EvalError> {
    if axes.iter().enumerate().all(|(i, axis)| i == *axis) {
        return Ok(value.clone());
    }
    let tensor = expect_tensor(Primitive::Transpose, value)?;
    let rank = tensor.rank();
    if let Some(axis) = axes.iter().copied().find(|axis| *axis >= rank) {
        return Err(EvalError::AxisOutOfBounds { axis, rank });
    }

    let mut permutation = axes.to_vec();
    permutation.extend((0..rank).filter(|axis| !axes.contains(axis)));
    let params = BTreeMap::from([("permutation".to_owned(), format_csv(&permutation))]);
    eval_transpose(std::slice::from_ref(value), &params)
}

/// Extract lane `index` along `axis`, dropping that axis.
pub fn slice_along_axis(value: &Value, axis: usize, index: usize) -> Result<Value, EvalError> {
    let tensor = expect_tensor(Primitive::Transpose, value)?;
    if axis >= tensor.rank() {
        return Err(EvalError::AxisOutOfBounds {
            axis,
            rank: tensor.rank(),
        });
    }
    if axis == 0 {
        return Ok(tensor.slice_axis0(index)?);
    }
    let front = move_axis(value, axis, 0)?;
    let front = expect_tensor(Primitive::Transpose, &front)?;
    Ok(front.slice_axis0(index)?)
}

/// Stack `lanes` along a new axis placed at `axis`.
pub fn stack_along_axis(lanes: &[Value], axis: usize) -> Result<Value, EvalError> {
    let stacked = Value::Tensor(TensorValue::stack_axis0(lanes)?);
    if axis == 0 {
        return Ok(stacked);
    }
    move_axis(&stacked, 0, axis)
}

/// Broadcast a lane mask onto a tensor layout.
///
/// `lanes` has one dimension per batch level (outermost first). Element `i`
/// of the result takes the lane flag addressed by the coordinates of `i`
/// along `lane_axes` in `target`.
pub fn broadcast_lanes(
    lanes: &TensorValue,
    lane_axes: &[usize],
    target: &TensorValue,
) -> Result<TensorValue, EvalError> {
    let primitive = Primitive::Select;
    if lanes.rank() != lane_axes.len() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "lane mask rank {} does not match {} batch levels",
                lanes.rank(),
                lane_axes.len()
            ),
        });
    }
    for (level, &axis) in lane_axes.iter().enumerate() {
        let Some(&dim) = target.shape.dims.get(axis) else {
            return Err(EvalError::AxisOutOfBounds {
                axis,
                rank: target.rank(),
            });
        };
        if dim != lanes.shape.dims[level] {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: lanes.shape.clone(),
                right: target.shape.clone(),
            });
        }
    }

    let target_strides = target.strides();
    let lane_strides = lanes.strides();
    let elements = (0..target.len())
        .map(|flat| {
            let lane = lane_axes
                .iter()
                .zip(&lane_strides)
                .map(|(&axis, stride)| {
                    (flat / target_strides[axis]) % target.shape.dims[axis] as usize * stride
                })
                .sum::<usize>();
            Literal::Bool(lanes.elements[lane].truthy())
        })
        .collect::<Vec<_>>();

    Ok(
        TensorValue::new(cf_core::DType::Bool, target.shape.clone(), elements)?
            .on_device(target.device),
    )
}
