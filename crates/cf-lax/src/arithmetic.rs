use cf_core::{DType, Literal, TensorValue, Value};

use crate::type_promotion::{binary_literal_op, infer_dtype};
use crate::{EvalError, Primitive};

pub(crate) fn expect_arity(
    primitive: Primitive,
    inputs: &[Value],
    expected: usize,
) -> Result<(), EvalError> {
    if inputs.len() == expected {
        Ok(())
    } else {
        Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        })
    }
}

/// Combine two values literal by literal, broadcasting a scalar against a
/// tensor. Tensor operands must agree on shape and device.
///
/// `dtype_of` picks the output dtype from the combined elements.
pub(crate) fn zip_broadcast(
    primitive: Primitive,
    lhs: &Value,
    rhs: &Value,
    op: impl Fn(Literal, Literal) -> Result<Literal, EvalError>,
    dtype_of: impl Fn(&[Literal]) -> DType,
) -> Result<Value, EvalError> {
    let (template, elements) = match (lhs, rhs) {
        (Value::Scalar(l), Value::Scalar(r)) => return Ok(Value::Scalar(op(*l, *r)?)),
        (Value::Tensor(l), Value::Tensor(r)) => {
            if l.shape != r.shape {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: l.shape.clone(),
                    right: r.shape.clone(),
                });
            }
            if l.device != r.device {
                return Err(EvalError::DeviceMismatch {
                    primitive,
                    left: l.device,
                    right: r.device,
                });
            }
            let elements = l
                .elements
                .iter()
                .zip(&r.elements)
                .map(|(a, b)| op(*a, *b))
                .collect::<Result<Vec<_>, _>>()?;
            (l, elements)
        }
        (Value::Scalar(l), Value::Tensor(r)) => {
            let elements = r
                .elements
                .iter()
                .map(|b| op(*l, *b))
                .collect::<Result<Vec<_>, _>>()?;
            (r, elements)
        }
        (Value::Tensor(l), Value::Scalar(r)) => {
            let elements = l
                .elements
                .iter()
                .map(|a| op(*a, *r))
                .collect::<Result<Vec<_>, _>>()?;
            (l, elements)
        }
    };

    let dtype = if elements.is_empty() {
        template.dtype
    } else {
        dtype_of(&elements)
    };
    Ok(Value::Tensor(
        TensorValue::new(dtype, template.shape.clone(), elements)?.on_device(template.device),
    ))
}

/// Binary arithmetic on the integral path when both sides are `I64`, the
/// float path otherwise.
#[inline]
pub(crate) fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    zip_broadcast(
        primitive,
        &inputs[0],
        &inputs[1],
        |a, b| binary_literal_op(a, b, primitive, &int_op, &float_op),
        infer_dtype,
    )
}

/// Unary op that keeps integers integral (neg).
#[inline]
pub(crate) fn eval_unary_int_or_float(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64) -> i64,
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;

    let apply = |literal: Literal| match literal {
        Literal::I64(v) => Ok(Literal::I64(int_op(v))),
        Literal::F64Bits(bits) => Ok(Literal::from_f64(float_op(f64::from_bits(bits)))),
        Literal::Bool(_) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected numeric operand, got bool",
        }),
    };

    match &inputs[0] {
        Value::Scalar(literal) => Ok(Value::Scalar(apply(*literal)?)),
        Value::Tensor(tensor) => {
            let elements = tensor
                .elements
                .iter()
                .copied()
                .map(apply)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tensor(
                TensorValue::new(tensor.dtype, tensor.shape.clone(), elements)?
                    .on_device(tensor.device),
            ))
        }
    }
}

/// Elementwise `mask ? on_true : on_false`.
///
/// The mask may be a scalar (whole-value choice) or a tensor matching the
/// branch shape. Branches must agree on dtype.
pub(crate) fn eval_select(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Select;
    expect_arity(primitive, inputs, 3)?;
    let (mask, on_true, on_false) = (&inputs[0], &inputs[1], &inputs[2]);

    if on_true.dtype() != on_false.dtype() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "select branches must share a dtype",
        });
    }

    let mask = match mask {
        Value::Scalar(flag) => {
            return Ok(if flag.truthy() {
                on_true.clone()
            } else {
                on_false.clone()
            });
        }
        Value::Tensor(mask) => mask,
    };

    let (Value::Tensor(t), Value::Tensor(f)) = (on_true, on_false) else {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "tensor mask requires tensor branches",
        });
    };
    for branch in [t, f] {
        if branch.shape != mask.shape {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: mask.shape.clone(),
                right: branch.shape.clone(),
            });
        }
    }
    if t.device != f.device {
        return Err(EvalError::DeviceMismatch {
            primitive,
            left: t.device,
            right: f.device,
        });
    }

    let elements = mask
        .elements
        .iter()
        .zip(t.elements.iter().zip(&f.elements))
        .map(|(flag, (a, b))| if flag.truthy() { *a } else { *b })
        .collect::<Vec<_>>();
    Ok(Value::Tensor(
        TensorValue::new(t.dtype, t.shape.clone(), elements)?.on_device(t.device),
    ))
}
