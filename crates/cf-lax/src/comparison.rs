use cf_core::{DType, Literal, Value};

use crate::arithmetic::{expect_arity, zip_broadcast};
use crate::type_promotion::compare_literals;
use crate::{EvalError, Primitive};

/// Comparison operators: always produce `Bool` scalars/tensors.
#[inline]
pub(crate) fn eval_comparison(
    primitive: Primitive,
    inputs: &[Value],
    int_cmp: impl Fn(i64, i64) -> bool,
    float_cmp: impl Fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    zip_broadcast(
        primitive,
        &inputs[0],
        &inputs[1],
        |l, r| compare_literals(l, r, primitive, &int_cmp, &float_cmp).map(Literal::Bool),
        |_| DType::Bool,
    )
}

/// `true` when any element of `value` is truthy.
pub(crate) fn eval_any(inputs: &[Value]) -> Result<Value, EvalError> {
    expect_arity(Primitive::Any, inputs, 1)?;
    let any = match &inputs[0] {
        Value::Scalar(literal) => literal.truthy(),
        Value::Tensor(tensor) => tensor.elements.iter().any(|literal| literal.truthy()),
    };
    Ok(Value::scalar_bool(any))
}
