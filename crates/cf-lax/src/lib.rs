#![forbid(unsafe_code)]

mod arithmetic;
mod comparison;
mod tensor_ops;
mod type_promotion;

use cf_core::{DeviceId, Shape, Value, ValueError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use arithmetic::{eval_binary_elementwise, eval_select, eval_unary_int_or_float};
use comparison::{eval_any, eval_comparison};
use tensor_ops::eval_transpose;

pub use tensor_ops::{
    broadcast_lanes, move_axes_to_front, move_axis, slice_along_axis, stack_along_axis,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    Max,
    Min,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Select,
    Any,
    Transpose,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Max => "max",
            Self::Min => "min",
            Self::Neg => "neg",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Select => "select",
            Self::Any => "any",
            Self::Transpose => "transpose",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        primitive: Primitive,
        detail: &'static str,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    DeviceMismatch {
        primitive: Primitive,
        left: DeviceId,
        right: DeviceId,
    },
    AxisOutOfBounds {
        axis: usize,
        rank: usize,
    },
    Unsupported {
        primitive: Primitive,
        detail: String,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::TypeMismatch { primitive, detail } => {
                write!(f, "type mismatch for {}: {}", primitive.as_str(), detail)
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => {
                write!(
                    f,
                    "shape mismatch for {}: left={:?} right={:?}",
                    primitive.as_str(),
                    left.dims,
                    right.dims
                )
            }
            Self::DeviceMismatch {
                primitive,
                left,
                right,
            } => {
                write!(
                    f,
                    "device mismatch for {}: left={left} right={right}",
                    primitive.as_str()
                )
            }
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {axis} out of bounds for rank {rank}")
            }
            Self::Unsupported { primitive, detail } => {
                write!(f, "unsupported {} behavior: {}", primitive.as_str(), detail)
            }
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    match primitive {
        Primitive::Add => eval_binary_elementwise(
            primitive,
            inputs,
            i64::wrapping_add,
            |a, b| a + b,
        ),
        Primitive::Sub => eval_binary_elementwise(
            primitive,
            inputs,
            i64::wrapping_sub,
            |a, b| a - b,
        ),
        Primitive::Mul => eval_binary_elementwise(
            primitive,
            inputs,
            i64::wrapping_mul,
            |a, b| a * b,
        ),
        Primitive::Max => eval_binary_elementwise(primitive, inputs, i64::max, f64::max),
        Primitive::Min => eval_binary_elementwise(primitive, inputs, i64::min, f64::min),
        Primitive::Neg => eval_unary_int_or_float(primitive, inputs, i64::wrapping_neg, |x| -x),
        Primitive::Eq => eval_comparison(primitive, inputs, |a, b| a == b, |a, b| a == b),
        Primitive::Ne => eval_comparison(primitive, inputs, |a, b| a != b, |a, b| a != b),
        Primitive::Lt => eval_comparison(primitive, inputs, |a, b| a < b, |a, b| a < b),
        Primitive::Le => eval_comparison(primitive, inputs, |a, b| a <= b, |a, b| a <= b),
        Primitive::Gt => eval_comparison(primitive, inputs, |a, b| a > b, |a, b| a > b),
        Primitive::Ge => eval_comparison(primitive, inputs, |a, b| a >= b, |a, b| a >= b),
        Primitive::Select => eval_select(inputs),
        Primitive::Any => eval_any(inputs),
        Primitive::Transpose => eval_transpose(inputs, params),
    }
}

/// Evaluate a parameterless binary primitive.
pub fn eval_binary(primitive: Primitive, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    eval_primitive(primitive, &[lhs.clone(), rhs.clone()], &BTreeMap::new())
}

/// Elementwise `mask ? on_true : on_false`.
pub fn select(mask: &Value, on_true: &Value, on_false: &Value) -> Result<Value, EvalError> {
    eval_select(&[mask.clone(), on_true.clone(), on_false.clone()])
}

/// `true` when any element of `value` is truthy.
pub fn any(value: &Value) -> Result<bool, EvalError> {
    let out = eval_any(std::slice::from_ref(value))?;
    Ok(out.as_bool_scalar().unwrap_or(false))
}
