#![forbid(unsafe_code)]

pub mod device;
pub mod operand;
pub mod state;

pub use device::DeviceId;
pub use operand::{BatchAxes, Operand};
pub use state::StateSnapshot;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompatibilityMode {
    #[default]
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::I64(_) | Self::F64Bits(_) => None,
        }
    }

    /// Predicate reading: `true`, non-zero integers and non-zero floats hold.
    #[must_use]
    pub fn truthy(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::I64(value) => value != 0,
            Self::F64Bits(bits) => f64::from_bits(bits) != 0.0,
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I64(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .copied()
            .map(Literal::from_f64)
            .collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::F64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_bool(values: &[bool]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::Bool).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::Bool,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    #[must_use]
    pub fn as_bool_scalar(&self) -> Option<bool> {
        self.as_scalar_literal().and_then(Literal::as_bool)
    }

    /// Read this value as a branch/loop predicate.
    ///
    /// Scalars and single-element tensors qualify; anything larger is `None`.
    #[must_use]
    pub fn as_predicate(&self) -> Option<bool> {
        match self {
            Self::Scalar(lit) => Some(lit.truthy()),
            Self::Tensor(tensor) if tensor.len() == 1 => Some(tensor.elements[0].truthy()),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.dtype(),
            Self::Tensor(t) => t.dtype,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Tensor(t) => t.rank(),
        }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Shape::scalar(),
            Self::Tensor(t) => t.shape.clone(),
        }
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        match self {
            Self::Scalar(_) => DeviceId::DEFAULT,
            Self::Tensor(t) => t.device,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
    #[serde(default)]
    pub device: DeviceId,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
            device: DeviceId::DEFAULT,
        })
    }

    #[must_use]
    pub fn on_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    /// Row-major strides of this tensor's shape.
    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        let rank = self.rank();
        let mut strides = vec![1_usize; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape.dims[i + 1] as usize;
        }
        strides
    }

    pub fn slice_axis0(&self, index: usize) -> Result<Value, ValueError> {
        let axis_size = self
            .leading_dim()
            .ok_or(ValueError::RankZeroAxisSliceUnsupported)?;
        if index >= axis_size as usize {
            return Err(ValueError::SliceIndexOutOfBounds {
                index,
                axis_size: axis_size as usize,
            });
        }

        if self.rank() == 1 {
            return Ok(Value::Scalar(self.elements[index]));
        }

        let slice_len = self
            .shape
            .dims
            .iter()
            .skip(1)
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim as usize))
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;

        let start = index
            .checked_mul(slice_len)
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;
        let end = start
            .checked_add(slice_len)
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;
        let elements = self.elements[start..end].to_vec();
        let subshape = Shape {
            dims: self.shape.dims[1..].to_vec(),
        };
        Ok(Value::Tensor(
            TensorValue::new(self.dtype, subshape, elements)?.on_device(self.device),
        ))
    }

    pub fn stack_axis0(slices: &[Value]) -> Result<Self, ValueError> {
        if slices.is_empty() {
            return Err(ValueError::EmptyAxisStack);
        }

        match &slices[0] {
            Value::Scalar(first) => {
                let mut elements = Vec::with_capacity(slices.len());
                elements.push(*first);
                for value in &slices[1..] {
                    let Value::Scalar(lit) = value else {
                        return Err(ValueError::MixedAxisStackKinds);
                    };
                    elements.push(*lit);
                }
                let dtype = infer_dtype_from_literals(&elements);
                TensorValue::new(dtype, Shape::vector(slices.len() as u32), elements)
            }
            Value::Tensor(first) => {
                let mut elements = Vec::with_capacity(first.elements.len() * slices.len());
                elements.extend_from_slice(&first.elements);
                for value in &slices[1..] {
                    let Value::Tensor(tensor) = value else {
                        return Err(ValueError::MixedAxisStackKinds);
                    };
                    if tensor.dtype != first.dtype {
                        return Err(ValueError::AxisStackDTypeMismatch {
                            expected: first.dtype,
                            actual: tensor.dtype,
                        });
                    }
                    if tensor.shape != first.shape {
                        return Err(ValueError::AxisStackShapeMismatch {
                            expected: first.shape.clone(),
                            actual: tensor.shape.clone(),
                        });
                    }
                    if tensor.device != first.device {
                        return Err(ValueError::AxisStackDeviceMismatch {
                            expected: first.device,
                            actual: tensor.device,
                        });
                    }
                    elements.extend_from_slice(&tensor.elements);
                }

                let mut dims = Vec::with_capacity(first.shape.rank() + 1);
                dims.push(slices.len() as u32);
                dims.extend_from_slice(&first.shape.dims);
                Ok(TensorValue::new(first.dtype, Shape { dims }, elements)?.on_device(first.device))
            }
        }
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }

    pub fn to_bool_vec(&self) -> Option<Vec<bool>> {
        self.elements.iter().copied().map(Literal::as_bool).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSliceUnsupported,
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyAxisStack,
    MixedAxisStackKinds,
    AxisStackShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    AxisStackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
    AxisStackDeviceMismatch {
        expected: DeviceId,
        actual: DeviceId,
    },
    BatchAxisOutOfBounds {
        axis: usize,
        rank: usize,
    },
    DuplicateBatchAxis {
        axis: usize,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
            Self::RankZeroAxisSliceUnsupported => {
                write!(f, "cannot axis-slice rank-0 scalar tensor")
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => {
                write!(
                    f,
                    "axis-slice index {} out of bounds for axis size {}",
                    index, axis_size
                )
            }
            Self::EmptyAxisStack => {
                write!(f, "cannot stack empty slice list")
            }
            Self::MixedAxisStackKinds => {
                write!(f, "cannot stack mixed scalar/tensor slice kinds")
            }
            Self::AxisStackShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack shape mismatch: expected {:?}, got {:?}",
                    expected.dims, actual.dims
                )
            }
            Self::AxisStackDTypeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack dtype mismatch: expected {:?}, got {:?}",
                    expected, actual
                )
            }
            Self::AxisStackDeviceMismatch { expected, actual } => {
                write!(f, "stack device mismatch: expected {expected}, got {actual}")
            }
            Self::BatchAxisOutOfBounds { axis, rank } => {
                write!(f, "batch axis {axis} out of bounds for rank {rank}")
            }
            Self::DuplicateBatchAxis { axis } => {
                write!(f, "batch axis {axis} tagged by more than one level")
            }
        }
    }
}

impl std::error::Error for ValueError {}

fn infer_dtype_from_literals(elements: &[Literal]) -> DType {
    if elements.is_empty() {
        return DType::F64;
    }
    if elements
        .iter()
        .all(|literal| matches!(literal, Literal::I64(_)))
    {
        DType::I64
    } else if elements
        .iter()
        .all(|literal| matches!(literal, Literal::Bool(_)))
    {
        DType::Bool
    } else {
        DType::F64
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, DeviceId, Literal, Shape, TensorValue, Value, ValueError};
    use proptest::prelude::*;

    #[test]
    fn tensor_new_rejects_element_count_mismatch() {
        let err = TensorValue::new(DType::I64, Shape { dims: vec![2, 2] }, vec![Literal::I64(1)])
            .expect_err("count mismatch should fail");
        assert_eq!(
            err,
            ValueError::ElementCountMismatch {
                shape: Shape { dims: vec![2, 2] },
                expected_count: 4,
                actual_count: 1,
            }
        );
    }

    #[test]
    fn predicate_reads_scalars_and_single_element_tensors() {
        assert_eq!(Value::scalar_bool(true).as_predicate(), Some(true));
        assert_eq!(Value::scalar_i64(0).as_predicate(), Some(false));
        assert_eq!(Value::scalar_f64(0.25).as_predicate(), Some(true));
        let single = Value::vector_bool(&[true]).expect("vector");
        assert_eq!(single.as_predicate(), Some(true));
        let wide = Value::vector_bool(&[true, false]).expect("vector");
        assert_eq!(wide.as_predicate(), None);
    }

    #[test]
    fn slice_and_stack_keep_device() {
        let tensor = TensorValue::new(
            DType::I64,
            Shape { dims: vec![2, 2] },
            vec![
                Literal::I64(1),
                Literal::I64(2),
                Literal::I64(3),
                Literal::I64(4),
            ],
        )
        .expect("tensor")
        .on_device(DeviceId(2));

        let rows = (0..2)
            .map(|index| tensor.slice_axis0(index))
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        assert_eq!(rows[1].device(), DeviceId(2));
        let stacked = TensorValue::stack_axis0(&rows).expect("stack");
        assert_eq!(stacked, tensor);
    }

    #[test]
    fn stack_rejects_mixed_devices() {
        let a = TensorValue::new(DType::I64, Shape::vector(1), vec![Literal::I64(1)])
            .expect("tensor");
        let b = a.clone().on_device(DeviceId(1));
        let err = TensorValue::stack_axis0(&[Value::Tensor(a), Value::Tensor(b)])
            .expect_err("mixed devices should fail");
        assert_eq!(
            err,
            ValueError::AxisStackDeviceMismatch {
                expected: DeviceId(0),
                actual: DeviceId(1),
            }
        );
    }

    #[test]
    fn strides_are_row_major() {
        let tensor = TensorValue::new(
            DType::Bool,
            Shape { dims: vec![2, 3, 4] },
            vec![Literal::Bool(false); 24],
        )
        .expect("tensor");
        assert_eq!(tensor.strides(), vec![12, 4, 1]);
    }

    #[test]
    fn tensor_without_device_field_lands_on_default_device() {
        let json = r#"{"dtype":"I64","shape":{"dims":[1]},"elements":[{"I64":7}]}"#;
        let tensor: TensorValue = serde_json::from_str(json).expect("tensor json should parse");
        assert_eq!(tensor.device, DeviceId::DEFAULT);
        assert_eq!(tensor.to_i64_vec(), Some(vec![7]));
    }

    proptest! {
        #[test]
        fn prop_stacked_scalars_infer_integral_dtype(
            values in proptest::collection::vec(-50i64..50, 1..8),
        ) {
            let slices: Vec<Value> = values.iter().copied().map(Value::scalar_i64).collect();
            let stacked = TensorValue::stack_axis0(&slices).unwrap();
            prop_assert_eq!(stacked.dtype, DType::I64);
            prop_assert_eq!(stacked.to_i64_vec().unwrap(), values);
        }
    }
}
