//! Operands as seen at a control-flow entry point.
//!
//! An enclosing batch-map stacks independent lanes into a physical tensor and
//! tags it with the axis that carries each nesting level. Control-flow entry
//! points unwrap that tag, run on the physical tensor, and tag the results again.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Value, ValueError};

/// Physical batch axes of one operand, outermost nesting level first.
///
/// Every entry is an axis of the unwrapped tensor. An empty list means the
/// operand is not batch-tagged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BatchAxes(SmallVec<[usize; 2]>);

impl BatchAxes {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(axis: usize) -> Self {
        Self(SmallVec::from_slice(&[axis]))
    }

    #[must_use]
    pub fn new(axes: impl IntoIterator<Item = usize>) -> Self {
        Self(axes.into_iter().collect())
    }

    /// Leading axes `0..levels`, the layout a batch-map produces for stacked outputs.
    #[must_use]
    pub fn leading(levels: usize) -> Self {
        Self((0..levels).collect())
    }

    #[must_use]
    pub fn levels(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Axis carrying `level` once every outer level has already been mapped
    /// away (outer levels remove their axis from the tensor before the inner
    /// level sees it).
    #[must_use]
    pub fn relative_axis(&self, level: usize) -> usize {
        let axis = self.0[level];
        let removed_before = self.0[..level].iter().filter(|outer| **outer < axis).count();
        axis - removed_before
    }

    /// Check that every axis is in range for `rank` and no axis repeats.
    pub fn validate(&self, rank: usize) -> Result<(), ValueError> {
        for (level, axis) in self.0.iter().enumerate() {
            if *axis >= rank {
                return Err(ValueError::BatchAxisOutOfBounds { axis: *axis, rank });
            }
            if self.0[..level].contains(axis) {
                return Err(ValueError::DuplicateBatchAxis { axis: *axis });
            }
        }
        Ok(())
    }
}

/// A value handed to `loop`/`cond`, optionally carrying batch-axis tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub value: Value,
    pub batch_axes: BatchAxes,
}

impl Operand {
    #[must_use]
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            batch_axes: BatchAxes::none(),
        }
    }

    #[must_use]
    pub fn batched(value: Value, batch_axes: BatchAxes) -> Self {
        Self { value, batch_axes }
    }

    #[must_use]
    pub fn is_batched(&self) -> bool {
        !self.batch_axes.is_empty()
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Self::plain(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchAxes, Operand};
    use crate::{Value, ValueError};

    #[test]
    fn relative_axis_accounts_for_outer_levels() {
        let axes = BatchAxes::new([2, 0]);
        assert_eq!(axes.relative_axis(0), 2);
        assert_eq!(axes.relative_axis(1), 0);

        let axes = BatchAxes::new([0, 2]);
        assert_eq!(axes.relative_axis(1), 1);
    }

    #[test]
    fn validate_rejects_out_of_range_and_repeated_axes() {
        assert_eq!(
            BatchAxes::single(3).validate(2),
            Err(ValueError::BatchAxisOutOfBounds { axis: 3, rank: 2 })
        );
        assert_eq!(
            BatchAxes::new([1, 1]).validate(3),
            Err(ValueError::DuplicateBatchAxis { axis: 1 })
        );
        assert!(BatchAxes::leading(2).validate(2).is_ok());
    }

    #[test]
    fn plain_operand_is_untagged() {
        let operand = Operand::from(Value::scalar_i64(4));
        assert!(!operand.is_batched());
        assert_eq!(operand.into_value(), Value::scalar_i64(4));
    }
}
