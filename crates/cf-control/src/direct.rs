//! Direct execution: one step at a time, the reference semantics every other
//! mode must agree with.

use cf_core::{CompatibilityMode, StateSnapshot, Value};
use cf_transforms::TransformError;

use crate::ControlFlowError;

/// Read the single predicate a condition returned.
pub(crate) fn predicate_of(outputs: &[Value]) -> Result<bool, ControlFlowError> {
    let [value] = outputs else {
        return Err(ControlFlowError::NonScalarPredicate {
            detail: format!("condition returned {} values", outputs.len()),
        });
    };
    value
        .as_predicate()
        .ok_or_else(|| ControlFlowError::NonScalarPredicate {
            detail: format!("predicate has shape {:?}", value.shape().dims),
        })
}

/// The body must return as many values as it received; in strict mode each
/// value must also keep its rank, dtype and device.
pub(crate) fn check_carry(
    mode: CompatibilityMode,
    before: &[Value],
    after: &[Value],
) -> Result<(), ControlFlowError> {
    if before.len() != after.len() {
        return Err(ControlFlowError::CarryArityChanged {
            expected: before.len(),
            actual: after.len(),
        });
    }
    if mode == CompatibilityMode::Hardened {
        return Ok(());
    }
    for (position, (old, new)) in before.iter().zip(after).enumerate() {
        if old.rank() != new.rank() || old.dtype() != new.dtype() || old.device() != new.device()
        {
            return Err(ControlFlowError::CarryShapeChanged {
                position,
                detail: format!(
                    "rank {} {} on {} became rank {} {} on {}",
                    old.rank(),
                    old.dtype().as_str(),
                    old.device(),
                    new.rank(),
                    new.dtype().as_str(),
                    new.device()
                ),
            });
        }
    }
    Ok(())
}

/// Results of the two branches, compared position by position. Counts must
/// always agree; strict mode also requires matching rank, dtype and device.
pub(crate) fn check_branches(
    mode: CompatibilityMode,
    on_true: &[Value],
    on_false: &[Value],
) -> Result<(), ControlFlowError> {
    if on_true.len() != on_false.len() {
        return Err(ControlFlowError::BranchArityMismatch {
            on_true: on_true.len(),
            on_false: on_false.len(),
        });
    }
    if mode == CompatibilityMode::Hardened {
        return Ok(());
    }
    for (position, (a, b)) in on_true.iter().zip(on_false).enumerate() {
        if a.rank() != b.rank() || a.dtype() != b.dtype() || a.device() != b.device() {
            return Err(ControlFlowError::BranchShapeMismatch {
                position,
                detail: format!(
                    "rank {} {} on {} versus rank {} {} on {}",
                    a.rank(),
                    a.dtype().as_str(),
                    a.device(),
                    b.rank(),
                    b.dtype().as_str(),
                    b.device()
                ),
            });
        }
    }
    Ok(())
}

/// While `cond(carry)` holds, `carry := body(carry)`.
pub(crate) fn drive_loop<C, B>(
    mode: CompatibilityMode,
    init: Vec<Value>,
    mut cond: C,
    mut body: B,
) -> Result<Vec<Value>, ControlFlowError>
where
    C: FnMut(&[Value]) -> Result<Vec<Value>, TransformError>,
    B: FnMut(&[Value]) -> Result<Vec<Value>, TransformError>,
{
    let mut carry = init;
    while predicate_of(&cond(&carry)?)? {
        let next = body(&carry)?;
        check_carry(mode, &carry, &next)?;
        carry = next;
    }
    Ok(carry)
}

/// Stateful loop: the condition and body both see the current state and
/// their reported entries are merged back before the next step.
pub(crate) fn drive_loop_stateful<C, B>(
    mode: CompatibilityMode,
    init_state: StateSnapshot,
    init: Vec<Value>,
    mut cond: C,
    mut body: B,
) -> Result<(StateSnapshot, Vec<Value>), ControlFlowError>
where
    C: FnMut(&StateSnapshot, &[Value]) -> Result<(StateSnapshot, Vec<Value>), TransformError>,
    B: FnMut(&StateSnapshot, &[Value]) -> Result<(StateSnapshot, Vec<Value>), TransformError>,
{
    let mut state = init_state;
    let mut carry = init;
    loop {
        let (cond_state, predicate) = cond(&state, &carry)?;
        state.merge(cond_state);
        if !predicate_of(&predicate)? {
            return Ok((state, carry));
        }
        let (body_state, next) = body(&state, &carry)?;
        state.merge(body_state);
        check_carry(mode, &carry, &next)?;
        carry = next;
    }
}

/// Run `on_true` or `on_false` depending on the predicate.
pub(crate) fn run_branch<T, F>(
    predicate: &Value,
    operands: &[Value],
    on_true: T,
    on_false: F,
) -> Result<Vec<Value>, ControlFlowError>
where
    T: FnOnce(&[Value]) -> Result<Vec<Value>, TransformError>,
    F: FnOnce(&[Value]) -> Result<Vec<Value>, TransformError>,
{
    let taken = predicate_of(std::slice::from_ref(predicate))?;
    let outputs = if taken {
        on_true(operands)?
    } else {
        on_false(operands)?
    };
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::{
        check_branches, check_carry, drive_loop, drive_loop_stateful, predicate_of, run_branch,
    };
    use crate::ControlFlowError;
    use cf_core::{CompatibilityMode, StateSnapshot, Value};
    use cf_lax::{Primitive, eval_binary};

    fn below(
        limit: i64,
    ) -> impl FnMut(&[Value]) -> Result<Vec<Value>, cf_transforms::TransformError> {
        move |carry: &[Value]| {
            Ok(vec![eval_binary(
                Primitive::Lt,
                &carry[0],
                &Value::scalar_i64(limit),
            )?])
        }
    }

    #[test]
    fn loop_counts_to_limit() {
        let out = drive_loop(
            CompatibilityMode::Strict,
            vec![Value::scalar_i64(0)],
            below(10),
            |carry: &[Value]| {
                Ok(vec![eval_binary(
                    Primitive::Add,
                    &carry[0],
                    &Value::scalar_i64(1),
                )?])
            },
        )
        .expect("loop");
        assert_eq!(out, vec![Value::scalar_i64(10)]);
    }

    #[test]
    fn loop_with_false_condition_returns_operands_unchanged() {
        let out = drive_loop(
            CompatibilityMode::Strict,
            vec![Value::scalar_i64(12), Value::scalar_bool(true)],
            below(10),
            |_: &[Value]| panic!("body must not run"),
        )
        .expect("loop");
        assert_eq!(out, vec![Value::scalar_i64(12), Value::scalar_bool(true)]);
    }

    #[test]
    fn strict_mode_rejects_dtype_change() {
        let err = check_carry(
            CompatibilityMode::Strict,
            &[Value::scalar_i64(1)],
            &[Value::scalar_f64(1.0)],
        )
        .expect_err("dtype changed");
        assert!(matches!(err, ControlFlowError::CarryShapeChanged { position: 0, .. }));
        assert!(
            check_carry(
                CompatibilityMode::Hardened,
                &[Value::scalar_i64(1)],
                &[Value::scalar_f64(1.0)],
            )
            .is_ok()
        );
    }

    #[test]
    fn carry_arity_is_always_checked() {
        let err = check_carry(CompatibilityMode::Hardened, &[Value::scalar_i64(1)], &[])
            .expect_err("arity changed");
        assert!(matches!(
            err,
            ControlFlowError::CarryArityChanged {
                expected: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn predicate_must_be_single_value() {
        assert!(matches!(
            predicate_of(&[]),
            Err(ControlFlowError::NonScalarPredicate { .. })
        ));
        let wide = Value::vector_bool(&[true, false]).expect("vector");
        assert!(matches!(
            predicate_of(&[wide]),
            Err(ControlFlowError::NonScalarPredicate { .. })
        ));
        assert_eq!(predicate_of(&[Value::scalar_i64(3)]).ok(), Some(true));
    }

    #[test]
    fn stateful_loop_merges_reported_state() {
        let mut state = StateSnapshot::new();
        state.insert("steps", Value::scalar_i64(0));
        let (final_state, out) = drive_loop_stateful(
            CompatibilityMode::Strict,
            state,
            vec![Value::scalar_i64(0)],
            |_: &cf_core::StateSnapshot, carry: &[Value]| {
                Ok((
                    StateSnapshot::new(),
                    vec![eval_binary(Primitive::Lt, &carry[0], &Value::scalar_i64(3))?],
                ))
            },
            |state: &cf_core::StateSnapshot, carry: &[Value]| {
                let steps = state.get("steps").cloned().unwrap_or(Value::scalar_i64(0));
                let mut update = StateSnapshot::new();
                update.insert(
                    "steps",
                    eval_binary(Primitive::Add, &steps, &Value::scalar_i64(1))?,
                );
                Ok((
                    update,
                    vec![eval_binary(Primitive::Add, &carry[0], &Value::scalar_i64(1))?],
                ))
            },
        )
        .expect("loop");
        assert_eq!(out, vec![Value::scalar_i64(3)]);
        assert_eq!(final_state.get("steps"), Some(&Value::scalar_i64(3)));
    }

    #[test]
    fn branch_results_must_agree() {
        let err = check_branches(
            CompatibilityMode::Strict,
            &[Value::scalar_i64(1)],
            &[Value::scalar_i64(1), Value::scalar_i64(2)],
        )
        .expect_err("counts differ");
        assert!(matches!(
            err,
            ControlFlowError::BranchArityMismatch {
                on_true: 1,
                on_false: 2
            }
        ));
        let err = check_branches(
            CompatibilityMode::Strict,
            &[Value::scalar_i64(1)],
            &[Value::scalar_bool(true)],
        )
        .expect_err("dtypes differ");
        assert!(matches!(err, ControlFlowError::BranchShapeMismatch { position: 0, .. }));
        assert!(
            check_branches(
                CompatibilityMode::Hardened,
                &[Value::scalar_i64(1)],
                &[Value::scalar_bool(true)],
            )
            .is_ok()
        );
    }

    #[test]
    fn branch_picks_by_predicate() {
        let out = run_branch(
            &Value::scalar_bool(false),
            &[Value::scalar_i64(1)],
            |_: &[Value]| Ok(vec![Value::scalar_i64(10)]),
            |_: &[Value]| Ok(vec![Value::scalar_i64(20)]),
        )
        .expect("branch");
        assert_eq!(out, vec![Value::scalar_i64(20)]);
    }
}
