use cf_core::{StateSnapshot, Value};
use cf_transforms::{Procedure, StateHolder, StatefulProcedure, TransformError, use_state};
use std::sync::Arc;

/// A condition, body or branch function.
///
/// Clones share the underlying procedure, and identity follows that shared
/// allocation: two `StepFn`s are the same function exactly when one was
/// cloned from the other.
#[derive(Clone)]
pub struct StepFn {
    name: Arc<str>,
    func: Procedure,
    arity: Option<usize>,
    binding: Option<Arc<dyn StateHolder>>,
}

impl StepFn {
    /// A function that touches no external state.
    pub fn pure<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, TransformError> + Send + Sync + 'static,
    {
        Self::from_procedure(name, Arc::new(func))
    }

    /// A function that reads and writes the entries of `holder`.
    pub fn bound<F>(name: &str, holder: Arc<dyn StateHolder>, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, TransformError> + Send + Sync + 'static,
    {
        Self {
            binding: Some(holder),
            ..Self::pure(name, func)
        }
    }

    #[must_use]
    pub fn from_procedure(name: &str, func: Procedure) -> Self {
        Self {
            name: Arc::from(name),
            func,
            arity: None,
            binding: None,
        }
    }

    /// Declare the operand count this function accepts.
    #[must_use]
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    #[must_use]
    pub fn procedure(&self) -> &Procedure {
        &self.func
    }

    /// Address of the shared procedure allocation.
    #[must_use]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.func).cast::<()>() as usize
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, TransformError> {
        (self.func)(args)
    }

    /// Explicit-state form of this function and the state it starts from.
    ///
    /// Unbound functions start from an empty state and never report any entries.
    pub(crate) fn extract(&self) -> (StateSnapshot, StatefulProcedure) {
        match &self.binding {
            Some(holder) => use_state(Arc::clone(holder), Arc::clone(&self.func)),
            None => {
                let func = Arc::clone(&self.func);
                let extracted: StatefulProcedure = Arc::new(
                    move |_: &StateSnapshot,
                          args: &[Value]|
                          -> Result<(StateSnapshot, Vec<Value>), TransformError> {
                        Ok((StateSnapshot::new(), func(args)?))
                    },
                );
                (StateSnapshot::new(), extracted)
            }
        }
    }
}

impl std::fmt::Debug for StepFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::StepFn;
    use cf_core::{StateSnapshot, Value};
    use cf_transforms::{SharedState, StateHolder};
    use std::sync::Arc;

    #[test]
    fn clones_share_identity() {
        let f = StepFn::pure("f", |args: &[Value]| Ok(args.to_vec()));
        let g = StepFn::pure("f", |args: &[Value]| Ok(args.to_vec()));
        assert_eq!(f.identity(), f.clone().identity());
        assert_ne!(f.identity(), g.identity());
    }

    #[test]
    fn unbound_extraction_reports_empty_state() {
        let f = StepFn::pure("f", |args: &[Value]| Ok(args.to_vec()));
        let (init, extracted) = f.extract();
        assert!(init.is_empty());
        let mut given = StateSnapshot::new();
        given.insert("x", Value::scalar_i64(1));
        let (state, out) = extracted(&given, &[Value::scalar_i64(2)]).expect("call");
        assert!(state.is_empty());
        assert_eq!(out, vec![Value::scalar_i64(2)]);
    }

    #[test]
    fn bound_extraction_starts_from_holder_state() {
        let mut initial = StateSnapshot::new();
        initial.insert("count", Value::scalar_i64(3));
        let holder: Arc<dyn StateHolder> = Arc::new(SharedState::new(initial.clone()));
        let f = StepFn::bound("f", holder, |args: &[Value]| Ok(args.to_vec()));
        assert!(f.is_bound());
        let (init, _) = f.extract();
        assert_eq!(init, initial);
    }
}
