//! LIFO disposal of deferred releasables.

use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handle::{Handle, Releasable};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Stack of release actions run in reverse registration order.
///
/// Disposal always drains the whole stack. The first failure (error or
/// panic) is kept and reported once draining finishes, together with the
/// number of failed releases. Once disposal has started the scope accepts no
/// further deferrals.
#[derive(Default)]
pub struct ResourceScope {
    stack: Vec<Box<dyn Entry>>,
    unwinding: bool,
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with a fresh scope and dispose it afterwards.
    ///
    /// An error from `f` takes precedence over a disposal error, which is
    /// then only logged.
    pub fn run<T>(f: impl FnOnce(&mut ResourceScope) -> Result<T>) -> Result<T> {
        let mut scope = ResourceScope::new();
        let result = f(&mut scope);
        let disposed = scope.dispose();
        match (result, disposed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(disposal)) => {
                tracing::warn!(error = %disposal, "scope disposal failed after an earlier error");
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.unwinding
    }

    fn ensure_open(&self) -> Result<()> {
        if self.unwinding {
            return Err(RuntimeError::UseAfterRelease("resource scope"));
        }
        Ok(())
    }

    /// Take ownership of `releasable` and hand back a reference to it that
    /// stays usable until the scope is disposed.
    pub fn defer<R: Releasable + 'static>(&mut self, releasable: R) -> Result<&mut R> {
        self.ensure_open()?;
        self.stack.push(Box::new(releasable));
        self.stack
            .last_mut()
            .and_then(|entry| entry.as_any_mut().downcast_mut::<R>())
            .ok_or_else(|| RuntimeError::InvalidState("deferred entry type mismatch".to_string()))
    }

    /// Take ownership of `handle` and return a borrowed view onto it. The
    /// view is tombstoned when the scope releases the handle.
    pub fn defer_handle(&mut self, handle: Handle) -> Result<Handle> {
        self.ensure_open()?;
        let view = handle.as_borrowed()?;
        self.stack.push(Box::new(handle));
        Ok(view)
    }

    pub fn defer_fn<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.defer(DeferredFn(Some(Box::new(action)))).map(|_| ())
    }

    /// Release everything, newest first. Calling again is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        if self.unwinding {
            return Ok(());
        }
        self.unwinding = true;

        let mut first: Option<RuntimeError> = None;
        let mut failed = 0usize;
        while let Some(mut releasable) = self.stack.pop() {
            let outcome = catch_unwind(AssertUnwindSafe(|| releasable.release_entry()))
                .unwrap_or_else(|payload| Err(RuntimeError::from_panic(payload)));
            if let Err(e) = outcome {
                failed += 1;
                match first {
                    None => first = Some(e),
                    Some(_) => tracing::debug!(error = %e, "additional scope release failure"),
                }
            }
        }

        match first {
            None => Ok(()),
            Some(first) => Err(RuntimeError::ScopeDisposal {
                first: Box::new(first),
                failed,
            }),
        }
    }
}

impl Releasable for ResourceScope {
    fn release(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.dispose()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(error = %e, "resource scope dropped with failing releases");
        }
    }
}

/// Object-safe face of a deferred releasable that can still be downcast.
trait Entry: Send {
    fn release_entry(&mut self) -> Result<()>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<R: Releasable + 'static> Entry for R {
    fn release_entry(&mut self) -> Result<()> {
        Releasable::release(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct DeferredFn(Option<Box<dyn FnOnce() -> Result<()> + Send>>);

impl Releasable for DeferredFn {
    fn release(&mut self) -> Result<()> {
        match self.0.take() {
            Some(action) => action(),
            None => Err(RuntimeError::UseAfterRelease("deferred action")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, fail: bool) -> impl FnOnce() -> Result<()> + Send + 'static {
        let log = log.clone();
        move || {
            log.lock().push(name);
            if fail {
                Err(RuntimeError::Host(format!("{} failed", name)))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_dispose_runs_in_reverse_order() {
        let log = recorder();
        let mut scope = ResourceScope::new();
        scope.defer_fn(push(&log, "A", false)).unwrap();
        scope.defer_fn(push(&log, "B", false)).unwrap();
        scope.defer_fn(push(&log, "C", false)).unwrap();
        assert_eq!(scope.len(), 3);

        scope.dispose().unwrap();
        assert_eq!(*log.lock(), vec!["C", "B", "A"]);
        assert!(scope.is_empty());
    }

    #[test]
    fn test_failing_release_does_not_skip_the_rest() {
        let log = recorder();
        let mut scope = ResourceScope::new();
        scope.defer_fn(push(&log, "A", false)).unwrap();
        scope.defer_fn(push(&log, "B", true)).unwrap();
        scope.defer_fn(push(&log, "C", false)).unwrap();

        let err = scope.dispose().unwrap_err();
        assert_eq!(*log.lock(), vec!["C", "B", "A"]);
        match err {
            RuntimeError::ScopeDisposal { first, failed } => {
                assert_eq!(failed, 1);
                assert_eq!(first.to_string(), "B failed");
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Raised once; a second dispose is a no-op.
        assert!(scope.dispose().is_ok());
    }

    #[test]
    fn test_panicking_release_is_contained() {
        let log = recorder();
        let mut scope = ResourceScope::new();
        scope.defer_fn(push(&log, "A", false)).unwrap();
        scope.defer_fn(|| panic!("release exploded")).unwrap();
        scope.defer_fn(push(&log, "C", true)).unwrap();

        let err = scope.dispose().unwrap_err();
        assert_eq!(*log.lock(), vec!["C", "A"]);
        match err {
            RuntimeError::ScopeDisposal { first, failed } => {
                assert_eq!(failed, 2);
                assert_eq!(first.to_string(), "C failed");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_no_deferrals_after_disposal() {
        let mut scope = ResourceScope::new();
        scope.dispose().unwrap();
        assert!(matches!(
            scope.defer_fn(|| Ok(())),
            Err(RuntimeError::UseAfterRelease("resource scope"))
        ));
    }

    #[test]
    fn test_nested_scopes_compose() {
        let log = recorder();
        let mut outer = ResourceScope::new();
        outer.defer_fn(push(&log, "outer-1", false)).unwrap();

        let mut inner = ResourceScope::new();
        inner.defer_fn(push(&log, "inner-1", false)).unwrap();
        inner.defer_fn(push(&log, "inner-2", false)).unwrap();
        outer.defer(inner).unwrap();

        outer.defer_fn(push(&log, "outer-2", false)).unwrap();
        outer.dispose().unwrap();
        assert_eq!(
            *log.lock(),
            vec!["outer-2", "inner-2", "inner-1", "outer-1"]
        );
    }

    #[test]
    fn test_run_prefers_body_error_and_still_disposes() {
        let log = recorder();
        let result: Result<()> = ResourceScope::run(|scope| {
            scope.defer_fn(push(&log, "A", true))?;
            Err(RuntimeError::Host("body failed".into()))
        });
        assert_eq!(result.unwrap_err().to_string(), "body failed");
        assert_eq!(*log.lock(), vec!["A"]);
    }

    #[test]
    fn test_drop_disposes_pending_actions() {
        let log = recorder();
        {
            let mut scope = ResourceScope::new();
            scope.defer_fn(push(&log, "A", false)).unwrap();
        }
        assert_eq!(*log.lock(), vec!["A"]);
    }

    #[test]
    fn test_defer_handle_releases_on_dispose() {
        let engine = crate::runtime::registry::EngineCell::sandbox();
        let ptr = engine.with("number", |r| r.new_number(4.0)).unwrap();
        let handle = Handle::owned(ptr, engine.clone());

        let mut scope = ResourceScope::new();
        let view = scope.defer_handle(handle).unwrap();
        assert!(!view.is_owned());
        scope.dispose().unwrap();
        assert_eq!(engine.with("count", |r| r.live_value_count()).unwrap(), 0);
    }

    #[test]
    fn test_view_is_unusable_after_dispose() {
        let engine = crate::runtime::registry::EngineCell::sandbox();
        let ptr = engine.with("number", |r| r.new_number(5.0)).unwrap();
        let handle = Handle::owned(ptr, engine.clone());

        let mut scope = ResourceScope::new();
        let view = scope.defer_handle(handle).unwrap();
        assert!(view.is_alive());
        assert_eq!(view.raw().unwrap(), ptr);

        scope.dispose().unwrap();
        assert!(!view.is_alive());
        assert!(matches!(view.raw(), Err(RuntimeError::UseAfterRelease(_))));
        assert!(matches!(view.duplicate(), Err(RuntimeError::UseAfterRelease(_))));
    }

    #[test]
    fn test_defer_returns_the_deferred_value() {
        let log = recorder();
        let mut outer = ResourceScope::new();
        let inner = outer.defer(ResourceScope::new()).unwrap();
        inner.defer_fn(push(&log, "inner", false)).unwrap();
        assert_eq!(inner.len(), 1);
        outer.defer_fn(push(&log, "outer", false)).unwrap();

        outer.dispose().unwrap();
        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }
}
