//! Success/failure wrapper that tracks payload ownership.

use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handle::Releasable;
use std::fmt;

enum Slot<T> {
    Live(T),
    Transferred,
}

impl<T> Slot<T> {
    fn get(&self) -> Option<&T> {
        match self {
            Slot::Live(value) => Some(value),
            Slot::Transferred => None,
        }
    }

    fn take(&mut self) -> Option<T> {
        match std::mem::replace(self, Slot::Transferred) {
            Slot::Live(value) => Some(value),
            Slot::Transferred => None,
        }
    }
}

enum State<S, F> {
    Success(Slot<S>),
    Failure(Slot<F>),
}

/// Exactly one of a success or failure payload.
///
/// The outcome owns its payload until [`unwrap`](Outcome::unwrap) (or
/// [`unwrap_failure`](Outcome::unwrap_failure)) transfers it to the caller.
/// [`dispose`](Outcome::dispose) releases a payload that was never
/// transferred and does nothing otherwise. Failures are never raised
/// implicitly.
pub struct Outcome<S, F> {
    state: State<S, F>,
}

impl<S, F> Outcome<S, F> {
    pub fn success(value: S) -> Self {
        Self {
            state: State::Success(Slot::Live(value)),
        }
    }

    pub fn failure(value: F) -> Self {
        Self {
            state: State::Failure(Slot::Live(value)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, State::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// True once the payload has been transferred or disposed.
    pub fn is_transferred(&self) -> bool {
        matches!(
            self.state,
            State::Success(Slot::Transferred) | State::Failure(Slot::Transferred)
        )
    }

    pub fn try_get_success(&self) -> Option<&S> {
        match &self.state {
            State::Success(slot) => slot.get(),
            State::Failure(_) => None,
        }
    }

    pub fn try_get_failure(&self) -> Option<&F> {
        match &self.state {
            State::Failure(slot) => slot.get(),
            State::Success(_) => None,
        }
    }

    /// Borrow the success payload without taking ownership.
    pub fn peek(&self) -> Result<&S> {
        match &self.state {
            State::Success(slot) => slot
                .get()
                .ok_or(RuntimeError::UseAfterRelease("outcome payload")),
            State::Failure(_) => Err(RuntimeError::InvalidState(
                "peek called on a failed outcome".to_string(),
            )),
        }
    }

    /// Take the success payload. The caller now owns its disposal.
    pub fn unwrap(&mut self) -> Result<S> {
        match &mut self.state {
            State::Success(slot) => slot
                .take()
                .ok_or(RuntimeError::UseAfterRelease("outcome payload")),
            State::Failure(_) => Err(RuntimeError::InvalidState(
                "unwrap called on a failed outcome".to_string(),
            )),
        }
    }

    /// Take the failure payload. The caller now owns its disposal.
    pub fn unwrap_failure(&mut self) -> Result<F> {
        match &mut self.state {
            State::Failure(slot) => slot
                .take()
                .ok_or(RuntimeError::UseAfterRelease("outcome payload")),
            State::Success(_) => Err(RuntimeError::InvalidState(
                "unwrap_failure called on a successful outcome".to_string(),
            )),
        }
    }

    /// Apply exactly one continuation to the live payload.
    pub fn match_with<R>(
        &self,
        on_success: impl FnOnce(&S) -> R,
        on_failure: impl FnOnce(&F) -> R,
    ) -> Result<R> {
        match &self.state {
            State::Success(Slot::Live(value)) => Ok(on_success(value)),
            State::Failure(Slot::Live(value)) => Ok(on_failure(value)),
            _ => Err(RuntimeError::UseAfterRelease("outcome payload")),
        }
    }

    /// Transfer whichever payload is live into a plain `Result`.
    pub fn into_result(mut self) -> Result<std::result::Result<S, F>> {
        match &mut self.state {
            State::Success(slot) => slot
                .take()
                .map(Ok)
                .ok_or(RuntimeError::UseAfterRelease("outcome payload")),
            State::Failure(slot) => slot
                .take()
                .map(Err)
                .ok_or(RuntimeError::UseAfterRelease("outcome payload")),
        }
    }
}

impl<S: Releasable, F: Releasable> Outcome<S, F> {
    /// Release the payload unless it was transferred. Idempotent.
    pub fn dispose(&mut self) -> Result<()> {
        match &mut self.state {
            State::Success(slot) => release_slot(slot),
            State::Failure(slot) => release_slot(slot),
        }
    }
}

fn release_slot<T: Releasable>(slot: &mut Slot<T>) -> Result<()> {
    if let Slot::Live(value) = slot {
        value.release()?;
        *slot = Slot::Transferred;
    }
    Ok(())
}

impl<S: Releasable, F: Releasable> Releasable for Outcome<S, F> {
    fn release(&mut self) -> Result<()> {
        self.dispose()
    }
}

impl<S: fmt::Debug, F: fmt::Debug> fmt::Debug for Outcome<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Success(Slot::Live(v)) => f.debug_tuple("Success").field(v).finish(),
            State::Failure(Slot::Live(v)) => f.debug_tuple("Failure").field(v).finish(),
            State::Success(Slot::Transferred) => f.write_str("Success(<transferred>)"),
            State::Failure(Slot::Transferred) => f.write_str("Failure(<transferred>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::Handle;
    use crate::runtime::registry::EngineCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Releasable for Counted {
        fn release(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counted() -> (Counted, Arc<AtomicUsize>) {
        let n = Arc::new(AtomicUsize::new(0));
        (Counted(n.clone()), n)
    }

    #[test]
    fn test_dispose_without_unwrap_releases_once() {
        let (payload, releases) = counted();
        let mut outcome: Outcome<Counted, Counted> = Outcome::success(payload);
        outcome.dispose().unwrap();
        outcome.dispose().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(outcome.is_transferred());
    }

    #[test]
    fn test_unwrap_then_dispose_does_not_release() {
        let (payload, releases) = counted();
        let mut outcome: Outcome<Counted, Counted> = Outcome::success(payload);
        let mut taken = outcome.unwrap().unwrap();
        outcome.dispose().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        taken.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.unwrap(), Err(RuntimeError::UseAfterRelease(_))));
    }

    #[test]
    fn test_failure_branch_access() {
        let mut outcome: Outcome<&str, &str> = Outcome::failure("boom");
        assert!(outcome.is_failure());
        assert!(outcome.try_get_success().is_none());
        assert_eq!(outcome.try_get_failure(), Some(&"boom"));
        assert!(matches!(outcome.peek(), Err(RuntimeError::InvalidState(_))));
        assert!(matches!(outcome.unwrap(), Err(RuntimeError::InvalidState(_))));
        // Still owned by the outcome after the failed unwrap.
        assert_eq!(outcome.try_get_failure(), Some(&"boom"));
        assert_eq!(outcome.unwrap_failure().unwrap(), "boom");
    }

    #[test]
    fn test_match_applies_one_continuation() {
        let outcome: Outcome<i32, String> = Outcome::success(4);
        let calls = std::cell::Cell::new(0);
        let doubled = outcome
            .match_with(
                |v| {
                    calls.set(calls.get() + 1);
                    v * 2
                },
                |_| {
                    calls.set(calls.get() + 10);
                    0
                },
            )
            .unwrap();
        assert_eq!(doubled, 8);
        assert_eq!(calls.get(), 1);
        assert_eq!(outcome.peek().unwrap(), &4);
        assert_eq!(outcome.into_result().unwrap(), Ok(4));
    }

    #[test]
    fn test_handle_outcome_ownership() {
        let engine = EngineCell::sandbox();
        let live = || engine.with("count", |r| r.live_value_count()).unwrap();

        let ptr = engine.with("n", |r| r.new_number(1.0)).unwrap();
        let mut outcome: Outcome<Handle, Handle> =
            Outcome::success(Handle::owned(ptr, engine.clone()));
        let mut h = outcome.unwrap().unwrap();
        outcome.dispose().unwrap();
        assert_eq!(live(), 1);
        h.release().unwrap();
        assert_eq!(live(), 0);

        let ptr = engine.with("n", |r| r.new_number(2.0)).unwrap();
        let mut outcome: Outcome<Handle, Handle> =
            Outcome::failure(Handle::owned(ptr, engine.clone()));
        outcome.dispose().unwrap();
        assert_eq!(live(), 0);
    }
}
