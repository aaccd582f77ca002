//! Reference-counted handles onto engine values.

use crate::runtime::bridge::EqualOp;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::registry::EngineCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the holder of a [`Handle`] is responsible for releasing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Borrowed,
}

/// Something that must be released exactly once.
pub trait Releasable: Send {
    fn release(&mut self) -> Result<()>;
}

/// A foreign value pointer plus its ownership tag.
///
/// Owned handles hold one engine reference and must be released exactly once.
/// Borrowed handles are views onto a reference held elsewhere; a view taken
/// with [`as_borrowed`](Handle::as_borrowed) shares its owner's liveness and
/// is tombstoned together with it. Every engine
/// operation, including `release` and `duplicate`, must run on the dispatcher's
/// worker thread and raises `CrossThreadViolation` otherwise.
///
/// An owned handle dropped on the worker thread is released by `Drop`. One
/// dropped anywhere else is reported as leaked, never freed off-thread.
pub struct Handle {
    ptr: u32,
    ownership: Ownership,
    alive: Arc<AtomicBool>,
    engine: Arc<EngineCell>,
}

impl Handle {
    pub(crate) fn owned(ptr: u32, engine: Arc<EngineCell>) -> Self {
        engine.handle_opened();
        Self {
            ptr,
            ownership: Ownership::Owned,
            alive: Arc::new(AtomicBool::new(true)),
            engine,
        }
    }

    pub(crate) fn borrowed(ptr: u32, engine: Arc<EngineCell>) -> Self {
        Self {
            ptr,
            ownership: Ownership::Borrowed,
            alive: Arc::new(AtomicBool::new(true)),
            engine,
        }
    }

    fn tombstone(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// The foreign pointer, or `UseAfterRelease` once tombstoned.
    pub fn raw(&self) -> Result<u32> {
        if !self.is_alive() {
            return Err(RuntimeError::UseAfterRelease("handle"));
        }
        Ok(self.ptr)
    }

    pub(crate) fn engine(&self) -> &Arc<EngineCell> {
        &self.engine
    }

    /// A new owned handle onto the same value.
    pub fn duplicate(&self) -> Result<Handle> {
        let ptr = self.raw()?;
        let dup = self.engine.with("duplicate handle", |r| r.dup_value(ptr))?;
        Ok(Handle::owned(dup, self.engine.clone()))
    }

    /// A non-owning view. Does not touch the engine.
    ///
    /// The view dies with the reference it borrows from.
    pub fn as_borrowed(&self) -> Result<Handle> {
        let ptr = self.raw()?;
        Ok(Handle {
            ptr,
            ownership: Ownership::Borrowed,
            alive: self.alive.clone(),
            engine: self.engine.clone(),
        })
    }

    /// Drop the engine reference and tombstone the handle.
    ///
    /// A failed attempt (for example from the wrong thread) leaves the handle
    /// alive so it can be released later from the worker.
    pub fn release(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Err(RuntimeError::UseAfterRelease("handle"));
        }
        if self.ownership == Ownership::Borrowed {
            return Err(RuntimeError::BorrowedRelease);
        }
        let ptr = self.ptr;
        self.engine.with("release handle", |r| {
            r.free_value(ptr);
            Ok(())
        })?;
        self.tombstone();
        self.engine.handle_closed();
        Ok(())
    }

    /// Give the engine an owned reference, consuming the handle.
    ///
    /// Owned handles hand over their own reference; borrowed ones are
    /// duplicated first.
    pub(crate) fn into_raw(mut self) -> Result<u32> {
        let ptr = self.raw()?;
        match self.ownership {
            Ownership::Owned => {
                self.engine.check_access("transfer handle")?;
                self.tombstone();
                self.engine.handle_closed();
                Ok(ptr)
            }
            Ownership::Borrowed => self.engine.with("transfer handle", |r| r.dup_value(ptr)),
        }
    }

    /// `SameValue` comparison of the underlying values.
    pub fn same_value(&self, other: &Handle) -> Result<bool> {
        let a = self.raw()?;
        let b = other.raw()?;
        self.engine
            .with("compare handles", |r| r.is_equal(a, b, EqualOp::SameValue))
    }
}

impl Releasable for Handle {
    fn release(&mut self) -> Result<()> {
        Handle::release(self)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("ptr", &self.ptr)
            .field("ownership", &self.ownership)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.is_alive() || self.ownership == Ownership::Borrowed || self.engine.is_closed() {
            return;
        }
        if self.engine.is_owner_thread() {
            if let Err(e) = Handle::release(self) {
                tracing::warn!(ptr = self.ptr, error = %e, "failed to release dropped handle");
            }
        } else {
            tracing::warn!(
                ptr = self.ptr,
                "owned handle dropped off the worker thread; value leaked until shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(engine: &Arc<EngineCell>) -> usize {
        engine.with("count", |r| r.live_value_count()).unwrap()
    }

    fn number(engine: &Arc<EngineCell>, value: f64) -> Handle {
        let ptr = engine.with("number", |r| r.new_number(value)).unwrap();
        Handle::owned(ptr, engine.clone())
    }

    #[test]
    fn test_duplicate_then_release_preserves_original() {
        let engine = EngineCell::sandbox();
        let mut h = number(&engine, 7.0);
        let baseline = live(&engine);

        let mut dup = h.duplicate().unwrap();
        assert!(dup.is_owned());
        assert!(dup.same_value(&h).unwrap());
        dup.release().unwrap();

        assert_eq!(live(&engine), baseline);
        let ptr = h.raw().unwrap();
        assert_eq!(engine.with("get", |r| r.number(ptr)).unwrap(), 7.0);

        h.release().unwrap();
        assert!(matches!(h.release(), Err(RuntimeError::UseAfterRelease(_))));
        assert!(matches!(h.duplicate(), Err(RuntimeError::UseAfterRelease(_))));
        assert_eq!(live(&engine), 0);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_borrowed_view_cannot_release() {
        let engine = EngineCell::sandbox();
        let mut h = number(&engine, 1.0);
        let mut view = h.as_borrowed().unwrap();
        assert_eq!(view.ownership(), Ownership::Borrowed);
        assert!(matches!(view.release(), Err(RuntimeError::BorrowedRelease)));
        assert!(view.is_alive());
        h.release().unwrap();
    }

    #[test]
    fn test_view_dies_with_its_owner() {
        let engine = EngineCell::sandbox();
        let mut h = number(&engine, 2.0);
        let view = h.as_borrowed().unwrap();
        let nested = view.as_borrowed().unwrap();

        h.release().unwrap();
        assert!(!view.is_alive());
        assert!(!nested.is_alive());
        assert!(matches!(view.raw(), Err(RuntimeError::UseAfterRelease(_))));
        assert!(matches!(view.duplicate(), Err(RuntimeError::UseAfterRelease(_))));
        assert!(matches!(nested.as_borrowed(), Err(RuntimeError::UseAfterRelease(_))));
    }

    #[test]
    fn test_view_dies_when_owner_is_transferred() {
        let engine = EngineCell::sandbox();
        let h = number(&engine, 8.0);
        let view = h.as_borrowed().unwrap();
        let ptr = h.into_raw().unwrap();
        assert!(matches!(view.raw(), Err(RuntimeError::UseAfterRelease(_))));
        engine
            .with("free", |r| {
                r.free_value(ptr);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_release_off_thread_is_rejected_and_retryable() {
        let engine = EngineCell::sandbox();
        let h = number(&engine, 3.0);

        let (h, result) = std::thread::spawn(move || {
            let mut h = h;
            let result = h.release();
            (h, result)
        })
        .join()
        .unwrap();

        assert!(matches!(
            result,
            Err(RuntimeError::CrossThreadViolation { operation: "release handle", .. })
        ));
        let mut h = h;
        assert!(h.is_alive());
        h.release().unwrap();
        assert_eq!(live(&engine), 0);
    }

    #[test]
    fn test_drop_on_owner_thread_releases() {
        let engine = EngineCell::sandbox();
        {
            let _h = number(&engine, 5.0);
            assert_eq!(live(&engine), 1);
        }
        assert_eq!(live(&engine), 0);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_drop_off_thread_leaks_instead_of_freeing() {
        let engine = EngineCell::sandbox();
        let h = number(&engine, 5.0);
        std::thread::spawn(move || drop(h)).join().unwrap();
        assert_eq!(live(&engine), 1);
        assert_eq!(engine.live_handles(), 1);
    }

    #[test]
    fn test_into_raw_transfers_reference() {
        let engine = EngineCell::sandbox();
        let h = number(&engine, 9.0);
        let ptr = h.into_raw().unwrap();
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(live(&engine), 1);
        engine
            .with("free", |r| {
                r.free_value(ptr);
                Ok(())
            })
            .unwrap();
        assert_eq!(live(&engine), 0);
    }
}
