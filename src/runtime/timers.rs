//! Delayed and periodic callback bookkeeping.
//!
//! The registry only tracks *when* callbacks are due; running them is the
//! dispatcher's job. Entries live in a map keyed by id with a min-heap of
//! `(due, seq, id)` beside it. Cancellation and rescheduling leave stale heap
//! entries behind, which are skipped when they surface.

use crate::runtime::context::WorkerContext;
use crate::runtime::error::Result;
use crate::runtime::handle::Handle;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

pub type TimerId = u32;

/// Smallest period a repeating timer may have.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// What a timer runs when it fires.
pub enum TimerCallback {
    /// An engine function, called with `undefined` as `this` and no arguments
    Function(Handle),
    /// Host code running on the worker thread
    Host(Box<dyn FnMut(&WorkerContext) -> Result<()>>),
}

impl fmt::Debug for TimerCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerCallback::Function(h) => f.debug_tuple("Function").field(h).finish(),
            TimerCallback::Host(_) => f.write_str("Host(..)"),
        }
    }
}

#[derive(Debug)]
pub struct DelayedCallback {
    pub id: TimerId,
    pub due: Instant,
    /// `Some` for repeating timers
    pub period: Option<Duration>,
    pub cancelled: bool,
    /// `None` while the callback is running
    callback: Option<TimerCallback>,
    seq: u64,
}

impl DelayedCallback {
    pub fn is_repeating(&self) -> bool {
        self.period.is_some()
    }
}

#[derive(Default)]
pub struct TimerRegistry {
    entries: HashMap<TimerId, DelayedCallback>,
    queue: BinaryHeap<Reverse<(Instant, u64, TimerId)>>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Schedule `callback` to run `delay` after `now`.
    ///
    /// Callbacks due at the same instant run in scheduling order.
    pub fn schedule(
        &mut self,
        now: Instant,
        callback: TimerCallback,
        delay: Duration,
        repeating: bool,
    ) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        while self.entries.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1).max(1);
        }
        let id = self.next_id;
        let seq = self.bump_seq();
        let due = now + delay;
        let period = repeating.then(|| delay.max(MIN_PERIOD));

        self.entries.insert(
            id,
            DelayedCallback {
                id,
                due,
                period,
                cancelled: false,
                callback: Some(callback),
                seq,
            },
        );
        self.queue.push(Reverse((due, seq, id)));
        tracing::trace!(id, ?delay, repeating, "timer scheduled");
        id
    }

    /// Mark a timer cancelled and hand back its callback for release.
    ///
    /// Returns `None` if the id is unknown or already cancelled. A timer
    /// cancelled while it runs is dropped once it finishes.
    pub fn cancel(&mut self, id: TimerId) -> Option<Option<TimerCallback>> {
        let entry = self.entries.get_mut(&id)?;
        if entry.cancelled {
            return None;
        }
        entry.cancelled = true;
        tracing::trace!(id, "timer cancelled");
        Some(entry.callback.take())
    }

    pub fn get(&self, id: TimerId) -> Option<&DelayedCallback> {
        self.entries.get(&id)
    }

    /// Number of timers that have not been cancelled.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.cancelled).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop stale heap entries, forgetting cancelled timers as they surface.
    fn prune(&mut self) {
        while let Some(Reverse((_, seq, id))) = self.queue.peek().copied() {
            match self.entries.get(&id) {
                Some(entry) if entry.seq == seq && !entry.cancelled => break,
                Some(entry) if entry.seq == seq => {
                    self.entries.remove(&id);
                }
                _ => {}
            }
            self.queue.pop();
        }
    }

    /// Earliest due time among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.queue.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Take the earliest timer due at or before `now`.
    ///
    /// Repeating timers are rescheduled for `now + period` before the callback
    /// is handed out; pass it back through [`TimerRegistry::restore`] when it
    /// finishes.
    pub fn take_due(&mut self, now: Instant) -> Option<(TimerId, TimerCallback)> {
        self.prune();
        let Reverse((due, _, id)) = *self.queue.peek()?;
        if due > now {
            return None;
        }
        self.queue.pop();

        let period = self.entries.get(&id)?.period;
        match period {
            None => {
                let mut entry = self.entries.remove(&id)?;
                entry.callback.take().map(|cb| (id, cb))
            }
            Some(period) => {
                let seq = self.bump_seq();
                let entry = self.entries.get_mut(&id)?;
                entry.due = now + period;
                entry.seq = seq;
                let callback = entry.callback.take()?;
                self.queue.push(Reverse((now + period, seq, id)));
                Some((id, callback))
            }
        }
    }

    /// Return a repeating timer's callback after it ran.
    ///
    /// Gives the callback back when the timer is gone or was cancelled in
    /// the meantime, so the caller can release it.
    pub fn restore(&mut self, id: TimerId, callback: TimerCallback) -> Option<TimerCallback> {
        let cancelled = match self.entries.get_mut(&id) {
            Some(entry) if !entry.cancelled && entry.callback.is_none() => {
                entry.callback = Some(callback);
                return None;
            }
            Some(entry) => entry.cancelled,
            None => false,
        };
        if cancelled {
            self.entries.remove(&id);
        }
        Some(callback)
    }

    /// Remove everything, returning callbacks for release.
    pub fn drain(&mut self) -> Vec<TimerCallback> {
        self.queue.clear();
        self.entries
            .drain()
            .filter_map(|(_, mut entry)| entry.callback.take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> TimerCallback {
        TimerCallback::Host(Box::new(|_| Ok(())))
    }

    fn fire_all(registry: &mut TimerRegistry, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some((id, cb)) = registry.take_due(now) {
            fired.push(id);
            if registry.get(id).is_some() {
                registry.restore(id, cb);
            }
        }
        fired
    }

    #[test]
    fn test_due_order_with_insertion_tie_break() {
        let mut timers = TimerRegistry::new();
        let now = Instant::now();
        let late = timers.schedule(now, host(), Duration::from_millis(20), false);
        let first = timers.schedule(now, host(), Duration::from_millis(5), false);
        let second = timers.schedule(now, host(), Duration::from_millis(5), false);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));
        assert!(timers.take_due(now).is_none());

        let fired = fire_all(&mut timers, now + Duration::from_millis(30));
        assert_eq!(fired, vec![first, second, late]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel_skips_entry() {
        let mut timers = TimerRegistry::new();
        let now = Instant::now();
        let a = timers.schedule(now, host(), Duration::ZERO, false);
        let b = timers.schedule(now, host(), Duration::ZERO, false);

        assert!(matches!(timers.cancel(a), Some(Some(_))));
        assert!(timers.cancel(a).is_none());
        assert_eq!(timers.len(), 1);

        assert_eq!(fire_all(&mut timers, now), vec![b]);
        assert!(timers.next_deadline().is_none());
        assert!(timers.get(a).is_none());
    }

    #[test]
    fn test_repeating_timer_reschedules_from_fire_time() {
        let mut timers = TimerRegistry::new();
        let start = Instant::now();
        let id = timers.schedule(start, host(), Duration::from_millis(10), true);

        let fire_at = start + Duration::from_millis(13);
        let (fired, cb) = timers.take_due(fire_at).unwrap();
        assert_eq!(fired, id);
        assert_eq!(timers.get(id).unwrap().due, fire_at + Duration::from_millis(10));
        assert!(timers.restore(id, cb).is_none());

        // Not due again until a full period after it fired.
        assert!(timers.take_due(fire_at + Duration::from_millis(9)).is_none());
        assert!(timers.take_due(fire_at + Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_cancel_while_running_drops_on_restore() {
        let mut timers = TimerRegistry::new();
        let now = Instant::now();
        let id = timers.schedule(now, host(), Duration::from_millis(1), true);

        let (_, cb) = timers.take_due(now + Duration::from_millis(1)).unwrap();
        assert!(matches!(timers.cancel(id), Some(None)));
        assert!(timers.restore(id, cb).is_some());
        assert!(timers.get(id).is_none());
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_zero_period_is_clamped() {
        let mut timers = TimerRegistry::new();
        let now = Instant::now();
        let id = timers.schedule(now, host(), Duration::ZERO, true);
        assert_eq!(timers.get(id).unwrap().period, Some(MIN_PERIOD));

        let (_, cb) = timers.take_due(now).unwrap();
        timers.restore(id, cb);
        assert!(timers.take_due(now).is_none());
    }

    #[test]
    fn test_drain_returns_callbacks() {
        let mut timers = TimerRegistry::new();
        let now = Instant::now();
        timers.schedule(now, host(), Duration::from_secs(5), false);
        timers.schedule(now, host(), Duration::from_secs(5), true);
        assert_eq!(timers.drain().len(), 2);
        assert!(timers.next_deadline().is_none());
    }
}
