//! Bridge between host async completions and engine promises.
//!
//! A [`Deferred`] is a pending engine promise plus its resolve/reject
//! functions. [`PromiseBridge`] settles deferreds from any thread by routing
//! through the dispatcher, and awaits engine promises either by pumping the
//! drain loop (on the worker) or by registering a settlement watcher (from
//! other threads).
//!
//! Rejections that still have no handler when a drain cycle ends are reported
//! once through the dispatcher's rejection hook, the global hook, or the log.

use crate::runtime::bridge::PromiseState;
use crate::runtime::context::{self, WorkerContext};
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handle::Handle;
use crate::runtime::js_value::JSValue;
use crate::runtime::outcome::Outcome;
use crate::runtime::runner::{Command, Work};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::{oneshot, Notify};

/// Cooperative cancellation signal for settlement waits.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Completes once [`cancel`](CancellationToken::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Report passed to unhandled-rejection hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct UnhandledRejection {
    pub reason: JSValue,
    pub is_handled: bool,
}

pub type RejectionHook = Arc<dyn Fn(&UnhandledRejection) + Send + Sync>;

struct DeferredSlots {
    promise: Option<Handle>,
    resolve: Option<Handle>,
    reject: Option<Handle>,
    settled: bool,
    loopback: WeakUnboundedSender<Command>,
}

impl Drop for DeferredSlots {
    fn drop(&mut self) {
        let handles: Vec<Handle> = [self.promise.take(), self.resolve.take(), self.reject.take()]
            .into_iter()
            .flatten()
            .collect();
        let off_worker = handles
            .first()
            .map_or(false, |h| !h.engine().is_owner_thread() && !h.engine().is_closed());
        if !off_worker {
            return;
        }
        // Hand the references back to the worker to be released there.
        let release: Work = Box::new(move |_: &WorkerContext| drop(handles));
        match self.loopback.upgrade() {
            Some(tx) => {
                if tx.send(Command::Work(release)).is_err() {
                    tracing::debug!("dispatcher stopped before deferred was released");
                }
            }
            None => tracing::debug!("dispatcher stopped before deferred was released"),
        }
    }
}

/// A pending engine promise and its capability.
///
/// Clones share the same promise. Settling is only possible on the worker
/// thread; settling an already-settled deferred is a no-op. When the last
/// clone is dropped off the worker, its engine references are released on
/// the worker in a later cycle.
#[derive(Clone)]
pub struct Deferred {
    slots: Arc<Mutex<DeferredSlots>>,
}

impl Deferred {
    pub(crate) fn new(
        promise: Handle,
        resolve: Handle,
        reject: Handle,
        loopback: WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            slots: Arc::new(Mutex::new(DeferredSlots {
                promise: Some(promise),
                resolve: Some(resolve),
                reject: Some(reject),
                settled: false,
                loopback,
            })),
        }
    }

    /// A new owned handle onto the promise.
    pub fn promise(&self) -> Result<Handle> {
        self.slots
            .lock()
            .promise
            .as_ref()
            .ok_or(RuntimeError::UseAfterRelease("deferred promise"))?
            .duplicate()
    }

    pub fn is_settled(&self) -> bool {
        self.slots.lock().settled
    }

    pub fn resolve(&self, cx: &WorkerContext, value: &Handle) -> Result<()> {
        self.settle_with(cx, true, value)
    }

    pub fn reject(&self, cx: &WorkerContext, reason: &Handle) -> Result<()> {
        self.settle_with(cx, false, reason)
    }

    pub fn resolve_value(&self, cx: &WorkerContext, value: &JSValue) -> Result<()> {
        let handle = cx.from_js_value(value)?;
        self.resolve(cx, &handle)
    }

    pub fn reject_value(&self, cx: &WorkerContext, reason: &JSValue) -> Result<()> {
        let handle = cx.from_js_value(reason)?;
        self.reject(cx, &handle)
    }

    /// Settle from a host completion: `Ok` resolves, `Err` rejects.
    pub fn settle(&self, cx: &WorkerContext, result: std::result::Result<JSValue, JSValue>) -> Result<()> {
        match result {
            Ok(value) => self.resolve_value(cx, &value),
            Err(reason) => self.reject_value(cx, &reason),
        }
    }

    /// The capability stays in place until the call succeeds, so a failed
    /// attempt can be retried.
    fn settle_with(&self, cx: &WorkerContext, fulfil: bool, value: &Handle) -> Result<()> {
        cx.engine().check_access("settle deferred")?;
        let func = {
            let slots = self.slots.lock();
            if slots.settled {
                tracing::trace!("deferred already settled; ignoring");
                return Ok(());
            }
            let capability = if fulfil { &slots.resolve } else { &slots.reject };
            let func = capability
                .as_ref()
                .ok_or(RuntimeError::UseAfterRelease("deferred capability"))?
                .duplicate()?;
            func
        };
        let mut outcome = cx.call(&func, None, &[value])?;
        drop(func);
        if let Some(exception) = outcome.try_get_failure() {
            let message = cx.stringify(exception)?;
            outcome.dispose()?;
            return Err(RuntimeError::foreign("settle deferred", message));
        }
        let (resolve, reject) = {
            let mut slots = self.slots.lock();
            slots.settled = true;
            (slots.resolve.take(), slots.reject.take())
        };
        drop((resolve, reject));
        outcome.dispose()
    }
}

/// Worker-side registration for a cross-thread settlement wait.
pub(crate) struct SettlementWatcher {
    pub(crate) promise: Handle,
    pub(crate) token: CancellationToken,
    pub(crate) tx: oneshot::Sender<Result<Outcome<Handle, Handle>>>,
}

/// Promises currently awaited from the host; their rejections count as
/// handled.
#[derive(Default)]
pub(crate) struct RejectionTracker {
    pub(crate) awaited: Vec<Handle>,
}

/// Cross-thread entry point for deferred creation, settlement and awaiting.
#[derive(Clone)]
pub struct PromiseBridge {
    dispatcher: Dispatcher,
}

impl PromiseBridge {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn create_deferred(&self) -> Result<Deferred> {
        self.dispatcher.invoke(|cx| cx.create_deferred())
    }

    pub fn resolve(&self, deferred: &Deferred, value: JSValue) -> Result<()> {
        let deferred = deferred.clone();
        self.dispatcher
            .invoke(move |cx| deferred.resolve_value(cx, &value))
    }

    pub fn reject(&self, deferred: &Deferred, reason: JSValue) -> Result<()> {
        let deferred = deferred.clone();
        self.dispatcher
            .invoke(move |cx| deferred.reject_value(cx, &reason))
    }

    /// Resolve with an engine value. The handle is consumed on the worker.
    pub fn resolve_handle(&self, deferred: &Deferred, value: Handle) -> Result<()> {
        let deferred = deferred.clone();
        self.dispatcher.invoke(move |cx| deferred.resolve(cx, &value))
    }

    pub fn reject_handle(&self, deferred: &Deferred, reason: Handle) -> Result<()> {
        let deferred = deferred.clone();
        self.dispatcher.invoke(move |cx| deferred.reject(cx, &reason))
    }

    /// Drive `fut` on the caller's executor, then settle `deferred` back on
    /// the worker.
    pub async fn settle_from_future<Fut>(&self, deferred: Deferred, fut: Fut) -> Result<()>
    where
        Fut: Future<Output = std::result::Result<JSValue, JSValue>>,
    {
        let result = fut.await;
        self.dispatcher
            .invoke_async(move |cx| deferred.settle(cx, result))
            .await
    }

    /// Block until `promise` settles or `token` fires.
    ///
    /// On the worker thread this pumps the drain loop in place; anywhere else
    /// it parks the calling thread while the worker keeps running.
    pub fn await_settlement(
        &self,
        promise: &Handle,
        token: &CancellationToken,
    ) -> Result<Outcome<Handle, Handle>> {
        if self.dispatcher.check_access() {
            return context::with_current(self.dispatcher.id(), |cx| {
                cx.await_settlement(promise, token)
            })
            .unwrap_or(Err(RuntimeError::ShuttingDown));
        }
        futures::executor::block_on(self.await_settlement_async(promise, token))
    }

    /// Block until `promise` settles and snapshot its value.
    ///
    /// A rejection comes back as `PromiseRejected` carrying the reason.
    pub fn await_value(&self, promise: &Handle, token: &CancellationToken) -> Result<JSValue> {
        let outcome = self.await_settlement(promise, token)?;
        self.dispatcher.invoke(move |cx| cx.settled_value(outcome))
    }

    pub async fn await_value_async(
        &self,
        promise: &Handle,
        token: &CancellationToken,
    ) -> Result<JSValue> {
        let outcome = self.await_settlement_async(promise, token).await?;
        self.dispatcher
            .invoke_async(move |cx| cx.settled_value(outcome))
            .await
    }

    /// Wait for `promise` without blocking the worker.
    ///
    /// Cancellation stops the wait only; the engine promise may still settle
    /// later.
    pub async fn await_settlement_async(
        &self,
        promise: &Handle,
        token: &CancellationToken,
    ) -> Result<Outcome<Handle, Handle>> {
        if token.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let ptr = promise.raw()?;
        let engine = promise.engine().clone();
        let (tx, rx) = oneshot::channel();
        let watch_token = token.clone();
        self.dispatcher
            .invoke_async(move |cx| {
                let promise = Handle::borrowed(ptr, engine).duplicate()?;
                cx.watch_settlement(SettlementWatcher {
                    promise,
                    token: watch_token,
                    tx,
                })
            })
            .await?;

        tokio::select! {
            settled = rx => settled.map_err(|_| RuntimeError::ShuttingDown)?,
            _ = token.cancelled() => {
                // Wake the worker so it drops the abandoned watcher.
                drop(self.dispatcher.invoke_async(|_| Ok(())));
                Err(RuntimeError::Cancelled)
            }
        }
    }
}

impl WorkerContext {
    pub fn create_deferred(&self) -> Result<Deferred> {
        let (promise, resolve, reject) = self
            .engine()
            .with("create deferred", |r| r.new_promise_capability())?;
        let engine = self.engine().clone();
        Ok(Deferred::new(
            Handle::owned(promise, engine.clone()),
            Handle::owned(resolve, engine.clone()),
            Handle::owned(reject, engine),
            self.loopback.clone(),
        ))
    }

    /// Snapshot a settled outcome, releasing its payload. A failure becomes
    /// `PromiseRejected`.
    pub fn settled_value(&self, outcome: Outcome<Handle, Handle>) -> Result<JSValue> {
        match outcome.into_result()? {
            Ok(mut value) => {
                let js = self.to_js_value(&value);
                value.release()?;
                js
            }
            Err(mut reason) => {
                let js = self
                    .to_js_value(&reason)
                    .or_else(|_| self.stringify(&reason).map(JSValue::String));
                reason.release()?;
                Err(RuntimeError::PromiseRejected { reason: js? })
            }
        }
    }

    /// Attach reactions to `promise`, returning the derived promise.
    pub fn promise_then(
        &self,
        promise: &Handle,
        on_fulfilled: Option<&Handle>,
        on_rejected: Option<&Handle>,
    ) -> Result<Handle> {
        let ptr = promise.raw()?;
        let fulfilled = on_fulfilled.map(Handle::raw).transpose()?.unwrap_or(0);
        let rejected = on_rejected.map(Handle::raw).transpose()?.unwrap_or(0);
        let derived = self.engine().with("promise then", |r| {
            r.promise_then(ptr, fulfilled, rejected)
        })?;
        Ok(Handle::owned(derived, self.engine().clone()))
    }

    pub fn promise_state(&self, promise: &Handle) -> Result<PromiseState> {
        let ptr = promise.raw()?;
        self.engine()
            .with("promise state", |r| r.promise_state(ptr))
    }

    /// The settled result of `promise`, or `None` while pending.
    pub fn settlement(&self, promise: &Handle) -> Result<Option<Outcome<Handle, Handle>>> {
        let ptr = promise.raw()?;
        let engine = self.engine().clone();
        self.engine().with("promise settlement", |r| {
            Ok(match r.promise_state(ptr)? {
                PromiseState::Pending => None,
                PromiseState::Fulfilled => Some(Outcome::success(Handle::owned(
                    r.promise_result(ptr)?,
                    engine.clone(),
                ))),
                PromiseState::Rejected => Some(Outcome::failure(Handle::owned(
                    r.promise_result(ptr)?,
                    engine.clone(),
                ))),
            })
        })
    }

    /// Pump the drain loop until `promise` settles or `token` fires.
    pub fn await_settlement(
        &self,
        promise: &Handle,
        token: &CancellationToken,
    ) -> Result<Outcome<Handle, Handle>> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RuntimeError::InvalidState(
                "cannot pump the dispatcher from inside an async host task".to_string(),
            ));
        }
        self.rejections.borrow_mut().awaited.push(promise.duplicate()?);
        let result = self.pump_until_settled(promise, token);
        let finished = self.rejections.borrow_mut().awaited.pop();
        drop(finished);
        result
    }

    fn pump_until_settled(
        &self,
        promise: &Handle,
        token: &CancellationToken,
    ) -> Result<Outcome<Handle, Handle>> {
        loop {
            if let Some(outcome) = self.settlement(promise)? {
                return Ok(outcome);
            }
            if token.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if self.is_stopping() {
                return Err(RuntimeError::ShuttingDown);
            }
            self.run_cycle();
            if self.settlement(promise)?.is_none() && !self.is_stopping() && !self.has_pending() {
                self.idle_wait(Some(token));
            }
        }
    }

    pub(crate) fn watch_settlement(&self, watcher: SettlementWatcher) -> Result<()> {
        match self.settlement(&watcher.promise)? {
            Some(outcome) => {
                let _ = watcher.tx.send(Ok(outcome));
            }
            None => self.watchers.borrow_mut().push(watcher),
        }
        Ok(())
    }

    /// Complete watchers whose promise settled; drop abandoned ones.
    pub(crate) fn check_watchers(&self) {
        let watchers = std::mem::take(&mut *self.watchers.borrow_mut());
        if watchers.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            if watcher.tx.is_closed() || watcher.token.is_cancelled() {
                continue;
            }
            match self.settlement(&watcher.promise) {
                Ok(None) => remaining.push(watcher),
                Ok(Some(outcome)) => {
                    let _ = watcher.tx.send(Ok(outcome));
                }
                Err(e) => {
                    let _ = watcher.tx.send(Err(e));
                }
            }
        }
        self.watchers.borrow_mut().extend(remaining);
    }

    fn is_awaited(&self, promise: &Handle) -> Result<bool> {
        for awaited in self.rejections.borrow().awaited.iter() {
            if awaited.same_value(promise)? {
                return Ok(true);
            }
        }
        for watcher in self.watchers.borrow().iter() {
            if watcher.promise.same_value(promise)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Report rejections from this cycle that never got a handler.
    pub(crate) fn flush_rejections(&self) -> Result<()> {
        let events = self
            .engine()
            .with("take rejection events", |r| r.take_rejection_events())?;
        if events.is_empty() {
            return Ok(());
        }

        let engine = self.engine().clone();
        let mut unhandled: Vec<(Handle, Handle)> = Vec::new();
        for event in events {
            let promise = Handle::owned(event.promise, engine.clone());
            let reason = Handle::owned(event.reason, engine.clone());
            if event.is_handled {
                let mut matched = None;
                for (i, (pending, _)) in unhandled.iter().enumerate() {
                    if pending.same_value(&promise)? {
                        matched = Some(i);
                        break;
                    }
                }
                match matched {
                    Some(i) => drop(unhandled.remove(i)),
                    None => tracing::trace!("handler attached to a previously reported rejection"),
                }
            } else if !self.is_awaited(&promise)? {
                unhandled.push((promise, reason));
            }
        }

        for (_promise, reason) in unhandled {
            let reason = self
                .to_js_value(&reason)
                .or_else(|_| self.stringify(&reason).map(JSValue::String))
                .unwrap_or(JSValue::Undefined);
            self.report_unhandled(&UnhandledRejection {
                reason,
                is_handled: false,
            });
        }
        Ok(())
    }

    fn report_unhandled(&self, rejection: &UnhandledRejection) {
        let hook = self
            .dispatcher_hook()
            .or_else(|| crate::runtime::global_unhandled_rejection_hook().cloned());
        match hook {
            Some(hook) => {
                if catch_unwind(AssertUnwindSafe(|| hook(rejection))).is_err() {
                    tracing::error!("unhandled rejection hook panicked");
                }
            }
            None => tracing::warn!(reason = %rejection.reason, "unhandled promise rejection"),
        }
    }
}
