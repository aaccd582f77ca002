//! Worker-thread API surface handed to work items.
//!
//! A [`WorkerContext`] exists only on the dispatcher's worker thread. Every
//! work item, microtask, timer callback and host function receives one, and
//! it is the only way to construct or inspect engine values.

use crate::runtime::bridge::{EqualOp, HostInvocation, ValueKind};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::conversion;
use crate::runtime::dispatcher::{Dispatcher, DispatcherState, Shared};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handle::Handle;
use crate::runtime::js_value::JSValue;
use crate::runtime::ops::{HostFunction, HostFuture, OpRegistry};
use crate::runtime::outcome::Outcome;
use crate::runtime::promise::{RejectionHook, RejectionTracker, SettlementWatcher};
use crate::runtime::registry::EngineCell;
use crate::runtime::runner::{Command, ExecutionDeadline};
use crate::runtime::timers::{TimerCallback, TimerId, TimerRegistry};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::task::LocalSet;

pub(crate) type Microtask = Box<dyn FnOnce(&WorkerContext) -> Result<()>>;

thread_local! {
    static CURRENT: RefCell<Option<Rc<WorkerContext>>> = const { RefCell::new(None) };
}

/// Run `f` with the context of dispatcher `id` if this thread is its worker.
pub(crate) fn with_current<R>(id: u64, f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    let cx = CURRENT.with(|current| current.borrow().clone())?;
    if cx.dispatcher_id != id {
        return None;
    }
    Some(f(&cx))
}

pub(crate) fn install(cx: Rc<WorkerContext>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(cx));
}

pub(crate) fn uninstall() -> Option<Rc<WorkerContext>> {
    CURRENT.with(|current| current.borrow_mut().take())
}

/// Engine entry point for host function calls.
pub(crate) fn dispatch_host_call(id: u64, invocation: HostInvocation) -> u32 {
    with_current(id, |cx| cx.dispatch_host_call(invocation)).unwrap_or_else(|| {
        tracing::error!(func_id = invocation.func_id, "host call outside of worker context");
        0
    })
}

/// Pieces the worker thread assembles before the loop starts.
pub(crate) struct ContextParts {
    pub(crate) dispatcher_id: u64,
    pub(crate) engine: Arc<EngineCell>,
    pub(crate) config: RuntimeConfig,
    pub(crate) shared: Weak<Shared>,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) inbound: UnboundedReceiver<Command>,
    pub(crate) loopback: WeakUnboundedSender<Command>,
    pub(crate) deadline: Arc<ExecutionDeadline>,
    pub(crate) rt: tokio::runtime::Runtime,
}

pub struct WorkerContext {
    pub(crate) dispatcher_id: u64,
    pub(crate) engine: Arc<EngineCell>,
    pub(crate) config: RuntimeConfig,
    pub(crate) shared: Weak<Shared>,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) inbound: RefCell<UnboundedReceiver<Command>>,
    pub(crate) backlog: RefCell<VecDeque<Command>>,
    pub(crate) loopback: WeakUnboundedSender<Command>,
    pub(crate) microtasks: RefCell<VecDeque<Microtask>>,
    pub(crate) timers: RefCell<TimerRegistry>,
    pub(crate) ops: RefCell<OpRegistry>,
    pub(crate) rejections: RefCell<RejectionTracker>,
    pub(crate) watchers: RefCell<Vec<SettlementWatcher>>,
    pub(crate) deadline: Arc<ExecutionDeadline>,
    pub(crate) rt: tokio::runtime::Runtime,
    pub(crate) local: RefCell<Option<LocalSet>>,
    pub(crate) host_tasks: Rc<Cell<usize>>,
    pub(crate) stopping: Cell<bool>,
    pub(crate) cycles: Cell<u64>,
}

impl WorkerContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            dispatcher_id: parts.dispatcher_id,
            engine: parts.engine,
            config: parts.config,
            shared: parts.shared,
            state: parts.state,
            inbound: RefCell::new(parts.inbound),
            backlog: RefCell::new(VecDeque::new()),
            loopback: parts.loopback,
            microtasks: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerRegistry::new()),
            ops: RefCell::new(OpRegistry::new()),
            rejections: RefCell::new(RejectionTracker::default()),
            watchers: RefCell::new(Vec::new()),
            deadline: parts.deadline,
            rt: parts.rt,
            local: RefCell::new(Some(LocalSet::new())),
            host_tasks: Rc::new(Cell::new(0)),
            stopping: Cell::new(false),
            cycles: Cell::new(0),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<EngineCell> {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// A handle to the dispatcher that owns this worker, while it is alive.
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.shared.upgrade().map(Dispatcher::from_shared)
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of completed drain cycles.
    pub fn cycle_count(&self) -> u64 {
        self.cycles.get()
    }

    pub(crate) fn dispatcher_hook(&self) -> Option<RejectionHook> {
        self.shared
            .upgrade()
            .and_then(|shared| shared.rejection_hook.lock().clone())
    }

    fn owned(&self, ptr: u32) -> Handle {
        Handle::owned(ptr, self.engine.clone())
    }

    fn borrowed(&self, ptr: u32) -> Handle {
        Handle::borrowed(ptr, self.engine.clone())
    }

    // Constants

    pub fn undefined(&self) -> Result<Handle> {
        let ptr = self.engine.with("undefined", |r| r.undefined())?;
        Ok(self.borrowed(ptr))
    }

    pub fn null(&self) -> Result<Handle> {
        let ptr = self.engine.with("null", |r| r.null())?;
        Ok(self.borrowed(ptr))
    }

    pub fn boolean(&self, value: bool) -> Result<Handle> {
        let ptr = self.engine.with("boolean", |r| r.boolean(value))?;
        Ok(self.borrowed(ptr))
    }

    // Construction

    pub fn number(&self, value: f64) -> Result<Handle> {
        let ptr = self.engine.with("new number", |r| r.new_number(value))?;
        Ok(self.owned(ptr))
    }

    pub fn string(&self, value: &str) -> Result<Handle> {
        let ptr = self.engine.with("new string", |r| r.new_string(value))?;
        Ok(self.owned(ptr))
    }

    pub fn bytes(&self, value: &[u8]) -> Result<Handle> {
        let ptr = self.engine.with("new array buffer", |r| r.new_bytes(value))?;
        Ok(self.owned(ptr))
    }

    pub fn object(&self) -> Result<Handle> {
        let ptr = self.engine.with("new object", |r| r.new_object())?;
        Ok(self.owned(ptr))
    }

    pub fn array(&self) -> Result<Handle> {
        let ptr = self.engine.with("new array", |r| r.new_array())?;
        Ok(self.owned(ptr))
    }

    pub fn error(&self, message: &str) -> Result<Handle> {
        let ptr = self.engine.with("new error", |r| r.new_error(message))?;
        Ok(self.owned(ptr))
    }

    pub fn from_js_value(&self, value: &JSValue) -> Result<Handle> {
        conversion::js_value_to_handle(&self.engine, value, &self.config)
    }

    pub fn to_js_value(&self, handle: &Handle) -> Result<JSValue> {
        conversion::handle_to_js_value(handle, &self.config)
    }

    // Inspection

    pub fn get(&self, object: &Handle, key: &str) -> Result<Handle> {
        let ptr = object.raw()?;
        let value = self.engine.with("get property", |r| r.get_prop(ptr, key))?;
        Ok(self.owned(value))
    }

    pub fn set(&self, object: &Handle, key: &str, value: &Handle) -> Result<()> {
        let obj = object.raw()?;
        let val = value.raw()?;
        self.engine.with("set property", |r| r.set_prop(obj, key, val))
    }

    pub fn keys(&self, object: &Handle) -> Result<Vec<String>> {
        let ptr = object.raw()?;
        self.engine.with("own property names", |r| {
            let names = r.own_property_names(ptr)?;
            let keys = names.iter().map(|name| r.to_string(*name)).collect();
            for name in names {
                r.free_value(name);
            }
            keys
        })
    }

    pub fn length(&self, value: &Handle) -> Result<u32> {
        let ptr = value.raw()?;
        self.engine.with("length", |r| r.length(ptr))
    }

    pub fn kind(&self, value: &Handle) -> Result<ValueKind> {
        let ptr = value.raw()?;
        self.engine.with("type of", |r| r.kind(ptr))
    }

    pub fn to_number(&self, value: &Handle) -> Result<f64> {
        let ptr = value.raw()?;
        self.engine.with("get number", |r| r.number(ptr))
    }

    /// The engine's string conversion of any value.
    pub fn stringify(&self, value: &Handle) -> Result<String> {
        let ptr = value.raw()?;
        self.engine.with("to string", |r| r.to_string(ptr))
    }

    pub fn to_bytes(&self, value: &Handle) -> Result<Vec<u8>> {
        let ptr = value.raw()?;
        self.engine.with("copy array buffer", |r| r.bytes(ptr))
    }

    pub fn strict_equals(&self, a: &Handle, b: &Handle) -> Result<bool> {
        let (a, b) = (a.raw()?, b.raw()?);
        self.engine
            .with("strict equals", |r| r.is_equal(a, b, EqualOp::StrictEq))
    }

    /// Take the engine's pending exception, if any.
    pub fn take_last_error(&self) -> Result<Option<Handle>> {
        let ptr = self.engine.with("last error", |r| r.take_last_error())?;
        Ok(ptr.map(|p| self.owned(p)))
    }

    fn throw_message(&self, message: &str) {
        let thrown = self.engine.with("throw", |r| {
            let error = r.new_error(message)?;
            let result = r.throw(error);
            r.free_value(error);
            result
        });
        if let Err(e) = thrown {
            tracing::error!(error = %e, "failed to raise host error in engine");
        }
    }

    // Calls

    /// Call `func`. A thrown exception comes back as the failure payload.
    pub fn call(
        &self,
        func: &Handle,
        this: Option<&Handle>,
        args: &[&Handle],
    ) -> Result<Outcome<Handle, Handle>> {
        let func_ptr = func.raw()?;
        let this_ptr = match this {
            Some(this) => this.raw()?,
            None => self.engine.with("undefined", |r| r.undefined())?,
        };
        let arg_ptrs = args
            .iter()
            .map(|arg| arg.raw())
            .collect::<Result<Vec<_>>>()?;
        let result = self
            .engine
            .with("call", |r| r.call(func_ptr, this_ptr, &arg_ptrs))?;
        Ok(match result {
            Ok(value) => Outcome::success(self.owned(value)),
            Err(exception) => Outcome::failure(self.owned(exception)),
        })
    }

    /// Call `func`, turning a thrown exception into an error.
    pub fn call_checked(
        &self,
        func: &Handle,
        this: Option<&Handle>,
        args: &[&Handle],
    ) -> Result<Handle> {
        let mut outcome = self.call(func, this, args)?;
        if let Some(exception) = outcome.try_get_failure() {
            let message = self.stringify(exception)?;
            outcome.dispose()?;
            return Err(RuntimeError::foreign("call", message));
        }
        outcome.unwrap()
    }

    // Host functions

    /// Expose a synchronous host function to the engine.
    pub fn new_function<F>(&self, name: &str, f: F) -> Result<Handle>
    where
        F: Fn(&WorkerContext, &Handle, &[Handle]) -> Result<Handle> + 'static,
    {
        self.register_function(name, HostFunction::Sync(Rc::new(f)))
    }

    /// Expose an async host function. Calls return a promise settled when the
    /// returned future completes.
    pub fn new_async_function<F>(&self, name: &str, f: F) -> Result<Handle>
    where
        F: Fn(&WorkerContext, &Handle, &[Handle]) -> Result<HostFuture> + 'static,
    {
        self.register_function(name, HostFunction::Async(Rc::new(f)))
    }

    fn register_function(&self, name: &str, handler: HostFunction) -> Result<Handle> {
        let id = self.ops.borrow_mut().register_op(name, handler)?;
        let ptr = self
            .engine
            .with("new function", |r| r.new_function(id, name))?;
        Ok(self.owned(ptr))
    }

    fn dispatch_host_call(&self, invocation: HostInvocation) -> u32 {
        let handler = self
            .ops
            .borrow()
            .get_by_id(invocation.func_id)
            .map(|op| op.handler.clone());
        let Some(handler) = handler else {
            self.throw_message(&format!("unknown host function {}", invocation.func_id));
            return 0;
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            let ptrs = self.engine.with("read host arguments", |r| {
                r.read_ptr_table(invocation.argv_ptr, invocation.argc)
            })?;
            let this = self.borrowed(invocation.this_ptr);
            let args: Vec<Handle> = ptrs.into_iter().map(|p| self.borrowed(p)).collect();
            let value = match &handler {
                HostFunction::Sync(f) => f(self, &this, &args)?,
                HostFunction::Async(f) => {
                    let fut = f(self, &this, &args)?;
                    self.start_host_task(fut)?
                }
            };
            value.into_raw()
        }))
        .unwrap_or_else(|payload| Err(RuntimeError::from_panic(payload)));

        match result {
            Ok(ptr) => ptr,
            Err(e) => {
                self.throw_message(&e.to_string());
                0
            }
        }
    }

    /// Create a promise settled by `fut`, which runs as a worker-local task.
    /// Its completion re-enters the inbound queue before touching the engine.
    fn start_host_task(&self, fut: HostFuture) -> Result<Handle> {
        let deferred = self.create_deferred()?;
        let promise = deferred.promise()?;
        let local = self.local.borrow();
        let local = local.as_ref().ok_or(RuntimeError::ShuttingDown)?;

        let loopback = self.loopback.clone();
        let counter = self.host_tasks.clone();
        counter.set(counter.get() + 1);
        local.spawn_local(async move {
            let result = fut.await;
            counter.set(counter.get().saturating_sub(1));
            let settle: Box<dyn FnOnce(&WorkerContext) + Send> = Box::new(move |cx| {
                if let Err(e) = deferred.settle(cx, result) {
                    tracing::warn!(error = %e, "failed to settle host task promise");
                }
            });
            match loopback.upgrade() {
                Some(tx) => {
                    if tx.send(Command::Work(settle)).is_err() {
                        tracing::debug!("dispatcher stopped before host task settled");
                    }
                }
                None => tracing::debug!("dispatcher stopped before host task settled"),
            }
        });
        Ok(promise)
    }

    // Scheduling

    /// Queue an immediate continuation. It runs before any delayed callback
    /// and before the current cycle ends.
    pub fn queue_microtask<F>(&self, f: F)
    where
        F: FnOnce(&WorkerContext) -> Result<()> + 'static,
    {
        self.microtasks.borrow_mut().push_back(Box::new(f));
    }

    pub fn schedule(&self, callback: TimerCallback, delay: Duration, repeating: bool) -> TimerId {
        self.timers
            .borrow_mut()
            .schedule(Instant::now(), callback, delay, repeating)
    }

    /// Call engine function `callback` once after `delay`.
    pub fn set_timeout(&self, callback: &Handle, delay: Duration) -> Result<TimerId> {
        let callback = callback.duplicate()?;
        Ok(self.schedule(TimerCallback::Function(callback), delay, false))
    }

    /// Call engine function `callback` every `period`.
    pub fn set_interval(&self, callback: &Handle, period: Duration) -> Result<TimerId> {
        let callback = callback.duplicate()?;
        Ok(self.schedule(TimerCallback::Function(callback), period, true))
    }

    pub fn set_host_timeout<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce(&WorkerContext) -> Result<()> + 'static,
    {
        let mut f = Some(f);
        self.schedule(
            TimerCallback::Host(Box::new(move |cx| match f.take() {
                Some(f) => f(cx),
                None => Ok(()),
            })),
            delay,
            false,
        )
    }

    pub fn set_host_interval<F>(&self, period: Duration, f: F) -> TimerId
    where
        F: FnMut(&WorkerContext) -> Result<()> + 'static,
    {
        self.schedule(TimerCallback::Host(Box::new(f)), period, true)
    }

    /// Cancel a timer. Returns false if it was unknown or already cancelled.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        let cancelled = self.timers.borrow_mut().cancel(id);
        match cancelled {
            Some(callback) => {
                drop(callback);
                true
            }
            None => false,
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    // Diagnostics

    /// Values currently alive inside the engine.
    pub fn live_value_count(&self) -> Result<usize> {
        self.engine.with("live value count", |r| r.live_value_count())
    }

    /// Owned handles currently alive on the host side.
    pub fn live_handles(&self) -> usize {
        self.engine.live_handles()
    }

    pub(crate) fn host_task_count(&self) -> usize {
        self.host_tasks.get()
    }
}
