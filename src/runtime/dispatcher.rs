//! Caller-facing handle onto a dispatcher's worker thread.

use crate::runtime::bridge::{EngineFactory, MemoryBridge};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::context::{self, WorkerContext};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::promise::{PromiseBridge, RejectionHook, UnhandledRejection};
use crate::runtime::runner::{self, run_guarded, Command, Work, WorkerSetup};
use crate::runtime::sandbox::SandboxEngine;
use crate::runtime::timers::{TimerCallback, TimerId};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Phase of the worker's drain cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle = 0,
    DrainingWorkQueue = 1,
    DrainingImmediate = 2,
    RunningDelayed = 3,
    ShuttingDown = 4,
    Stopped = 5,
}

impl DispatcherState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => DispatcherState::Idle,
            1 => DispatcherState::DrainingWorkQueue,
            2 => DispatcherState::DrainingImmediate,
            3 => DispatcherState::RunningDelayed,
            4 => DispatcherState::ShuttingDown,
            _ => DispatcherState::Stopped,
        }
    }
}

/// State shared between every clone of a dispatcher.
pub(crate) struct Shared {
    id: u64,
    state: Arc<AtomicU8>,
    worker: OnceCell<ThreadId>,
    tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    pub(crate) rejection_hook: Mutex<Option<RejectionHook>>,
}

impl Shared {
    fn is_worker_thread(&self) -> bool {
        self.worker
            .get()
            .map_or(false, |worker| *worker == thread::current().id())
    }

    fn send(&self, work: Work) -> Result<()> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(RuntimeError::ShuttingDown)?;
        tx.send(Command::Work(work))
            .map_err(|_| RuntimeError::ShuttingDown)
    }

    fn shutdown(&self) -> Result<()> {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match DispatcherState::from_u8(current) {
                    DispatcherState::Stopped => None,
                    _ => Some(DispatcherState::ShuttingDown as u8),
                }
            });

        if let Some(tx) = self.tx.lock().take() {
            tracing::debug!(id = self.id, "shutting down dispatcher");
            let _ = tx.send(Command::Shutdown);
        }

        // The worker cannot join itself; it exits once the current cycle ends.
        if self.is_worker_thread() {
            return Ok(());
        }

        let join = self.join.lock().take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!(id = self.id, "dispatcher worker thread panicked");
                return Err(RuntimeError::WorkPanicked(
                    "dispatcher worker thread panicked".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "dispatcher shutdown failed during drop");
        }
    }
}

/// Owner of one engine and the worker thread that serializes access to it.
///
/// Clones refer to the same worker. The worker shuts down when [`shutdown`]
/// is called or the last clone is dropped.
///
/// [`shutdown`]: Dispatcher::shutdown
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Start a worker thread whose engine is built by `factory`.
    pub fn spawn(config: RuntimeConfig, factory: EngineFactory) -> Result<Self> {
        config.validate()?;
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let loopback = tx.downgrade();
        let state = Arc::new(AtomicU8::new(DispatcherState::Idle as u8));

        let shared = Arc::new(Shared {
            id,
            state: state.clone(),
            worker: OnceCell::new(),
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(None),
            rejection_hook: Mutex::new(None),
        });

        let join = runner::spawn_worker(WorkerSetup {
            dispatcher_id: id,
            config,
            factory,
            shared: Arc::downgrade(&shared),
            state,
            inbound: rx,
            loopback,
        })?;
        let _ = shared.worker.set(join.thread().id());
        *shared.join.lock() = Some(join);

        Ok(Self { shared })
    }

    /// Start a worker over the in-process [`SandboxEngine`].
    pub fn spawn_sandbox(config: RuntimeConfig) -> Result<Self> {
        Self::spawn(
            config,
            Box::new(|| Ok(Box::new(SandboxEngine::new()) as Box<dyn MemoryBridge>)),
        )
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the caller is running on this dispatcher's worker thread.
    pub fn check_access(&self) -> bool {
        self.shared.is_worker_thread()
    }

    pub fn worker_thread(&self) -> Option<ThreadId> {
        self.shared.worker.get().copied()
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(
            self.state(),
            DispatcherState::ShuttingDown | DispatcherState::Stopped
        )
    }

    /// Run `f` on the worker and wait for its result.
    ///
    /// Runs inline when called from the worker itself. Errors and panics
    /// raised by `f` are returned to the caller.
    pub fn invoke<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WorkerContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.check_access() {
            return context::with_current(self.shared.id, |cx| run_guarded(cx, f))
                .unwrap_or(Err(RuntimeError::ShuttingDown));
        }

        let (tx, rx) = std::sync::mpsc::channel();
        self.shared.send(Box::new(move |cx| {
            let _ = tx.send(run_guarded(cx, f));
        }))?;
        rx.recv().map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Queue `f` on the worker without blocking.
    ///
    /// The item is enqueued before this returns, so dropping the future does
    /// not cancel it. From the worker itself the item runs in a later cycle.
    pub fn invoke_async<T, F>(&self, f: F) -> WorkFuture<T>
    where
        F: FnOnce(&WorkerContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sent = self.shared.send(Box::new(move |cx| {
            let _ = tx.send(run_guarded(cx, f));
        }));
        match sent {
            Ok(()) => WorkFuture {
                inner: WorkState::Pending(rx),
            },
            Err(e) => WorkFuture {
                inner: WorkState::Failed(Some(e)),
            },
        }
    }

    pub fn promises(&self) -> PromiseBridge {
        PromiseBridge::new(self.clone())
    }

    /// Route this dispatcher's unhandled rejections to `hook` instead of the
    /// global hook.
    pub fn set_unhandled_rejection_hook<F>(&self, hook: F)
    where
        F: Fn(&UnhandledRejection) + Send + Sync + 'static,
    {
        *self.shared.rejection_hook.lock() = Some(Arc::new(hook));
    }

    pub fn clear_unhandled_rejection_hook(&self) {
        self.shared.rejection_hook.lock().take();
    }

    /// Schedule host code as a delayed callback on the worker.
    pub fn schedule_timer<F>(&self, delay: Duration, repeating: bool, f: F) -> Result<TimerId>
    where
        F: FnMut(&WorkerContext) -> Result<()> + Send + 'static,
    {
        self.invoke(move |cx| Ok(cx.schedule(TimerCallback::Host(Box::new(f)), delay, repeating)))
    }

    pub fn cancel_timer(&self, id: TimerId) -> Result<bool> {
        self.invoke(move |cx| Ok(cx.clear_timer(id)))
    }

    /// Stop accepting work, let queued items finish, and join the worker.
    ///
    /// Idempotent. Called from the worker itself, the join is skipped and the
    /// thread exits after its current cycle.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.shutdown()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

enum WorkState<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Failed(Option<RuntimeError>),
}

/// Completion of an [`invoke_async`](Dispatcher::invoke_async) work item.
pub struct WorkFuture<T> {
    inner: WorkState<T>,
}

impl<T> WorkFuture<T> {
    /// Block the current thread until the item completes.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for WorkFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            WorkState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(RuntimeError::ShuttingDown))),
            WorkState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or_else(|| {
                RuntimeError::InvalidState("work future polled after completion".to_string())
            }))),
        }
    }
}
