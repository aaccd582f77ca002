//! Worker thread hosting the engine and its drain loop.
//!
//! The engine lives on a dedicated OS thread alongside a current-thread Tokio
//! runtime. Commands from any thread arrive through [`Command`] and are run
//! between drain phases: queued work first, then immediate continuations to
//! exhaustion, then at most one due delayed callback.

use crate::runtime::bridge::EngineFactory;
use crate::runtime::config::RuntimeConfig;
use crate::runtime::context::{self, ContextParts, WorkerContext};
use crate::runtime::dispatcher::{DispatcherState, Shared};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::promise::CancellationToken;
use crate::runtime::registry::{EngineCell, HandleRegistry, JobStep};
use crate::runtime::timers::TimerCallback;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

type InitSignalChannel = (StdSender<Result<()>>, StdReceiver<Result<()>>);

pub(crate) type Work = Box<dyn FnOnce(&WorkerContext) + Send>;

/// Commands sent to the worker thread.
pub(crate) enum Command {
    Work(Work),
    Shutdown,
}

/// Run a work closure, turning a panic into `WorkPanicked`.
pub(crate) fn run_guarded<T>(
    cx: &WorkerContext,
    f: impl FnOnce(&WorkerContext) -> Result<T>,
) -> Result<T> {
    catch_unwind(AssertUnwindSafe(|| f(cx))).unwrap_or_else(|payload| Err(RuntimeError::from_panic(payload)))
}

/// Deadline polled by the engine's interrupt handler.
#[derive(Default)]
pub(crate) struct ExecutionDeadline {
    at: Mutex<Option<Instant>>,
}

impl ExecutionDeadline {
    /// Start a deadline `timeout` from now unless an outer one is running.
    pub(crate) fn arm(self: &Arc<Self>, timeout: Option<Duration>) -> DeadlineGuard {
        let mut at = self.at.lock();
        let previous = *at;
        if let (None, Some(timeout)) = (previous, timeout) {
            *at = Some(Instant::now() + timeout);
        }
        DeadlineGuard {
            deadline: self.clone(),
            previous,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(*self.at.lock(), Some(at) if Instant::now() >= at)
    }
}

pub(crate) struct DeadlineGuard {
    deadline: Arc<ExecutionDeadline>,
    previous: Option<Instant>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        *self.deadline.at.lock() = self.previous;
    }
}

pub(crate) struct WorkerSetup {
    pub(crate) dispatcher_id: u64,
    pub(crate) config: RuntimeConfig,
    pub(crate) factory: EngineFactory,
    pub(crate) shared: Weak<Shared>,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Command>,
    pub(crate) loopback: mpsc::WeakUnboundedSender<Command>,
}

/// Spawn the worker thread and wait for the engine to come up.
pub(crate) fn spawn_worker(setup: WorkerSetup) -> Result<JoinHandle<()>> {
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();

    let join = std::thread::Builder::new()
        .name(setup.config.thread_name.clone())
        .spawn(move || {
            let cx = match bootstrap(setup) {
                Ok(cx) => {
                    let _ = init_tx.send(Ok(()));
                    cx
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            tracing::debug!(id = cx.dispatcher_id, "dispatcher worker started");
            cx.run();
            cx.teardown();
            drop(context::uninstall());
        })?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(join),
        Ok(Err(err)) => {
            let _ = join.join();
            Err(err)
        }
        Err(_) => Err(RuntimeError::InvalidState(
            "worker thread exited during initialization".to_string(),
        )),
    }
}

fn bootstrap(setup: WorkerSetup) -> Result<Rc<WorkerContext>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let bridge = (setup.factory)()?;
    let registry = HandleRegistry::open(bridge, &setup.config)?;

    let id = setup.dispatcher_id;
    registry
        .bridge()
        .set_host_trampoline(Box::new(move |invocation| context::dispatch_host_call(id, invocation)));

    let deadline = Arc::new(ExecutionDeadline::default());
    let interrupt = deadline.clone();
    registry
        .bridge()
        .set_interrupt_handler(Some(Box::new(move || interrupt.expired())));

    let cx = Rc::new(WorkerContext::new(ContextParts {
        dispatcher_id: id,
        engine: EngineCell::new(registry),
        config: setup.config,
        shared: setup.shared,
        state: setup.state,
        inbound: setup.inbound,
        loopback: setup.loopback,
        deadline,
        rt,
    }));
    context::install(cx.clone());
    Ok(cx)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl WorkerContext {
    fn run(&self) {
        while !self.is_stopping() {
            self.run_cycle();
            if self.is_stopping() {
                break;
            }
            if !self.has_pending() {
                self.idle_wait(None);
            }
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.get()
    }

    /// Record a phase change. Never overrides a shutdown in progress.
    pub(crate) fn set_state(&self, next: DispatcherState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match DispatcherState::from_u8(current) {
                    DispatcherState::ShuttingDown | DispatcherState::Stopped => None,
                    _ => Some(next as u8),
                }
            });
    }

    /// One full drain cycle.
    pub(crate) fn run_cycle(&self) {
        self.drain_work_queue();
        self.poll_host_tasks();
        self.drain_immediate();
        if self.run_one_delayed() {
            self.drain_immediate();
        }
        if let Err(e) = self.flush_rejections() {
            tracing::warn!(error = %e, "failed to collect promise rejections");
        }
        self.cycles.set(self.cycles.get() + 1);
        self.set_state(DispatcherState::Idle);
    }

    fn pull_inbound(&self) {
        let Ok(mut inbound) = self.inbound.try_borrow_mut() else {
            return;
        };
        let mut backlog = self.backlog.borrow_mut();
        while let Ok(cmd) = inbound.try_recv() {
            backlog.push_back(cmd);
        }
    }

    /// Run every command queued at the start of this phase.
    fn drain_work_queue(&self) {
        self.pull_inbound();
        let queued = self.backlog.borrow().len();
        if queued == 0 {
            return;
        }
        self.set_state(DispatcherState::DrainingWorkQueue);
        tracing::trace!(queued, "draining work queue");
        for _ in 0..queued {
            let next = self.backlog.borrow_mut().pop_front();
            match next {
                Some(Command::Work(work)) => {
                    let _deadline = self.deadline.arm(self.config.execution_timeout);
                    if catch_unwind(AssertUnwindSafe(|| work(self))).is_err() {
                        tracing::error!("work item panicked outside its completion guard");
                    }
                }
                Some(Command::Shutdown) => {
                    tracing::debug!(id = self.dispatcher_id, "shutdown requested");
                    self.stopping.set(true);
                    break;
                }
                None => break,
            }
        }
    }

    /// Give worker-local host tasks one chance to make progress.
    fn poll_host_tasks(&self) {
        if self.host_task_count() == 0 {
            return;
        }
        let local = self.local.borrow();
        if let Some(local) = local.as_ref() {
            self.rt.block_on(local.run_until(tokio::task::yield_now()));
        }
    }

    /// Run host microtasks and engine jobs until neither has anything left.
    fn drain_immediate(&self) {
        self.set_state(DispatcherState::DrainingImmediate);
        let _deadline = self.deadline.arm(self.config.execution_timeout);
        loop {
            let mut progressed = false;

            loop {
                let next = self.microtasks.borrow_mut().pop_front();
                let Some(task) = next else { break };
                progressed = true;
                if let Err(e) = run_guarded(self, task) {
                    tracing::warn!(error = %e, "microtask failed");
                }
            }

            loop {
                match self.engine.with("execute pending job", |r| r.execute_pending_job()) {
                    Ok(JobStep::Idle) => break,
                    Ok(JobStep::Ran) => progressed = true,
                    Ok(JobStep::Failed) => {
                        progressed = true;
                        let message = self
                            .take_last_error()
                            .and_then(|err| err.map(|e| self.stringify(&e)).transpose())
                            .unwrap_or_default()
                            .unwrap_or_else(|| "unknown error".to_string());
                        tracing::warn!(error = %message, "engine job failed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to run engine job");
                        break;
                    }
                }
            }

            if !progressed {
                break;
            }
        }
        self.check_watchers();
    }

    /// Run at most one due delayed callback. Returns whether one ran.
    fn run_one_delayed(&self) -> bool {
        let due = self.timers.borrow_mut().take_due(Instant::now());
        let Some((id, mut callback)) = due else {
            return false;
        };
        self.set_state(DispatcherState::RunningDelayed);
        tracing::trace!(id, "running delayed callback");

        let result = {
            let _deadline = self.deadline.arm(self.config.execution_timeout);
            run_guarded(self, |cx| match &mut callback {
                TimerCallback::Function(func) => cx.call_checked(func, None, &[]).map(drop),
                TimerCallback::Host(f) => f(cx),
            })
        };
        if let Err(e) = result {
            tracing::warn!(id, error = %e, "delayed callback failed");
        }

        let finished = self.timers.borrow_mut().restore(id, callback);
        drop(finished);
        true
    }

    /// Whether another cycle would find something to do right now.
    pub(crate) fn has_pending(&self) -> bool {
        self.pull_inbound();
        if !self.backlog.borrow().is_empty() || !self.microtasks.borrow().is_empty() {
            return true;
        }
        if self
            .engine
            .with("job pending", |r| r.is_job_pending())
            .unwrap_or(false)
        {
            return true;
        }
        let next = self.timers.borrow_mut().next_deadline();
        matches!(next, Some(at) if at <= Instant::now())
    }

    /// Block until a command arrives, the next timer is due, or `token`
    /// fires. Worker-local host tasks make progress meanwhile.
    pub(crate) fn idle_wait(&self, token: Option<&CancellationToken>) {
        self.set_state(DispatcherState::Idle);
        let next = self.timers.borrow_mut().next_deadline();
        let local = self.local.borrow();
        let Some(local) = local.as_ref() else {
            return;
        };
        let Ok(mut inbound) = self.inbound.try_borrow_mut() else {
            return;
        };

        let received = self.rt.block_on(local.run_until(async {
            tokio::select! {
                cmd = inbound.recv() => Some(cmd),
                _ = sleep_until(next) => None,
                _ = cancelled(token) => None,
            }
        }));
        drop(inbound);

        match received {
            Some(Some(cmd)) => self.backlog.borrow_mut().push_back(cmd),
            Some(None) => {
                tracing::debug!(id = self.dispatcher_id, "all senders dropped, stopping");
                self.stopping.set(true);
            }
            None => {}
        }
    }

    /// Release everything the worker still owns and close the engine.
    fn teardown(&self) {
        self.state
            .store(DispatcherState::ShuttingDown as u8, Ordering::Release);

        let pending = {
            let mut inbound = self.inbound.borrow_mut();
            inbound.close();
            let mut backlog = std::mem::take(&mut *self.backlog.borrow_mut());
            while let Ok(cmd) = inbound.try_recv() {
                backlog.push_back(cmd);
            }
            backlog
        };
        if !pending.is_empty() {
            tracing::debug!(dropped = pending.len(), "dropping commands queued after shutdown");
        }
        drop(pending);

        let watchers = std::mem::take(&mut *self.watchers.borrow_mut());
        drop(watchers);
        let timers = self.timers.borrow_mut().drain();
        drop(timers);
        let microtasks = std::mem::take(&mut *self.microtasks.borrow_mut());
        drop(microtasks);
        let local = self.local.borrow_mut().take();
        drop(local);
        self.ops.borrow_mut().clear();
        let awaited = std::mem::take(&mut self.rejections.borrow_mut().awaited);
        drop(awaited);

        let leaked = self.engine.live_handles();
        if leaked > 0 && self.config.warn_on_leaked_handles {
            tracing::warn!(leaked, "handles not released before shutdown");
        }

        match self.engine.close() {
            Ok(Some(registry)) => {
                if let Err(e) = registry.close() {
                    tracing::error!(error = %e, "failed to free engine runtime");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "failed to close engine"),
        }

        self.state
            .store(DispatcherState::Stopped as u8, Ordering::Release);
        tracing::debug!(id = self.dispatcher_id, cycles = self.cycle_count(), "dispatcher worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expires_and_restores() {
        let deadline = Arc::new(ExecutionDeadline::default());
        assert!(!deadline.expired());
        {
            let _guard = deadline.arm(Some(Duration::ZERO));
            assert!(deadline.expired());
        }
        assert!(!deadline.expired());
    }

    #[test]
    fn test_nested_deadline_keeps_outer() {
        let deadline = Arc::new(ExecutionDeadline::default());
        let _outer = deadline.arm(Some(Duration::ZERO));
        {
            let _inner = deadline.arm(Some(Duration::from_secs(60)));
            assert!(deadline.expired());
        }
        assert!(deadline.expired());
    }

    #[test]
    fn test_unarmed_deadline_never_fires() {
        let deadline = Arc::new(ExecutionDeadline::default());
        let _guard = deadline.arm(None);
        assert!(!deadline.expired());
    }
}
