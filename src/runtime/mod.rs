//! Dispatcher-based runtime for a single-threaded embedded engine.
//!
//! Each [`Dispatcher`](dispatcher::Dispatcher) owns one engine instance on a
//! dedicated OS thread with a current-thread Tokio runtime. Work from any
//! thread is queued to it and executed in drain cycles: queued work items,
//! then immediate continuations and engine jobs, then at most one due delayed
//! callback, then rejection reporting.

pub mod bridge;
pub mod config;
pub mod context;
mod conversion;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod js_value;
pub mod ops;
pub mod outcome;
pub mod promise;
pub mod registry;
mod runner;
pub mod sandbox;
pub mod scope;
pub mod timers;

use once_cell::sync::OnceCell;
use promise::{RejectionHook, UnhandledRejection};
use std::sync::Arc;

/// Process-wide fallback for dispatchers without their own rejection hook.
static GLOBAL_REJECTION_HOOK: OnceCell<RejectionHook> = OnceCell::new();

/// Install the process-wide unhandled-rejection hook.
///
/// Can only be set once; later calls return `InvalidState`.
pub fn set_global_unhandled_rejection_hook<F>(hook: F) -> error::Result<()>
where
    F: Fn(&UnhandledRejection) + Send + Sync + 'static,
{
    GLOBAL_REJECTION_HOOK
        .set(Arc::new(hook))
        .map_err(|_| error::RuntimeError::InvalidState("global rejection hook already set".to_string()))
}

pub(crate) fn global_unhandled_rejection_hook() -> Option<&'static RejectionHook> {
    GLOBAL_REJECTION_HOOK.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::RuntimeConfig;
    use crate::runtime::dispatcher::Dispatcher;
    use crate::runtime::error::RuntimeError;
    use crate::runtime::js_value::JSValue;
    use crate::runtime::promise::CancellationToken;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn sandbox() -> Dispatcher {
        Dispatcher::spawn_sandbox(RuntimeConfig::default()).unwrap()
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_work_then_immediate_then_delayed() {
        let dispatcher = sandbox();
        let log = Arc::new(Mutex::new(Vec::new()));

        let work_log = log.clone();
        dispatcher
            .invoke(move |cx| {
                work_log.lock().push("work");
                let delayed_log = work_log.clone();
                cx.set_host_timeout(Duration::ZERO, move |_| {
                    delayed_log.lock().push("delayed");
                    Ok(())
                });
                let immediate_log = work_log.clone();
                cx.queue_microtask(move |_| {
                    immediate_log.lock().push("immediate");
                    Ok(())
                });
                // Make sure the delayed callback is already due when this
                // item finishes.
                thread::sleep(Duration::from_millis(2));
                Ok(())
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || log.lock().len() == 3));
        assert_eq!(*log.lock(), vec!["work", "immediate", "delayed"]);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_handle_operations_require_the_worker() {
        let dispatcher = sandbox();
        let handle = dispatcher.invoke(|cx| cx.string("pinned")).unwrap();

        match handle.duplicate() {
            Err(RuntimeError::CrossThreadViolation { .. }) => {}
            other => panic!("expected cross-thread violation, got {:?}", other.map(|_| ())),
        }

        let text = dispatcher
            .invoke(move |cx| {
                let mut copy = handle.duplicate()?;
                let text = cx.stringify(&copy)?;
                copy.release()?;
                let mut handle = handle;
                handle.release()?;
                Ok(text)
            })
            .unwrap();
        assert_eq!(text, "pinned");
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_concurrent_callers_leave_no_live_values() {
        let dispatcher = sandbox();
        let baseline = dispatcher
            .invoke(|cx| Ok((cx.live_value_count()?, cx.live_handles())))
            .unwrap();

        let callers: Vec<_> = (0..50)
            .map(|caller| {
                let dispatcher = dispatcher.clone();
                thread::spawn(move || {
                    let pending: Vec<_> = (0..20)
                        .map(|i| {
                            dispatcher.invoke_async(move |cx| {
                                let mut value = cx.number(f64::from(caller * 100 + i))?;
                                let mut copy = value.duplicate()?;
                                copy.release()?;
                                value.release()?;
                                Ok(())
                            })
                        })
                        .collect();
                    for work in pending {
                        work.wait().unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        let after = dispatcher
            .invoke(|cx| Ok((cx.live_value_count()?, cx.live_handles())))
            .unwrap();
        assert_eq!(after, baseline);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_one_shot_and_repeating_timers_fire_in_due_order() {
        let dispatcher = sandbox();
        let fired = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(Mutex::new(Vec::<String>::new()));

        {
            let fired = fired.clone();
            let events = events.clone();
            dispatcher
                .invoke(move |cx| {
                    for n in 0..3u64 {
                        let fired = fired.clone();
                        let events = events.clone();
                        cx.set_host_timeout(Duration::from_millis(5 * (n + 1)), move |cx| {
                            fired.fetch_add(1, Ordering::SeqCst);
                            events.lock().push(format!("timer-{n}"));
                            let events = events.clone();
                            cx.queue_microtask(move |_| {
                                events.lock().push(format!("micro-{n}"));
                                Ok(())
                            });
                            Ok(())
                        });
                    }
                    for n in 3..5u64 {
                        let fired = fired.clone();
                        let events = events.clone();
                        let own_id = Arc::new(AtomicU32::new(0));
                        let id_slot = own_id.clone();
                        let mut runs = 0;
                        let id = cx.set_host_interval(Duration::from_millis(4), move |cx| {
                            runs += 1;
                            fired.fetch_add(1, Ordering::SeqCst);
                            events.lock().push(format!("timer-{n}"));
                            let micro_events = events.clone();
                            cx.queue_microtask(move |_| {
                                micro_events.lock().push(format!("micro-{n}"));
                                Ok(())
                            });
                            if runs == 4 {
                                cx.clear_timer(own_id.load(Ordering::SeqCst));
                            }
                            Ok(())
                        });
                        id_slot.store(id, Ordering::SeqCst);
                    }
                    Ok(())
                })
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(3), || {
            fired.load(Ordering::SeqCst) == 11
                && dispatcher.invoke(|cx| Ok(cx.pending_timers())).unwrap() == 0
        }));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 3 + 2 * 4);

        let events = events.lock();
        for pair in events.chunks(2) {
            let timer = pair[0].strip_prefix("timer-").unwrap();
            assert_eq!(pair[1], format!("micro-{timer}"), "events: {:?}", *events);
        }
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_cross_thread_await_of_delayed_resolution() {
        let dispatcher = sandbox();
        let promises = dispatcher.promises();
        let deferred = promises.create_deferred().unwrap();
        let promise = {
            let deferred = deferred.clone();
            dispatcher.invoke(move |_| deferred.promise()).unwrap()
        };

        let start = Instant::now();
        let completer = {
            let dispatcher = dispatcher.clone();
            let promises = promises.clone();
            let deferred = deferred.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                // The worker stays responsive while the completion is pending.
                let probe = Instant::now();
                dispatcher.invoke(|_| Ok(())).unwrap();
                assert!(probe.elapsed() < Duration::from_millis(40));
                thread::sleep(Duration::from_millis(40));
                promises.resolve(&deferred, JSValue::Int(42)).unwrap();
            })
        };

        let outcome = promises
            .await_settlement(&promise, &CancellationToken::new())
            .unwrap();
        let elapsed = start.elapsed();
        completer.join().unwrap();
        assert!(outcome.is_success());
        assert!(elapsed >= Duration::from_millis(45), "settled after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "settled after {elapsed:?}");

        let value = dispatcher
            .invoke(move |cx| {
                let mut outcome = outcome;
                let mut value = outcome.unwrap()?;
                let js = cx.to_js_value(&value)?;
                value.release()?;
                let mut promise = promise;
                promise.release()?;
                drop(deferred);
                Ok(js)
            })
            .unwrap();
        assert_eq!(value, JSValue::Int(42));
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_cancelled_await_returns_promptly() {
        let dispatcher = sandbox();
        let promises = dispatcher.promises();
        let deferred = promises.create_deferred().unwrap();
        let promise = {
            let deferred = deferred.clone();
            dispatcher.invoke(move |_| deferred.promise()).unwrap()
        };

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };
        let result = promises.await_settlement(&promise, &token);
        canceller.join().unwrap();
        assert!(matches!(result, Err(RuntimeError::Cancelled)));

        // The promise itself is untouched and can still settle.
        promises.resolve(&deferred, JSValue::Bool(true)).unwrap();
        let state = dispatcher
            .invoke(move |cx| {
                let state = cx.promise_state(&promise)?;
                let mut promise = promise;
                promise.release()?;
                Ok(state)
            })
            .unwrap();
        assert_eq!(state, bridge::PromiseState::Fulfilled);
        dispatcher
            .invoke(move |_| {
                drop(deferred);
                Ok(())
            })
            .unwrap();
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_unhandled_rejection_reported_once() {
        let dispatcher = sandbox();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            dispatcher.set_unhandled_rejection_hook(move |rejection| {
                seen.lock().push(rejection.clone());
            });
        }

        dispatcher
            .invoke(|cx| {
                let deferred = cx.create_deferred()?;
                deferred.reject_value(cx, &JSValue::String("boom".to_string()))
            })
            .unwrap();
        // A later item only runs after the previous cycle reported.
        dispatcher.invoke(|_| Ok(())).unwrap();
        dispatcher.invoke(|_| Ok(())).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].is_handled);
        assert_eq!(seen[0].reason, JSValue::String("boom".to_string()));
        drop(seen);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_handler_attached_in_same_cycle_suppresses_report() {
        let dispatcher = sandbox();
        let reports = Arc::new(AtomicUsize::new(0));
        {
            let reports = reports.clone();
            dispatcher.set_unhandled_rejection_hook(move |_| {
                reports.fetch_add(1, Ordering::SeqCst);
            });
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let handler_calls = handled.clone();
        dispatcher
            .invoke(move |cx| {
                let deferred = cx.create_deferred()?;
                deferred.reject_value(cx, &JSValue::String("caught".to_string()))?;
                let promise = deferred.promise()?;
                let calls = handler_calls.clone();
                let on_rejected = cx.new_function("onRejected", move |cx, _this, _args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cx.undefined()
                })?;
                cx.promise_then(&promise, None, Some(&on_rejected))?;
                Ok(())
            })
            .unwrap();
        dispatcher.invoke(|_| Ok(())).unwrap();
        dispatcher.invoke(|_| Ok(())).unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(reports.load(Ordering::SeqCst), 0);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_execution_timeout_interrupts_engine_calls() {
        let config = RuntimeConfig::default().with_execution_timeout(Duration::from_millis(50));
        let dispatcher = Dispatcher::spawn_sandbox(config).unwrap();

        let message = dispatcher
            .invoke(|cx| {
                let noop = cx.new_function("noop", |cx, _this, _args| cx.undefined())?;
                thread::sleep(Duration::from_millis(80));
                let mut outcome = cx.call(&noop, None, &[])?;
                let message = match outcome.try_get_failure() {
                    Some(exception) => cx.stringify(exception)?,
                    None => String::new(),
                };
                outcome.dispose()?;
                Ok(message)
            })
            .unwrap();
        assert_eq!(message, "Error: interrupted");

        // The next work item gets a fresh deadline.
        let ok = dispatcher
            .invoke(|cx| {
                let noop = cx.new_function("noop2", |cx, _this, _args| cx.undefined())?;
                Ok(cx.call(&noop, None, &[])?.is_success())
            })
            .unwrap();
        assert!(ok);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_async_host_function_settles_its_promise() {
        let dispatcher = sandbox();
        let promise = dispatcher
            .invoke(|cx| {
                let later = cx.new_async_function("later", |cx, _this, args| {
                    let base = cx.to_number(&args[0])?;
                    Ok(async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(JSValue::Int(base as i64 + 1))
                    }
                    .boxed_local())
                })?;
                let arg = cx.number(6.0)?;
                cx.call_checked(&later, None, &[&arg])
            })
            .unwrap();

        let outcome = dispatcher
            .promises()
            .await_settlement(&promise, &CancellationToken::new())
            .unwrap();
        let value = dispatcher
            .invoke(move |cx| {
                let mut outcome = outcome;
                let value = outcome.unwrap()?;
                let js = cx.to_js_value(&value)?;
                drop(value);
                drop(promise);
                Ok(js)
            })
            .unwrap();
        assert_eq!(value, JSValue::Int(7));
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_host_function_error_becomes_engine_exception() {
        let dispatcher = sandbox();
        let message = dispatcher
            .invoke(|cx| {
                let fail = cx.new_function("fail", |_cx, _this, _args| {
                    Err(RuntimeError::host("disk on fire"))
                })?;
                match cx.call_checked(&fail, None, &[]) {
                    Ok(_) => Ok(String::new()),
                    Err(e) => Ok(e.to_string()),
                }
            })
            .unwrap();
        assert!(message.contains("disk on fire"), "{message}");
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_deferred_dropped_on_caller_thread_is_released() {
        let dispatcher = sandbox();
        let promises = dispatcher.promises();
        let counts = || {
            dispatcher
                .invoke(|cx| Ok((cx.live_value_count()?, cx.live_handles())))
                .unwrap()
        };
        let baseline = counts();

        let deferred = promises.create_deferred().unwrap();
        promises.resolve(&deferred, JSValue::Int(1)).unwrap();
        assert!(deferred.is_settled());
        drop(deferred);
        // Queued after the release, so it observes the freed values.
        assert_eq!(counts(), baseline);

        let pending = promises.create_deferred().unwrap();
        let clone = pending.clone();
        thread::spawn(move || drop(clone)).join().unwrap();
        assert!(!pending.is_settled());
        drop(pending);
        assert_eq!(counts(), baseline);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_interrupted_settlement_can_be_retried() {
        let config = RuntimeConfig::default().with_execution_timeout(Duration::from_millis(20));
        let dispatcher = Dispatcher::spawn_sandbox(config).unwrap();
        let promises = dispatcher.promises();
        let deferred = promises.create_deferred().unwrap();

        let first = {
            let deferred = deferred.clone();
            dispatcher.invoke(move |cx| {
                thread::sleep(Duration::from_millis(40));
                deferred.resolve_value(cx, &JSValue::Int(1))
            })
        };
        match first {
            Err(RuntimeError::ForeignOperation { message, .. }) => {
                assert!(message.contains("interrupted"), "unexpected message {message}");
            }
            other => panic!("expected interrupted settlement, got {other:?}"),
        }
        assert!(!deferred.is_settled());

        promises.resolve(&deferred, JSValue::Int(2)).unwrap();
        assert!(deferred.is_settled());
        let promise = {
            let deferred = deferred.clone();
            dispatcher.invoke(move |_| deferred.promise()).unwrap()
        };
        let value = promises
            .await_value(&promise, &CancellationToken::new())
            .unwrap();
        assert_eq!(value, JSValue::Int(2));

        // Later attempts are ignored once settled.
        promises.resolve(&deferred, JSValue::Int(3)).unwrap();
        dispatcher
            .invoke(move |_| {
                drop(promise);
                Ok(())
            })
            .unwrap();
        drop(deferred);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_await_value_surfaces_rejection_reason() {
        let dispatcher = sandbox();
        let promises = dispatcher.promises();
        let deferred = promises.create_deferred().unwrap();
        let promise = {
            let deferred = deferred.clone();
            dispatcher.invoke(move |_| deferred.promise()).unwrap()
        };

        let rejecter = {
            let promises = promises.clone();
            let deferred = deferred.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                promises
                    .reject(&deferred, JSValue::String("nope".to_string()))
                    .unwrap();
            })
        };
        let result = promises.await_value(&promise, &CancellationToken::new());
        rejecter.join().unwrap();
        match result {
            Err(RuntimeError::PromiseRejected { reason }) => {
                assert_eq!(reason, JSValue::String("nope".to_string()));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }

        let on_worker = dispatcher
            .invoke(|cx| {
                let deferred = cx.create_deferred()?;
                deferred.resolve_value(cx, &JSValue::Int(5))?;
                let promise = deferred.promise()?;
                let outcome = cx
                    .settlement(&promise)?
                    .ok_or_else(|| RuntimeError::InvalidState("still pending".to_string()))?;
                cx.settled_value(outcome)
            })
            .unwrap();
        assert_eq!(on_worker, JSValue::Int(5));

        dispatcher
            .invoke(move |_| {
                drop(promise);
                Ok(())
            })
            .unwrap();
        drop(deferred);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_global_hook_can_only_be_set_once() {
        let _ = set_global_unhandled_rejection_hook(|_| {});
        let again = set_global_unhandled_rejection_hook(|_| {});
        assert!(matches!(again, Err(RuntimeError::InvalidState(_))));
        assert!(global_unhandled_rejection_hook().is_some());
    }
}
