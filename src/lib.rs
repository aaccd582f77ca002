//! Host-side runtime layer for driving a single-threaded embedded JavaScript
//! engine from many threads.
//!
//! All engine access is serialized onto one dedicated worker thread owned by a
//! [`Dispatcher`]. Values produced by the engine are exposed as reference-counted
//! [`Handle`]s that must be released exactly once, either directly, through a
//! [`ResourceScope`], or through an [`Outcome`].

pub mod runtime;

pub use runtime::bridge::{EngineFactory, MemoryBridge, PromiseState, ValueKind, WasmValue};
pub use runtime::config::RuntimeConfig;
pub use runtime::context::WorkerContext;
pub use runtime::dispatcher::{Dispatcher, DispatcherState, WorkFuture};
pub use runtime::error::{Result, RuntimeError};
pub use runtime::handle::{Handle, Ownership, Releasable};
pub use runtime::js_value::JSValue;
pub use runtime::ops::HostFuture;
pub use runtime::outcome::Outcome;
pub use runtime::promise::{
    CancellationToken, Deferred, PromiseBridge, RejectionHook, UnhandledRejection,
};
pub use runtime::sandbox::SandboxEngine;
pub use runtime::scope::ResourceScope;
pub use runtime::timers::{TimerCallback, TimerId};
pub use runtime::set_global_unhandled_rejection_hook;
