//! Registry of host functions callable from the engine.
//!
//! Functions created through [`WorkerContext::new_function`] and
//! [`WorkerContext::new_async_function`] are stored here and looked up by id
//! when the engine calls back through the host trampoline.
//!
//! [`WorkerContext::new_function`]: crate::runtime::context::WorkerContext::new_function
//! [`WorkerContext::new_async_function`]: crate::runtime::context::WorkerContext::new_async_function

use crate::runtime::context::WorkerContext;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handle::Handle;
use crate::runtime::js_value::JSValue;
use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::rc::Rc;

/// Op execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    /// Returns its result directly
    Sync,
    /// Returns a promise settled by a host task
    Async,
}

/// Future produced by an async host function. `Ok` resolves the promise,
/// `Err` rejects it.
pub type HostFuture = LocalBoxFuture<'static, std::result::Result<JSValue, JSValue>>;

/// Synchronous handler. Receives `this` and the call arguments as borrowed
/// handles valid only for the duration of the call.
pub type SyncHandler = Rc<dyn Fn(&WorkerContext, &Handle, &[Handle]) -> Result<Handle>>;

/// Asynchronous handler. Must extract what it needs from the arguments before
/// returning the future.
pub type AsyncHandler = Rc<dyn Fn(&WorkerContext, &Handle, &[Handle]) -> Result<HostFuture>>;

#[derive(Clone)]
pub enum HostFunction {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl HostFunction {
    pub fn mode(&self) -> OpMode {
        match self {
            HostFunction::Sync(_) => OpMode::Sync,
            HostFunction::Async(_) => OpMode::Async,
        }
    }
}

/// Metadata for a registered op.
#[derive(Clone)]
pub struct OpMetadata {
    /// Op ID, passed to the engine as the function id
    pub id: u32,
    pub name: String,
    pub mode: OpMode,
    pub handler: HostFunction,
}

/// Registry of host functions for one engine.
#[derive(Default)]
pub struct OpRegistry {
    ops_by_name: HashMap<String, u32>,
    ops_by_id: HashMap<u32, OpMetadata>,
    next_id: u32,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new op.
    ///
    /// Returns the op ID or an error if an op with the same name already exists.
    pub fn register_op(&mut self, name: &str, handler: HostFunction) -> Result<u32> {
        if self.ops_by_name.contains_key(name) {
            return Err(RuntimeError::Host(format!(
                "op '{}' is already registered",
                name
            )));
        }

        let id = self.next_id;
        self.next_id += 1;

        let metadata = OpMetadata {
            id,
            name: name.to_string(),
            mode: handler.mode(),
            handler,
        };
        self.ops_by_name.insert(name.to_string(), id);
        self.ops_by_id.insert(id, metadata);
        Ok(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&OpMetadata> {
        self.ops_by_name
            .get(name)
            .and_then(|id| self.ops_by_id.get(id))
    }

    pub fn get_by_id(&self, id: u32) -> Option<&OpMetadata> {
        self.ops_by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.ops_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops_by_id.is_empty()
    }

    /// Drop every handler. Called at teardown so closures capturing handles
    /// are released on the worker thread.
    pub fn clear(&mut self) {
        self.ops_by_name.clear();
        self.ops_by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> HostFunction {
        HostFunction::Sync(Rc::new(|_cx, this, _args| this.as_borrowed()))
    }

    #[test]
    fn test_op_registry_basic() {
        let mut registry = OpRegistry::new();
        assert!(registry.is_empty());

        let op_id = registry.register_op("echo", echo()).unwrap();
        assert_eq!(op_id, 0);
        assert_eq!(registry.len(), 1);

        let metadata = registry.get_by_name("echo").unwrap();
        assert_eq!(metadata.name, "echo");
        assert_eq!(metadata.mode, OpMode::Sync);
        assert_eq!(metadata.id, op_id);

        let async_id = registry
            .register_op(
                "later",
                HostFunction::Async(Rc::new(|_cx, _this, _args| {
                    Ok(Box::pin(async { Ok(JSValue::Int(1)) }) as HostFuture)
                })),
            )
            .unwrap();
        assert_eq!(registry.get_by_id(async_id).unwrap().mode, OpMode::Async);
    }

    #[test]
    fn test_op_registry_duplicate_name() {
        let mut registry = OpRegistry::new();
        registry.register_op("echo", echo()).unwrap();
        let err = registry.register_op("echo", echo()).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clear_forgets_handlers() {
        let mut registry = OpRegistry::new();
        let id = registry.register_op("echo", echo()).unwrap();
        registry.clear();
        assert!(registry.get_by_id(id).is_none());
        assert!(registry.is_empty());
    }
}
