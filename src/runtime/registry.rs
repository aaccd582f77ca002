//! Typed engine calls over the [`MemoryBridge`] and the thread-affine cell
//! that owns them.
//!
//! [`HandleRegistry`] translates host values (strings, byte buffers, pointer
//! tables) into the engine's foreign-memory representation and back.
//! [`EngineCell`] wraps a registry so it can be shared with every [`Handle`]
//! while enforcing that calls only happen on the thread that created it.
//!
//! [`Handle`]: crate::runtime::handle::Handle

use crate::runtime::bridge::{
    export, EqualOp, MemoryBridge, PromiseState, ValueKind, WasmValue,
};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::{Result, RuntimeError};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Result of running one pending engine job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    Idle,
    Ran,
    Failed,
}

/// A rejection-tracker notification pulled out of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectionEvent {
    pub promise: u32,
    pub reason: u32,
    pub is_handled: bool,
}

pub struct HandleRegistry {
    bridge: Box<dyn MemoryBridge>,
    rt: u32,
    ctx: u32,
}

impl HandleRegistry {
    /// Create the engine runtime and context.
    pub fn open(bridge: Box<dyn MemoryBridge>, config: &RuntimeConfig) -> Result<Self> {
        let rt = bridge
            .call_export(export::NEW_RUNTIME, &[])?
            .as_u32()
            .filter(|ptr| *ptr != 0)
            .ok_or_else(|| RuntimeError::foreign(export::NEW_RUNTIME, "engine returned null"))?;

        if let Some(limit) = config.memory_limit {
            bridge.call_export(
                export::SET_MEMORY_LIMIT,
                &[WasmValue::ptr(rt), WasmValue::I64(limit as i64)],
            )?;
        }

        let ctx = bridge
            .call_export(export::NEW_CONTEXT, &[WasmValue::ptr(rt)])?
            .as_u32()
            .filter(|ptr| *ptr != 0)
            .ok_or_else(|| RuntimeError::foreign(export::NEW_CONTEXT, "engine returned null"))?;

        Ok(Self { bridge, rt, ctx })
    }

    /// Free the context and runtime.
    pub fn close(self) -> Result<()> {
        self.bridge
            .call_export(export::FREE_CONTEXT, &[self.ctx_arg()])?;
        self.bridge
            .call_export(export::FREE_RUNTIME, &[WasmValue::ptr(self.rt)])?;
        Ok(())
    }

    pub fn bridge(&self) -> &dyn MemoryBridge {
        self.bridge.as_ref()
    }

    fn ctx_arg(&self) -> WasmValue {
        WasmValue::ptr(self.ctx)
    }

    fn call_u32(&self, name: &'static str, args: &[WasmValue]) -> Result<u32> {
        self.bridge
            .call_export(name, args)?
            .as_u32()
            .ok_or_else(|| RuntimeError::foreign(name, "export returned a non-pointer value"))
    }

    fn call_i32(&self, name: &'static str, args: &[WasmValue]) -> Result<i32> {
        self.bridge
            .call_export(name, args)?
            .as_i32()
            .ok_or_else(|| RuntimeError::foreign(name, "export returned a non-integer value"))
    }

    /// Call an export returning an owned value pointer, mapping null to the
    /// engine's last error.
    fn call_value(&self, name: &'static str, args: &[WasmValue]) -> Result<u32> {
        match self.call_u32(name, args)? {
            0 => Err(self.failure(name)),
            ptr => Ok(ptr),
        }
    }

    /// Build a `ForeignOperation` error from the engine's pending exception.
    pub fn failure(&self, operation: &'static str) -> RuntimeError {
        match self.take_last_error() {
            Ok(Some(err)) => {
                let message = self
                    .to_string(err)
                    .unwrap_or_else(|e| format!("<unreadable engine error: {}>", e));
                self.free_value(err);
                RuntimeError::foreign(operation, message)
            }
            Ok(None) => RuntimeError::foreign(operation, "no engine diagnostic available"),
            Err(e) => e,
        }
    }

    pub fn allocate(&self, size: usize) -> Result<u32> {
        let size_u32 =
            u32::try_from(size).map_err(|_| RuntimeError::AllocationFailed { size })?;
        match self.bridge.allocate(size_u32) {
            0 => Err(RuntimeError::AllocationFailed { size }),
            ptr => Ok(ptr),
        }
    }

    /// Copy a string into foreign memory as a NUL-terminated buffer.
    fn write_cstring(&self, s: &str) -> Result<u32> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        let ptr = self.allocate(bytes.len())?;
        if let Err(e) = self.bridge.write_bytes(ptr, &bytes) {
            self.bridge.free(ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Run `f` with a scratch buffer of `size` bytes, freeing it afterwards.
    fn with_scratch<R>(&self, size: usize, f: impl FnOnce(u32) -> Result<R>) -> Result<R> {
        let ptr = self.allocate(size)?;
        let result = f(ptr);
        self.bridge.free(ptr);
        result
    }

    pub fn read_ptr_table(&self, table: u32, len: u32) -> Result<Vec<u32>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.bridge.read_bytes(table, len * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn write_ptr_table(&self, ptrs: &[u32]) -> Result<u32> {
        let mut bytes = Vec::with_capacity(ptrs.len() * 4);
        for ptr in ptrs {
            bytes.extend_from_slice(&ptr.to_le_bytes());
        }
        let table = self.allocate(bytes.len().max(4))?;
        if let Err(e) = self.bridge.write_bytes(table, &bytes) {
            self.bridge.free(table);
            return Err(e);
        }
        Ok(table)
    }

    // Reference counting

    pub fn dup_value(&self, ptr: u32) -> Result<u32> {
        self.call_value(export::DUP_VALUE, &[self.ctx_arg(), WasmValue::ptr(ptr)])
    }

    /// Decrement the value's reference count. Failures are logged, since the
    /// pointer is unusable afterwards either way.
    pub fn free_value(&self, ptr: u32) {
        if let Err(e) = self
            .bridge
            .call_export(export::FREE_VALUE, &[self.ctx_arg(), WasmValue::ptr(ptr)])
        {
            tracing::warn!(ptr, error = %e, "free_value_pointer failed");
        }
    }

    pub fn live_value_count(&self) -> Result<usize> {
        let count = self.call_i32(export::LIVE_VALUE_COUNT, &[WasmValue::ptr(self.rt)])?;
        Ok(count.max(0) as usize)
    }

    // Constants (borrowed, never freed)

    pub fn undefined(&self) -> Result<u32> {
        self.call_value(export::GET_UNDEFINED, &[])
    }

    pub fn null(&self) -> Result<u32> {
        self.call_value(export::GET_NULL, &[])
    }

    pub fn boolean(&self, value: bool) -> Result<u32> {
        let name = if value {
            export::GET_TRUE
        } else {
            export::GET_FALSE
        };
        self.call_value(name, &[])
    }

    // Primitives

    pub fn new_number(&self, value: f64) -> Result<u32> {
        self.call_value(export::NEW_FLOAT64, &[self.ctx_arg(), WasmValue::F64(value)])
    }

    pub fn number(&self, ptr: u32) -> Result<f64> {
        self.bridge
            .call_export(export::GET_FLOAT64, &[self.ctx_arg(), WasmValue::ptr(ptr)])?
            .as_f64()
            .ok_or_else(|| RuntimeError::foreign(export::GET_FLOAT64, "expected f64 result"))
    }

    pub fn new_string(&self, value: &str) -> Result<u32> {
        let buf = self.write_cstring(value)?;
        let result = self.call_value(export::NEW_STRING, &[self.ctx_arg(), WasmValue::ptr(buf)]);
        self.bridge.free(buf);
        result
    }

    /// Stringify any value through the engine.
    pub fn to_string(&self, ptr: u32) -> Result<String> {
        let cstr = self.call_value(export::TO_CSTRING, &[self.ctx_arg(), WasmValue::ptr(ptr)])?;
        let result = self.bridge.read_cstring(cstr);
        self.bridge
            .call_export(export::FREE_CSTRING, &[self.ctx_arg(), WasmValue::ptr(cstr)])?;
        result
    }

    pub fn new_bytes(&self, bytes: &[u8]) -> Result<u32> {
        let buf = self.allocate(bytes.len().max(1))?;
        let result = self.bridge.write_bytes(buf, bytes).and_then(|_| {
            self.call_value(
                export::NEW_ARRAY_BUFFER,
                &[
                    self.ctx_arg(),
                    WasmValue::ptr(buf),
                    WasmValue::ptr(bytes.len() as u32),
                ],
            )
        });
        self.bridge.free(buf);
        result
    }

    pub fn bytes(&self, ptr: u32) -> Result<Vec<u8>> {
        self.with_scratch(4, |out_len| {
            let data = self.call_value(
                export::COPY_ARRAY_BUFFER,
                &[self.ctx_arg(), WasmValue::ptr(ptr), WasmValue::ptr(out_len)],
            )?;
            let len = self.bridge.read_u32(out_len);
            let bytes = len.and_then(|len| self.bridge.read_bytes(data, len));
            self.bridge.free(data);
            bytes
        })
    }

    // Objects

    pub fn new_object(&self) -> Result<u32> {
        self.call_value(export::NEW_OBJECT, &[self.ctx_arg()])
    }

    pub fn new_array(&self) -> Result<u32> {
        self.call_value(export::NEW_ARRAY, &[self.ctx_arg()])
    }

    pub fn get_prop(&self, obj: u32, key: &str) -> Result<u32> {
        let key_ptr = self.new_string(key)?;
        let result = self.call_value(
            export::GET_PROP,
            &[self.ctx_arg(), WasmValue::ptr(obj), WasmValue::ptr(key_ptr)],
        );
        self.free_value(key_ptr);
        result
    }

    pub fn set_prop(&self, obj: u32, key: &str, value: u32) -> Result<()> {
        let key_ptr = self.new_string(key)?;
        let status = self.call_i32(
            export::SET_PROP,
            &[
                self.ctx_arg(),
                WasmValue::ptr(obj),
                WasmValue::ptr(key_ptr),
                WasmValue::ptr(value),
            ],
        );
        self.free_value(key_ptr);
        match status? {
            1 => Ok(()),
            _ => Err(self.failure(export::SET_PROP)),
        }
    }

    /// Own enumerable property names, as owned string value pointers.
    pub fn own_property_names(&self, obj: u32) -> Result<Vec<u32>> {
        self.with_scratch(8, |out| {
            let out_ptrs = out;
            let out_len = out + 4;
            let status = self.call_i32(
                export::GET_OWN_PROPERTY_NAMES,
                &[
                    self.ctx_arg(),
                    WasmValue::ptr(out_ptrs),
                    WasmValue::ptr(out_len),
                    WasmValue::ptr(obj),
                    WasmValue::I32(0),
                ],
            )?;
            if status != 0 {
                return Err(self.failure(export::GET_OWN_PROPERTY_NAMES));
            }
            let table = self.bridge.read_u32(out_ptrs)?;
            let len = self.bridge.read_u32(out_len)?;
            let names = self.read_ptr_table(table, len);
            if table != 0 {
                self.bridge.free(table);
            }
            names
        })
    }

    pub fn length(&self, ptr: u32) -> Result<u32> {
        self.with_scratch(4, |out_len| {
            let status = self.call_i32(
                export::GET_LENGTH,
                &[self.ctx_arg(), WasmValue::ptr(out_len), WasmValue::ptr(ptr)],
            )?;
            if status != 0 {
                return Err(self.failure(export::GET_LENGTH));
            }
            self.bridge.read_u32(out_len)
        })
    }

    pub fn kind(&self, ptr: u32) -> Result<ValueKind> {
        let tag = self.call_i32(export::TYPE_OF, &[self.ctx_arg(), WasmValue::ptr(ptr)])?;
        ValueKind::from_tag(tag)
            .ok_or_else(|| RuntimeError::foreign(export::TYPE_OF, format!("unknown type tag {}", tag)))
    }

    pub fn is_equal(&self, a: u32, b: u32, op: EqualOp) -> Result<bool> {
        let result = self.call_i32(
            export::IS_EQUAL,
            &[
                self.ctx_arg(),
                WasmValue::ptr(a),
                WasmValue::ptr(b),
                WasmValue::I32(op as i32),
            ],
        )?;
        Ok(result != 0)
    }

    // Errors

    pub fn new_error(&self, message: &str) -> Result<u32> {
        let buf = self.write_cstring(message)?;
        let result = self.call_value(export::NEW_ERROR, &[self.ctx_arg(), WasmValue::ptr(buf)]);
        self.bridge.free(buf);
        result
    }

    /// Make `error` the engine's pending exception. The caller keeps its
    /// reference to `error`.
    pub fn throw(&self, error: u32) -> Result<()> {
        self.bridge
            .call_export(export::THROW, &[self.ctx_arg(), WasmValue::ptr(error)])?;
        Ok(())
    }

    /// Take the engine's pending exception, if any, as an owned pointer.
    pub fn take_last_error(&self) -> Result<Option<u32>> {
        match self.call_u32(export::GET_LAST_ERROR, &[self.ctx_arg()])? {
            0 => Ok(None),
            ptr => Ok(Some(ptr)),
        }
    }

    // Functions

    pub fn new_function(&self, func_id: u32, name: &str) -> Result<u32> {
        let buf = self.write_cstring(name)?;
        let result = self.call_value(
            export::NEW_FUNCTION,
            &[self.ctx_arg(), WasmValue::ptr(func_id), WasmValue::ptr(buf)],
        );
        self.bridge.free(buf);
        result
    }

    /// Call `func` with an argv pointer table.
    ///
    /// The outer `Result` reports host-side failures; the inner one separates
    /// a returned value from a thrown exception, both owned.
    pub fn call(&self, func: u32, this: u32, args: &[u32]) -> Result<std::result::Result<u32, u32>> {
        let argv = if args.is_empty() {
            0
        } else {
            self.write_ptr_table(args)?
        };
        let result = self.call_u32(
            export::CALL,
            &[
                self.ctx_arg(),
                WasmValue::ptr(func),
                WasmValue::ptr(this),
                WasmValue::ptr(args.len() as u32),
                WasmValue::ptr(argv),
            ],
        );
        if argv != 0 {
            self.bridge.free(argv);
        }
        match result? {
            0 => match self.take_last_error()? {
                Some(exception) => Ok(Err(exception)),
                None => Err(RuntimeError::foreign(export::CALL, "call failed without an exception")),
            },
            value => Ok(Ok(value)),
        }
    }

    // Promises

    /// Returns `(promise, resolve, reject)`, all owned.
    pub fn new_promise_capability(&self) -> Result<(u32, u32, u32)> {
        self.with_scratch(8, |out| {
            let promise =
                self.call_value(export::NEW_PROMISE_CAPABILITY, &[self.ctx_arg(), WasmValue::ptr(out)])?;
            let resolve = self.bridge.read_u32(out)?;
            let reject = self.bridge.read_u32(out + 4)?;
            Ok((promise, resolve, reject))
        })
    }

    pub fn promise_state(&self, promise: u32) -> Result<PromiseState> {
        let tag = self.call_i32(
            export::PROMISE_STATE,
            &[self.ctx_arg(), WasmValue::ptr(promise)],
        )?;
        PromiseState::from_tag(tag).ok_or_else(|| {
            RuntimeError::foreign(export::PROMISE_STATE, "value is not a promise")
        })
    }

    pub fn promise_result(&self, promise: u32) -> Result<u32> {
        self.call_value(
            export::PROMISE_RESULT,
            &[self.ctx_arg(), WasmValue::ptr(promise)],
        )
    }

    /// Attach reactions; 0 means no handler for that branch.
    pub fn promise_then(&self, promise: u32, on_fulfilled: u32, on_rejected: u32) -> Result<u32> {
        self.call_value(
            export::PROMISE_THEN,
            &[
                self.ctx_arg(),
                WasmValue::ptr(promise),
                WasmValue::ptr(on_fulfilled),
                WasmValue::ptr(on_rejected),
            ],
        )
    }

    pub fn is_job_pending(&self) -> Result<bool> {
        Ok(self.call_i32(export::IS_JOB_PENDING, &[WasmValue::ptr(self.rt)])? != 0)
    }

    pub fn execute_pending_job(&self) -> Result<JobStep> {
        let ran = self.call_i32(
            export::EXECUTE_PENDING_JOB,
            &[WasmValue::ptr(self.rt), WasmValue::I32(1)],
        )?;
        Ok(match ran {
            0 => JobStep::Idle,
            n if n > 0 => JobStep::Ran,
            _ => JobStep::Failed,
        })
    }

    /// Drain rejection notifications. Each event's pointers are owned.
    pub fn take_rejection_events(&self) -> Result<Vec<RejectionEvent>> {
        self.with_scratch(4, |out_len| {
            let table = self.call_u32(
                export::TAKE_REJECTION_EVENTS,
                &[self.ctx_arg(), WasmValue::ptr(out_len)],
            )?;
            let len = self.bridge.read_u32(out_len)?;
            if table == 0 || len == 0 {
                return Ok(Vec::new());
            }
            let words = self.read_ptr_table(table, len * 3);
            self.bridge.free(table);
            Ok(words?
                .chunks_exact(3)
                .map(|w| RejectionEvent {
                    promise: w[0],
                    reason: w[1],
                    is_handled: w[2] != 0,
                })
                .collect())
        })
    }
}

/// Owner of the engine registry, pinned to the thread that created it.
///
/// Every access goes through [`EngineCell::with`], which raises
/// `CrossThreadViolation` off the owner thread. The lock is re-entrant so host
/// functions invoked from inside an engine call can call back into it.
pub struct EngineCell {
    owner: ThreadId,
    registry: ReentrantMutex<RefCell<Option<HandleRegistry>>>,
    closed: AtomicBool,
    live_handles: AtomicUsize,
}

impl EngineCell {
    pub(crate) fn new(registry: HandleRegistry) -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            registry: ReentrantMutex::new(RefCell::new(Some(registry))),
            closed: AtomicBool::new(false),
            live_handles: AtomicUsize::new(0),
        })
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of owned handles currently alive.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::Acquire)
    }

    pub(crate) fn handle_opened(&self) {
        self.live_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn handle_closed(&self) {
        self.live_handles.fetch_sub(1, Ordering::AcqRel);
    }

    /// Check that the caller may touch the engine.
    pub fn check_access(&self, operation: &'static str) -> Result<()> {
        if self.is_closed() {
            return Err(RuntimeError::EngineClosed);
        }
        let caller = thread::current().id();
        if caller != self.owner {
            return Err(RuntimeError::CrossThreadViolation {
                operation,
                owner: self.owner,
                caller,
            });
        }
        Ok(())
    }

    pub fn with<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&HandleRegistry) -> Result<R>,
    ) -> Result<R> {
        self.check_access(operation)?;
        let guard = self.registry.lock();
        let slot = guard.borrow();
        match slot.as_ref() {
            Some(registry) => f(registry),
            None => Err(RuntimeError::EngineClosed),
        }
    }

    #[cfg(test)]
    pub(crate) fn sandbox() -> Arc<Self> {
        let bridge = Box::new(crate::runtime::sandbox::SandboxEngine::new());
        match HandleRegistry::open(bridge, &RuntimeConfig::default()) {
            Ok(registry) => Self::new(registry),
            Err(e) => panic!("sandbox engine failed to open: {e}"),
        }
    }

    /// Detach the registry. Only the owner thread may close the cell.
    pub(crate) fn close(&self) -> Result<Option<HandleRegistry>> {
        self.check_access("close engine")?;
        self.closed.store(true, Ordering::Release);
        let guard = self.registry.lock();
        let registry = guard.borrow_mut().take();
        Ok(registry)
    }
}
