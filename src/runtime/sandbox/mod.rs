//! In-process reference engine.
//!
//! [`SandboxEngine`] implements [`MemoryBridge`] over a simulated linear
//! memory and a refcounted value table. It speaks the same export calling
//! conventions as a real engine build: values are 32-bit pointers, strings
//! travel as NUL-terminated buffers, and multi-value results are written
//! through out-pointers. It has promises with a job queue and a rejection
//! tracker, host functions routed through the trampoline, and an interrupt
//! check on every call and job.
//!
//! The state lock is never held while host code runs, so host functions may
//! call straight back into the engine.

mod heap;
mod memory;

use crate::runtime::bridge::{
    export, EqualOp, HostInvocation, HostTrampoline, InterruptHandler, MemoryBridge, ValueKind,
    WasmValue,
};
use crate::runtime::error::{Result, RuntimeError};
use heap::{FunctionKind, Heap, Job, ObjectClass, Value, UNDEFINED};
use indexmap::IndexMap;
use memory::LinearMemory;
use parking_lot::Mutex;
use std::sync::Arc;

const RUNTIME_ID: u32 = 1;
const CONTEXT_ID: u32 = 1;

type Trampoline = Arc<dyn Fn(HostInvocation) -> u32 + Send + Sync>;
type Interrupt = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    memory: LinearMemory,
    heap: Heap,
}

/// Reference engine used by the test-suite and usable as a stand-in engine.
#[derive(Default)]
pub struct SandboxEngine {
    state: Mutex<State>,
    trampoline: Mutex<Option<Trampoline>>,
    interrupt: Mutex<Option<Interrupt>>,
}

struct Args<'a> {
    name: &'a str,
    values: &'a [WasmValue],
}

impl Args<'_> {
    fn ptr(&self, index: usize) -> Result<u32> {
        self.values
            .get(index)
            .and_then(WasmValue::as_u32)
            .ok_or_else(|| self.bad_arg(index))
    }

    fn i32(&self, index: usize) -> Result<i32> {
        self.values
            .get(index)
            .and_then(WasmValue::as_i32)
            .ok_or_else(|| self.bad_arg(index))
    }

    fn i64(&self, index: usize) -> Result<i64> {
        self.values
            .get(index)
            .and_then(WasmValue::as_i64)
            .ok_or_else(|| self.bad_arg(index))
    }

    fn f64(&self, index: usize) -> Result<f64> {
        self.values
            .get(index)
            .and_then(WasmValue::as_f64)
            .ok_or_else(|| self.bad_arg(index))
    }

    fn bad_arg(&self, index: usize) -> RuntimeError {
        RuntimeError::foreign("call_export", format!("{}: bad argument {}", self.name, index))
    }
}

fn ptr_result(ptr: u32) -> WasmValue {
    WasmValue::ptr(ptr)
}

fn status(ok: bool) -> WasmValue {
    WasmValue::I32(if ok { 0 } else { -1 })
}

impl SandboxEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of linear memory currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.state.lock().memory.used()
    }

    fn interrupted(&self) -> bool {
        let handler = self.interrupt.lock().clone();
        handler.map_or(false, |check| check())
    }

    fn dispatch(&self, args: &Args<'_>) -> Result<WasmValue> {
        match args.name {
            export::NEW_RUNTIME => Ok(ptr_result(RUNTIME_ID)),
            export::NEW_CONTEXT => Ok(ptr_result(CONTEXT_ID)),
            export::FREE_CONTEXT | export::FREE_RUNTIME => {
                let mut state = self.state.lock();
                state.heap.clear();
                state.memory.clear();
                Ok(WasmValue::Void)
            }
            export::SET_MEMORY_LIMIT => {
                let limit = args.i64(1)?;
                self.state
                    .lock()
                    .memory
                    .set_limit((limit >= 0).then_some(limit as usize));
                Ok(WasmValue::Void)
            }
            export::LIVE_VALUE_COUNT => Ok(WasmValue::I32(self.state.lock().heap.live_count() as i32)),

            export::GET_UNDEFINED => Ok(ptr_result(heap::UNDEFINED)),
            export::GET_NULL => Ok(ptr_result(heap::NULL)),
            export::GET_TRUE => Ok(ptr_result(heap::TRUE)),
            export::GET_FALSE => Ok(ptr_result(heap::FALSE)),

            export::DUP_VALUE => {
                let ptr = args.ptr(1)?;
                let mut state = self.state.lock();
                if state.heap.dup(ptr) {
                    Ok(ptr_result(ptr))
                } else {
                    state.heap.throw_error(&format!("invalid value pointer {ptr}"));
                    Ok(ptr_result(0))
                }
            }
            export::FREE_VALUE => {
                let ptr = args.ptr(1)?;
                if self.state.lock().heap.free(ptr) {
                    Ok(WasmValue::Void)
                } else {
                    Err(RuntimeError::foreign(
                        export::FREE_VALUE,
                        format!("unknown or already freed value pointer {ptr}"),
                    ))
                }
            }

            export::NEW_FLOAT64 => {
                let n = args.f64(1)?;
                Ok(ptr_result(self.state.lock().heap.insert(Value::Number(n))))
            }
            export::GET_FLOAT64 => {
                let ptr = args.ptr(1)?;
                Ok(WasmValue::F64(self.state.lock().heap.number(ptr)))
            }
            export::NEW_STRING => {
                let buf = args.ptr(1)?;
                let mut state = self.state.lock();
                let s = state.memory.read_cstring(buf)?;
                Ok(ptr_result(state.heap.new_string(s)))
            }
            export::TO_CSTRING => {
                let ptr = args.ptr(1)?;
                let mut state = self.state.lock();
                let s = state.heap.to_display(ptr);
                let out = state.memory.write_cstring(&s)?;
                if out == 0 {
                    state.heap.throw_error("out of memory");
                }
                Ok(ptr_result(out))
            }
            export::FREE_CSTRING => {
                let ptr = args.ptr(1)?;
                self.state.lock().memory.free(ptr);
                Ok(WasmValue::Void)
            }
            export::NEW_ARRAY_BUFFER => {
                let (buf, len) = (args.ptr(1)?, args.ptr(2)?);
                let mut state = self.state.lock();
                let bytes = state.memory.read(buf, len)?;
                Ok(ptr_result(state.heap.insert(Value::Bytes(bytes))))
            }
            export::COPY_ARRAY_BUFFER => {
                let (ptr, out_len) = (args.ptr(1)?, args.ptr(2)?);
                let mut state = self.state.lock();
                let bytes = match state.heap.get(ptr) {
                    Some(Value::Bytes(bytes)) => bytes.clone(),
                    _ => {
                        state.heap.throw_error("value is not an ArrayBuffer");
                        return Ok(ptr_result(0));
                    }
                };
                let data = state.memory.allocate(bytes.len().max(1) as u32);
                if data == 0 {
                    state.heap.throw_error("out of memory");
                    return Ok(ptr_result(0));
                }
                state.memory.write(data, &bytes)?;
                state.memory.write_u32(out_len, bytes.len() as u32)?;
                Ok(ptr_result(data))
            }

            export::NEW_OBJECT => Ok(ptr_result(self.state.lock().heap.insert(Value::Object {
                class: ObjectClass::Plain,
                props: IndexMap::new(),
            }))),
            export::NEW_ARRAY => Ok(ptr_result(
                self.state.lock().heap.insert(Value::Array(Vec::new())),
            )),
            export::GET_PROP => {
                let (obj, key) = (args.ptr(1)?, args.ptr(2)?);
                let mut state = self.state.lock();
                let key = state.heap.to_display(key);
                match state.heap.get_prop(obj, &key) {
                    Ok(ptr) => Ok(ptr_result(ptr)),
                    Err(message) => {
                        state.heap.throw_error(&message);
                        Ok(ptr_result(0))
                    }
                }
            }
            export::SET_PROP => {
                let (obj, key, value) = (args.ptr(1)?, args.ptr(2)?, args.ptr(3)?);
                let mut state = self.state.lock();
                let key = state.heap.to_display(key);
                match state.heap.set_prop(obj, &key, value) {
                    Ok(()) => Ok(WasmValue::I32(1)),
                    Err(message) => {
                        state.heap.throw_error(&message);
                        Ok(WasmValue::I32(0))
                    }
                }
            }
            export::GET_OWN_PROPERTY_NAMES => {
                let (out_ptrs, out_len, obj) = (args.ptr(1)?, args.ptr(2)?, args.ptr(3)?);
                let mut state = self.state.lock();
                let keys = match state.heap.own_keys(obj) {
                    Ok(keys) => keys,
                    Err(message) => {
                        state.heap.throw_error(&message);
                        return Ok(status(false));
                    }
                };
                let names: Vec<u32> = keys.into_iter().map(|k| state.heap.new_string(k)).collect();
                let table = state.memory.write_table(&names)?;
                if table == 0 {
                    for name in names {
                        state.heap.free(name);
                    }
                    state.heap.throw_error("out of memory");
                    return Ok(status(false));
                }
                state.memory.write_u32(out_ptrs, table)?;
                state.memory.write_u32(out_len, names.len() as u32)?;
                Ok(status(true))
            }
            export::GET_LENGTH => {
                let (out_len, ptr) = (args.ptr(1)?, args.ptr(2)?);
                let mut state = self.state.lock();
                match state.heap.length(ptr) {
                    Ok(len) => {
                        state.memory.write_u32(out_len, len)?;
                        Ok(status(true))
                    }
                    Err(message) => {
                        state.heap.throw_error(&message);
                        Ok(status(false))
                    }
                }
            }
            export::TYPE_OF => {
                let ptr = args.ptr(1)?;
                let kind = self.state.lock().heap.kind(ptr);
                Ok(WasmValue::I32(kind.map_or(-1, ValueKind::tag)))
            }
            export::IS_EQUAL => {
                let (a, b, op) = (args.ptr(1)?, args.ptr(2)?, args.i32(3)?);
                let op = if op == EqualOp::SameValue as i32 {
                    EqualOp::SameValue
                } else {
                    EqualOp::StrictEq
                };
                let equal = self.state.lock().heap.is_equal(a, b, op);
                Ok(WasmValue::I32(i32::from(equal)))
            }

            export::NEW_ERROR => {
                let buf = args.ptr(1)?;
                let mut state = self.state.lock();
                let message = state.memory.read_cstring(buf)?;
                Ok(ptr_result(state.heap.new_error(&message)))
            }
            export::THROW => {
                let ptr = args.ptr(1)?;
                let mut state = self.state.lock();
                if state.heap.dup(ptr) {
                    state.heap.set_exception(ptr);
                }
                Ok(WasmValue::Void)
            }
            export::GET_LAST_ERROR => Ok(ptr_result(
                self.state.lock().heap.take_exception().unwrap_or(0),
            )),

            export::NEW_FUNCTION => {
                let (func_id, name) = (args.ptr(1)?, args.ptr(2)?);
                let mut state = self.state.lock();
                let name = state.memory.read_cstring(name)?;
                Ok(ptr_result(state.heap.insert(Value::Function {
                    name,
                    kind: FunctionKind::Host(func_id),
                })))
            }
            export::CALL => self.export_call(args),

            export::NEW_PROMISE_CAPABILITY => {
                let out = args.ptr(1)?;
                let mut state = self.state.lock();
                let promise = state.heap.new_promise();
                let mut functions = [0u32; 2];
                for (slot, kind) in functions
                    .iter_mut()
                    .zip([FunctionKind::Resolve(promise), FunctionKind::Reject(promise)])
                {
                    state.heap.dup(promise);
                    *slot = state.heap.insert(Value::Function {
                        name: String::new(),
                        kind,
                    });
                }
                state.memory.write_u32(out, functions[0])?;
                state.memory.write_u32(out + 4, functions[1])?;
                Ok(ptr_result(promise))
            }
            export::PROMISE_STATE => {
                let ptr = args.ptr(1)?;
                let state = self.state.lock().heap.promise_state(ptr);
                Ok(WasmValue::I32(state.map_or(-1, |s| s as i32)))
            }
            export::PROMISE_RESULT => {
                let ptr = args.ptr(1)?;
                let mut state = self.state.lock();
                match state.heap.promise_result(ptr) {
                    Some(value) => Ok(ptr_result(value)),
                    None => {
                        state.heap.throw_error("value is not a promise");
                        Ok(ptr_result(0))
                    }
                }
            }
            export::PROMISE_THEN => {
                let (promise, on_fulfilled, on_rejected) = (args.ptr(1)?, args.ptr(2)?, args.ptr(3)?);
                let mut state = self.state.lock();
                if !state.heap.is_promise(promise) {
                    state.heap.throw_error("then called on a non-promise value");
                    return Ok(ptr_result(0));
                }
                let derived = state.heap.new_promise();
                state.heap.dup(derived);
                state
                    .heap
                    .attach_reaction(promise, on_fulfilled, on_rejected, derived);
                Ok(ptr_result(derived))
            }
            export::IS_JOB_PENDING => Ok(WasmValue::I32(i32::from(
                !self.state.lock().heap.jobs.is_empty(),
            ))),
            export::EXECUTE_PENDING_JOB => Ok(WasmValue::I32(self.execute_pending_job())),
            export::TAKE_REJECTION_EVENTS => {
                let out_len = args.ptr(1)?;
                let mut state = self.state.lock();
                let events = std::mem::take(&mut state.heap.rejections);
                let words: Vec<u32> = events
                    .iter()
                    .flat_map(|e| [e.promise, e.reason, u32::from(e.is_handled)])
                    .collect();
                let table = if events.is_empty() {
                    0
                } else {
                    state.memory.write_table(&words)?
                };
                if table == 0 {
                    for e in &events {
                        state.heap.free(e.promise);
                        state.heap.free(e.reason);
                    }
                    state.memory.write_u32(out_len, 0)?;
                    return Ok(ptr_result(0));
                }
                state.memory.write_u32(out_len, events.len() as u32)?;
                Ok(ptr_result(table))
            }

            other => Err(RuntimeError::foreign("call_export", format!("unknown export {other}"))),
        }
    }

    fn export_call(&self, args: &Args<'_>) -> Result<WasmValue> {
        let (func, this, argc, argv) = (args.ptr(1)?, args.ptr(2)?, args.ptr(3)?, args.ptr(4)?);
        let arguments = self.state.lock().memory.read_ptrs(argv, argc)?;
        match self.call_function(func, this, &arguments, Some(argv)) {
            Ok(value) => Ok(ptr_result(value)),
            Err(exception) => {
                self.state.lock().heap.set_exception(exception);
                Ok(ptr_result(0))
            }
        }
    }

    /// Call `func`. Returns an owned result or an owned exception.
    fn call_function(
        &self,
        func: u32,
        this: u32,
        arguments: &[u32],
        argv: Option<u32>,
    ) -> std::result::Result<u32, u32> {
        if self.interrupted() {
            return Err(self.state.lock().heap.new_error("interrupted"));
        }
        let kind = {
            let mut state = self.state.lock();
            match state.heap.get(func) {
                Some(Value::Function { kind, .. }) => *kind,
                _ => {
                    let message = format!("{} is not a function", state.heap.to_display(func));
                    return Err(state.heap.new_error(&message));
                }
            }
        };

        match kind {
            FunctionKind::Resolve(promise) | FunctionKind::Reject(promise) => {
                let value = arguments.first().copied().unwrap_or(UNDEFINED);
                let reject = matches!(kind, FunctionKind::Reject(_));
                self.state
                    .lock()
                    .heap
                    .resolve_function(promise, value, reject);
                Ok(UNDEFINED)
            }
            FunctionKind::Host(func_id) => self.call_host(func_id, this, arguments, argv),
        }
    }

    fn call_host(
        &self,
        func_id: u32,
        this: u32,
        arguments: &[u32],
        argv: Option<u32>,
    ) -> std::result::Result<u32, u32> {
        let Some(trampoline) = self.trampoline.lock().clone() else {
            return Err(self.state.lock().heap.new_error("no host trampoline installed"));
        };

        let (argv_ptr, scratch) = match argv {
            Some(ptr) if !arguments.is_empty() => (ptr, None),
            _ if arguments.is_empty() => (0, None),
            _ => {
                let mut state = self.state.lock();
                match state.memory.write_table(arguments) {
                    Ok(ptr) if ptr != 0 => (ptr, Some(ptr)),
                    _ => return Err(state.heap.new_error("out of memory")),
                }
            }
        };

        let result = trampoline(HostInvocation {
            func_id,
            this_ptr: this,
            argc: arguments.len() as u32,
            argv_ptr,
        });

        let mut state = self.state.lock();
        if let Some(ptr) = scratch {
            state.memory.free(ptr);
        }
        if result != 0 {
            return Ok(result);
        }
        Err(state
            .heap
            .take_exception()
            .unwrap_or_else(|| state.heap.new_error("host function failed")))
    }

    fn execute_pending_job(&self) -> i32 {
        let job = self.state.lock().heap.jobs.pop_front();
        let Some(job) = job else {
            return 0;
        };
        if self.interrupted() {
            let mut state = self.state.lock();
            state.heap.finish_job(job);
            state.heap.throw_error("interrupted");
            return -1;
        }
        self.run_job(job);
        1
    }

    fn run_job(&self, job: Job) {
        // Pass-through reactions forward the borrowed argument; handler
        // results come back owned.
        let (value, rejected, owned) = if job.handler == 0 {
            (job.argument, job.rejected, false)
        } else {
            match self.call_function(job.handler, UNDEFINED, &[job.argument], None) {
                Ok(value) => (value, false, true),
                Err(exception) => (exception, true, true),
            }
        };
        let mut state = self.state.lock();
        if rejected {
            state.heap.reject_with(job.derived, value);
        } else {
            state.heap.resolve_with(job.derived, value);
        }
        if owned {
            state.heap.free(value);
        }
        state.heap.finish_job(job);
    }
}

impl MemoryBridge for SandboxEngine {
    fn allocate(&self, size: u32) -> u32 {
        self.state.lock().memory.allocate(size)
    }

    fn free(&self, ptr: u32) {
        self.state.lock().memory.free(ptr);
    }

    fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.state.lock().memory.read(ptr, len)
    }

    fn write_bytes(&self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.state.lock().memory.write(ptr, bytes)
    }

    fn read_cstring(&self, ptr: u32) -> Result<String> {
        self.state.lock().memory.read_cstring(ptr)
    }

    fn call_export(&self, name: &str, args: &[WasmValue]) -> Result<WasmValue> {
        tracing::trace!(export = name, "sandbox export call");
        self.dispatch(&Args { name, values: args })
    }

    fn set_host_trampoline(&self, trampoline: HostTrampoline) {
        *self.trampoline.lock() = Some(Arc::from(trampoline));
    }

    fn set_interrupt_handler(&self, handler: Option<InterruptHandler>) {
        *self.interrupt.lock() = handler.map(Arc::from);
    }
}
