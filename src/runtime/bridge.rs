//! Capability interface onto the embedded engine.
//!
//! The engine lives behind a WebAssembly-style boundary: a linear memory the
//! host can allocate in, read and write, plus a table of exported functions
//! called by name. Everything above this module speaks in terms of these
//! primitives only, so any engine host (a wasm runtime, a native build, or the
//! in-process [`sandbox`](crate::runtime::sandbox)) can sit underneath.

use crate::runtime::error::{Result, RuntimeError};

/// Scalar passed to or returned from an engine export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    Void,
    I32(i32),
    I64(i64),
    F64(f64),
}

impl WasmValue {
    /// Encode a 32-bit engine pointer.
    pub fn ptr(ptr: u32) -> Self {
        WasmValue::I32(ptr as i32)
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            WasmValue::I32(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WasmValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WasmValue::I64(v) => Some(*v),
            WasmValue::I32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WasmValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// A call from the engine into a host function created with `new_function`.
///
/// `argv_ptr` points at `argc` little-endian `u32` value pointers in linear
/// memory. The arguments and `this` are borrowed for the duration of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInvocation {
    pub func_id: u32,
    pub this_ptr: u32,
    pub argc: u32,
    pub argv_ptr: u32,
}

/// Host entry point for engine-originated calls.
///
/// Returns an owned value pointer, or 0 after throwing an exception into the
/// engine.
pub type HostTrampoline = Box<dyn Fn(HostInvocation) -> u32 + Send + Sync>;

/// Polled by the engine during long-running execution; `true` aborts.
pub type InterruptHandler = Box<dyn Fn() -> bool + Send + Sync>;

/// Fixed capability surface of the engine host.
///
/// Implementations are moved onto the dispatcher's worker thread and only ever
/// called from there, but may be re-entered from inside a host trampoline, so
/// every method takes `&self`.
pub trait MemoryBridge: Send {
    /// Allocate `size` bytes of linear memory. Returns 0 when out of memory.
    fn allocate(&self, size: u32) -> u32;

    fn free(&self, ptr: u32);

    fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>>;

    fn write_bytes(&self, ptr: u32, bytes: &[u8]) -> Result<()>;

    /// Read a NUL-terminated UTF-8 string.
    fn read_cstring(&self, ptr: u32) -> Result<String>;

    /// Call an exported function by name.
    fn call_export(&self, name: &str, args: &[WasmValue]) -> Result<WasmValue>;

    fn set_host_trampoline(&self, trampoline: HostTrampoline);

    fn set_interrupt_handler(&self, handler: Option<InterruptHandler>);

    fn read_u32(&self, ptr: u32) -> Result<u32> {
        let bytes = self.read_bytes(ptr, 4)?;
        let array: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| RuntimeError::foreign("read_u32", "short read"))?;
        Ok(u32::from_le_bytes(array))
    }

    fn write_u32(&self, ptr: u32, value: u32) -> Result<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }
}

/// Factory run on the worker thread to build the engine host.
pub type EngineFactory = Box<dyn FnOnce() -> Result<Box<dyn MemoryBridge>> + Send>;

/// Export names of the engine call registry.
pub mod export {
    pub const NEW_RUNTIME: &str = "new_runtime";
    pub const FREE_RUNTIME: &str = "free_runtime";
    pub const SET_MEMORY_LIMIT: &str = "runtime_set_memory_limit";
    pub const NEW_CONTEXT: &str = "new_context";
    pub const FREE_CONTEXT: &str = "free_context";
    pub const LIVE_VALUE_COUNT: &str = "live_value_count";

    pub const GET_UNDEFINED: &str = "get_undefined";
    pub const GET_NULL: &str = "get_null";
    pub const GET_TRUE: &str = "get_true";
    pub const GET_FALSE: &str = "get_false";

    pub const DUP_VALUE: &str = "dup_value_pointer";
    pub const FREE_VALUE: &str = "free_value_pointer";

    pub const NEW_FLOAT64: &str = "new_float64";
    pub const GET_FLOAT64: &str = "get_float64";
    pub const NEW_STRING: &str = "new_string";
    pub const TO_CSTRING: &str = "to_cstring";
    pub const FREE_CSTRING: &str = "free_cstring";
    pub const NEW_ARRAY_BUFFER: &str = "new_array_buffer";
    pub const COPY_ARRAY_BUFFER: &str = "copy_array_buffer";

    pub const NEW_OBJECT: &str = "new_object";
    pub const NEW_ARRAY: &str = "new_array";
    pub const GET_PROP: &str = "get_prop";
    pub const SET_PROP: &str = "set_prop";
    pub const GET_OWN_PROPERTY_NAMES: &str = "get_own_property_names";
    pub const GET_LENGTH: &str = "get_length";
    pub const TYPE_OF: &str = "type_of";
    pub const IS_EQUAL: &str = "is_equal";

    pub const NEW_ERROR: &str = "new_error";
    pub const THROW: &str = "throw";
    pub const GET_LAST_ERROR: &str = "get_last_error";

    pub const NEW_FUNCTION: &str = "new_function";
    pub const CALL: &str = "call";

    pub const NEW_PROMISE_CAPABILITY: &str = "new_promise_capability";
    pub const PROMISE_STATE: &str = "promise_state";
    pub const PROMISE_RESULT: &str = "promise_result";
    pub const PROMISE_THEN: &str = "promise_then";
    pub const IS_JOB_PENDING: &str = "is_job_pending";
    pub const EXECUTE_PENDING_JOB: &str = "execute_pending_job";
    pub const TAKE_REJECTION_EVENTS: &str = "take_rejection_events";
}

/// Type tag reported by the `type_of` export.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined = 0,
    Null = 1,
    Boolean = 2,
    Number = 3,
    String = 4,
    Bytes = 5,
    Object = 6,
    Array = 7,
    Function = 8,
    Promise = 9,
    Error = 10,
}

impl ValueKind {
    pub fn from_tag(tag: i32) -> Option<Self> {
        Some(match tag {
            0 => ValueKind::Undefined,
            1 => ValueKind::Null,
            2 => ValueKind::Boolean,
            3 => ValueKind::Number,
            4 => ValueKind::String,
            5 => ValueKind::Bytes,
            6 => ValueKind::Object,
            7 => ValueKind::Array,
            8 => ValueKind::Function,
            9 => ValueKind::Promise,
            10 => ValueKind::Error,
            _ => return None,
        })
    }

    pub fn tag(self) -> i32 {
        self as i32
    }
}

/// Settlement state of a VM promise.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending = 0,
    Fulfilled = 1,
    Rejected = 2,
}

impl PromiseState {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(PromiseState::Pending),
            1 => Some(PromiseState::Fulfilled),
            2 => Some(PromiseState::Rejected),
            _ => None,
        }
    }
}

/// Equality operator accepted by the `is_equal` export.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualOp {
    StrictEq = 0,
    SameValue = 1,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasm_value_pointer_round_trip() {
        let value = WasmValue::ptr(u32::MAX - 3);
        assert_eq!(value.as_u32(), Some(u32::MAX - 3));
        assert_eq!(WasmValue::F64(1.5).as_u32(), None);
        assert_eq!(WasmValue::I32(-1).as_i64(), Some(-1));
    }

    #[test]
    fn test_value_kind_tags() {
        for tag in 0..=10 {
            let kind = ValueKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert!(ValueKind::from_tag(11).is_none());
        assert_eq!(PromiseState::from_tag(2), Some(PromiseState::Rejected));
        assert!(PromiseState::from_tag(-1).is_none());
    }
}
