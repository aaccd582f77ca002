//! Conversion between engine values and `JSValue` snapshots.

use crate::runtime::bridge::{EqualOp, ValueKind};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handle::Handle;
use crate::runtime::js_value::{JSValue, LimitTracker};
use crate::runtime::registry::{EngineCell, HandleRegistry};
use indexmap::IndexMap;
use std::sync::Arc;

/// Build an engine value from a `JSValue`. The result is always owned.
pub(crate) fn js_value_to_handle(
    engine: &Arc<EngineCell>,
    value: &JSValue,
    config: &RuntimeConfig,
) -> Result<Handle> {
    let mut tracker = LimitTracker::new(config.max_conversion_depth, config.max_conversion_bytes);
    let ptr = engine.with("convert to engine value", |r| {
        js_value_to_ptr(r, value, &mut tracker)
    })?;
    Ok(Handle::owned(ptr, engine.clone()))
}

fn js_value_to_ptr(r: &HandleRegistry, value: &JSValue, tracker: &mut LimitTracker) -> Result<u32> {
    tracker.enter()?;
    let result = match value {
        JSValue::Undefined => r.undefined().and_then(|p| r.dup_value(p)),
        JSValue::Null => r.null().and_then(|p| r.dup_value(p)),
        JSValue::Bool(b) => r.boolean(*b).and_then(|p| r.dup_value(p)),
        JSValue::Int(i) => {
            tracker.add_bytes(8)?;
            r.new_number(*i as f64)
        }
        JSValue::Float(f) => {
            tracker.add_bytes(8)?;
            r.new_number(*f)
        }
        JSValue::String(s) => {
            tracker.add_bytes(s.len() + 16)?;
            r.new_string(s)
        }
        JSValue::Bytes(b) => {
            tracker.add_bytes(b.len() + 16)?;
            r.new_bytes(b)
        }
        JSValue::Error { message } => {
            tracker.add_bytes(message.len() + 16)?;
            r.new_error(message)
        }
        JSValue::Array(items) => {
            tracker.add_bytes(16 + items.len() * 8)?;
            let array = r.new_array()?;
            let filled = items.iter().enumerate().try_for_each(|(i, item)| {
                let child = js_value_to_ptr(r, item, tracker)?;
                let set = r.set_prop(array, &i.to_string(), child);
                r.free_value(child);
                set
            });
            finish_container(r, array, filled)
        }
        JSValue::Object(map) => {
            tracker.add_bytes(24 + map.len() * 16)?;
            let object = r.new_object()?;
            let filled = map.iter().try_for_each(|(key, item)| {
                tracker.add_bytes(key.len())?;
                let child = js_value_to_ptr(r, item, tracker)?;
                let set = r.set_prop(object, key, child);
                r.free_value(child);
                set
            });
            finish_container(r, object, filled)
        }
    };
    tracker.exit();
    result
}

fn finish_container(r: &HandleRegistry, ptr: u32, filled: Result<()>) -> Result<u32> {
    match filled {
        Ok(()) => Ok(ptr),
        Err(e) => {
            r.free_value(ptr);
            Err(e)
        }
    }
}

/// Snapshot an engine value, enforcing the configured limits and rejecting
/// cyclic structures.
pub(crate) fn handle_to_js_value(handle: &Handle, config: &RuntimeConfig) -> Result<JSValue> {
    let ptr = handle.raw()?;
    let mut tracker = LimitTracker::new(config.max_conversion_depth, config.max_conversion_bytes);
    let mut ancestors = Vec::new();
    handle.engine().with("convert from engine value", |r| {
        ptr_to_js_value(r, ptr, &mut ancestors, &mut tracker)
    })
}

fn ptr_to_js_value(
    r: &HandleRegistry,
    ptr: u32,
    ancestors: &mut Vec<u32>,
    tracker: &mut LimitTracker,
) -> Result<JSValue> {
    tracker.enter()?;
    let result = match r.kind(ptr)? {
        ValueKind::Undefined => Ok(JSValue::Undefined),
        ValueKind::Null => Ok(JSValue::Null),
        ValueKind::Boolean => {
            tracker.add_bytes(1)?;
            let truthy = r.boolean(true)?;
            Ok(JSValue::Bool(r.is_equal(ptr, truthy, EqualOp::StrictEq)?))
        }
        ValueKind::Number => {
            tracker.add_bytes(8)?;
            Ok(JSValue::from_number(r.number(ptr)?))
        }
        ValueKind::String => {
            let s = r.to_string(ptr)?;
            tracker.add_bytes(s.len() + 16)?;
            Ok(JSValue::String(s))
        }
        ValueKind::Bytes => {
            let bytes = r.bytes(ptr)?;
            tracker.add_bytes(bytes.len() + 16)?;
            Ok(JSValue::Bytes(bytes))
        }
        ValueKind::Error => {
            let message_ptr = r.get_prop(ptr, "message")?;
            let message = r.to_string(message_ptr);
            r.free_value(message_ptr);
            let message = message?;
            tracker.add_bytes(message.len() + 16)?;
            Ok(JSValue::Error { message })
        }
        ValueKind::Array => {
            enter_container(r, ptr, ancestors)?;
            let items = array_items(r, ptr, ancestors, tracker);
            ancestors.pop();
            items.map(JSValue::Array)
        }
        ValueKind::Object => {
            enter_container(r, ptr, ancestors)?;
            let entries = object_entries(r, ptr, ancestors, tracker);
            ancestors.pop();
            entries.map(JSValue::Object)
        }
        ValueKind::Function => Err(RuntimeError::Conversion(
            "functions cannot be converted to host values".to_string(),
        )),
        ValueKind::Promise => Err(RuntimeError::Conversion(
            "promises must be awaited before conversion".to_string(),
        )),
    };
    tracker.exit();
    result
}

fn enter_container(r: &HandleRegistry, ptr: u32, ancestors: &mut Vec<u32>) -> Result<()> {
    for ancestor in ancestors.iter() {
        if r.is_equal(*ancestor, ptr, EqualOp::SameValue)? {
            return Err(RuntimeError::Conversion(
                "circular reference detected".to_string(),
            ));
        }
    }
    ancestors.push(ptr);
    Ok(())
}

fn array_items(
    r: &HandleRegistry,
    ptr: u32,
    ancestors: &mut Vec<u32>,
    tracker: &mut LimitTracker,
) -> Result<Vec<JSValue>> {
    let len = r.length(ptr)?;
    tracker.add_bytes(16 + len as usize * 8)?;
    let mut items = Vec::with_capacity(len as usize);
    for i in 0..len {
        let child = r.get_prop(ptr, &i.to_string())?;
        let item = ptr_to_js_value(r, child, ancestors, tracker);
        r.free_value(child);
        items.push(item?);
    }
    Ok(items)
}

fn object_entries(
    r: &HandleRegistry,
    ptr: u32,
    ancestors: &mut Vec<u32>,
    tracker: &mut LimitTracker,
) -> Result<IndexMap<String, JSValue>> {
    let names = r.own_property_names(ptr)?;
    let keys: Result<Vec<String>> = names.iter().map(|name| r.to_string(*name)).collect();
    for name in names {
        r.free_value(name);
    }
    let keys = keys?;

    tracker.add_bytes(24 + keys.len() * 16)?;
    let mut map = IndexMap::with_capacity(keys.len());
    for key in keys {
        tracker.add_bytes(key.len())?;
        let child = r.get_prop(ptr, &key)?;
        let value = ptr_to_js_value(r, child, ancestors, tracker);
        r.free_value(child);
        map.insert(key, value?);
    }
    Ok(map)
}
