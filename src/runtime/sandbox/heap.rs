//! Reference-counted value table, promise records and job queue.
//!
//! Nothing here calls back into functions; the engine front end in
//! `sandbox/mod.rs` runs calls and jobs with the heap unlocked.

use crate::runtime::bridge::{EqualOp, PromiseState, ValueKind};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

pub(crate) const UNDEFINED: u32 = 1;
pub(crate) const NULL: u32 = 2;
pub(crate) const FALSE: u32 = 3;
pub(crate) const TRUE: u32 = 4;
const FIRST_DYNAMIC: u32 = 16;

pub(crate) fn is_static(ptr: u32) -> bool {
    (UNDEFINED..=TRUE).contains(&ptr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectClass {
    Plain,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Host(u32),
    Resolve(u32),
    Reject(u32),
}

#[derive(Debug)]
pub(crate) enum Settlement {
    Pending,
    Fulfilled(u32),
    Rejected(u32),
}

#[derive(Debug)]
pub(crate) struct Reaction {
    pub(crate) derived: u32,
    pub(crate) on_fulfilled: u32,
    pub(crate) on_rejected: u32,
}

#[derive(Debug)]
pub(crate) struct PromiseRecord {
    pub(crate) settlement: Settlement,
    pub(crate) reactions: Vec<Reaction>,
    /// Whether a reaction was ever attached
    pub(crate) handled: bool,
    /// Set once a resolving function ran, even if the value is still being
    /// adopted
    pub(crate) already_resolved: bool,
}

#[derive(Debug)]
pub(crate) enum Value {
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Object {
        class: ObjectClass,
        props: IndexMap<String, u32>,
    },
    Array(Vec<u32>),
    Function {
        name: String,
        kind: FunctionKind,
    },
    Promise(PromiseRecord),
}

impl Value {
    fn children(&self) -> Vec<u32> {
        match self {
            Value::Object { props, .. } => props.values().copied().collect(),
            Value::Array(items) => items.clone(),
            Value::Function {
                kind: FunctionKind::Resolve(p) | FunctionKind::Reject(p),
                ..
            } => vec![*p],
            Value::Promise(record) => {
                let mut out = Vec::new();
                if let Settlement::Fulfilled(v) | Settlement::Rejected(v) = record.settlement {
                    out.push(v);
                }
                for reaction in &record.reactions {
                    out.push(reaction.derived);
                    out.extend([reaction.on_fulfilled, reaction.on_rejected].into_iter().filter(|p| *p != 0));
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

struct Slot {
    refs: u32,
    value: Value,
}

/// A queued promise job. Holds one reference to each non-zero pointer.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) handler: u32,
    pub(crate) derived: u32,
    pub(crate) argument: u32,
    pub(crate) rejected: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RejectionRecord {
    pub(crate) promise: u32,
    pub(crate) reason: u32,
    pub(crate) is_handled: bool,
}

pub(crate) struct Heap {
    slots: HashMap<u32, Slot>,
    next: u32,
    pub(crate) jobs: VecDeque<Job>,
    pub(crate) rejections: Vec<RejectionRecord>,
    exception: Option<u32>,
}

impl Default for Heap {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next: FIRST_DYNAMIC,
            jobs: VecDeque::new(),
            rejections: Vec::new(),
            exception: None,
        }
    }
}

impl Heap {
    pub(crate) fn live_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn insert(&mut self, value: Value) -> u32 {
        while self.slots.contains_key(&self.next) || self.next < FIRST_DYNAMIC {
            self.next = self.next.wrapping_add(1);
        }
        let ptr = self.next;
        self.next = self.next.wrapping_add(1);
        self.slots.insert(ptr, Slot { refs: 1, value });
        ptr
    }

    pub(crate) fn contains(&self, ptr: u32) -> bool {
        is_static(ptr) || self.slots.contains_key(&ptr)
    }

    pub(crate) fn get(&self, ptr: u32) -> Option<&Value> {
        self.slots.get(&ptr).map(|slot| &slot.value)
    }

    fn get_mut(&mut self, ptr: u32) -> Option<&mut Value> {
        self.slots.get_mut(&ptr).map(|slot| &mut slot.value)
    }

    /// Add a reference. Returns false for unknown pointers.
    pub(crate) fn dup(&mut self, ptr: u32) -> bool {
        if is_static(ptr) {
            return true;
        }
        match self.slots.get_mut(&ptr) {
            Some(slot) => {
                slot.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference, finalizing values that reach zero. Returns false for
    /// unknown pointers.
    pub(crate) fn free(&mut self, ptr: u32) -> bool {
        if is_static(ptr) {
            return true;
        }
        if !self.slots.contains_key(&ptr) {
            return false;
        }
        let mut pending = vec![ptr];
        while let Some(ptr) = pending.pop() {
            if is_static(ptr) {
                continue;
            }
            let Some(slot) = self.slots.get_mut(&ptr) else {
                continue;
            };
            slot.refs -= 1;
            if slot.refs == 0 {
                if let Some(slot) = self.slots.remove(&ptr) {
                    pending.extend(slot.value.children());
                }
            }
        }
        true
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.jobs.clear();
        self.rejections.clear();
        self.exception = None;
    }

    // Exceptions

    pub(crate) fn set_exception(&mut self, ptr: u32) {
        if let Some(previous) = self.exception.replace(ptr) {
            self.free(previous);
        }
    }

    pub(crate) fn take_exception(&mut self) -> Option<u32> {
        self.exception.take()
    }

    pub(crate) fn new_string(&mut self, s: impl Into<String>) -> u32 {
        self.insert(Value::String(s.into()))
    }

    pub(crate) fn new_error(&mut self, message: &str) -> u32 {
        let message = self.new_string(message);
        let mut props = IndexMap::new();
        props.insert("message".to_string(), message);
        self.insert(Value::Object {
            class: ObjectClass::Error,
            props,
        })
    }

    /// Raise a fresh error as the pending exception.
    pub(crate) fn throw_error(&mut self, message: &str) {
        let error = self.new_error(message);
        self.set_exception(error);
    }

    // Inspection

    pub(crate) fn kind(&self, ptr: u32) -> Option<ValueKind> {
        Some(match ptr {
            UNDEFINED => ValueKind::Undefined,
            NULL => ValueKind::Null,
            FALSE | TRUE => ValueKind::Boolean,
            _ => match self.get(ptr)? {
                Value::Number(_) => ValueKind::Number,
                Value::String(_) => ValueKind::String,
                Value::Bytes(_) => ValueKind::Bytes,
                Value::Object {
                    class: ObjectClass::Error,
                    ..
                } => ValueKind::Error,
                Value::Object { .. } => ValueKind::Object,
                Value::Array(_) => ValueKind::Array,
                Value::Function { .. } => ValueKind::Function,
                Value::Promise(_) => ValueKind::Promise,
            },
        })
    }

    pub(crate) fn number(&self, ptr: u32) -> f64 {
        match self.get(ptr) {
            Some(Value::Number(n)) => *n,
            _ => match ptr {
                TRUE => 1.0,
                FALSE | NULL => 0.0,
                _ => f64::NAN,
            },
        }
    }

    pub(crate) fn to_display(&self, ptr: u32) -> String {
        match ptr {
            UNDEFINED => return "undefined".to_string(),
            NULL => return "null".to_string(),
            FALSE => return "false".to_string(),
            TRUE => return "true".to_string(),
            _ => {}
        }
        match self.get(ptr) {
            Some(Value::Number(n)) => format_number(*n),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bytes(_)) => "[object ArrayBuffer]".to_string(),
            Some(Value::Object {
                class: ObjectClass::Error,
                props,
            }) => {
                let message = props
                    .get("message")
                    .map(|m| self.to_display(*m))
                    .unwrap_or_default();
                if message.is_empty() {
                    "Error".to_string()
                } else {
                    format!("Error: {message}")
                }
            }
            Some(Value::Object { .. }) => "[object Object]".to_string(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match *item {
                    UNDEFINED | NULL => String::new(),
                    other => self.to_display(other),
                })
                .collect::<Vec<_>>()
                .join(","),
            Some(Value::Function { name, .. }) => {
                format!("function {name}() {{ [native code] }}")
            }
            Some(Value::Promise(_)) => "[object Promise]".to_string(),
            None => "<invalid value>".to_string(),
        }
    }

    pub(crate) fn is_equal(&self, a: u32, b: u32, op: EqualOp) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(Value::Number(x)), Some(Value::Number(y))) => match op {
                EqualOp::StrictEq => x == y,
                EqualOp::SameValue => {
                    (x.is_nan() && y.is_nan()) || (x == y && x.is_sign_negative() == y.is_sign_negative())
                }
            },
            (Some(Value::String(x)), Some(Value::String(y))) => x == y,
            _ => a == b,
        }
    }

    // Properties

    pub(crate) fn get_prop(&mut self, obj: u32, key: &str) -> Result<u32, String> {
        let lookup = match self.get(obj) {
            Some(Value::Object { props, .. }) => Lookup::Existing(props.get(key).copied().unwrap_or(UNDEFINED)),
            Some(Value::Array(items)) if key == "length" => Lookup::Number(items.len() as f64),
            Some(Value::Array(items)) => Lookup::Existing(
                array_index(key)
                    .and_then(|i| items.get(i).copied())
                    .unwrap_or(UNDEFINED),
            ),
            Some(Value::String(s)) if key == "length" => Lookup::Number(s.chars().count() as f64),
            Some(Value::Function { name, .. }) if key == "name" => Lookup::String(name.clone()),
            Some(_) => Lookup::Existing(UNDEFINED),
            None if obj == UNDEFINED || obj == NULL => {
                return Err(format!(
                    "cannot read property '{}' of {}",
                    key,
                    self.to_display(obj)
                ))
            }
            None if is_static(obj) => Lookup::Existing(UNDEFINED),
            None => return Err(format!("invalid value pointer {obj}")),
        };
        Ok(match lookup {
            Lookup::Existing(ptr) => {
                self.dup(ptr);
                ptr
            }
            Lookup::Number(n) => self.insert(Value::Number(n)),
            Lookup::String(s) => self.new_string(s),
        })
    }

    /// Store `value` under `key`, taking a new reference to it.
    pub(crate) fn set_prop(&mut self, obj: u32, key: &str, value: u32) -> Result<(), String> {
        if !self.contains(value) {
            return Err(format!("invalid value pointer {value}"));
        }
        if !matches!(self.get(obj), Some(Value::Object { .. } | Value::Array(_))) {
            return Err(format!(
                "cannot set property '{}' of {}",
                key,
                self.to_display(obj)
            ));
        }
        let previous = match self.get_mut(obj) {
            Some(Value::Object { props, .. }) => props.insert(key.to_string(), value),
            Some(Value::Array(items)) => {
                let Some(index) = array_index(key) else {
                    return Err(format!("cannot set property '{key}' on an array"));
                };
                if index < items.len() {
                    Some(std::mem::replace(&mut items[index], value))
                } else {
                    items.resize(index, UNDEFINED);
                    items.push(value);
                    None
                }
            }
            _ => None,
        };
        self.dup(value);
        if let Some(previous) = previous {
            self.free(previous);
        }
        Ok(())
    }

    pub(crate) fn own_keys(&self, obj: u32) -> Result<Vec<String>, String> {
        match self.get(obj) {
            Some(Value::Object { props, .. }) => Ok(props.keys().cloned().collect()),
            Some(Value::Array(items)) => Ok((0..items.len()).map(|i| i.to_string()).collect()),
            _ => Err(format!(
                "cannot list properties of {}",
                self.to_display(obj)
            )),
        }
    }

    pub(crate) fn length(&self, ptr: u32) -> Result<u32, String> {
        match self.get(ptr) {
            Some(Value::Array(items)) => Ok(items.len() as u32),
            Some(Value::String(s)) => Ok(s.chars().count() as u32),
            Some(Value::Bytes(b)) => Ok(b.len() as u32),
            _ => Err(format!("{} has no length", self.to_display(ptr))),
        }
    }

    // Promises

    pub(crate) fn new_promise(&mut self) -> u32 {
        self.insert(Value::Promise(PromiseRecord {
            settlement: Settlement::Pending,
            reactions: Vec::new(),
            handled: false,
            already_resolved: false,
        }))
    }

    fn promise_mut(&mut self, ptr: u32) -> Option<&mut PromiseRecord> {
        match self.get_mut(ptr) {
            Some(Value::Promise(record)) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn is_promise(&self, ptr: u32) -> bool {
        matches!(self.get(ptr), Some(Value::Promise(_)))
    }

    pub(crate) fn promise_state(&self, ptr: u32) -> Option<PromiseState> {
        match self.get(ptr) {
            Some(Value::Promise(record)) => Some(match record.settlement {
                Settlement::Pending => PromiseState::Pending,
                Settlement::Fulfilled(_) => PromiseState::Fulfilled,
                Settlement::Rejected(_) => PromiseState::Rejected,
            }),
            _ => None,
        }
    }

    /// Owned settled value, or `undefined` while pending.
    pub(crate) fn promise_result(&mut self, ptr: u32) -> Option<u32> {
        let result = match self.get(ptr) {
            Some(Value::Promise(record)) => match record.settlement {
                Settlement::Pending => UNDEFINED,
                Settlement::Fulfilled(v) | Settlement::Rejected(v) => v,
            },
            _ => return None,
        };
        self.dup(result);
        Some(result)
    }

    /// Run a resolving function: first call wins.
    pub(crate) fn resolve_function(&mut self, promise: u32, value: u32, reject: bool) {
        let Some(record) = self.promise_mut(promise) else {
            return;
        };
        if record.already_resolved {
            return;
        }
        record.already_resolved = true;
        if reject {
            self.reject_with(promise, value);
        } else {
            self.resolve_with(promise, value);
        }
    }

    /// Resolve `promise` with `value`, adopting it if it is a promise.
    pub(crate) fn resolve_with(&mut self, promise: u32, value: u32) {
        if value == promise {
            let error = self.new_error("promise cannot resolve to itself");
            self.reject_with(promise, error);
            self.free(error);
            return;
        }
        if self.is_promise(value) {
            self.dup(promise);
            self.attach_reaction(value, 0, 0, promise);
            return;
        }
        self.settle(promise, value, false);
    }

    pub(crate) fn reject_with(&mut self, promise: u32, reason: u32) {
        self.settle(promise, reason, true);
    }

    fn settle(&mut self, promise: u32, value: u32, rejected: bool) {
        let Some(record) = self.promise_mut(promise) else {
            return;
        };
        if !matches!(record.settlement, Settlement::Pending) {
            return;
        }
        record.settlement = if rejected {
            Settlement::Rejected(value)
        } else {
            Settlement::Fulfilled(value)
        };
        let reactions = std::mem::take(&mut record.reactions);
        let report = rejected && !record.handled;
        self.dup(value);

        if report {
            self.dup(promise);
            self.dup(value);
            self.rejections.push(RejectionRecord {
                promise,
                reason: value,
                is_handled: false,
            });
        }
        for reaction in reactions {
            self.enqueue(reaction, value, rejected);
        }
    }

    /// Queue the job for a reaction, transferring its references.
    fn enqueue(&mut self, reaction: Reaction, argument: u32, rejected: bool) {
        let (handler, unused) = if rejected {
            (reaction.on_rejected, reaction.on_fulfilled)
        } else {
            (reaction.on_fulfilled, reaction.on_rejected)
        };
        if unused != 0 {
            self.free(unused);
        }
        self.dup(argument);
        self.jobs.push_back(Job {
            handler,
            derived: reaction.derived,
            argument,
            rejected,
        });
    }

    /// Attach handlers to `promise`, settling `derived` with the outcome.
    ///
    /// Takes over one reference to `derived`; handler references are added
    /// here.
    pub(crate) fn attach_reaction(&mut self, promise: u32, on_fulfilled: u32, on_rejected: u32, derived: u32) {
        for handler in [on_fulfilled, on_rejected] {
            if handler != 0 {
                self.dup(handler);
            }
        }
        let reaction = Reaction {
            derived,
            on_fulfilled,
            on_rejected,
        };
        let Some(record) = self.promise_mut(promise) else {
            return;
        };
        let was_handled = std::mem::replace(&mut record.handled, true);
        let settled = match record.settlement {
            Settlement::Pending => None,
            Settlement::Fulfilled(value) => Some((value, false)),
            Settlement::Rejected(reason) => Some((reason, true)),
        };
        match settled {
            None => record.reactions.push(reaction),
            Some((value, false)) => self.enqueue(reaction, value, false),
            Some((reason, true)) => {
                if !was_handled {
                    self.dup(promise);
                    self.dup(reason);
                    self.rejections.push(RejectionRecord {
                        promise,
                        reason,
                        is_handled: true,
                    });
                }
                self.enqueue(reaction, reason, true);
            }
        }
    }

    /// Release the references a finished job held.
    pub(crate) fn finish_job(&mut self, job: Job) {
        for ptr in [job.handler, job.derived, job.argument] {
            if ptr != 0 {
                self.free(ptr);
            }
        }
    }
}

enum Lookup {
    Existing(u32),
    Number(f64),
    String(String),
}

fn array_index(key: &str) -> Option<usize> {
    let index: usize = key.parse().ok()?;
    (index.to_string() == key).then_some(index)
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizing_a_container_frees_children() {
        let mut heap = Heap::default();
        let obj = heap.insert(Value::Object {
            class: ObjectClass::Plain,
            props: IndexMap::new(),
        });
        let s = heap.new_string("x");
        heap.set_prop(obj, "s", s).unwrap();
        assert!(heap.free(s));
        assert_eq!(heap.live_count(), 2);

        assert!(heap.free(obj));
        assert_eq!(heap.live_count(), 0);
        assert!(!heap.free(obj));
    }

    #[test]
    fn test_rejection_without_reaction_is_recorded() {
        let mut heap = Heap::default();
        let p = heap.new_promise();
        let reason = heap.new_string("nope");
        heap.resolve_function(p, reason, true);
        assert_eq!(heap.promise_state(p), Some(PromiseState::Rejected));
        assert_eq!(heap.rejections.len(), 1);
        assert!(!heap.rejections[0].is_handled);

        let derived = heap.new_promise();
        heap.attach_reaction(p, 0, 0, derived);
        assert_eq!(heap.rejections.len(), 2);
        assert!(heap.rejections[1].is_handled);
        assert_eq!(heap.jobs.len(), 1);
    }

    #[test]
    fn test_second_resolution_is_ignored() {
        let mut heap = Heap::default();
        let p = heap.new_promise();
        let a = heap.new_string("a");
        let b = heap.new_string("b");
        heap.resolve_function(p, a, false);
        heap.resolve_function(p, b, true);
        let result = heap.promise_result(p).unwrap();
        assert_eq!(heap.to_display(result), "a");
        assert!(heap.rejections.is_empty());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }
}
