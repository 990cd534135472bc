//! The tagged union every opcode handler pushes onto or pops off the VM's
//! value stack.
//!
//! Containers that the pickle stream can share via the memo table (`List`,
//! `Dict`, `Set`) hold their payload behind `Rc<RefCell<..>>` so that a
//! later `APPEND`/`SETITEM` mutates the same object a `GET` retrieved,
//! mirroring CPython's object-identity semantics without requiring a GC.
//! `Tuple`, `String`, and `Bytes` are immutable once built, so they're
//! shared behind a plain `Rc`.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::error::{PickleError, Result};

/// Insertion-ordered map keyed by the closed set of hashable `Value`s.
pub type ValueMap = IndexMap<HashKey, Value>;
/// Insertion-ordered set of hashable `Value`s.
pub type ValueSet = IndexSet<HashKey>;

/// An opaque host handle paired with the symbolic name of its host-side
/// variant, e.g. `("Tensor", <array payload>)`.
#[derive(Clone)]
pub struct ObjectValue {
    pub type_tag: Rc<str>,
    pub payload: Rc<dyn Any>,
}

impl ObjectValue {
    pub fn new(type_tag: impl Into<Rc<str>>, payload: Rc<dyn Any>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Downcast the payload, returning `None` if the concrete type doesn't match.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.type_tag)
    }
}

/// Every value the VM can hold on its stack, in the memo table, or return
/// as the final result of a load.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    String(Rc<str>),
    Bytes(Rc<[u8]>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<ValueMap>>),
    Set(Rc<RefCell<ValueSet>>),
    /// Sentinel pushed by `MARK`. Must never survive past the end of a load.
    Mark,
    Object(ObjectValue),
    /// Escape hatch for opaque values passed through unchanged, e.g.
    /// out-of-band buffers handed back by `NEXT_BUFFER`.
    Any(Rc<dyn Any>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::from(items.into_boxed_slice()))
    }

    pub fn dict(entries: ValueMap) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn empty_dict() -> Self {
        Value::dict(ValueMap::new())
    }

    pub fn set(entries: ValueSet) -> Self {
        Value::Set(Rc::new(RefCell::new(entries)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(Rc::from(s.into()))
    }

    pub fn bytes(b: Vec<u8>) -> Self {
        Value::Bytes(Rc::from(b.into_boxed_slice()))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Rc<RefCell<Vec<Value>>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Rc<RefCell<ValueMap>>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_mark(&self) -> bool {
        matches!(self, Value::Mark)
    }

    /// Whether this value is one of the closed set of hashable types the
    /// format permits as a dict key or set element (recursing into tuples).
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Bytes(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            Value::List(_)
            | Value::Dict(_)
            | Value::Set(_)
            | Value::Mark
            | Value::Object(_)
            | Value::Any(_) => false,
        }
    }

    /// Convert to a `HashKey` for use as a dict/set element, or fail with
    /// the `Malformed` variant the spec mandates for unhashable keys.
    pub fn into_key(self) -> Result<HashKey> {
        if self.is_hashable() {
            Ok(HashKey(self))
        } else {
            Err(PickleError::Malformed(format!(
                "unhashable value used as dict/set key: {}",
                self.type_name()
            )))
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::List(_) => "List",
            Value::Tuple(_) => "Tuple",
            Value::Dict(_) => "Dict",
            Value::Set(_) => "Set",
            Value::Mark => "Mark",
            Value::Object(_) => "Object",
            Value::Any(_) => "Any",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::List(a), Value::List(b)) => *a.borrow() == *b.borrow(),
            (Value::Dict(a), Value::Dict(b)) => *a.borrow() == *b.borrow(),
            (Value::Set(a), Value::Set(b)) => *a.borrow() == *b.borrow(),
            (Value::Mark, Value::Mark) => true,
            (Value::Object(a), Value::Object(b)) => {
                a.type_tag == b.type_tag && Rc::ptr_eq(&a.payload, &b.payload)
            }
            (Value::Any(a), Value::Any(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "b{:?}", b),
            Value::List(l) => write!(f, "{:?}", l.borrow()),
            Value::Tuple(t) => write!(f, "{:?}", t),
            Value::Dict(d) => write!(f, "{:?}", d.borrow()),
            Value::Set(s) => write!(f, "{:?}", s.borrow()),
            Value::Mark => write!(f, "<mark>"),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::Any(_) => write!(f, "<any>"),
        }
    }
}

/// A `Value` known to be one of the closed hashable variants, usable as a
/// dict key or set element. Construct via `Value::into_key`.
#[derive(Clone, Debug)]
pub struct HashKey(Value);

impl HashKey {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for HashKey {}

impl std::hash::Hash for HashKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::None => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(x) => {
                3u8.hash(state);
                x.to_bits().hash(state);
            }
            Value::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Value::Tuple(items) => {
                6u8.hash(state);
                for item in items.iter() {
                    // Safe: construction through `into_key` already verified
                    // every element of the tuple is hashable.
                    HashKey(item.clone()).hash(state);
                }
            }
            _ => unreachable!("HashKey is only constructed for hashable values"),
        }
    }
}
