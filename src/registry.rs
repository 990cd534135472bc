//! The instantiator registry: how the VM turns a `module.class` reference
//! from `GLOBAL`/`STACK_GLOBAL` into a host object, and later hydrates it
//! with the arguments a reduction or `BUILD` supplies.
//!
//! Grounded on the teacher's `NativeRegistry`/`ExternalRegistry` split,
//! unified here into one `InstantiatorRegistry` since this format's
//! `create`/`initialize` pair is symmetric for every handler — the
//! teacher's two registries exist only to separate native vs. external
//! calling conventions, a distinction this crate's single
//! fully-qualified-name key doesn't need. Interior mutability follows the
//! teacher's `SpaceHandle`/`MemoHandle`: an `Arc<RwLock<HashMap<..>>>` so a
//! registry can be shared process-wide across independently-driven loads.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use crate::error::{PickleError, Result};
use crate::value::{ObjectValue, Value};

/// A handler that knows how to create and hydrate instances of one host
/// class, keyed into the registry under a fully-qualified name (for
/// `create`) and a type tag (for `initialize`).
pub trait Instantiator: Send + Sync {
    /// Produce the empty placeholder object a `GLOBAL`/`STACK_GLOBAL`
    /// reference to this class pushes.
    fn create(&self) -> Value;

    /// Hydrate a previously-created object with reduction arguments or
    /// `BUILD` state, returning the (possibly new) object to push back.
    fn initialize(&self, object: Value, arguments: Value) -> Result<Value>;
}

#[derive(Clone)]
pub struct InstantiatorRegistry {
    by_name: Arc<RwLock<HashMap<String, Arc<dyn Instantiator>>>>,
    by_tag: Arc<RwLock<HashMap<String, Arc<dyn Instantiator>>>>,
}

impl Default for InstantiatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstantiatorRegistry {
    pub fn new() -> Self {
        Self {
            by_name: Arc::new(RwLock::new(HashMap::new())),
            by_tag: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A registry pre-populated with the three built-in handlers
    /// (`Tensor`, storage, `OrderedDict`).
    pub fn with_default_handlers() -> Self {
        let registry = Self::new();
        registry.register_default_handlers();
        registry
    }

    pub fn register_default_handlers(&self) {
        self.add(
            "torch._utils._rebuild_tensor_v2",
            "Tensor",
            Arc::new(TensorReconstructor),
        );
        for (fqcn, tag, dtype) in STORAGE_CLASSES {
            self.add(*fqcn, *tag, Arc::new(StorageHandler { dtype: *dtype }));
        }
        self.add(
            "collections.OrderedDict",
            "OrderedDict",
            Arc::new(OrderedDictHandler),
        );
    }

    /// Register `handler` under both a fully-qualified class name (used by
    /// `create`) and the type tag it stamps its objects with (used by
    /// `initialize`).
    pub fn add(
        &self,
        fully_qualified_name: impl Into<String>,
        type_tag: impl Into<String>,
        handler: Arc<dyn Instantiator>,
    ) {
        let tag = type_tag.into();
        self.by_name
            .write()
            .unwrap()
            .insert(fully_qualified_name.into(), handler.clone());
        self.by_tag.write().unwrap().insert(tag, handler);
    }

    /// Resolve a `module.class` reference, or `None` if nothing is
    /// registered for it.
    pub fn create(&self, fully_qualified_name: &str) -> Option<Value> {
        self.by_name
            .read()
            .unwrap()
            .get(fully_qualified_name)
            .map(|h| h.create())
    }

    /// Hydrate `object` (previously produced by `create`) with `arguments`,
    /// dispatched by `tag`. Fails with `ClassCouldNotBeInstantiated` if no
    /// handler is registered for that tag.
    pub fn initialize(&self, tag: &str, object: Value, arguments: Value) -> Result<Value> {
        let handler = self
            .by_tag
            .read()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or(PickleError::ClassCouldNotBeInstantiated)?;
        handler.initialize(object, arguments)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.by_tag.read().unwrap().contains_key(tag)
    }
}

/// The closed set of tensor-storage element types, and their byte width on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
    Complex64,
    Complex128,
}

impl ElementType {
    pub fn byte_width(self) -> usize {
        match self {
            ElementType::F64 | ElementType::I64 | ElementType::Complex64 => 8,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 | ElementType::BF16 | ElementType::I16 => 2,
            ElementType::I8 | ElementType::U8 | ElementType::Bool => 1,
            ElementType::Complex128 => 16,
        }
    }
}

const STORAGE_CLASSES: &[(&str, &str, ElementType)] = &[
    ("torch.DoubleStorage", "DoubleStorage", ElementType::F64),
    ("torch.FloatStorage", "FloatStorage", ElementType::F32),
    ("torch.HalfStorage", "HalfStorage", ElementType::F16),
    ("torch.BFloat16Storage", "BFloat16Storage", ElementType::BF16),
    ("torch.LongStorage", "LongStorage", ElementType::I64),
    ("torch.IntStorage", "IntStorage", ElementType::I32),
    ("torch.ShortStorage", "ShortStorage", ElementType::I16),
    ("torch.CharStorage", "CharStorage", ElementType::I8),
    ("torch.ByteStorage", "ByteStorage", ElementType::U8),
    ("torch.BoolStorage", "BoolStorage", ElementType::Bool),
    (
        "torch.CompleteFloatStorage",
        "CompleteFloatStorage",
        ElementType::Complex64,
    ),
];

/// Maps a storage class tag (as produced by `StorageHandler::create`, or
/// set directly by the archive-side persistent-load collaborator) to its
/// element type.
pub fn element_type_for_tag(tag: &str) -> Option<ElementType> {
    STORAGE_CLASSES
        .iter()
        .find(|(_, t, _)| *t == tag)
        .map(|(_, _, dtype)| *dtype)
}

/// A reconstructed dense tensor: raw little-endian element bytes plus the
/// shape/stride/dtype needed to interpret them. Stands in for whatever
/// numerical array type a real integration would hand these bytes to
/// (`ndarray`, `tch`, `candle`, ...) — this crate's Non-goals exclude
/// tensor math, only reconstruction.
#[derive(Clone)]
pub struct HostTensor {
    pub bytes: Rc<[u8]>,
    pub shape: Vec<i64>,
    pub stride: Vec<i64>,
    pub dtype: ElementType,
}

impl HostTensor {
    pub fn numel(&self) -> i64 {
        self.shape.iter().product()
    }
}

struct TensorReconstructor;

impl Instantiator for TensorReconstructor {
    fn create(&self) -> Value {
        Value::Object(ObjectValue::new("Tensor", Rc::new(())))
    }

    fn initialize(&self, _object: Value, arguments: Value) -> Result<Value> {
        let args = arguments.as_tuple().ok_or_else(|| {
            PickleError::Malformed("tensor reconstruction arguments must be a tuple".into())
        })?;
        let [storage, storage_offset, shape, stride, ..] = args else {
            return Err(PickleError::Malformed(
                "tensor reconstruction requires (storage, offset, shape, stride, ...)".into(),
            ));
        };
        let storage_obj = storage.as_object().ok_or_else(|| {
            PickleError::Malformed("tensor reconstruction arg 0 must be a storage object".into())
        })?;
        let dtype = element_type_for_tag(&storage_obj.type_tag).ok_or_else(|| {
            PickleError::Malformed(format!(
                "unrecognized storage type tag: {}",
                storage_obj.type_tag
            ))
        })?;
        let storage_bytes = storage_obj
            .downcast_ref::<Vec<u8>>()
            .ok_or_else(|| PickleError::Malformed("storage object has no byte payload".into()))?;

        let offset = storage_offset.as_int().unwrap_or(0) as usize;
        let shape: Vec<i64> = values_to_ints(shape)?;
        let stride: Vec<i64> = values_to_ints(stride)?;
        let width = dtype.byte_width();
        let numel: i64 = shape.iter().product();
        let start = offset
            .checked_mul(width)
            .ok_or(PickleError::ExceedsMaxSize)?;
        let len = (numel as usize)
            .checked_mul(width)
            .ok_or(PickleError::ExceedsMaxSize)?;
        let end = start.checked_add(len).ok_or(PickleError::ExceedsMaxSize)?;
        if end > storage_bytes.len() {
            return Err(PickleError::Malformed(
                "tensor view extends past the end of its storage".into(),
            ));
        }
        let bytes: Rc<[u8]> = Rc::from(&storage_bytes[start..end]);

        Ok(Value::Object(ObjectValue::new(
            "Tensor",
            Rc::new(HostTensor {
                bytes,
                shape,
                stride,
                dtype,
            }),
        )))
    }
}

fn values_to_ints(value: &Value) -> Result<Vec<i64>> {
    let items = value
        .as_tuple()
        .map(|t| t.to_vec())
        .or_else(|| value.as_list().map(|l| l.borrow().clone()))
        .ok_or_else(|| PickleError::Malformed("expected a tuple or list of integers".into()))?;
    items
        .iter()
        .map(|v| {
            v.as_int()
                .map(|i| i as i64)
                .ok_or_else(|| PickleError::Malformed("expected an integer".into()))
        })
        .collect()
}

struct StorageHandler {
    dtype: ElementType,
}

impl Instantiator for StorageHandler {
    fn create(&self) -> Value {
        let tag = STORAGE_CLASSES
            .iter()
            .find(|(_, _, d)| *d == self.dtype)
            .map(|(_, tag, _)| *tag)
            .unwrap_or("Storage");
        Value::Object(ObjectValue::new(tag, Rc::new(Vec::<u8>::new())))
    }

    fn initialize(&self, object: Value, _arguments: Value) -> Result<Value> {
        // Storages are populated by the archive-side persistent-load
        // collaborator, never by construction arguments.
        Ok(object)
    }
}

struct OrderedDictHandler;

impl Instantiator for OrderedDictHandler {
    fn create(&self) -> Value {
        Value::Object(ObjectValue::new("OrderedDict", Rc::new(())))
    }

    fn initialize(&self, _object: Value, arguments: Value) -> Result<Value> {
        let args = arguments.as_tuple().ok_or_else(|| {
            PickleError::Malformed("OrderedDict reduction arguments must be a tuple".into())
        })?;
        let mut map = crate::value::ValueMap::new();
        if let Some(pairs) = args.first() {
            let items = pairs
                .as_tuple()
                .map(|t| t.to_vec())
                .or_else(|| pairs.as_list().map(|l| l.borrow().clone()))
                .unwrap_or_default();
            for item in items {
                let pair = item.as_tuple().ok_or_else(|| {
                    PickleError::Malformed("OrderedDict item must be a 2-tuple".into())
                })?;
                let [k, v] = pair else {
                    return Err(PickleError::Malformed(
                        "OrderedDict item must be a 2-tuple".into(),
                    ));
                };
                map.insert(k.clone().into_key()?, v.clone());
            }
        }
        Ok(Value::dict(map))
    }
}
