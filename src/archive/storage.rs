//! The five-step persistent-load contract: given a `("storage", class,
//! key, device, numel)` persistent id, assert its shape, consult a
//! per-archive cache, extract the `data/<key>` entry, byte-swap if the
//! archive's endianness disagrees with the host, and cache the result.
//!
//! Grounded on the `zip` crate for archive access and on the teacher's
//! `MemoHandle` for the cache shape (a `HashMap` behind interior
//! mutability) — no hit/miss accounting here, since the spec doesn't ask
//! for cache statistics, only that repeated keys not be re-extracted.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::rc::Rc;

use crate::archive::CheckpointArchive;
use crate::error::{PickleError, Result};
use crate::registry::element_type_for_tag;
use crate::value::{ObjectValue, Value};
use crate::vm::PersistentLoad;

/// Resolves `PERSID`/`BINPERSID` tuples shaped like PyTorch's
/// `("storage", <StorageClass>, <key>, <device>, <numel>)` against a
/// checkpoint archive.
pub struct StorageLoader<R> {
    archive: CheckpointArchive<R>,
    host_byte_order: &'static str,
    cache: HashMap<String, Rc<[u8]>>,
}

impl<R: Read + Seek> StorageLoader<R> {
    pub fn new(archive: CheckpointArchive<R>) -> Self {
        Self {
            archive,
            host_byte_order: "little",
            cache: HashMap::new(),
        }
    }

    pub fn load(&mut self, pid: &Value) -> Result<Value> {
        let tuple = pid.as_tuple().ok_or(PickleError::UnsupportedPersistentId)?;
        if tuple.len() < 5 {
            return Err(PickleError::UnsupportedPersistentId);
        }
        let tag = tuple[0].as_str().ok_or(PickleError::UnsupportedPersistentId)?;
        if tag != "storage" {
            return Err(PickleError::UnsupportedPersistentId);
        }
        let storage_class = tuple[1]
            .as_object()
            .ok_or(PickleError::UnsupportedPersistentId)?;
        let key = tuple[2].as_str().ok_or(PickleError::UnsupportedPersistentId)?;
        let numel = tuple[4].as_int().ok_or(PickleError::UnsupportedPersistentId)?;

        let dtype = element_type_for_tag(&storage_class.type_tag)
            .ok_or(PickleError::UnsupportedPersistentId)?;

        if let Some(cached) = self.cache.get(key) {
            return Ok(Value::Object(ObjectValue::new(
                storage_class.type_tag.clone(),
                Rc::new(cached.to_vec()),
            )));
        }

        let mut bytes = self.archive.storage_bytes(key)?;
        let expected_len = numel as usize * dtype.byte_width();
        if bytes.len() != expected_len {
            return Err(PickleError::Malformed(format!(
                "storage '{}' has {} bytes, expected {} for {} elements",
                key,
                bytes.len(),
                expected_len,
                numel
            )));
        }

        let archive_order = self.archive.byte_order()?.unwrap_or_else(|| "little".to_string());
        if archive_order != self.host_byte_order {
            byte_swap_in_place(&mut bytes, dtype.byte_width());
        }

        let rc: Rc<[u8]> = Rc::from(bytes.into_boxed_slice());
        self.cache.insert(key.to_string(), rc.clone());
        Ok(Value::Object(ObjectValue::new(
            storage_class.type_tag.clone(),
            Rc::new(rc.to_vec()),
        )))
    }

    /// A closure compatible with `Unpickler::set_persistent_load`.
    pub fn as_persistent_load(&mut self) -> PersistentLoad<'_> {
        Box::new(move |pid: &Value| self.load(pid))
    }
}

fn byte_swap_in_place(bytes: &mut [u8], width: usize) {
    if width <= 1 {
        return;
    }
    for chunk in bytes.chunks_mut(width) {
        chunk.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn archive_with_storage(bytes: &[u8], byteorder: &str) -> CheckpointArchive<Cursor<Vec<u8>>> {
        let mut buf = Vec::new();
        {
            let mut writer = ZipWriter::new(Cursor::new(&mut buf));
            let opts = SimpleFileOptions::default();
            writer.start_file("archive/byteorder", opts).unwrap();
            writer.write_all(byteorder.as_bytes()).unwrap();
            writer.start_file("archive/data/0", opts).unwrap();
            writer.write_all(bytes).unwrap();
            writer.finish().unwrap();
        }
        CheckpointArchive::open(Cursor::new(buf)).unwrap()
    }

    #[test]
    fn loads_and_caches_storage() {
        let archive = archive_with_storage(&[0, 0, 128, 63], "little"); // 1.0f32 LE
        let mut loader = StorageLoader::new(archive);
        let class_ref = Value::Object(ObjectValue::new("FloatStorage", Rc::new(())));
        let pid = Value::tuple(vec![
            Value::string("storage"),
            class_ref,
            Value::string("0"),
            Value::string("cpu"),
            Value::Int(1),
        ]);
        let result = loader.load(&pid).unwrap();
        let obj = result.as_object().unwrap();
        assert_eq!(obj.type_tag.as_ref(), "FloatStorage");
        assert_eq!(
            obj.downcast_ref::<Vec<u8>>().unwrap().as_slice(),
            &[0, 0, 128, 63]
        );
    }

    #[test]
    fn rejects_non_storage_pid() {
        let archive = archive_with_storage(&[0, 0, 128, 63], "little");
        let mut loader = StorageLoader::new(archive);
        let pid = Value::tuple(vec![Value::string("not-storage")]);
        assert_eq!(loader.load(&pid), Err(PickleError::UnsupportedPersistentId));
    }
}
