//! The per-load memo table: `PUT`/`BINPUT`/`LONG_BINPUT` record the
//! top-of-stack value under an index, `GET`/`BINGET`/`LONG_BINGET` retrieve
//! it later. Cloning the retrieved `Value` only bumps a reference count for
//! the shared-container variants, so a `GET` followed by `APPEND` mutates
//! the same object the `PUT` captured — this is how the format represents
//! shared and self-referential structure without a wire-level pointer type.
//!
//! Grounded on the teacher's `MemoHandle`, stripped of its LRU eviction and
//! hit/miss accounting: a memo table lives for exactly one `load` and the
//! format gives no eviction signal, so none of that machinery applies here.

use crate::error::{PickleError, Result};
use crate::value::Value;

#[derive(Default)]
pub struct Memo {
    slots: Vec<Option<Value>>,
}

impl Memo {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn put(&mut self, index: i64, value: Value) -> Result<()> {
        let index = usize::try_from(index).map_err(|_| PickleError::NegativeArgument)?;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(value);
        Ok(())
    }

    pub fn get(&self, index: i64) -> Result<Value> {
        let lookup = usize::try_from(index).ok().and_then(|i| self.slots.get(i));
        match lookup {
            Some(Some(value)) => Ok(value.clone()),
            _ => Err(PickleError::MemoNotFound(index)),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let mut memo = Memo::new();
        memo.put(3, Value::Int(42)).unwrap();
        assert_eq!(memo.get(3).unwrap(), Value::Int(42));
    }

    #[test]
    fn get_of_unset_slot_errors() {
        let memo = Memo::new();
        assert_eq!(memo.get(0), Err(PickleError::MemoNotFound(0)));
    }

    #[test]
    fn negative_put_index_errors() {
        let mut memo = Memo::new();
        assert_eq!(
            memo.put(-1, Value::None),
            Err(PickleError::NegativeArgument)
        );
    }

    #[test]
    fn get_shares_identity_for_mutable_containers() {
        let mut memo = Memo::new();
        let list = Value::list(vec![Value::Int(1)]);
        memo.put(0, list.clone()).unwrap();
        let retrieved = memo.get(0).unwrap();
        retrieved.as_list().unwrap().borrow_mut().push(Value::Int(2));
        assert_eq!(list.as_list().unwrap().borrow().len(), 2);
    }
}
