//! Generation-checked registry of objects handed across the C boundary.
//!
//! Every object lives in a slot; a handle packs the slot index and the slot's
//! generation at allocation time. Releasing bumps the generation, so a stale
//! handle (double release, use after release) is detected instead of
//! touching freed memory.

use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;

use crate::error::{Error, ErrorKind};
use crate::expr::ExprTree;
use crate::path::Path;
use crate::value::{Kind, Scalar, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("handle {0:#x} was already released")]
    Released(u64),
    #[error("handle {handle:#x} refers to {found}, expected {expected}")]
    WrongKind {
        handle: u64,
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown handle {0:#x}")]
    Unknown(u64),
}

/// Anything the registry can hold.
pub trait Stored: Sized {
    const NAME: &'static str;
    fn wrap(self) -> Object;
    fn peek(object: &Object) -> Option<&Self>;
    fn peek_mut(object: &mut Object) -> Option<&mut Self>;
    fn unwrap(object: Object) -> Option<Self>;
}

#[derive(Debug)]
pub enum Object {
    Expr(ExprTree),
    Value(Value),
    Str(CString),
    StrList(Vec<CString>),
    Error(Error),
}

impl Object {
    fn name(&self) -> &'static str {
        match self {
            Object::Expr(_) => ExprTree::NAME,
            Object::Value(_) => Value::NAME,
            Object::Str(_) => CString::NAME,
            Object::StrList(_) => <Vec<CString>>::NAME,
            Object::Error(_) => Error::NAME,
        }
    }
}

macro_rules! stored {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl Stored for $ty {
            const NAME: &'static str = $name;

            fn wrap(self) -> Object {
                Object::$variant(self)
            }

            fn peek(object: &Object) -> Option<&Self> {
                match object {
                    Object::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn peek_mut(object: &mut Object) -> Option<&mut Self> {
                match object {
                    Object::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn unwrap(object: Object) -> Option<Self> {
                match object {
                    Object::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

stored!(ExprTree, Expr, "an expression");
stored!(Value, Value, "a value");
stored!(CString, Str, "a string");
stored!(Vec<CString>, StrList, "a string list");
stored!(Error, Error, "an error");

/// A typed handle. The raw form is never zero.
pub struct Handle<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

pub type ExprHandle = Handle<ExprTree>;
pub type ValueHandle = Handle<Value>;
pub type StrHandle = Handle<CString>;
pub type StrListHandle = Handle<Vec<CString>>;
pub type ErrorHandle = Handle<Error>;

impl<T> Handle<T> {
    pub fn from_raw(raw: u64) -> Self {
        Handle {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn into_raw(self) -> u64 {
        self.raw
    }

    fn new(index: usize, generation: u32) -> Self {
        Handle::from_raw((u64::from(generation) << 32) | (index as u64 + 1))
    }

    fn decode(&self) -> Option<(usize, u32)> {
        let low = self.raw & 0xffff_ffff;
        if low == 0 {
            return None;
        }
        Some(((low - 1) as usize, (self.raw >> 32) as u32))
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T: Stored> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({:#x})", T::NAME, self.raw)
    }
}

struct Slot {
    generation: u32,
    object: Option<Object>,
}

/// Owner of everything referenced by live handles.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.object.is_some()).count()
    }

    pub fn insert<T: Stored>(&mut self, object: T) -> Handle<T> {
        let object = object.wrap();
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.object = Some(object);
                Handle::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                Handle::new(self.slots.len() - 1, 0)
            }
        };
        tracing::trace!(handle = handle.raw, kind = T::NAME, "allocated");
        handle
    }

    fn slot<T>(&self, handle: Handle<T>) -> Result<&Slot, HandleError> {
        let (index, generation) = handle.decode().ok_or(HandleError::Unknown(handle.raw))?;
        let slot = self
            .slots
            .get(index)
            .ok_or(HandleError::Unknown(handle.raw))?;
        check_generation(slot, generation, handle.raw)?;
        Ok(slot)
    }

    fn slot_mut<T>(&mut self, handle: Handle<T>) -> Result<&mut Slot, HandleError> {
        let (index, generation) = handle.decode().ok_or(HandleError::Unknown(handle.raw))?;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(HandleError::Unknown(handle.raw))?;
        check_generation(slot, generation, handle.raw)?;
        Ok(slot)
    }

    pub fn get<T: Stored>(&self, handle: Handle<T>) -> Result<&T, HandleError> {
        let object = self
            .slot(handle)?
            .object
            .as_ref()
            .ok_or(HandleError::Released(handle.raw))?;
        T::peek(object).ok_or_else(|| wrong_kind::<T>(handle.raw, object))
    }

    pub fn get_mut<T: Stored>(&mut self, handle: Handle<T>) -> Result<&mut T, HandleError> {
        let object = self
            .slot_mut(handle)?
            .object
            .as_mut()
            .ok_or(HandleError::Released(handle.raw))?;
        if T::peek(object).is_none() {
            return Err(wrong_kind::<T>(handle.raw, object));
        }
        T::peek_mut(object).ok_or(HandleError::Unknown(handle.raw))
    }

    /// Free the slot and hand the object back. A handle of the wrong kind
    /// leaves the slot untouched.
    pub fn release<T: Stored>(&mut self, handle: Handle<T>) -> Result<T, HandleError> {
        self.get(handle)?;
        let (index, _) = handle.decode().ok_or(HandleError::Unknown(handle.raw))?;
        let slot = &mut self.slots[index];
        let object = slot.object.take().ok_or(HandleError::Released(handle.raw))?;
        if slot.generation == u32::MAX {
            // Reusing the slot would bring old handles back to life.
            tracing::debug!(handle = handle.raw, "retiring slot with exhausted generations");
        } else {
            slot.generation += 1;
            self.free.push(index);
        }
        tracing::trace!(handle = handle.raw, kind = T::NAME, "released");
        T::unwrap(object).ok_or(HandleError::Unknown(handle.raw))
    }

    // ── Operations behind the C boundary ────────────────────────────
    //
    // Each fallible operation yields either its result or a freshly
    // allocated error handle.

    fn fail<R>(&mut self, result: Result<R, Error>) -> Result<R, ErrorHandle> {
        result.map_err(|err| self.insert(err))
    }

    fn store_str(&mut self, s: &str) -> Result<StrHandle, ErrorHandle> {
        let owned = CString::new(s)
            .map_err(|_| Error::Boundary("string contains an interior NUL byte".to_string()));
        let owned = self.fail(owned)?;
        Ok(self.insert(owned))
    }

    pub fn parse(&mut self, source: &str) -> Result<ExprHandle, ErrorHandle> {
        let tree = self.fail(ExprTree::parse(source))?;
        Ok(self.insert(tree))
    }

    pub fn override_expr(
        &mut self,
        expr: ExprHandle,
        path: &str,
        value: Scalar,
    ) -> Result<(), ErrorHandle> {
        let result = Path::parse(path).and_then(|path| {
            self.get_mut(expr)?.override_value(&path, value)
        });
        self.fail(result)
    }

    pub fn evaluate(&mut self, expr: ExprHandle, path: &str) -> Result<ValueHandle, ErrorHandle> {
        let result = Path::parse(path).and_then(|path| self.get(expr)?.evaluate(&path));
        let value = self.fail(result)?;
        Ok(self.insert(value))
    }

    fn query<R>(
        &mut self,
        value: ValueHandle,
        path: &str,
        f: impl FnOnce(&Value, &Path) -> Result<R, Error>,
    ) -> Result<R, ErrorHandle> {
        let result = Path::parse(path).and_then(|path| f(self.get(value)?, &path));
        self.fail(result)
    }

    /// A missing path is `true`; only handle and path-syntax problems fail.
    pub fn is_none(&mut self, value: ValueHandle, path: &str) -> Result<bool, ErrorHandle> {
        self.query(value, path, |v, p| Ok(v.is_none(p)))
    }

    pub fn kind_at(&mut self, value: ValueHandle, path: &str) -> Result<Kind, ErrorHandle> {
        self.query(value, path, Value::kind_at)
    }

    pub fn as_bool(&mut self, value: ValueHandle, path: &str) -> Result<bool, ErrorHandle> {
        self.query(value, path, Value::as_bool)
    }

    pub fn as_int(&mut self, value: ValueHandle, path: &str) -> Result<i64, ErrorHandle> {
        self.query(value, path, Value::as_int)
    }

    pub fn as_float(&mut self, value: ValueHandle, path: &str) -> Result<f64, ErrorHandle> {
        self.query(value, path, Value::as_float)
    }

    pub fn as_str(&mut self, value: ValueHandle, path: &str) -> Result<StrHandle, ErrorHandle> {
        let s = self.query(value, path, |v, p| v.as_string(p).map(str::to_string))?;
        self.store_str(&s)
    }

    pub fn array_len(&mut self, value: ValueHandle, path: &str) -> Result<usize, ErrorHandle> {
        self.query(value, path, Value::array_len)
    }

    pub fn map_len(&mut self, value: ValueHandle, path: &str) -> Result<usize, ErrorHandle> {
        self.query(value, path, Value::map_len)
    }

    pub fn map_keys(&mut self, value: ValueHandle, path: &str) -> Result<StrListHandle, ErrorHandle> {
        let keys = self.query(value, path, |v, p| {
            v.map_keys(p)?
                .into_iter()
                .map(|key| {
                    CString::new(key).map_err(|_| {
                        Error::Boundary(format!("key `{}` contains a NUL byte", key.escape_debug()))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;
        Ok(self.insert(keys))
    }

    pub fn set_value(
        &mut self,
        value: ValueHandle,
        path: &str,
        scalar: Scalar,
    ) -> Result<(), ErrorHandle> {
        let result = Path::parse(path).and_then(|path| self.get_mut(value)?.set(&path, scalar));
        self.fail(result)
    }

    pub fn str_list_len(&mut self, list: StrListHandle) -> Result<usize, ErrorHandle> {
        let result = self.get(list).map(Vec::len).map_err(Error::from);
        self.fail(result)
    }

    pub fn str_list_get(&mut self, list: StrListHandle, index: usize) -> Result<StrHandle, ErrorHandle> {
        let result = self.get(list).map_err(Error::from).and_then(|items| {
            items.get(index).cloned().ok_or_else(|| {
                Error::Boundary(format!(
                    "index {} out of range for a list of {}",
                    index,
                    items.len()
                ))
            })
        });
        let item = self.fail(result)?;
        Ok(self.insert(item))
    }

    pub fn error_kind(&self, error: ErrorHandle) -> Result<ErrorKind, HandleError> {
        self.get(error).map(Error::kind)
    }

    pub fn error_message(&mut self, error: ErrorHandle) -> Result<StrHandle, ErrorHandle> {
        let result = self.get(error).map(|err| err.to_string()).map_err(Error::from);
        let message = self.fail(result)?;
        self.store_str(&message)
    }
}

fn check_generation(slot: &Slot, generation: u32, raw: u64) -> Result<(), HandleError> {
    if generation == slot.generation {
        Ok(())
    } else if generation < slot.generation {
        tracing::warn!(handle = raw, "stale handle used");
        Err(HandleError::Released(raw))
    } else {
        Err(HandleError::Unknown(raw))
    }
}

fn wrong_kind<T: Stored>(raw: u64, found: &Object) -> HandleError {
    HandleError::WrongKind {
        handle: raw,
        expected: T::NAME,
        found: found.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_then_use_is_rejected() {
        let mut registry = Registry::new();
        let handle = registry.insert(Value::Int(1));
        assert_eq!(registry.release(handle).unwrap(), Value::Int(1));
        assert_eq!(
            registry.release(handle).unwrap_err(),
            HandleError::Released(handle.into_raw())
        );
        assert!(matches!(registry.get(handle), Err(HandleError::Released(_))));
    }

    #[test]
    fn test_reused_slot_keeps_old_handle_stale() {
        let mut registry = Registry::new();
        let first = registry.insert(Value::Int(1));
        registry.release(first).unwrap();
        let second = registry.insert(Value::Int(2));
        assert_ne!(first, second);
        assert_eq!(registry.get(second).unwrap(), &Value::Int(2));
        assert!(matches!(registry.get(first), Err(HandleError::Released(_))));
        assert_eq!(registry.live(), 1);
    }

    #[test]
    fn test_wrong_kind_leaves_object_alive() {
        let mut registry = Registry::new();
        let value = registry.insert(Value::Bool(true));
        let as_expr: ExprHandle = Handle::from_raw(value.into_raw());
        assert!(matches!(
            registry.release(as_expr),
            Err(HandleError::WrongKind { .. })
        ));
        assert_eq!(registry.get(value).unwrap(), &Value::Bool(true));
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let mut registry = Registry::new();
        registry.slots.push(Slot {
            generation: u32::MAX,
            object: Some(Value::Int(1).wrap()),
        });
        let last: ValueHandle = Handle::new(0, u32::MAX);
        assert_eq!(registry.release(last).unwrap(), Value::Int(1));

        let next = registry.insert(Value::Int(2));
        assert_ne!(next.decode().map(|(index, _)| index), Some(0));
        assert_eq!(registry.get(next).unwrap(), &Value::Int(2));
        assert!(matches!(registry.get(last), Err(HandleError::Released(_))));
        assert_eq!(registry.live(), 1);
    }

    #[test]
    fn test_zero_and_foreign_handles_are_unknown() {
        let registry = Registry::new();
        let zero: ValueHandle = Handle::from_raw(0);
        let foreign: ValueHandle = Handle::from_raw(42);
        assert_eq!(registry.get(zero).unwrap_err(), HandleError::Unknown(0));
        assert_eq!(registry.get(foreign).unwrap_err(), HandleError::Unknown(42));
    }

    #[test]
    fn test_failed_operation_returns_error_handle() {
        let mut registry = Registry::new();
        let expr = registry.parse("name = \"dev\"").unwrap();
        let err = registry.evaluate(expr, "missing.path").unwrap_err();
        assert_eq!(registry.error_kind(err).unwrap(), ErrorKind::Path);
        let message = registry.error_message(err).unwrap();
        let text = registry.get(message).unwrap().to_str().unwrap();
        assert!(text.contains("missing"), "{}", text);
    }
}
