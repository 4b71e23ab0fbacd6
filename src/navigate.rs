//! Path-addressed queries and updates on evaluated values.

use crate::error::{Error, PathErrorReason};
use crate::path::{Node, Path, Segment};
use crate::value::{Kind, Scalar, Value};

impl Node for Value {
    fn child(&self, segment: &Segment) -> Result<&Self, PathErrorReason> {
        match (self, segment) {
            (Value::Map(map), Segment::Field(name)) => {
                map.get(name).ok_or(PathErrorReason::MissingField)
            }
            (Value::Array(items), Segment::Index(index)) => items
                .get(*index)
                .ok_or(PathErrorReason::IndexOutOfRange { len: items.len() }),
            (other, _) => Err(PathErrorReason::KindMismatch {
                found: other.kind().name(),
            }),
        }
    }

    fn child_mut(&mut self, segment: &Segment) -> Result<&mut Self, PathErrorReason> {
        match (self, segment) {
            (Value::Map(map), Segment::Field(name)) => {
                map.get_mut(name).ok_or(PathErrorReason::MissingField)
            }
            (Value::Array(items), Segment::Index(index)) => {
                let len = items.len();
                items
                    .get_mut(*index)
                    .ok_or(PathErrorReason::IndexOutOfRange { len })
            }
            (other, _) => Err(PathErrorReason::KindMismatch {
                found: other.kind().name(),
            }),
        }
    }
}

impl Value {
    pub fn get(&self, path: &Path) -> Result<&Value, Error> {
        Ok(path.resolve(self)?)
    }

    pub fn get_mut(&mut self, path: &Path) -> Result<&mut Value, Error> {
        Ok(path.resolve_mut(self)?)
    }

    pub fn kind_at(&self, path: &Path) -> Result<Kind, Error> {
        Ok(self.get(path)?.kind())
    }

    /// True for an explicit null and for a path that does not resolve.
    pub fn is_none(&self, path: &Path) -> bool {
        matches!(path.resolve(self), Ok(Value::None) | Err(_))
    }

    pub fn is_bool(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.kind_at(path)? == Kind::Bool)
    }

    pub fn is_int(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.kind_at(path)? == Kind::Int)
    }

    pub fn is_float(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.kind_at(path)? == Kind::Float)
    }

    pub fn is_string(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.kind_at(path)? == Kind::String)
    }

    pub fn is_array(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.kind_at(path)? == Kind::Array)
    }

    pub fn is_map(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.kind_at(path)? == Kind::Map)
    }

    pub fn as_bool(&self, path: &Path) -> Result<bool, Error> {
        match self.get(path)? {
            Value::Bool(b) => Ok(*b),
            other => Err(Error::type_mismatch(path, "bool", other.kind())),
        }
    }

    pub fn as_int(&self, path: &Path) -> Result<i64, Error> {
        match self.get(path)? {
            Value::Int(n) => Ok(*n),
            other => Err(Error::type_mismatch(path, "int", other.kind())),
        }
    }

    /// Floats only: an int is a type error, not a silent conversion.
    pub fn as_float(&self, path: &Path) -> Result<f64, Error> {
        match self.get(path)? {
            Value::Float(f) => Ok(*f),
            other => Err(Error::type_mismatch(path, "float", other.kind())),
        }
    }

    pub fn as_string(&self, path: &Path) -> Result<&str, Error> {
        match self.get(path)? {
            Value::String(s) => Ok(s),
            other => Err(Error::type_mismatch(path, "string", other.kind())),
        }
    }

    pub fn array_len(&self, path: &Path) -> Result<usize, Error> {
        match self.get(path)? {
            Value::Array(items) => Ok(items.len()),
            other => Err(Error::type_mismatch(path, "array", other.kind())),
        }
    }

    pub fn map_len(&self, path: &Path) -> Result<usize, Error> {
        match self.get(path)? {
            Value::Map(map) => Ok(map.len()),
            other => Err(Error::type_mismatch(path, "map", other.kind())),
        }
    }

    /// Keys in insertion order.
    pub fn map_keys(&self, path: &Path) -> Result<Vec<&str>, Error> {
        match self.get(path)? {
            Value::Map(map) => Ok(map.keys().map(String::as_str).collect()),
            other => Err(Error::type_mismatch(path, "map", other.kind())),
        }
    }

    /// Replace the value at an existing path. The empty path replaces `self`.
    pub fn set(&mut self, path: &Path, value: impl Into<Scalar>) -> Result<(), Error> {
        let value = Value::from(value.into());
        tracing::debug!(path = %path, kind = %value.kind(), "setting value");
        *self.get_mut(path)? = value;
        Ok(())
    }

    pub fn set_none(&mut self, path: &Path) -> Result<(), Error> {
        self.set(path, Scalar::None)
    }

    pub fn set_bool(&mut self, path: &Path, value: bool) -> Result<(), Error> {
        self.set(path, value)
    }

    pub fn set_int(&mut self, path: &Path, value: i64) -> Result<(), Error> {
        self.set(path, value)
    }

    pub fn set_float(&mut self, path: &Path, value: f64) -> Result<(), Error> {
        self.set(path, value)
    }

    pub fn set_string(&mut self, path: &Path, value: impl Into<String>) -> Result<(), Error> {
        self.set(path, Scalar::String(value.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    fn sample() -> Value {
        map(vec![
            ("name", "api".into()),
            ("port", Value::Int(8080)),
            ("ratio", Value::Float(0.5)),
            ("tags", Value::Array(vec!["a".into(), "b".into()])),
            (
                "nested",
                map(vec![("on", Value::Bool(true)), ("off", Value::None)]),
            ),
        ])
    }

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn test_scalar_extraction() {
        let value = sample();
        assert_eq!(value.as_string(&p("name")).unwrap(), "api");
        assert_eq!(value.as_int(&p("port")).unwrap(), 8080);
        assert_eq!(value.as_float(&p("ratio")).unwrap(), 0.5);
        assert!(value.as_bool(&p("nested.on")).unwrap());
        assert_eq!(value.as_string(&p("tags[1]")).unwrap(), "b");
    }

    #[test]
    fn test_as_float_does_not_coerce_int() {
        let err = sample().as_float(&p("port")).unwrap_err();
        assert_eq!(err, Error::type_mismatch(&p("port"), "float", Kind::Int));
    }

    #[test]
    fn test_is_none_on_missing_path() {
        let value = sample();
        assert!(value.is_none(&p("nested.off")));
        assert!(value.is_none(&p("nested.absent")));
        assert!(!value.is_none(&p("nested.on")));
        assert!(value.is_int(&p("nested.absent")).is_err());
    }

    #[test]
    fn test_lengths_and_keys() {
        let value = sample();
        assert_eq!(value.array_len(&p("tags")).unwrap(), 2);
        assert_eq!(value.map_len(&p("nested")).unwrap(), 2);
        assert_eq!(
            value.map_keys(&p("")).unwrap(),
            vec!["name", "port", "ratio", "tags", "nested"]
        );
        assert!(matches!(value.map_len(&p("tags")), Err(Error::Type { .. })));
    }

    #[test]
    fn test_set_requires_existing_path() {
        let mut value = sample();
        value.set_string(&p("tags[0]"), "z").unwrap();
        assert_eq!(value.as_string(&p("tags[0]")).unwrap(), "z");
        assert!(matches!(value.set_int(&p("tags[5]"), 1), Err(Error::Path(_))));
        value.set_none(&p("")).unwrap();
        assert_eq!(value, Value::None);
    }
}
