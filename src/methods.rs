//! Built-in methods callable as `receiver.name(args)`.

use indexmap::IndexMap;

use crate::error::Error;
use crate::eval::{self, values_equal};
use crate::path::Path;
use crate::value::Value;

/// Call `method` on `receiver`. `site` names the node for diagnostics.
pub(crate) fn invoke(
    site: &Path,
    receiver: &Value,
    method: &str,
    args: &[Value],
) -> Result<Value, Error> {
    let call = Call {
        site,
        receiver,
        method,
        args,
    };
    if method == "to_str" && args.is_empty() {
        return Ok(Value::String(receiver.to_text()));
    }
    match receiver {
        Value::Int(n) => call.on_int(*n),
        Value::Float(f) => call.on_float(*f),
        Value::String(s) => call.on_string(s),
        Value::Array(items) => call.on_array(items),
        Value::Map(map) => call.on_map(map),
        Value::Bool(_) | Value::None => Err(call.unknown()),
    }
}

struct Call<'a> {
    site: &'a Path,
    receiver: &'a Value,
    method: &'a str,
    args: &'a [Value],
}

impl<'a> Call<'a> {
    fn unknown(&self) -> Error {
        Error::UnknownMethod {
            path: self.site.clone(),
            receiver: self.receiver.kind(),
            method: self.method.to_string(),
            arity: self.args.len(),
        }
    }

    fn arithmetic(&self, message: &str) -> Error {
        Error::Arithmetic {
            path: self.site.clone(),
            message: format!("`{}`: {}", self.method, message),
        }
    }

    fn number_arg(&self, index: usize) -> Result<f64, Error> {
        match &self.args[index] {
            Value::Int(n) => Ok(*n as f64),
            Value::Float(f) => Ok(*f),
            other => Err(Error::type_mismatch(self.site, "number", other.kind())),
        }
    }

    fn int_arg(&self, index: usize) -> Result<i64, Error> {
        match &self.args[index] {
            Value::Int(n) => Ok(*n),
            other => Err(Error::type_mismatch(self.site, "int", other.kind())),
        }
    }

    fn str_arg(&self, index: usize) -> Result<&'a str, Error> {
        let args: &'a [Value] = self.args;
        match &args[index] {
            Value::String(s) => Ok(s),
            other => Err(Error::type_mismatch(self.site, "string", other.kind())),
        }
    }

    fn float_to_int(&self, f: f64) -> Result<Value, Error> {
        if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            Ok(Value::Int(f as i64))
        } else {
            Err(self.arithmetic("value does not fit in an int"))
        }
    }

    fn on_int(&self, n: i64) -> Result<Value, Error> {
        match (self.method, self.args.len()) {
            ("abs", 0) => n
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| self.arithmetic("integer overflow")),
            ("to_float", 0) => Ok(Value::Float(n as f64)),
            ("to_int", 0) => Ok(Value::Int(n)),
            ("is_negative", 0) => Ok(Value::Bool(n < 0)),
            ("is_positive", 0) => Ok(Value::Bool(n > 0)),
            ("signum", 0) => Ok(Value::Int(n.signum())),
            ("min" | "max", 1) if matches!(self.args[0], Value::Int(_)) => {
                let other = self.int_arg(0)?;
                Ok(Value::Int(if self.method == "min" {
                    n.min(other)
                } else {
                    n.max(other)
                }))
            }
            ("pow", 1) if matches!(self.args[0], Value::Int(_)) => {
                let exp = self.int_arg(0)?;
                u32::try_from(exp)
                    .ok()
                    .and_then(|exp| n.checked_pow(exp))
                    .map(Value::Int)
                    .ok_or_else(|| self.arithmetic("exponent out of range"))
            }
            _ => self.on_float(n as f64),
        }
    }

    fn on_float(&self, f: f64) -> Result<Value, Error> {
        let unary = match self.method {
            "abs" => Some(f.abs()),
            "ceil" => Some(f.ceil()),
            "floor" => Some(f.floor()),
            "round" => Some(f.round()),
            "trunc" => Some(f.trunc()),
            "fract" => Some(f.fract()),
            "sqrt" => Some(f.sqrt()),
            "cbrt" => Some(f.cbrt()),
            "exp" => Some(f.exp()),
            "ln" => Some(f.ln()),
            "sin" => Some(f.sin()),
            "cos" => Some(f.cos()),
            "tan" => Some(f.tan()),
            "signum" => Some(f.signum()),
            "to_degrees" => Some(f.to_degrees()),
            "to_radians" => Some(f.to_radians()),
            "to_float" => Some(f),
            _ => None,
        };
        if let (Some(result), 0) = (unary, self.args.len()) {
            return Ok(Value::Float(result));
        }

        match (self.method, self.args.len()) {
            ("is_nan", 0) => Ok(Value::Bool(f.is_nan())),
            ("is_finite", 0) => Ok(Value::Bool(f.is_finite())),
            ("is_infinite", 0) => Ok(Value::Bool(f.is_infinite())),
            ("is_negative", 0) => Ok(Value::Bool(f.is_sign_negative())),
            ("is_positive", 0) => Ok(Value::Bool(f.is_sign_positive())),
            ("to_int" | "trunci", 0) => self.float_to_int(f.trunc()),
            ("ceili", 0) => self.float_to_int(f.ceil()),
            ("floori", 0) => self.float_to_int(f.floor()),
            ("roundi", 0) => self.float_to_int(f.round()),
            ("to_quantified", 0) => Ok(Value::String(quantified(f))),
            ("pow", 1) => Ok(Value::Float(f.powf(self.number_arg(0)?))),
            ("log", 1) => Ok(Value::Float(f.log(self.number_arg(0)?))),
            ("hypot", 1) => Ok(Value::Float(f.hypot(self.number_arg(0)?))),
            ("min", 1) => Ok(Value::Float(f.min(self.number_arg(0)?))),
            ("max", 1) => Ok(Value::Float(f.max(self.number_arg(0)?))),
            _ => Err(self.unknown()),
        }
    }

    fn on_string(&self, s: &str) -> Result<Value, Error> {
        match (self.method, self.args.len()) {
            ("len", 0) => Ok(Value::Int(s.chars().count() as i64)),
            ("is_empty", 0) => Ok(Value::Bool(s.is_empty())),
            ("to_uppercase", 0) => Ok(Value::String(s.to_uppercase())),
            ("to_lowercase", 0) => Ok(Value::String(s.to_lowercase())),
            ("trim", 0) => Ok(Value::String(s.trim().to_string())),
            ("trim_start", 0) => Ok(Value::String(s.trim_start().to_string())),
            ("trim_end", 0) => Ok(Value::String(s.trim_end().to_string())),
            ("to_int", 0) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| self.arithmetic(&format!("`{}` is not an int", s))),
            ("to_float", 0) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.arithmetic(&format!("`{}` is not a float", s))),
            ("contains", 1) => Ok(Value::Bool(s.contains(self.str_arg(0)?))),
            ("starts_with", 1) => Ok(Value::Bool(s.starts_with(self.str_arg(0)?))),
            ("ends_with", 1) => Ok(Value::Bool(s.ends_with(self.str_arg(0)?))),
            ("split", 1) => Ok(Value::Array(
                s.split(self.str_arg(0)?)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            ("repeat", 1) => eval::repeat(s, self.int_arg(0)?, self.site),
            ("replace", 2) => Ok(Value::String(s.replace(self.str_arg(0)?, self.str_arg(1)?))),
            _ => Err(self.unknown()),
        }
    }

    fn on_array(&self, items: &[Value]) -> Result<Value, Error> {
        match (self.method, self.args.len()) {
            ("len", 0) => Ok(Value::Int(items.len() as i64)),
            ("is_empty", 0) => Ok(Value::Bool(items.is_empty())),
            ("first", 0) => Ok(items.first().cloned().unwrap_or_default()),
            ("last", 0) => Ok(items.last().cloned().unwrap_or_default()),
            ("reverse", 0) => Ok(Value::Array(items.iter().rev().cloned().collect())),
            ("contains", 1) => Ok(Value::Bool(
                items.iter().any(|item| values_equal(item, &self.args[0])),
            )),
            ("join", 1) => {
                let separator = self.str_arg(0)?;
                let parts: Vec<String> = items.iter().map(Value::to_text).collect();
                Ok(Value::String(parts.join(separator)))
            }
            _ => Err(self.unknown()),
        }
    }

    fn on_map(&self, map: &IndexMap<String, Value>) -> Result<Value, Error> {
        match (self.method, self.args.len()) {
            ("len", 0) => Ok(Value::Int(map.len() as i64)),
            ("is_empty", 0) => Ok(Value::Bool(map.is_empty())),
            ("keys", 0) => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            ("values", 0) => Ok(Value::Array(map.values().cloned().collect())),
            ("contains_key", 1) => Ok(Value::Bool(map.contains_key(self.str_arg(0)?))),
            _ => Err(self.unknown()),
        }
    }
}

/// Byte count with a binary unit, e.g. `1.5 KB`.
fn quantified(bytes: f64) -> String {
    const UNIT: f64 = 1024.0;
    let units = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    for unit in units {
        if value.abs() <= UNIT {
            return format!("{} {}", value, unit);
        }
        value /= UNIT;
    }
    format!("{} TB", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kind;

    fn call(receiver: Value, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        invoke(&Path::root(), &receiver, method, &args)
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(
            call("Hello".into(), "to_uppercase", vec![]).unwrap(),
            Value::from("HELLO")
        );
        assert_eq!(call("héllo".into(), "len", vec![]).unwrap(), Value::Int(5));
        assert_eq!(
            call("a,b".into(), "split", vec![",".into()]).unwrap(),
            Value::Array(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_int_falls_back_to_float_methods() {
        assert_eq!(call(Value::Int(16), "sqrt", vec![]).unwrap(), Value::Float(4.0));
        assert_eq!(
            call(Value::Int(2), "pow", vec![Value::Int(10)]).unwrap(),
            Value::Int(1024)
        );
    }

    #[test]
    fn test_quantified() {
        assert_eq!(
            call(Value::Int(1536), "to_quantified", vec![]).unwrap(),
            Value::from("1.5 KB")
        );
    }

    #[test]
    fn test_repeat_is_bounded() {
        assert_eq!(
            call("ab".into(), "repeat", vec![Value::Int(3)]).unwrap(),
            Value::from("ababab")
        );
        for count in [i64::MAX, -1, (eval::MAX_REPEAT_LEN as i64) / 2 + 1] {
            let err = call("ab".into(), "repeat", vec![Value::Int(count)]).unwrap_err();
            assert!(matches!(err, Error::Arithmetic { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_unknown_method_reports_arity() {
        match call(Value::Bool(true), "len", vec![]) {
            Err(Error::UnknownMethod {
                receiver, arity, ..
            }) => {
                assert_eq!(receiver, Kind::Bool);
                assert_eq!(arity, 0);
            }
            other => panic!("expected unknown method, got {:?}", other),
        }
    }
}
