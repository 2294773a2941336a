//! Global template functions.

use minijinja::value::Rest;
use minijinja::{Error, ErrorKind, Value};

/// Abort rendering with a caller-supplied message.
pub fn fail(message: String) -> Result<Value, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

/// Build a map from alternating key/value arguments.
pub fn dict(args: Rest<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "dict requires an even number of arguments",
        ));
    }
    let mut map = serde_json::Map::new();
    for pair in args.chunks(2) {
        let key = pair[0]
            .as_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "dict keys must be strings"))?;
        let value: serde_json::Value = serde_json::to_value(&pair[1])
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
        map.insert(key.to_string(), value);
    }
    Ok(Value::from_serialize(&serde_json::Value::Object(map)))
}

/// Build a list from the arguments.
pub fn list(args: Rest<Value>) -> Value {
    Value::from(args.to_vec())
}

/// First argument that is neither undefined, none, nor empty-string.
pub fn coalesce(args: Rest<Value>) -> Value {
    for arg in args.iter() {
        if arg.is_undefined() || arg.is_none() {
            continue;
        }
        if let Some(s) = arg.as_str() {
            if s.is_empty() {
                continue;
            }
        }
        return arg.clone();
    }
    Value::from(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_builds_maps_and_rejects_odd_arity() {
        let v = dict(Rest(vec![Value::from("a"), Value::from(1)])).unwrap();
        assert_eq!(v.get_attr("a").unwrap(), Value::from(1));
        assert!(dict(Rest(vec![Value::from("a")])).is_err());
    }

    #[test]
    fn coalesce_skips_empty_values() {
        let v = coalesce(Rest(vec![
            Value::from(()),
            Value::from(""),
            Value::from("x"),
        ]));
        assert_eq!(v.as_str(), Some("x"));
    }

    #[test]
    fn fail_surfaces_message() {
        let err = fail("nope".into()).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
