//! Conversions between MessagePack values and JSON.
//!
//! Map keys that are not strings are rendered with their MessagePack
//! display form, so `{1: 5}` becomes `{"1": 5}`.

use rmpv::Value;
use serde_json::{Map, Number, Value as Json};

pub fn to_json(value: &Value) -> Json {
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(u), _) => Json::from(u),
            (None, Some(n)) => Json::from(n),
            (None, None) => Json::Null,
        },
        Value::F32(f) => float(f64::from(*f)),
        Value::F64(f) => float(*f),
        Value::String(s) => Json::String(s.as_str().map_or_else(
            || String::from_utf8_lossy(s.as_bytes()).into_owned(),
            str::to_string,
        )),
        Value::Binary(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => {
            let mut object = Map::new();
            for (key, value) in entries {
                let key = match key.as_str() {
                    Some(s) => s.to_string(),
                    None => key.to_string(),
                };
                object.insert(key, to_json(value));
            }
            Json::Object(object)
        }
        Value::Ext(_, _) => Json::Null,
    }
}

fn float(f: f64) -> Json {
    Number::from_f64(f).map_or(Json::Null, Json::Number)
}

pub fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::from(s.as_str()),
        Json::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        Json::Object(object) => Value::Map(
            object
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), from_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tuple_to_json() {
        let tuple = Value::Array(vec![
            Value::from(1u64),
            Value::from("alice"),
            Value::from(-3i64),
            Value::F64(1.5),
            Value::Nil,
        ]);
        assert_eq!(to_json(&tuple), json!([1, "alice", -3, 1.5, null]));
    }

    #[test]
    fn test_integer_map_keys() {
        let vclock = Value::Map(vec![(Value::from(1u32), Value::from(42u64))]);
        assert_eq!(to_json(&vclock), json!({"1": 42}));
    }

    #[test]
    fn test_from_json() {
        let value = from_json(&json!([7, "x", [1, -1], {"k": true}]));
        assert_eq!(
            value,
            Value::Array(vec![
                Value::from(7u64),
                Value::from("x"),
                Value::Array(vec![Value::from(1u64), Value::from(-1i64)]),
                Value::Map(vec![(Value::from("k"), Value::Boolean(true))]),
            ])
        );
    }
}
