use serde_json::Value;
use url::form_urlencoded::byte_serialize;

use crate::codec::BodyCodec;
use crate::errors::CodecError;

/// `application/x-www-form-urlencoded` codec.
///
/// Nested objects and arrays are flattened with bracket suffixes:
/// `{"a": {"b": 1}, "c": [1, 2]}` becomes `a[b]=1&c[0]=1&c[1]=2` (brackets
/// percent-encoded on the wire).
#[derive(Debug, Default, Clone, Copy)]
pub struct FormCodec;

impl BodyCodec for FormCodec {
    fn stringify(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::String(raw) => Ok(raw.clone().into_bytes()),
            Value::Object(_) | Value::Array(_) => {
                let mut pairs = Vec::new();
                flatten(None, value, &mut pairs);
                let encoded = pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
                    .collect::<Vec<_>>()
                    .join("&");
                Ok(encoded.into_bytes())
            }
            Value::Null => Ok(Vec::new()),
            other => Err(CodecError::Unsupported {
                codec: "form",
                reason: format!("cannot encode a bare {} as form data", kind(other)),
            }),
        }
    }

    /// Form bodies are never parsed back; this always yields `Value::Null`.
    fn parse(&self, _data: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::Null)
    }
}

fn flatten(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = match prefix {
                    Some(p) => format!("{p}[{key}]"),
                    None => key.clone(),
                };
                flatten(Some(&name), child, out);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                let name = match prefix {
                    Some(p) => format!("{p}[{idx}]"),
                    None => idx.to_string(),
                };
                flatten(Some(&name), child, out);
            }
        }
        scalar => {
            if let Some(name) = prefix {
                out.push((name.to_string(), scalar_text(scalar)));
            }
        }
    }
}

/// Text of a scalar as it appears in a query string or form body.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn encode(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        _ => "value",
    }
}
