use serde::Serialize;
use serde_json::Value;

use crate::codec::BodyCodec;
use crate::errors::CodecError;

/// Compact JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Serializes any `Serialize` type. Its own serialization acts as the
    /// `toJSON` hook: the value is converted first, then written compactly.
    pub fn stringify_serializable<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let value = serde_json::to_value(value)?;
        self.stringify(&value)
    }
}

impl BodyCodec for JsonCodec {
    fn stringify(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn parse(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(data)?)
    }
}
