//! Body codecs.
//!
//! A codec converts between the native value model ([`serde_json::Value`])
//! and the bytes that travel on the wire for one content type. The dispatch
//! engine picks the codec with [`codec_for`] based on the effective
//! `Content-Type` of the request.

mod form;
mod json;

pub use form::FormCodec;
pub use json::JsonCodec;

pub(crate) use form::scalar_text;

use crate::content_types;
use crate::errors::CodecError;
use serde_json::Value;

/// Bidirectional converter between a [`Value`] and wire bytes.
pub trait BodyCodec: Send + Sync {
    /// Serializes `value` into the bytes sent as request body.
    fn stringify(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Parses received bytes back into a value.
    fn parse(&self, data: &[u8]) -> Result<Value, CodecError>;
}

/// Selects the codec for a `Content-Type`. Anything that is not form-encoded
/// goes through JSON.
pub fn codec_for(content_type: Option<&str>) -> &'static dyn BodyCodec {
    match content_type {
        Some(ct) if content_types::is_form(ct) => &FormCodec,
        _ => &JsonCodec,
    }
}
