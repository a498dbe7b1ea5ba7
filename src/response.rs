//! The response handed to completion callbacks and promise handlers.
//!
//! A `Response` is built once from the final (non-redirect) reply and never
//! changes afterwards. Its typed [`Body`] depends on the response-type hint
//! of the request and on the reply's `Content-Type`.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::codec::{BodyCodec, JsonCodec};
use crate::content_types;
use crate::net::TransportReply;

/// How the reply body should be exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
    /// JSON for JSON content, a data URI for images, text otherwise.
    #[default]
    Auto,
    Text,
    Json,
    Blob,
    ArrayBuffer,
}

impl FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(ResponseType::Auto),
            "text" => Ok(ResponseType::Text),
            "json" => Ok(ResponseType::Json),
            "blob" => Ok(ResponseType::Blob),
            "arraybuffer" => Ok(ResponseType::ArrayBuffer),
            other => Err(format!("unknown response type '{other}'")),
        }
    }
}

/// Typed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    /// `data:<mime>;base64,<payload>` for image content.
    DataUri(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) | Body::DataUri(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Response {
    status: u16,
    url: Url,
    headers: HeaderMap,
    charset: String,
    text: String,
    body: Body,
    from_cache: bool,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("charset", &self.charset)
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub(crate) fn from_reply(reply: TransportReply, response_type: ResponseType) -> Self {
        let content_type = reply
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let charset = charset_of(&content_type);
        let text = decode_text(charset.as_deref(), &reply.body);

        let body = match response_type {
            ResponseType::Text => Body::Text(text.clone()),
            ResponseType::Json => {
                if content_types::is_json(&content_type) {
                    Body::Json(parse_json(&reply.body))
                } else {
                    Body::Json(Value::Object(Default::default()))
                }
            }
            ResponseType::Blob | ResponseType::ArrayBuffer => Body::Bytes(reply.body.clone()),
            ResponseType::Auto => {
                if content_types::is_json(&content_type) {
                    Body::Json(parse_json(&reply.body))
                } else if content_types::is_image(&content_type) {
                    Body::DataUri(format!(
                        "data:{};base64,{}",
                        content_types::essence(&content_type),
                        BASE64_STANDARD.encode(&reply.body)
                    ))
                } else {
                    Body::Text(text.clone())
                }
            }
        };

        Self {
            status: reply.status,
            url: reply.url,
            headers: reply.headers,
            charset: charset.unwrap_or_else(|| "utf-8".to_string()),
            text,
            body,
            from_cache: reply.from_cache,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status class: 2 for 2xx, 4 for 4xx and so on.
    pub fn status_type(&self) -> u16 {
        self.status / 100
    }

    pub fn info(&self) -> bool {
        self.status_type() == 1
    }

    pub fn ok(&self) -> bool {
        self.status_type() == 2
    }

    pub fn client_error(&self) -> bool {
        self.status_type() == 4
    }

    pub fn server_error(&self) -> bool {
        self.status_type() == 5
    }

    pub fn error(&self) -> bool {
        self.client_error() || self.server_error()
    }

    pub fn accepted(&self) -> bool {
        self.status == 202
    }

    pub fn no_content(&self) -> bool {
        self.status == 204
    }

    pub fn bad_request(&self) -> bool {
        self.status == 400
    }

    pub fn unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn forbidden(&self) -> bool {
        self.status == 403
    }

    pub fn not_found(&self) -> bool {
        self.status == 404
    }

    pub fn not_acceptable(&self) -> bool {
        self.status == 406
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Character set the body was decoded with, lower-cased as given.
    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Convenience accessor for JSON bodies.
    pub fn json(&self) -> Option<&Value> {
        self.body.as_json()
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }
}

/// Extracts the `charset=` parameter of a `Content-Type` value.
fn charset_of(content_type: &str) -> Option<String> {
    let idx = content_type.to_ascii_lowercase().find("charset=")?;
    let after = &content_type[idx + "charset=".len()..];
    // charset value may be quoted or end at ; or end of string
    let end = after.find([';', ' ', '\t']).unwrap_or(after.len());
    let charset = after[..end].trim_matches('"').to_ascii_lowercase();
    (!charset.is_empty()).then_some(charset)
}

fn decode_text(charset: Option<&str>, body: &[u8]) -> String {
    let encoding = charset
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

fn parse_json(body: &[u8]) -> Value {
    JsonCodec.parse(body).unwrap_or_else(|e| {
        log::warn!("Response body is not valid JSON: {}", e);
        Value::Null
    })
}
