use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::LOCATION;
use http::{HeaderMap, Method};
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::multipart::Multipart;

/// Channel on which a transport reports progress while a request runs.
pub type ProgressSender = UnboundedSender<TransportSignal>;

/// Sends a request and resolves with the complete reply.
///
/// Dropping the returned future cancels the operation.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: TransportRequest,
        progress: ProgressSender,
    ) -> BoxFuture<'static, Result<TransportReply, TransportError>>;
}

#[derive(Debug, Clone)]
pub enum TransportBody {
    Empty,
    Bytes(Bytes),
    Multipart(Multipart),
}

impl TransportBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, TransportBody::Empty)
    }
}

/// One physical request leg.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: TransportBody,
}

/// Fully buffered reply of one leg.
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// Final URL of this leg (never a followed redirect).
    pub url: Url,

    /// Numeric HTTP status code (e.g., `200`, `404`).
    pub status: u16,

    /// Response headers as a case-insensitive map.
    pub headers: HeaderMap,

    pub body: Bytes,

    /// True when served from the local cache instead of the network.
    pub from_cache: bool,
}

impl TransportReply {
    /// `Location` of a 3xx reply.
    pub fn redirect_target(&self) -> Option<&str> {
        if !(300..400).contains(&self.status) {
            return None;
        }
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }
}

/// TLS details of an encrypted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// DER-encoded leaf certificate of the peer.
    pub peer_certificate: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    UploadProgress { loaded: u64, total: Option<u64> },
    DownloadProgress { loaded: u64, total: Option<u64> },
    SecureConnect(TlsInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    ConnectionRefused,
    HostNotFound,
    Timeout,
    OperationCanceled,
    Tls,
    Protocol,
    Body,
    Io,
    Unknown,
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorCode::ConnectionRefused => "connection refused",
            TransportErrorCode::HostNotFound => "host not found",
            TransportErrorCode::Timeout => "timeout",
            TransportErrorCode::OperationCanceled => "operation canceled",
            TransportErrorCode::Tls => "tls",
            TransportErrorCode::Protocol => "protocol",
            TransportErrorCode::Body => "body",
            TransportErrorCode::Io => "io",
            TransportErrorCode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub description: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::new(TransportErrorCode::Io, err.to_string())
    }
}
