use std::time::Duration;

use crate::net::TransportErrorCode;
use crate::response::Response;

/// What went wrong with a request.
///
/// Only transport-level failures and redirect-policy violations end up here.
/// A reply with status >= 400 is still delivered as a [`Response`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error ({code}): {description}")]
    Transport {
        code: TransportErrorCode,
        description: String,
    },

    #[error("Request aborted")]
    Aborted,

    #[error("Timeout of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Too many redirects (limit is {0})")]
    TooManyRedirects(u32),

    #[error("Refusing to redirect to {0}")]
    InvalidRedirectScheme(String),

    #[error("Unhandled redirect status {0}")]
    UnhandledRedirect(u16),

    #[error("Cannot serialize request body: {0}")]
    Body(#[from] CodecError),

    #[error(transparent)]
    Promise(#[from] PromiseError),
}

/// Error handed to completion callbacks and promise rejections.
///
/// When the failure happened after a reply was received (too many redirects,
/// unhandled redirect status) the response is attached.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub response: Option<Box<Response>>,
}

impl RequestError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            status: None,
            response: None,
        }
    }

    pub(crate) fn with_status(mut self, status: u16) -> Self {
        if status > 0 {
            self.status = Some(status);
        }
        self
    }

    pub(crate) fn with_response(mut self, response: Response) -> Self {
        if self.status.is_none() && response.status() >= 400 {
            self.status = Some(response.status());
        }
        self.response = Some(Box::new(response));
        self
    }

    /// Returns true when the request was cancelled by `abort()` or a timeout.
    pub fn is_abort(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted | ErrorKind::Timeout(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    /// Transport error code, if the failure came from the transport.
    pub fn code(&self) -> Option<TransportErrorCode> {
        match &self.kind {
            ErrorKind::Transport { code, .. } => Some(*code),
            ErrorKind::Aborted | ErrorKind::Timeout(_) => Some(TransportErrorCode::OperationCanceled),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_deref()
    }
}

impl From<ErrorKind> for RequestError {
    fn from(kind: ErrorKind) -> Self {
        RequestError::new(kind)
    }
}

impl From<PromiseError> for RequestError {
    fn from(err: PromiseError) -> Self {
        RequestError::new(ErrorKind::Promise(err))
    }
}

/// Errors raised by the promise engine itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromiseError {
    /// A promise was resolved with itself.
    #[error("TypeError: chaining cycle detected for promise")]
    Cycle,

    #[error("Promise handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Promise was dropped before it settled")]
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(String),

    #[error("Unsupported value for {codec}: {reason}")]
    Unsupported { codec: &'static str, reason: String },
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration has already been consumed by the global agent")]
    AlreadyInitialized,

    #[error("Invalid option '{option}': {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("Cache size must be larger than zero")]
    ZeroCacheSize,
}
