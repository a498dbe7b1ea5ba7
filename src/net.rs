//! Network layer.
//!
//! The dispatch engine talks to a [`Transport`]; [`ReqwestTransport`] is the
//! implementation shipped with the crate. Redirects are never followed here,
//! the request engine does that itself.

mod cache;
mod reqwest_transport;
mod transport;

pub use cache::{CacheStore, CachedReply, DiskCache, InMemoryCache};
pub use reqwest_transport::ReqwestTransport;
pub use transport::{
    ProgressSender, TlsInfo, Transport, TransportBody, TransportError, TransportErrorCode,
    TransportReply, TransportRequest, TransportSignal,
};
