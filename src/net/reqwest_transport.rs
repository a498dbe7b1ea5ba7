use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{stream, FutureExt};
use http::header::CONTENT_LENGTH;
use http::{HeaderValue, Method};
use reqwest::redirect::Policy;

use super::cache::{bypasses_cache, CacheStore, CachedReply, DiskCache, InMemoryCache};
use super::transport::{
    ProgressSender, TlsInfo, Transport, TransportBody, TransportError, TransportErrorCode,
    TransportReply, TransportRequest, TransportSignal,
};
use crate::config::{CacheConfig, Config, ProxyConfig};
use crate::multipart::{Multipart, PartContent};

const UPLOAD_CHUNK: usize = 16 * 1024;

/// [`Transport`] backed by a `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    cache: Option<Arc<dyn CacheStore>>,
}

impl ReqwestTransport {
    /// Builds a client from the configuration. A cache that cannot be
    /// opened is logged and disabled.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("duperagent/{}", env!("CARGO_PKG_VERSION")));

        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .tls_info(true)
            .user_agent(user_agent);
        if config.proxy != ProxyConfig::System {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;

        let cache: Option<Arc<dyn CacheStore>> = match &config.cache {
            CacheConfig::Disabled => None,
            CacheConfig::Memory => Some(Arc::new(InMemoryCache::new())),
            CacheConfig::Disk { location, max_size } => match DiskCache::open(location, *max_size) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    log::error!("Cannot open cache at {}: {}", location.display(), e);
                    None
                }
            },
        };

        Ok(Self { client, cache })
    }

    /// Uses an existing client. It must not follow redirects itself.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }
}

impl Transport for ReqwestTransport {
    fn execute(
        &self,
        request: TransportRequest,
        progress: ProgressSender,
    ) -> BoxFuture<'static, Result<TransportReply, TransportError>> {
        let client = self.client.clone();
        let cache = self.cache.clone();
        async move { fetch(client, cache, request, progress).await }.boxed()
    }
}

// Sends one leg and buffers the reply
async fn fetch(
    client: reqwest::Client,
    cache: Option<Arc<dyn CacheStore>>,
    request: TransportRequest,
    progress: ProgressSender,
) -> Result<TransportReply, TransportError> {
    let cacheable = request.method == Method::GET && !bypasses_cache(&request.headers);
    let cache_key = request.url.to_string();

    if cacheable {
        if let Some(entry) = cache.as_ref().and_then(|c| c.get(&cache_key)) {
            log::debug!("Serving {} from cache", cache_key);
            let body = entry.body();
            let total = body.len() as u64;
            let _ = progress.send(TransportSignal::DownloadProgress {
                loaded: total,
                total: Some(total),
            });
            return Ok(TransportReply {
                url: request.url,
                status: entry.status,
                headers: entry.header_map(),
                body,
                from_cache: true,
            });
        }
    }

    let mut builder = client
        .request(request.method.clone(), request.url.clone())
        .headers(request.headers.clone());

    builder = match request.body {
        TransportBody::Empty => builder,
        TransportBody::Bytes(data) => {
            let length = data.len();
            builder
                .header(CONTENT_LENGTH, HeaderValue::from(length))
                .body(upload_body(vec![data], progress.clone()))
        }
        TransportBody::Multipart(multipart) => builder.multipart(multipart_form(multipart, progress.clone())?),
    };

    let mut res = builder.send().await?;

    // Fetch results
    let final_url = res.url().clone();
    let status = res.status().as_u16();
    let headers = res.headers().clone();

    if let Some(info) = res.extensions().get::<reqwest::tls::TlsInfo>() {
        let _ = progress.send(TransportSignal::SecureConnect(TlsInfo {
            peer_certificate: info.peer_certificate().map(<[u8]>::to_vec),
        }));
    }

    // Read the body chunk by chunk so download progress can be reported
    let total = res.content_length();
    let mut body = Vec::with_capacity(total.unwrap_or(0) as usize);
    while let Some(chunk) = res.chunk().await? {
        body.extend_from_slice(&chunk);
        let _ = progress.send(TransportSignal::DownloadProgress {
            loaded: body.len() as u64,
            total,
        });
    }

    if cacheable {
        if let Some(cache) = &cache {
            if let Some(entry) = CachedReply::from_reply(status, &headers, &body) {
                cache.put(&cache_key, entry);
            }
        }
    }

    Ok(TransportReply {
        url: final_url,
        status,
        headers,
        body: Bytes::from(body),
        from_cache: false,
    })
}

/// Counts uploaded bytes across every chunk of one request body.
#[derive(Clone)]
struct UploadTracker {
    loaded: Arc<AtomicU64>,
    total: u64,
    progress: ProgressSender,
}

impl UploadTracker {
    fn new(total: u64, progress: ProgressSender) -> Self {
        Self {
            loaded: Arc::new(AtomicU64::new(0)),
            total,
            progress,
        }
    }

    fn advance(&self, n: usize) {
        let loaded = self.loaded.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
        let _ = self.progress.send(TransportSignal::UploadProgress {
            loaded,
            total: Some(self.total),
        });
    }
}

fn upload_body(data: Vec<Bytes>, progress: ProgressSender) -> reqwest::Body {
    let total = data.iter().map(|b| b.len() as u64).sum();
    chunked_body(data, UploadTracker::new(total, progress))
}

fn split_chunks(data: Vec<Bytes>) -> Vec<Bytes> {
    data.into_iter()
        .flat_map(|buf| {
            (0..buf.len())
                .step_by(UPLOAD_CHUNK)
                .map(move |start| buf.slice(start..(start + UPLOAD_CHUNK).min(buf.len())))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn chunked_body(data: Vec<Bytes>, tracker: UploadTracker) -> reqwest::Body {
    let chunks = split_chunks(data);
    reqwest::Body::wrap_stream(stream::iter(chunks.into_iter().map(move |chunk| {
        tracker.advance(chunk.len());
        Ok::<_, io::Error>(chunk)
    })))
}

fn multipart_form(
    multipart: Multipart,
    progress: ProgressSender,
) -> Result<reqwest::multipart::Form, TransportError> {
    let tracker = UploadTracker::new(multipart.byte_length(), progress);
    let mut form = reqwest::multipart::Form::new();

    for part in multipart.parts() {
        form = match &part.content {
            PartContent::Text(text) => form.text(part.name.clone(), text.clone()),
            PartContent::Source(source) => {
                let data = source.read()?;
                let length = data.len() as u64;
                let mut wire = reqwest::multipart::Part::stream_with_length(
                    chunked_body(vec![data], tracker.clone()),
                    length,
                );
                if let Some(filename) = &part.filename {
                    wire = wire.file_name(filename.clone());
                }
                if let Some(mime) = &part.mime_type {
                    wire = wire.mime_str(mime)?;
                }
                form.part(part.name.clone(), wire)
            }
        };
    }

    Ok(form)
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let description = error_chain(&err);
        let lower = description.to_ascii_lowercase();

        let code = if err.is_timeout() {
            TransportErrorCode::Timeout
        } else if err.is_connect() {
            if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
                TransportErrorCode::HostNotFound
            } else if lower.contains("certificate") || lower.contains("tls") {
                TransportErrorCode::Tls
            } else {
                TransportErrorCode::ConnectionRefused
            }
        } else if err.is_body() || err.is_decode() {
            TransportErrorCode::Body
        } else if err.is_request() || err.is_builder() {
            TransportErrorCode::Protocol
        } else {
            TransportErrorCode::Unknown
        };

        TransportError::new(code, description)
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        description.push_str(": ");
        description.push_str(&cause.to_string());
        source = cause.source();
    }
    description
}
