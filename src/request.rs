//! Fluent request builder.
//!
//! A [`Request`] is created by one of the verb factories of an
//! [`Agent`](crate::agent::Agent), configured with chained calls and then
//! dispatched with [`Request::end`], [`Request::then`] or
//! [`Request::send_async`]:
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), duperagent::errors::RequestError> {
//! use serde_json::json;
//!
//! let res = duperagent::post("https://example.com/api/items")
//!     .set("X-Trace", "1")
//!     .query(json!({ "verbose": true }))
//!     .send(json!({ "name": "widget" }))
//!     .timeout(5_000)
//!     .send_async()
//!     .await?;
//! assert!(res.ok());
//! # Ok(()) }
//! ```
//!
//! `Request` is a handle: clones refer to the same logical request, which is
//! how [`Request::abort`] reaches a request that is already in flight.

mod dispatch;
mod events;
mod method;
mod redirect;

pub use events::{EventKind, Listener, ProgressDirection, ProgressEvent, RequestEvent};
pub use method::Method;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;
use url::Url;

use crate::agent::AgentContext;
use crate::codec::{codec_for, scalar_text};
use crate::content_types;
use crate::errors::{CodecError, ErrorKind, RequestError};
use crate::multipart::{FileSource, Multipart, MultipartSource, Part};
use crate::net::{TransportBody, TransportReply, TransportRequest};
use crate::promise::{Promise, Reaction};
use crate::response::{Response, ResponseType};
use events::Listeners;
use redirect::RedirectDecision;

pub const DEFAULT_REDIRECTS: u32 = 5;

/// Completion callback passed to [`Request::end`].
pub type Callback = Box<dyn FnOnce(Result<Response, RequestError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Dispatched,
    Completed,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryItem {
    Pair(String, String),
    /// A pre-encoded fragment such as `a=1&b=2`.
    Raw(String),
}

pub(crate) struct RequestInner {
    method: Method,
    url: Result<Url, String>,
    query: Vec<QueryItem>,
    headers: HeaderMap,
    body: Option<Value>,
    multipart: Option<Multipart>,
    max_redirects: u32,
    redirect_count: u32,
    timeout: Option<Duration>,
    response_type: ResponseType,
    listeners: Listeners,
    callback: Option<Callback>,
    promise: Option<Promise<Response, RequestError>>,
    outcome: Option<Result<Response, RequestError>>,
    state: RequestState,
    cancel: Option<CancellationToken>,
    context: Arc<AgentContext>,
}

/// One leg ready to hand to the transport.
pub(crate) struct Leg {
    pub request: TransportRequest,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub context: Arc<AgentContext>,
}

#[derive(Clone)]
pub struct Request {
    inner: Arc<Mutex<RequestInner>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Request")
            .field("method", &inner.method)
            .field("url", &inner.url)
            .field("state", &inner.state)
            .field("redirect_count", &inner.redirect_count)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub(crate) fn new(method: Method, url: &str, context: Arc<AgentContext>) -> Self {
        let url = Url::parse(url).map_err(|e| format!("{url}: {e}"));
        Self {
            inner: Arc::new(Mutex::new(RequestInner {
                method,
                url,
                query: Vec::new(),
                headers: HeaderMap::new(),
                body: None,
                multipart: None,
                max_redirects: DEFAULT_REDIRECTS,
                redirect_count: 0,
                timeout: None,
                response_type: ResponseType::Auto,
                listeners: Listeners::default(),
                callback: None,
                promise: None,
                outcome: None,
                state: RequestState::Idle,
                cancel: None,
                context,
            })),
        }
    }

    #[inline]
    fn with(self, f: impl FnOnce(&mut RequestInner)) -> Self {
        f(&mut self.lock());
        self
    }

    fn lock(&self) -> MutexGuard<'_, RequestInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------- Builder ----------

    /// Sets a header. The last value for a case-insensitive name wins.
    pub fn set(self, name: &str, value: &str) -> Self {
        self.with(|r| r.set_header(name, value))
    }

    /// Sets several headers at once.
    pub fn set_all<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.with(|r| {
            for (name, value) in headers {
                r.set_header(name.as_ref(), value.as_ref());
            }
        })
    }

    pub fn unset(self, name: &str) -> Self {
        self.with(|r| {
            r.headers.remove(name);
        })
    }

    /// Sets `Content-Type`. Short names like `json` or `form` go through the
    /// content-type registry.
    pub fn type_(self, name: &str) -> Self {
        self.with(|r| r.set_header(CONTENT_TYPE.as_str(), &content_types::resolve(name)))
    }

    /// Sets `Accept`, resolving short names like [`type_`](Self::type_).
    pub fn accept(self, name: &str) -> Self {
        self.with(|r| r.set_header(ACCEPT.as_str(), &content_types::resolve(name)))
    }

    /// Basic authentication.
    pub fn auth(self, user: &str, password: &str) -> Self {
        let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
        self.with(|r| match HeaderValue::from_str(&format!("Basic {encoded}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                r.headers.insert(AUTHORIZATION, value);
            }
            Err(e) => log::warn!("Invalid credentials for Authorization header: {}", e),
        })
    }

    /// Maximum number of redirects to follow. `0` delivers the 3xx reply.
    pub fn redirects(self, n: u32) -> Self {
        self.with(|r| r.max_redirects = n)
    }

    /// Appends query parameters.
    ///
    /// Takes a flat JSON object or a pre-encoded query string. Existing
    /// parameters are kept; duplicate keys stay separate entries.
    pub fn query(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.with(|r| match value {
            Value::Object(map) => {
                for (key, value) in map {
                    r.query.push(QueryItem::Pair(key, scalar_text(&value)));
                }
            }
            Value::String(s) => {
                let s = s.trim_start_matches('?');
                if !s.is_empty() {
                    r.query.push(QueryItem::Raw(s.to_string()));
                }
            }
            other => log::warn!("query() expects an object or a string, got {}", other),
        })
    }

    /// Adds a text field and switches the request to multipart.
    pub fn field(self, name: &str, value: impl Into<Value>) -> Self {
        let value = scalar_text(&value.into());
        self.with(|r| r.multipart().push(Part::text(name, value)))
    }

    /// Attaches a file and switches the request to multipart.
    ///
    /// The file is opened right away; if that fails the part is skipped with
    /// a warning. Without a `filename` the file's own name is used.
    pub fn attach(self, name: &str, path: impl AsRef<Path>, filename: Option<&str>) -> Self {
        let path = path.as_ref();
        let source = match FileSource::open(path) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("Cannot attach {}: {}", path.display(), e);
                return self;
            }
        };

        let filename = filename.map(str::to_string).or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
        });
        self.attach_source(name, Arc::new(source), filename.as_deref())
    }

    /// Attaches any [`MultipartSource`] and switches the request to multipart.
    pub fn attach_source(
        self,
        name: &str,
        source: Arc<dyn MultipartSource>,
        filename: Option<&str>,
    ) -> Self {
        let part = Part::source(name, source, filename.map(str::to_string));
        self.with(|r| r.multipart().push(part))
    }

    /// Accumulates body data.
    ///
    /// Objects merge key by key. Strings switch an untyped request to
    /// form-encoding and are joined with `&` when form-encoded, concatenated
    /// otherwise. Anything else replaces the body. An untyped request ends
    /// up as JSON.
    pub fn send(self, data: impl Into<Value>) -> Self {
        let data = data.into();
        self.with(|r| r.accumulate(data))
    }

    /// Like [`send`](Self::send) for any serializable type.
    pub fn send_json<T: Serialize + ?Sized>(self, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => self.send(value),
            Err(e) => {
                log::warn!("Cannot serialize request body: {}", e);
                self
            }
        }
    }

    /// Timeout in milliseconds per leg. Zero or negative disables it.
    pub fn timeout(self, ms: i64) -> Self {
        self.with(|r| {
            r.timeout = u64::try_from(ms)
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
        })
    }

    pub fn clear_timeout(self) -> Self {
        self.with(|r| r.timeout = None)
    }

    pub fn response_type(self, kind: ResponseType) -> Self {
        self.with(|r| r.response_type = kind)
    }

    /// Applies a reusable request decorator.
    pub fn use_<F>(self, plugin: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        plugin(self)
    }

    /// Has no effect; cookies are always managed by the agent's jar.
    pub fn with_credentials(self) -> Self {
        self
    }

    /// Registers a listener. Several listeners for one event run in
    /// registration order; a panicking listener is logged and skipped.
    pub fn on<F>(self, event: EventKind, listener: F) -> Self
    where
        F: Fn(&RequestEvent<'_>) + Send + Sync + 'static,
    {
        self.with(|r| r.listeners.add(event, Arc::new(listener)))
    }

    // ---------- Accessors ----------

    pub fn method(&self) -> Method {
        self.lock().method
    }

    /// Current target. Changes when a redirect is followed.
    pub fn url(&self) -> Option<Url> {
        self.lock().url.clone().ok()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    /// Accumulated body data, before serialization.
    pub fn body(&self) -> Option<Value> {
        self.lock().body.clone()
    }

    /// The query string as it will be appended to the URL.
    pub fn query_string(&self) -> String {
        encode_query(&self.lock().query)
    }

    pub fn redirect_count(&self) -> u32 {
        self.lock().redirect_count
    }

    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    pub fn has_multipart(&self) -> bool {
        self.lock().multipart.as_ref().is_some_and(|m| !m.is_empty())
    }

    // ---------- Dispatch ----------

    /// Dispatches the request; `callback` receives the outcome.
    ///
    /// A request is dispatched at most once. A second `end` is logged and
    /// ignored.
    pub fn end<F>(self, callback: F) -> Self
    where
        F: FnOnce(Result<Response, RequestError>) + Send + 'static,
    {
        let accepted = {
            let mut inner = self.lock();
            if inner.callback.is_some() || inner.state.is_terminal() {
                log::warn!("end() called twice on {} {:?}, ignoring", inner.method, inner.url);
                false
            } else {
                inner.callback = Some(Box::new(callback));
                true
            }
        };
        if accepted {
            self.dispatch();
        }
        self
    }

    /// The request's promise, created and dispatched on first use.
    pub fn promise(&self) -> Promise<Response, RequestError> {
        let (promise, created, outcome) = {
            let mut inner = self.lock();
            match &inner.promise {
                Some(promise) => (promise.clone(), false, None),
                None => {
                    let promise = Promise::pending();
                    inner.promise = Some(promise.clone());
                    (promise, true, inner.outcome.clone())
                }
            }
        };

        if created {
            match outcome {
                // finished through end() before anyone asked for a promise
                Some(result) => promise.resolver().settle(result),
                None => self.dispatch(),
            }
        }
        promise
    }

    /// Chains handlers onto the request's promise. Calling `then` again
    /// reuses the same underlying promise.
    pub fn then<F, R>(
        &self,
        on_fulfilled: Option<F>,
        on_rejected: Option<R>,
    ) -> Promise<Response, RequestError>
    where
        F: FnOnce(Response) -> Reaction<Response, RequestError> + Send + 'static,
        R: FnOnce(RequestError) -> Reaction<Response, RequestError> + Send + 'static,
    {
        self.promise().then(on_fulfilled, on_rejected)
    }

    /// Like [`then`](Request::then), mapping the response to another type.
    pub fn then_map<U, F, R>(&self, on_fulfilled: F, on_rejected: Option<R>) -> Promise<U, RequestError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Response) -> Reaction<U, RequestError> + Send + 'static,
        R: FnOnce(RequestError) -> Reaction<U, RequestError> + Send + 'static,
    {
        self.promise().then_map(on_fulfilled, on_rejected)
    }

    /// Dispatches and waits for the outcome.
    pub async fn send_async(&self) -> Result<Response, RequestError> {
        self.promise().wait().await
    }

    /// Cancels the request if it is in flight. The normal completion path
    /// runs and settles with an abort error.
    pub fn abort(&self) {
        let inner = self.lock();
        match (&inner.state, &inner.cancel) {
            (RequestState::Dispatched, Some(cancel)) => {
                log::debug!("Aborting {} {:?}", inner.method, inner.url);
                cancel.cancel();
            }
            _ => log::trace!("abort() with nothing in flight"),
        }
    }

    fn dispatch(&self) {
        {
            let mut inner = self.lock();
            if inner.state != RequestState::Idle {
                return;
            }
            inner.state = RequestState::Dispatched;
            inner.cancel = Some(CancellationToken::new());
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(dispatch::run(self.clone()));
            }
            Err(_) => {
                log::error!("Cannot dispatch request: no tokio runtime is running");
                dispatch::finish(
                    self,
                    dispatch::Completion::Failed(RequestError::new(ErrorKind::Transport {
                        code: crate::net::TransportErrorCode::Unknown,
                        description: "no tokio runtime".into(),
                    })),
                    RequestState::Aborted,
                );
            }
        }
    }

    // ---------- Engine hooks ----------

    pub(crate) fn listeners(&self, kind: EventKind) -> Vec<Listener> {
        self.lock().listeners.for_kind(kind)
    }

    /// Builds the next leg. Query parameters are merged on the first leg
    /// only; redirect targets are used as given.
    pub(crate) fn prepare_leg(&self, first: bool) -> Result<Leg, RequestError> {
        let mut inner = self.lock();

        let mut url = inner
            .url
            .clone()
            .map_err(|e| RequestError::new(ErrorKind::InvalidUrl(e)))?;
        if first && !inner.query.is_empty() {
            let extra = encode_query(&inner.query);
            let merged = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{extra}"),
                _ => extra,
            };
            url.set_query(Some(&merged));
            inner.url = Ok(url.clone());
        }

        let mut headers = inner.headers.clone();
        if !headers.contains_key(COOKIE) {
            if let Some(jar) = &inner.context.cookie_jar {
                let cookies = jar
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .request_cookies(&url);
                if let Some(value) = cookies.and_then(|c| HeaderValue::from_str(&c).ok()) {
                    headers.insert(COOKIE, value);
                }
            }
        }

        let body = inner
            .transport_body()
            .map_err(|e| RequestError::new(ErrorKind::Body(e)))?;
        if matches!(body, TransportBody::Multipart(_)) {
            // the transport writes its own multipart boundary
            headers.remove(CONTENT_TYPE);
        }

        Ok(Leg {
            request: TransportRequest {
                method: inner.method.into(),
                url,
                headers,
                body,
            },
            timeout: inner.timeout,
            cancel: inner.cancel.clone().unwrap_or_default(),
            context: inner.context.clone(),
        })
    }

    /// Applies the redirect policy to a reply, rewriting the request when
    /// the redirect is followed.
    pub(crate) fn apply_redirect(&self, reply: &TransportReply) -> RedirectDecision {
        let mut inner = self.lock();
        let current = match &inner.url {
            Ok(url) => url.clone(),
            Err(_) => reply.url.clone(),
        };

        let decision = redirect::decide(
            reply.status,
            reply.redirect_target(),
            &current,
            inner.method,
            inner.redirect_count,
            inner.max_redirects,
        );

        if let RedirectDecision::Follow {
            url,
            method,
            strip_body,
        } = &decision
        {
            log::debug!("{} redirect {} -> {} {}", reply.status, current, method, url);
            inner.redirect_count += 1;
            inner.url = Ok(url.clone());
            inner.method = *method;
            if *strip_body {
                inner.headers.remove(CONTENT_TYPE);
                inner.headers.remove(CONTENT_LENGTH);
                inner.body = None;
                inner.multipart = None;
            }
        }

        decision
    }
}

impl RequestInner {
    fn set_header(&mut self, name: &str, value: &str) {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                log::warn!("Ignoring invalid header name '{}': {}", name, e);
                return;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(e) => log::warn!("Ignoring invalid value for header '{}': {}", name, e),
        }
    }

    fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    fn multipart(&mut self) -> &mut Multipart {
        self.multipart.get_or_insert_with(Multipart::new)
    }

    fn accumulate(&mut self, data: Value) {
        match data {
            Value::Object(new) if matches!(self.body, Some(Value::Object(_))) => {
                if let Some(Value::Object(existing)) = self.body.as_mut() {
                    existing.extend(new);
                }
            }
            Value::String(s) => {
                if self.content_type().is_none() {
                    self.set_header(CONTENT_TYPE.as_str(), content_types::FORM);
                }
                let is_form = self.content_type().is_some_and(content_types::is_form);
                self.body = Some(Value::String(match self.body.take() {
                    Some(Value::String(prev)) if is_form => format!("{prev}&{s}"),
                    Some(Value::String(prev)) => prev + &s,
                    _ => s,
                }));
            }
            other => self.body = Some(other),
        }

        if self.content_type().is_none() {
            self.set_header(CONTENT_TYPE.as_str(), content_types::JSON);
        }
    }

    fn transport_body(&self) -> Result<TransportBody, CodecError> {
        if !self.method.carries_body() {
            return Ok(TransportBody::Empty);
        }

        if matches!(self.method, Method::Post | Method::Put) {
            if let Some(multipart) = self.multipart.as_ref().filter(|m| !m.is_empty()) {
                return Ok(TransportBody::Multipart(multipart.clone()));
            }
        }

        match &self.body {
            None => Ok(TransportBody::Empty),
            Some(Value::String(s)) => Ok(TransportBody::Bytes(Bytes::from(s.clone()))),
            Some(value) => {
                let bytes = codec_for(self.content_type()).stringify(value)?;
                Ok(TransportBody::Bytes(Bytes::from(bytes)))
            }
        }
    }
}

fn encode_query(items: &[QueryItem]) -> String {
    items
        .iter()
        .map(|item| match item {
            QueryItem::Pair(key, value) => form_urlencoded::Serializer::new(String::new())
                .append_pair(key, value)
                .finish(),
            QueryItem::Raw(raw) => raw.clone(),
        })
        .collect::<Vec<_>>()
        .join("&")
}
