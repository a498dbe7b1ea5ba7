//! The agent owns everything requests share: the transport, the cookie jar
//! and the activity indicator.
//!
//! Most callers use the process-wide agent through the crate-level verb
//! functions. A private agent is useful for tests or to isolate cookies:
//!
//! ```rust,no_run
//! use duperagent::agent::Agent;
//! use duperagent::config::{CacheConfig, Config, CookieJarConfig};
//!
//! let config = Config::builder()
//!     .cache(CacheConfig::Memory)
//!     .cookie_jar(CookieJarConfig::Memory)
//!     .build()
//!     .unwrap();
//! let agent = Agent::new(config).unwrap();
//! let request = agent.get("https://example.com/");
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;

use crate::activity::ActivityIndicator;
use crate::config::{self, Config, CookieJarConfig};
use crate::cookies::{
    CookieJarHandle, CookieStoreHandle, DefaultCookieJar, JsonCookieStore, PersistentCookieJar,
};
use crate::net::{ReqwestTransport, Transport, TransportError};
use crate::request::{Callback, Method, Request};

static GLOBAL: OnceLock<Agent> = OnceLock::new();

/// State shared by an agent and every request it creates.
pub(crate) struct AgentContext {
    pub transport: Arc<dyn Transport>,
    pub cookie_jar: Option<CookieJarHandle>,
    pub activity: ActivityIndicator,
}

#[derive(Clone)]
pub struct Agent {
    context: Arc<AgentContext>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("cookie_jar", &self.context.cookie_jar.is_some())
            .field("activity", &self.context.activity.count())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Agent with a reqwest transport built from `config`.
    pub fn new(config: Config) -> Result<Self, TransportError> {
        Self::builder().config(config).build()
    }

    /// Agent sending through `transport`; the cache settings of `config`
    /// are then up to that transport.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self::builder().config(config).assemble(transport)
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// The process-wide agent, created on first use from the options given
    /// to [`configure`](crate::config::configure).
    pub fn global() -> &'static Agent {
        GLOBAL.get_or_init(|| {
            let config = config::take_global();
            let transport = ReqwestTransport::from_config(&config).unwrap_or_else(|e| {
                log::error!("Cannot build configured HTTP client, using defaults: {}", e);
                ReqwestTransport::with_client(reqwest::Client::new())
            });

            log::debug!("Global agent initialized");
            Agent::with_transport(config, Arc::new(transport))
        })
    }

    pub fn request(&self, method: Method, url: &str) -> Request {
        Request::new(method, url, self.context.clone())
    }

    pub fn get(&self, url: &str) -> Request {
        self.request(Method::Get, url)
    }

    pub fn head(&self, url: &str) -> Request {
        self.request(Method::Head, url)
    }

    pub fn del(&self, url: &str) -> Request {
        self.request(Method::Delete, url)
    }

    pub fn patch(&self, url: &str) -> Request {
        self.request(Method::Patch, url)
    }

    pub fn post(&self, url: &str) -> Request {
        self.request(Method::Post, url)
    }

    pub fn put(&self, url: &str) -> Request {
        self.request(Method::Put, url)
    }

    /// Shorthand for building and, given a callback, ending a request.
    ///
    /// `data` becomes the query string of a GET, is ignored for DELETE and
    /// is sent as the body otherwise.
    pub fn request_with(
        &self,
        method: Method,
        url: &str,
        data: Option<Value>,
        callback: Option<Callback>,
    ) -> Request {
        let request = self.request(method, url);
        let request = match (method, data) {
            (_, None) => request,
            (Method::Get, Some(data)) => request.query(data),
            (Method::Delete, Some(_)) => {
                log::debug!("Ignoring data passed for DELETE {}", url);
                request
            }
            (_, Some(data)) => request.send(data),
        };

        match callback {
            Some(callback) => request.end(callback),
            None => request,
        }
    }

    pub fn get_with(&self, url: &str, data: Option<Value>, callback: Option<Callback>) -> Request {
        self.request_with(Method::Get, url, data, callback)
    }

    pub fn head_with(&self, url: &str, data: Option<Value>, callback: Option<Callback>) -> Request {
        self.request_with(Method::Head, url, data, callback)
    }

    pub fn del_with(&self, url: &str, callback: Option<Callback>) -> Request {
        self.request_with(Method::Delete, url, None, callback)
    }

    pub fn patch_with(&self, url: &str, data: Option<Value>, callback: Option<Callback>) -> Request {
        self.request_with(Method::Patch, url, data, callback)
    }

    pub fn post_with(&self, url: &str, data: Option<Value>, callback: Option<Callback>) -> Request {
        self.request_with(Method::Post, url, data, callback)
    }

    pub fn put_with(&self, url: &str, data: Option<Value>, callback: Option<Callback>) -> Request {
        self.request_with(Method::Put, url, data, callback)
    }

    /// The cookie jar, unless cookies are disabled.
    pub fn cookie_jar(&self) -> Option<CookieJarHandle> {
        self.context.cookie_jar.clone()
    }

    pub fn activity(&self) -> ActivityIndicator {
        self.context.activity.clone()
    }
}

#[derive(Default)]
pub struct AgentBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    cookie_jar: Option<CookieJarHandle>,
}

impl AgentBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn config(self, config: Config) -> Self {
        self.map(|b| b.config = config)
    }

    /// Replaces the reqwest transport. The cache settings of the config are
    /// then up to the given transport.
    pub fn transport(self, transport: Arc<dyn Transport>) -> Self {
        self.map(|b| b.transport = Some(transport))
    }

    /// Uses `jar` instead of the one described by the config.
    pub fn cookie_jar(self, jar: CookieJarHandle) -> Self {
        self.map(|b| b.cookie_jar = Some(jar))
    }

    pub fn build(self) -> Result<Agent, TransportError> {
        let transport = match self.transport.clone() {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::from_config(&self.config)?),
        };
        Ok(self.assemble(transport))
    }

    fn assemble(self, transport: Arc<dyn Transport>) -> Agent {
        let cookie_jar = self
            .cookie_jar
            .or_else(|| cookie_jar_for(&self.config.cookie_jar));

        Agent {
            context: Arc::new(AgentContext {
                transport,
                cookie_jar,
                activity: ActivityIndicator::new(
                    self.config.activation_delay,
                    self.config.completion_delay,
                ),
            }),
        }
    }
}

fn cookie_jar_for(config: &CookieJarConfig) -> Option<CookieJarHandle> {
    match config {
        CookieJarConfig::Disabled => None,
        CookieJarConfig::Memory => Some(DefaultCookieJar::new().into()),
        CookieJarConfig::File {
            location,
            persist_sessions,
        } => {
            log::debug!("Using cookie file {}", location.display());
            let store: CookieStoreHandle = Arc::new(JsonCookieStore::new(location.clone()));
            let jar = PersistentCookieJar::open(store, *persist_sessions);
            Some(Arc::new(RwLock::new(jar)))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use http::{HeaderMap, HeaderName, HeaderValue};

    use crate::config::CacheConfig;
    use crate::net::{
        ProgressSender, TlsInfo, TransportBody, TransportErrorCode, TransportReply,
        TransportRequest, TransportSignal,
    };

    /// One scripted transport reaction, consumed in order.
    pub(crate) enum Step {
        Reply {
            status: u16,
            headers: Vec<(String, String)>,
            body: String,
            signals: bool,
        },
        Fail(TransportErrorCode),
        /// Never completes.
        Hang,
    }

    impl Step {
        pub fn reply(status: u16, headers: &[(&str, &str)], body: &str) -> Self {
            Step::Reply {
                status,
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: body.to_string(),
                signals: false,
            }
        }

        /// Also report a TLS handshake and two download progress steps.
        pub fn with_signals(self) -> Self {
            match self {
                Step::Reply {
                    status,
                    headers,
                    body,
                    ..
                } => Step::Reply {
                    status,
                    headers,
                    body,
                    signals: true,
                },
                other => other,
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        pub fn requests(&self) -> Vec<TransportRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl TransportRequest {
        pub(crate) fn body_bytes(&self) -> Vec<u8> {
            match &self.body {
                TransportBody::Bytes(bytes) => bytes.to_vec(),
                _ => Vec::new(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn execute(
            &self,
            request: TransportRequest,
            progress: ProgressSender,
        ) -> BoxFuture<'static, Result<TransportReply, TransportError>> {
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);
            let step = self.steps.lock().unwrap().pop_front();

            Box::pin(async move {
                match step {
                    Some(Step::Reply {
                        status,
                        headers,
                        body,
                        signals,
                    }) => {
                        if signals {
                            let total = Some(body.len() as u64);
                            let _ = progress.send(TransportSignal::SecureConnect(TlsInfo::default()));
                            let _ = progress.send(TransportSignal::DownloadProgress { loaded: 2, total });
                            let _ = progress.send(TransportSignal::DownloadProgress {
                                loaded: body.len() as u64,
                                total,
                            });
                        }

                        let mut map = HeaderMap::new();
                        for (name, value) in headers {
                            map.append(
                                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                                HeaderValue::from_str(&value).unwrap(),
                            );
                        }
                        Ok(TransportReply {
                            url,
                            status,
                            headers: map,
                            body: Bytes::from(body),
                            from_cache: false,
                        })
                    }
                    Some(Step::Fail(code)) => Err(TransportError::new(code, "scripted failure")),
                    Some(Step::Hang) => futures::future::pending().await,
                    None => Err(TransportError::new(
                        TransportErrorCode::Unknown,
                        "no scripted reply left",
                    )),
                }
            })
        }
    }

    /// An agent with a memory cookie jar whose transport replays `steps`.
    pub(crate) fn scripted_agent(steps: Vec<Step>) -> (Agent, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        });
        let config = Config::builder()
            .cache(CacheConfig::Disabled)
            .cookie_jar(CookieJarConfig::Memory)
            .build()
            .unwrap();
        let agent = Agent::builder()
            .config(config)
            .transport(transport.clone())
            .build()
            .unwrap();
        (agent, transport)
    }

    #[test]
    fn verbs_map_to_methods() {
        let (agent, _) = scripted_agent(vec![]);
        assert_eq!(agent.get("http://a/").method(), Method::Get);
        assert_eq!(agent.head("http://a/").method(), Method::Head);
        assert_eq!(agent.del("http://a/").method(), Method::Delete);
        assert_eq!(agent.patch("http://a/").method(), Method::Patch);
        assert_eq!(agent.post("http://a/").method(), Method::Post);
        assert_eq!(agent.put("http://a/").method(), Method::Put);
    }

    #[tokio::test]
    async fn post_with_sends_data_and_ends() {
        let (agent, transport) = scripted_agent(vec![Step::reply(201, &[], "")]);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback: Callback = Box::new(move |result| {
            let _ = tx.send(result.map(|res| res.status()));
        });

        let request = agent.post_with(
            "http://example.com/items",
            Some(serde_json::json!({ "name": "widget" })),
            Some(callback),
        );

        assert_eq!(rx.await.unwrap().unwrap(), 201);
        assert_eq!(request.state(), crate::request::RequestState::Completed);
        let sent = transport.requests();
        assert_eq!(sent[0].method, http::Method::POST);
        assert_eq!(sent[0].body_bytes(), br#"{"name":"widget"}"#);
    }

    #[test]
    fn get_with_turns_data_into_query() {
        let (agent, transport) = scripted_agent(vec![]);
        let request = agent.get_with("http://example.com/", Some(serde_json::json!({ "page": 2 })), None);
        assert_eq!(request.query_string(), "page=2");
        assert!(request.body().is_none());

        let request = agent.del_with("http://example.com/1", None);
        assert_eq!(request.method(), Method::Delete);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn with_transport_keeps_config() {
        let config = Config::builder()
            .cache(CacheConfig::Disabled)
            .cookie_jar(CookieJarConfig::Disabled)
            .activation_delay(std::time::Duration::from_millis(5))
            .build()
            .unwrap();
        let agent = Agent::with_transport(config, Arc::new(ScriptedTransport::default()));
        assert!(agent.cookie_jar().is_none());
        assert_eq!(agent.activity().count(), 0);

        let req = agent.get("http://example.com/");
        assert_eq!(req.method(), Method::Get);
    }

    #[test]
    fn cookie_jar_follows_config() {
        assert!(cookie_jar_for(&CookieJarConfig::Disabled).is_none());

        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("cookies.json");
        let jar = cookie_jar_for(&CookieJarConfig::File {
            location: location.clone(),
            persist_sessions: false,
        })
        .unwrap();
        jar.write()
            .unwrap()
            .add_cookie("token=1; Max-Age=3600; Domain=example.com; Path=/");
        assert!(location.exists());
    }

    #[test]
    fn explicit_jar_overrides_config() {
        let jar: CookieJarHandle = DefaultCookieJar::new().into();
        jar.write().unwrap().add_cookie("a=1");

        let config = Config::builder()
            .cache(CacheConfig::Disabled)
            .cookie_jar(CookieJarConfig::Disabled)
            .build()
            .unwrap();
        let agent = Agent::builder()
            .config(config)
            .transport(Arc::new(ScriptedTransport::default()))
            .cookie_jar(jar)
            .build()
            .unwrap();
        assert_eq!(agent.cookie_jar().unwrap().read().unwrap().cookies(), "a=1");
    }
}
