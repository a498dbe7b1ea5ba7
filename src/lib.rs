//! A fluent, promise-based HTTP client.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), duperagent::errors::RequestError> {
//! let res = duperagent::get("https://example.com/api/items")
//!     .accept("json")
//!     .query(serde_json::json!({ "page": 2 }))
//!     .send_async()
//!     .await?;
//! println!("{} {:?}", res.status(), res.json());
//! # Ok(()) }
//! ```
//!
//! The verb functions below use the process-wide [`Agent`](agent::Agent).
//! Call [`config`] before the first request to change its cache, cookie jar
//! or proxy settings.

pub mod activity;
pub mod agent;
pub mod codec;
pub mod config;
pub mod content_types;
pub mod cookies;
pub mod errors;
pub mod logging;
pub mod multipart;
pub mod net;
pub mod promise;
pub mod request;
pub mod response;

pub use agent::Agent;
pub use config::configure as config;
pub use errors::{ErrorKind, RequestError};
pub use promise::{MultiPromiseExecutor, Promise, PromiseState, Reaction};
pub use request::{Callback, EventKind, Method, Request, RequestEvent};
pub use response::{Body, Response, ResponseType};

pub fn get(url: &str) -> Request {
    Agent::global().get(url)
}

pub fn head(url: &str) -> Request {
    Agent::global().head(url)
}

pub fn del(url: &str) -> Request {
    Agent::global().del(url)
}

pub fn patch(url: &str) -> Request {
    Agent::global().patch(url)
}

pub fn post(url: &str) -> Request {
    Agent::global().post(url)
}

pub fn put(url: &str) -> Request {
    Agent::global().put(url)
}

/// Like [`get`], with `data` as the query string and an optional callback
/// that ends the request.
pub fn get_with(url: &str, data: Option<serde_json::Value>, callback: Option<Callback>) -> Request {
    Agent::global().get_with(url, data, callback)
}

pub fn head_with(url: &str, data: Option<serde_json::Value>, callback: Option<Callback>) -> Request {
    Agent::global().head_with(url, data, callback)
}

pub fn del_with(url: &str, callback: Option<Callback>) -> Request {
    Agent::global().del_with(url, callback)
}

pub fn patch_with(url: &str, data: Option<serde_json::Value>, callback: Option<Callback>) -> Request {
    Agent::global().patch_with(url, data, callback)
}

/// Like [`post`], sending `data` and ending the request when a callback is
/// given.
pub fn post_with(url: &str, data: Option<serde_json::Value>, callback: Option<Callback>) -> Request {
    Agent::global().post_with(url, data, callback)
}

pub fn put_with(url: &str, data: Option<serde_json::Value>, callback: Option<Callback>) -> Request {
    Agent::global().put_with(url, data, callback)
}

/// A promise fulfilled with every input value, in input order, or rejected
/// with the first rejection.
pub fn all<T, E>(promises: impl IntoIterator<Item = Promise<T, E>>) -> Promise<Vec<T>, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<errors::PromiseError> + 'static,
{
    MultiPromiseExecutor::all(promises)
}

/// A promise settled like the first input to settle.
pub fn race<T, E>(promises: impl IntoIterator<Item = Promise<T, E>>) -> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<errors::PromiseError> + 'static,
{
    MultiPromiseExecutor::race(promises)
}
