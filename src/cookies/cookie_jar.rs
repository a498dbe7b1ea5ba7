//! Cookie jar abstraction and an in-memory implementation.
//!
//! A jar keeps cookies keyed by their identity (domain, path, name).
//! Implementations supply the primitive mutations; matching, `Set-Cookie`
//! handling and the `Cookie` header are provided on top of them.

use http::header::SET_COOKIE;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cookies::Cookie;

pub trait CookieJar: Send + Sync {
    /// Inserts `cookie`, replacing one with the same identity.
    ///
    /// Returns `false` and leaves the jar untouched when the cookie is not
    /// acceptable (empty name).
    fn insert_cookie(&mut self, cookie: Cookie) -> bool;

    /// Removes the cookie with the same identity. Returns `false` if there
    /// was none.
    fn delete_cookie(&mut self, cookie: &Cookie) -> bool;

    /// Every cookie in the jar, session cookies included.
    fn all_cookies(&self) -> Vec<Cookie>;

    /// Removes all cookies from the jar.
    fn clear_all(&mut self);

    /// Looks up the cookie sharing `cookie`'s identity.
    fn find(&self, cookie: &Cookie) -> Option<Cookie> {
        self.all_cookies()
            .into_iter()
            .find(|c| c.same_identity(cookie))
    }

    /// Adds cookies from a `Set-Cookie` style string (newline-separated for
    /// several). An existing HTTP-only cookie with the same identity is kept.
    ///
    /// A cookie without a `Domain` attribute is stored but never sent; use
    /// [`add_cookie_for`](CookieJar::add_cookie_for) to scope it to a host.
    fn add_cookie(&mut self, raw: &str) {
        add_parsed(self, Cookie::parse_many(raw, None));
    }

    /// Like [`add_cookie`](CookieJar::add_cookie), with `url` supplying the
    /// host and path of cookies that lack them.
    fn add_cookie_for(&mut self, raw: &str, url: &Url) {
        add_parsed(self, Cookie::parse_many(raw, Some(url)));
    }

    /// All non-HTTP-only cookies as `name=value` pairs joined with `;`.
    fn cookies(&self) -> String {
        self.all_cookies()
            .iter()
            .filter(|c| !c.http_only)
            .map(Cookie::pair)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Applies the `Set-Cookie` headers of a reply for `url`.
    ///
    /// A cookie that arrives already expired deletes its stored counterpart.
    /// A `Domain` attribute the reply host does not belong to drops the cookie.
    fn store_response_cookies(&mut self, url: &Url, headers: &HeaderMap) {
        let host = url.host_str().unwrap_or_default();
        for header in headers.get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            let Some(cookie) = Cookie::parse(raw, Some(url)) else {
                log::debug!("Ignoring malformed Set-Cookie from {}: {}", url, raw);
                continue;
            };
            if !cookie.domain_matches(host) {
                log::warn!(
                    "Rejecting cookie '{}' from {} for foreign domain {:?}",
                    cookie.name,
                    host,
                    cookie.domain
                );
                continue;
            }

            if cookie.is_expired() {
                self.delete_cookie(&cookie);
            } else {
                self.insert_cookie(cookie);
            }
        }
    }

    /// Returns the `Cookie` request header value to send for `url`, if any.
    fn request_cookies(&self, url: &Url) -> Option<String> {
        let header = self
            .all_cookies()
            .iter()
            .filter(|c| c.matches(url))
            .map(Cookie::pair)
            .collect::<Vec<_>>()
            .join("; ");

        if header.is_empty() {
            None
        } else {
            Some(header)
        }
    }
}

fn add_parsed<J: CookieJar + ?Sized>(jar: &mut J, cookies: Vec<Cookie>) {
    for cookie in cookies {
        match jar.find(&cookie) {
            Some(existing) if existing.http_only => {
                log::debug!("Not replacing HTTP-only cookie '{}'", existing.name);
            }
            _ => {
                jar.insert_cookie(cookie);
            }
        }
    }
}

/// In-memory jar with no persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultCookieJar {
    pub entries: Vec<Cookie>,
}

impl DefaultCookieJar {
    /// Creates an empty in-memory cookie jar.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(cookies: Vec<Cookie>) -> Self {
        let mut jar = Self::new();
        for cookie in cookies {
            jar.insert_cookie(cookie);
        }
        jar
    }
}

impl CookieJar for DefaultCookieJar {
    fn insert_cookie(&mut self, cookie: Cookie) -> bool {
        if cookie.name.is_empty() {
            return false;
        }

        // Replace existing cookie with same identity
        if let Some(existing) = self.entries.iter_mut().find(|c| c.same_identity(&cookie)) {
            *existing = cookie;
        } else {
            self.entries.push(cookie);
        }
        true
    }

    fn delete_cookie(&mut self, cookie: &Cookie) -> bool {
        let before = self.entries.len();
        self.entries.retain(|c| !c.same_identity(cookie));
        self.entries.len() != before
    }

    fn all_cookies(&self) -> Vec<Cookie> {
        self.entries.clone()
    }

    fn clear_all(&mut self) {
        self.entries.clear();
    }
}

impl From<DefaultCookieJar> for crate::cookies::CookieJarHandle {
    fn from(jar: DefaultCookieJar) -> Self {
        std::sync::Arc::new(std::sync::RwLock::new(jar))
    }
}
