//! Cookie core types.
//!
//! [`CookieJarHandle`] is `Arc<RwLock<dyn CookieJar>>`: take a read lock for
//! queries and a write lock for mutations. [`CookieStoreHandle`] points at a
//! persistence backend, which synchronizes itself.
//!
//! ```rust
//! use duperagent::cookies::Cookie;
//!
//! let c = Cookie::parse("session=abc123; Path=/; HttpOnly", None).unwrap();
//! assert_eq!(c.name, "session");
//! assert!(c.http_only);
//! assert!(c.is_session());
//! ```

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use url::Url;

use crate::cookies::store::CookieStore;
use crate::cookies::CookieJar;

/// Shared, lockable cookie jar.
pub type CookieJarHandle = Arc<RwLock<dyn CookieJar + Send + Sync>>;

/// Shared persistence backend.
pub type CookieStoreHandle = Arc<dyn CookieStore + Send + Sync>;

/// A cookie as stored and serialized by the jar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name (case-sensitive).
    pub name: String,

    /// Raw cookie value (not URL-decoded).
    pub value: String,

    pub path: Option<String>,

    /// Domain scoping, without a leading dot. A cookie without a domain is
    /// never sent.
    pub domain: Option<String>,

    /// Set when `domain` was taken from the reply host rather than a
    /// `Domain` attribute; such a cookie goes to that exact host only.
    #[serde(default)]
    pub host_only: bool,

    /// If `true`, cookie is sent only over HTTPS.
    pub secure: bool,

    /// Expiration timestamp in RFC 3339. Session cookies have `None`.
    pub expires: Option<String>,

    /// SameSite policy (`"Strict"`, `"Lax"`, or `"None"`).
    pub same_site: Option<String>,

    /// If `true`, the cookie is hidden from [`CookieJar::cookies`] and an
    /// existing copy is never replaced by [`CookieJar::add_cookie`].
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            host_only: false,
            secure: false,
            expires: None,
            same_site: None,
            http_only: false,
        }
    }

    /// Parses one `Set-Cookie` value.
    ///
    /// With a `url`, a missing `Domain` makes the cookie host-only for its
    /// host and a missing `Path` defaults to its directory. `Max-Age` takes
    /// precedence over `Expires`.
    pub fn parse(raw: &str, url: Option<&Url>) -> Option<Cookie> {
        let mut segments = raw.split(';');
        let (name, value) = segments.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        let mut max_age: Option<i64> = None;

        for part in segments {
            let part = part.trim();
            if let Some((k, v)) = part.split_once('=') {
                let v = v.trim();
                match k.trim().to_ascii_lowercase().as_str() {
                    "path" => cookie.path = Some(v.to_string()),
                    "domain" => {
                        let domain = v.trim_start_matches('.').to_ascii_lowercase();
                        if !domain.is_empty() {
                            cookie.domain = Some(domain);
                        }
                    }
                    "expires" => cookie.expires = parse_http_date(v).and_then(format_rfc3339),
                    "max-age" => max_age = v.parse().ok(),
                    "samesite" => {
                        // normalize to "Lax" | "Strict" | "None"
                        cookie.same_site = Some(if v.eq_ignore_ascii_case("lax") {
                            "Lax".to_string()
                        } else if v.eq_ignore_ascii_case("strict") {
                            "Strict".to_string()
                        } else if v.eq_ignore_ascii_case("none") {
                            "None".to_string()
                        } else {
                            v.to_string()
                        });
                    }
                    _ => {}
                }
            } else if part.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if part.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            }
        }

        if let Some(secs) = max_age {
            let expires = if secs <= 0 {
                OffsetDateTime::UNIX_EPOCH
            } else {
                OffsetDateTime::now_utc().saturating_add(Duration::seconds(secs))
            };
            cookie.expires = format_rfc3339(expires);
        }

        if let Some(url) = url {
            if cookie.domain.is_none() {
                cookie.domain = url.host_str().map(str::to_ascii_lowercase);
                cookie.host_only = cookie.domain.is_some();
            }
            if cookie.path.is_none() {
                cookie.path = Some(default_path(url).to_string());
            }
        }

        Some(cookie)
    }

    /// Parses several newline-separated `Set-Cookie` values, skipping bad ones.
    pub fn parse_many(raw: &str, url: Option<&Url>) -> Vec<Cookie> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| Cookie::parse(line, url))
            .collect()
    }

    /// True when the cookie has no expiry and lives only for this process.
    pub fn is_session(&self) -> bool {
        self.expires.is_none()
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires
            .as_deref()
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at()
            .is_some_and(|at| at <= OffsetDateTime::now_utc())
    }

    /// Returns true when both cookies share domain, path and name.
    pub fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    /// Returns true when `host` may receive or set this cookie.
    pub fn domain_matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match &self.domain {
            Some(domain) if self.host_only => host == *domain,
            Some(domain) => {
                host == *domain
                    || (host.ends_with(domain.as_str())
                        && host[..host.len() - domain.len()].ends_with('.'))
            }
            None => false,
        }
    }

    /// Returns true when the cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let domain_ok = self.domain_matches(url.host_str().unwrap_or_default());
        let path_ok = match &self.path {
            Some(cookie_path) => path_matches(cookie_path, url.path()),
            None => true,
        };
        let secure_ok = !self.secure || url.scheme() == "https";

        domain_ok && path_ok && secure_ok && !self.is_expired()
    }

    /// `name=value` as sent in a `Cookie` header.
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// `/api` covers `/api` and `/api/x` but not `/apix`.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    match request_path.strip_prefix(cookie_path) {
        Some(rest) => rest.is_empty() || cookie_path.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

fn default_path(url: &Url) -> &str {
    url.path()
        .rsplit_once('/')
        .map_or("/", |(a, _)| if a.is_empty() { "/" } else { a })
}

fn format_rfc3339(at: OffsetDateTime) -> Option<String> {
    at.format(&Rfc3339).ok()
}

/// Parses the date formats seen in `Expires` attributes.
fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let imf = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    let rfc850 = format_description!(
        "[weekday repr:short], [day]-[month repr:short]-[year] [hour]:[minute]:[second] GMT"
    );

    PrimitiveDateTime::parse(value, imf)
        .or_else(|_| PrimitiveDateTime::parse(value, rfc850))
        .map(PrimitiveDateTime::assume_utc)
        .ok()
        .or_else(|| OffsetDateTime::parse(value, &Rfc2822).ok())
}
