//! GET reply cache.
//!
//! Only replies that carry an explicit `Cache-Control: max-age` and no
//! `no-store` are stored. Entries are served while fresh.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::CACHE_CONTROL;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

const INDEX_FILE: &str = "duperagent-cache.json";

/// Headers that belong to one exchange and are never replayed from the cache.
const UNSTORED_HEADERS: &[&str] = &[
    "set-cookie",
    "set-cookie2",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_stored_header(name: &str) -> bool {
    !UNSTORED_HEADERS
        .iter()
        .any(|unstored| name.eq_ignore_ascii_case(unstored))
}

/// A stored reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    /// Unix seconds at which the entry was stored.
    pub stored_at: u64,
    pub max_age: u64,
}

impl CachedReply {
    /// Builds an entry for a reply if its headers allow caching.
    pub fn from_reply(status: u16, headers: &HeaderMap, body: &[u8]) -> Option<Self> {
        if status != 200 {
            return None;
        }
        let max_age = cache_max_age(headers)?;
        Some(Self {
            status,
            headers: headers
                .iter()
                .filter(|(k, _)| is_stored_header(k.as_str()))
                .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                .collect(),
            body: body.to_vec(),
            stored_at: now_secs(),
            max_age,
        })
    }

    pub fn is_fresh(&self) -> bool {
        now_secs() < self.stored_at.saturating_add(self.max_age)
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in self.headers.iter().filter(|(n, _)| is_stored_header(n)) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn body(&self) -> Bytes {
        Bytes::from(self.body.clone())
    }
}

/// Storage for cached replies, keyed by absolute URL.
pub trait CacheStore: Send + Sync {
    fn get(&self, url: &str) -> Option<CachedReply>;
    fn put(&self, url: &str, entry: CachedReply);
}

/// Returns the `max-age` of a cacheable reply, `None` when it must not be stored.
pub(crate) fn cache_max_age(headers: &HeaderMap) -> Option<u64> {
    let mut max_age = None;
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else { continue };
        for directive in value.split(',').map(str::trim) {
            let lower = directive.to_ascii_lowercase();
            if lower == "no-store" || lower == "no-cache" || lower == "private" {
                return None;
            }
            if let Some(secs) = lower.strip_prefix("max-age=") {
                max_age = secs.trim_matches('"').parse::<u64>().ok();
            }
        }
    }
    max_age.filter(|secs| *secs > 0)
}

/// Returns true when the request headers ask to bypass the cache.
pub(crate) fn bypasses_cache(headers: &HeaderMap) -> bool {
    headers.get_all(CACHE_CONTROL).iter().any(|v| {
        v.to_str()
            .map(|s| {
                let s = s.to_ascii_lowercase();
                s.contains("no-cache") || s.contains("no-store")
            })
            .unwrap_or(false)
    })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Cache kept in memory only.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CachedReply>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, url: &str) -> Option<CachedReply> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(url).filter(|e| e.is_fresh()).cloned()
    }

    fn put(&self, url: &str, entry: CachedReply) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(url.to_string(), entry);
    }
}

/// Size-bounded cache persisted as one JSON index in a directory.
///
/// When the total body size exceeds `max_size` the oldest entries are
/// evicted first.
pub struct DiskCache {
    path: PathBuf,
    max_size: u64,
    entries: Mutex<HashMap<String, CachedReply>>,
}

impl DiskCache {
    pub fn open(location: impl AsRef<Path>, max_size: u64) -> io::Result<Self> {
        let dir = location.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(INDEX_FILE);

        let entries = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                log::warn!("Discarding unreadable cache index {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            path,
            max_size,
            entries: Mutex::new(entries),
        })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn evict(&self, entries: &mut HashMap<String, CachedReply>) {
        let mut total: u64 = entries.values().map(|e| e.body.len() as u64).sum();
        if total <= self.max_size {
            return;
        }

        let mut by_age: Vec<(String, u64, u64)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.stored_at, e.body.len() as u64))
            .collect();
        by_age.sort_by_key(|(_, stored_at, _)| *stored_at);

        for (key, _, size) in by_age {
            if total <= self.max_size {
                break;
            }
            entries.remove(&key);
            total -= size;
        }
    }

    fn persist(&self, entries: &HashMap<String, CachedReply>) -> io::Result<()> {
        let data = serde_json::to_vec(entries).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)
    }
}

impl CacheStore for DiskCache {
    fn get(&self, url: &str) -> Option<CachedReply> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(url).filter(|e| e.is_fresh()).cloned()
    }

    fn put(&self, url: &str, entry: CachedReply) {
        if entry.body.len() as u64 > self.max_size {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| e.is_fresh());
        entries.insert(url.to_string(), entry);
        self.evict(&mut entries);

        if let Err(e) = self.persist(&entries) {
            log::error!("Failed to write cache index {}: {}", self.path.display(), e);
        }
    }
}

mod base64_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
