use crate::cookies::cookie_jar::DefaultCookieJar;
use crate::cookies::{Cookie, CookieJar, CookieStoreHandle};

/// A `CookieJar` decorator that persists changes after each mutation.
///
/// Reads go straight to the in-memory jar. Every successful insert, delete
/// or clear writes a snapshot to the store; a failed mutation writes
/// nothing. Session cookies are left out of snapshots unless
/// `persist_sessions` is set.
pub struct PersistentCookieJar {
    /// Inner cookie jar that holds the actual cookie state.
    inner: DefaultCookieJar,
    /// Handle to the cookie store responsible for persistence.
    store: CookieStoreHandle,
    persist_sessions: bool,
}

impl PersistentCookieJar {
    /// Creates a jar backed by `store` and loads its saved cookies.
    pub fn open(store: CookieStoreHandle, persist_sessions: bool) -> Self {
        let mut jar = Self {
            inner: DefaultCookieJar::new(),
            store,
            persist_sessions,
        };
        jar.load();
        jar
    }

    /// Replaces the in-memory state with what the store holds. Expired
    /// cookies are dropped on the way in.
    pub fn load(&mut self) {
        match self.store.load() {
            Ok(cookies) => {
                let live = cookies.into_iter().filter(|c| !c.is_expired()).collect();
                self.inner = DefaultCookieJar::with_cookies(live);
            }
            Err(e) => log::error!("Failed to load cookies: {:#}", e),
        }
    }

    /// Writes a snapshot of the jar to the store.
    pub fn save(&self) {
        let snapshot: Vec<Cookie> = self
            .inner
            .entries
            .iter()
            .filter(|c| self.persist_sessions || !c.is_session())
            .filter(|c| !c.is_expired())
            .cloned()
            .collect();

        if let Err(e) = self.store.save(&snapshot) {
            log::error!("Failed to save cookies: {:#}", e);
        }
    }
}

impl CookieJar for PersistentCookieJar {
    fn insert_cookie(&mut self, cookie: Cookie) -> bool {
        let inserted = self.inner.insert_cookie(cookie);
        if inserted {
            self.save();
        }
        inserted
    }

    fn delete_cookie(&mut self, cookie: &Cookie) -> bool {
        let deleted = self.inner.delete_cookie(cookie);
        if deleted {
            self.save();
        }
        deleted
    }

    fn all_cookies(&self) -> Vec<Cookie> {
        self.inner.all_cookies()
    }

    fn clear_all(&mut self) {
        self.inner.clear_all();
        self.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::{InMemoryCookieStore, JsonCookieStore};
    use std::sync::Arc;

    fn persistent(name: &str, value: &str) -> Cookie {
        let mut c = Cookie::new(name, value);
        c.expires = Some("2999-01-01T00:00:00Z".into());
        c
    }

    #[test]
    fn mutations_are_persisted() {
        let store = Arc::new(InMemoryCookieStore::new());
        let mut jar = PersistentCookieJar::open(store.clone(), false);

        jar.insert_cookie(persistent("a", "1"));
        assert_eq!(store.snapshot().len(), 1);

        jar.delete_cookie(&persistent("a", ""));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn failed_mutation_does_not_persist() {
        let store = Arc::new(InMemoryCookieStore::new());
        let mut jar = PersistentCookieJar::open(store.clone(), false);

        assert!(!jar.delete_cookie(&persistent("missing", "")));
        assert!(!jar.insert_cookie(persistent("", "x")));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn session_cookies_stay_in_memory() {
        let store = Arc::new(InMemoryCookieStore::new());
        let mut jar = PersistentCookieJar::open(store.clone(), false);

        jar.insert_cookie(Cookie::new("session", "1"));
        jar.insert_cookie(persistent("kept", "2"));

        assert_eq!(jar.all_cookies().len(), 2);
        let saved = store.snapshot();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "kept");
    }

    #[test]
    fn persist_sessions_keeps_them() {
        let store = Arc::new(InMemoryCookieStore::new());
        let mut jar = PersistentCookieJar::open(store.clone(), true);
        jar.insert_cookie(Cookie::new("session", "1"));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn reload_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cookies.json");

        {
            let mut jar = PersistentCookieJar::open(Arc::new(JsonCookieStore::new(path.clone())), false);
            jar.add_cookie("a=1; Expires=Tue, 01 Jan 2999 00:00:00 GMT\nb=2");
        }

        let jar = PersistentCookieJar::open(Arc::new(JsonCookieStore::new(path)), false);
        assert_eq!(jar.cookies(), "a=1");
    }
}
