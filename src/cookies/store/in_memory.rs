use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::cookies::store::CookieStore;
use crate::cookies::Cookie;

/// Store that keeps the last saved snapshot in memory.
#[derive(Default)]
pub struct InMemoryCookieStore {
    cookies: Mutex<Vec<Cookie>>,
    saves: AtomicUsize,
}

impl InMemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cookies saved most recently.
    pub fn snapshot(&self) -> Vec<Cookie> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CookieStore for InMemoryCookieStore {
    fn load(&self) -> anyhow::Result<Vec<Cookie>> {
        Ok(self.snapshot())
    }

    fn save(&self, cookies: &[Cookie]) -> anyhow::Result<()> {
        *self.cookies.lock().unwrap_or_else(PoisonError::into_inner) = cookies.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
