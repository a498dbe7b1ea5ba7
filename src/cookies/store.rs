//! Cookie persistence backends.
//!
//! A [`CookieStore`] only loads and saves whole cookie sets; the jar decides
//! when to save. Failures are reported to the caller, which logs them.

mod in_memory;
mod json;

pub use in_memory::InMemoryCookieStore;
pub use json::JsonCookieStore;

use crate::cookies::Cookie;

pub trait CookieStore: Send + Sync {
    /// Reads the saved cookies. A store that has never been written returns
    /// an empty set.
    fn load(&self) -> anyhow::Result<Vec<Cookie>>;

    /// Replaces the saved cookies with `cookies`.
    fn save(&self, cookies: &[Cookie]) -> anyhow::Result<()>;
}
