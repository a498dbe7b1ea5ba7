//! Cookies: [`CookieJar`], [`CookieStore`] and backends.

mod cookie_jar;
mod cookies;
mod persistent_cookie_jar;
mod store;

pub use cookies::Cookie;
pub use cookies::CookieJarHandle;
pub use cookies::CookieStoreHandle;

pub use cookie_jar::CookieJar;
pub use cookie_jar::DefaultCookieJar;
pub use persistent_cookie_jar::PersistentCookieJar;

pub use store::CookieStore;
pub use store::InMemoryCookieStore;
pub use store::JsonCookieStore;
