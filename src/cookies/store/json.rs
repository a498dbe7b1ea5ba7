//! JSON-backed cookie store.
//!
//! All cookies live in one JSON file (`{ "cookies": [...] }`). Writes go to
//! a temporary file first and are then renamed over the old one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::cookies::store::CookieStore;
use crate::cookies::Cookie;

/// On-disk representation of the cookie set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CookieStoreFile {
    cookies: Vec<Cookie>,
}

pub struct JsonCookieStore {
    /// Path to the JSON file where cookies are stored.
    path: PathBuf,
}

impl JsonCookieStore {
    /// Creates a store for `path`. Nothing is touched on disk until the
    /// first save.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CookieStore for JsonCookieStore {
    fn load(&self) -> anyhow::Result<Vec<Cookie>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };

        let file: CookieStoreFile = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(file.cookies)
    }

    fn save(&self, cookies: &[Cookie]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(&CookieStoreFile {
            cookies: cookies.to_vec(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
