//! Cookie jar that survives restarts by mirroring into a [`SessionStore`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::session::{SessionStore, COOKIES_KEY};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedCookie {
    url: String,
    raw: String,
}

/// `reqwest` cookie store whose `Set-Cookie` headers are also written to a
/// session store and replayed into the jar on load.
///
/// Expiry is left to the jar: an expired or deleted cookie is saved like any
/// other and simply dropped again when replayed.
pub struct PersistentCookies {
    jar: Jar,
    store: Arc<dyn SessionStore>,
}

impl PersistentCookies {
    /// Build a jar seeded with the cookies saved in `store`.
    pub fn load(store: Arc<dyn SessionStore>) -> Self {
        let jar = Jar::default();
        let saved = read_saved(store.as_ref());
        for cookie in saved.values() {
            match cookie.url.parse::<Url>() {
                Ok(url) => jar.add_cookie_str(&cookie.raw, &url),
                Err(e) => tracing::warn!("Dropping saved cookie for {:?}: {}", cookie.url, e),
            }
        }
        tracing::debug!("Loaded {} saved cookies", saved.len());
        Self { jar, store }
    }
}

impl fmt::Debug for PersistentCookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCookies").finish_non_exhaustive()
    }
}

impl CookieStore for PersistentCookies {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<HeaderValue> = cookie_headers.cloned().collect();
        self.jar.set_cookies(&mut headers.iter(), url);

        let mut saved = read_saved(self.store.as_ref());
        for raw in headers.iter().filter_map(|header| header.to_str().ok()) {
            let name = raw.split(['=', ';']).next().unwrap_or_default().trim();
            if name.is_empty() {
                continue;
            }
            saved.insert(
                name.to_string(),
                SavedCookie {
                    url: url.to_string(),
                    raw: raw.to_string(),
                },
            );
        }

        let written = serde_json::to_string(&saved)
            .map_err(crate::Error::from)
            .and_then(|json| self.store.set(COOKIES_KEY, &json));
        if let Err(e) = written {
            tracing::warn!("Failed to save cookies: {}", e);
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}

fn read_saved(store: &dyn SessionStore) -> BTreeMap<String, SavedCookie> {
    let Some(raw) = store.get(COOKIES_KEY) else {
        return BTreeMap::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable saved cookies: {}", e);
        BTreeMap::new()
    })
}
