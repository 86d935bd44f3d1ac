//! Cookie provider that keeps the refresh cookie in the credential store.
//!
//! Every other cookie stays in an in-memory [`Jar`]. Writes of the refresh
//! cookie are queued while reqwest hands us response headers and are awaited
//! by [`SessionCookieJar::flush`] before the response reaches the caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use reqwest::{
    cookie::{CookieStore, Jar},
    header::HeaderValue,
    Url,
};
use shared::domain::REFRESH_COOKIE_NAME;
use storage::CredentialStore;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

type PendingWrite = BoxFuture<'static, anyhow::Result<()>>;

pub struct SessionCookieJar {
    jar: Jar,
    credentials: Arc<dyn CredentialStore>,
    pending: Mutex<Vec<PendingWrite>>,
}

impl SessionCookieJar {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            jar: Jar::default(),
            credentials,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Waits for every queued refresh-cookie write to reach the store.
    pub async fn flush(&self) -> ClientResult<()> {
        let writes = std::mem::take(&mut *self.lock_pending());
        for write in writes {
            write.await.map_err(ClientError::Storage)?;
        }
        Ok(())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingWrite>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CookieStore for SessionCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let mut others = Vec::new();
        for header in cookie_headers {
            match parse_refresh_cookie(header) {
                Some(value) => {
                    debug!(present = value.is_some(), "cookies: refresh cookie updated");
                    let write = self.credentials.save_refresh_cookie(value);
                    self.lock_pending().push(write);
                }
                None => others.push(header),
            }
        }
        self.jar.set_cookies(&mut others.into_iter(), url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let others = self
            .jar
            .cookies(url)
            .and_then(|header| header.to_str().ok().map(str::to_string));
        let refresh = self
            .credentials
            .refresh_cookie()
            .map(|value| format!("{REFRESH_COOKIE_NAME}={value}"));
        let joined = others
            .into_iter()
            .chain(refresh)
            .collect::<Vec<_>>()
            .join("; ");
        if joined.is_empty() {
            return None;
        }
        HeaderValue::from_str(&joined).ok()
    }
}

/// `None` when the header sets some other cookie, `Some(None)` when it
/// deletes the refresh cookie.
fn parse_refresh_cookie(header: &HeaderValue) -> Option<Option<String>> {
    let raw = header.to_str().ok()?;
    let mut parts = raw.split(';').map(str::trim);
    let (name, value) = parts.next()?.split_once('=')?;
    if name.trim() != REFRESH_COOKIE_NAME {
        return None;
    }
    let value = value.trim().trim_matches('"');
    let expired = parts.any(|attribute| {
        attribute.split_once('=').is_some_and(|(key, age)| {
            key.trim().eq_ignore_ascii_case("max-age")
                && age.trim().parse::<i64>().is_ok_and(|age| age <= 0)
        })
    });
    if value.is_empty() || expired {
        Some(None)
    } else {
        Some(Some(value.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/cookies_tests.rs"]
mod tests;
