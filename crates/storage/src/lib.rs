//! Durable storage for the session credential.
//!
//! The credential and the refresh cookie each live under a fixed key so that
//! every context of the client reading the same database sees the same
//! session.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use shared::domain::{Credential, CREDENTIAL_STORAGE_KEY, REFRESH_COOKIE_NAME};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

/// Holder of the current bearer credential.
///
/// `current` is a cheap synchronous read of the cached value; every mutation
/// is published to `subscribe` receivers. `clear` drops the refresh cookie
/// along with the credential.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn current(&self) -> Option<Credential>;
    async fn save(&self, credential: &Credential) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    fn subscribe(&self) -> watch::Receiver<Option<Credential>>;

    /// Value of the refresh cookie backing the session, if one is held.
    fn refresh_cookie(&self) -> Option<String>;

    /// Replaces the refresh cookie (`None` deletes it). The cached value is
    /// updated before this returns; the future only finishes persisting it.
    fn save_refresh_cookie(&self, value: Option<String>) -> BoxFuture<'static, Result<()>>;
}

/// Process-local store. Nothing survives a restart.
pub struct MemoryCredentialStore {
    tx: watch::Sender<Option<Credential>>,
    cookie: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::with_credential(None)
    }

    pub fn with_credential(credential: Option<Credential>) -> Self {
        let (tx, _) = watch::channel(credential);
        Self {
            tx,
            cookie: Mutex::new(None),
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        self.tx.send_replace(Some(credential.clone()));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *lock_cookie(&self.cookie) = None;
        self.tx.send_replace(None);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }

    fn refresh_cookie(&self) -> Option<String> {
        lock_cookie(&self.cookie).clone()
    }

    fn save_refresh_cookie(&self, value: Option<String>) -> BoxFuture<'static, Result<()>> {
        *lock_cookie(&self.cookie) = value;
        futures::future::ok(()).boxed()
    }
}

/// SQLite-backed store. Other processes pointed at the same database file
/// observe changes through [`SqliteCredentialStore::sync_from_disk`] or the
/// polling watcher.
pub struct SqliteCredentialStore {
    pool: Pool<Sqlite>,
    tx: watch::Sender<Option<Credential>>,
    cookie: Mutex<Option<String>>,
}

impl SqliteCredentialStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open credential store at '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate credential store")?;

        let persisted = load_credential(&pool).await?;
        let cookie = load_value(&pool, REFRESH_COOKIE_NAME).await?;
        info!(
            has_credential = persisted.is_some(),
            has_refresh_cookie = cookie.is_some(),
            "storage: credential store opened"
        );
        let (tx, _) = watch::channel(persisted);
        Ok(Self {
            pool,
            tx,
            cookie: Mutex::new(cookie),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Re-reads the persisted credential and refresh cookie, publishing the
    /// credential if it differs from the cached one. Returns whether either
    /// value changed.
    pub async fn sync_from_disk(&self) -> Result<bool> {
        let persisted = load_credential(&self.pool).await?;
        let cookie = load_value(&self.pool, REFRESH_COOKIE_NAME).await?;
        let cookie_changed = {
            let mut cached = lock_cookie(&self.cookie);
            let changed = *cached != cookie;
            *cached = cookie;
            changed
        };
        let changed = self.tx.send_if_modified(|cached| {
            if *cached == persisted {
                return false;
            }
            *cached = persisted;
            true
        }) || cookie_changed;
        if changed {
            debug!("storage: credential changed by another context");
        }
        Ok(changed)
    }

    /// Polls the database every `interval` until the store is dropped.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(err) = store.sync_from_disk().await {
                    warn!("storage: credential watcher poll failed: {err:#}");
                }
            }
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let value = serde_json::to_string(credential).context("failed to encode credential")?;
        upsert_value(&self.pool, CREDENTIAL_STORAGE_KEY, &value)
            .await
            .context("failed to persist credential")?;
        self.tx.send_replace(Some(credential.clone()));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key IN (?1, ?2)")
            .bind(CREDENTIAL_STORAGE_KEY)
            .bind(REFRESH_COOKIE_NAME)
            .execute(&self.pool)
            .await
            .context("failed to clear credential")?;
        *lock_cookie(&self.cookie) = None;
        self.tx.send_replace(None);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }

    fn refresh_cookie(&self) -> Option<String> {
        lock_cookie(&self.cookie).clone()
    }

    fn save_refresh_cookie(&self, value: Option<String>) -> BoxFuture<'static, Result<()>> {
        *lock_cookie(&self.cookie) = value.clone();
        let pool = self.pool.clone();
        async move {
            let written = match value {
                Some(value) => upsert_value(&pool, REFRESH_COOKIE_NAME, &value).await,
                None => sqlx::query("DELETE FROM kv_store WHERE key = ?1")
                    .bind(REFRESH_COOKIE_NAME)
                    .execute(&pool)
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from),
            };
            written.context("failed to persist refresh cookie")
        }
        .boxed()
    }
}

fn lock_cookie(cookie: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    cookie.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn upsert_value(pool: &Pool<Sqlite>, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO kv_store (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

async fn load_value(pool: &Pool<Sqlite>, key: &str) -> Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to read '{key}'"))?;
    match row {
        Some(row) => Ok(Some(row.try_get("value")?)),
        None => Ok(None),
    }
}

async fn load_credential(pool: &Pool<Sqlite>) -> Result<Option<Credential>> {
    let Some(raw) = load_value(pool, CREDENTIAL_STORAGE_KEY).await? else {
        return Ok(None);
    };
    match serde_json::from_str::<Credential>(&raw) {
        Ok(credential) => Ok(Some(credential)),
        Err(err) => {
            warn!("storage: discarding unreadable persisted credential: {err}");
            Ok(None)
        }
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
