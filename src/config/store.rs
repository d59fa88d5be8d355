//! Runtime hub configuration
//!
//! The whole [`HubConfig`] tree persists as one JSON document in a
//! single-row table (`id = 1`, same convention as the settings row the
//! mobile API edits). Reads come from an `ArcSwap` cache so hot paths never
//! touch the database; there is exactly one write path, and every write
//! bumps a revision watch channel that long-lived tasks can poll for
//! hot-reload.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::sync::watch;

use super::HubConfig;
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    cache: Arc<ArcSwap<HubConfig>>,
    revision: Arc<watch::Sender<u64>>,
}

impl ConfigStore {
    /// Open (or create) the database and load the configuration row,
    /// seeding defaults on first start
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            // Capture rows cascade with their notification
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            // SQLite is single-writer; two connections keep reads from
            // blocking behind the writer on small appliances
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hub_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM hub_config WHERE id = 1")
                .fetch_optional(&pool)
                .await?;

        let config = match row {
            Some((json,)) => serde_json::from_str(&json).map_err(|e| {
                AppError::Config(format!("stored hub config is unreadable: {}", e))
            })?,
            None => {
                let defaults = HubConfig::default();
                Self::write_row(&pool, &defaults).await?;
                defaults
            }
        };

        let (revision, _) = watch::channel(0);

        Ok(Self {
            pool,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            revision: Arc::new(revision),
        })
    }

    /// Current configuration (lock-free)
    pub fn get(&self) -> Arc<HubConfig> {
        self.cache.load_full()
    }

    /// Mutate the configuration through a closure and persist the result
    ///
    /// The closure sees a copy of the current tree; the database row and
    /// the cache only change if persisting succeeds. Concurrent updates
    /// are last-write-wins, which is fine for operator-driven changes.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut HubConfig),
    {
        let mut next = HubConfig::clone(&self.cache.load());
        mutate(&mut next);

        Self::write_row(&self.pool, &next).await?;
        self.cache.store(Arc::new(next));
        self.revision.send_modify(|r| *r += 1);

        Ok(())
    }

    /// Revision watch; the value increments on every persisted update
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// The database pool, shared with the persistence stores
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn write_row(pool: &Pool<Sqlite>, config: &HubConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;

        sqlx::query("INSERT OR REPLACE INTO hub_config (id, data, updated_at) VALUES (1, ?1, ?2)")
            .bind(&json)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_first_open_seeds_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("hub.db")).await.unwrap();
        assert_eq!(store.get().motion_rate_limit_minutes, 1);
        assert_eq!(store.get().web.http_port, 8000);
    }

    #[tokio::test]
    async fn test_update_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("hub.db");

        let store = ConfigStore::open(&db_path).await.unwrap();
        store
            .update(|c| {
                c.motion_rate_limit_minutes = 5;
                c.owner_user_id = 7;
            })
            .await
            .unwrap();

        let config = store.get();
        assert_eq!(config.motion_rate_limit_minutes, 5);
        assert_eq!(config.owner_user_id, 7);

        drop(store);
        let reopened = ConfigStore::open(&db_path).await.unwrap();
        let config = reopened.get();
        assert_eq!(config.motion_rate_limit_minutes, 5);
        assert_eq!(config.owner_user_id, 7);
    }

    #[tokio::test]
    async fn test_update_bumps_revision() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("hub.db")).await.unwrap();

        let mut rx = store.subscribe();
        let before = *rx.borrow_and_update();

        store.update(|c| c.web.http_port = 9000).await.unwrap();

        rx.changed().await.unwrap();
        assert!(*rx.borrow() > before);
    }

    #[tokio::test]
    async fn test_only_one_row_ever_exists() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("hub.db")).await.unwrap();

        for port in [9000u16, 9001, 9002] {
            store.update(|c| c.web.http_port = port).await.unwrap();
        }

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hub_config")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get().web.http_port, 9002);
    }
}
