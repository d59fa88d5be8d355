use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

use super::parse_timestamp;
use crate::error::Result;

/// Registered push endpoint for one physical mobile device
#[derive(Debug, Clone)]
pub struct FcmDeviceRow {
    pub id: i64,
    pub user_id: i64,
    pub fcm_token: String,
    pub physical_device_id: String,
    pub device_type: Option<String>,
    pub app_version: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// FCM device store backed by SQLite
///
/// `(user_id, physical_device_id)` identifies a device; re-registration
/// rotates the token in place and refreshes `last_seen_at`.
#[derive(Clone)]
pub struct FcmDeviceStore {
    pool: Pool<Sqlite>,
}

impl FcmDeviceStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Register a device or refresh an existing registration
    pub async fn register(
        &self,
        user_id: i64,
        fcm_token: &str,
        physical_device_id: &str,
        device_type: Option<&str>,
        app_version: Option<&str>,
    ) -> Result<FcmDeviceRow> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // A token can only belong to one row; if it migrated to a new
        // physical device the stale registration goes away first
        sqlx::query(
            "DELETE FROM fcm_devices
             WHERE fcm_token = ?1 AND NOT (user_id = ?2 AND physical_device_id = ?3)",
        )
        .bind(fcm_token)
        .bind(user_id)
        .bind(physical_device_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO fcm_devices
                (user_id, fcm_token, physical_device_id, device_type, app_version,
                 last_seen_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
            ON CONFLICT(user_id, physical_device_id) DO UPDATE SET
                fcm_token = excluded.fcm_token,
                device_type = excluded.device_type,
                app_version = excluded.app_version,
                last_seen_at = excluded.last_seen_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(fcm_token)
        .bind(physical_device_id)
        .bind(device_type)
        .bind(app_version)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.find(user_id, physical_device_id).await?.ok_or_else(|| {
            crate::AppError::Internal("fcm device vanished after registration".into())
        })
    }

    pub async fn find(
        &self,
        user_id: i64,
        physical_device_id: &str,
    ) -> Result<Option<FcmDeviceRow>> {
        let row: Option<FcmDeviceTuple> = sqlx::query_as(
            "SELECT id, user_id, fcm_token, physical_device_id, device_type, app_version,
                    last_seen_at
             FROM fcm_devices WHERE user_id = ?1 AND physical_device_id = ?2",
        )
        .bind(user_id)
        .bind(physical_device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_from_tuple))
    }

    /// All push tokens registered for a user
    pub async fn tokens_for_user(&self, user_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT fcm_token FROM fcm_devices WHERE user_id = ?1 ORDER BY id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(token,)| token).collect())
    }

    /// Remove a token the provider reported as permanently unregistered
    pub async fn delete_token(&self, fcm_token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM fcm_devices WHERE fcm_token = ?1")
            .bind(fcm_token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

type FcmDeviceTuple = (
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn row_from_tuple(t: FcmDeviceTuple) -> FcmDeviceRow {
    FcmDeviceRow {
        id: t.0,
        user_id: t.1,
        fcm_token: t.2,
        physical_device_id: t.3,
        device_type: t.4,
        app_version: t.5,
        last_seen_at: t.6.as_deref().map(parse_timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::test_pool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_register_twice_keeps_one_row() {
        let dir = tempdir().unwrap();
        let store = FcmDeviceStore::new(test_pool(&dir.path().join("t.db")).await);

        let first = store
            .register(7, "tk", "pixel-8", Some("android"), Some("1.0.0"))
            .await
            .unwrap();
        let second = store
            .register(7, "tk", "pixel-8", Some("android"), Some("1.0.1"))
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.app_version.as_deref(), Some("1.0.1"));
        assert!(second.last_seen_at.is_some());
        assert_eq!(store.tokens_for_user(7).await.unwrap(), vec!["tk"]);
    }

    #[tokio::test]
    async fn test_token_rotation_updates_in_place() {
        let dir = tempdir().unwrap();
        let store = FcmDeviceStore::new(test_pool(&dir.path().join("t.db")).await);

        store
            .register(7, "tk-old", "pixel-8", None, None)
            .await
            .unwrap();
        store
            .register(7, "tk-new", "pixel-8", None, None)
            .await
            .unwrap();

        assert_eq!(store.tokens_for_user(7).await.unwrap(), vec!["tk-new"]);
    }

    #[tokio::test]
    async fn test_token_migrates_between_devices() {
        let dir = tempdir().unwrap();
        let store = FcmDeviceStore::new(test_pool(&dir.path().join("t.db")).await);

        store.register(7, "tk", "old-phone", None, None).await.unwrap();
        store.register(7, "tk", "new-phone", None, None).await.unwrap();

        // The token is unique; the stale registration is gone
        assert_eq!(store.tokens_for_user(7).await.unwrap(), vec!["tk"]);
        assert!(store.find(7, "old-phone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_token() {
        let dir = tempdir().unwrap();
        let store = FcmDeviceStore::new(test_pool(&dir.path().join("t.db")).await);

        store.register(7, "tk", "pixel-8", None, None).await.unwrap();
        assert!(store.delete_token("tk").await.unwrap());
        assert!(store.tokens_for_user(7).await.unwrap().is_empty());
        assert!(!store.delete_token("tk").await.unwrap());
    }
}
