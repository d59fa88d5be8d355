use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

use super::parse_timestamp;
use crate::error::Result;

/// Capture row; `notification_id` is NULL when the originating event could
/// not be resolved at persist time
#[derive(Debug, Clone)]
pub struct CaptureRow {
    pub id: i64,
    pub notification_id: Option<i64>,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// Capture store backed by SQLite
#[derive(Clone)]
pub struct CaptureStore {
    pool: Pool<Sqlite>,
}

impl CaptureStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, notification_id: Option<i64>, path: &str) -> Result<CaptureRow> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO captures (notification_id, path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            "#,
        )
        .bind(notification_id)
        .bind(path)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(CaptureRow {
            id: result.last_insert_rowid(),
            notification_id,
            path: path.to_string(),
            created_at: now,
        })
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<CaptureRow>> {
        let row: Option<(i64, Option<i64>, String, String)> = sqlx::query_as(
            "SELECT id, notification_id, path, created_at FROM captures WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, notification_id, path, created_at)| CaptureRow {
            id,
            notification_id,
            path,
            created_at: parse_timestamp(&created_at),
        }))
    }

    pub async fn list_for_notification(&self, notification_id: i64) -> Result<Vec<CaptureRow>> {
        let rows: Vec<(i64, Option<i64>, String, String)> = sqlx::query_as(
            "SELECT id, notification_id, path, created_at FROM captures
             WHERE notification_id = ?1 ORDER BY id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, notification_id, path, created_at)| CaptureRow {
                id,
                notification_id,
                path,
                created_at: parse_timestamp(&created_at),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::test_pool;
    use crate::store::NotificationStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_insert_linked_and_unlinked() {
        let dir = tempdir().unwrap();
        let pool = test_pool(&dir.path().join("t.db")).await;
        let notifications = NotificationStore::new(pool.clone());
        let captures = CaptureStore::new(pool);

        let (notification, _) = notifications
            .create(7, "Doorbell Pressed", "button_pressed", "e1")
            .await
            .unwrap();

        let linked = captures
            .insert(Some(notification.id), "captures/a.jpg")
            .await
            .unwrap();
        assert_eq!(linked.notification_id, Some(notification.id));

        let unlinked = captures.insert(None, "captures/b.jpg").await.unwrap();
        assert_eq!(unlinked.notification_id, None);

        let rows = captures.list_for_notification(notification.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "captures/a.jpg");
    }

    #[tokio::test]
    async fn test_delete_notification_cascades() {
        let dir = tempdir().unwrap();
        let pool = test_pool(&dir.path().join("t.db")).await;
        let notifications = NotificationStore::new(pool.clone());
        let captures = CaptureStore::new(pool);

        let (notification, _) = notifications
            .create(7, "Motion Detected", "motion_detected", "e2")
            .await
            .unwrap();
        let capture = captures
            .insert(Some(notification.id), "captures/c.jpg")
            .await
            .unwrap();

        assert!(notifications.delete(notification.id).await.unwrap());
        assert!(captures.find_by_id(capture.id).await.unwrap().is_none());
    }
}
