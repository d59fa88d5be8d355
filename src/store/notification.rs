use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

use super::parse_timestamp;
use crate::error::Result;
use crate::messages::NotificationSummary;

/// Notification row
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: Option<i64>,
    pub title: String,
    pub notification_type: String,
    pub rpi_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRow {
    pub fn summary(&self) -> NotificationSummary {
        NotificationSummary {
            id: self.id,
            title: self.title.clone(),
            notification_type: self.notification_type.clone(),
            rpi_event_id: self.rpi_event_id.clone(),
            created_at: self.created_at,
        }
    }
}

type NotificationTuple = (i64, Option<i64>, String, String, Option<String>, String);

fn row_from_tuple(t: NotificationTuple) -> NotificationRow {
    NotificationRow {
        id: t.0,
        user_id: t.1,
        title: t.2,
        notification_type: t.3,
        rpi_event_id: t.4,
        created_at: parse_timestamp(&t.5),
    }
}

const SELECT_COLUMNS: &str = "id, user_id, title, type, rpi_event_id, created_at";

/// Notification store backed by SQLite
#[derive(Clone)]
pub struct NotificationStore {
    pool: Pool<Sqlite>,
}

impl NotificationStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert a notification, treating a duplicate `rpi_event_id` as an
    /// idempotent success.
    ///
    /// Returns the row and whether it was freshly created. The unique index
    /// on `rpi_event_id` absorbs device resends after a reconnect.
    pub async fn create(
        &self,
        user_id: i64,
        title: &str,
        notification_type: &str,
        rpi_event_id: &str,
    ) -> Result<(NotificationRow, bool)> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, title, type, rpi_event_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(rpi_event_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(title)
        .bind(notification_type)
        .bind(rpi_event_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        let row = self
            .find_by_event_id(rpi_event_id)
            .await?
            .ok_or_else(|| crate::AppError::Internal("notification vanished after insert".into()))?;

        Ok((row, created))
    }

    /// Look up a notification by the device event id that produced it
    pub async fn find_by_event_id(&self, rpi_event_id: &str) -> Result<Option<NotificationRow>> {
        let row: Option<NotificationTuple> = sqlx::query_as(&format!(
            "SELECT {} FROM notifications WHERE rpi_event_id = ?1",
            SELECT_COLUMNS
        ))
        .bind(rpi_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_from_tuple))
    }

    /// Creation time of the most recent notification of a type for a user;
    /// drives the motion rate limit
    pub async fn latest_created_at(
        &self,
        user_id: i64,
        notification_type: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT created_at FROM notifications
            WHERE user_id = ?1 AND type = ?2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(notification_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ts,)| parse_timestamp(&ts)))
    }

    /// Most recent notifications for a user, newest first
    pub async fn recent(&self, user_id: i64, limit: u32) -> Result<Vec<NotificationRow>> {
        let rows: Vec<NotificationTuple> = sqlx::query_as(&format!(
            "SELECT {} FROM notifications WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_from_tuple).collect())
    }

    /// Delete a notification; captures cascade
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::test_pool;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_and_find() {
        let dir = tempdir().unwrap();
        let store = NotificationStore::new(test_pool(&dir.path().join("t.db")).await);

        let (row, created) = store
            .create(7, "Doorbell Pressed", "button_pressed", "e1")
            .await
            .unwrap();
        assert!(created);
        assert_eq!(row.user_id, Some(7));
        assert_eq!(row.rpi_event_id.as_deref(), Some("e1"));

        let found = store.find_by_event_id("e1").await.unwrap().unwrap();
        assert_eq!(found.id, row.id);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = NotificationStore::new(test_pool(&dir.path().join("t.db")).await);

        let (first, created) = store
            .create(7, "Motion Detected", "motion_detected", "e2")
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .create(7, "Motion Detected", "motion_detected", "e2")
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        let rows = store.recent(7, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_created_at_scoped_by_type() {
        let dir = tempdir().unwrap();
        let store = NotificationStore::new(test_pool(&dir.path().join("t.db")).await);

        assert!(store
            .latest_created_at(7, "motion_detected")
            .await
            .unwrap()
            .is_none());

        store
            .create(7, "Doorbell Pressed", "button_pressed", "e3")
            .await
            .unwrap();
        // Button presses never gate motion
        assert!(store
            .latest_created_at(7, "motion_detected")
            .await
            .unwrap()
            .is_none());

        store
            .create(7, "Motion Detected", "motion_detected", "e4")
            .await
            .unwrap();
        assert!(store
            .latest_created_at(7, "motion_detected")
            .await
            .unwrap()
            .is_some());
    }
}
