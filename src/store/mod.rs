//! SQLite persistence for the hub
//!
//! One store struct per table, all sharing the process-wide pool owned by
//! the configuration store. Timestamps are stored as RFC 3339 text.

pub mod capture;
pub mod fcm_device;
pub mod notification;

pub use capture::{CaptureRow, CaptureStore};
pub use fcm_device::{FcmDeviceRow, FcmDeviceStore};
pub use notification::{NotificationRow, NotificationStore};

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

use crate::error::Result;

/// Create the persistence tables if they do not exist yet
pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            token TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            title TEXT NOT NULL,
            type TEXT NOT NULL,
            rpi_event_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Reconnects may resend an event; the unique index is what makes the
    // insert idempotent (NULLs are exempt, matching captures without events)
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_rpi_event_id
         ON notifications(rpi_event_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS captures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            notification_id INTEGER REFERENCES notifications(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fcm_devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            fcm_token TEXT NOT NULL UNIQUE,
            physical_device_id TEXT NOT NULL,
            device_type TEXT,
            app_version TEXT,
            last_seen_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_id, physical_device_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Parse an RFC 3339 timestamp column, falling back to now on corruption
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
