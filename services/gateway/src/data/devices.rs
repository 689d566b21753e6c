//! Device rows in the tenant auth schema.
//!
//! # Purpose
//! Registration and lookup of push tokens, unique by `(user_id, token)`.
//! A token re-registered by a different user evicts the previous owner
//! first, so one physical device only ever belongs to one account.

use crate::error::{ApiError, map_db_error};
use crate::model::{DevicePlatform, UserDevice};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

const ENSURE_SCHEMA_SQL: &str = "CREATE SCHEMA IF NOT EXISTS auth";

const ENSURE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS auth.user_devices (
    id             UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    user_id        TEXT NOT NULL,
    token          TEXT NOT NULL,
    platform       TEXT NOT NULL DEFAULT 'other',
    app_version    TEXT,
    is_active      BOOLEAN NOT NULL DEFAULT TRUE,
    last_active_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (user_id, token)
)";

#[derive(Debug, Clone, FromRow)]
struct DbDevice {
    id: Uuid,
    user_id: String,
    token: String,
    platform: String,
    app_version: Option<String>,
    is_active: bool,
    last_active_at: DateTime<Utc>,
}

impl From<DbDevice> for UserDevice {
    fn from(row: DbDevice) -> Self {
        UserDevice {
            id: row.id,
            user_id: row.user_id,
            token: row.token,
            platform: DevicePlatform::parse(&row.platform),
            app_version: row.app_version,
            is_active: row.is_active,
            last_active_at: row.last_active_at,
        }
    }
}

pub async fn ensure_device_table(pool: &PgPool) -> Result<(), ApiError> {
    sqlx::query(ENSURE_SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    sqlx::query(ENSURE_TABLE_SQL)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    Ok(())
}

/// Registers (or refreshes) a device. Re-registration by the same user is
/// idempotent; a token claimed by a new user evicts the prior owner row.
pub async fn register_device(
    pool: &PgPool,
    user_id: &str,
    token: &str,
    platform: DevicePlatform,
    app_version: Option<&str>,
) -> Result<UserDevice, ApiError> {
    ensure_device_table(pool).await?;
    let mut tx = pool.begin().await.map_err(map_db_error)?;
    sqlx::query("DELETE FROM auth.user_devices WHERE token = $1 AND user_id <> $2")
        .bind(token)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
    let row = sqlx::query_as::<_, DbDevice>(
        "INSERT INTO auth.user_devices (user_id, token, platform, app_version) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, token) DO UPDATE SET \
             platform = EXCLUDED.platform, \
             app_version = EXCLUDED.app_version, \
             is_active = TRUE, \
             last_active_at = now() \
         RETURNING id, user_id, token, platform, app_version, is_active, last_active_at",
    )
    .bind(user_id)
    .bind(token)
    .bind(platform.as_str())
    .bind(app_version)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_db_error)?;
    tx.commit().await.map_err(map_db_error)?;
    Ok(row.into())
}

/// Active devices for a user. A missing device table means no devices, not
/// an error; the tenant simply never registered one.
pub async fn active_devices(pool: &PgPool, user_id: &str) -> Result<Vec<UserDevice>, ApiError> {
    let result = sqlx::query_as::<_, DbDevice>(
        "SELECT id, user_id, token, platform, app_version, is_active, last_active_at \
         FROM auth.user_devices WHERE user_id = $1 AND is_active \
         ORDER BY last_active_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await;
    match result {
        Ok(rows) => Ok(rows.into_iter().map(UserDevice::from).collect()),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("42P01") => {
            Ok(Vec::new())
        }
        Err(err) => Err(map_db_error(err)),
    }
}

/// Self-healing prune for tokens FCM reports as gone.
pub async fn delete_device(pool: &PgPool, user_id: &str, token: &str) -> Result<(), ApiError> {
    sqlx::query("DELETE FROM auth.user_devices WHERE user_id = $1 AND token = $2")
        .bind(user_id)
        .bind(token)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    Ok(())
}
