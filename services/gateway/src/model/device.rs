//! Registered push devices.
//!
//! Rows live in each tenant database's `auth.user_devices` table, unique by
//! `(user_id, token)`. A token claimed by a new user evicts the prior owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Ios,
    Android,
    Web,
    Other,
}

impl DevicePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePlatform::Ios => "ios",
            DevicePlatform::Android => "android",
            DevicePlatform::Web => "web",
            DevicePlatform::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "ios" => DevicePlatform::Ios,
            "android" => DevicePlatform::Android,
            "web" => DevicePlatform::Web,
            _ => DevicePlatform::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserDevice {
    pub id: Uuid,
    pub user_id: String,
    pub token: String,
    pub platform: DevicePlatform,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub is_active: bool,
    pub last_active_at: DateTime<Utc>,
}
