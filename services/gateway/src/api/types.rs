//! Request/response bodies for the control-plane API.

use crate::model::Project;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub valid: bool,
    pub sub: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProjectListResponse {
    pub items: Vec<Project>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RotateKeyRequest {
    /// Which secret to rotate.
    #[serde(rename = "type")]
    pub kind: crate::store::KeyKind,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RotateKeyResponse {
    /// The new plaintext key; shown exactly once.
    pub key: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevealKeyRequest {
    #[serde(rename = "type")]
    pub kind: crate::store::KeyKind,
    /// The admin's own password, verified again before disclosure.
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BlockIpRequest {
    pub ip: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PanicRequest {
    pub engaged: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub active_pools: usize,
    pub realtime_tenants: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RawQueryRequest {
    pub sql: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterDeviceRequest {
    /// Required for service-role callers; authenticated users register for
    /// themselves.
    #[serde(default)]
    pub user_id: Option<String>,
    pub token: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendPushRequest {
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueuedResponse {
    pub job_id: String,
}
