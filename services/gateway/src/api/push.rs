//! Push engine endpoints: device registry, direct sends, and notification
//! rules.

use crate::api::types::{EnqueuedResponse, RegisterDeviceRequest, SendPushRequest};
use crate::app::AppState;
use crate::data::devices;
use crate::error::ApiError;
use crate::jobs::{DbSelector, PushJobPayload, PushNotification};
use crate::model::{DevicePlatform, NotificationRule, UserDevice};
use crate::pipeline::DataContext;
use crate::store::{NewRule, RulePatch};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use cascata_jobs::RetryPolicy;
use serde::Deserialize;
use uuid::Uuid;

/// Resolves whom a device operation applies to: authenticated users act on
/// themselves, service-role callers must name a user.
fn resolve_user_id(ctx: &DataContext, requested: Option<&str>) -> Result<String, ApiError> {
    if ctx.auth.role.is_service() {
        return requested
            .map(str::to_string)
            .ok_or_else(|| ApiError::Validation("user_id is required".to_string()));
    }
    let claimed = ctx
        .auth
        .claims
        .as_ref()
        .and_then(|claims| claims.get("sub"))
        .and_then(|sub| sub.as_str())
        .map(str::to_string);
    claimed.ok_or_else(|| ApiError::Unauthorized("user identity required".to_string()))
}

pub async fn register_device(
    State(_state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    Json(body): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<UserDevice>), ApiError> {
    let user_id = resolve_user_id(&ctx, body.user_id.as_deref())?;
    if body.token.trim().is_empty() {
        return Err(ApiError::Validation("token must not be empty".to_string()));
    }
    let platform = DevicePlatform::parse(body.platform.as_deref().unwrap_or("other"));
    let device = devices::register_device(
        &ctx.pool,
        &user_id,
        body.token.trim(),
        platform,
        body.app_version.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Debug, Deserialize)]
pub struct ListDevicesQuery {
    #[serde(default)]
    user_id: Option<String>,
}

pub async fn list_devices(
    Extension(ctx): Extension<DataContext>,
    Query(query): Query<ListDevicesQuery>,
) -> Result<Json<Vec<UserDevice>>, ApiError> {
    let user_id = resolve_user_id(&ctx, query.user_id.as_deref())?;
    Ok(Json(devices::active_devices(&ctx.pool, &user_id).await?))
}

/// Direct push: service-role only, enqueued like any rule-driven message.
pub async fn send_push(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    Json(body): Json<SendPushRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !ctx.auth.role.is_service() {
        return Err(ApiError::Forbidden(
            "push sends require the service role".to_string(),
        ));
    }
    let Some(queues) = &state.queues else {
        return Err(ApiError::Internal("job queues unavailable".to_string()));
    };
    let payload = PushJobPayload {
        project_slug: ctx.project.slug.clone(),
        user_id: body.user_id,
        notification: PushNotification {
            title: body.title,
            body: body.body,
            data: body.data,
        },
        fcm: ctx
            .project
            .metadata
            .push
            .as_ref()
            .and_then(|push| push.fcm.clone()),
        db: DbSelector::for_project(&ctx.project),
    };
    let encoded = serde_json::to_value(&payload)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let job_id = queues.push.enqueue(encoded, RetryPolicy::push()).await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { job_id })))
}

fn require_rule_access(ctx: &DataContext) -> Result<(), ApiError> {
    if ctx.auth.role.is_service() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "rule management requires the service role".to_string(),
        ))
    }
}

/// Recomputes the tenant's listener pin after any rule mutation.
async fn refresh_rule_pin(state: &AppState, ctx: &DataContext) {
    match state.store.has_active_rules(&ctx.project.slug).await {
        Ok(active) => state.bridge.set_pin(&ctx.project, active),
        Err(err) => tracing::warn!(slug = %ctx.project.slug, error = %err, "rule pin refresh failed"),
    }
}

pub async fn list_rules(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
) -> Result<Json<Vec<NotificationRule>>, ApiError> {
    require_rule_access(&ctx)?;
    Ok(Json(state.store.list_rules(&ctx.project.slug).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub table: String,
    pub event: crate::model::RuleEvent,
    pub recipient_column: String,
    pub title_template: String,
    pub body_template: String,
    #[serde(default)]
    pub conditions: Vec<crate::model::RuleCondition>,
    #[serde(default)]
    pub data_payload: Option<serde_json::Value>,
}

pub async fn create_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    Json(body): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<NotificationRule>), ApiError> {
    require_rule_access(&ctx)?;
    let rule = state
        .store
        .create_rule(NewRule {
            project_slug: ctx.project.slug.clone(),
            table_name: body.table,
            event: body.event,
            recipient_column: body.recipient_column,
            title_template: body.title_template,
            body_template: body.body_template,
            conditions: body.conditions,
            data_payload: body.data_payload,
        })
        .await?;
    refresh_rule_pin(&state, &ctx).await;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update_rule(
    Path((_slug, id)): Path<(String, Uuid)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<NotificationRule>, ApiError> {
    require_rule_access(&ctx)?;
    let rule = state
        .store
        .update_rule(&ctx.project.slug, id, patch)
        .await?;
    refresh_rule_pin(&state, &ctx).await;
    Ok(Json(rule))
}

pub async fn delete_rule(
    Path((_slug, id)): Path<(String, Uuid)>,
    State(state): State<AppState>,
    Extension(ctx): Extension<DataContext>,
) -> Result<StatusCode, ApiError> {
    require_rule_access(&ctx)?;
    state.store.delete_rule(&ctx.project.slug, id).await?;
    refresh_rule_pin(&state, &ctx).await;
    Ok(StatusCode::NO_CONTENT)
}
