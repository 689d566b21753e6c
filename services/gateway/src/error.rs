//! Error taxonomy and wire mapping.
//!
//! # Purpose
//! Every failure the gateway can surface collapses into one `ApiError`
//! kind with a fixed HTTP status. Database SQLSTATEs are mapped here so
//! handlers never branch on raw driver errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("project is locked down")]
    LockedDown,
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
    /// Database error surfaced verbatim to service-role callers of the raw
    /// SQL endpoint; maps to 400, never 500.
    #[error("{message}")]
    Database {
        message: String,
        code: Option<String>,
        position: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) | ApiError::Database { .. } => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::LockedDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> String {
        match self {
            ApiError::Unauthorized(_) => "unauthorized".to_string(),
            ApiError::Forbidden(_) => "forbidden".to_string(),
            ApiError::NotFound(_) => "not_found".to_string(),
            ApiError::Conflict(_) => "conflict".to_string(),
            ApiError::Validation(_) => "validation".to_string(),
            ApiError::PayloadTooLarge(_) => "payload_too_large".to_string(),
            ApiError::RateLimited { .. } => "rate_limited".to_string(),
            ApiError::LockedDown => "locked_down".to_string(),
            ApiError::BadGateway(_) => "bad_gateway".to_string(),
            ApiError::Internal(_) => "internal".to_string(),
            ApiError::Database { code, .. } => {
                code.clone().unwrap_or_else(|| "database".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
            position: match &self {
                ApiError::Database { position, .. } => position.clone(),
                _ => None,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// Maps known SQLSTATEs onto the taxonomy. Unrecognised database errors and
/// driver failures stay internal except for pool exhaustion, which means
/// the tenant database is unreachable.
pub fn map_db_error(err: sqlx::Error) -> ApiError {
    match &err {
        sqlx::Error::RowNotFound => return ApiError::NotFound("row not found".to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            return ApiError::BadGateway("tenant database unreachable".to_string());
        }
        _ => {}
    }
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message().to_string();
        return match db_err.code().as_deref() {
            Some("23505") => ApiError::Conflict(message),
            Some("23503") | Some("23502") | Some("42703") | Some("22P02") => {
                ApiError::Validation(message)
            }
            Some("42P01") => ApiError::NotFound(message),
            _ => ApiError::Internal(message),
        };
    }
    ApiError::Internal(err.to_string())
}

/// Raw-SQL endpoint mapping: every database error is the caller's problem,
/// so it surfaces as 400 with code and position intact.
pub fn map_raw_sql_error(err: sqlx::Error) -> ApiError {
    if let sqlx::Error::Database(db_err) = &err {
        let position = db_err
            .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
            .and_then(|pg| pg.position())
            .map(|position| match position {
                sqlx::postgres::PgErrorPosition::Original(offset) => offset.to_string(),
                sqlx::postgres::PgErrorPosition::Internal { position, .. } => position.to_string(),
            });
        return ApiError::Database {
            message: db_err.message().to_string(),
            code: db_err.code().map(|code| code.to_string()),
            position,
        };
    }
    map_db_error(err)
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        map_db_error(err)
    }
}

impl From<cascata_query::QueryError> for ApiError {
    fn from(err: cascata_query::QueryError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<cascata_pool::PoolError> for ApiError {
    fn from(err: cascata_pool::PoolError) -> Self {
        ApiError::BadGateway(err.to_string())
    }
}

impl From<cascata_jobs::QueueError> for ApiError {
    fn from(err: cascata_jobs::QueueError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Validation(format!("invalid JSON body: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::LockedDown.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::BadGateway("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::RateLimited {
                retry_after_secs: 30
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Database {
                message: "bad".into(),
                code: Some("42601".into()),
                position: None
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn pool_exhaustion_is_bad_gateway() {
        let err = map_db_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, ApiError::BadGateway(_)));
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_secs: 17,
        }
        .into_response();
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &"17".parse::<axum::http::HeaderValue>().unwrap()
        );
    }
}
