//! End-to-end scenarios against live Postgres and Redis.
//!
//! Gated twice: the `pg-tests` feature selects this file, and each test
//! additionally skips unless `CASCATA_PG_TESTS=1` with the standard `DB_*`
//! and `REDIS_*` environment pointing at reachable services. The default
//! `cargo test` run stays hermetic.
#![cfg(feature = "pg-tests")]

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use cascata_gateway::app::{AppState, build_router, build_state};
use cascata_gateway::auth::mint_admin_token;
use cascata_gateway::config::GatewayConfig;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use serial_test::serial;
use tower::ServiceExt;

fn enabled() -> bool {
    std::env::var("CASCATA_PG_TESTS").as_deref() == Ok("1")
}

async fn boot() -> (AppState, axum::Router) {
    unsafe {
        std::env::set_var("SYSTEM_JWT_SECRET", "e2e-admin-secret");
        std::env::set_var("SYS_SECRET", "e2e-sys-secret");
    }
    let config = GatewayConfig::from_env().expect("config from env");
    let (state, _background) = build_state(config).await.expect("build state");
    let router = build_router(state.clone());
    (state, router)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn admin_bearer() -> String {
    format!(
        "Bearer {}",
        mint_admin_token("e2e-admin-secret", "e2e").unwrap()
    )
}

async fn request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    auth: &str,
    body: Option<Value>,
) -> axum::response::Response {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "localhost")
        .header("authorization", auth);
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    let body = body
        .map(|value| Body::from(value.to_string()))
        .unwrap_or_else(Body::empty);
    router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

// Scenario: create a project, create a table, run the PostgREST CRUD
// cycle over it, and verify ordering, filtered update, multi-delete, and
// the trailing count.
#[tokio::test]
#[serial]
async fn tenant_crud_cycle() {
    if !enabled() {
        return;
    }
    let (_state, router) = boot().await;
    let admin = admin_bearer();

    let response = request(
        &router,
        "POST",
        "/api/control/projects",
        &admin,
        Some(json!({"slug": "e2e-crud", "display_name": "E2E"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = request(
        &router,
        "POST",
        "/api/data/e2e-crud/tables",
        &admin,
        Some(json!({"name": "customers", "columns": [{"name": "name", "type": "text"}]})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = request(
        &router,
        "POST",
        "/api/data/e2e-crud/customers",
        &admin,
        Some(json!([{"name": "A"}, {"name": "B"}])),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

    let response = request(
        &router,
        "GET",
        "/api/data/e2e-crud/customers?order=name.asc&select=name",
        &admin,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rows = body_json(response).await;
    assert_eq!(rows, json!([{"name": "A"}, {"name": "B"}]));

    let response = request(
        &router,
        "PATCH",
        "/api/data/e2e-crud/customers?name=eq.A",
        &admin,
        Some(json!({"name": "AA"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rows = body_json(response).await;
    assert_eq!(rows[0]["name"], "AA");

    let response = request(
        &router,
        "DELETE",
        "/api/data/e2e-crud/customers?name=in.(AA,B)",
        &admin,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

    let response = request(
        &router,
        "GET",
        "/api/data/e2e-crud/customers?select=count(*)",
        &admin,
        None,
    )
    .await;
    let rows = body_json(response).await;
    assert_eq!(rows[0]["count"], 0);

    // Cleanup so reruns start fresh.
    let response = request(
        &router,
        "DELETE",
        "/api/data/e2e-crud/tables/customers?mode=cascade",
        &admin,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    request(&router, "DELETE", "/api/control/projects/e2e-crud", &admin, None).await;
}

// Scenario: soft-delete parks the table in the recycle bin; restore brings
// it back under its original name.
#[tokio::test]
#[serial]
async fn recycle_bin_round_trip() {
    if !enabled() {
        return;
    }
    let (_state, router) = boot().await;
    let admin = admin_bearer();

    request(
        &router,
        "POST",
        "/api/control/projects",
        &admin,
        Some(json!({"slug": "e2e-bin", "display_name": "Bin"})),
    )
    .await;
    request(
        &router,
        "POST",
        "/api/data/e2e-bin/tables",
        &admin,
        Some(json!({"name": "parked", "columns": []})),
    )
    .await;

    let response = request(
        &router,
        "DELETE",
        "/api/data/e2e-bin/tables/parked",
        &admin,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = request(&router, "GET", "/api/data/e2e-bin/tables", &admin, None).await;
    let tables = body_json(response).await;
    assert!(!tables.as_array().unwrap().iter().any(|t| t == "parked"));

    let response = request(&router, "GET", "/api/data/e2e-bin/recycle-bin", &admin, None).await;
    let bin = body_json(response).await;
    let deleted_name = bin.as_array().unwrap()[0].as_str().unwrap().to_string();
    assert!(deleted_name.contains("parked"));

    let response = request(
        &router,
        "POST",
        &format!("/api/data/e2e-bin/recycle-bin/{deleted_name}/restore"),
        &admin,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = request(&router, "GET", "/api/data/e2e-bin/tables", &admin, None).await;
    let tables = body_json(response).await;
    assert!(tables.as_array().unwrap().iter().any(|t| t == "parked"));

    request(
        &router,
        "DELETE",
        "/api/data/e2e-bin/tables/parked?mode=cascade",
        &admin,
        None,
    )
    .await;
    request(&router, "DELETE", "/api/control/projects/e2e-bin", &admin, None).await;
}

// Scenario: with the panic shield engaged, a valid tenant key sees 503
// while the admin token passes.
#[tokio::test]
#[serial]
async fn panic_shield_admits_only_admins() {
    if !enabled() {
        return;
    }
    let (state, router) = boot().await;
    let admin = admin_bearer();

    request(
        &router,
        "POST",
        "/api/control/projects",
        &admin,
        Some(json!({"slug": "e2e-panic", "display_name": "Panic"})),
    )
    .await;
    let anon_key = state
        .store
        .get_project("e2e-panic")
        .await
        .unwrap()
        .secrets
        .anon_key;

    let response = request(
        &router,
        "POST",
        "/api/control/projects/e2e-panic/panic",
        &admin,
        Some(json!({"engaged": true})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = request(
        &router,
        "GET",
        "/api/data/e2e-panic/tables",
        &format!("Bearer {anon_key}"),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = request(&router, "GET", "/api/data/e2e-panic/tables", &admin, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    request(
        &router,
        "POST",
        "/api/control/projects/e2e-panic/panic",
        &admin,
        Some(json!({"engaged": false})),
    )
    .await;
    request(&router, "DELETE", "/api/control/projects/e2e-panic", &admin, None).await;
}
