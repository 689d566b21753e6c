//! OpenAPI document for the control-plane surface.
//!
//! The per-tenant data-plane document is generated from live schema
//! introspection (`data/schema.rs`); this one describes the fixed admin
//! API.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cascata control plane",
        description = "Admin surface of the Cascata gateway"
    ),
    paths(
        crate::api::system::health,
        crate::api::auth::login,
        crate::api::auth::verify,
        crate::api::projects::list_projects,
        crate::api::projects::create_project,
        crate::api::projects::get_project,
        crate::api::projects::update_project,
        crate::api::projects::delete_project,
        crate::api::projects::rotate_keys,
        crate::api::projects::reveal_key,
        crate::api::projects::block_ip,
        crate::api::projects::unblock_ip,
        crate::api::projects::set_panic,
    ),
    components(schemas(
        crate::api::types::LoginRequest,
        crate::api::types::LoginResponse,
        crate::api::types::VerifyResponse,
        crate::api::types::ProjectListResponse,
        crate::api::types::RotateKeyRequest,
        crate::api::types::RotateKeyResponse,
        crate::api::types::RevealKeyRequest,
        crate::api::types::BlockIpRequest,
        crate::api::types::PanicRequest,
        crate::api::types::HealthResponse,
        crate::model::Project,
        crate::model::ProjectMetadata,
    ))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_builds_and_lists_paths() {
        let doc = ApiDoc::openapi();
        let rendered = serde_json::to_value(&doc).unwrap();
        assert!(rendered["paths"]["/api/control/projects"].is_object());
        assert!(rendered["paths"]["/api/health"].is_object());
    }
}
