use crate::api::handlers::{
    admin, auth, health, jobs, keys, metrics_snapshot, __path_metrics_snapshot,
};
use crate::gateway::{sse, ws};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec. Routes added outside (like
/// `/`) are intentionally not documented.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path; handlers
    // sharing a path go in one call so their methods merge.
    let mut gateway_tag = Tag::new("gateway");
    gateway_tag.description = Some("Real-time job event gateway".to_string());
    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Sessions and one-time-code login".to_string());

    let router = OpenApiRouter::with_openapi(cargo_openapi(vec![auth_tag, gateway_tag]))
        .routes(routes!(health::health))
        .routes(routes!(metrics_snapshot))
        .routes(routes!(auth::session::send_otp))
        .routes(routes!(auth::session::verify_otp))
        .routes(routes!(auth::session::refresh))
        .routes(routes!(auth::session::logout))
        .routes(routes!(auth::session::session))
        .routes(routes!(keys::mint, keys::list))
        .routes(routes!(keys::detail))
        .routes(routes!(keys::revoke))
        .routes(routes!(keys::redeem))
        .routes(routes!(admin::set_entitlements))
        .routes(routes!(admin::downgrade))
        .routes(routes!(admin::active_users))
        .routes(routes!(jobs::attach))
        .routes(routes!(jobs::list))
        .routes(routes!(jobs::detail))
        .routes(routes!(sse::logs_stream))
        .routes(routes!(ws::builder_bridge))
        .routes(routes!(ws::pipeline_session));

    router
}

fn cargo_openapi(tags: Vec<Tag>) -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    OpenApiBuilder::new().info(info).tags(Some(tags)).build()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn openapi_includes_core_paths() {
        let spec = openapi();
        let paths = &spec.paths.paths;
        for path in [
            "/health",
            "/v1/auth/send-otp",
            "/v1/auth/verify",
            "/v1/auth/refresh",
            "/v1/keys/redeem",
            "/v1/admin/keys",
            "/v1/jobs/{id}/logs/stream",
            "/v1/ws/builder/{project_id}",
        ] {
            assert!(paths.contains_key(path), "missing path {path}");
        }
    }

    #[test]
    fn openapi_uses_cargo_metadata() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
    }
}
