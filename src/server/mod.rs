//! HTTP host for the audit pipeline.
//!
//! Serves health checks and a small JSON resource API behind the audit
//! middleware.

mod routes;
mod store;

pub use routes::AppState;
pub use store::ResourceStore;

use axum::body::Body;
use axum::http::{HeaderMap, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, put};
use axum::Router;

use crate::http::{audit_middleware, AuditLayerState, AuthContext};

/// Header carrying the authenticated user id from a trusted proxy.
pub const USER_ID_HEADER: &str = "x-auth-user-id";
/// Header carrying the authenticated username from a trusted proxy.
pub const USERNAME_HEADER: &str = "x-auth-username";

/// Routes without any middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/api/v1/:resource", get(routes::list).post(routes::create))
        .route(
            "/api/v1/:resource/:id",
            get(routes::get)
                .put(routes::replace)
                .patch(routes::update)
                .delete(routes::delete),
        )
        .route(
            "/api/v1/:resource/:id/manifests/:name",
            put(routes::apply_manifest).delete(routes::delete_manifest),
        )
        .with_state(state)
}

/// Full application: routes, audit middleware and optional proxy identity.
pub fn app(state: AppState, audit: Option<AuditLayerState>, trust_identity_headers: bool) -> Router {
    let mut app = router(state);
    if let Some(audit) = audit {
        app = app.layer(middleware::from_fn_with_state(audit, audit_middleware));
    }
    // Outermost, so the identity is in place before auditing.
    if trust_identity_headers {
        app = app.layer(middleware::from_fn(trusted_identity));
    }
    app
}

/// Attach an [`AuthContext`] from identity headers set by an authenticating
/// reverse proxy.
pub async fn trusted_identity(mut request: Request<Body>, next: Next) -> Response {
    let user_id = identity_header(request.headers(), USER_ID_HEADER);
    let username = identity_header(request.headers(), USERNAME_HEADER);

    if let Some(user_id) = user_id {
        request
            .extensions_mut()
            .insert(AuthContext::authenticated(user_id, username.unwrap_or_default()));
    }
    next.run(request).await
}

fn identity_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
