//! Route handlers for the resource API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::{json, Map, Value};

use crate::audit::{Action, AuditLogger, LoggerState};
use crate::http::AuditAction;

use super::store::ResourceStore;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ResourceStore>,
    pub logger: Option<Arc<AuditLogger>>,
}

impl AppState {
    pub fn new(store: Arc<ResourceStore>, logger: Option<Arc<AuditLogger>>) -> Self {
        Self { store, logger }
    }
}

fn data(status: StatusCode, value: Value) -> Response {
    (status, Json(json!({ "data": value }))).into_response()
}

fn error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn not_found(resource: &str, id: &str) -> Response {
    error(StatusCode::NOT_FOUND, format!("{} '{}' not found", resource, id))
}

fn into_object(body: Value) -> Result<Map<String, Value>, Response> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(error(
            StatusCode::BAD_REQUEST,
            "Request body must be a JSON object".to_string(),
        )),
    }
}

fn manifests_of(resource: &str, id: &str) -> String {
    format!("{}/{}/manifests", resource, id)
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready while the audit logger accepts events.
pub async fn ready(State(state): State<AppState>) -> Response {
    let logger_state = state.logger.as_ref().map(|l| l.state());
    match logger_state {
        Some(LoggerState::Draining) | Some(LoggerState::Stopped) => {
            error(StatusCode::SERVICE_UNAVAILABLE, "audit logger stopped".to_string())
        }
        _ => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
    }
}

pub async fn list(State(state): State<AppState>, Path(resource): Path<String>) -> Response {
    data(StatusCode::OK, Value::Array(state.store.list(&resource)))
}

pub async fn create(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match into_object(body) {
        Ok(object) => data(StatusCode::CREATED, state.store.create(&resource, object)),
        Err(response) => response,
    }
}

pub async fn get(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
) -> Response {
    match state.store.get(&resource, &id) {
        Some(object) => data(StatusCode::OK, object),
        None => not_found(&resource, &id),
    }
}

pub async fn replace(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let object = match into_object(body) {
        Ok(object) => object,
        Err(response) => return response,
    };
    if state.store.get(&resource, &id).is_none() {
        return not_found(&resource, &id);
    }
    let (stored, _) = state.store.put(&resource, &id, object);
    data(StatusCode::OK, stored)
}

pub async fn update(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let patch = match into_object(body) {
        Ok(object) => object,
        Err(response) => return response,
    };
    match state.store.patch(&resource, &id, patch) {
        Some(object) => data(StatusCode::OK, object),
        None => not_found(&resource, &id),
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
) -> Response {
    match state.store.delete(&resource, &id) {
        Some(object) => data(StatusCode::OK, object),
        None => not_found(&resource, &id),
    }
}

/// Apply a manifest inside a parent resource.
///
/// Audited as `CreateResource` or `UpdateResource` depending on whether the
/// manifest already existed.
pub async fn apply_manifest(
    State(state): State<AppState>,
    Path((resource, id, name)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let object = match into_object(body) {
        Ok(object) => object,
        Err(response) => return response,
    };
    if state.store.get(&resource, &id).is_none() {
        return not_found(&resource, &id);
    }

    let (stored, existed) = state.store.put(&manifests_of(&resource, &id), &name, object);
    let (status, action) = if existed {
        (StatusCode::OK, Action::UpdateResource)
    } else {
        (StatusCode::CREATED, Action::CreateResource)
    };
    (
        status,
        Extension(AuditAction(action)),
        Json(json!({ "data": stored })),
    )
        .into_response()
}

pub async fn delete_manifest(
    State(state): State<AppState>,
    Path((resource, id, name)): Path<(String, String, String)>,
) -> Response {
    match state.store.delete(&manifests_of(&resource, &id), &name) {
        Some(object) => (
            StatusCode::OK,
            Extension(AuditAction(Action::DeleteResource)),
            Json(json!({ "data": object })),
        )
            .into_response(),
        None => not_found("manifest", &name),
    }
}
