//! Construction of audit events from captured request/response pairs.
//!
//! [`EventBuilder::build`] is a pure transformation: it performs no I/O and
//! never fails because of a body it cannot decode; that side of the diff is
//! simply omitted.

use serde_json::Value;
use tracing::debug;

use crate::error::AuditResult;

use super::event::{Action, AuditEvent, DiffObject, Principal, ResourceInfo, UNKNOWN_RESOURCE_TYPE};
use super::sanitize::Redactor;
use super::truncate::{TruncateOutcome, Truncator};

/// Identity resolved from upstream authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    /// Stable user identifier.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Whether upstream authentication succeeded.
    pub authenticated: bool,
}

impl Identity {
    /// An authenticated identity.
    pub fn authenticated(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            authenticated: true,
        }
    }

    /// Principal for this identity; unauthenticated maps to anonymous.
    pub fn principal(&self) -> Principal {
        if self.authenticated && !self.user_id.is_empty() {
            Principal::user(&self.user_id, &self.username)
        } else {
            Principal::anonymous()
        }
    }
}

/// Everything the builder needs to know about one request/response pair.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    /// HTTP method as received.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Response status code.
    pub status: u16,
    /// Correlation id resolved by the middleware.
    pub request_id: String,
    /// Resolved client address.
    pub client_ip: String,
    /// `User-Agent` header, empty when absent.
    pub user_agent: String,
    /// Upstream identity, `None` for anonymous requests.
    pub identity: Option<Identity>,
    /// Captured request body (mutating methods only).
    pub request_body: Option<Vec<u8>>,
    /// Captured response body.
    pub response_body: Option<Vec<u8>>,
    /// Set when the request body exceeded the capture limit.
    pub request_body_cut: bool,
    /// Set when the response body exceeded the capture limit.
    pub response_body_cut: bool,
    /// Replaces the method-derived action when set by a handler.
    pub action_override: Option<Action>,
}

/// Resource addressed by an API path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub resource_type: String,
    pub resource_id: Option<String>,
}

/// Parse `/api/v{n}/{resourceType}/{resourceID}...`.
///
/// Returns `None` for paths outside that convention.
pub fn parse_resource_path(path: &str) -> Option<ResourcePath> {
    let path = path.split('?').next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());

    if segments.next() != Some("api") {
        return None;
    }
    let version = segments.next()?;
    let digits = version.strip_prefix('v')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let resource_type = segments.next()?.to_string();
    let resource_id = segments.next().map(|s| s.to_string());
    Some(ResourcePath {
        resource_type,
        resource_id,
    })
}

/// Builds [`AuditEvent`]s from [`RequestSnapshot`]s.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    truncator: Truncator,
    redactor: Option<Redactor>,
}

impl EventBuilder {
    /// Create a builder.
    ///
    /// # Arguments
    ///
    /// * `truncator` - Ceiling applied to each snapshot
    /// * `redactor` - Applied to snapshots before truncation, if any
    pub fn new(truncator: Truncator, redactor: Option<Redactor>) -> Self {
        Self {
            truncator,
            redactor,
        }
    }

    pub fn truncator(&self) -> &Truncator {
        &self.truncator
    }

    /// Build and validate an event for one request/response pair.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the assembled event breaks an
    /// invariant. Undecodable bodies are not errors.
    pub fn build(&self, snapshot: &RequestSnapshot) -> AuditResult<AuditEvent> {
        let action = snapshot
            .action_override
            .unwrap_or_else(|| Action::from_method(&snapshot.method));

        let parsed = parse_resource_path(&snapshot.path);
        let resource_type = parsed
            .as_ref()
            .map(|p| p.resource_type.clone())
            .unwrap_or_else(|| UNKNOWN_RESOURCE_TYPE.to_string());
        let resource_id = parsed
            .as_ref()
            .and_then(|p| p.resource_id.clone())
            .unwrap_or_default();

        let mut resource = ResourceInfo::new(&resource_type, &resource_id)
            .with_data("method", snapshot.method.to_ascii_uppercase())
            .with_data("path", &snapshot.path)
            .with_data("statusCode", snapshot.status.to_string())
            .with_data("resourceId", &resource_id);
        if snapshot.request_body_cut {
            resource = resource.with_data("requestBodyCaptureCut", "true");
        }
        if snapshot.response_body_cut {
            resource = resource.with_data("responseBodyCaptureCut", "true");
        }

        let (old_source, new_source) = if action.is_create() {
            (None, snapshot.response_body.as_deref())
        } else if action.is_update() {
            (
                snapshot.request_body.as_deref(),
                snapshot.response_body.as_deref(),
            )
        } else if action.is_delete() {
            (snapshot.response_body.as_deref(), None)
        } else {
            (None, None)
        };

        let old = old_source.and_then(|body| self.snapshot_object(body, "oldObject"));
        let new = new_source.and_then(|body| self.snapshot_object(body, "newObject"));

        let principal = snapshot
            .identity
            .as_ref()
            .map(Identity::principal)
            .unwrap_or_else(Principal::anonymous);

        AuditEvent::builder(action)
            .resource_type(resource_type)
            .resource(resource)
            .user(principal)
            .diff_object(DiffObject::from_outcomes(old, new))
            .client_ip(&snapshot.client_ip)
            .user_agent(&snapshot.user_agent)
            .request_method(snapshot.method.to_ascii_uppercase())
            .request_id(&snapshot.request_id)
            .max_object_bytes(self.truncator.max_bytes())
            .build()
    }

    /// Decode, unwrap, redact and truncate one body.
    ///
    /// Returns `None` for empty or undecodable bodies.
    pub fn snapshot_object(&self, body: &[u8], side: &str) -> Option<TruncateOutcome> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }

        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                debug!(side = side, error = %e, "Body is not JSON, omitting from diff");
                return None;
            }
        };

        let value = unwrap_envelope(value);
        let value = match &self.redactor {
            Some(redactor) => redactor.redact(&value),
            None => value,
        };

        match self.truncator.truncate_value(value) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                debug!(side = side, error = %e, "Failed to truncate snapshot, omitting from diff");
                None
            }
        }
    }
}

/// Unwrap `{"data": X}` response envelopes to `X`.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}
