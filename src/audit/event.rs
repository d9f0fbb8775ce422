//! Audit event model.
//!
//! Defines the canonical record persisted for every audited action. Events
//! are immutable once built: fields are private and only the logger worker
//! stamps the persistence time after it has taken ownership.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult, ValidationErrorKind};

use super::truncate::{TruncateOutcome, DEFAULT_MAX_OBJECT_BYTES, ROOT_PATH};

/// UID recorded for requests without an authenticated identity.
pub const ANONYMOUS_UID: &str = "anonymous";

/// Resource type recorded when the path does not follow the API convention.
pub const UNKNOWN_RESOURCE_TYPE: &str = "unknown";

/// Kind of action an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Created,
    Read,
    Updated,
    Deleted,
    CreateResource,
    UpdateResource,
    DeleteResource,
}

impl Action {
    /// Every recognized action.
    pub const ALL: [Action; 7] = [
        Action::Created,
        Action::Read,
        Action::Updated,
        Action::Deleted,
        Action::CreateResource,
        Action::UpdateResource,
        Action::DeleteResource,
    ];

    /// Canonical name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "Created",
            Action::Read => "Read",
            Action::Updated => "Updated",
            Action::Deleted => "Deleted",
            Action::CreateResource => "CreateResource",
            Action::UpdateResource => "UpdateResource",
            Action::DeleteResource => "DeleteResource",
        }
    }

    /// Map an HTTP method to an action.
    ///
    /// Methods outside GET/HEAD/POST/PUT/PATCH/DELETE are recorded as reads.
    pub fn from_method(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "POST" => Action::Created,
            "PUT" | "PATCH" => Action::Updated,
            "DELETE" => Action::Deleted,
            _ => Action::Read,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, Action::Created | Action::CreateResource)
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Action::Updated | Action::UpdateResource)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Action::Deleted | Action::DeleteResource)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AuditError::Validation {
                kind: ValidationErrorKind::MissingAction,
            });
        }
        Action::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| AuditError::Validation {
                kind: ValidationErrorKind::UnknownAction {
                    name: trimmed.to_string(),
                },
            })
    }
}

/// Whether the actor was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrincipalType {
    User,
    Anonymous,
}

/// The actor an event is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User id, `anonymous` for unauthenticated requests.
    pub uid: String,
    /// Display name at the time of the event.
    pub username: String,
    /// Authenticated user or anonymous.
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
}

impl Principal {
    /// An authenticated user.
    pub fn user(uid: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            username: username.into(),
            principal_type: PrincipalType::User,
        }
    }

    /// The anonymous principal.
    pub fn anonymous() -> Self {
        Self {
            uid: ANONYMOUS_UID.to_string(),
            username: ANONYMOUS_UID.to_string(),
            principal_type: PrincipalType::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal_type == PrincipalType::Anonymous
    }
}

/// Denormalized metadata about the acted-upon object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Resource type, mirrors the event's `resourceType`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource id from the path, empty for collection endpoints.
    pub identifier: String,
    /// Request metadata such as method, path and status code.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ResourceInfo {
    pub fn new(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
            data: BTreeMap::new(),
        }
    }

    /// Add a metadata entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Before/after snapshots of the acted-upon object.
///
/// Built from truncation outcomes, so each snapshot is within the ceiling.
/// Decoded diffs are checked by [`AuditEvent::validate_within`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffObject {
    /// State before the action, absent for creates and reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_object: Option<Value>,
    /// Whether `old_object` was shortened to fit the ceiling.
    #[serde(default)]
    old_object_truncated: bool,
    /// State after the action, absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_object: Option<Value>,
    /// Whether `new_object` was shortened to fit the ceiling.
    #[serde(default)]
    new_object_truncated: bool,
    /// Paths that were shortened or elided, prefixed by side.
    #[serde(default)]
    truncated_fields: Vec<String>,
}

impl DiffObject {
    /// Assemble a diff from independently truncated snapshots.
    ///
    /// Returns `None` when neither side is present. Truncated paths are
    /// prefixed with `oldObject` / `newObject`.
    pub fn from_outcomes(
        old: Option<TruncateOutcome>,
        new: Option<TruncateOutcome>,
    ) -> Option<Self> {
        if old.is_none() && new.is_none() {
            return None;
        }

        let mut truncated_fields = Vec::new();
        let (old_object, old_object_truncated) =
            split_outcome(old, "oldObject", &mut truncated_fields);
        let (new_object, new_object_truncated) =
            split_outcome(new, "newObject", &mut truncated_fields);

        Some(Self {
            old_object,
            old_object_truncated,
            new_object,
            new_object_truncated,
            truncated_fields,
        })
    }

    pub fn old_object(&self) -> Option<&Value> {
        self.old_object.as_ref()
    }

    pub fn new_object(&self) -> Option<&Value> {
        self.new_object.as_ref()
    }

    pub fn old_object_truncated(&self) -> bool {
        self.old_object_truncated
    }

    pub fn new_object_truncated(&self) -> bool {
        self.new_object_truncated
    }

    pub fn truncated_fields(&self) -> &[String] {
        &self.truncated_fields
    }
}

fn split_outcome(
    outcome: Option<TruncateOutcome>,
    prefix: &str,
    fields: &mut Vec<String>,
) -> (Option<Value>, bool) {
    let Some(outcome) = outcome else {
        return (None, false);
    };
    for path in outcome.truncated_fields {
        let qualified = if path == ROOT_PATH {
            prefix.to_string()
        } else if path.starts_with('[') {
            format!("{}{}", prefix, path)
        } else {
            format!("{}.{}", prefix, path)
        };
        fields.push(qualified);
    }
    (Some(outcome.value), outcome.was_truncated)
}

/// A single audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event identifier (UUID v4).
    id: Uuid,
    /// When the action happened, millisecond precision.
    timestamp: DateTime<Utc>,
    /// What was done.
    action: Action,
    /// Kind of resource acted upon, e.g. `clusters`.
    resource_type: String,
    /// Identifier and metadata of the resource.
    resource: ResourceInfo,
    /// Actor the event is attributed to.
    user: Principal,
    /// Before/after snapshots, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff_object: Option<DiffObject>,
    /// Client address as resolved from proxy headers or the peer.
    #[serde(rename = "clientIP")]
    client_ip: String,
    /// `User-Agent` of the request, empty when absent.
    user_agent: String,
    /// HTTP method of the request.
    request_method: String,
    /// Correlation id shared with application logs.
    #[serde(rename = "requestID")]
    request_id: String,
    /// Persistence time, set by the logger worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

impl AuditEvent {
    /// Start building an event for `action`.
    pub fn builder(action: Action) -> AuditEventBuilder {
        AuditEventBuilder::default().action(action)
    }

    /// Check the invariants an event must satisfy before it is enqueued,
    /// using the default snapshot ceiling.
    ///
    /// # Errors
    ///
    /// - Validation error if the request id or resource type is blank
    /// - Validation error if a snapshot serializes above
    ///   [`DEFAULT_MAX_OBJECT_BYTES`]
    pub fn validate(&self) -> AuditResult<()> {
        self.validate_within(DEFAULT_MAX_OBJECT_BYTES)
    }

    /// Same as [`validate`](Self::validate) with an explicit ceiling for
    /// each snapshot.
    ///
    /// # Arguments
    ///
    /// * `max_object_bytes` - Largest serialized size allowed for
    ///   `oldObject` and `newObject`
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first broken invariant.
    pub fn validate_within(&self, max_object_bytes: usize) -> AuditResult<()> {
        if self.request_id.trim().is_empty() {
            return Err(AuditError::Validation {
                kind: ValidationErrorKind::EmptyRequestId,
            });
        }
        if self.resource_type.trim().is_empty() {
            return Err(AuditError::Validation {
                kind: ValidationErrorKind::EmptyResourceType,
            });
        }

        let Some(diff) = &self.diff_object else {
            return Ok(());
        };
        let sides = [("oldObject", &diff.old_object), ("newObject", &diff.new_object)];
        for (field, object) in sides {
            let Some(object) = object else {
                continue;
            };
            let size = serde_json::to_vec(object)?.len();
            if size > max_object_bytes {
                return Err(AuditError::Validation {
                    kind: ValidationErrorKind::ObjectTooLarge {
                        field,
                        size,
                        max: max_object_bytes,
                    },
                });
            }
        }
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource(&self) -> &ResourceInfo {
        &self.resource
    }

    pub fn user(&self) -> &Principal {
        &self.user
    }

    pub fn diff_object(&self) -> Option<&DiffObject> {
        self.diff_object.as_ref()
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn request_method(&self) -> &str {
        &self.request_method
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Time the event was handed to the persistence sink.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub(crate) fn mark_persisted(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at.trunc_subsecs(3));
    }
}

/// Builder for [`AuditEvent`].
#[derive(Debug, Default, Clone)]
pub struct AuditEventBuilder {
    /// Required; `build` fails without it.
    action: Option<Action>,
    /// Falls back to the resource's type, then `unknown`.
    resource_type: Option<String>,
    resource: Option<ResourceInfo>,
    /// Falls back to the anonymous principal.
    user: Option<Principal>,
    diff_object: Option<DiffObject>,
    client_ip: String,
    user_agent: String,
    request_method: String,
    /// Falls back to a fresh UUID when missing or blank.
    request_id: Option<String>,
    /// Falls back to the build time.
    timestamp: Option<DateTime<Utc>>,
    /// Snapshot ceiling checked by `build`, default 64 KiB.
    max_object_bytes: Option<usize>,
}

impl AuditEventBuilder {
    /// Set the action.
    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Set the top-level resource type.
    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Set the resource identifier and metadata.
    pub fn resource(mut self, resource: ResourceInfo) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Attribute the event to `user`.
    pub fn user(mut self, user: Principal) -> Self {
        self.user = Some(user);
        self
    }

    /// Attach before/after snapshots.
    pub fn diff_object(mut self, diff: Option<DiffObject>) -> Self {
        self.diff_object = diff;
        self
    }

    /// Set the client address.
    pub fn client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = client_ip.into();
        self
    }

    /// Set the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the HTTP method.
    pub fn request_method(mut self, method: impl Into<String>) -> Self {
        self.request_method = method.into();
        self
    }

    /// Correlation id; blank values are replaced by a fresh UUID.
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Override the event time.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Ceiling each snapshot must fit when the event is built.
    ///
    /// # Arguments
    ///
    /// * `max_object_bytes` - Ceiling the snapshots were truncated to
    pub fn max_object_bytes(mut self, max_object_bytes: usize) -> Self {
        self.max_object_bytes = Some(max_object_bytes);
        self
    }

    /// Build and validate the event.
    ///
    /// # Errors
    ///
    /// Returns a validation error if no action was set or the event breaks
    /// an invariant checked by [`AuditEvent::validate_within`].
    pub fn build(self) -> AuditResult<AuditEvent> {
        let action = self.action.ok_or(AuditError::Validation {
            kind: ValidationErrorKind::MissingAction,
        })?;

        let resource = self.resource.unwrap_or_default();
        let resource_type = self
            .resource_type
            .or_else(|| {
                (!resource.resource_type.is_empty()).then(|| resource.resource_type.clone())
            })
            .unwrap_or_else(|| UNKNOWN_RESOURCE_TYPE.to_string());

        let request_id = self
            .request_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now).trunc_subsecs(3),
            action,
            resource_type,
            resource,
            user: self.user.unwrap_or_else(Principal::anonymous),
            diff_object: self.diff_object,
            client_ip: self.client_ip,
            user_agent: self.user_agent,
            request_method: self.request_method,
            request_id,
            created_at: None,
        };

        event.validate_within(self.max_object_bytes.unwrap_or(DEFAULT_MAX_OBJECT_BYTES))?;
        Ok(event)
    }
}
