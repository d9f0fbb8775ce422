//! Typed request and response extensions shared with handlers.

use crate::audit::{Action, Identity};

/// Authentication result placed on the request by upstream auth.
///
/// Wraps the [`Identity`] the audit builder consumes. Requests without this
/// extension are audited as anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext(pub Identity);

impl AuthContext {
    /// Context for a successfully authenticated user.
    pub fn authenticated(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self(Identity::authenticated(user_id, username))
    }

    pub fn identity(&self) -> &Identity {
        &self.0
    }
}

impl From<Identity> for AuthContext {
    fn from(identity: Identity) -> Self {
        Self(identity)
    }
}

/// Request id resolved by the audit middleware, available to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Response extension overriding the method-derived audit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditAction(pub Action);
