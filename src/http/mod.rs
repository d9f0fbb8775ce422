//! HTTP interception layer.
//!
//! Wires the audit pipeline into axum routers.

mod capture;
mod client_ip;
mod context;
mod middleware;

pub use capture::{CaptureBody, Captured, SharedCapture};
pub use client_ip::{client_ip, request_id_from_headers, user_agent, UNKNOWN_CLIENT_IP};
pub use context::{AuditAction, AuthContext, RequestId};
pub use middleware::{audit_middleware, AuditLayerState, DEFAULT_SKIP_PATHS};
