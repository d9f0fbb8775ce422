//! Audit logging pipeline.
//!
//! Turns HTTP request/response pairs into structured audit events and
//! persists them off the request path.
//!
//! ## Components
//!
//! - [`truncate`]: deterministic, size-bounded truncation of JSON snapshots
//! - [`event`]: the canonical audit event record
//! - [`builder`]: pure construction of events from captured requests
//! - [`logger`]: bounded queue plus background worker
//! - [`sink`]: persistence destinations
//! - [`sanitize`]: redaction of sensitive values in snapshots

pub mod builder;
pub mod event;
pub mod logger;
pub mod sanitize;
pub mod sink;
pub mod truncate;

pub use builder::{parse_resource_path, EventBuilder, Identity, RequestSnapshot, ResourcePath};
pub use event::{
    Action, AuditEvent, AuditEventBuilder, DiffObject, Principal, PrincipalType, ResourceInfo,
    ANONYMOUS_UID, UNKNOWN_RESOURCE_TYPE,
};
pub use logger::{AuditLogger, EnqueuePolicy, LoggerConfig, LoggerMetrics, LoggerState};
pub use sanitize::{Redactor, DEFAULT_SENSITIVE_KEYS, REDACTED};
pub use sink::{AuditSink, JsonLinesSink, MemoryAuditSink, NullAuditSink, TracingSink};
pub use truncate::{truncate_object, TruncateOutcome, Truncator, DEFAULT_MAX_OBJECT_BYTES};
