//! Audit middleware for axum routers.
//!
//! Captures each request/response pair, builds an [`AuditEvent`] and hands
//! it to the [`AuditLogger`]. Auditing never changes the response: bodies
//! stream through untouched while a bounded prefix is copied, the event is
//! recorded once the response body finishes, and every pipeline failure is
//! logged and swallowed.
//!
//! ```ignore
//! let state = AuditLayerState::new(logger, EventBuilder::default());
//! let app = Router::new()
//!     .route("/api/v1/pods", post(create_pod))
//!     .layer(axum::middleware::from_fn_with_state(state, audit_middleware));
//! ```
//!
//! [`AuditEvent`]: crate::audit::AuditEvent

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditLogger, EnqueuePolicy, EventBuilder, Redactor, RequestSnapshot, Truncator};
use crate::config::AuditConfig;
use crate::error::AuditResult;

use super::capture::{CaptureBody, SharedCapture};
use super::client_ip::{client_ip, request_id_from_headers, user_agent};
use super::context::{AuditAction, AuthContext, RequestId};

/// Path prefixes that are never audited unless configured otherwise.
pub const DEFAULT_SKIP_PATHS: &[&str] = &[
    "/health",
    "/ready",
    "/metrics",
    "/api/v1/auth/refresh",
    "/docs",
    "/swagger",
];

/// Shared state of the audit middleware.
#[derive(Clone)]
pub struct AuditLayerState {
    /// Queue events are handed to.
    logger: Arc<AuditLogger>,
    /// Turns captured pairs into events.
    builder: Arc<EventBuilder>,
    /// Path prefixes passed through without auditing.
    skip_paths: Arc<[String]>,
    /// Bytes of each body retained for snapshots.
    capture_limit: usize,
}

impl AuditLayerState {
    /// State with the default skip list; the capture limit follows the
    /// builder's truncation ceiling.
    ///
    /// # Arguments
    ///
    /// * `logger` - Running logger receiving the events
    /// * `builder` - Event builder with the truncation and redaction setup
    pub fn new(logger: Arc<AuditLogger>, builder: EventBuilder) -> Self {
        let capture_limit = builder.truncator().max_bytes();
        Self {
            logger,
            builder: Arc::new(builder),
            skip_paths: DEFAULT_SKIP_PATHS.iter().map(|p| p.to_string()).collect(),
            capture_limit,
        }
    }

    /// State configured from the `[audit]` section.
    ///
    /// # Arguments
    ///
    /// * `logger` - Running logger receiving the events
    /// * `config` - Audit settings providing the ceiling, redaction, skip
    ///   list and capture limit
    pub fn from_config(logger: Arc<AuditLogger>, config: &AuditConfig) -> Self {
        let redactor = config
            .redact_sensitive
            .then(|| Redactor::new(&config.additional_sensitive_keys));
        let builder = EventBuilder::new(Truncator::new(config.max_object_bytes), redactor);

        Self::new(logger, builder)
            .with_skip_paths(config.skip_paths.clone())
            .with_capture_limit(config.capture_limit_bytes)
    }

    /// Replace the skipped path prefixes.
    pub fn with_skip_paths(mut self, skip_paths: Vec<String>) -> Self {
        self.skip_paths = skip_paths.into();
        self
    }

    /// Set how many bytes of each body are retained.
    pub fn with_capture_limit(mut self, capture_limit: usize) -> Self {
        self.capture_limit = capture_limit;
        self
    }

    pub fn logger(&self) -> &Arc<AuditLogger> {
        &self.logger
    }

    /// Whether `path` falls under one of the skipped prefixes.
    pub fn should_skip(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Build and enqueue the event for a finished exchange.
    ///
    /// Runs when the response body ends, possibly outside any task, so it
    /// never waits: a blocking policy is served from a spawned task.
    fn record(&self, snapshot: RequestSnapshot) {
        let event = match self.builder.build(&snapshot) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    request_id = %snapshot.request_id,
                    path = %snapshot.path,
                    "Failed to build audit event"
                );
                return;
            }
        };

        let event_id = event.id();
        let runtime = tokio::runtime::Handle::try_current();
        match (self.logger.policy(), runtime) {
            (EnqueuePolicy::Block { .. }, Ok(runtime)) => {
                let logger = Arc::clone(&self.logger);
                runtime.spawn(async move {
                    let result = logger.enqueue(event).await;
                    report_enqueue(result, &snapshot, event_id);
                });
            }
            _ => {
                let result = self.logger.try_enqueue(event);
                report_enqueue(result, &snapshot, event_id);
            }
        }
    }
}

fn report_enqueue(result: AuditResult<()>, snapshot: &RequestSnapshot, event_id: Uuid) {
    match result {
        Ok(()) => debug!(event_id = %event_id, request_id = %snapshot.request_id, "Audit event queued"),
        Err(e) if e.is_queue_full() => warn!(
            request_id = %snapshot.request_id,
            method = %snapshot.method,
            path = %snapshot.path,
            "Audit queue full, event rejected"
        ),
        Err(e) => warn!(
            error = %e,
            request_id = %snapshot.request_id,
            "Failed to enqueue audit event"
        ),
    }
}

fn captures_request_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Audit middleware; install with `axum::middleware::from_fn_with_state`.
pub async fn audit_middleware(
    State(state): State<AuditLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if state.should_skip(&path) {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let headers = request.headers();
    let request_id =
        request_id_from_headers(headers).unwrap_or_else(|| Uuid::new_v4().to_string());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = client_ip(headers, peer);
    let user_agent = user_agent(headers);
    let identity = request
        .extensions()
        .get::<AuthContext>()
        .map(|context| context.identity().clone());

    let (mut parts, body) = request.into_parts();
    parts.extensions.insert(RequestId(request_id.clone()));

    let request_capture = captures_request_body(&method).then(SharedCapture::default);
    let body = match &request_capture {
        Some(capture) => CaptureBody::new(body, state.capture_limit, capture.clone()).into_body(),
        None => body,
    };

    let response = next.run(Request::from_parts(parts, body)).await;

    let snapshot = RequestSnapshot {
        method: method.as_str().to_string(),
        path,
        status: response.status().as_u16(),
        request_id,
        client_ip,
        user_agent,
        identity,
        action_override: response.extensions().get::<AuditAction>().map(|a| a.0),
        ..RequestSnapshot::default()
    };

    let capture_limit = state.capture_limit;
    let (parts, body) = response.into_parts();
    let body = CaptureBody::new(body, capture_limit, SharedCapture::default())
        .on_finish(move |response_capture| {
            let mut snapshot = snapshot;
            if let Some(capture) = request_capture {
                let (body, cut) = capture.snapshot().into_snapshot();
                snapshot.request_body = body;
                snapshot.request_body_cut = cut;
            }
            let (body, cut) = response_capture.into_snapshot();
            snapshot.response_body = body;
            snapshot.response_body_cut = cut;
            state.record(snapshot);
        });

    Response::from_parts(parts, body.into_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{LoggerConfig, MemoryAuditSink};

    #[test]
    fn test_captured_methods() {
        assert!(captures_request_body(&Method::POST));
        assert!(captures_request_body(&Method::PUT));
        assert!(captures_request_body(&Method::PATCH));
        assert!(!captures_request_body(&Method::GET));
        assert!(!captures_request_body(&Method::DELETE));
    }

    #[tokio::test]
    async fn test_skip_prefixes() {
        let logger = AuditLogger::start(
            Arc::new(MemoryAuditSink::default()),
            LoggerConfig::default(),
        );
        let state = AuditLayerState::new(Arc::clone(&logger), EventBuilder::default());
        assert!(state.should_skip("/health"));
        assert!(state.should_skip("/health/live"));
        assert!(state.should_skip("/api/v1/auth/refresh"));
        assert!(!state.should_skip("/api/v1/auth/login"));
        assert!(!state.should_skip("/api/v1/pods"));

        let state = state.with_skip_paths(vec!["/internal".to_string()]);
        assert!(state.should_skip("/internal/stats"));
        assert!(!state.should_skip("/health"));

        logger.stop(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_from_config_capture_limit() {
        let logger = AuditLogger::start(
            Arc::new(MemoryAuditSink::default()),
            LoggerConfig::default(),
        );
        let config = AuditConfig {
            capture_limit_bytes: 1024,
            ..AuditConfig::default()
        };
        let state = AuditLayerState::from_config(Arc::clone(&logger), &config);
        assert_eq!(state.capture_limit, 1024);
        assert_eq!(state.builder.truncator().max_bytes(), config.max_object_bytes);

        logger.stop(std::time::Duration::from_secs(1)).await;
    }
}
