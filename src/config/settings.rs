//! Configuration settings for the audit pipeline.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::truncate::MIN_MAX_OBJECT_BYTES;
use crate::audit::{EnqueuePolicy, LoggerConfig};
use crate::error::AuditError;
use crate::http::DEFAULT_SKIP_PATHS;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Seconds to wait for in-flight requests on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Accept identity headers from an authenticating reverse proxy.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Audit pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Whether audit logging is enabled.
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Persistence sink ("file", "tracing" or "null").
    #[serde(default = "default_sink")]
    pub sink: String,
    /// Path to the JSON lines file used by the "file" sink.
    #[serde(default = "default_audit_log_path")]
    pub log_path: PathBuf,
    /// Maximum number of queued events.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Behavior when the queue is full ("fail_fast" or "block").
    #[serde(default = "default_enqueue_policy")]
    pub enqueue_policy: String,
    /// Maximum wait for a queue slot under the "block" policy.
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,
    /// Maximum events per sink write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Additional attempts after a failed write.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between write attempts.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Seconds allowed for draining the queue on shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Ceiling for each serialized object snapshot.
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: usize,
    /// Maximum body bytes retained for auditing per request/response.
    #[serde(default = "default_capture_limit")]
    pub capture_limit_bytes: usize,
    /// Whether sensitive values are redacted from snapshots.
    #[serde(default = "default_redact_sensitive")]
    pub redact_sensitive: bool,
    /// Key fragments redacted in addition to the built-in list.
    #[serde(default)]
    pub additional_sensitive_keys: Vec<String>,
    /// Path prefixes that never produce audit events.
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,
}

// Default value functions
fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_audit_enabled() -> bool {
    true
}

fn default_sink() -> String {
    "file".to_string()
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/audit-pipeline/audit.log")
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_enqueue_policy() -> String {
    "fail_fast".to_string()
}

fn default_enqueue_timeout() -> u64 {
    50
}

fn default_batch_size() -> usize {
    64
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_max_object_bytes() -> usize {
    65_536 // 64 KiB
}

fn default_capture_limit() -> usize {
    65_536
}

fn default_redact_sensitive() -> bool {
    true
}

fn default_skip_paths() -> Vec<String> {
    DEFAULT_SKIP_PATHS.iter().map(|p| p.to_string()).collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            trust_identity_headers: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            sink: default_sink(),
            log_path: default_audit_log_path(),
            queue_capacity: default_queue_capacity(),
            enqueue_policy: default_enqueue_policy(),
            enqueue_timeout_ms: default_enqueue_timeout(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            drain_timeout_seconds: default_drain_timeout(),
            max_object_bytes: default_max_object_bytes(),
            capture_limit_bytes: default_capture_limit(),
            redact_sensitive: default_redact_sensitive(),
            additional_sensitive_keys: Vec::new(),
            skip_paths: default_skip_paths(),
        }
    }
}

impl AuditConfig {
    /// Queue and worker tuning derived from this configuration.
    pub fn logger_config(&self) -> LoggerConfig {
        let enqueue_policy = if self.enqueue_policy.eq_ignore_ascii_case("block") {
            EnqueuePolicy::Block {
                timeout: Duration::from_millis(self.enqueue_timeout_ms),
            }
        } else {
            EnqueuePolicy::FailFast
        };

        LoggerConfig {
            queue_capacity: self.queue_capacity,
            enqueue_policy,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_object_bytes: self.max_object_bytes,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

impl Settings {
    /// Load settings from a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AuditError::Config {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            AuditError::Config { message } => AuditError::Config {
                message: format!("{} ({})", message, path.display()),
            },
            other => other,
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, AuditError> {
        let settings: Settings = toml::from_str(content).map_err(|e| AuditError::Config {
            message: format!("Failed to parse config: {}", e),
        })?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), AuditError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(AuditError::Config {
                message: format!(
                    "Invalid log level '{}'. Valid levels: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(AuditError::Config {
                message: format!(
                    "Invalid log format '{}'. Valid formats: {:?}",
                    self.logging.format, valid_formats
                ),
            });
        }

        let valid_sinks = ["file", "tracing", "null"];
        if !valid_sinks.contains(&self.audit.sink.to_lowercase().as_str()) {
            return Err(AuditError::Config {
                message: format!(
                    "Invalid audit sink '{}'. Valid sinks: {:?}",
                    self.audit.sink, valid_sinks
                ),
            });
        }

        let valid_policies = ["fail_fast", "block"];
        if !valid_policies.contains(&self.audit.enqueue_policy.to_lowercase().as_str()) {
            return Err(AuditError::Config {
                message: format!(
                    "Invalid enqueue policy '{}'. Valid policies: {:?}",
                    self.audit.enqueue_policy, valid_policies
                ),
            });
        }

        if self.audit.queue_capacity == 0 {
            return Err(AuditError::Config {
                message: "audit.queue_capacity must be greater than zero".to_string(),
            });
        }

        if self.audit.batch_size == 0 {
            return Err(AuditError::Config {
                message: "audit.batch_size must be greater than zero".to_string(),
            });
        }

        if self.audit.max_object_bytes < MIN_MAX_OBJECT_BYTES {
            return Err(AuditError::Config {
                message: format!(
                    "audit.max_object_bytes must be at least {} bytes",
                    MIN_MAX_OBJECT_BYTES
                ),
            });
        }

        if self.audit.skip_paths.iter().any(|p| !p.starts_with('/')) {
            return Err(AuditError::Config {
                message: "audit.skip_paths entries must start with '/'".to_string(),
            });
        }

        Ok(())
    }
}
