//! Audit Pipeline - HTTP host serving a resource API behind the audit middleware.

use std::env;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use audit_pipeline::audit::{AuditLogger, AuditSink, JsonLinesSink, NullAuditSink, TracingSink};
use audit_pipeline::config::{AuditConfig, Settings};
use audit_pipeline::error::AuditError;
use audit_pipeline::http::AuditLayerState;
use audit_pipeline::server::{self, AppState, ResourceStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");
const DEFAULT_CONFIG_PATH: &str = "/etc/audit-pipeline/config.toml";

fn main() -> ExitCode {
    // Parse command line arguments (simple std::env approach)
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{} {}", NAME, VERSION);
        return ExitCode::SUCCESS;
    }

    let explicit_path = get_config_path(&args);
    let (settings, source) = match load_settings(explicit_path.as_deref(), DEFAULT_CONFIG_PATH) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting {} v{}", NAME, VERSION);
    match &source {
        Some(path) => info!("Configuration loaded from: {}", path),
        None => info!("Configuration loaded from: defaults"),
    }
    info!("Listening address: {}", settings.server.bind);
    info!("Log level: {}", settings.logging.level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(async_main(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

/// Load settings from the explicit path, else the default path if present.
///
/// Returns the settings and the file they came from; `None` means built-in
/// defaults were used because no file was given and the default is absent.
///
/// # Errors
///
/// Returns an error if the chosen file cannot be read, parsed or validated.
fn load_settings(
    explicit: Option<&str>,
    default_path: &str,
) -> Result<(Settings, Option<String>), AuditError> {
    let path = match explicit {
        Some(path) => path,
        None if Path::new(default_path).exists() => default_path,
        None => return Ok((Settings::default(), None)),
    };
    Ok((Settings::load(path)?, Some(path.to_string())))
}

/// Build the configured persistence sink.
fn open_sink(config: &AuditConfig) -> Result<Arc<dyn AuditSink>, Box<dyn std::error::Error>> {
    let sink: Arc<dyn AuditSink> = match config.sink.to_lowercase().as_str() {
        "tracing" => Arc::new(TracingSink::new()),
        "null" => Arc::new(NullAuditSink::new()),
        _ => {
            let sink = JsonLinesSink::open(&config.log_path)?;
            info!(path = %sink.path().display(), "Audit events written to file");
            Arc::new(sink)
        }
    };
    Ok(sink)
}

/// Async main function.
async fn async_main(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let logger = if settings.audit.enabled {
        let sink = open_sink(&settings.audit)?;
        Some(AuditLogger::start(sink, settings.audit.logger_config()))
    } else {
        warn!("Audit logging is disabled");
        None
    };

    let state = AppState::new(Arc::new(ResourceStore::new()), logger.clone());
    let audit = logger
        .as_ref()
        .map(|l| AuditLayerState::from_config(Arc::clone(l), &settings.audit));
    let app = server::app(state, audit, settings.server.trust_identity_headers);

    let listener = TcpListener::bind(settings.server.bind).await?;
    info!(address = %listener.local_addr()?, "HTTP server listening");

    let shutdown = Arc::new(Notify::new());
    let shutdown_for_serve = Arc::clone(&shutdown);
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown_for_serve.notified().await });
    let mut serve = tokio::spawn(serve.into_future());

    tokio::select! {
        result = &mut serve => {
            result??;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            shutdown.notify_one();

            // Wait for in-flight requests with timeout
            let drain_timeout = Duration::from_secs(settings.server.shutdown_timeout_seconds);
            match tokio::time::timeout(drain_timeout, &mut serve).await {
                Ok(_) => info!("HTTP server stopped"),
                Err(_) => {
                    warn!(
                        "Shutdown timeout after {}s, some requests may be terminated",
                        drain_timeout.as_secs()
                    );
                    serve.abort();
                }
            }
        }
    }

    if let Some(logger) = logger {
        let drained = logger.stop(settings.audit.drain_timeout()).await;
        if !drained {
            warn!("Audit queue not fully drained before shutdown");
        }
    }

    info!("Server stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print help message.
fn print_help() {
    println!(
        r#"{} {}
HTTP service with an asynchronous, bounded audit-logging pipeline.

USAGE:
    {} [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file
                           [default: {}]
    -h, --help             Print help information
    -V, --version          Print version information
"#,
        NAME, VERSION, NAME, DEFAULT_CONFIG_PATH
    );
}

/// Get configuration file path from command line arguments.
fn get_config_path(args: &[String]) -> Option<String> {
    for (i, arg) in args.iter().enumerate() {
        if (arg == "--config" || arg == "-c") && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Initialize logging based on settings.
fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    match settings.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            // Default to pretty format
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
