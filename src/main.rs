//! gantry-relay entry point.
//!
//! Startup order: logging, configuration, shared components, listeners,
//! limiter sweeper, ready. Shutdown on SIGINT/SIGTERM: stop accepting,
//! say goodbye to every tunnel, drain in-flight requests for a bounded
//! grace window, then exit. SIGQUIT exits immediately without draining.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use gantry_relay::RelayState;
use gantry_relay::auth::{AuthLimiter, AuthLimiterConfig};
use gantry_relay::config::{Config, parse_listen_addr};
use gantry_relay::frontend;
use gantry_relay::lifecycle::{DrainResult, LifecycleManager};
use gantry_relay::registry::TunnelRegistry;
use gantry_relay::{admin, redirect};

/// Grace window for in-flight public requests after shutdown is signaled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reverse-tunnel relay for firewalled hospital imaging endpoints.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Phase 1: observability. Non-blocking writer so logging never stalls
    // the runtime; the guard must live for the whole process.
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(std::io::stdout());
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("GANTRY_RELAY_LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if std::env::var("GANTRY_RELAY_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_writer(non_blocking)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(filter)
            .init();
    }

    info!("starting gantry relay");

    // Phase 2: configuration.
    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    // Phase 3: shared components.
    let lifecycle = Arc::new(LifecycleManager::new(DRAIN_TIMEOUT));
    let registry = Arc::new(TunnelRegistry::new());
    let auth = Arc::new(AuthLimiter::new(AuthLimiterConfig::default()));
    let state = Arc::new(RelayState::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&auth),
        Arc::clone(&lifecycle),
    ));

    let shutdown = lifecycle.shutdown_token();
    auth.spawn_sweeper(shutdown.clone());

    // Phase 4: admin endpoint.
    if let Some(metrics_addr) = &config.metrics_addr {
        let addr = parse_listen_addr(metrics_addr)?;
        let listener = TcpListener::bind(addr).await?;
        let admin_registry = Arc::clone(&registry);
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::run(listener, admin_registry, admin_shutdown).await {
                error!(error = %e, "admin server error");
            }
        });
    }

    // Phase 5: TLS mode and the port-80 ACME/redirect listener.
    let (tls_mode, issuer) = frontend::build_tls_mode(&config)?;
    if config.tls.enabled {
        match TcpListener::bind("0.0.0.0:80").await {
            Ok(listener) => {
                let redirect_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = redirect::run(listener, issuer, redirect_shutdown).await {
                        error!(error = %e, "HTTP redirect server error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "could not bind :80, ACME HTTP-01 and redirects disabled"),
        }
    }

    // Phase 6: public listener.
    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = TcpListener::bind(listen_addr).await?;

    setup_signal_handlers(Arc::clone(&lifecycle));
    lifecycle.mark_ready();

    frontend::run(Arc::clone(&state), tls_mode, listener, shutdown.clone()).await?;

    // Shutdown: the accept loop has exited; say goodbye to the tunnels and
    // give in-flight requests a bounded grace window.
    registry.shutdown_all("server shutting down").await;
    info!(
        active_requests = lifecycle.active_request_count(),
        grace_secs = DRAIN_TIMEOUT.as_secs(),
        "waiting for in-flight requests to drain"
    );
    let drain = lifecycle.drain_requests().await;
    lifecycle.mark_stopped();

    match drain {
        DrainResult::Complete => {
            info!("relay stopped cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            warn!(remaining, "drain window elapsed with requests in flight");
            Err(format!("drain timeout with {remaining} requests remaining").into())
        }
    }
}

/// SIGINT/SIGTERM begin the graceful path; SIGQUIT is immediate.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = Arc::clone(&lifecycle);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        let lifecycle_sigterm = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("received SIGTERM, initiating graceful shutdown");
                    lifecycle_sigterm.begin_shutdown();
                }
                Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
            }
        });

        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit()) {
                Ok(mut sigquit) => {
                    sigquit.recv().await;
                    warn!(
                        active_requests = lifecycle.active_request_count(),
                        "received SIGQUIT, immediate shutdown"
                    );
                    std::process::exit(1);
                }
                Err(e) => error!(error = %e, "failed to listen for SIGQUIT"),
            }
        });
    }

    #[cfg(not(unix))]
    let _ = lifecycle;
}
