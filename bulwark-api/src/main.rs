//! Bulwark — a stateless key encryption service.
//!
//! Clients authenticate with mutual TLS; their requests are authorized
//! against glob policies and served from an enclave backed by an external
//! key store. All durable state lives in that store; this process only
//! caches plaintext keys.
//!
//! Exit codes: 0 normal, 1 configuration or startup failure, 2 runtime
//! fatal (TLS listener lost).

mod auth;
mod config;
mod error;
mod routes;
mod tls;

use axum::{Extension, Router};
use bulwark_keystore::{
    AuditLog, Enclave, FsStore, Identity, KeyStore, MemStore, Policy, TracingAuditSink,
};
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::auth::{ConnInfo, ProxySettings};
use crate::config::{Config, ConfigError};
use crate::routes::{AppState, Metrics, Shared};

const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

/// Consecutive accept failures before the listener counts as lost.
const MAX_ACCEPT_FAILURES: u32 = 5;

#[derive(Parser)]
#[command(name = "bulwark", version, about = "Stateless key encryption service")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
    /// Override the configured listen address.
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bulwark: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    init_tracing(&config);

    // Pin the crypto provider before any TLS object is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls_config = match tls::server_config(&config.tls.key, &config.tls.cert) {
        Ok(tls_config) => Arc::new(tls_config),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let state = match build_state(&config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let addr = args.addr.unwrap_or(config.address);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "cannot bind listener");
            state.default_enclave.stop();
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(%addr, version = env!("CARGO_PKG_VERSION"), "bulwark is up");

    let result = serve(listener, tls_config, state.clone(), shutdown_signal()).await;

    // Release in reverse acquisition order: listener is gone, stop the
    // sweeper, drop the backend with the state.
    state.default_enclave.stop();

    if let Err(e) = result {
        tracing::error!(error = %e, "listener lost");
        std::process::exit(EXIT_RUNTIME);
    }
    tracing::info!("bulwark stopped");
}

fn init_tracing(config: &Config) {
    let default_filter = if config.log.error {
        "bulwark=info,bulwark_api=info,bulwark_keystore=info"
    } else {
        "bulwark=warn,bulwark_api=warn,bulwark_keystore=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    if std::env::var("BULWARK_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

async fn build_state(config: &Config) -> Result<Shared, ConfigError> {
    let invalid = |what: &str, value: &str| {
        ConfigError::Invalid(format!("invalid {}: {}", what, value))
    };

    let (store, durable): (Arc<dyn KeyStore>, bool) = if let Some(fs) = &config.keystore.fs {
        let store = FsStore::new(&fs.path)
            .map_err(|e| ConfigError::Invalid(format!("keystore.fs: {}", e)))?;
        (Arc::new(store), true)
    } else {
        (Arc::new(MemStore::new()), false)
    };

    let admin = match &config.admin.identity {
        Some(identity) => {
            Identity::new(identity.clone()).map_err(|_| invalid("admin identity", identity))?
        }
        // No admin digest can ever equal this value, so the bypass is off.
        None => Identity::new("disabled").expect("static identity is valid"),
    };

    let mut audit = AuditLog::new();
    if config.log.audit {
        audit = audit.with_sink(Arc::new(TracingAuditSink));
    }

    let mut enclave =
        Enclave::new("default", admin.clone(), store, config.cache_expiry()).with_audit(audit);
    if durable {
        enclave = enclave.with_policy_persistence();
    }

    for (name, entry) in &config.policy {
        let policy = Policy::new(entry.allow.clone(), entry.deny.clone(), admin.clone())
            .map_err(|e| ConfigError::Invalid(format!("policy {}: {}", name, e)))?;
        enclave
            .set_policy(name, policy)
            .await
            .map_err(|e| ConfigError::Invalid(format!("policy {}: {}", name, e)))?;
        for identity in &entry.identities {
            let identity = Identity::new(identity.clone())
                .map_err(|_| invalid("identity", identity))?;
            enclave
                .assign_policy(name, identity)
                .map_err(|e| ConfigError::Invalid(format!("policy {}: {}", name, e)))?;
        }
    }

    let warm: Vec<String> = config.keys.iter().map(|k| k.name.clone()).collect();
    enclave
        .start(&warm)
        .await
        .map_err(|e| ConfigError::Invalid(format!("startup: {}", e)))?;

    let mut proxy_identities = Vec::new();
    for identity in &config.tls.proxy.identities {
        proxy_identities
            .push(Identity::new(identity.clone()).map_err(|_| invalid("proxy identity", identity))?);
    }

    let default_enclave = Arc::new(enclave);
    let mut enclaves = HashMap::new();
    enclaves.insert("default".to_string(), default_enclave.clone());

    Ok(Arc::new(AppState {
        default_enclave,
        enclaves,
        proxy: ProxySettings {
            identities: proxy_identities,
            cert_header: config.tls.proxy.header.cert.clone(),
        },
        metrics: Metrics::default(),
        started: Instant::now(),
        log_error: config.log.error,
    }))
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

async fn serve(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    state: Shared,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), std::io::Error> {
    let acceptor = TlsAcceptor::from(tls_config);
    let app = routes::router(state);
    let mut failures = 0u32;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    failures = 0;
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(handle_connection(acceptor, app, stream, remote));
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "accept failed");
                    if failures >= MAX_ACCEPT_FAILURES {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    app: Router,
    stream: TcpStream,
    remote: SocketAddr,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            tracing::debug!(%remote, error = %e, "TLS handshake failed");
            return;
        }
    };

    // The peer identity is fixed for the lifetime of the connection.
    let identity = tls::peer_identity(tls_stream.get_ref().1);
    let conn = ConnInfo { remote, identity };

    let service = TowerToHyperService::new(app.layer(Extension(conn)));
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        tracing::debug!(%remote, error = %e, "connection closed with error");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
