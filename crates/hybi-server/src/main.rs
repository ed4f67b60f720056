//! hybi-server: WebSocket conversation server.
//!
//! Accepts WebSocket (optionally TLS) connections, validates the upgrade
//! handshake against the origin allow-list and binds the services each client
//! asks for.

mod config;
mod server;
mod services;
mod tls;

use clap::Parser;
use config::ServerConfig;
use server::HybiServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// hybi-server: WebSocket conversation server
#[derive(Parser, Debug)]
#[command(name = "hybi-server", version, about = "WebSocket conversation server")]
struct Cli {
    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.hybi/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Log conversation lifecycle at info level
    #[arg(long)]
    print_log: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting hybi-server");

    let (cert_path, key_path) = if cli.generate_cert {
        match tls::generate_dev_cert(&tls::dev_cert_dir()) {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (c.to_str().map(str::to_string), k.to_str().map(str::to_string))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.host.as_deref(),
        cli.port,
        cert_path.as_deref(),
        key_path.as_deref(),
        cli.print_log,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match (&server_config.cert_path, &server_config.key_path) {
        (Some(cert), Some(key)) => match tls::load_server_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => None,
    };

    let hybi_server = HybiServer::new(
        &server_config,
        services::registry(&server_config),
        tls_config,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    if let Err(e) = hybi_server
        .run(&server_config.listen_addr(), shutdown)
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("hybi-server stopped");
}

/// Cancel `shutdown` on Ctrl+C, or on SIGTERM where there is one.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = terminate => info!("terminate received, shutting down"),
    }
    shutdown.cancel();
}
