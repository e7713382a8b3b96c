#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # pipegate
//!
//! Poor man's ngrok: expose a local HTTP server to the internet through a
//! self-hosted relay. The public **server** accepts requests at
//! `/{conn_id}/{path}` and forwards them over a persistent WebSocket to the
//! **client** holding that connection id; the client replays them against a
//! local origin and streams the answers back.
//!
//! ## Subcommands
//!
//! - `pipegate serve` — run the public tunnel server
//! - `pipegate connect` — run the client-side relay on the tunneled host
//! - `pipegate token` — mint a connection id and a matching JWT bearer
//!
//! ## Architecture
//!
//! ```text
//! main.rs      — entry point, clap subcommands, router setup, shutdown
//! config.rs    — TOML + env-var configuration
//! auth.rs      — bearer validation: shared secret or JWT
//! protocol.rs  — JSON-over-text wire frames, base64 bodies
//! registry.rs  — connection id → session map, single holder per id
//! session.rs   — pending-request table, dispatch, drain
//! relay.rs     — public HTTP handler + WebSocket upgrade gate
//! client.rs    — outbound WS, origin forwarding, reconnect backoff
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use pipegate::client::{self, ClientOptions};
use pipegate::relay::{self, RelayState};
use pipegate::{Config, TokenValidator, TunnelRegistry};

/// Self-hosted reverse tunnel for HTTP origins behind NAT.
#[derive(Parser)]
#[command(name = "pipegate", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public tunnel server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the client-side relay on the tunneled host.
    Connect {
        /// Base URL of the local server to expose.
        #[arg(long)]
        local_url: String,
        /// Tunnel URL including the connection id, e.g. `wss://host/<conn-id>`.
        #[arg(long)]
        server_url: String,
        /// Bearer token for the tunnel handshake.
        #[arg(long)]
        client_token: String,
    },
    /// Mint a fresh connection id and a JWT bearer for it.
    Token {
        /// HMAC signing secret. Falls back to PIPEGATE_JWT_SECRET, then the
        /// config file's `[auth] jwt_secret`.
        #[arg(long)]
        secret: Option<String>,
        /// Token lifetime in days.
        #[arg(long, default_value_t = 21)]
        expires_days: u64,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => run_server(config.as_deref()).await,
        Commands::Connect {
            local_url,
            server_url,
            client_token,
        } => run_client(local_url, server_url, client_token).await,
        Commands::Token {
            secret,
            expires_days,
            config,
        } => mint_token(secret, expires_days, config.as_deref()),
    }
}

fn init_tracing(default_level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config.logging.level);

    info!("pipegate v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.jwt_secret.is_none() && config.auth.client_token == "change-me" {
        warn!("Using default client token — set PIPEGATE_CLIENT_TOKEN or update config");
    }

    let validator = TokenValidator::from_config(&config.auth)
        .unwrap_or_else(|e| panic!("Invalid auth config: {e}"));
    let registry = Arc::new(TunnelRegistry::new());
    let state = RelayState {
        registry: registry.clone(),
        validator: Arc::new(validator),
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        max_body_bytes: config.server.max_body_bytes,
    };
    let app = relay::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    info!("Shutting down...");
    let drained = registry.drain_all();
    if drained > 0 {
        info!(drained, "drained active tunnels");
        // Writer tasks still need a moment to put close frames on the wire.
        tokio::time::sleep(Duration::from_secs(config.server.drain_grace_secs)).await;
    }
    info!("Goodbye");
}

async fn run_client(local_url: String, server_url: String, client_token: String) {
    init_tracing("info");
    let opts = ClientOptions::new(local_url, server_url, client_token);
    if let Err(err) = client::run(opts).await {
        error!("{err}");
        std::process::exit(1);
    }
}

fn mint_token(secret: Option<String>, expires_days: u64, config_path: Option<&str>) {
    let secret = secret
        .or_else(|| std::env::var("PIPEGATE_JWT_SECRET").ok())
        .or_else(|| Config::load(config_path).auth.jwt_secret);
    let Some(secret) = secret else {
        eprintln!(
            "No JWT secret: pass --secret, set PIPEGATE_JWT_SECRET, or configure [auth] jwt_secret"
        );
        std::process::exit(1);
    };

    let conn_id = Uuid::new_v4();
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
        + expires_days * 86_400;
    let claims = serde_json::json!({ "sub": conn_id, "exp": exp });
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("JWT encodes");

    println!("Connection id: {conn_id}");
    println!("Bearer token:  {token}");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
