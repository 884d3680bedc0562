use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agentguard::api::{build_router, AppState, SERVICE_NAME, VERSION};
use agentguard::config::{LogFormat, Settings};
use agentguard::crypto::{signing_key_from_b64, signing_key_to_b64};
use anyhow::Context;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("configuration validation failed")?;
    init_tracing(&settings);

    let signing_key = load_or_generate_key(&settings)?;
    let state =
        AppState::build(settings.clone(), signing_key).context("failed to open the audit ledger")?;

    spawn_revocation_sweeper(state.clone());

    tracing::info!(
        service = SERVICE_NAME,
        version = VERSION,
        rate_limiting = settings.rate_limit_enabled,
        webhooks = settings.webhook_url.is_some(),
        cors_origins = ?settings.cors_origins_list(),
        "starting up"
    );

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match settings.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn load_or_generate_key(settings: &Settings) -> anyhow::Result<SigningKey> {
    if let Some(seed) = &settings.jwt_private_key {
        let key = signing_key_from_b64(seed).context("JWT_PRIVATE_KEY is not a valid seed")?;
        tracing::info!("token signing key loaded from JWT_PRIVATE_KEY");
        return Ok(key);
    }

    let key = SigningKey::generate(&mut OsRng);
    tracing::warn!(
        "JWT_PRIVATE_KEY not set — generated an Ed25519 keypair for this process only. \
         All tokens will be invalidated on restart. To persist the key, set \
         JWT_PRIVATE_KEY={}",
        signing_key_to_b64(&key)
    );
    Ok(key)
}

fn spawn_revocation_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let removed = state
                .revocations
                .sweep(Utc::now(), chrono::Duration::seconds(60));
            if removed > 0 {
                tracing::debug!(removed, "swept expired token revocations");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
