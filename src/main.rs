//! SignalGate - Signal Approval & Webhook Authentication Gateway
//! Mission: Accept signed trading signals, approve each exactly once, and hand
//! the execution engine a device-bound token to act on it

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signalgate_backend::{
    api::{create_router, AppState},
    auth::ConsumerAuth,
    clock::{SharedClock, SystemClock},
    config::{clamp_token_ttl, PipelineConfig, ProducerRegistry},
    middleware::{RateLimitConfig, RateLimiter},
    storage::Database,
    tasks::spawn_sweeper,
    workflow::ApprovalWorkflow,
};

#[derive(Parser, Debug)]
#[command(name = "signalgate")]
#[command(about = "Signal approval and webhook authentication gateway")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind: String,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "signalgate.db")]
    db_path: String,

    /// Secret used to sign approval tokens
    #[arg(long, env = "APPROVAL_TOKEN_SECRET", hide_env_values = true)]
    token_secret: String,

    /// TOML file with [[producer]] entries
    #[arg(long, env = "PRODUCERS_FILE")]
    producers_file: Option<PathBuf>,

    /// Inline producers as id:secret,id2:secret2 (used when no file is given)
    #[arg(long, env = "PRODUCER_SECRETS", hide_env_values = true)]
    producer_secrets: Option<String>,

    /// API key required on consumer read endpoints
    #[arg(long, env = "CONSUMER_API_KEY", hide_env_values = true)]
    consumer_api_key: Option<String>,

    /// Allowed webhook clock skew in seconds
    #[arg(long, env = "CLOCK_SKEW_SECS", default_value_t = 300)]
    clock_skew_secs: u64,

    /// Idempotency record lifetime in seconds
    #[arg(long, env = "IDEMPOTENCY_TTL_SECS", default_value_t = 86_400)]
    idempotency_ttl_secs: u64,

    /// Approval token lifetime in seconds (clamped to 60..=300)
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 120)]
    token_ttl_secs: u64,

    /// Seconds before an abandoned idempotency reservation can be taken over
    #[arg(long, env = "RESERVATION_TTL_SECS", default_value_t = 30)]
    reservation_ttl_secs: u64,

    /// Seconds a duplicate waits for an in-flight request
    #[arg(long, env = "RESERVATION_WAIT_SECS", default_value_t = 10)]
    reservation_wait_secs: u64,

    /// Seconds between maintenance sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Requests per producer per rate-limit window
    #[arg(long, env = "RATE_LIMIT_REQUESTS", default_value_t = 120)]
    rate_limit_requests: u32,

    /// Rate-limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    rate_limit_window_secs: u64,

    /// Extra requests allowed above the quota
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 30)]
    rate_limit_burst: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    if args.token_secret.len() < 32 {
        bail!("APPROVAL_TOKEN_SECRET must be at least 32 bytes");
    }

    let producers = load_producers(&args)?;
    if producers.is_empty() {
        warn!("No producers registered; every webhook will be rejected");
    }
    info!("Loaded {} producer(s)", producers.len());

    let requested_ttl = Duration::from_secs(args.token_ttl_secs);
    let token_ttl = clamp_token_ttl(requested_ttl);
    if token_ttl != requested_ttl {
        warn!(
            requested_secs = args.token_ttl_secs,
            effective_secs = token_ttl.as_secs(),
            "Token TTL clamped"
        );
    }

    let config = PipelineConfig {
        clock_skew_tolerance: Duration::from_secs(args.clock_skew_secs),
        idempotency_ttl: Duration::from_secs(args.idempotency_ttl_secs),
        token_ttl,
        reservation_ttl: Duration::from_secs(args.reservation_ttl_secs),
        reservation_wait: Duration::from_secs(args.reservation_wait_secs),
        token_secret: args.token_secret.clone(),
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let db = Database::open(&args.db_path)
        .with_context(|| format!("Failed to open database {}", args.db_path))?;

    let rate_limiter = RateLimiter::new(
        RateLimitConfig {
            max_requests: args.rate_limit_requests,
            window: Duration::from_secs(args.rate_limit_window_secs),
            burst: args.rate_limit_burst,
        },
        clock.clone(),
    )
    .with_overrides(producers.rate_limit_overrides());

    let workflow = Arc::new(ApprovalWorkflow::new(
        db,
        clock,
        &config,
        producers,
        rate_limiter,
    ));

    let consumer_auth = ConsumerAuth::new(args.consumer_api_key.as_deref());
    if !consumer_auth.is_enabled() {
        warn!("CONSUMER_API_KEY not set; /signals is unauthenticated");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sweeper = spawn_sweeper(
        workflow.clone(),
        Duration::from_secs(args.sweep_interval_secs.max(1)),
        shutdown_tx.subscribe(),
    );

    let app = create_router(AppState {
        workflow,
        consumer_auth: Arc::new(consumer_auth),
    });

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!("SignalGate listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down background tasks");
    let _ = shutdown_tx.send(());
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }

    Ok(())
}

fn load_producers(args: &Args) -> Result<ProducerRegistry> {
    if let Some(path) = &args.producers_file {
        return ProducerRegistry::from_toml_file(path);
    }
    match &args.producer_secrets {
        Some(spec) => ProducerRegistry::from_env_spec(spec),
        None => Ok(ProducerRegistry::default()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalgate_backend=debug,signalgate=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate-root .env when running from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
