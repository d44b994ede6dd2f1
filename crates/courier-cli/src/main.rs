//! courier: runs the outbox dispatcher against an academy demo.
//!
//! Enrolls a few students (one of them twice), cancels one enrollment and
//! closes a session, then dispatches until Ctrl+C / SIGTERM or until
//! `--run-for-ms` elapses, and prints the outbox snapshot as JSON.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `COURIER_STORE` | `memory` | Outbox store: `memory`, `sqlite` |
//! | `COURIER_DATABASE_URL` | `sqlite::memory:` | SQLite URL (sqlite store only) |
//! | `COURIER_DISPATCH_INTERVAL_MS` | `1000` | Tick period |
//! | `COURIER_BATCH_SIZE` | `100` | Max records claimed per tick |
//! | `COURIER_BACKOFF_SERIES_MS` | `1000,5000,30000,120000,600000` | Retry delays |
//! | `COURIER_HANDLER_TIMEOUT_MS` | - | Per-handler timeout |
//! | `COURIER_CLAIM_TIMEOUT_MS` | `300000` | Claim visibility window |
//! | `RUST_LOG` | `info` | Log level |

mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use courier_core::impls::SqliteOutboxStore;
use courier_core::{
    DispatcherBuilder, DispatcherConfig, Envelope, EventType, InMemoryOutboxStore,
    IntegrationEventHandler, OutboxStore, SystemClock,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::demo::{Academy, Backend, SeatLedger, SeatLedgerHandler, SessionClosed, WelcomeMailer};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Sqlite,
}

/// Transactional outbox dispatcher (academy demo)
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Runs the outbox dispatcher against an academy enrollment demo")]
struct Args {
    /// Outbox store backend
    #[arg(long, env = "COURIER_STORE", value_enum, default_value = "memory")]
    store: StoreKind,

    /// SQLite database URL
    #[arg(long, env = "COURIER_DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,

    /// Tick period in milliseconds
    #[arg(long, env = "COURIER_DISPATCH_INTERVAL_MS", default_value = "1000")]
    dispatch_interval_ms: u64,

    /// Max records claimed per tick
    #[arg(long, env = "COURIER_BATCH_SIZE", default_value = "100")]
    batch_size: usize,

    /// Retry delays in milliseconds, comma-separated
    #[arg(
        long,
        env = "COURIER_BACKOFF_SERIES_MS",
        value_delimiter = ',',
        default_value = "1000,5000,30000,120000,600000"
    )]
    backoff_series_ms: Vec<u64>,

    /// Per-handler timeout in milliseconds
    #[arg(long, env = "COURIER_HANDLER_TIMEOUT_MS")]
    handler_timeout_ms: Option<u64>,

    /// Claim visibility window in milliseconds
    #[arg(long, env = "COURIER_CLAIM_TIMEOUT_MS", default_value = "300000")]
    claim_timeout_ms: u64,

    /// Number of students to enroll
    #[arg(long, default_value = "3")]
    students: u32,

    /// Calls the welcome mailer fails before it starts succeeding
    #[arg(long, default_value = "1")]
    mailer_failures: u32,

    /// Stop after this many milliseconds instead of waiting for a signal
    #[arg(long)]
    run_for_ms: Option<u64>,
}

impl Args {
    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            dispatch_interval_ms: self.dispatch_interval_ms,
            batch_size: self.batch_size,
            backoff_series_ms: self.backoff_series_ms.clone(),
            handler_timeout_ms: self.handler_timeout_ms,
            claim_timeout_ms: self.claim_timeout_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let args = Args::parse();
    let config = args.dispatcher_config();
    config.validate()?;

    info!(store = ?args.store, "starting courier");

    let (backend, store) = create_store(&args, &config).await?;
    let academy = Academy::new(backend, SystemClock);
    academy.init_schema().await?;

    let ledger = Arc::new(SeatLedger::default());
    let handlers: Vec<Arc<dyn IntegrationEventHandler>> = vec![
        Arc::new(WelcomeMailer::new(args.mailer_failures)),
        Arc::new(SeatLedgerHandler::new(EventType::EnrollmentCreated, ledger.clone())),
        Arc::new(SeatLedgerHandler::new(EventType::EnrollmentCancelled, ledger.clone())),
    ];

    let dispatcher = DispatcherBuilder::new(store.clone())
        .handlers(handlers)
        .config(config)
        .expect_types(&[EventType::EnrollmentCreated, EventType::EnrollmentCancelled])
        .build()?;
    let handle = Arc::new(dispatcher).spawn();

    run_demo(&academy, args.students).await?;

    match args.run_for_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => {
            info!("Press Ctrl+C to shutdown");
            shutdown_signal().await;
        }
    }

    info!("shutting down dispatcher");
    handle.shutdown().await;

    let snapshot = store.snapshot().await?;
    let terminal = store.terminal(20).await?;
    let report = json!({
        "snapshot": snapshot,
        "seats": ledger.seats(),
        "terminal": terminal,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `RUST_LOG` as given; `info` when it is unset or does not parse.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

async fn create_store(
    args: &Args,
    config: &DispatcherConfig,
) -> Result<(Backend, Arc<dyn OutboxStore>)> {
    let backoff = config.backoff_policy();
    match args.store {
        StoreKind::Memory => {
            let store = InMemoryOutboxStore::new(backoff);
            info!("Using in-memory outbox");
            Ok((Backend::Memory(store.clone()), Arc::new(store)))
        }
        StoreKind::Sqlite => {
            // Every connection to `sqlite::memory:` opens its own database.
            let max_connections = if args.database_url.contains(":memory:") { 1 } else { 5 };
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(&args.database_url)
                .await?;
            let store = SqliteOutboxStore::new(pool, backoff);
            store.init_schema().await?;
            info!("Using SQLite outbox: {}", args.database_url);
            Ok((Backend::Sqlite(store.clone()), Arc::new(store)))
        }
    }
}

async fn run_demo(academy: &Academy<SystemClock>, students: u32) -> Result<()> {
    let course_id = "rust-101";
    let mut enrollments = Vec::new();
    for n in 1..=students {
        let enrollment_id = academy.enroll(&format!("stu-{n}"), course_id).await?;
        enrollments.push(enrollment_id);
    }

    // Duplicate request: no second event.
    if students > 0 {
        academy.enroll("stu-1", course_id).await?;
    }

    if let Some(last) = enrollments.last() {
        academy.cancel(last, course_id).await?;
    }

    // Nobody listens for this one; it is acked without handlers.
    let closed = SessionClosed {
        session_id: "rust-101-s1".to_string(),
        course_id: course_id.to_string(),
        attendees: students,
    };
    academy
        .publish(Envelope::from_payload(
            EventType::SessionClosed,
            &closed,
            format!("session:{}:closed", closed.session_id),
            Utc::now(),
        )?)
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
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
