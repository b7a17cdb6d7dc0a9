//! herald server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use herald_common::config::LogFormat;
use herald_common::{Config, ScaledClock, SharedClock, SystemClock};
use herald_core::{
    BroadcastDispatcher, JobRouter, OfferCatalog, OfferService, ReachabilitySweep, ReminderService,
    StepCatalog, TelegramGateway, register_sweep,
};
use herald_db::repositories::{
    OfferInstanceRepository, ReminderSubscriptionRepository, SubjectRepository,
};
use herald_queue::{RedisBackend, RedisStateStore, RetryConfig, TaskQueue, WorkerPool, queues};
use herald_server::{AppState, router};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "herald=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(config.log.format);
    config.validate()?;

    info!("Starting herald...");

    // Database
    let db = herald_db::init(&config).await?;
    info!("Connected to database");
    herald_db::migrate(&db).await?;
    info!("Migrations completed");
    let db = Arc::new(db);

    let subjects = Arc::new(SubjectRepository::new(Arc::clone(&db)));
    let reminders_repo = Arc::new(ReminderSubscriptionRepository::new(Arc::clone(&db)));
    let offers_repo = Arc::new(OfferInstanceRepository::new(Arc::clone(&db)));

    // Redis
    let backend = Arc::new(
        RedisBackend::connect(
            &config.redis.url,
            config.redis.prefix.clone(),
            config.queue.dead_letter_limit,
        )
        .await?,
    );
    let state_store = Arc::new(RedisStateStore::connect(&config.redis.url).await?);
    info!("Connected to Redis");

    let clock: SharedClock = if config.scheduling.time_scale > 1 {
        warn!(factor = config.scheduling.time_scale, "Delays are scaled down");
        Arc::new(ScaledClock::new(config.scheduling.time_scale))
    } else {
        Arc::new(SystemClock)
    };

    let queue = Arc::new(
        TaskQueue::new(backend, clock, RetryConfig::from(&config.queue))
            .with_lease(Duration::from_secs(config.queue.lease_secs)),
    );

    // Services
    let gateway = Arc::new(TelegramGateway::new(&config.delivery)?);
    let reminders = Arc::new(ReminderService::new(
        reminders_repo,
        subjects.clone(),
        gateway.clone(),
        queue.clone(),
        Arc::new(StepCatalog::new(config.steps.clone())),
        config.scheduling.timezone,
    ));
    let offers = Arc::new(OfferService::new(
        offers_repo,
        subjects.clone(),
        gateway.clone(),
        queue.clone(),
        Arc::new(OfferCatalog::new(config.offers.clone())),
    ));
    let broadcasts = Arc::new(BroadcastDispatcher::new(
        state_store.clone(),
        queue.clone(),
        gateway.clone(),
        subjects.clone(),
        config.broadcast.clone(),
        config.redis.prefix.clone(),
    ));
    let sweep = Arc::new(ReachabilitySweep::new(
        subjects,
        reminders.clone(),
        gateway,
        config.sweep.clone(),
        broadcasts.pacer(),
    ));

    // Workers
    let router_handler = Arc::new(JobRouter::new(
        reminders.clone(),
        offers.clone(),
        broadcasts.clone(),
        sweep,
    ));
    let workers = WorkerPool::new(
        queue.clone(),
        router_handler,
        Duration::from_millis(config.queue.poll_interval_ms),
    )
    .register(queues::REMINDERS, config.queue.reminder_concurrency)
    .register(queues::OFFERS, config.queue.offer_concurrency)
    .register(queues::BROADCAST, config.queue.broadcast_concurrency)
    .register(queues::MAINTENANCE, config.queue.maintenance_concurrency)
    .start();

    register_sweep(&queue, &config.sweep, config.scheduling.timezone).await?;

    // HTTP
    let app = router(AppState {
        reminders,
        offers,
        broadcasts,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining workers...");
    workers.shutdown().await;
    if let Err(e) = state_store.shutdown().await {
        warn!(error = %e, "Failed to close Redis state store");
    }

    info!("Server shutdown complete");
    Ok(())
}
