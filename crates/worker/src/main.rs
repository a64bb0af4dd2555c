mod config;

use std::sync::Arc;

use anyhow::Context;
use beacon_db::PgStore;
use beacon_events::delivery::{
    HttpSmsSender, PushRelayConfig, PushService, RelayNotifier, SmsConfig, SmtpEmailSender,
};
use beacon_events::{DeliveryOrchestrator, DigestScheduler, DispatchWorker, EmailConfig, RealtimeManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_worker=debug,beacon_events=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        base_delay_ms = config.realtime.base_delay.as_millis() as u64,
        max_attempts = config.realtime.max_attempts,
        digest_interval_secs = config.digest_interval.as_secs(),
        "Loaded worker configuration",
    );

    let pool = beacon_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    beacon_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    beacon_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PgStore::new(pool.clone()));

    // Senders are optional; a channel without one fails as "not configured".
    let mut orchestrator = DeliveryOrchestrator::new(store.clone());
    let email = match EmailConfig::from_env() {
        Some(email_config) => {
            let sender = Arc::new(SmtpEmailSender::new(email_config).context("Invalid SMTP configuration")?);
            orchestrator = orchestrator.with_email(sender.clone());
            tracing::info!("Email delivery enabled");
            Some(sender)
        }
        None => {
            tracing::warn!("SMTP_HOST not set, email delivery disabled");
            None
        }
    };
    match SmsConfig::from_env() {
        Some(sms_config) => {
            let sender = HttpSmsSender::new(sms_config).context("Invalid SMS configuration")?;
            orchestrator = orchestrator.with_sms(Arc::new(sender));
            tracing::info!("SMS delivery enabled");
        }
        None => tracing::warn!("SMS_API_URL not set, SMS delivery disabled"),
    }
    let push = match PushRelayConfig::from_env() {
        Some(relay_config) => {
            let notifier = RelayNotifier::new(relay_config).context("Invalid push relay configuration")?;
            let push = Arc::new(PushService::new(Arc::new(notifier)));
            push.init();
            orchestrator = orchestrator.with_push(Arc::clone(&push));
            tracing::info!("Push delivery enabled");
            Some(push)
        }
        None => {
            tracing::warn!("PUSH_RELAY_URL not set, push delivery disabled");
            None
        }
    };

    let realtime = RealtimeManager::new(store.clone(), config.realtime);
    let worker = DispatchWorker::new(Arc::clone(&realtime), Arc::new(orchestrator));
    let _dispatch = worker.start().await;

    let digest_cancel = CancellationToken::new();
    let digest_handle = email.map(|sender| {
        let scheduler = DigestScheduler::new(store.clone(), sender).with_interval(config.digest_interval);
        let cancel = digest_cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    });

    tracing::info!("Worker started (dispatch worker, digest scheduler)");

    shutdown_signal().await;

    digest_cancel.cancel();
    if let Some(handle) = digest_handle {
        let _ = tokio::time::timeout(config.shutdown_timeout, handle).await;
        tracing::info!("Digest scheduler stopped");
    }

    realtime.shutdown(config.shutdown_timeout).await;

    if let Some(push) = push {
        push.dispose();
    }
    pool.close().await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
