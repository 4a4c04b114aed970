use std::sync::Arc;

use dotenv::dotenv;
use facturo_core::billing::{BillingService, PgFiscalLedger, SequenceAllocator};
use facturo_core::config::Config;
use facturo_core::db::{create_pool, run_migrations};
use facturo_core::fiscal::{
    CertificateSigner, DocumentSigner, FiscalPipeline, HttpFiscalAuthority, UnavailableSigner,
    FISCAL_QUEUE,
};
use facturo_core::worker::{
    Backoff, BillingScheduler, EmailNotifier, JobHandler, JobOptions, JobRunner, NoopReadCache,
    PgJobQueue,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Background worker: drains the fiscal job queue and runs the daily
/// recurring billing. All progress lives in the database, so a restart
/// resumes where the previous process stopped.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(LevelFilter::INFO.into());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    info!("Starting Facturo billing worker...");

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    run_migrations(&pool).await?;

    // A missing certificate must not stop recurring billing; signing attempts
    // escalate instead.
    let signer: Arc<dyn DocumentSigner> = match CertificateSigner::load(&config.sri) {
        Ok(signer) => Arc::new(signer),
        Err(e) => {
            error!("Signing certificate unavailable: {}", e);
            Arc::new(UnavailableSigner::new(e.to_string()))
        }
    };

    let fiscal_job = JobOptions {
        queue: FISCAL_QUEUE.to_string(),
        max_attempts: config.job_max_attempts,
        backoff: Backoff::exponential(config.job_backoff_base),
    };
    let queue = PgJobQueue::new(pool.clone(), config.job_lease);
    let notifier = Arc::new(EmailNotifier::new(config.fallback_recipient.clone()));
    let cache = Arc::new(NoopReadCache);

    let billing = Arc::new(BillingService::new(
        pool.clone(),
        SequenceAllocator::new(config.invoice_prefix.clone(), config.sequence_lock_timeout)?,
        notifier.clone(),
        cache.clone(),
        fiscal_job.clone(),
        config.default_due_days,
    ));

    let pipeline: Arc<dyn JobHandler> = Arc::new(FiscalPipeline::new(
        Arc::new(PgFiscalLedger::new(pool.clone())),
        Arc::new(HttpFiscalAuthority::new(&config.sri)?),
        signer,
        Arc::new(queue.clone()),
        notifier,
        config.sri.clone(),
        fiscal_job,
    ));

    let runner = JobRunner::new(
        queue,
        FISCAL_QUEUE,
        vec![pipeline],
        config.worker_count,
        config.worker_poll_interval,
    );
    let scheduler = BillingScheduler::new(billing, cache, config.billing_hour);

    let shutdown = CancellationToken::new();
    let mut handles = runner.start(shutdown.clone());
    handles.push(scheduler.start(shutdown.clone()));

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    info!("Facturo billing worker stopped");
    Ok(())
}
