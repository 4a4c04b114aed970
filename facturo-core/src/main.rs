use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::Local;
use dotenv::dotenv;
use facturo_core::billing::{BillingService, SequenceAllocator};
use facturo_core::config::Config;
use facturo_core::db::create_pool;
use facturo_core::error::BillingError;
use facturo_core::fiscal::FISCAL_QUEUE;
use facturo_core::models::InvoiceAggregate;
use facturo_core::worker::queue::{Backoff, JobOptions};
use facturo_core::worker::services::{EmailNotifier, NoopReadCache};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Shared state for the status routes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub billing: Arc<BillingService>,
}

/// Work that needs an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Backlog {
    /// Fiscal jobs that failed for good or whose worker vanished
    pub stuck_jobs: i64,
    /// Open invoices whose fiscal record was rejected
    pub escalated_invoices: i64,
}

impl Backlog {
    fn readiness(&self) -> Json<Value> {
        let status = if self.stuck_jobs == 0 && self.escalated_invoices == 0 {
            "ok"
        } else {
            "degraded"
        };
        Json(serde_json::json!({
            "status": status,
            "database": "connected",
            "stuck_jobs": self.stuck_jobs,
            "escalated_invoices": self.escalated_invoices,
        }))
    }
}

/// Fiscal and payment status of one invoice.
#[derive(Debug, Serialize)]
pub struct InvoiceStatusView {
    pub id: Uuid,
    pub invoice_number: String,
    pub status: String,
    pub total: String,
    pub balance_due: String,
    pub fiscal_stage: String,
    pub sri_status: String,
    pub access_key: Option<String>,
    pub sri_messages: Option<Value>,
}

impl InvoiceStatusView {
    fn new(aggregate: &InvoiceAggregate, today: chrono::NaiveDate) -> Self {
        let invoice = &aggregate.invoice;
        Self {
            id: invoice.id,
            invoice_number: invoice.invoice_number.clone(),
            status: invoice.effective_status(today).as_str().to_string(),
            total: invoice.total.to_string(),
            balance_due: invoice.balance_due.to_string(),
            fiscal_stage: invoice.fiscal_stage.as_str().to_string(),
            sri_status: invoice.sri_status.as_str().to_string(),
            access_key: invoice.access_key.clone(),
            sri_messages: invoice.sri_messages.clone(),
        }
    }
}

fn error_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::NotFound { .. } => StatusCode::NOT_FOUND,
        BillingError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Liveness check.
async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "facturo-core",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn load_backlog(db: &PgPool) -> Result<Backlog, sqlx::Error> {
    let stuck_jobs: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM jobs
        WHERE queue = $1
          AND (status = 'failed'
               OR (status = 'running' AND locked_until < NOW() - INTERVAL '1 minute'))
        "#,
    )
    .bind(FISCAL_QUEUE)
    .fetch_one(db)
    .await?;

    let escalated_invoices: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM invoices WHERE sri_status = 'rejected' AND status IN ('pending', 'partial')",
    )
    .fetch_one(db)
    .await?;

    Ok(Backlog {
        stuck_jobs,
        escalated_invoices,
    })
}

/// Readiness check: the ledger store answers, with the operator backlog.
async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let backlog = load_backlog(&state.db).await.map_err(|e| {
        error!("Readiness check failed: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(backlog.readiness())
}

async fn invoice_status(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceStatusView>, StatusCode> {
    let aggregate = state.billing.get(invoice_id).await.map_err(|e| {
        if !matches!(e, BillingError::NotFound { .. }) {
            error!(invoice_id = %invoice_id, error = %e, "Invoice lookup failed");
        }
        error_status(&e)
    })?;
    Ok(Json(InvoiceStatusView::new(&aggregate, Local::now().date_naive())))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .route("/invoices/:id", get(invoice_status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

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

    info!("Starting Facturo status server...");

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;

    let billing = Arc::new(BillingService::new(
        pool.clone(),
        SequenceAllocator::new(config.invoice_prefix.clone(), config.sequence_lock_timeout)?,
        Arc::new(EmailNotifier::new(config.fallback_recipient.clone())),
        Arc::new(NoopReadCache),
        JobOptions {
            queue: FISCAL_QUEUE.to_string(),
            max_attempts: config.job_max_attempts,
            backoff: Backoff::exponential(config.job_backoff_base),
        },
        config.default_due_days,
    ));

    let app = create_router(AppState { db: pool, billing });

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_reports_operator_backlog() {
        let clear = Backlog::default().readiness();
        assert_eq!(clear.0["status"], "ok");

        let backlog = Backlog {
            stuck_jobs: 2,
            escalated_invoices: 1,
        };
        let report = backlog.readiness();
        assert_eq!(report.0["status"], "degraded");
        assert_eq!(report.0["stuck_jobs"], 2);
        assert_eq!(report.0["escalated_invoices"], 1);
    }

    #[test]
    fn test_lookup_errors_map_to_http_status() {
        assert_eq!(
            error_status(&BillingError::not_found("invoice", Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&BillingError::Transient("pool timed out".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&BillingError::state("invalid")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
