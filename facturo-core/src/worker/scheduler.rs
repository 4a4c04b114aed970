use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::service::INVOICE_CACHE_SCOPE;
use crate::error::BillingResult;
use crate::models::{Invoice, RecurringService};
use crate::worker::services::ReadCache;

/// Store operations the billing run needs.
#[async_trait]
pub trait RecurringLedger: Send + Sync {
    /// Active services whose `next_billing_date` is on or before `today`.
    async fn due_services(&self, today: NaiveDate) -> BillingResult<Vec<RecurringService>>;

    /// Bills one service. `Ok(None)` when it is no longer due once locked.
    async fn bill_service(&self, service_id: Uuid, today: NaiveDate)
        -> BillingResult<Option<Invoice>>;
}

/// Outcome of one billing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub generated: usize,
    pub failed: usize,
}

/// Time from `now` until the next `hour`:00 local time.
///
/// A run that would fire at exactly `now` is pushed to the following day,
/// since the start-up run already covered today.
pub fn delay_until_next_run(now: NaiveDateTime, hour: u32) -> Duration {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today_run = now.date().and_time(at);
    let next = if today_run > now {
        today_run
    } else {
        now.date()
            .succ_opt()
            .map(|d| d.and_time(at))
            .unwrap_or(today_run)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Daily recurring billing run.
///
/// Turns due subscriptions into invoices once at start-up and then every
/// day at the configured local hour until the shutdown token fires.
pub struct BillingScheduler {
    ledger: Arc<dyn RecurringLedger>,
    cache: Arc<dyn ReadCache>,
    billing_hour: u32,
}

impl BillingScheduler {
    pub fn new(ledger: Arc<dyn RecurringLedger>, cache: Arc<dyn ReadCache>, billing_hour: u32) -> Self {
        Self {
            ledger,
            cache,
            billing_hour,
        }
    }

    /// Bills every due service independently.
    ///
    /// A failing service is logged and counted; the rest of the batch still
    /// runs. Only a failure to list due services aborts the run.
    pub async fn run_once(&self, today: NaiveDate) -> BillingResult<BatchReport> {
        let services = self.ledger.due_services(today).await?;
        let mut report = BatchReport::default();

        if services.is_empty() {
            info!(date = %today, "No recurring services due");
            return Ok(report);
        }
        info!(date = %today, count = services.len(), "Billing due recurring services");

        for service in services {
            match self.ledger.bill_service(service.id, today).await {
                Ok(Some(invoice)) => {
                    report.generated += 1;
                    info!(
                        service_id = %service.id,
                        invoice_number = %invoice.invoice_number,
                        "Recurring invoice generated"
                    );
                }
                Ok(None) => {
                    warn!(service_id = %service.id, "Recurring service no longer due, skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        service_id = %service.id,
                        service = %service.name,
                        kind = e.kind(),
                        "Recurring billing failed: {}",
                        e
                    );
                }
            }
        }

        if report.generated > 0 {
            self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
        }
        info!(
            generated = report.generated,
            failed = report.failed,
            "Recurring billing run finished"
        );
        Ok(report)
    }

    /// Spawns the run loop.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(billing_hour = self.billing_hour, "BillingScheduler started");
            loop {
                let today = Local::now().date_naive();
                if let Err(e) = self.run_once(today).await {
                    error!(date = %today, "Recurring billing run failed: {}", e);
                }

                let delay = delay_until_next_run(Local::now().naive_local(), self.billing_hour);
                info!(next_run_in_secs = delay.as_secs(), "Next recurring billing run scheduled");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!("BillingScheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::models::invoice::tests::sample_invoice;
    use crate::models::{BillingCycle, ServiceStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        date(y, m, d).and_hms_opt(h, min, 0).unwrap()
    }

    fn service(name: &str) -> RecurringService {
        RecurringService {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: name.to_string(),
            amount: dec!(25.00),
            billing_cycle: BillingCycle::Monthly,
            next_billing_date: date(2026, 10, 1),
            billing_day: 1,
            status: ServiceStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct FakeLedger {
        services: Vec<RecurringService>,
        failing: Option<Uuid>,
        list_fails: bool,
        billed: Mutex<Vec<Uuid>>,
        listed: Mutex<u32>,
    }

    #[async_trait]
    impl RecurringLedger for FakeLedger {
        async fn due_services(&self, _today: NaiveDate) -> BillingResult<Vec<RecurringService>> {
            *self.listed.lock().unwrap() += 1;
            if self.list_fails {
                return Err(BillingError::Transient("connection reset".to_string()));
            }
            Ok(self.services.clone())
        }

        async fn bill_service(
            &self,
            service_id: Uuid,
            _today: NaiveDate,
        ) -> BillingResult<Option<Invoice>> {
            if self.failing == Some(service_id) {
                return Err(BillingError::state("project has no client"));
            }
            self.billed.lock().unwrap().push(service_id);
            Ok(Some(sample_invoice(dec!(25.00)).invoice))
        }
    }

    #[derive(Default)]
    struct CountingCache {
        scopes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReadCache for CountingCache {
        async fn invalidate(&self, scope: &str) {
            self.scopes.lock().unwrap().push(scope.to_string());
        }
    }

    fn scheduler(ledger: FakeLedger) -> (BillingScheduler, Arc<FakeLedger>, Arc<CountingCache>) {
        let ledger = Arc::new(ledger);
        let cache = Arc::new(CountingCache::default());
        (
            BillingScheduler::new(ledger.clone(), cache.clone(), 8),
            ledger,
            cache,
        )
    }

    #[tokio::test]
    async fn test_failing_service_does_not_stop_batch() {
        let services = vec![service("Hosting"), service("Soporte"), service("Dominio")];
        let failing = services[1].id;
        let (scheduler, ledger, cache) = scheduler(FakeLedger {
            services: services.clone(),
            failing: Some(failing),
            list_fails: false,
            billed: Mutex::new(Vec::new()),
            listed: Mutex::new(0),
        });

        let report = scheduler.run_once(date(2026, 10, 19)).await.unwrap();

        assert_eq!(report, BatchReport { generated: 2, failed: 1 });
        assert_eq!(
            *ledger.billed.lock().unwrap(),
            vec![services[0].id, services[2].id]
        );
        assert_eq!(*cache.scopes.lock().unwrap(), vec![INVOICE_CACHE_SCOPE.to_string()]);
    }

    #[tokio::test]
    async fn test_empty_run_leaves_cache_alone() {
        let (scheduler, _, cache) = scheduler(FakeLedger {
            services: Vec::new(),
            failing: None,
            list_fails: false,
            billed: Mutex::new(Vec::new()),
            listed: Mutex::new(0),
        });

        let report = scheduler.run_once(date(2026, 10, 19)).await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert!(cache.scopes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let (scheduler, _, _) = scheduler(FakeLedger {
            services: vec![service("Hosting")],
            failing: None,
            list_fails: true,
            billed: Mutex::new(Vec::new()),
            listed: Mutex::new(0),
        });

        assert!(matches!(
            scheduler.run_once(date(2026, 10, 19)).await,
            Err(BillingError::Transient(_))
        ));
    }

    #[test]
    fn test_delay_before_billing_hour_is_same_day() {
        assert_eq!(
            delay_until_next_run(at(2026, 10, 19, 6, 30), 8),
            Duration::from_secs(90 * 60)
        );
    }

    #[test]
    fn test_delay_at_or_after_billing_hour_is_next_day() {
        assert_eq!(
            delay_until_next_run(at(2026, 10, 19, 8, 0), 8),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            delay_until_next_run(at(2026, 12, 31, 20, 0), 8),
            Duration::from_secs(12 * 3600)
        );
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let (scheduler, ledger, _) = scheduler(FakeLedger {
            services: vec![service("Hosting")],
            failing: None,
            list_fails: false,
            billed: Mutex::new(Vec::new()),
            listed: Mutex::new(0),
        });
        let token = CancellationToken::new();
        let handle = scheduler.start(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(ledger.billed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_is_rescheduled() {
        let (scheduler, ledger, cache) = scheduler(FakeLedger {
            services: vec![service("Hosting")],
            failing: None,
            list_fails: true,
            billed: Mutex::new(Vec::new()),
            listed: Mutex::new(0),
        });
        let token = CancellationToken::new();
        let handle = scheduler.start(token.clone());

        // The paused clock jumps ahead through two daily runs.
        tokio::time::sleep(Duration::from_secs(2 * 24 * 3600 + 60)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(*ledger.listed.lock().unwrap() >= 3);
        assert!(ledger.billed.lock().unwrap().is_empty());
        assert!(cache.scopes.lock().unwrap().is_empty());
    }
}
