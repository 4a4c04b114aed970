use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::billing::converters::{self, InvoiceDraft};
use crate::billing::sequence::SequenceAllocator;
use crate::billing::store;
use crate::error::{BillingError, BillingResult};
use crate::fiscal::pipeline::AuthorizeInvoiceJob;
use crate::fiscal::state_machine::FiscalStage;
use crate::models::{
    CreateInvoice, Invoice, InvoiceAggregate, InvoicePayment, InvoiceStatus, NewPayment,
    PaymentMethod, ProjectStatus, Quote, QuoteStatus, RecurringService, ServiceStatus,
    SriStatus, UpdateInvoice, UpdateQuote,
};
use crate::worker::queue::{JobOptions, PgJobQueue};
use crate::worker::scheduler::RecurringLedger;
use crate::worker::services::{BillingEvent, Notifier, ReadCache};

/// Cache scope holding invoice read views.
pub const INVOICE_CACHE_SCOPE: &str = "invoices";

/// Invoice lifecycle operations over the ledger store.
///
/// Every mutation locks the invoice row for the length of its transaction,
/// enqueues follow-up fiscal work inside that same transaction, and only
/// notifies and invalidates caches after commit.
#[derive(Clone)]
pub struct BillingService {
    pool: PgPool,
    allocator: SequenceAllocator,
    notifier: Arc<dyn Notifier>,
    cache: Arc<dyn ReadCache>,
    fiscal_job: JobOptions,
    default_due_days: i64,
}

impl BillingService {
    pub fn new(
        pool: PgPool,
        allocator: SequenceAllocator,
        notifier: Arc<dyn Notifier>,
        cache: Arc<dyn ReadCache>,
        fiscal_job: JobOptions,
        default_due_days: i64,
    ) -> Self {
        Self {
            pool,
            allocator,
            notifier,
            cache,
            fiscal_job,
            default_due_days,
        }
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    pub async fn get(&self, invoice_id: Uuid) -> BillingResult<InvoiceAggregate> {
        let mut tx = self.pool.begin().await?;
        let aggregate = store::load_aggregate(&mut tx, invoice_id, false).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    /// Creates an operator-entered invoice.
    pub async fn create(&self, input: CreateInvoice) -> BillingResult<InvoiceAggregate> {
        let draft = converters::draft_from_request(input)?;

        let mut tx = self.pool.begin().await?;
        let (aggregate, email) = self.insert_draft(&mut tx, &draft).await?;
        tx.commit().await?;

        self.after_generated(&aggregate.invoice, email).await;
        Ok(aggregate)
    }

    /// Converts an approved quote. A quote converts at most once.
    pub async fn from_quote(
        &self,
        quote_id: Uuid,
        due_days: Option<i64>,
    ) -> BillingResult<InvoiceAggregate> {
        let mut tx = self.pool.begin().await?;

        // The quote row lock serializes concurrent conversions of the same quote.
        let quote = store::load_quote(&mut tx, quote_id, true).await?;
        if let Some(existing) = store::invoice_for_quote(&mut tx, quote_id).await? {
            return Err(BillingError::Conflict(format!(
                "quote {} was already invoiced as {}",
                quote_id, existing
            )));
        }
        let items = store::quote_items(&mut tx, quote_id).await?;
        let draft = converters::draft_from_quote(
            &quote,
            &items,
            Self::today(),
            due_days.unwrap_or(self.default_due_days),
        )?;

        let (aggregate, email) = self.insert_draft(&mut tx, &draft).await?;
        tx.commit().await?;

        info!(quote_id = %quote_id, invoice_number = %aggregate.invoice.invoice_number, "Quote invoiced");
        self.after_generated(&aggregate.invoice, email).await;
        Ok(aggregate)
    }

    /// Bills the current period of a subscription and advances its billing
    /// date in the same transaction.
    pub async fn from_recurring_service(
        &self,
        service_id: Uuid,
        due_days: Option<i64>,
    ) -> BillingResult<InvoiceAggregate> {
        let due_days = due_days.unwrap_or(self.default_due_days);
        let mut tx = self.pool.begin().await?;
        let service = store::load_service(&mut tx, service_id, true).await?;
        let (aggregate, email) = self
            .bill_locked_service(&mut tx, &service, Self::today(), due_days)
            .await?;
        tx.commit().await?;

        self.after_generated(&aggregate.invoice, email).await;
        Ok(aggregate)
    }

    async fn bill_locked_service(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        service: &RecurringService,
        today: NaiveDate,
        due_days: i64,
    ) -> BillingResult<(InvoiceAggregate, Option<String>)> {
        let project = store::load_project(tx, service.project_id).await?;
        if project.status == ProjectStatus::Canceled {
            return Err(BillingError::state(format!(
                "project {} of recurring service {} is canceled",
                project.id, service.id
            )));
        }
        let billing =
            converters::draft_from_service(service, project.client_id, today, due_days)?;

        let generated = self.insert_draft(tx, &billing.draft).await?;
        store::advance_service(tx, service.id, billing.next_billing_date).await?;

        info!(
            service_id = %service.id,
            period = %service.next_billing_date,
            next_billing_date = %billing.next_billing_date,
            "Recurring service billed"
        );
        Ok(generated)
    }

    pub async fn update(
        &self,
        invoice_id: Uuid,
        input: UpdateInvoice,
    ) -> BillingResult<InvoiceAggregate> {
        let mut tx = self.pool.begin().await?;
        let mut aggregate = store::load_aggregate(&mut tx, invoice_id, true).await?;
        let was_rejected = aggregate.invoice.sri_status == SriStatus::Rejected;

        aggregate.update(input, Utc::now())?;
        store::replace_items(&mut tx, invoice_id, &aggregate.items).await?;
        store::save_invoice(&mut tx, &aggregate.invoice).await?;

        // The previous authorization job ended with the rejection.
        if was_rejected {
            self.enqueue_authorization(&mut tx, invoice_id).await?;
        }
        tx.commit().await?;

        self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
        Ok(aggregate)
    }

    pub async fn delete(&self, invoice_id: Uuid) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let aggregate = store::load_aggregate(&mut tx, invoice_id, true).await?;
        aggregate.ensure_deletable()?;
        store::delete_invoice(&mut tx, invoice_id).await?;
        tx.commit().await?;

        info!(invoice_id = %invoice_id, "Invoice deleted");
        self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
        Ok(())
    }

    pub async fn apply_payment(
        &self,
        invoice_id: Uuid,
        input: NewPayment,
    ) -> BillingResult<InvoicePayment> {
        let mut tx = self.pool.begin().await?;
        let mut aggregate = store::load_aggregate(&mut tx, invoice_id, true).await?;

        let payment = aggregate.apply_payment(input, Utc::now())?;
        store::insert_payment(&mut tx, &payment).await?;
        store::save_invoice(&mut tx, &aggregate.invoice).await?;
        let email = store::client_email(&mut tx, aggregate.invoice.client_id).await?;
        tx.commit().await?;

        self.after_payment(&aggregate.invoice, &payment, email).await;
        Ok(payment)
    }

    /// Settles the remaining balance. Already-paid invoices are returned as is.
    pub async fn mark_fully_paid(
        &self,
        invoice_id: Uuid,
        method: PaymentMethod,
        notes: Option<String>,
    ) -> BillingResult<InvoiceAggregate> {
        let mut tx = self.pool.begin().await?;
        let mut aggregate = store::load_aggregate(&mut tx, invoice_id, true).await?;
        let was_paid = aggregate.invoice.status == InvoiceStatus::Paid;

        let payment = aggregate.mark_fully_paid(method, notes, Self::today(), Utc::now())?;
        let Some(payment) = payment else {
            if !was_paid {
                store::save_invoice(&mut tx, &aggregate.invoice).await?;
            }
            tx.commit().await?;
            if !was_paid {
                info!(invoice_id = %invoice_id, "Zero-balance invoice settled");
                self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
            }
            return Ok(aggregate);
        };

        store::insert_payment(&mut tx, &payment).await?;
        store::save_invoice(&mut tx, &aggregate.invoice).await?;
        let email = store::client_email(&mut tx, aggregate.invoice.client_id).await?;
        tx.commit().await?;

        self.after_payment(&aggregate.invoice, &payment, email).await;
        Ok(aggregate)
    }

    pub async fn void(&self, invoice_id: Uuid) -> BillingResult<InvoiceAggregate> {
        let mut tx = self.pool.begin().await?;
        let mut aggregate = store::load_aggregate(&mut tx, invoice_id, true).await?;

        if aggregate.void(Utc::now())? {
            store::save_invoice(&mut tx, &aggregate.invoice).await?;
            info!(invoice_id = %invoice_id, "Invoice voided");
        }
        tx.commit().await?;

        self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
        Ok(aggregate)
    }

    /// Sends an invoice through authorization again after an escalation.
    pub async fn resubmit_fiscal(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let mut invoice = store::load_invoice(&mut tx, invoice_id, true).await?;

        match (invoice.sri_status, invoice.fiscal_stage) {
            (SriStatus::Authorized, _) => {
                return Err(BillingError::state(format!(
                    "invoice {} is already authorized",
                    invoice.invoice_number
                )))
            }
            (_, FiscalStage::Signed | FiscalStage::Submitted | FiscalStage::PendingAuthorization) => {
                return Err(BillingError::state(format!(
                    "invoice {} is awaiting fiscal authorization",
                    invoice.invoice_number
                )))
            }
            _ => {}
        }
        if invoice.status == InvoiceStatus::Voided {
            return Err(BillingError::state(format!(
                "cannot submit voided invoice {}",
                invoice.invoice_number
            )));
        }

        invoice.sri_status = SriStatus::Pending;
        invoice.fiscal_stage = FiscalStage::Unsubmitted;
        invoice.sri_attempts = 0;
        invoice.access_key = None;
        invoice.xml_content = None;
        invoice.updated_at = Utc::now();
        store::save_invoice(&mut tx, &invoice).await?;
        self.enqueue_authorization(&mut tx, invoice_id).await?;
        tx.commit().await?;

        warn!(invoice_id = %invoice_id, "Fiscal authorization restarted by operator");
        self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
        Ok(invoice)
    }

    /// Revises the items of a draft quote.
    pub async fn update_quote(&self, quote_id: Uuid, input: UpdateQuote) -> BillingResult<Quote> {
        let mut tx = self.pool.begin().await?;
        let mut quote = store::load_quote(&mut tx, quote_id, true).await?;

        let items = quote.revise(input, Utc::now())?;
        store::replace_quote_items(&mut tx, quote_id, &items).await?;
        store::save_quote_totals(&mut tx, &quote).await?;
        tx.commit().await?;

        info!(quote_id = %quote_id, total = %quote.total, "Quote revised");
        Ok(quote)
    }

    /// Moves a quote along draft → sent → approved/rejected.
    pub async fn transition_quote(
        &self,
        quote_id: Uuid,
        next: QuoteStatus,
    ) -> BillingResult<Quote> {
        let mut tx = self.pool.begin().await?;
        let mut quote = store::load_quote(&mut tx, quote_id, true).await?;
        let status = quote.status.transition_to(next)?;
        if status != quote.status {
            store::save_quote_status(&mut tx, quote_id, status).await?;
            quote.status = status;
        }
        tx.commit().await?;
        Ok(quote)
    }

    /// Pauses or resumes a subscription.
    pub async fn set_service_status(
        &self,
        service_id: Uuid,
        status: ServiceStatus,
    ) -> BillingResult<RecurringService> {
        let mut tx = self.pool.begin().await?;
        let mut service = store::load_service(&mut tx, service_id, true).await?;
        if service.status != status {
            store::save_service_status(&mut tx, service_id, status).await?;
            service.status = status;
            info!(service_id = %service_id, status = status.as_str(), "Recurring service status changed");
        }
        tx.commit().await?;
        Ok(service)
    }

    /// Numbers and inserts a draft, and queues its fiscal authorization.
    async fn insert_draft(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        draft: &InvoiceDraft,
    ) -> BillingResult<(InvoiceAggregate, Option<String>)> {
        let number = self.allocator.next(tx, draft.issue_date.year()).await?;
        let invoice_id = Uuid::new_v4();

        let aggregate = store::insert_invoice(tx, invoice_id, &number, draft).await?;
        self.enqueue_authorization(tx, invoice_id).await?;
        let email = store::client_email(tx, draft.client_id).await?;

        info!(
            invoice_id = %invoice_id,
            invoice_number = %number,
            total = %draft.totals.total,
            "Invoice created"
        );
        Ok((aggregate, email))
    }

    async fn enqueue_authorization(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> BillingResult<()> {
        let request = AuthorizeInvoiceJob { invoice_id }.request(self.fiscal_job.clone())?;
        PgJobQueue::enqueue_tx(tx, request, Duration::ZERO).await?;
        Ok(())
    }

    async fn after_generated(&self, invoice: &Invoice, client_email: Option<String>) {
        self.notifier
            .notify(BillingEvent::InvoiceGenerated {
                invoice_id: invoice.id,
                invoice_number: invoice.invoice_number.clone(),
                total: invoice.total,
                client_email,
            })
            .await;
        self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
    }

    async fn after_payment(
        &self,
        invoice: &Invoice,
        payment: &InvoicePayment,
        client_email: Option<String>,
    ) {
        info!(
            invoice_id = %invoice.id,
            amount = %payment.amount,
            balance_due = %invoice.balance_due,
            status = invoice.status.as_str(),
            "Payment recorded"
        );
        self.notifier
            .notify(BillingEvent::PaymentRecorded {
                invoice_id: invoice.id,
                invoice_number: invoice.invoice_number.clone(),
                amount: payment.amount,
                balance_due: invoice.balance_due,
                status: invoice.status,
                client_email,
            })
            .await;
        self.cache.invalidate(INVOICE_CACHE_SCOPE).await;
    }
}

#[async_trait]
impl RecurringLedger for BillingService {
    async fn due_services(&self, today: NaiveDate) -> BillingResult<Vec<RecurringService>> {
        store::due_services(&self.pool, today).await
    }

    async fn bill_service(&self, service_id: Uuid, today: NaiveDate) -> BillingResult<Option<Invoice>> {
        let mut tx = self.pool.begin().await?;
        let service = store::load_service(&mut tx, service_id, true).await?;

        // Another run may have billed or paused it since it was listed.
        if !service.is_due(today) {
            tx.commit().await?;
            return Ok(None);
        }

        let (aggregate, email) = self
            .bill_locked_service(&mut tx, &service, today, self.default_due_days)
            .await?;
        tx.commit().await?;

        self.notifier
            .notify(BillingEvent::InvoiceGenerated {
                invoice_id: aggregate.invoice.id,
                invoice_number: aggregate.invoice.invoice_number.clone(),
                total: aggregate.invoice.total,
                client_email: email,
            })
            .await;
        Ok(Some(aggregate.invoice))
    }
}
