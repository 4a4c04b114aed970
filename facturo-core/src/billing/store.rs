use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::billing::converters::InvoiceDraft;
use crate::error::{BillingError, BillingResult};
use crate::fiscal::document::FiscalSource;
use crate::fiscal::pipeline::{stage_moved, FiscalLedger};
use crate::fiscal::signer::SignedDocument;
use crate::fiscal::state_machine::FiscalStage;
use crate::models::{
    Client, Invoice, InvoiceAggregate, InvoiceItem, InvoicePayment, InvoiceStatus, Project,
    Quote, QuoteItem, QuoteStatus, RecurringService, ServiceStatus, SriStatus,
};

pub const INVOICE_COLUMNS: &str = "id, invoice_number, client_id, project_id, quote_id, \
     recurring_service_id, billing_period, issue_date, due_date, status, subtotal, tax_rate, \
     tax_amount, total, total_paid, balance_due, notes, access_key, xml_content, \
     authorization_date, sri_status, fiscal_stage, sri_attempts, sri_messages, created_at, updated_at";

const ITEM_COLUMNS: &str =
    "id, invoice_id, position, description, quantity, unit_price, discount, subtotal, payment_type";

const PAYMENT_COLUMNS: &str = "id, invoice_id, amount, payment_date, method, notes, created_at";

const QUOTE_COLUMNS: &str = "id, client_id, project_id, status, subtotal, tax_rate, tax_amount, \
     total, notes, created_at, updated_at";

const SERVICE_COLUMNS: &str = "id, project_id, name, amount, billing_cycle, next_billing_date, \
     billing_day, status, created_at, updated_at";

const PROJECT_COLUMNS: &str =
    "id, client_id, name, production_url, status, created_at, updated_at";

const CLIENT_COLUMNS: &str =
    "id, name, identification_type, identification, email, phone, address, created_at, updated_at";

fn lock_clause(lock: bool) -> &'static str {
    if lock {
        "FOR UPDATE"
    } else {
        ""
    }
}

pub async fn load_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: Uuid,
    lock: bool,
) -> BillingResult<Invoice> {
    sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {} FROM invoices WHERE id = $1 {}",
        INVOICE_COLUMNS,
        lock_clause(lock)
    ))
    .bind(invoice_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
}

/// Loads an invoice with its items and payments, optionally locking the invoice row.
pub async fn load_aggregate(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: Uuid,
    lock: bool,
) -> BillingResult<InvoiceAggregate> {
    let invoice = load_invoice(tx, invoice_id, lock).await?;

    let items = sqlx::query_as::<_, InvoiceItem>(&format!(
        "SELECT {} FROM invoice_items WHERE invoice_id = $1 ORDER BY position",
        ITEM_COLUMNS
    ))
    .bind(invoice_id)
    .fetch_all(&mut **tx)
    .await?;

    let payments = sqlx::query_as::<_, InvoicePayment>(&format!(
        "SELECT {} FROM invoice_payments WHERE invoice_id = $1 ORDER BY created_at, id",
        PAYMENT_COLUMNS
    ))
    .bind(invoice_id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(InvoiceAggregate {
        invoice,
        items,
        payments,
    })
}

/// Inserts a new pending invoice and its items.
pub async fn insert_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: Uuid,
    invoice_number: &str,
    draft: &InvoiceDraft,
) -> BillingResult<InvoiceAggregate> {
    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        r#"
        INSERT INTO invoices (
            id, invoice_number, client_id, project_id, quote_id, recurring_service_id,
            billing_period, issue_date, due_date, status, subtotal, tax_rate, tax_amount,
            total, total_paid, balance_due, notes, sri_status, fiscal_stage, sri_attempts
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 0, $14, $15, $16, $17, 0)
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    ))
    .bind(invoice_id)
    .bind(invoice_number)
    .bind(draft.client_id)
    .bind(draft.project_id)
    .bind(draft.quote_id)
    .bind(draft.recurring_service_id)
    .bind(draft.billing_period)
    .bind(draft.issue_date)
    .bind(draft.due_date)
    .bind(InvoiceStatus::Pending)
    .bind(draft.totals.subtotal)
    .bind(draft.totals.tax_rate)
    .bind(draft.totals.tax_amount)
    .bind(draft.totals.total)
    .bind(&draft.notes)
    .bind(SriStatus::Pending)
    .bind(FiscalStage::Unsubmitted)
    .fetch_one(&mut **tx)
    .await?;

    let items: Vec<InvoiceItem> = draft
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| InvoiceItem::from_new(invoice_id, i as i32, item))
        .collect();
    insert_items(tx, &items).await?;

    Ok(InvoiceAggregate {
        invoice,
        items,
        payments: Vec::new(),
    })
}

pub async fn insert_items(
    tx: &mut Transaction<'_, Postgres>,
    items: &[InvoiceItem],
) -> BillingResult<()> {
    for item in items {
        sqlx::query(
            r#"
            INSERT INTO invoice_items
                (id, invoice_id, position, description, quantity, unit_price, discount, subtotal, payment_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.id)
        .bind(item.invoice_id)
        .bind(item.position)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.discount)
        .bind(item.subtotal)
        .bind(item.payment_type)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn replace_items(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: Uuid,
    items: &[InvoiceItem],
) -> BillingResult<()> {
    sqlx::query("DELETE FROM invoice_items WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(&mut **tx)
        .await?;
    insert_items(tx, items).await
}

pub async fn insert_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment: &InvoicePayment,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoice_payments (id, invoice_id, amount, payment_date, method, notes, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(payment.id)
    .bind(payment.invoice_id)
    .bind(payment.amount)
    .bind(payment.payment_date)
    .bind(payment.method)
    .bind(&payment.notes)
    .bind(payment.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Writes back the mutable columns of an invoice.
pub async fn save_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice: &Invoice,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE invoices
        SET status = $2,
            due_date = $3,
            subtotal = $4,
            tax_rate = $5,
            tax_amount = $6,
            total = $7,
            total_paid = $8,
            balance_due = $9,
            notes = $10,
            access_key = $11,
            xml_content = $12,
            sri_status = $13,
            fiscal_stage = $14,
            sri_attempts = $15,
            updated_at = $16
        WHERE id = $1
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.status)
    .bind(invoice.due_date)
    .bind(invoice.subtotal)
    .bind(invoice.tax_rate)
    .bind(invoice.tax_amount)
    .bind(invoice.total)
    .bind(invoice.total_paid)
    .bind(invoice.balance_due)
    .bind(&invoice.notes)
    .bind(&invoice.access_key)
    .bind(&invoice.xml_content)
    .bind(invoice.sri_status)
    .bind(invoice.fiscal_stage)
    .bind(invoice.sri_attempts)
    .bind(invoice.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn delete_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: Uuid,
) -> BillingResult<()> {
    sqlx::query("DELETE FROM invoices WHERE id = $1")
        .bind(invoice_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn load_client(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
) -> BillingResult<Client> {
    sqlx::query_as::<_, Client>(&format!(
        "SELECT {} FROM clients WHERE id = $1",
        CLIENT_COLUMNS
    ))
    .bind(client_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::not_found("client", client_id))
}

pub async fn client_email(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
) -> BillingResult<Option<String>> {
    let email: Option<Option<String>> =
        sqlx::query_scalar("SELECT email FROM clients WHERE id = $1")
            .bind(client_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(email.flatten())
}

pub async fn load_quote(
    tx: &mut Transaction<'_, Postgres>,
    quote_id: Uuid,
    lock: bool,
) -> BillingResult<Quote> {
    sqlx::query_as::<_, Quote>(&format!(
        "SELECT {} FROM quotes WHERE id = $1 {}",
        QUOTE_COLUMNS,
        lock_clause(lock)
    ))
    .bind(quote_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::not_found("quote", quote_id))
}

pub async fn quote_items(
    tx: &mut Transaction<'_, Postgres>,
    quote_id: Uuid,
) -> BillingResult<Vec<QuoteItem>> {
    let items = sqlx::query_as::<_, QuoteItem>(
        r#"
        SELECT id, quote_id, position, description, quantity, unit_price, discount, subtotal, payment_type
        FROM quote_items
        WHERE quote_id = $1
        ORDER BY position
        "#,
    )
    .bind(quote_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(items)
}

pub async fn replace_quote_items(
    tx: &mut Transaction<'_, Postgres>,
    quote_id: Uuid,
    items: &[QuoteItem],
) -> BillingResult<()> {
    sqlx::query("DELETE FROM quote_items WHERE quote_id = $1")
        .bind(quote_id)
        .execute(&mut **tx)
        .await?;

    for item in items {
        sqlx::query(
            r#"
            INSERT INTO quote_items
                (id, quote_id, position, description, quantity, unit_price, discount, subtotal, payment_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.id)
        .bind(item.quote_id)
        .bind(item.position)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.discount)
        .bind(item.subtotal)
        .bind(item.payment_type)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn save_quote_totals(tx: &mut Transaction<'_, Postgres>, quote: &Quote) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE quotes
        SET subtotal = $2, tax_rate = $3, tax_amount = $4, total = $5, notes = $6, updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(quote.id)
    .bind(quote.subtotal)
    .bind(quote.tax_rate)
    .bind(quote.tax_amount)
    .bind(quote.total)
    .bind(&quote.notes)
    .bind(quote.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Id of the invoice already created from `quote_id`, if any.
pub async fn invoice_for_quote(
    tx: &mut Transaction<'_, Postgres>,
    quote_id: Uuid,
) -> BillingResult<Option<Uuid>> {
    let id = sqlx::query_scalar("SELECT id FROM invoices WHERE quote_id = $1")
        .bind(quote_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(id)
}

pub async fn save_quote_status(
    tx: &mut Transaction<'_, Postgres>,
    quote_id: Uuid,
    status: QuoteStatus,
) -> BillingResult<()> {
    sqlx::query("UPDATE quotes SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(quote_id)
        .bind(status)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn load_service(
    tx: &mut Transaction<'_, Postgres>,
    service_id: Uuid,
    lock: bool,
) -> BillingResult<RecurringService> {
    sqlx::query_as::<_, RecurringService>(&format!(
        "SELECT {} FROM recurring_services WHERE id = $1 {}",
        SERVICE_COLUMNS,
        lock_clause(lock)
    ))
    .bind(service_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::not_found("recurring service", service_id))
}

pub async fn load_project(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
) -> BillingResult<Project> {
    sqlx::query_as::<_, Project>(&format!(
        "SELECT {} FROM projects WHERE id = $1",
        PROJECT_COLUMNS
    ))
    .bind(project_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::not_found("project", project_id))
}

pub async fn advance_service(
    tx: &mut Transaction<'_, Postgres>,
    service_id: Uuid,
    next_billing_date: NaiveDate,
) -> BillingResult<()> {
    sqlx::query(
        "UPDATE recurring_services SET next_billing_date = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(service_id)
    .bind(next_billing_date)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn save_service_status(
    tx: &mut Transaction<'_, Postgres>,
    service_id: Uuid,
    status: ServiceStatus,
) -> BillingResult<()> {
    sqlx::query("UPDATE recurring_services SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(service_id)
        .bind(status)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Active services whose billing date has arrived, oldest first.
pub async fn due_services(pool: &PgPool, today: NaiveDate) -> BillingResult<Vec<RecurringService>> {
    let services = sqlx::query_as::<_, RecurringService>(&format!(
        r#"
        SELECT {}
        FROM recurring_services
        WHERE status = 'active' AND next_billing_date <= $1
        ORDER BY next_billing_date, id
        "#,
        SERVICE_COLUMNS
    ))
    .bind(today)
    .fetch_all(pool)
    .await?;
    Ok(services)
}

/// Fiscal sub-record persistence on the `invoices` table.
#[derive(Clone)]
pub struct PgFiscalLedger {
    pool: PgPool,
}

impl PgFiscalLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FiscalLedger for PgFiscalLedger {
    async fn load_source(&self, invoice_id: Uuid) -> BillingResult<FiscalSource> {
        let mut tx = self.pool.begin().await?;
        let aggregate = load_aggregate(&mut tx, invoice_id, false).await?;
        let client = load_client(&mut tx, aggregate.invoice.client_id).await?;
        tx.commit().await?;

        Ok(FiscalSource {
            invoice: aggregate.invoice,
            items: aggregate.items,
            client,
        })
    }

    async fn save_signed(
        &self,
        invoice_id: Uuid,
        version: DateTime<Utc>,
        document: &SignedDocument,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET access_key = $3, xml_content = $4, fiscal_stage = $5, updated_at = NOW()
            WHERE id = $1 AND updated_at = $2 AND fiscal_stage = $6 AND sri_status = 'pending'
            "#,
        )
        .bind(invoice_id)
        .bind(version)
        .bind(&document.access_key)
        .bind(&document.xml)
        .bind(FiscalStage::Signed)
        .bind(FiscalStage::Unsubmitted)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), invoice_id, FiscalStage::Unsubmitted)
    }

    async fn save_stage(
        &self,
        invoice_id: Uuid,
        from: FiscalStage,
        stage: FiscalStage,
        sri_attempts: i32,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET fiscal_stage = $3, sri_attempts = $4, updated_at = NOW()
            WHERE id = $1 AND fiscal_stage = $2 AND sri_status = 'pending'
            "#,
        )
        .bind(invoice_id)
        .bind(from)
        .bind(stage)
        .bind(sri_attempts)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), invoice_id, from)
    }

    async fn save_authorized(
        &self,
        invoice_id: Uuid,
        from: FiscalStage,
        access_key: &str,
        authorization_date: DateTime<Utc>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET access_key = $3,
                authorization_date = $4,
                sri_status = $5,
                fiscal_stage = $6,
                sri_messages = NULL,
                updated_at = NOW()
            WHERE id = $1 AND fiscal_stage = $2 AND sri_status = 'pending'
            "#,
        )
        .bind(invoice_id)
        .bind(from)
        .bind(access_key)
        .bind(authorization_date)
        .bind(SriStatus::Authorized)
        .bind(FiscalStage::Authorized)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), invoice_id, from)
    }

    async fn save_rejected(
        &self,
        invoice_id: Uuid,
        from: FiscalStage,
        messages: &[String],
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET sri_status = $3, fiscal_stage = $4, sri_messages = $5, updated_at = NOW()
            WHERE id = $1 AND fiscal_stage = $2 AND sri_status = 'pending'
            "#,
        )
        .bind(invoice_id)
        .bind(from)
        .bind(SriStatus::Rejected)
        .bind(FiscalStage::Rejected)
        .bind(serde_json::json!(messages))
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected(), invoice_id, from)
    }
}

fn expect_one(rows: u64, invoice_id: Uuid, from: FiscalStage) -> BillingResult<()> {
    if rows == 1 {
        Ok(())
    } else {
        Err(stage_moved(invoice_id, from))
    }
}
