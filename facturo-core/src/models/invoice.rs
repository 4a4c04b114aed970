use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fiscal::state_machine::FiscalStage;
use crate::models::line_item::{round_money, NewLineItem, PaymentType, Totals};

/// Invoice status enumeration.
///
/// `Overdue` is never stored: it is derived on read by
/// [`Invoice::effective_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
    Voided,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Voided => "voided",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Voided)
    }
}

/// Fiscal authority verdict on the invoice document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SriStatus {
    Pending,
    Authorized,
    Rejected,
}

impl SriStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SriStatus::Pending => "pending",
            SriStatus::Authorized => "authorized",
            SriStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Transfer,
    Cash,
    Card,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Other => "other",
        }
    }
}

/// Invoice model mapping the `invoices` table, including the fiscal sub-record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,

    /// Unique, year-scoped number, e.g. `FAC-2026-000042`
    pub invoice_number: String,

    pub client_id: Uuid,
    pub project_id: Option<Uuid>,

    /// Originating quote (exclusive with `recurring_service_id`)
    pub quote_id: Option<Uuid>,

    /// Originating subscription (exclusive with `quote_id`)
    pub recurring_service_id: Option<Uuid>,

    /// Billing date of the subscription period this invoice covers
    pub billing_period: Option<NaiveDate>,

    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,

    /// Stored status; never `Overdue`
    pub status: InvoiceStatus,

    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub total_paid: Decimal,
    pub balance_due: Decimal,

    pub notes: Option<String>,

    pub access_key: Option<String>,
    pub xml_content: Option<String>,
    pub authorization_date: Option<DateTime<Utc>>,
    pub sri_status: SriStatus,
    pub fiscal_stage: FiscalStage,

    /// Authorization polls performed so far
    pub sri_attempts: i32,

    /// Last messages returned by the authority (JSON array of strings)
    pub sri_messages: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Status as shown to readers: pending/partial invoices past their due
    /// date read as overdue.
    pub fn effective_status(&self, today: NaiveDate) -> InvoiceStatus {
        match self.status {
            InvoiceStatus::Pending | InvoiceStatus::Partial if self.due_date < today => {
                InvoiceStatus::Overdue
            }
            status => status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub position: i32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub subtotal: Decimal,
    pub payment_type: PaymentType,
}

impl InvoiceItem {
    pub fn from_new(invoice_id: Uuid, position: i32, item: &NewLineItem) -> Self {
        InvoiceItem {
            id: Uuid::new_v4(),
            invoice_id,
            position,
            description: item.description.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            discount: item.discount,
            subtotal: item.subtotal(),
            payment_type: item.payment_type,
        }
    }
}

/// Append-only payment record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoicePayment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub method: PaymentMethod,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payment request from an operator or job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub notes: Option<String>,
}

/// Manual invoice creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub items: Vec<NewLineItem>,
    pub tax_rate: Decimal,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
}

/// Invoice update request; items are replaced wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInvoice {
    pub items: Vec<NewLineItem>,
    pub tax_rate: Decimal,
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

/// An invoice with its items and payments, the unit every mutation works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceAggregate {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
    pub payments: Vec<InvoicePayment>,
}

impl InvoiceAggregate {
    pub fn id(&self) -> Uuid {
        self.invoice.id
    }

    /// Records a payment and moves the invoice to `partial` or `paid`.
    pub fn apply_payment(
        &mut self,
        input: NewPayment,
        now: DateTime<Utc>,
    ) -> BillingResult<InvoicePayment> {
        match self.invoice.status {
            InvoiceStatus::Paid => {
                return Err(BillingError::state(format!(
                    "invoice {} is already paid",
                    self.invoice.invoice_number
                )))
            }
            InvoiceStatus::Voided => {
                return Err(BillingError::state(format!(
                    "cannot record a payment on voided invoice {}",
                    self.invoice.invoice_number
                )))
            }
            _ => {}
        }

        if input.amount <= Decimal::ZERO {
            return Err(BillingError::validation("payment amount must be positive"));
        }
        if input.amount.scale() > 2 && round_money(input.amount) != input.amount {
            return Err(BillingError::validation(
                "payment amount cannot have fractional cents",
            ));
        }
        if input.amount > self.invoice.balance_due {
            return Err(BillingError::validation(format!(
                "payment {} exceeds balance due {}",
                input.amount, self.invoice.balance_due
            )));
        }

        let payment = InvoicePayment {
            id: Uuid::new_v4(),
            invoice_id: self.invoice.id,
            amount: input.amount,
            payment_date: input.payment_date,
            method: input.method,
            notes: input.notes,
            created_at: now,
        };
        self.payments.push(payment.clone());
        self.recompute_balance();

        self.invoice.status = if self.invoice.balance_due.is_zero() {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Partial
        };
        self.invoice.updated_at = now;

        Ok(payment)
    }

    /// Pays the remaining balance in one payment.
    ///
    /// Returns `Ok(None)` without touching anything when the invoice is
    /// already paid, so at-least-once callers never double-charge. A pending
    /// invoice with nothing left to collect is settled without a payment row.
    pub fn mark_fully_paid(
        &mut self,
        method: PaymentMethod,
        notes: Option<String>,
        payment_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<InvoicePayment>> {
        if self.invoice.status == InvoiceStatus::Paid {
            return Ok(None);
        }
        if self.invoice.status == InvoiceStatus::Pending && self.invoice.balance_due.is_zero() {
            self.invoice.status = InvoiceStatus::Paid;
            self.invoice.updated_at = now;
            return Ok(None);
        }

        let amount = self.invoice.balance_due;
        self.apply_payment(
            NewPayment {
                amount,
                method,
                payment_date,
                notes,
            },
            now,
        )
        .map(Some)
    }

    /// Voids the invoice. Returns whether the status changed.
    pub fn void(&mut self, now: DateTime<Utc>) -> BillingResult<bool> {
        match self.invoice.status {
            InvoiceStatus::Voided => Ok(false),
            InvoiceStatus::Paid => Err(BillingError::state(format!(
                "cannot void paid invoice {}",
                self.invoice.invoice_number
            ))),
            _ => {
                self.invoice.status = InvoiceStatus::Voided;
                self.invoice.updated_at = now;
                Ok(true)
            }
        }
    }

    /// Replaces all line items and recomputes totals. Pending invoices only.
    pub fn update(&mut self, input: UpdateInvoice, now: DateTime<Utc>) -> BillingResult<()> {
        self.ensure_pending("edit")?;

        let totals = Totals::compute(&input.items, input.tax_rate)?;
        let due_date = input.due_date.unwrap_or(self.invoice.due_date);
        if due_date < self.invoice.issue_date {
            return Err(BillingError::validation("due date precedes issue date"));
        }

        self.items = input
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| InvoiceItem::from_new(self.invoice.id, i as i32, item))
            .collect();

        let invoice = &mut self.invoice;
        invoice.subtotal = totals.subtotal;
        invoice.tax_rate = totals.tax_rate;
        invoice.tax_amount = totals.tax_amount;
        invoice.total = totals.total;
        invoice.due_date = due_date;
        invoice.notes = input.notes;
        invoice.updated_at = now;

        // A corrected invoice goes back through authorization.
        if invoice.sri_status == SriStatus::Rejected {
            invoice.sri_status = SriStatus::Pending;
            invoice.fiscal_stage = FiscalStage::Unsubmitted;
            invoice.sri_attempts = 0;
            invoice.access_key = None;
            invoice.xml_content = None;
        }

        self.recompute_balance();
        Ok(())
    }

    /// Checks that the invoice may be deleted.
    pub fn ensure_deletable(&self) -> BillingResult<()> {
        self.ensure_pending("delete")
    }

    fn ensure_pending(&self, action: &str) -> BillingResult<()> {
        match self.invoice.status {
            InvoiceStatus::Pending if self.invoice.sri_status == SriStatus::Authorized => {
                Err(BillingError::state(format!(
                    "cannot {} an invoice authorized by the fiscal authority",
                    action
                )))
            }
            InvoiceStatus::Pending
                if matches!(
                    self.invoice.fiscal_stage,
                    FiscalStage::Signed
                        | FiscalStage::Submitted
                        | FiscalStage::PendingAuthorization
                ) =>
            {
                Err(BillingError::state(format!(
                    "cannot {} an invoice awaiting fiscal authorization",
                    action
                )))
            }
            InvoiceStatus::Pending => Ok(()),
            other => Err(BillingError::state(format!(
                "cannot {} a {} invoice",
                action,
                other.as_str()
            ))),
        }
    }

    fn recompute_balance(&mut self) {
        let total_paid: Decimal = self.payments.iter().map(|p| p.amount).sum();
        self.invoice.total_paid = total_paid;
        self.invoice.balance_due = (self.invoice.total - total_paid).max(Decimal::ZERO);
    }
}
