use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingCycle, CreateInvoice, NewLineItem, PaymentType, Quote, QuoteItem, QuoteStatus,
    RecurringService, ServiceStatus, Totals,
};

const MONTHS_ES: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

/// Everything needed to insert a new invoice, before a number is allocated.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceDraft {
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub quote_id: Option<Uuid>,
    pub recurring_service_id: Option<Uuid>,
    pub billing_period: Option<NaiveDate>,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub items: Vec<NewLineItem>,
    pub totals: Totals,
    pub notes: Option<String>,
}

/// Invoice draft for one subscription period plus the service's next billing date.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceBilling {
    pub draft: InvoiceDraft,
    pub next_billing_date: NaiveDate,
}

fn due_date(today: NaiveDate, due_days: i64) -> BillingResult<NaiveDate> {
    if due_days < 0 {
        return Err(BillingError::validation("due days cannot be negative"));
    }
    today
        .checked_add_signed(Duration::days(due_days))
        .ok_or_else(|| BillingError::validation("due date out of range"))
}

/// Period label used in generated service line items.
pub fn period_label(cycle: BillingCycle, period: NaiveDate) -> String {
    match cycle {
        BillingCycle::Monthly => MONTHS_ES[period.month0() as usize].to_string(),
        BillingCycle::Yearly => period.year().to_string(),
    }
}

/// Builds an operator-entered invoice.
pub fn draft_from_request(input: CreateInvoice) -> BillingResult<InvoiceDraft> {
    let totals = Totals::compute(&input.items, input.tax_rate)?;
    if input.due_date < input.issue_date {
        return Err(BillingError::validation("due date precedes issue date"));
    }

    Ok(InvoiceDraft {
        client_id: input.client_id,
        project_id: input.project_id,
        quote_id: None,
        recurring_service_id: None,
        billing_period: None,
        issue_date: input.issue_date,
        due_date: input.due_date,
        items: input.items,
        totals,
        notes: input.notes,
    })
}

/// Converts an approved quote. Items and totals are copied as quoted.
pub fn draft_from_quote(
    quote: &Quote,
    items: &[QuoteItem],
    today: NaiveDate,
    due_days: i64,
) -> BillingResult<InvoiceDraft> {
    if quote.status != QuoteStatus::Approved {
        return Err(BillingError::state(format!(
            "quote {} is {}, only approved quotes can be invoiced",
            quote.id,
            quote.status.as_str()
        )));
    }
    if items.is_empty() {
        return Err(BillingError::validation(format!(
            "quote {} has no items",
            quote.id
        )));
    }

    let mut ordered: Vec<&QuoteItem> = items.iter().collect();
    ordered.sort_by_key(|item| item.position);

    Ok(InvoiceDraft {
        client_id: quote.client_id,
        project_id: quote.project_id,
        quote_id: Some(quote.id),
        recurring_service_id: None,
        billing_period: None,
        issue_date: today,
        due_date: due_date(today, due_days)?,
        items: ordered.into_iter().map(QuoteItem::to_line_item).collect(),
        totals: Totals {
            subtotal: quote.subtotal,
            tax_rate: quote.tax_rate,
            tax_amount: quote.tax_amount,
            total: quote.total,
        },
        notes: quote.notes.clone(),
    })
}

/// Converts one period of an active subscription.
///
/// Service invoices are tax exempt, so the rate is fixed at zero. The period
/// billed is the service's current `next_billing_date`.
pub fn draft_from_service(
    service: &RecurringService,
    client_id: Uuid,
    today: NaiveDate,
    due_days: i64,
) -> BillingResult<ServiceBilling> {
    if service.status != ServiceStatus::Active {
        return Err(BillingError::state(format!(
            "recurring service {} is {}",
            service.id,
            service.status.as_str()
        )));
    }

    let period = service.next_billing_date;
    let item = NewLineItem {
        description: format!(
            "{} – {}",
            service.name,
            period_label(service.billing_cycle, period)
        ),
        quantity: Decimal::ONE,
        unit_price: service.amount,
        discount: Decimal::ZERO,
        payment_type: match service.billing_cycle {
            BillingCycle::Monthly => PaymentType::Monthly,
            BillingCycle::Yearly => PaymentType::Yearly,
        },
    };
    let totals = Totals::compute(std::slice::from_ref(&item), Decimal::ZERO)?;

    Ok(ServiceBilling {
        draft: InvoiceDraft {
            client_id,
            project_id: Some(service.project_id),
            quote_id: None,
            recurring_service_id: Some(service.id),
            billing_period: Some(period),
            issue_date: today,
            due_date: due_date(today, due_days)?,
            items: vec![item],
            totals,
            notes: None,
        },
        next_billing_date: service.following_billing_date()?,
    })
}
