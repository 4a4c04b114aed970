use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::line_item::{NewLineItem, PaymentType, Totals};

/// Quote status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Approved,
    Rejected,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Draft => "draft",
            QuoteStatus::Sent => "sent",
            QuoteStatus::Approved => "approved",
            QuoteStatus::Rejected => "rejected",
        }
    }

    /// Allowed moves: draft → sent → {approved, rejected}.
    pub fn transition_to(self, next: QuoteStatus) -> BillingResult<QuoteStatus> {
        match (self, next) {
            (QuoteStatus::Draft, QuoteStatus::Sent)
            | (QuoteStatus::Sent, QuoteStatus::Approved)
            | (QuoteStatus::Sent, QuoteStatus::Rejected) => Ok(next),
            (from, to) if from == to => Ok(to),
            (from, to) => Err(BillingError::state(format!(
                "cannot move a {} quote to {}",
                from.as_str(),
                to.as_str()
            ))),
        }
    }
}

/// A proposal that may be converted into exactly one invoice once approved.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Quote {
    pub id: Uuid,
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub status: QuoteStatus,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    /// Items and totals may only change while the quote is a draft.
    pub fn ensure_editable(&self) -> BillingResult<()> {
        if self.status == QuoteStatus::Draft {
            Ok(())
        } else {
            Err(BillingError::state(format!(
                "cannot edit a {} quote",
                self.status.as_str()
            )))
        }
    }

    /// Replaces the items of a draft quote, returning the new item rows.
    pub fn revise(&mut self, input: UpdateQuote, now: DateTime<Utc>) -> BillingResult<Vec<QuoteItem>> {
        self.ensure_editable()?;
        let totals = Totals::compute(&input.items, input.tax_rate)?;

        let items = input
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| QuoteItem::from_new(self.id, i as i32, item))
            .collect();

        self.subtotal = totals.subtotal;
        self.tax_rate = totals.tax_rate;
        self.tax_amount = totals.tax_amount;
        self.total = totals.total;
        self.notes = input.notes;
        self.updated_at = now;
        Ok(items)
    }
}

/// Draft quote revision; items are replaced wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQuote {
    pub items: Vec<NewLineItem>,
    pub tax_rate: Decimal,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuoteItem {
    pub id: Uuid,
    pub quote_id: Uuid,
    pub position: i32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub subtotal: Decimal,
    pub payment_type: PaymentType,
}

impl QuoteItem {
    pub fn from_new(quote_id: Uuid, position: i32, item: &NewLineItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            quote_id,
            position,
            description: item.description.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            discount: item.discount,
            subtotal: item.subtotal(),
            payment_type: item.payment_type,
        }
    }

    pub fn to_line_item(&self) -> NewLineItem {
        NewLineItem {
            description: self.description.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price,
            discount: self.discount,
            payment_type: self.payment_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quote_lifecycle() {
        let sent = QuoteStatus::Draft.transition_to(QuoteStatus::Sent).unwrap();
        assert_eq!(sent.transition_to(QuoteStatus::Approved).unwrap(), QuoteStatus::Approved);
        assert_eq!(sent.transition_to(QuoteStatus::Rejected).unwrap(), QuoteStatus::Rejected);
    }

    fn draft_quote() -> Quote {
        Quote {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            project_id: None,
            status: QuoteStatus::Draft,
            subtotal: Decimal::ZERO,
            tax_rate: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total: Decimal::ZERO,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn revision() -> UpdateQuote {
        UpdateQuote {
            items: vec![
                NewLineItem::new("Diseño", dec!(1), dec!(2500)),
                NewLineItem::new("SEO", dec!(1), dec!(500)),
            ],
            tax_rate: dec!(15),
            notes: Some("Entrega en 30 días".to_string()),
        }
    }

    #[test]
    fn test_revise_recomputes_totals() {
        let mut quote = draft_quote();
        let items = quote.revise(revision(), Utc::now()).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[1].position, 1);
        assert_eq!(items[1].subtotal, dec!(500));
        assert_eq!(quote.subtotal, dec!(3000));
        assert_eq!(quote.tax_amount, dec!(450.00));
        assert_eq!(quote.total, dec!(3450.00));
    }

    #[test]
    fn test_only_drafts_can_be_revised() {
        let mut quote = draft_quote();
        quote.status = QuoteStatus::Sent;
        assert!(matches!(
            quote.revise(revision(), Utc::now()),
            Err(BillingError::State(_))
        ));
        assert_eq!(quote.total, Decimal::ZERO);
    }

    #[test]
    fn test_quote_cannot_skip_or_reverse() {
        assert!(QuoteStatus::Draft.transition_to(QuoteStatus::Approved).is_err());
        assert!(QuoteStatus::Approved.transition_to(QuoteStatus::Draft).is_err());
        assert!(QuoteStatus::Rejected.transition_to(QuoteStatus::Approved).is_err());
    }
}
