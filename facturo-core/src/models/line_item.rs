use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::fiscal::document::iva_rate_code;

/// Rounds a monetary amount to cents.
///
/// Applied once where a value is computed; stored values are never re-rounded.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Display grouping tag for a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    OneTime,
    Yearly,
    Monthly,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one_time",
            PaymentType::Yearly => "yearly",
            PaymentType::Monthly => "monthly",
        }
    }
}

/// Line item input shared by quotes and invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub payment_type: PaymentType,
}

impl NewLineItem {
    pub fn new(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
            discount: Decimal::ZERO,
            payment_type: PaymentType::OneTime,
        }
    }

    /// `quantity × unit_price − discount`, rounded to cents.
    pub fn subtotal(&self) -> Decimal {
        round_money(self.quantity * self.unit_price - self.discount)
    }

    fn validate(&self) -> BillingResult<()> {
        if self.description.trim().is_empty() {
            return Err(BillingError::validation("item description is required"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(BillingError::validation(format!(
                "item '{}' must have a positive quantity",
                self.description
            )));
        }
        if self.unit_price < Decimal::ZERO || self.discount < Decimal::ZERO {
            return Err(BillingError::validation(format!(
                "item '{}' cannot have negative price or discount",
                self.description
            )));
        }
        if self.discount > self.quantity * self.unit_price {
            return Err(BillingError::validation(format!(
                "item '{}' discount exceeds its amount",
                self.description
            )));
        }
        Ok(())
    }
}

/// Subtotal, tax and total of a set of line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl Totals {
    /// Computes totals for `items` at `tax_rate` percent.
    ///
    /// `tax_rate` must be one of the VAT rates with a fiscal rate code.
    pub fn compute(items: &[NewLineItem], tax_rate: Decimal) -> BillingResult<Self> {
        if items.is_empty() {
            return Err(BillingError::validation("at least one line item is required"));
        }
        if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE_HUNDRED {
            return Err(BillingError::validation(format!(
                "tax rate {} is outside 0-100",
                tax_rate
            )));
        }
        // Only rates the fiscal document can declare.
        iva_rate_code(tax_rate)?;
        for item in items {
            item.validate()?;
        }

        let subtotal: Decimal = items.iter().map(NewLineItem::subtotal).sum();
        let tax_amount = round_money(subtotal * tax_rate / Decimal::ONE_HUNDRED);

        Ok(Totals {
            subtotal,
            tax_rate,
            tax_amount,
            total: subtotal + tax_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_design_and_seo_at_fifteen_percent() {
        let items = vec![
            NewLineItem::new("Web design", dec!(1), dec!(2500)),
            NewLineItem::new("SEO", dec!(1), dec!(500)),
        ];

        let totals = Totals::compute(&items, dec!(15)).expect("valid items");

        assert_eq!(totals.subtotal, dec!(3000.00));
        assert_eq!(totals.tax_amount, dec!(450.00));
        assert_eq!(totals.total, dec!(3450.00));
    }

    #[test]
    fn test_tax_rounds_half_away_from_zero() {
        let items = vec![NewLineItem::new("Hours", dec!(3), dec!(10.05))];
        let totals = Totals::compute(&items, dec!(15)).unwrap();

        assert_eq!(totals.subtotal, dec!(30.15));
        // 30.15 * 0.15 = 4.5225
        assert_eq!(totals.tax_amount, dec!(4.52));
        assert_eq!(totals.total, dec!(34.67));
    }

    #[test]
    fn test_discount_reduces_item_subtotal() {
        let mut item = NewLineItem::new("Hosting", dec!(2), dec!(100));
        item.discount = dec!(25);
        assert_eq!(item.subtotal(), dec!(175.00));
    }

    #[test]
    fn test_rejects_empty_and_invalid_items() {
        assert!(matches!(
            Totals::compute(&[], dec!(15)),
            Err(BillingError::Validation(_))
        ));
        let bad = vec![NewLineItem::new("Zero", dec!(0), dec!(10))];
        assert!(Totals::compute(&bad, dec!(15)).is_err());
        let ok = vec![NewLineItem::new("One", dec!(1), dec!(10))];
        assert!(Totals::compute(&ok, dec!(120)).is_err());
    }

    #[test]
    fn test_rejects_tax_rate_without_fiscal_code() {
        let items = vec![NewLineItem::new("Hours", dec!(1), dec!(100))];

        let err = Totals::compute(&items, dec!(7)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(err.to_string(), "validation failed: tax rate 7% has no fiscal rate code");

        assert_eq!(Totals::compute(&items, dec!(12)).unwrap().total, dec!(112.00));
        assert_eq!(Totals::compute(&items, dec!(15.00)).unwrap().total, dec!(115.00));
    }
}
