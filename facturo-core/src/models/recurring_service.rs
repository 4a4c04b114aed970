use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Advances `date` by one cycle onto `anchor_day`, clamped to the last
    /// day of shorter months.
    pub fn advance(&self, date: NaiveDate, anchor_day: u32) -> BillingResult<NaiveDate> {
        let months = match self {
            BillingCycle::Monthly => Months::new(1),
            BillingCycle::Yearly => Months::new(12),
        };
        let out_of_range =
            || BillingError::validation(format!("billing date {} out of range", date));

        let first = date
            .with_day(1)
            .and_then(|d| d.checked_add_months(months))
            .ok_or_else(out_of_range)?;
        let last_day = first
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .map(|d| d.day())
            .ok_or_else(out_of_range)?;
        first
            .with_day(anchor_day.clamp(1, last_day))
            .ok_or_else(out_of_range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Paused,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Active => "active",
            ServiceStatus::Paused => "paused",
        }
    }
}

/// Subscription line billed on a cadence by the recurring billing scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurringService {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub amount: Decimal,
    pub billing_cycle: BillingCycle,
    pub next_billing_date: NaiveDate,

    /// Day of month billing returns to after a clamped short month
    pub billing_day: i16,

    pub status: ServiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringService {
    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.status == ServiceStatus::Active && self.next_billing_date <= today
    }

    /// Billing date of the period after the current one.
    pub fn following_billing_date(&self) -> BillingResult<NaiveDate> {
        self.billing_cycle
            .advance(self.next_billing_date, self.billing_day.max(1) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_monthly_advance_clamps_month_end() {
        assert_eq!(BillingCycle::Monthly.advance(date(2026, 1, 31), 31).unwrap(), date(2026, 2, 28));
        assert_eq!(BillingCycle::Monthly.advance(date(2026, 12, 5), 5).unwrap(), date(2027, 1, 5));
    }

    #[test]
    fn test_monthly_advance_returns_to_anchor_day() {
        let mut billing_date = date(2026, 1, 31);
        let mut seen = Vec::new();
        for _ in 0..4 {
            billing_date = BillingCycle::Monthly.advance(billing_date, 31).unwrap();
            seen.push(billing_date);
        }
        assert_eq!(
            seen,
            vec![date(2026, 2, 28), date(2026, 3, 31), date(2026, 4, 30), date(2026, 5, 31)]
        );
        assert_eq!(BillingCycle::Monthly.advance(date(2028, 1, 30), 30).unwrap(), date(2028, 2, 29));
    }

    #[test]
    fn test_yearly_advance() {
        assert_eq!(BillingCycle::Yearly.advance(date(2028, 2, 29), 29).unwrap(), date(2029, 2, 28));
        assert_eq!(BillingCycle::Yearly.advance(date(2029, 2, 28), 29).unwrap(), date(2030, 2, 28));
        assert_eq!(BillingCycle::Yearly.advance(date(2031, 2, 28), 29).unwrap(), date(2032, 2, 29));
        assert_eq!(BillingCycle::Yearly.advance(date(2026, 10, 19), 19).unwrap(), date(2027, 10, 19));
    }
}
