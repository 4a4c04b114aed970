use std::time::Duration;

use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::error::{BillingError, BillingResult};

/// Largest sequence representable in the 6-digit number segment.
pub const MAX_SEQUENCE: u32 = 999_999;

/// Formats `{PREFIX}-{YEAR}-{000001}`.
pub fn format_invoice_number(prefix: &str, year: i32, sequence: u32) -> String {
    format!("{}-{}-{:06}", prefix, year, sequence)
}

/// Extracts the sequence from a number belonging to `prefix` and `year`.
pub fn parse_sequence(number: &str, prefix: &str, year: i32) -> Option<u32> {
    let rest = number.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = rest.strip_prefix(&year.to_string())?.strip_prefix('-')?;
    if rest.len() != 6 || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Allocates collision-free invoice numbers per calendar year.
///
/// Must run inside the transaction that inserts the invoice. The per-year
/// counter row stays locked until that transaction ends, so concurrent
/// creators queue behind each other instead of reading the same maximum.
#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    prefix: String,
    lock_timeout: Duration,
}

impl SequenceAllocator {
    pub fn new(prefix: impl Into<String>, lock_timeout: Duration) -> BillingResult<Self> {
        let prefix = prefix.into();
        if prefix.is_empty()
            || prefix.len() > 10
            || !prefix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(BillingError::Configuration(format!(
                "invoice prefix '{}' must be 1-10 uppercase letters or digits",
                prefix
            )));
        }
        Ok(Self {
            prefix,
            lock_timeout,
        })
    }

    /// Returns the next number for `year`.
    ///
    /// A lock wait longer than the configured timeout fails with a
    /// transient error; the caller retries the whole creation.
    pub async fn next(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        year: i32,
    ) -> BillingResult<String> {
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO invoice_sequences (prefix, year, last_value)
            VALUES ($1, $2, 0)
            ON CONFLICT (prefix, year) DO NOTHING
            "#,
        )
        .bind(&self.prefix)
        .bind(year)
        .execute(&mut **tx)
        .await?;

        let counter: i32 = sqlx::query_scalar(
            r#"
            SELECT last_value
            FROM invoice_sequences
            WHERE prefix = $1 AND year = $2
            FOR UPDATE
            "#,
        )
        .bind(&self.prefix)
        .bind(year)
        .fetch_one(&mut **tx)
        .await?;

        // Numbers inserted outside the counter (imports, restores) still win.
        let highest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(invoice_number) FROM invoices WHERE invoice_number LIKE $1",
        )
        .bind(format!("{}-{}-%", self.prefix, year))
        .fetch_one(&mut **tx)
        .await?;

        let existing = highest
            .as_deref()
            .and_then(|n| parse_sequence(n, &self.prefix, year))
            .unwrap_or(0);
        let next = (counter.max(0) as u32).max(existing) + 1;
        if next > MAX_SEQUENCE {
            return Err(BillingError::state(format!(
                "invoice sequence {}-{} is exhausted",
                self.prefix, year
            )));
        }

        sqlx::query(
            "UPDATE invoice_sequences SET last_value = $3 WHERE prefix = $1 AND year = $2",
        )
        .bind(&self.prefix)
        .bind(year)
        .bind(next as i32)
        .execute(&mut **tx)
        .await?;

        let number = format_invoice_number(&self.prefix, year, next);
        debug!(invoice_number = %number, "Allocated invoice number");
        Ok(number)
    }
}
