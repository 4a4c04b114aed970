use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Length of an access key, check digit included.
pub const ACCESS_KEY_LEN: usize = 49;

/// Document type code for invoices.
pub const DOC_TYPE_INVOICE: &str = "01";

/// Normal (online) emission.
pub const EMISSION_TYPE_NORMAL: &str = "1";

/// Fields that make up an access key.
#[derive(Debug, Clone)]
pub struct AccessKeyParts<'a> {
    pub issue_date: NaiveDate,
    pub ruc: &'a str,
    pub environment: u8,
    pub establishment: &'a str,
    pub emission_point: &'a str,
    /// 9 digits, see [`sequential`]
    pub sequential: &'a str,
    /// 8 digits, see [`numeric_code_for`]
    pub numeric_code: &'a str,
}

fn digits(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_digit())
}

/// Modulo-11 check digit over `digits`, weights 2 to 7 cycling from the right.
pub fn check_digit(digits: &str) -> BillingResult<u8> {
    if digits.is_empty() {
        return Err(BillingError::validation("check digit needs at least one digit"));
    }

    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let d = c
            .to_digit(10)
            .ok_or_else(|| BillingError::validation(format!("'{}' is not a digit", c)))?;
        sum += d * (2 + (i as u32 % 6));
    }

    Ok(match 11 - sum % 11 {
        11 => 0,
        10 => 1,
        n => n as u8,
    })
}

/// Builds the 49-digit access key.
pub fn generate(parts: &AccessKeyParts<'_>) -> BillingResult<String> {
    if !digits(parts.ruc, 13) {
        return Err(BillingError::Configuration(format!(
            "issuer RUC '{}' must be 13 digits",
            parts.ruc
        )));
    }
    if !matches!(parts.environment, 1 | 2) {
        return Err(BillingError::Configuration(format!(
            "environment {} must be 1 or 2",
            parts.environment
        )));
    }
    if !digits(parts.establishment, 3) || !digits(parts.emission_point, 3) {
        return Err(BillingError::Configuration(format!(
            "series {}-{} must be two 3-digit codes",
            parts.establishment, parts.emission_point
        )));
    }
    if !digits(parts.sequential, 9) {
        return Err(BillingError::validation(format!(
            "sequential '{}' must be 9 digits",
            parts.sequential
        )));
    }
    if !digits(parts.numeric_code, 8) {
        return Err(BillingError::validation(format!(
            "numeric code '{}' must be 8 digits",
            parts.numeric_code
        )));
    }

    let mut key = String::with_capacity(ACCESS_KEY_LEN);
    key.push_str(&parts.issue_date.format("%d%m%Y").to_string());
    key.push_str(DOC_TYPE_INVOICE);
    key.push_str(parts.ruc);
    key.push_str(&parts.environment.to_string());
    key.push_str(parts.establishment);
    key.push_str(parts.emission_point);
    key.push_str(parts.sequential);
    key.push_str(parts.numeric_code);
    key.push_str(EMISSION_TYPE_NORMAL);
    let check = check_digit(&key)?;
    key.push(char::from(b'0' + check));

    Ok(key)
}

/// Whether `key` has the right length and a matching check digit.
pub fn is_valid(key: &str) -> bool {
    if !digits(key, ACCESS_KEY_LEN) {
        return false;
    }
    let (body, check) = key.split_at(ACCESS_KEY_LEN - 1);
    match check_digit(body) {
        Ok(expected) => check.as_bytes()[0] == b'0' + expected,
        Err(_) => false,
    }
}

/// Stable 8-digit code derived from the invoice id, so rebuilding the
/// document for the same invoice yields the same key.
pub fn numeric_code_for(invoice_id: Uuid) -> String {
    let bytes = invoice_id.as_bytes();
    let head = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    format!("{:08}", head % 100_000_000)
}

/// 9-digit sequential: two-digit year followed by the 7-digit yearly sequence,
/// which keeps it unique across years.
pub fn sequential(year: i32, sequence: u32) -> String {
    format!("{:02}{:07}", year.rem_euclid(100), sequence)
}
