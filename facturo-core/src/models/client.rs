use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Government-recognized identification kinds for a billed party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IdentificationType {
    /// National identity card, 10 digits
    Cedula,
    /// Taxpayer registry number, 13 digits
    Ruc,
    Passport,
}

impl IdentificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentificationType::Cedula => "cedula",
            IdentificationType::Ruc => "ruc",
            IdentificationType::Passport => "passport",
        }
    }

    /// Buyer identification code used in fiscal documents.
    pub fn sri_code(&self) -> &'static str {
        match self {
            IdentificationType::Ruc => "04",
            IdentificationType::Cedula => "05",
            IdentificationType::Passport => "06",
        }
    }

    /// Checks the shape of an identification number for this kind.
    pub fn validate(&self, identification: &str) -> BillingResult<()> {
        let all_digits = identification.chars().all(|c| c.is_ascii_digit());
        let ok = match self {
            IdentificationType::Cedula => identification.len() == 10 && all_digits,
            IdentificationType::Ruc => {
                identification.len() == 13 && all_digits && identification.ends_with("001")
            }
            IdentificationType::Passport => {
                (3..=20).contains(&identification.len())
                    && identification.chars().all(|c| c.is_ascii_alphanumeric())
            }
        };

        if ok {
            Ok(())
        } else {
            Err(BillingError::validation(format!(
                "invalid {} identification '{}'",
                self.as_str(),
                identification
            )))
        }
    }
}

/// Legal counterpart being billed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub identification_type: IdentificationType,
    pub identification: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
