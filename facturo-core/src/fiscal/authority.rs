use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SriConfig;
use crate::error::BillingError;
use crate::fiscal::signer::SignedDocument;
use crate::fiscal::state_machine::VerdictKind;

/// Answer from the fiscal authority for a submission or a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthorityVerdict {
    Authorized {
        access_key: String,
        authorization_date: DateTime<Utc>,
    },
    Rejected {
        #[serde(default)]
        messages: Vec<String>,
    },
    Pending,
}

impl AuthorityVerdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            AuthorityVerdict::Authorized { .. } => VerdictKind::Authorized,
            AuthorityVerdict::Rejected { .. } => VerdictKind::Rejected,
            AuthorityVerdict::Pending => VerdictKind::Pending,
        }
    }
}

/// Failures talking to the authority, kept apart from verdicts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorityError {
    /// Timeout, connection failure or 5xx. Worth retrying.
    #[error("authority unreachable: {0}")]
    Transport(String),

    /// The authority refused the request shape or answered garbage.
    #[error("authority protocol error: {0}")]
    Protocol(String),
}

impl From<AuthorityError> for BillingError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Transport(msg) => BillingError::Transient(msg),
            AuthorityError::Protocol(msg) => BillingError::Configuration(msg),
        }
    }
}

/// The government e-invoicing service.
#[async_trait]
pub trait FiscalAuthority: Send + Sync {
    /// Sends a signed document for authorization.
    async fn submit(&self, document: &SignedDocument) -> Result<AuthorityVerdict, AuthorityError>;

    /// Asks for the verdict on a previously acknowledged document.
    async fn query(&self, access_key: &str) -> Result<AuthorityVerdict, AuthorityError>;
}

#[derive(Debug, Serialize)]
struct ReceptionRequest<'a> {
    access_key: &'a str,
    /// Base64 of the signed XML
    document: String,
}

/// Classifies a non-success status; `None` means the body holds a verdict.
pub fn classify_status(status: StatusCode, body: &str) -> Option<AuthorityError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(AuthorityError::Transport(format!("{}: {}", status, body)))
    } else {
        Some(AuthorityError::Protocol(format!("{}: {}", status, body)))
    }
}

/// Parses a verdict body.
pub fn parse_verdict(body: &str) -> Result<AuthorityVerdict, AuthorityError> {
    serde_json::from_str(body)
        .map_err(|e| AuthorityError::Protocol(format!("unreadable verdict: {}", e)))
}

/// JSON-over-HTTP client for the authority's reception and authorization endpoints.
#[derive(Clone)]
pub struct HttpFiscalAuthority {
    client: Client,
    base_url: String,
}

impl HttpFiscalAuthority {
    pub fn new(config: &SriConfig) -> Result<Self, BillingError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.authority_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<AuthorityVerdict, AuthorityError> {
        let response = response.map_err(|e| AuthorityError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        debug!(status = %status, body = %body, "Fiscal authority response");

        if let Some(err) = classify_status(status, &body) {
            warn!(status = %status, error = %err, "Fiscal authority call failed");
            return Err(err);
        }
        parse_verdict(&body)
    }
}

#[async_trait]
impl FiscalAuthority for HttpFiscalAuthority {
    async fn submit(&self, document: &SignedDocument) -> Result<AuthorityVerdict, AuthorityError> {
        let url = format!("{}/receptions", self.base_url);
        let request = ReceptionRequest {
            access_key: &document.access_key,
            document: STANDARD.encode(document.xml.as_bytes()),
        };

        let verdict = Self::read(self.client.post(&url).json(&request).send().await).await?;
        info!(access_key = %document.access_key, verdict = ?verdict.kind(), "Document submitted");
        Ok(verdict)
    }

    async fn query(&self, access_key: &str) -> Result<AuthorityVerdict, AuthorityError> {
        let url = format!("{}/authorizations/{}", self.base_url, access_key);
        let verdict = Self::read(self.client.get(&url).send().await).await?;
        info!(access_key = %access_key, verdict = ?verdict.kind(), "Authorization queried");
        Ok(verdict)
    }
}
