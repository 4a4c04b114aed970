use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::{InvoiceStatus, SriStatus};

/// Billing and authorization outcomes handed to the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    InvoiceGenerated {
        invoice_id: Uuid,
        invoice_number: String,
        total: Decimal,
        client_email: Option<String>,
    },
    PaymentRecorded {
        invoice_id: Uuid,
        invoice_number: String,
        amount: Decimal,
        balance_due: Decimal,
        status: InvoiceStatus,
        client_email: Option<String>,
    },
    AuthorizationOutcome {
        invoice_id: Uuid,
        invoice_number: String,
        sri_status: SriStatus,
        access_key: Option<String>,
        messages: Vec<String>,
        client_email: Option<String>,
    },
    /// Needs an operator: bad configuration or an authorization that never resolved.
    EscalationRequired { invoice_id: Uuid, reason: String },
}

impl BillingEvent {
    pub fn subject(&self) -> String {
        match self {
            BillingEvent::InvoiceGenerated { invoice_number, .. } => {
                format!("Nueva factura {}", invoice_number)
            }
            BillingEvent::PaymentRecorded { invoice_number, .. } => {
                format!("Pago registrado en factura {}", invoice_number)
            }
            BillingEvent::AuthorizationOutcome {
                invoice_number,
                sri_status,
                ..
            } => format!("Factura {}: {}", invoice_number, sri_status.as_str()),
            BillingEvent::EscalationRequired { invoice_id, .. } => {
                format!("Intervención requerida: factura {}", invoice_id)
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            BillingEvent::InvoiceGenerated {
                invoice_number,
                total,
                ..
            } => format!("Se ha emitido la factura {} por un total de ${:.2}.", invoice_number, total),
            BillingEvent::PaymentRecorded {
                invoice_number,
                amount,
                balance_due,
                ..
            } => format!(
                "Recibimos su pago de ${:.2} para la factura {}. Saldo pendiente: ${:.2}.",
                amount, invoice_number, balance_due
            ),
            BillingEvent::AuthorizationOutcome {
                invoice_number,
                access_key,
                messages,
                ..
            } => match access_key {
                Some(key) => format!(
                    "La factura {} fue autorizada. Clave de acceso: {}.",
                    invoice_number, key
                ),
                None => format!(
                    "La factura {} no fue autorizada: {}",
                    invoice_number,
                    messages.join("; ")
                ),
            },
            BillingEvent::EscalationRequired { reason, .. } => reason.clone(),
        }
    }

    /// Client address, when the event is meant for the client at all.
    pub fn client_email(&self) -> Option<&str> {
        match self {
            BillingEvent::InvoiceGenerated { client_email, .. }
            | BillingEvent::PaymentRecorded { client_email, .. }
            | BillingEvent::AuthorizationOutcome { client_email, .. } => client_email.as_deref(),
            BillingEvent::EscalationRequired { .. } => None,
        }
    }
}

/// Picks the client's address, or the operator fallback when none is on file.
pub fn resolve_recipient(client_email: Option<&str>, fallback: &str) -> String {
    match client_email.map(str::trim) {
        Some(email) if !email.is_empty() => email.to_string(),
        _ => fallback.to_string(),
    }
}

/// Fire-and-forget notification dispatcher.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: BillingEvent);
}

/// Downstream read cache that must drop stale billing views.
#[async_trait]
pub trait ReadCache: Send + Sync {
    async fn invalidate(&self, scope: &str);
}

/// Notifier that renders events into emails.
pub struct EmailNotifier {
    fallback_recipient: String,
}

impl EmailNotifier {
    pub fn new(fallback_recipient: impl Into<String>) -> Self {
        Self {
            fallback_recipient: fallback_recipient.into(),
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, event: BillingEvent) {
        let to = resolve_recipient(event.client_email(), &self.fallback_recipient);
        if let Err(e) = send_email(&to, &event.subject(), &event.body()).await {
            // Delivery failures never fail the billing operation.
            error!(recipient = %to, error = %e, "Failed to deliver billing notification");
        }
    }
}

/// Read cache stand-in used when no cache is deployed.
pub struct NoopReadCache;

#[async_trait]
impl ReadCache for NoopReadCache {
    async fn invalidate(&self, scope: &str) {
        debug!(scope = %scope, "Read cache invalidation requested");
    }
}

/// Mock email sending service.
///
/// Delivery is an external collaborator; this logs the message instead.
pub async fn send_email(to: &str, subject: &str, body: &str) -> Result<(), anyhow::Error> {
    if !to.contains('@') {
        anyhow::bail!("invalid recipient address: {}", to);
    }

    info!("Mock Email Service: Sending email to {}", to);
    info!("Subject: {}", subject);
    info!("Body preview: {}...", body.chars().take(100).collect::<String>());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_recipient_falls_back_without_client_email() {
        assert_eq!(resolve_recipient(Some("ana@cliente.ec"), "ops@facturo.ec"), "ana@cliente.ec");
        assert_eq!(resolve_recipient(None, "ops@facturo.ec"), "ops@facturo.ec");
        assert_eq!(resolve_recipient(Some("  "), "ops@facturo.ec"), "ops@facturo.ec");
    }

    #[test]
    fn test_escalations_go_to_operator() {
        let event = BillingEvent::EscalationRequired {
            invoice_id: Uuid::nil(),
            reason: "certificate expired".to_string(),
        };
        assert!(event.client_email().is_none());
        assert_eq!(event.body(), "certificate expired");
    }

    #[test]
    fn test_payment_body_shows_balance() {
        let event = BillingEvent::PaymentRecorded {
            invoice_id: Uuid::nil(),
            invoice_number: "FAC-2026-000007".to_string(),
            amount: dec!(400),
            balance_due: dec!(600),
            status: InvoiceStatus::Partial,
            client_email: None,
        };
        assert!(event.body().contains("$400.00"));
        assert!(event.body().contains("$600.00"));
    }

    #[tokio::test]
    async fn test_send_email_rejects_bad_address() {
        assert!(send_email("test@example.com", "Subject", "Body").await.is_ok());
        assert!(send_email("not-an-address", "Subject", "Body").await.is_err());
    }
}
