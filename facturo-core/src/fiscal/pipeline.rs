use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SriConfig;
use crate::error::{BillingError, BillingResult};
use crate::fiscal::authority::{AuthorityVerdict, FiscalAuthority};
use crate::fiscal::document::{self, FiscalSource};
use crate::fiscal::signer::{DocumentSigner, SignedDocument};
use crate::fiscal::state_machine::{FiscalAction, FiscalStage, FiscalStateMachine, Transition};
use crate::models::{InvoiceStatus, SriStatus};
use crate::worker::queue::{Job, JobOptions, JobQueue, JobRequest};
use crate::worker::runner::JobHandler;
use crate::worker::services::{BillingEvent, Notifier};

/// Queue the fiscal jobs run on.
pub const FISCAL_QUEUE: &str = "fiscal";

/// Payload of the authorization job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeInvoiceJob {
    pub invoice_id: Uuid,
}

impl AuthorizeInvoiceJob {
    pub const NAME: &'static str = "fiscal.authorize_invoice";

    pub fn request(&self, options: JobOptions) -> BillingResult<JobRequest> {
        JobRequest::new(Self::NAME, self, options)
    }
}

/// Persistence the pipeline needs, one write per stage change.
///
/// Each write names the stage it moves the record from. When the stored
/// stage no longer matches, the write fails with [`stage_moved`] and the run
/// is retried against the current record.
#[async_trait]
pub trait FiscalLedger: Send + Sync {
    async fn load_source(&self, invoice_id: Uuid) -> BillingResult<FiscalSource>;

    /// Stores the signed document and moves the stage to `signed`. Only an
    /// unsubmitted invoice last changed at `version` is updated.
    async fn save_signed(
        &self,
        invoice_id: Uuid,
        version: DateTime<Utc>,
        document: &SignedDocument,
    ) -> BillingResult<()>;

    async fn save_stage(
        &self,
        invoice_id: Uuid,
        from: FiscalStage,
        stage: FiscalStage,
        sri_attempts: i32,
    ) -> BillingResult<()>;

    async fn save_authorized(
        &self,
        invoice_id: Uuid,
        from: FiscalStage,
        access_key: &str,
        authorization_date: DateTime<Utc>,
    ) -> BillingResult<()>;

    async fn save_rejected(
        &self,
        invoice_id: Uuid,
        from: FiscalStage,
        messages: &[String],
    ) -> BillingResult<()>;
}

/// Lost race on a fiscal write: the invoice changed under the run.
pub fn stage_moved(invoice_id: Uuid, from: FiscalStage) -> BillingError {
    BillingError::Transient(format!(
        "fiscal record of invoice {} is no longer {}",
        invoice_id, from
    ))
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing to do: already final, or voided
    Skipped,
    Authorized { access_key: String },
    Rejected { messages: Vec<String> },
    /// Follow-up poll enqueued
    Pending { polls_done: u32 },
    /// Polls exhausted, forced to rejected
    Escalated,
}

/// Drives one invoice from build through authorization.
pub struct FiscalPipeline {
    ledger: Arc<dyn FiscalLedger>,
    authority: Arc<dyn FiscalAuthority>,
    signer: Arc<dyn DocumentSigner>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    issuer: SriConfig,
    job_options: JobOptions,
}

impl FiscalPipeline {
    pub fn new(
        ledger: Arc<dyn FiscalLedger>,
        authority: Arc<dyn FiscalAuthority>,
        signer: Arc<dyn DocumentSigner>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        issuer: SriConfig,
        job_options: JobOptions,
    ) -> Self {
        Self {
            ledger,
            authority,
            signer,
            queue,
            notifier,
            issuer,
            job_options,
        }
    }

    /// Advances the invoice as far as the authority allows in one run.
    ///
    /// Transient errors are returned for the job runner to retry. Any other
    /// failure is recorded as a rejection and escalated before being returned.
    pub async fn run(&self, invoice_id: Uuid) -> BillingResult<RunOutcome> {
        match self.advance(invoice_id).await {
            Err(e) if !e.is_retryable() => {
                self.escalate(invoice_id, e.to_string()).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Forces a still-open fiscal record to rejected and pages an operator.
    async fn escalate(&self, invoice_id: Uuid, reason: String) {
        let recorded = match self.ledger.load_source(invoice_id).await {
            Ok(source) if source.invoice.fiscal_stage.is_terminal() => return,
            Ok(source) => {
                let from = source.invoice.fiscal_stage;
                self.force_rejection(&source, from, reason.clone()).await
            }
            Err(BillingError::NotFound { .. }) => {
                warn!(invoice_id = %invoice_id, reason = %reason, "Fiscal failure on a deleted invoice");
                return;
            }
            Err(e) => Err(e),
        };

        if let Err(e) = recorded {
            error!(invoice_id = %invoice_id, error = %e, "Failed to record fiscal escalation");
            self.notifier
                .notify(BillingEvent::EscalationRequired { invoice_id, reason })
                .await;
        }
    }

    async fn advance(&self, invoice_id: Uuid) -> BillingResult<RunOutcome> {
        let source = self.ledger.load_source(invoice_id).await?;
        let invoice = &source.invoice;

        if invoice.sri_status == SriStatus::Authorized || invoice.fiscal_stage.is_terminal() {
            info!(invoice_id = %invoice_id, stage = %invoice.fiscal_stage, "Fiscal record already final");
            return Ok(RunOutcome::Skipped);
        }
        if invoice.status == InvoiceStatus::Voided {
            info!(invoice_id = %invoice_id, "Voided invoice is not submitted");
            return Ok(RunOutcome::Skipped);
        }

        let mut stage = invoice.fiscal_stage;
        let mut polls_done = invoice.sri_attempts.max(0) as u32;
        let mut signed = match (&invoice.access_key, &invoice.xml_content) {
            (Some(key), Some(xml)) => Some(SignedDocument {
                access_key: key.clone(),
                xml: xml.clone(),
            }),
            _ => None,
        };

        loop {
            let action = FiscalStateMachine::action_for(stage);
            info!(invoice_id = %invoice_id, stage = %stage, action = %action, "Fiscal step");

            match action {
                FiscalAction::BuildAndSign => {
                    let unsigned = document::build(&self.issuer, &source)?;
                    let document = self.signer.sign(&unsigned, Utc::now().date_naive())?;
                    self.ledger
                        .save_signed(invoice_id, invoice.updated_at, &document)
                        .await?;
                    signed = Some(document);
                    stage = FiscalStage::Signed;
                }
                FiscalAction::Submit => {
                    let document = signed.as_ref().ok_or_else(|| {
                        BillingError::state(format!(
                            "invoice {} is signed but has no stored document",
                            invoice_id
                        ))
                    })?;
                    // A transport error leaves the stage at signed, so the
                    // retry submits the same document again.
                    let verdict = self.authority.submit(document).await?;
                    self.ledger
                        .save_stage(
                            invoice_id,
                            FiscalStage::Signed,
                            FiscalStage::Submitted,
                            polls_done as i32,
                        )
                        .await?;
                    return self
                        .conclude(&source, FiscalStage::Submitted, verdict, polls_done)
                        .await;
                }
                FiscalAction::Query => {
                    let key = invoice.access_key.as_deref().ok_or_else(|| {
                        BillingError::state(format!(
                            "invoice {} was submitted without an access key",
                            invoice_id
                        ))
                    })?;
                    let verdict = self.authority.query(key).await?;
                    polls_done += 1;
                    return self.conclude(&source, stage, verdict, polls_done).await;
                }
                _ => return Ok(RunOutcome::Skipped),
            }
        }
    }

    async fn conclude(
        &self,
        source: &FiscalSource,
        from: FiscalStage,
        verdict: AuthorityVerdict,
        polls_done: u32,
    ) -> BillingResult<RunOutcome> {
        let invoice_id = source.invoice.id;
        let (_, action) =
            FiscalStateMachine::after_verdict(verdict.kind(), polls_done, self.issuer.max_polls);

        match (action, verdict) {
            (
                FiscalAction::RecordAuthorization,
                AuthorityVerdict::Authorized {
                    access_key,
                    authorization_date,
                },
            ) => {
                self.ledger
                    .save_authorized(invoice_id, from, &access_key, authorization_date)
                    .await?;
                info!(invoice_id = %invoice_id, access_key = %access_key, "Invoice authorized");
                self.notify_outcome(source, SriStatus::Authorized, Some(access_key.clone()), Vec::new())
                    .await;
                Ok(RunOutcome::Authorized { access_key })
            }
            (FiscalAction::RecordRejection, AuthorityVerdict::Rejected { messages }) => {
                self.ledger.save_rejected(invoice_id, from, &messages).await?;
                warn!(invoice_id = %invoice_id, messages = ?messages, "Invoice rejected by fiscal authority");
                self.notify_outcome(source, SriStatus::Rejected, None, messages.clone())
                    .await;
                Ok(RunOutcome::Rejected { messages })
            }
            (FiscalAction::SchedulePoll, _) => {
                self.ledger
                    .save_stage(
                        invoice_id,
                        from,
                        FiscalStage::PendingAuthorization,
                        polls_done as i32,
                    )
                    .await?;
                let request = AuthorizeInvoiceJob { invoice_id }.request(self.job_options.clone())?;
                self.queue.enqueue(request, self.issuer.poll_delay).await?;
                info!(
                    invoice_id = %invoice_id,
                    polls_done,
                    next_poll_secs = self.issuer.poll_delay.as_secs(),
                    "Authorization pending, poll scheduled"
                );
                Ok(RunOutcome::Pending { polls_done })
            }
            _ => {
                let reason = format!(
                    "authorization still pending after {} polls",
                    polls_done
                );
                self.force_rejection(source, from, reason).await?;
                Ok(RunOutcome::Escalated)
            }
        }
    }

    async fn force_rejection(
        &self,
        source: &FiscalSource,
        from: FiscalStage,
        reason: String,
    ) -> BillingResult<()> {
        let invoice_id = source.invoice.id;
        let messages = vec![reason.clone()];
        self.ledger.save_rejected(invoice_id, from, &messages).await?;

        error!(invoice_id = %invoice_id, reason = %reason, "Fiscal authorization escalated");
        self.notifier
            .notify(BillingEvent::EscalationRequired { invoice_id, reason })
            .await;
        self.notify_outcome(source, SriStatus::Rejected, None, messages)
            .await;
        Ok(())
    }

    async fn notify_outcome(
        &self,
        source: &FiscalSource,
        sri_status: SriStatus,
        access_key: Option<String>,
        messages: Vec<String>,
    ) {
        self.notifier
            .notify(BillingEvent::AuthorizationOutcome {
                invoice_id: source.invoice.id,
                invoice_number: source.invoice.invoice_number.clone(),
                sri_status,
                access_key,
                messages,
                client_email: source.client.email.clone(),
            })
            .await;
    }
}

#[async_trait]
impl JobHandler for FiscalPipeline {
    fn name(&self) -> &'static str {
        AuthorizeInvoiceJob::NAME
    }

    async fn handle(&self, job: &Job) -> BillingResult<()> {
        let payload: AuthorizeInvoiceJob = job.payload()?;
        match self.run(payload.invoice_id).await? {
            RunOutcome::Rejected { messages } => Err(BillingError::ExternalRejection {
                invoice_id: payload.invoice_id,
                messages,
            }),
            _ => Ok(()),
        }
    }

    async fn on_exhausted(&self, job: &Job, err: &BillingError) {
        let payload: AuthorizeInvoiceJob = match job.payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Exhausted fiscal job has an unreadable payload");
                return;
            }
        };

        let reason = format!(
            "fiscal authority unreachable after {} attempts: {}",
            job.attempts, err
        );
        self.escalate(payload.invoice_id, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::access_key;
    use crate::fiscal::authority::AuthorityError;
    use crate::fiscal::document::tests::{issuer, source};
    use crate::fiscal::document::FiscalDocument;
    use crate::fiscal::signer::{CertificateSigner, UnavailableSigner};
    use crate::models::Invoice;
    use crate::worker::queue::{Backoff, JobStatus};
    use chrono::NaiveDate;
    use ed25519_dalek::SigningKey;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct MemoryLedger {
        source: Mutex<FiscalSource>,
    }

    impl MemoryLedger {
        /// Applies `write` when the stored stage is still `from`.
        fn write_from(
            &self,
            from: FiscalStage,
            write: impl FnOnce(&mut Invoice),
        ) -> BillingResult<()> {
            let mut source = self.source.lock().unwrap();
            let invoice = &mut source.invoice;
            if invoice.fiscal_stage != from || invoice.sri_status != SriStatus::Pending {
                return Err(stage_moved(invoice.id, from));
            }
            write(invoice);
            invoice.updated_at = Utc::now();
            Ok(())
        }
    }

    #[async_trait]
    impl FiscalLedger for MemoryLedger {
        async fn load_source(&self, _invoice_id: Uuid) -> BillingResult<FiscalSource> {
            Ok(self.source.lock().unwrap().clone())
        }

        async fn save_signed(
            &self,
            id: Uuid,
            version: DateTime<Utc>,
            document: &SignedDocument,
        ) -> BillingResult<()> {
            if self.source.lock().unwrap().invoice.updated_at != version {
                return Err(stage_moved(id, FiscalStage::Unsubmitted));
            }
            self.write_from(FiscalStage::Unsubmitted, |invoice| {
                invoice.access_key = Some(document.access_key.clone());
                invoice.xml_content = Some(document.xml.clone());
                invoice.fiscal_stage = FiscalStage::Signed;
            })
        }

        async fn save_stage(
            &self,
            _id: Uuid,
            from: FiscalStage,
            stage: FiscalStage,
            attempts: i32,
        ) -> BillingResult<()> {
            self.write_from(from, |invoice| {
                invoice.fiscal_stage = stage;
                invoice.sri_attempts = attempts;
            })
        }

        async fn save_authorized(
            &self,
            _id: Uuid,
            from: FiscalStage,
            access_key: &str,
            authorization_date: DateTime<Utc>,
        ) -> BillingResult<()> {
            self.write_from(from, |invoice| {
                invoice.access_key = Some(access_key.to_string());
                invoice.authorization_date = Some(authorization_date);
                invoice.sri_status = SriStatus::Authorized;
                invoice.fiscal_stage = FiscalStage::Authorized;
            })
        }

        async fn save_rejected(
            &self,
            _id: Uuid,
            from: FiscalStage,
            messages: &[String],
        ) -> BillingResult<()> {
            self.write_from(from, |invoice| {
                invoice.sri_status = SriStatus::Rejected;
                invoice.fiscal_stage = FiscalStage::Rejected;
                invoice.sri_messages = Some(serde_json::json!(messages));
            })
        }
    }

    /// Answers from a script; `None` entries answer "authorized" with the
    /// submitted key.
    #[derive(Default)]
    struct ScriptedAuthority {
        answers: Mutex<VecDeque<Result<Option<AuthorityVerdict>, AuthorityError>>>,
        submitted: Mutex<Vec<String>>,
        queries: Mutex<u32>,
    }

    impl ScriptedAuthority {
        fn answering(answers: Vec<Result<Option<AuthorityVerdict>, AuthorityError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                ..Default::default()
            }
        }

        fn next(&self, access_key: &str) -> Result<AuthorityVerdict, AuthorityError> {
            match self.answers.lock().unwrap().pop_front() {
                Some(Ok(Some(verdict))) => Ok(verdict),
                Some(Ok(None)) => Ok(AuthorityVerdict::Authorized {
                    access_key: access_key.to_string(),
                    authorization_date: Utc::now(),
                }),
                Some(Err(e)) => Err(e),
                None => Ok(AuthorityVerdict::Pending),
            }
        }
    }

    #[async_trait]
    impl FiscalAuthority for ScriptedAuthority {
        async fn submit(&self, document: &SignedDocument) -> Result<AuthorityVerdict, AuthorityError> {
            let answer = self.next(&document.access_key);
            if answer.is_ok() {
                self.submitted.lock().unwrap().push(document.access_key.clone());
            }
            answer
        }

        async fn query(&self, access_key: &str) -> Result<AuthorityVerdict, AuthorityError> {
            *self.queries.lock().unwrap() += 1;
            self.next(access_key)
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<(JobRequest, Duration)>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(&self, request: JobRequest, delay: Duration) -> BillingResult<Uuid> {
            self.enqueued.lock().unwrap().push((request, delay));
            Ok(Uuid::new_v4())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<BillingEvent>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: BillingEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        ledger: Arc<MemoryLedger>,
        authority: Arc<ScriptedAuthority>,
        queue: Arc<RecordingQueue>,
        notifier: Arc<RecordingNotifier>,
        pipeline: FiscalPipeline,
    }

    impl Harness {
        fn invoice_id(&self) -> Uuid {
            self.ledger.source.lock().unwrap().invoice.id
        }

        fn stage(&self) -> FiscalStage {
            self.ledger.source.lock().unwrap().invoice.fiscal_stage
        }
    }

    fn harness_with(
        authority: ScriptedAuthority,
        signer: Arc<dyn DocumentSigner>,
        max_polls: u32,
    ) -> Harness {
        let ledger = Arc::new(MemoryLedger {
            source: Mutex::new(source()),
        });
        let authority = Arc::new(authority);
        let queue = Arc::new(RecordingQueue::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut issuer = issuer();
        issuer.max_polls = max_polls;

        let pipeline = FiscalPipeline::new(
            ledger.clone(),
            authority.clone(),
            signer,
            queue.clone(),
            notifier.clone(),
            issuer,
            JobOptions {
                queue: FISCAL_QUEUE.to_string(),
                max_attempts: 5,
                backoff: Backoff::exponential(Duration::from_secs(30)),
            },
        );

        Harness {
            ledger,
            authority,
            queue,
            notifier,
            pipeline,
        }
    }

    fn harness(authority: ScriptedAuthority, max_polls: u32) -> Harness {
        let signer = CertificateSigner::new(
            SigningKey::from_bytes(&[9u8; 32]),
            NaiveDate::from_ymd_opt(2999, 1, 1).unwrap(),
        );
        harness_with(authority, Arc::new(signer), max_polls)
    }

    #[tokio::test]
    async fn test_pending_three_times_then_authorized() {
        let h = harness(
            ScriptedAuthority::answering(vec![
                Ok(Some(AuthorityVerdict::Pending)),
                Ok(Some(AuthorityVerdict::Pending)),
                Ok(Some(AuthorityVerdict::Pending)),
                Ok(None),
            ]),
            10,
        );
        let id = h.invoice_id();

        for expected_polls in 0..3 {
            let outcome = h.pipeline.run(id).await.unwrap();
            assert_eq!(outcome, RunOutcome::Pending { polls_done: expected_polls });
            assert_eq!(h.stage(), FiscalStage::PendingAuthorization);
        }
        let outcome = h.pipeline.run(id).await.unwrap();

        let source = h.ledger.source.lock().unwrap().clone();
        let key = source.invoice.access_key.clone().unwrap();
        assert_eq!(outcome, RunOutcome::Authorized { access_key: key.clone() });
        assert!(access_key::is_valid(&key));
        assert_eq!(source.invoice.sri_status, SriStatus::Authorized);
        assert!(source.invoice.authorization_date.is_some());
        assert_eq!(h.authority.submitted.lock().unwrap().len(), 1);
        assert_eq!(*h.authority.queries.lock().unwrap(), 3);

        let enqueued = h.queue.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 3);
        assert_eq!(enqueued[0].0.name, AuthorizeInvoiceJob::NAME);
        assert_eq!(enqueued[0].1, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_authorized_invoice_is_a_no_op() {
        let h = harness(ScriptedAuthority::answering(vec![Ok(None)]), 10);
        let id = h.invoice_id();

        h.pipeline.run(id).await.unwrap();
        assert_eq!(h.pipeline.run(id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(h.authority.submitted.lock().unwrap().len(), 1);
        assert_eq!(*h.authority.queries.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_document_for_resubmission() {
        let h = harness(
            ScriptedAuthority::answering(vec![
                Err(AuthorityError::Transport("connection reset".into())),
                Ok(None),
            ]),
            10,
        );
        let id = h.invoice_id();

        let err = h.pipeline.run(id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.stage(), FiscalStage::Signed);
        let first_xml = h.ledger.source.lock().unwrap().invoice.xml_content.clone();

        assert!(matches!(
            h.pipeline.run(id).await.unwrap(),
            RunOutcome::Authorized { .. }
        ));
        assert_eq!(h.ledger.source.lock().unwrap().invoice.xml_content, first_xml);
        assert_eq!(h.authority.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_certificate_escalates_without_retry() {
        let h = harness_with(
            ScriptedAuthority::default(),
            Arc::new(UnavailableSigner::new("signing certificate path is not configured")),
            10,
        );

        let err = h.pipeline.run(h.invoice_id()).await.unwrap_err();

        assert!(matches!(err, BillingError::Configuration(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.stage(), FiscalStage::Rejected);
        assert!(h.authority.submitted.lock().unwrap().is_empty());

        let source = h.ledger.source.lock().unwrap().clone();
        assert_eq!(source.invoice.sri_status, SriStatus::Rejected);
        assert_eq!(
            source.invoice.sri_messages,
            Some(serde_json::json!([
                "configuration error: signing certificate path is not configured"
            ]))
        );
        assert!(matches!(
            h.notifier.events.lock().unwrap()[0],
            BillingEvent::EscalationRequired { .. }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_tax_rate_is_rejected_and_escalated() {
        let h = harness(ScriptedAuthority::default(), 10);
        h.ledger.source.lock().unwrap().invoice.tax_rate = dec!(7);

        let err = h.pipeline.run(h.invoice_id()).await.unwrap_err();

        assert!(matches!(err, BillingError::Validation(_)));
        let source = h.ledger.source.lock().unwrap().clone();
        assert_eq!(source.invoice.sri_status, SriStatus::Rejected);
        assert_eq!(source.invoice.fiscal_stage, FiscalStage::Rejected);
        assert_eq!(
            source.invoice.sri_messages,
            Some(serde_json::json!([
                "validation failed: tax rate 7% has no fiscal rate code"
            ]))
        );

        let events = h.notifier.events.lock().unwrap();
        let escalations = events
            .iter()
            .filter(|e| matches!(e, BillingEvent::EscalationRequired { .. }))
            .count();
        assert_eq!(escalations, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            BillingEvent::AuthorizationOutcome { sri_status: SriStatus::Rejected, .. }
        )));
        assert!(h.authority.submitted.lock().unwrap().is_empty());
    }

    fn job_for(invoice_id: Uuid, attempts: i32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: AuthorizeInvoiceJob::NAME.to_string(),
            queue: FISCAL_QUEUE.to_string(),
            payload: serde_json::json!({ "invoice_id": invoice_id }),
            status: JobStatus::Running,
            attempts,
            max_attempts: 5,
            backoff_base_ms: 30_000,
            run_at: now,
            locked_until: Some(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_exhausted_transport_retries_force_rejection() {
        let h = harness(
            ScriptedAuthority::answering(vec![Err(AuthorityError::Transport(
                "connection reset".into(),
            ))]),
            10,
        );
        let id = h.invoice_id();
        let err = h.pipeline.run(id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.stage(), FiscalStage::Signed);
        assert!(h.notifier.events.lock().unwrap().is_empty());

        h.pipeline.on_exhausted(&job_for(id, 5), &err).await;

        let source = h.ledger.source.lock().unwrap().clone();
        assert_eq!(source.invoice.sri_status, SriStatus::Rejected);
        assert_eq!(source.invoice.fiscal_stage, FiscalStage::Rejected);
        let messages = source.invoice.sri_messages.unwrap();
        assert!(messages[0]
            .as_str()
            .unwrap()
            .starts_with("fiscal authority unreachable after 5 attempts"));
        let events = h.notifier.events.lock().unwrap();
        assert!(matches!(events[0], BillingEvent::EscalationRequired { .. }));

        // A later exhaustion on the same invoice changes nothing.
        drop(events);
        h.pipeline.on_exhausted(&job_for(id, 5), &err).await;
        assert_eq!(h.notifier.events.lock().unwrap().len(), 2);
    }

    /// Signs normally, but lets an operator edit land while the document is
    /// being signed.
    struct EditingSigner {
        inner: CertificateSigner,
        ledger: Arc<MemoryLedger>,
        edits_left: Mutex<u32>,
    }

    impl DocumentSigner for EditingSigner {
        fn sign(&self, document: &FiscalDocument, today: NaiveDate) -> BillingResult<SignedDocument> {
            let mut edits_left = self.edits_left.lock().unwrap();
            if *edits_left > 0 {
                *edits_left -= 1;
                let mut source = self.ledger.source.lock().unwrap();
                source.invoice.total = dec!(1148.85);
                source.invoice.updated_at = Utc::now() + chrono::Duration::seconds(1);
            }
            self.inner.sign(document, today)
        }
    }

    #[tokio::test]
    async fn test_edit_while_signing_restarts_from_current_invoice() {
        let ledger = Arc::new(MemoryLedger {
            source: Mutex::new(source()),
        });
        let signer = EditingSigner {
            inner: CertificateSigner::new(
                SigningKey::from_bytes(&[9u8; 32]),
                NaiveDate::from_ymd_opt(2999, 1, 1).unwrap(),
            ),
            ledger: ledger.clone(),
            edits_left: Mutex::new(1),
        };
        let authority = Arc::new(ScriptedAuthority::answering(vec![Ok(None)]));
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = FiscalPipeline::new(
            ledger.clone(),
            authority.clone(),
            Arc::new(signer),
            Arc::new(RecordingQueue::default()),
            notifier.clone(),
            issuer(),
            JobOptions {
                queue: FISCAL_QUEUE.to_string(),
                max_attempts: 5,
                backoff: Backoff::exponential(Duration::from_secs(30)),
            },
        );
        let id = ledger.source.lock().unwrap().invoice.id;

        // The stale document is never stored nor sent.
        let err = pipeline.run(id).await.unwrap_err();
        assert!(err.is_retryable());
        {
            let source = ledger.source.lock().unwrap();
            assert_eq!(source.invoice.fiscal_stage, FiscalStage::Unsubmitted);
            assert!(source.invoice.access_key.is_none());
            assert!(source.invoice.xml_content.is_none());
        }
        assert!(authority.submitted.lock().unwrap().is_empty());
        assert!(notifier.events.lock().unwrap().is_empty());

        let outcome = pipeline.run(id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Authorized { .. }));
        let xml = ledger.source.lock().unwrap().invoice.xml_content.clone().unwrap();
        assert!(xml.contains("<importeTotal>1148.85</importeTotal>"));
        assert_eq!(authority.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_from_a_stale_stage_is_refused() {
        let h = harness(ScriptedAuthority::default(), 10);
        let id = h.invoice_id();

        let err = h
            .ledger
            .save_stage(id, FiscalStage::Signed, FiscalStage::Submitted, 0)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.stage(), FiscalStage::Unsubmitted);
    }

    #[tokio::test]
    async fn test_exhausted_polls_force_rejection() {
        let h = harness(ScriptedAuthority::default(), 2);
        let id = h.invoice_id();

        assert_eq!(h.pipeline.run(id).await.unwrap(), RunOutcome::Pending { polls_done: 0 });
        assert_eq!(h.pipeline.run(id).await.unwrap(), RunOutcome::Pending { polls_done: 1 });
        assert_eq!(h.pipeline.run(id).await.unwrap(), RunOutcome::Escalated);

        let source = h.ledger.source.lock().unwrap().clone();
        assert_eq!(source.invoice.sri_status, SriStatus::Rejected);
        assert_eq!(source.invoice.fiscal_stage, FiscalStage::Rejected);
        let events = h.notifier.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, BillingEvent::EscalationRequired { .. })));
    }

    #[tokio::test]
    async fn test_rejection_is_recorded_with_messages() {
        let h = harness(
            ScriptedAuthority::answering(vec![Ok(Some(AuthorityVerdict::Rejected {
                messages: vec!["FIRMA INVALIDA".to_string()],
            }))]),
            10,
        );

        let outcome = h.pipeline.run(h.invoice_id()).await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Rejected {
                messages: vec!["FIRMA INVALIDA".to_string()]
            }
        );
        assert_eq!(
            h.ledger.source.lock().unwrap().invoice.sri_messages,
            Some(serde_json::json!(["FIRMA INVALIDA"]))
        );
    }

    #[tokio::test]
    async fn test_voided_invoice_is_not_submitted() {
        let h = harness(ScriptedAuthority::default(), 10);
        h.ledger.source.lock().unwrap().invoice.status = InvoiceStatus::Voided;

        assert_eq!(h.pipeline.run(h.invoice_id()).await.unwrap(), RunOutcome::Skipped);
        assert!(h.authority.submitted.lock().unwrap().is_empty());
    }
}
