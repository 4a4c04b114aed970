use serde::{Deserialize, Serialize};
use std::fmt;

/// Fiscal authorization stage of an invoice.
///
/// The pipeline progresses through these stages:
/// - Unsubmitted: no fiscal document yet
/// - Signed: XML built and signed, not yet acknowledged by the authority
/// - Submitted: the authority acknowledged the document
/// - PendingAuthorization: the authority is still processing it
/// - Authorized / Rejected: terminal verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FiscalStage {
    Unsubmitted,
    Signed,
    Submitted,
    PendingAuthorization,
    Authorized,
    Rejected,
}

impl FiscalStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiscalStage::Unsubmitted => "unsubmitted",
            FiscalStage::Signed => "signed",
            FiscalStage::Submitted => "submitted",
            FiscalStage::PendingAuthorization => "pending_authorization",
            FiscalStage::Authorized => "authorized",
            FiscalStage::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FiscalStage::Authorized | FiscalStage::Rejected)
    }
}

impl fmt::Display for FiscalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of an authority answer, stripped of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Authorized,
    Rejected,
    Pending,
}

/// Action to take for a stage or after an authority answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiscalAction {
    /// Build the XML document and sign it
    BuildAndSign,

    /// Send the signed document to the authority
    Submit,

    /// Ask the authority for the verdict on an acknowledged document
    Query,

    /// Enqueue a delayed follow-up query
    SchedulePoll,

    /// Persist the authorization and notify
    RecordAuthorization,

    /// Persist the rejection and notify
    RecordRejection,

    /// Polls exhausted: force rejection and page an operator
    Escalate,

    /// No action required
    NoAction,
}

impl fmt::Display for FiscalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiscalAction::BuildAndSign => "build_and_sign",
            FiscalAction::Submit => "submit",
            FiscalAction::Query => "query",
            FiscalAction::SchedulePoll => "schedule_poll",
            FiscalAction::RecordAuthorization => "record_authorization",
            FiscalAction::RecordRejection => "record_rejection",
            FiscalAction::Escalate => "escalate",
            FiscalAction::NoAction => "no_action",
        };
        f.write_str(name)
    }
}

/// Trait for stage transitions in the fiscal authorization state machine.
pub trait Transition {
    /// What a run starting from `stage` does first.
    fn action_for(stage: FiscalStage) -> FiscalAction;

    /// Next stage and action once the authority has answered.
    ///
    /// `polls_done` counts the queries already performed, including the one
    /// that produced this answer.
    fn after_verdict(verdict: VerdictKind, polls_done: u32, max_polls: u32)
        -> (FiscalStage, FiscalAction);

    fn initial_stage() -> FiscalStage {
        FiscalStage::Unsubmitted
    }
}

/// Default fiscal pipeline transitions:
/// - Unsubmitted -> Signed (build and sign)
/// - Signed -> Submitted (once the authority acknowledges)
/// - Submitted / PendingAuthorization -> query, never resubmit
/// - pending answer -> PendingAuthorization, or Rejected once polls run out
pub struct FiscalStateMachine;

impl Transition for FiscalStateMachine {
    fn action_for(stage: FiscalStage) -> FiscalAction {
        match stage {
            FiscalStage::Unsubmitted => FiscalAction::BuildAndSign,
            FiscalStage::Signed => FiscalAction::Submit,
            FiscalStage::Submitted | FiscalStage::PendingAuthorization => FiscalAction::Query,
            FiscalStage::Authorized | FiscalStage::Rejected => FiscalAction::NoAction,
        }
    }

    fn after_verdict(
        verdict: VerdictKind,
        polls_done: u32,
        max_polls: u32,
    ) -> (FiscalStage, FiscalAction) {
        match verdict {
            VerdictKind::Authorized => (FiscalStage::Authorized, FiscalAction::RecordAuthorization),
            VerdictKind::Rejected => (FiscalStage::Rejected, FiscalAction::RecordRejection),
            VerdictKind::Pending if polls_done >= max_polls => {
                (FiscalStage::Rejected, FiscalAction::Escalate)
            }
            VerdictKind::Pending => (FiscalStage::PendingAuthorization, FiscalAction::SchedulePoll),
        }
    }
}
