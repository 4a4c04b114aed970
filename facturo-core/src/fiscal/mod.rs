pub mod access_key;
pub mod authority;
pub mod document;
pub mod pipeline;
pub mod signer;
pub mod state_machine;

pub use authority::{AuthorityError, AuthorityVerdict, FiscalAuthority, HttpFiscalAuthority};
pub use document::{FiscalDocument, FiscalSource};
pub use pipeline::{AuthorizeInvoiceJob, FiscalLedger, FiscalPipeline, RunOutcome, FISCAL_QUEUE};
pub use signer::{CertificateSigner, DocumentSigner, SignedDocument, UnavailableSigner};
pub use state_machine::{FiscalAction, FiscalStage, FiscalStateMachine, Transition};
