pub mod converters;
pub mod sequence;
pub mod service;
pub mod store;


pub use converters::{InvoiceDraft, ServiceBilling};
pub use sequence::SequenceAllocator;
pub use service::{BillingService, INVOICE_CACHE_SCOPE};
pub use store::PgFiscalLedger;
