pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod services;

pub use queue::{Backoff, Job, JobOptions, JobQueue, JobRequest, JobStatus, PgJobQueue};
pub use runner::{JobHandler, JobRunner};
pub use scheduler::{BatchReport, BillingScheduler, RecurringLedger};
pub use services::{BillingEvent, EmailNotifier, NoopReadCache, Notifier, ReadCache};
