pub mod client;
pub mod invoice;
pub mod line_item;
pub mod project;
pub mod quote;
pub mod recurring_service;

pub use client::{Client, IdentificationType};
pub use invoice::{
    CreateInvoice, Invoice, InvoiceAggregate, InvoiceItem, InvoicePayment, InvoiceStatus,
    NewPayment, PaymentMethod, SriStatus, UpdateInvoice,
};
pub use line_item::{round_money, NewLineItem, PaymentType, Totals};
pub use project::{Project, ProjectStatus};
pub use quote::{Quote, QuoteItem, QuoteStatus, UpdateQuote};
pub use recurring_service::{BillingCycle, RecurringService, ServiceStatus};
