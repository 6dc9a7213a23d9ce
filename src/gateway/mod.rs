pub mod adapter;
pub mod attempt;
pub mod audit;
pub mod bill;
pub mod context;
pub mod executor;

pub use adapter::{AdapterOutput, ExecuteArgs, KeySource, ProviderAdapter, UpstreamResponse};
pub use attempt::{AttemptRecord, AttemptStatus, RequestResult, SkipReason};
pub use audit::{AuditSink, FailureEvent, TracingAuditSink};
pub use bill::Bill;
pub use context::RequestContext;
pub use executor::{ExecutionSettings, Gateway};
