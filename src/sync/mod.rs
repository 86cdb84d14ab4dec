//! Outbox reconciliation.
//!
//! The coordinator waits for connectivity to come back, submits queued
//! mutations to the batch endpoint in enqueue order and removes the ones the
//! server confirmed. Explicitly rejected operations stay queued.

mod backoff;
mod connectivity;
mod coordinator;
mod protocol;

pub use backoff::RetryPolicy;
pub use connectivity::Connectivity;
pub use coordinator::{FlushOutcome, FlushReport, SyncCoordinator};
pub use protocol::{BatchResult, SyncBatchRequest, SyncBatchResponse, SyncOperation};
