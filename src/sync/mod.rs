//! Cache reconciliation and the outbox of undelivered writes.

mod coordinator;
mod queue;
mod snapshot;

pub use coordinator::{SyncCoordinator, SyncReport, SyncState};
pub use queue::{FlushReport, OperationType, SyncOperation, MAX_OPERATION_RETRIES};
pub(crate) use snapshot::LastKnown;
