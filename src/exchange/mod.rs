// ABOUTME: Incremental watermark-based exchange between a source and a destination store
// ABOUTME: Entities run in priority order; each entity's watermark advances only after its batch is applied

//! Incremental exchange engine.
//!
//! Every exchange entity carries an 8-byte watermark. A run walks the
//! entities in ascending priority and for each one:
//!
//! 1. reads every source row whose version exceeds the watermark,
//! 2. reconciles each row against a snapshot of the destination taken once
//!    for the pass, committing one record (with its children) per transaction,
//! 3. persists the highest version observed, unless it is the zero sentinel,
//! 4. stops early if a stop was requested.
//!
//! Store failures and malformed rows abort the run. Business rule
//! violations (an accepted transfer sheet changing in the source) and
//! entities without a task are reported through the [`EventSink`] and the run
//! carries on.

pub mod applier;
pub mod entities;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod reconciler;
pub mod row;
pub mod source;
pub mod store;
pub mod task;
pub mod transfer_sheet;
pub mod watermark;

pub use applier::{Write, WriteUnit};
pub use error::{ExchangeError, ExchangeResult};
pub use events::{
    CallbackSink, EventSink, ExchangeEvent, ExchangeStatus, JsonLinesSink, TracingSink,
};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryDestination, MemorySource};
pub use model::{
    Company, DestinationRecord, Division, EntityKind, ExchangeEntity, JewelryMetal, JewelryProof,
    JewelrySubject, JewelryType, Record, TransferSheet, TransferSheetStatus,
};
pub use orchestrator::{
    EntityReport, RunOutcome, RunState, RunSummary, StopHandle, SyncOrchestrator,
};
pub use reconciler::Decision;
pub use row::{ChangeSet, FieldValue, MappingError, SourceRow};
pub use source::{PgSourceReader, SourceOptions, SourceReader};
pub use store::{DestinationStore, PgDestinationStore};
pub use task::{EntityStats, EntityTask, MappedTask, TaskRegistry};
pub use watermark::Watermark;
