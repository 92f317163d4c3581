// ABOUTME: Entity tasks - the per-entity read/reconcile/apply step driven by the orchestrator
// ABOUTME: One generic task over mapping strategies, plus a registry binding entity names to tasks

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use uuid::Uuid;

use super::applier::{Write, WriteUnit};
use super::entities::{
    CompanyMapping, DivisionMapping, EntityMapping, JewelryMetalMapping, JewelryProofMapping,
    JewelryTypeMapping,
};
use super::error::{ExchangeError, ExchangeResult, TransportContext};
use super::events::{EventSink, ExchangeEvent, ExchangeStatus};
use super::model::DestinationRecord;
use super::reconciler::{reconcile, Decision, Snapshot};
use super::row::{ChangeSet, MappingError, SourceRow};
use super::source::SourceReader;
use super::store::DestinationStore;
use super::transfer_sheet::TransferSheetTask;
use super::watermark::Watermark;

/// Per-entity counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub soft_deleted: usize,
    pub rejected: usize,
}

/// State of one entity pass: the stores, the event sink, and the running
/// maximum of every version observed so far.
pub struct EntityPass<'a> {
    entity: &'a str,
    source: &'a dyn SourceReader,
    store: &'a dyn DestinationStore,
    events: &'a dyn EventSink,
    running_max: Watermark,
    stats: EntityStats,
}

impl<'a> EntityPass<'a> {
    pub fn new(
        entity: &'a str,
        since: Watermark,
        source: &'a dyn SourceReader,
        store: &'a dyn DestinationStore,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            entity,
            source,
            store,
            events,
            running_max: since,
            stats: EntityStats::default(),
        }
    }

    pub fn entity(&self) -> &str {
        self.entity
    }

    pub fn source(&self) -> &'a dyn SourceReader {
        self.source
    }

    pub fn store(&self) -> &'a dyn DestinationStore {
        self.store
    }

    /// Highest version seen in this pass, starting from the watermark it was read from.
    pub fn running_max(&self) -> Watermark {
        self.running_max
    }

    pub fn stats(&self) -> EntityStats {
        self.stats
    }

    pub(crate) fn set_fetched(&mut self, fetched: usize) {
        self.stats.fetched = fetched;
    }

    /// Fold the row's version into the running maximum.
    ///
    /// Called before the row is mapped or applied, so the version counts even
    /// when the record ends up rejected.
    pub fn observe(&mut self, row: &SourceRow) -> ExchangeResult<()> {
        let version = row
            .version()
            .map_err(|e| self.mapping_error(row.uid().ok(), e))?;
        self.running_max.advance_to(version);
        Ok(())
    }

    pub fn mapping_error(&self, uid: Option<Uuid>, source: MappingError) -> ExchangeError {
        ExchangeError::mapping(self.entity, uid, source)
    }

    pub fn publish(&self, event: ExchangeEvent) {
        self.events.publish(event);
    }

    /// Publish an informational event for this entity.
    pub fn info(&self, comment: impl Into<String>) {
        self.publish(ExchangeEvent::new(
            Some(self.entity),
            ExchangeStatus::Unknown,
            comment,
        ));
    }

    async fn commit(&self, unit: WriteUnit) -> ExchangeResult<()> {
        self.store
            .commit(&unit)
            .await
            .transport_context(|| format!("Failed to commit {}", unit.describe()))
    }

    /// Execute a reconciliation decision and report its outcome.
    pub async fn apply<R: DestinationRecord>(&mut self, decision: Decision<R>) -> ExchangeResult<()> {
        match decision {
            Decision::Insert(record) => {
                let uid = record.uid();
                self.commit(WriteUnit::single(Write::Insert(record.into_record())))
                    .await?;
                self.stats.inserted += 1;
                self.publish(
                    ExchangeEvent::new(Some(self.entity), ExchangeStatus::Insert, "Successful insert")
                        .with_uid(uid),
                );
            }
            Decision::Update(record) => {
                let uid = record.uid();
                self.commit(WriteUnit::single(Write::Update(record.into_record())))
                    .await?;
                self.stats.updated += 1;
                self.publish(
                    ExchangeEvent::new(Some(self.entity), ExchangeStatus::Update, "Successful update")
                        .with_uid(uid),
                );
            }
            Decision::SoftDelete(uid) => {
                self.commit(WriteUnit::single(Write::MarkDeleted { kind: R::KIND, uid }))
                    .await?;
                self.stats.soft_deleted += 1;
                self.publish(
                    ExchangeEvent::new(Some(self.entity), ExchangeStatus::Update, "Successful update")
                        .with_uid(uid),
                );
            }
            Decision::Reject { uid, reason } => {
                tracing::warn!("{} {} rejected: {}", self.entity, uid, reason);
                self.stats.rejected += 1;
                self.publish(
                    ExchangeEvent::new(Some(self.entity), ExchangeStatus::Update, "Update failed")
                        .with_uid(uid)
                        .with_error(reason),
                );
            }
        }
        Ok(())
    }
}

/// The read/reconcile/apply step of one exchange entity.
#[async_trait]
pub trait EntityTask: Send + Sync {
    /// Exchange entity name the task is bound to.
    fn name(&self) -> &str;

    /// Plural label for progress events.
    fn label(&self) -> &str;

    async fn fetch_changes(
        &self,
        source: &dyn SourceReader,
        since: Watermark,
    ) -> ExchangeResult<ChangeSet> {
        source
            .fetch_changes(self.name(), since)
            .await
            .transport_context(|| format!("Failed to read changes for {} since {}", self.name(), since))
    }

    /// Reconcile and apply every row of the change set, one committed unit per record.
    async fn reconcile_and_apply(
        &self,
        pass: &mut EntityPass<'_>,
        changes: ChangeSet,
    ) -> ExchangeResult<()>;
}

/// Entity task driven entirely by an [`EntityMapping`].
pub struct MappedTask<M> {
    mapping: PhantomData<fn() -> M>,
}

impl<M: EntityMapping> MappedTask<M> {
    pub fn new() -> Self {
        Self {
            mapping: PhantomData,
        }
    }
}

impl<M: EntityMapping> Default for MappedTask<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: EntityMapping> EntityTask for MappedTask<M> {
    fn name(&self) -> &str {
        M::kind().name()
    }

    fn label(&self) -> &str {
        M::LABEL
    }

    async fn reconcile_and_apply(
        &self,
        pass: &mut EntityPass<'_>,
        changes: ChangeSet,
    ) -> ExchangeResult<()> {
        let snapshot = Snapshot::<M::Record>::load(pass.store()).await?;
        tracing::debug!(
            "{}: reconciling against {} destination records",
            self.name(),
            snapshot.len()
        );

        for row in changes {
            pass.observe(&row)?;
            let incoming = M::map_row(&row).map_err(|e| pass.mapping_error(row.uid().ok(), e))?;
            let uid = incoming.uid();
            let decision = reconcile(incoming, snapshot.get(&uid), M::merge);
            pass.apply(decision).await?;
        }
        Ok(())
    }
}

/// Binds exchange entity names to their tasks.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Box<dyn EntityTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a task for every known entity kind.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(MappedTask::<CompanyMapping>::new());
        registry.register(MappedTask::<DivisionMapping>::new());
        registry.register(MappedTask::<JewelryMetalMapping>::new());
        registry.register(MappedTask::<JewelryProofMapping>::new());
        registry.register(MappedTask::<JewelryTypeMapping>::new());
        registry.register(TransferSheetTask);
        registry
    }

    /// Register a task under its own name, replacing any task bound to that name.
    pub fn register(&mut self, task: impl EntityTask + 'static) {
        self.tasks.insert(task.name().to_string(), Box::new(task));
    }

    pub fn get(&self, name: &str) -> Option<&dyn EntityTask> {
        self.tasks.get(name).map(|task| task.as_ref())
    }
}
