// ABOUTME: SyncOrchestrator - runs exchange entities in priority order and advances their watermarks
// ABOUTME: Supports a cooperative stop request that is honored between entities

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::error::{ExchangeResult, TransportContext};
use super::events::{EventSink, ExchangeEvent, ExchangeStatus};
use super::model::{order_by_priority, ExchangeEntity};
use super::source::SourceReader;
use super::store::DestinationStore;
use super::task::{EntityPass, EntityStats, EntityTask, TaskRegistry};
use super::watermark::Watermark;

/// Cooperative stop flag shared between the orchestrator and whoever may
/// want to interrupt it (a signal handler, another task).
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the orchestrator to stop after the entity currently being processed.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Lifecycle of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Interrupted,
    Failed,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Interrupted { last_entity: String },
}

/// Result of one entity pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub name: String,
    /// Watermark the change set was read from.
    pub since: Watermark,
    /// Watermark written back, or `None` when the pass ended on the zero sentinel.
    pub persisted: Option<Watermark>,
    pub stats: EntityStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub entities: Vec<EntityReport>,
    /// Entities without a bound task.
    pub skipped: Vec<String>,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Counters summed over every entity.
    pub fn totals(&self) -> EntityStats {
        self.entities
            .iter()
            .fold(EntityStats::default(), |mut total, report| {
                total.fetched += report.stats.fetched;
                total.inserted += report.stats.inserted;
                total.updated += report.stats.updated;
                total.soft_deleted += report.stats.soft_deleted;
                total.rejected += report.stats.rejected;
                total
            })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Interrupted { .. })
    }
}

/// Drives one exchange run: every configured entity, in ascending priority,
/// read, reconciled, applied and only then watermarked.
pub struct SyncOrchestrator {
    source: Arc<dyn SourceReader>,
    store: Arc<dyn DestinationStore>,
    events: Arc<dyn EventSink>,
    registry: TaskRegistry,
    stop: StopHandle,
    state: RwLock<RunState>,
}

impl SyncOrchestrator {
    /// Orchestrator with the standard task for every known entity.
    pub fn new(
        source: Arc<dyn SourceReader>,
        store: Arc<dyn DestinationStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_registry(source, store, events, TaskRegistry::standard())
    }

    pub fn with_registry(
        source: Arc<dyn SourceReader>,
        store: Arc<dyn DestinationStore>,
        events: Arc<dyn EventSink>,
        registry: TaskRegistry,
    ) -> Self {
        Self {
            source,
            store,
            events,
            registry,
            stop: StopHandle::new(),
            state: RwLock::new(RunState::Idle),
        }
    }

    /// Share an existing stop flag instead of the orchestrator's own.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Handle that can request a stop while a run is in progress.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    fn set_state(&self, state: RunState) {
        *self.state.write() = state;
    }

    /// Run the exchange to completion, interruption or the first fatal error.
    ///
    /// Fatal errors leave the watermark of the entity in flight untouched and
    /// are reported through a terminal `UnknownError` event before being returned.
    pub async fn start_exchange(&self) -> ExchangeResult<RunSummary> {
        self.set_state(RunState::Running);
        let started = Instant::now();
        tracing::info!("Starting exchange");

        match self.run(started).await {
            Ok(summary) => {
                let state = match summary.outcome {
                    RunOutcome::Completed => RunState::Completed,
                    RunOutcome::Interrupted { .. } => RunState::Interrupted,
                };
                self.set_state(state);
                Ok(summary)
            }
            Err(e) => {
                self.set_state(RunState::Failed);
                tracing::error!("Exchange failed: {}", e);
                self.events.publish(
                    ExchangeEvent::new(None, ExchangeStatus::UnknownError, "Exchange failed")
                        .with_error(error_chain(&e))
                        .finish(),
                );
                Err(e)
            }
        }
    }

    async fn run(&self, started: Instant) -> ExchangeResult<RunSummary> {
        let mut entities = self
            .store
            .exchange_entities()
            .await
            .transport_context(|| "Failed to read exchange entities")?;
        order_by_priority(&mut entities);

        let mut reports = Vec::new();
        let mut skipped = Vec::new();

        for entity in &entities {
            let Some(task) = self.registry.get(&entity.name) else {
                tracing::error!(
                    "No exchange task is bound to entity {}, skipping it",
                    entity.name
                );
                self.events.publish(
                    ExchangeEvent::new(
                        Some(&entity.name),
                        ExchangeStatus::UnknownError,
                        "Entity skipped",
                    )
                    .with_error(format!("No exchange task for entity {}", entity.name)),
                );
                skipped.push(entity.name.clone());
                continue;
            };

            reports.push(self.run_entity(task, entity).await?);

            if self.stop.is_stop_requested() {
                tracing::info!(
                    "Exchange interrupted. Last finished entity is {}",
                    entity.name
                );
                self.events.publish(
                    ExchangeEvent::new(
                        Some(&entity.name),
                        ExchangeStatus::Unknown,
                        format!("Exchange interrupted, last finished entity {}", entity.name),
                    )
                    .finish(),
                );
                return Ok(RunSummary {
                    entities: reports,
                    skipped,
                    outcome: RunOutcome::Interrupted {
                        last_entity: entity.name.clone(),
                    },
                    duration_ms: elapsed_ms(started),
                });
            }
        }

        self.events.publish(
            ExchangeEvent::new(None, ExchangeStatus::Unknown, "Exchange finished").finish(),
        );
        let summary = RunSummary {
            entities: reports,
            skipped,
            outcome: RunOutcome::Completed,
            duration_ms: elapsed_ms(started),
        };
        tracing::info!(
            "Exchange finished in {}ms: {} entities",
            summary.duration_ms,
            summary.entities.len()
        );
        Ok(summary)
    }

    async fn run_entity(
        &self,
        task: &dyn EntityTask,
        entity: &ExchangeEntity,
    ) -> ExchangeResult<EntityReport> {
        let name = entity.name.as_str();
        let since = entity.last_state;
        let mut pass = EntityPass::new(
            name,
            since,
            self.source.as_ref(),
            self.store.as_ref(),
            self.events.as_ref(),
        );

        pass.info(format!("Requesting {} from source", task.label()));
        let changes = task.fetch_changes(self.source.as_ref(), since).await?;
        tracing::info!("{}: {} changed rows since {}", name, changes.len(), since);
        pass.info(format!("Prepared {} records for update", changes.len()));
        pass.set_fetched(changes.len());

        task.reconcile_and_apply(&mut pass, changes).await?;
        pass.info("Data update finished");

        let running_max = pass.running_max();
        let persisted = if running_max.is_zero() {
            tracing::debug!("{}: nothing observed, watermark left unset", name);
            None
        } else {
            self.store
                .update_watermark(name, running_max)
                .await
                .transport_context(|| {
                    format!("Failed to persist watermark {} for {}", running_max, name)
                })?;
            Some(running_max)
        };

        let stats = pass.stats();
        tracing::info!(
            "{}: {} inserted, {} updated, {} soft-deleted, {} rejected, watermark {}",
            name,
            stats.inserted,
            stats.updated,
            stats.soft_deleted,
            stats.rejected,
            running_max
        );

        Ok(EntityReport {
            name: name.to_string(),
            since,
            persisted,
            stats,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Render an error with its whole source chain, outermost first.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::error::ExchangeError;
    use crate::exchange::row::MappingError;

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_stop_requested());
        clone.request_stop();
        assert!(handle.is_stop_requested());
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = ExchangeError::mapping(
            "Company",
            None,
            MappingError::new("uid", "malformed uuid"),
        );
        let text = error_chain(&err);
        assert!(text.starts_with("mapping error in Company"));
        assert!(text.ends_with("field 'uid': malformed uuid"));
    }

    #[test]
    fn test_summary_totals() {
        let report = |inserted, updated| EntityReport {
            name: "Company".to_string(),
            since: Watermark::ZERO,
            persisted: None,
            stats: EntityStats {
                fetched: inserted + updated,
                inserted,
                updated,
                ..Default::default()
            },
        };
        let summary = RunSummary {
            entities: vec![report(1, 2), report(3, 0)],
            skipped: vec![],
            outcome: RunOutcome::Completed,
            duration_ms: 5,
        };
        let totals = summary.totals();
        assert_eq!(totals.inserted, 4);
        assert_eq!(totals.updated, 2);
        assert_eq!(totals.fetched, 6);
        assert!(!summary.is_interrupted());
    }
}
