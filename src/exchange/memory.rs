// ABOUTME: In-memory source and destination stores for the exchange
// ABOUTME: Test doubles behind the test-utils feature, with failure injection for abort paths

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::applier::{Write, WriteUnit};
use super::model::{EntityKind, ExchangeEntity, Record};
use super::row::{ChangeSet, SourceRow};
use super::source::SourceReader;
use super::store::DestinationStore;
use super::watermark::Watermark;

#[derive(Default)]
struct SourceState {
    rows: HashMap<String, Vec<SourceRow>>,
    children: HashMap<Uuid, Vec<SourceRow>>,
    fetched: Vec<String>,
    failing: HashSet<String>,
}

/// Source store holding rows in memory. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&self, entity: &str, row: SourceRow) {
        self.state
            .lock()
            .rows
            .entry(entity.to_string())
            .or_default()
            .push(row);
    }

    /// Register a subject row under a transfer sheet.
    pub fn add_child(&self, sheet_uid: Uuid, row: SourceRow) {
        self.state
            .lock()
            .children
            .entry(sheet_uid)
            .or_default()
            .push(row);
    }

    /// Forget every subject of a sheet.
    pub fn clear_children(&self, sheet_uid: Uuid) {
        self.state.lock().children.remove(&sheet_uid);
    }

    /// Make every later fetch of `entity` fail.
    pub fn fail_fetch(&self, entity: &str) {
        self.state.lock().failing.insert(entity.to_string());
    }

    /// Entity names in the order they were fetched.
    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().fetched.clone()
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn fetch_changes(&self, entity: &str, since: Watermark) -> Result<ChangeSet> {
        let mut state = self.state.lock();
        state.fetched.push(entity.to_string());
        if state.failing.contains(entity) {
            bail!("source connection lost while reading {}", entity);
        }

        // Rows with an unreadable version are passed through so the mapping error surfaces.
        let rows: Vec<SourceRow> = state
            .rows
            .get(entity)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.version().map(|v| v > since).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(ChangeSet::new(entity, since, rows))
    }

    async fn fetch_children(&self, sheet_uid: Uuid) -> Result<Vec<SourceRow>> {
        let state = self.state.lock();
        let rows: Vec<SourceRow> = state
            .children
            .get(&sheet_uid)
            .map(|rows| {
                rows.iter()
                    .filter(|row| !row.is_deleted().unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

#[derive(Default)]
struct DestinationState {
    entities: Vec<ExchangeEntity>,
    records: HashMap<EntityKind, BTreeMap<Uuid, Record>>,
    watermark_writes: Vec<(String, Watermark)>,
    commits: usize,
    failing_commits: HashSet<Uuid>,
    failing_loads: HashSet<EntityKind>,
}

impl DestinationState {
    fn apply(&mut self, write: &Write) {
        match write {
            Write::Insert(record) | Write::Update(record) => {
                self.records
                    .entry(record.kind())
                    .or_default()
                    .insert(record.uid(), record.clone());
            }
            Write::MarkDeleted { kind, uid } => {
                if let Some(record) = self.records.get_mut(kind).and_then(|r| r.get_mut(uid)) {
                    record.set_deleted(true);
                }
            }
        }
    }
}

/// Destination store holding records in memory. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration of an exchange entity.
    pub fn with_entity(self, name: &str, priority: i32, last_state: Watermark) -> Self {
        self.state
            .lock()
            .entities
            .push(ExchangeEntity::new(name, priority, last_state));
        self
    }

    /// Seed a destination record directly, bypassing the exchange.
    pub fn put_record(&self, record: Record) {
        self.state.lock().apply(&Write::Insert(record));
    }

    pub fn record(&self, kind: EntityKind, uid: Uuid) -> Option<Record> {
        self.state
            .lock()
            .records
            .get(&kind)
            .and_then(|records| records.get(&uid))
            .cloned()
    }

    pub fn records(&self, kind: EntityKind) -> Vec<Record> {
        self.state
            .lock()
            .records
            .get(&kind)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn watermark(&self, entity: &str) -> Option<Watermark> {
        self.state
            .lock()
            .entities
            .iter()
            .find(|e| e.name == entity)
            .map(|e| e.last_state)
    }

    /// Every watermark persisted so far, in order.
    pub fn watermark_writes(&self) -> Vec<(String, Watermark)> {
        self.state.lock().watermark_writes.clone()
    }

    /// Number of write units committed.
    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    /// Make any later unit touching `uid` fail without applying anything.
    pub fn fail_commit_for(&self, uid: Uuid) {
        self.state.lock().failing_commits.insert(uid);
    }

    /// Make later snapshot reads of `kind` fail.
    pub fn fail_load(&self, kind: EntityKind) {
        self.state.lock().failing_loads.insert(kind);
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn exchange_entities(&self) -> Result<Vec<ExchangeEntity>> {
        Ok(self.state.lock().entities.clone())
    }

    async fn update_watermark(&self, entity: &str, value: Watermark) -> Result<()> {
        let mut state = self.state.lock();
        let target = state
            .entities
            .iter_mut()
            .find(|e| e.name == entity)
            .ok_or_else(|| anyhow!("No exchange entity named {}", entity))?;
        target.last_state = value;
        state.watermark_writes.push((entity.to_string(), value));
        Ok(())
    }

    async fn load_all(&self, kind: EntityKind) -> Result<Vec<Record>> {
        if self.state.lock().failing_loads.contains(&kind) {
            bail!("destination connection lost while reading {}", kind);
        }
        Ok(self.records(kind))
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(write) = unit
            .writes()
            .iter()
            .find(|w| state.failing_commits.contains(&w.uid()))
        {
            bail!(
                "destination rejected transaction at {} {}",
                write.kind(),
                write.uid()
            );
        }
        for write in unit.writes() {
            state.apply(write);
        }
        state.commits += 1;
        Ok(())
    }
}
