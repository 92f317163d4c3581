// ABOUTME: Reconciler for the exchange - decides insert/update per incoming record
// ABOUTME: Matches incoming records against a per-pass snapshot of destination records keyed by UID

use std::collections::HashMap;
use uuid::Uuid;

use super::error::{ExchangeResult, TransportContext};
use super::model::DestinationRecord;
use super::store::DestinationStore;

/// Outcome of reconciling one incoming record with destination state.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<R> {
    /// No destination record with this UID exists.
    Insert(R),
    /// The existing record, with incoming fields merged in.
    Update(R),
    /// Only the deletion flag changes; everything else stays as it is.
    SoftDelete(Uuid),
    /// The record must not be touched. Carries the reason reported to the event sink.
    Reject { uid: Uuid, reason: String },
}

impl<R> Decision<R> {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Insert(_) => "insert",
            Decision::Update(_) => "update",
            Decision::SoftDelete(_) => "soft-delete",
            Decision::Reject { .. } => "reject",
        }
    }
}

/// Destination records of one entity, read once at the start of a pass.
///
/// The snapshot is never refreshed while the pass runs. Two incoming rows with
/// the same UID are therefore both reconciled against the state from before the
/// pass: the one applied last wins, and each still produces its own event.
#[derive(Debug, Clone)]
pub struct Snapshot<R> {
    records: HashMap<Uuid, R>,
}

impl<R: DestinationRecord> Snapshot<R> {
    /// Read every destination record of `R`'s kind.
    pub async fn load(store: &dyn DestinationStore) -> ExchangeResult<Self> {
        let records = store
            .load_all(R::KIND)
            .await
            .transport_context(|| format!("Failed to load destination snapshot of {}", R::KIND))?;
        Ok(Self::from_records(
            records.into_iter().filter_map(R::from_record),
        ))
    }

    pub fn from_records(records: impl IntoIterator<Item = R>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.uid(), r)).collect(),
        }
    }

    pub fn get(&self, uid: &Uuid) -> Option<&R> {
        self.records.get(uid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Generic insert-or-update decision.
///
/// `merge` copies the entity's fields from the incoming record onto a copy of
/// the existing one; it decides per field whether blanks overwrite.
pub fn reconcile<R, F>(incoming: R, existing: Option<&R>, merge: F) -> Decision<R>
where
    R: Clone,
    F: FnOnce(&mut R, R),
{
    match existing {
        None => Decision::Insert(incoming),
        Some(existing) => {
            let mut updated = existing.clone();
            merge(&mut updated, incoming);
            Decision::Update(updated)
        }
    }
}

/// True when the value carries something other than whitespace.
pub fn is_present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Overwrite only when the incoming value is non-blank, keeping locally
/// entered values when the source sends nothing.
pub fn assign_if_present(target: &mut Option<String>, incoming: Option<String>) {
    if is_present(&incoming) {
        *target = incoming;
    }
}
