// ABOUTME: Transactional write units for the exchange
// ABOUTME: One record (plus a transfer sheet's subjects) committed all-or-nothing

use uuid::Uuid;

use super::model::{EntityKind, Record};

/// A single destination write.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Create the record. A transfer sheet is written together with its subjects.
    Insert(Record),
    /// Overwrite the record's fields. For a transfer sheet the subject
    /// collection is replaced by the one carried in the record.
    Update(Record),
    /// Set the deletion flag of an existing record and nothing else.
    MarkDeleted { kind: EntityKind, uid: Uuid },
}

impl Write {
    pub fn kind(&self) -> EntityKind {
        match self {
            Write::Insert(record) | Write::Update(record) => record.kind(),
            Write::MarkDeleted { kind, .. } => *kind,
        }
    }

    pub fn uid(&self) -> Uuid {
        match self {
            Write::Insert(record) | Write::Update(record) => record.uid(),
            Write::MarkDeleted { uid, .. } => *uid,
        }
    }
}

/// Writes that must become visible together or not at all.
///
/// Stores execute a unit inside one transaction. There is no transaction
/// spanning several units: each record is committed before the next one is
/// reconciled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteUnit {
    writes: Vec<Write>,
}

impl WriteUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(write: Write) -> Self {
        Self {
            writes: vec![write],
        }
    }

    pub fn push(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Short description for log lines, e.g. `update JewelryMetal 3f2c...`.
    pub fn describe(&self) -> String {
        self.writes
            .iter()
            .map(|w| {
                let op = match w {
                    Write::Insert(_) => "insert",
                    Write::Update(_) => "update",
                    Write::MarkDeleted { .. } => "mark-deleted",
                };
                format!("{} {} {}", op, w.kind(), w.uid())
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
