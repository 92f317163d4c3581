// ABOUTME: Source rows and change sets for incremental exchange
// ABOUTME: Typed field bags read from the source and the per-entity batch of changed rows

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use super::watermark::Watermark;

/// A field could not be converted into the shape the destination expects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field '{field}': {reason}")]
pub struct MappingError {
    pub field: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn missing(field: &str) -> Self {
        Self::new(field, "column is missing from the row")
    }

    fn null(field: &str) -> Self {
        Self::new(field, "value is NULL")
    }

    fn unexpected(field: &str, expected: &str, found: &FieldValue) -> Self {
        Self::new(
            field,
            format!("expected {}, found {}", expected, found.type_name()),
        )
    }
}

/// A single typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Decimal(Decimal),
    Timestamp(NaiveDateTime),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "integer",
            FieldValue::Text(_) => "text",
            FieldValue::Uuid(_) => "uuid",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Uuid(value)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<NaiveDateTime> for FieldValue {
    fn from(value: NaiveDateTime) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<Watermark> for FieldValue {
    fn from(value: Watermark) -> Self {
        FieldValue::Bytes(value.to_vec())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// One row read from the source, keyed by column name.
///
/// Every exchanged row carries `uid`, `version` and `is_deleted`; the other
/// columns depend on the entity. Accessors perform the lenient conversions the
/// source schema needs (text UIDs, 0/1 booleans) and report anything else as a
/// [`MappingError`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    fields: BTreeMap<String, FieldValue>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn field(&self, name: &str) -> Result<&FieldValue, MappingError> {
        self.fields.get(name).ok_or_else(|| MappingError::missing(name))
    }

    pub fn uid(&self) -> Result<Uuid, MappingError> {
        self.uuid("uid")
    }

    pub fn version(&self) -> Result<Watermark, MappingError> {
        match self.field("version")? {
            FieldValue::Bytes(bytes) => Watermark::from_slice(bytes),
            FieldValue::Int(value) if *value >= 0 => Ok(Watermark::from_u64(*value as u64)),
            FieldValue::Null => Err(MappingError::null("version")),
            other => Err(MappingError::unexpected("version", "8-byte version", other)),
        }
    }

    pub fn is_deleted(&self) -> Result<bool, MappingError> {
        self.boolean("is_deleted")
    }

    pub fn boolean(&self, name: &str) -> Result<bool, MappingError> {
        match self.field(name)? {
            FieldValue::Bool(value) => Ok(*value),
            FieldValue::Int(value) => Ok(*value != 0),
            FieldValue::Null => Err(MappingError::null(name)),
            other => Err(MappingError::unexpected(name, "bool", other)),
        }
    }

    /// Required text column. NULL maps to an empty string.
    pub fn text(&self, name: &str) -> Result<String, MappingError> {
        Ok(self.opt_text(name)?.unwrap_or_default())
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>, MappingError> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Text(value) => Ok(Some(value.clone())),
            FieldValue::Int(value) => Ok(Some(value.to_string())),
            FieldValue::Decimal(value) => Ok(Some(value.to_string())),
            FieldValue::Uuid(value) => Ok(Some(value.to_string())),
            other => Err(MappingError::unexpected(name, "text", other)),
        }
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid, MappingError> {
        self.opt_uuid(name)?.ok_or_else(|| MappingError::null(name))
    }

    pub fn opt_uuid(&self, name: &str) -> Result<Option<Uuid>, MappingError> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Uuid(value) => Ok(Some(*value)),
            FieldValue::Text(value) => Uuid::parse_str(value.trim())
                .map(Some)
                .map_err(|e| MappingError::new(name, format!("malformed uuid '{}': {}", value, e))),
            other => Err(MappingError::unexpected(name, "uuid", other)),
        }
    }

    pub fn opt_decimal(&self, name: &str) -> Result<Option<Decimal>, MappingError> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Decimal(value) => Ok(Some(*value)),
            FieldValue::Int(value) => Ok(Some(Decimal::from(*value))),
            FieldValue::Text(value) => Decimal::from_str(value.trim())
                .map(Some)
                .map_err(|e| {
                    MappingError::new(name, format!("malformed decimal '{}': {}", value, e))
                }),
            other => Err(MappingError::unexpected(name, "decimal", other)),
        }
    }

    pub fn opt_timestamp(&self, name: &str) -> Result<Option<NaiveDateTime>, MappingError> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Timestamp(value) => Ok(Some(*value)),
            other => Err(MappingError::unexpected(name, "timestamp", other)),
        }
    }
}

/// All source rows of one entity newer than a watermark.
///
/// Rows come in whatever order the source returned them; nothing downstream
/// may rely on their order.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    entity: String,
    since: Watermark,
    rows: Vec<SourceRow>,
}

impl ChangeSet {
    pub fn new(entity: &str, since: Watermark, rows: Vec<SourceRow>) -> Self {
        Self {
            entity: entity.to_string(),
            since,
            rows,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The watermark the change set was read from.
    pub fn since(&self) -> Watermark {
        self.since
    }

    pub fn rows(&self) -> &[SourceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Highest version in the set, or `since` if the set is empty.
    pub fn max_version(&self) -> Result<Watermark, MappingError> {
        let mut max = self.since;
        for row in &self.rows {
            max.advance_to(row.version()?);
        }
        Ok(max)
    }
}

impl IntoIterator for ChangeSet {
    type Item = SourceRow;
    type IntoIter = std::vec::IntoIter<SourceRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
