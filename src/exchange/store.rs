// ABOUTME: DestinationStore for the exchange - reads snapshots and commits write units
// ABOUTME: PostgreSQL implementation runs each write unit in its own transaction

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row, Transaction};
use uuid::Uuid;

use super::applier::{Write, WriteUnit};
use super::model::{
    Company, Division, EntityKind, ExchangeEntity, JewelryMetal, JewelryProof, JewelrySubject,
    JewelryType, Record, TransferSheet, TransferSheetStatus,
};
use super::watermark::Watermark;

/// Read/write access to the destination store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Every configured exchange entity with its persisted watermark.
    async fn exchange_entities(&self) -> Result<Vec<ExchangeEntity>>;

    /// Persist the watermark of one exchange entity.
    async fn update_watermark(&self, entity: &str, value: Watermark) -> Result<()>;

    /// Full snapshot of one record kind. Transfer sheets come with their subjects.
    async fn load_all(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// Apply every write of the unit atomically.
    async fn commit(&self, unit: &WriteUnit) -> Result<()>;
}

type Param = Box<dyn ToSql + Sync + Send>;

const MAX_PARAMS: usize = 65000;

/// Destination table holding a record kind.
pub fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Company => "company",
        EntityKind::Division => "division",
        EntityKind::JewelryMetal => "jewelry_metal",
        EntityKind::JewelryProof => "jewelry_proof",
        EntityKind::JewelryType => "jewelry_type",
        EntityKind::TransferSheet => "transfer_sheet",
    }
}

const SUBJECT_TABLE: &str = "jewelry_subject";

const COMPANY_COLUMNS: &[&str] = &[
    "uid",
    "is_deleted",
    "code",
    "name",
    "full_name",
    "inn",
    "ogrn",
    "kpp",
    "okpo",
    "okud",
    "address",
];
const DIVISION_COLUMNS: &[&str] = &[
    "uid",
    "is_deleted",
    "code",
    "code_1c",
    "name",
    "short_name",
    "company_uid",
];
const METAL_COLUMNS: &[&str] = &["uid", "is_deleted", "name", "short_name"];
const PROOF_COLUMNS: &[&str] = &[
    "uid",
    "is_deleted",
    "code",
    "name",
    "cleanness",
    "jewelry_metal_uid",
];
const TYPE_COLUMNS: &[&str] = &["uid", "is_deleted", "name", "short_name"];
const SHEET_COLUMNS: &[&str] = &[
    "uid",
    "number",
    "date_package",
    "manager_name",
    "courier_name",
    "division_uid",
    "amount_of_money",
    "is_deleted",
    "status",
];
const SUBJECT_COLUMNS: &[&str] = &[
    "uid",
    "transfer_sheet_uid",
    "ticket_number",
    "ticket_info",
    "ticket_manager_name",
    "date_process",
    "percent_rate",
    "jewelry_type_uid",
    "jewelry_proof_uid",
    "diamond_insert",
    "weight",
    "metal_weight",
    "estimate_cost",
    "credit",
    "jewelry_category_name",
    "jewelry_category_code",
    "is_deleted",
];

fn columns_for(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Company => COMPANY_COLUMNS,
        EntityKind::Division => DIVISION_COLUMNS,
        EntityKind::JewelryMetal => METAL_COLUMNS,
        EntityKind::JewelryProof => PROOF_COLUMNS,
        EntityKind::JewelryType => TYPE_COLUMNS,
        EntityKind::TransferSheet => SHEET_COLUMNS,
    }
}

/// Destination store backed by PostgreSQL.
///
/// Expects one table per record kind (see [`table_for`]) keyed by `uid`, a
/// `jewelry_subject` table linked through `transfer_sheet_uid`, and an
/// `exchange_entity(entity_name, priority, last_state bytea)` table.
pub struct PgDestinationStore {
    client: Mutex<Client>,
    schema: String,
}

impl PgDestinationStore {
    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        Self {
            client: Mutex::new(client),
            schema: schema.into(),
        }
    }

    async fn load_subjects(&self, client: &Client) -> Result<HashMap<Uuid, Vec<JewelrySubject>>> {
        let query = build_select_query(&self.schema, SUBJECT_TABLE, SUBJECT_COLUMNS);
        let rows = client
            .query(&query, &[])
            .await
            .with_context(|| format!("Failed to read {}.{}", self.schema, SUBJECT_TABLE))?;

        let mut by_sheet: HashMap<Uuid, Vec<JewelrySubject>> = HashMap::new();
        for row in &rows {
            let subject = subject_from_row(row)?;
            by_sheet
                .entry(subject.transfer_sheet_uid)
                .or_default()
                .push(subject);
        }
        Ok(by_sheet)
    }

    async fn apply_write(&self, tx: &Transaction<'_>, write: &Write) -> Result<()> {
        match write {
            Write::Insert(record) => {
                let (columns, values) = record_values(record);
                let table = table_for(record.kind());
                let query = build_upsert_query(&self.schema, table, &["uid"], columns, 1);
                execute(tx, &query, &values)
                    .await
                    .with_context(|| format!("Failed to insert into {}.{}", self.schema, table))?;
                if let Record::TransferSheet(sheet) = record {
                    self.replace_subjects(tx, sheet).await?;
                }
            }
            Write::Update(record) => {
                let (columns, values) = record_values(record);
                let table = table_for(record.kind());
                let query = build_update_query(&self.schema, table, "uid", columns);
                let affected = execute(tx, &query, &values)
                    .await
                    .with_context(|| format!("Failed to update {}.{}", self.schema, table))?;
                if affected == 0 {
                    tracing::warn!(
                        "Update of {} {} matched no destination row",
                        record.kind(),
                        record.uid()
                    );
                }
                if let Record::TransferSheet(sheet) = record {
                    self.replace_subjects(tx, sheet).await?;
                }
            }
            Write::MarkDeleted { kind, uid } => {
                let table = table_for(*kind);
                let query = format!(
                    "UPDATE \"{}\".\"{}\" SET \"is_deleted\" = true WHERE \"uid\" = $1",
                    self.schema, table
                );
                tx.execute(&query, &[uid]).await.with_context(|| {
                    format!("Failed to mark {} {} as deleted", kind, uid)
                })?;
            }
        }
        Ok(())
    }

    /// Replace the whole subject collection of a sheet.
    async fn replace_subjects(&self, tx: &Transaction<'_>, sheet: &TransferSheet) -> Result<()> {
        let delete = format!(
            "DELETE FROM \"{}\".\"{}\" WHERE \"transfer_sheet_uid\" = $1",
            self.schema, SUBJECT_TABLE
        );
        tx.execute(&delete, &[&sheet.uid])
            .await
            .with_context(|| format!("Failed to clear subjects of sheet {}", sheet.uid))?;

        if sheet.subjects.is_empty() {
            return Ok(());
        }

        // PostgreSQL accepts at most 65535 bind parameters per statement
        let batch_size = std::cmp::max(1, MAX_PARAMS / SUBJECT_COLUMNS.len());
        for chunk in sheet.subjects.chunks(batch_size) {
            let query = build_upsert_query(
                &self.schema,
                SUBJECT_TABLE,
                &["uid"],
                SUBJECT_COLUMNS,
                chunk.len(),
            );
            let values: Vec<Param> = chunk.iter().flat_map(subject_values).collect();
            execute(tx, &query, &values)
                .await
                .with_context(|| format!("Failed to write subjects of sheet {}", sheet.uid))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for PgDestinationStore {
    async fn exchange_entities(&self) -> Result<Vec<ExchangeEntity>> {
        let query = format!(
            "SELECT entity_name, priority, last_state FROM \"{}\".exchange_entity ORDER BY priority",
            self.schema
        );
        let client = self.client.lock().await;
        let rows = client
            .query(&query, &[])
            .await
            .context("Failed to read exchange entities")?;

        rows.iter()
            .map(|row| -> Result<ExchangeEntity> {
                let name: String = row.try_get("entity_name")?;
                let priority: i32 = row.try_get("priority")?;
                let last_state: Option<Vec<u8>> = row.try_get("last_state")?;
                let last_state = match last_state {
                    Some(bytes) => Watermark::from_slice(&bytes)
                        .with_context(|| format!("Invalid watermark stored for {}", name))?,
                    None => Watermark::ZERO,
                };
                Ok(ExchangeEntity::new(&name, priority, last_state))
            })
            .collect()
    }

    async fn update_watermark(&self, entity: &str, value: Watermark) -> Result<()> {
        let query = format!(
            "UPDATE \"{}\".exchange_entity SET last_state = $2 WHERE entity_name = $1",
            self.schema
        );
        let client = self.client.lock().await;
        let affected = client
            .execute(&query, &[&entity, &value.to_vec()])
            .await
            .with_context(|| format!("Failed to persist watermark {} for {}", value, entity))?;
        if affected == 0 {
            bail!("No exchange entity named {}", entity);
        }
        Ok(())
    }

    async fn load_all(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let table = table_for(kind);
        let query = build_select_query(&self.schema, table, columns_for(kind));
        let client = self.client.lock().await;
        let rows = client
            .query(&query, &[])
            .await
            .with_context(|| format!("Failed to read {}.{}", self.schema, table))?;

        let mut subjects = if kind == EntityKind::TransferSheet {
            self.load_subjects(&client).await?
        } else {
            HashMap::new()
        };

        rows.iter()
            .map(|row| {
                record_from_row(kind, row, &mut subjects)
                    .with_context(|| format!("Failed to decode row of {}.{}", self.schema, table))
            })
            .collect()
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<()> {
        if unit.is_empty() {
            return Ok(());
        }

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin destination transaction")?;

        for write in unit.writes() {
            self.apply_write(&tx, write).await?;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit {}", unit.describe()))?;
        tracing::debug!("Committed {}", unit.describe());
        Ok(())
    }
}

async fn execute(tx: &Transaction<'_>, query: &str, values: &[Param]) -> Result<u64> {
    let params: Vec<&(dyn ToSql + Sync)> = values
        .iter()
        .map(|v| v.as_ref() as &(dyn ToSql + Sync))
        .collect();
    Ok(tx.execute(query, &params).await?)
}

/// Column names and bound values for a record, in matching order.
fn record_values(record: &Record) -> (&'static [&'static str], Vec<Param>) {
    let values: Vec<Param> = match record {
        Record::Company(c) => vec![
            Box::new(c.uid),
            Box::new(c.is_deleted),
            Box::new(c.code.clone()),
            Box::new(c.name.clone()),
            Box::new(c.full_name.clone()),
            Box::new(c.inn.clone()),
            Box::new(c.ogrn.clone()),
            Box::new(c.kpp.clone()),
            Box::new(c.okpo.clone()),
            Box::new(c.okud.clone()),
            Box::new(c.address.clone()),
        ],
        Record::Division(d) => vec![
            Box::new(d.uid),
            Box::new(d.is_deleted),
            Box::new(d.code.clone()),
            Box::new(d.code_1c.clone()),
            Box::new(d.name.clone()),
            Box::new(d.short_name.clone()),
            Box::new(d.company_uid),
        ],
        Record::JewelryMetal(m) => vec![
            Box::new(m.uid),
            Box::new(m.is_deleted),
            Box::new(m.name.clone()),
            Box::new(m.short_name.clone()),
        ],
        Record::JewelryProof(p) => vec![
            Box::new(p.uid),
            Box::new(p.is_deleted),
            Box::new(p.code.clone()),
            Box::new(p.name.clone()),
            Box::new(p.cleanness),
            Box::new(p.jewelry_metal_uid),
        ],
        Record::JewelryType(t) => vec![
            Box::new(t.uid),
            Box::new(t.is_deleted),
            Box::new(t.name.clone()),
            Box::new(t.short_name.clone()),
        ],
        Record::TransferSheet(s) => vec![
            Box::new(s.uid),
            Box::new(s.number.clone()),
            Box::new(s.date_package),
            Box::new(s.manager_name.clone()),
            Box::new(s.courier_name.clone()),
            Box::new(s.division_uid),
            Box::new(s.amount_of_money),
            Box::new(s.is_deleted),
            Box::new(s.status.code()),
        ],
    };
    (columns_for(record.kind()), values)
}

fn subject_values(s: &JewelrySubject) -> Vec<Param> {
    vec![
        Box::new(s.uid),
        Box::new(s.transfer_sheet_uid),
        Box::new(s.ticket_number.clone()),
        Box::new(s.ticket_info.clone()),
        Box::new(s.ticket_manager_name.clone()),
        Box::new(s.date_process),
        Box::new(s.percent_rate),
        Box::new(s.jewelry_type_uid),
        Box::new(s.jewelry_proof_uid),
        Box::new(s.diamond_insert.clone()),
        Box::new(s.weight),
        Box::new(s.metal_weight),
        Box::new(s.estimate_cost),
        Box::new(s.credit),
        Box::new(s.jewelry_category_name.clone()),
        Box::new(s.jewelry_category_code.clone()),
        Box::new(s.is_deleted),
    ]
}

fn record_from_row(
    kind: EntityKind,
    row: &Row,
    subjects: &mut HashMap<Uuid, Vec<JewelrySubject>>,
) -> Result<Record> {
    let record = match kind {
        EntityKind::Company => Record::Company(Company {
            uid: row.try_get("uid")?,
            is_deleted: row.try_get("is_deleted")?,
            code: row.try_get("code")?,
            name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
            full_name: row.try_get("full_name")?,
            inn: row.try_get("inn")?,
            ogrn: row.try_get("ogrn")?,
            kpp: row.try_get("kpp")?,
            okpo: row.try_get("okpo")?,
            okud: row.try_get("okud")?,
            address: row.try_get("address")?,
        }),
        EntityKind::Division => Record::Division(Division {
            uid: row.try_get("uid")?,
            is_deleted: row.try_get("is_deleted")?,
            code: row.try_get("code")?,
            code_1c: row.try_get("code_1c")?,
            name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
            short_name: row.try_get("short_name")?,
            company_uid: row.try_get("company_uid")?,
        }),
        EntityKind::JewelryMetal => Record::JewelryMetal(JewelryMetal {
            uid: row.try_get("uid")?,
            is_deleted: row.try_get("is_deleted")?,
            name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
            short_name: row.try_get("short_name")?,
        }),
        EntityKind::JewelryProof => Record::JewelryProof(JewelryProof {
            uid: row.try_get("uid")?,
            is_deleted: row.try_get("is_deleted")?,
            code: row.try_get("code")?,
            name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
            cleanness: row.try_get("cleanness")?,
            jewelry_metal_uid: row.try_get("jewelry_metal_uid")?,
        }),
        EntityKind::JewelryType => Record::JewelryType(JewelryType {
            uid: row.try_get("uid")?,
            is_deleted: row.try_get("is_deleted")?,
            name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
            short_name: row.try_get("short_name")?,
        }),
        EntityKind::TransferSheet => {
            let uid: Uuid = row.try_get("uid")?;
            let code: i16 = row.try_get("status")?;
            let status = TransferSheetStatus::from_code(code)
                .with_context(|| format!("Unknown transfer sheet status {} on {}", code, uid))?;
            Record::TransferSheet(TransferSheet {
                uid,
                number: row.try_get::<_, Option<String>>("number")?.unwrap_or_default(),
                date_package: row.try_get("date_package")?,
                manager_name: row
                    .try_get::<_, Option<String>>("manager_name")?
                    .unwrap_or_default(),
                courier_name: row
                    .try_get::<_, Option<String>>("courier_name")?
                    .unwrap_or_default(),
                division_uid: row.try_get("division_uid")?,
                amount_of_money: row.try_get("amount_of_money")?,
                is_deleted: row.try_get("is_deleted")?,
                status,
                subjects: subjects.remove(&uid).unwrap_or_default(),
            })
        }
    };
    Ok(record)
}

fn subject_from_row(row: &Row) -> Result<JewelrySubject> {
    let text = |name: &str| -> Result<String> {
        Ok(row.try_get::<_, Option<String>>(name)?.unwrap_or_default())
    };
    Ok(JewelrySubject {
        uid: row.try_get("uid")?,
        transfer_sheet_uid: row.try_get("transfer_sheet_uid")?,
        ticket_number: text("ticket_number")?,
        ticket_info: text("ticket_info")?,
        ticket_manager_name: text("ticket_manager_name")?,
        date_process: row.try_get("date_process")?,
        percent_rate: row.try_get("percent_rate")?,
        jewelry_type_uid: row.try_get("jewelry_type_uid")?,
        jewelry_proof_uid: row.try_get("jewelry_proof_uid")?,
        diamond_insert: row.try_get("diamond_insert")?,
        weight: row.try_get("weight")?,
        metal_weight: row.try_get("metal_weight")?,
        estimate_cost: row.try_get("estimate_cost")?,
        credit: row.try_get("credit")?,
        jewelry_category_name: row.try_get("jewelry_category_name")?,
        jewelry_category_code: row.try_get("jewelry_category_code")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

fn quote_columns(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| format!("\"{}\"", c)).collect()
}

fn build_select_query(schema: &str, table: &str, columns: &[&str]) -> String {
    format!(
        "SELECT {} FROM \"{}\".\"{}\"",
        quote_columns(columns).join(", "),
        schema,
        table
    )
}

/// Build an upsert query for one or more rows.
///
/// ```sql
/// INSERT INTO "schema"."table" ("uid", "name")
/// VALUES ($1, $2), ($3, $4)
/// ON CONFLICT ("uid") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
fn build_upsert_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[&str],
    all_columns: &[&str],
    num_rows: usize,
) -> String {
    let num_cols = all_columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let update_columns: Vec<String> = all_columns
        .iter()
        .filter(|c| !primary_key_columns.contains(*c))
        .map(|c| format!("\"{}\" = EXCLUDED.\"{}\"", c, c))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO \"{}\".\"{}\" ({}) VALUES {} ON CONFLICT ({}) {}",
        schema,
        table,
        quote_columns(all_columns).join(", "),
        value_rows.join(", "),
        quote_columns(primary_key_columns).join(", "),
        update_clause
    )
}

/// Build an update of every non-key column, with parameters in column order.
///
/// The key column must be one of `all_columns`.
fn build_update_query(schema: &str, table: &str, key_column: &str, all_columns: &[&str]) -> String {
    let assignments: Vec<String> = all_columns
        .iter()
        .enumerate()
        .filter(|(_, c)| **c != key_column)
        .map(|(idx, c)| format!("\"{}\" = ${}", c, idx + 1))
        .collect();
    let key_idx = all_columns
        .iter()
        .position(|c| *c == key_column)
        .map(|idx| idx + 1)
        .unwrap_or(all_columns.len() + 1);

    format!(
        "UPDATE \"{}\".\"{}\" SET {} WHERE \"{}\" = ${}",
        schema,
        table,
        assignments.join(", "),
        key_column,
        key_idx
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upsert_query_single_row() {
        let query = build_upsert_query("public", "jewelry_metal", &["uid"], METAL_COLUMNS, 1);

        assert!(query.contains("INSERT INTO \"public\".\"jewelry_metal\""));
        assert!(query.contains("(\"uid\", \"is_deleted\", \"name\", \"short_name\")"));
        assert!(query.contains("VALUES ($1, $2, $3, $4)"));
        assert!(query.contains("ON CONFLICT (\"uid\")"));
        assert!(query.contains("\"name\" = EXCLUDED.\"name\""));
        assert!(!query.contains("\"uid\" = EXCLUDED.\"uid\""));
    }

    #[test]
    fn test_build_upsert_query_multiple_rows() {
        let query = build_upsert_query("public", "t", &["uid"], &["uid", "name"], 3);
        assert!(query.contains("($1, $2), ($3, $4), ($5, $6)"));
    }

    #[test]
    fn test_build_upsert_query_key_only() {
        let query = build_upsert_query("public", "t", &["uid"], &["uid"], 1);
        assert!(query.contains("DO NOTHING"));
    }

    #[test]
    fn test_build_update_query_keeps_parameter_positions() {
        let query = build_update_query("public", "jewelry_metal", "uid", METAL_COLUMNS);
        assert_eq!(
            query,
            "UPDATE \"public\".\"jewelry_metal\" SET \"is_deleted\" = $2, \"name\" = $3, \
             \"short_name\" = $4 WHERE \"uid\" = $1"
        );
    }

    #[test]
    fn test_record_values_match_columns() {
        let records = vec![
            Record::Company(Company::default()),
            Record::Division(Division::default()),
            Record::JewelryMetal(JewelryMetal::default()),
            Record::JewelryProof(JewelryProof::default()),
            Record::JewelryType(JewelryType::default()),
            Record::TransferSheet(TransferSheet::default()),
        ];
        for record in &records {
            let (columns, values) = record_values(record);
            assert_eq!(columns.len(), values.len(), "{}", record.kind());
            assert_eq!(columns[0], "uid");
        }
        assert_eq!(
            subject_values(&JewelrySubject::default()).len(),
            SUBJECT_COLUMNS.len()
        );
    }

    #[test]
    fn test_every_kind_has_a_table() {
        let mut tables: Vec<&str> = EntityKind::ALL.iter().map(|k| table_for(*k)).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), EntityKind::ALL.len());
    }
}
