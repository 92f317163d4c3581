// ABOUTME: SourceReader for the exchange - reads changed rows from the source PostgreSQL
// ABOUTME: Each entity is queried for rows whose 8-byte version exceeds the persisted watermark

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use super::model::EntityKind;
use super::row::{ChangeSet, FieldValue, SourceRow};
use super::watermark::Watermark;

/// Read access to the source store.
///
/// Implementations must never return a row whose version is less than or
/// equal to `since`.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// All rows of `entity` changed after `since`, in no particular order.
    async fn fetch_changes(&self, entity: &str, since: Watermark) -> Result<ChangeSet>;

    /// Jewelry subjects currently carried by one transfer sheet.
    ///
    /// Subjects whose ticket, subject or sheet link is soft-deleted are not returned.
    async fn fetch_children(&self, sheet_uid: Uuid) -> Result<Vec<SourceRow>>;
}

/// Source-side filtering options.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Transfer sheets created before this day are never offered.
    pub transfer_sheets_since: NaiveDate,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            transfer_sheets_since: chrono::Local::now().date_naive(),
        }
    }
}

const COMPANY_QUERY: &str = "SELECT uid, code, ogrn, inn, kpp, name, firm_name AS full_name, \
     ''::text AS okpo, ''::text AS okud, address, is_deleted, version \
     FROM company WHERE version > $1";

const DIVISION_QUERY: &str = "SELECT uid, code, name, short_name, company_uid, code_1c, \
     is_deleted, version \
     FROM division WHERE version > $1";

const JEWELRY_METAL_QUERY: &str = "SELECT uid, name, short_name, is_deleted, version \
     FROM jewelry_metal WHERE version > $1";

const JEWELRY_PROOF_QUERY: &str = "SELECT uid, code, name, jewelry_metal_uid, cleanness, \
     is_deleted, version \
     FROM jewelry_proof WHERE version > $1";

const JEWELRY_TYPE_QUERY: &str = "SELECT uid, name, short_name, is_deleted, version \
     FROM jewelry_type WHERE version > $1";

// Source status 1 and 2 are the "sent" states of a sheet.
const TRANSFER_SHEET_QUERY: &str = "SELECT sheet.uid, sheet.number, sheet.date_create AS date_package, \
     (manager.surname || ' ' || left(manager.first_name, 1) || '.' || left(manager.middle_name, 1) || '.') AS manager_name, \
     (courier.surname || ' ' || left(courier.first_name, 1) || '.' || left(courier.middle_name, 1) || '.') AS courier_name, \
     sheet.division_uid, sheet.status, sheet.amount AS amount_of_money, sheet.is_deleted, sheet.version \
     FROM transfer_sheet sheet \
     JOIN employee manager ON sheet.employee_uid = manager.uid \
     JOIN employee courier ON sheet.advance_holder_employee_uid = courier.uid \
     WHERE sheet.status IN (2, 1) AND sheet.version > $1 AND sheet.date_create >= $2";

const JEWELRY_SUBJECT_QUERY: &str = "SELECT js.uid, link.transfer_sheet_uid, \
     (div.code || ' ' || number.number::text) AS ticket_number, \
     ('от ' || to_char(ticket.date_process, 'YYYY.MM.DD') || ', кредит ' || ticket.credit::text \
        || ' на ' || ((ticket.date_return::date - ticket.date_process::date) + 1)::text || ' дней') AS ticket_info, \
     ticket.date_process, ticket.percent_rate, js.jewelry_type_uid, ins.insert_desc AS diamond_insert, \
     js.jewelry_proof_uid, js.weight, (js.weight - coalesce(ins_weights.ins_weight, 0)) AS metal_weight, \
     subj.cost AS estimate_cost, \
     round(ticket.credit * subj.cost / coalesce(nullif(tcost.ticket_cost, 0), ticket.credit), 2) AS credit, \
     (emp.surname || ' ' || left(emp.first_name, 1) || '.' || left(emp.middle_name, 1) || '.') AS ticket_manager_name, \
     cat.name AS jewelry_category_name, cat.code AS jewelry_category_code, js.is_deleted, js.version \
     FROM jewelry_subject js \
     JOIN jewelry_category cat ON js.jewelry_category_uid = cat.uid \
     JOIN subject subj ON js.uid = subj.uid \
     LEFT JOIN (SELECT subject_uid, string_agg(name, ',') AS insert_desc FROM jewelry_insert \
                WHERE jewelry_stone_uid IS NOT NULL GROUP BY subject_uid) ins ON subj.uid = ins.subject_uid \
     LEFT JOIN (SELECT subject_uid, sum(weight) AS ins_weight FROM jewelry_insert GROUP BY subject_uid) ins_weights \
                ON subj.uid = ins_weights.subject_uid \
     LEFT JOIN (SELECT ticket_uid, sum(cost) AS ticket_cost FROM subject GROUP BY ticket_uid) tcost \
                ON tcost.ticket_uid = subj.ticket_uid \
     JOIN ticket ON subj.ticket_uid = ticket.uid \
     JOIN employee emp ON ticket.employee_uid = emp.uid \
     JOIN ticket_number number ON ticket.ticket_number_uid = number.uid \
     JOIN division div ON ticket.division_uid = div.uid \
     JOIN transfer_sheet_ticket link ON link.ticket_uid = ticket.uid \
     WHERE link.transfer_sheet_uid = $1 \
       AND ticket.is_deleted = false AND subj.is_deleted = false \
       AND link.is_deleted = false AND js.is_deleted = false";

/// Reads changed rows from a source PostgreSQL database.
///
/// Every exchanged source table carries a `version bytea` column holding an
/// 8-byte counter that grows whenever the row changes. PostgreSQL compares
/// `bytea` byte by byte, which for fixed-width values is the same order as the
/// big-endian counter, so `version > $1` selects exactly the rows newer than
/// the watermark.
pub struct PgSourceReader {
    client: Client,
    options: SourceOptions,
}

impl PgSourceReader {
    pub fn new(client: Client, options: SourceOptions) -> Self {
        Self { client, options }
    }
}

#[async_trait]
impl SourceReader for PgSourceReader {
    async fn fetch_changes(&self, entity: &str, since: Watermark) -> Result<ChangeSet> {
        let kind: EntityKind = entity
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("No source query for entity {}", entity))?;
        let since_bytes = since.to_vec();

        let rows = match kind {
            EntityKind::TransferSheet => {
                let period_begin: NaiveDateTime = self
                    .options
                    .transfer_sheets_since
                    .and_hms_opt(0, 0, 0)
                    .context("Invalid transfer sheet period start")?;
                self.client
                    .query(TRANSFER_SHEET_QUERY, &[&since_bytes, &period_begin])
                    .await
            }
            other => {
                self.client
                    .query(query_for(other), &[&since_bytes])
                    .await
            }
        }
        .with_context(|| format!("Failed to read changes for {} since {}", entity, since))?;

        let rows = rows
            .iter()
            .map(row_to_source_row)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to decode {} rows", entity))?;

        tracing::debug!(
            "Read {} changed rows for {} since {}",
            rows.len(),
            entity,
            since
        );

        Ok(ChangeSet::new(entity, since, rows))
    }

    async fn fetch_children(&self, sheet_uid: Uuid) -> Result<Vec<SourceRow>> {
        let rows = self
            .client
            .query(JEWELRY_SUBJECT_QUERY, &[&sheet_uid])
            .await
            .with_context(|| format!("Failed to read jewelry subjects of sheet {}", sheet_uid))?;

        rows.iter()
            .map(row_to_source_row)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to decode jewelry subjects of sheet {}", sheet_uid))
    }
}

fn query_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Company => COMPANY_QUERY,
        EntityKind::Division => DIVISION_QUERY,
        EntityKind::JewelryMetal => JEWELRY_METAL_QUERY,
        EntityKind::JewelryProof => JEWELRY_PROOF_QUERY,
        EntityKind::JewelryType => JEWELRY_TYPE_QUERY,
        EntityKind::TransferSheet => TRANSFER_SHEET_QUERY,
    }
}

/// Convert a tokio_postgres Row into a [`SourceRow`] keyed by column name.
///
/// Column values are decoded according to their PostgreSQL type. Types the
/// exchange has no use for fall back to their text representation.
pub fn row_to_source_row(row: &Row) -> Result<SourceRow> {
    let mut out = SourceRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = match column.type_().name() {
            "bool" => FieldValue::from(row.try_get::<_, Option<bool>>(idx)?),
            "int2" => FieldValue::from(row.try_get::<_, Option<i16>>(idx)?.map(i64::from)),
            "int4" => FieldValue::from(row.try_get::<_, Option<i32>>(idx)?.map(i64::from)),
            "int8" => FieldValue::from(row.try_get::<_, Option<i64>>(idx)?),
            "text" | "varchar" | "bpchar" | "name" => {
                FieldValue::from(row.try_get::<_, Option<String>>(idx)?)
            }
            "uuid" => FieldValue::from(row.try_get::<_, Option<Uuid>>(idx)?),
            "numeric" => FieldValue::from(row.try_get::<_, Option<rust_decimal::Decimal>>(idx)?),
            "timestamp" => FieldValue::from(row.try_get::<_, Option<NaiveDateTime>>(idx)?),
            "timestamptz" => FieldValue::from(
                row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                    .map(|ts| ts.naive_utc()),
            ),
            "date" => FieldValue::from(
                row.try_get::<_, Option<NaiveDate>>(idx)?
                    .and_then(|d| d.and_hms_opt(0, 0, 0)),
            ),
            "bytea" => match row.try_get::<_, Option<Vec<u8>>>(idx)? {
                Some(bytes) => FieldValue::Bytes(bytes),
                None => FieldValue::Null,
            },
            other => {
                let text: Option<String> = row.try_get(idx).with_context(|| {
                    format!("Unsupported column type {} for column {}", other, name)
                })?;
                FieldValue::from(text)
            }
        };
        out.set(name, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_non_composite_kind_has_a_versioned_query() {
        for kind in EntityKind::ALL {
            let query = query_for(kind);
            assert!(query.contains("version > $1"), "{} query", kind);
            assert!(query.contains("is_deleted"), "{} query", kind);
        }
    }

    #[test]
    fn test_transfer_sheet_query_filters_period_and_status() {
        assert!(TRANSFER_SHEET_QUERY.contains("date_create >= $2"));
        assert!(TRANSFER_SHEET_QUERY.contains("status IN (2, 1)"));
    }

    #[test]
    fn test_subject_query_excludes_deleted_ancestors() {
        for clause in [
            "ticket.is_deleted = false",
            "subj.is_deleted = false",
            "link.is_deleted = false",
            "js.is_deleted = false",
        ] {
            assert!(JEWELRY_SUBJECT_QUERY.contains(clause), "missing {}", clause);
        }
    }

    #[test]
    fn test_source_options_default_to_today() {
        let options = SourceOptions::default();
        assert_eq!(options.transfer_sheets_since, chrono::Local::now().date_naive());
    }
}
