// ABOUTME: Transfer sheet exchange - the status-guarded composite entity
// ABOUTME: Moved sheets are replaced together with their subjects; accepted sheets are never touched

use async_trait::async_trait;
use uuid::Uuid;

use super::error::{ExchangeResult, TransportContext};
use super::model::{EntityKind, JewelrySubject, TransferSheet, TransferSheetStatus};
use super::reconciler::{Decision, Snapshot};
use super::row::{ChangeSet, MappingError, SourceRow};
use super::task::{EntityPass, EntityTask};

/// Error text reported when an accepted sheet changes in the source.
pub const ACCEPTED_SHEET_ERROR: &str = "Transfer sheet is already accepted, cannot modify";

/// What to do with one incoming sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetAction {
    /// Unknown sheet: insert it with freshly fetched subjects.
    Insert,
    /// Moved sheet deleted in the source: flip the deletion flag only.
    SoftDelete,
    /// Moved sheet: replace every scalar field and the whole subject collection.
    Replace,
    /// Accepted sheet: leave it alone and report the attempt.
    Reject,
}

/// Transition table of the transfer sheet guard.
pub fn guard(incoming: &TransferSheet, existing: Option<&TransferSheet>) -> SheetAction {
    match existing {
        None => SheetAction::Insert,
        Some(sheet) => match sheet.status {
            TransferSheetStatus::Accepted => SheetAction::Reject,
            TransferSheetStatus::Moved if incoming.is_deleted && !sheet.is_deleted => {
                SheetAction::SoftDelete
            }
            TransferSheetStatus::Moved => SheetAction::Replace,
        },
    }
}

/// Map a source row onto a sheet. Every incoming sheet is `Moved` and carries no subjects yet.
pub fn map_sheet(row: &SourceRow) -> Result<TransferSheet, MappingError> {
    Ok(TransferSheet {
        uid: row.uid()?,
        number: row.text("number")?,
        date_package: row.opt_timestamp("date_package")?,
        manager_name: row.text("manager_name")?,
        courier_name: row.text("courier_name")?,
        division_uid: row.uuid("division_uid")?,
        amount_of_money: row.opt_decimal("amount_of_money")?,
        is_deleted: row.is_deleted()?,
        status: TransferSheetStatus::Moved,
        subjects: Vec::new(),
    })
}

/// Map a subject row. The subject is bound to `sheet_uid` whatever the row says.
pub fn map_subject(row: &SourceRow, sheet_uid: Uuid) -> Result<JewelrySubject, MappingError> {
    Ok(JewelrySubject {
        uid: row.uid()?,
        transfer_sheet_uid: sheet_uid,
        ticket_number: row.text("ticket_number")?,
        ticket_info: row.text("ticket_info")?,
        ticket_manager_name: row.text("ticket_manager_name")?,
        date_process: row.opt_timestamp("date_process")?,
        percent_rate: row.opt_decimal("percent_rate")?,
        jewelry_type_uid: row.uuid("jewelry_type_uid")?,
        jewelry_proof_uid: row.uuid("jewelry_proof_uid")?,
        diamond_insert: row.opt_text("diamond_insert")?,
        weight: row.opt_decimal("weight")?,
        metal_weight: row.opt_decimal("metal_weight")?,
        estimate_cost: row.opt_decimal("estimate_cost")?,
        credit: row.opt_decimal("credit")?,
        jewelry_category_name: row.opt_text("jewelry_category_name")?,
        jewelry_category_code: row.opt_text("jewelry_category_code")?,
        is_deleted: row.is_deleted()?,
    })
}

/// Overwrite the scalar fields of a moved sheet. Status stays `Moved`.
fn replace_fields(existing: &mut TransferSheet, incoming: TransferSheet) {
    existing.number = incoming.number;
    existing.date_package = incoming.date_package;
    existing.manager_name = incoming.manager_name;
    existing.courier_name = incoming.courier_name;
    existing.division_uid = incoming.division_uid;
    existing.amount_of_money = incoming.amount_of_money;
    existing.is_deleted = incoming.is_deleted;
    existing.status = TransferSheetStatus::Moved;
}

/// Entity task for transfer sheets and their jewelry subjects.
pub struct TransferSheetTask;

impl TransferSheetTask {
    async fn fetch_subjects(
        &self,
        pass: &EntityPass<'_>,
        sheet_uid: Uuid,
    ) -> ExchangeResult<Vec<JewelrySubject>> {
        let rows = pass
            .source()
            .fetch_children(sheet_uid)
            .await
            .transport_context(|| format!("Failed to read jewelry subjects of sheet {}", sheet_uid))?;

        rows.iter()
            .map(|row| map_subject(row, sheet_uid).map_err(|e| pass.mapping_error(Some(sheet_uid), e)))
            .collect()
    }
}

#[async_trait]
impl EntityTask for TransferSheetTask {
    fn name(&self) -> &str {
        EntityKind::TransferSheet.name()
    }

    fn label(&self) -> &str {
        "transfer sheets"
    }

    async fn reconcile_and_apply(
        &self,
        pass: &mut EntityPass<'_>,
        changes: ChangeSet,
    ) -> ExchangeResult<()> {
        let snapshot = Snapshot::<TransferSheet>::load(pass.store()).await?;

        for row in changes {
            pass.observe(&row)?;
            let mut incoming =
                map_sheet(&row).map_err(|e| pass.mapping_error(row.uid().ok(), e))?;
            let uid = incoming.uid;
            let existing = snapshot.get(&uid);

            let decision = match guard(&incoming, existing) {
                SheetAction::Insert => {
                    incoming.subjects = self.fetch_subjects(pass, uid).await?;
                    Decision::Insert(incoming)
                }
                SheetAction::SoftDelete => Decision::SoftDelete(uid),
                SheetAction::Replace => {
                    let mut updated = existing.cloned().unwrap_or_default();
                    replace_fields(&mut updated, incoming);
                    updated.subjects = self.fetch_subjects(pass, uid).await?;
                    Decision::Update(updated)
                }
                SheetAction::Reject => Decision::Reject {
                    uid,
                    reason: ACCEPTED_SHEET_ERROR.to_string(),
                },
            };
            tracing::debug!("TransferSheet {}: {}", uid, decision.label());
            pass.apply(decision).await?;
        }
        Ok(())
    }
}
