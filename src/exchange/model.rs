// ABOUTME: Destination-side data model for the exchange
// ABOUTME: Exchange entities with their watermarks and the records each entity kind writes

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::watermark::Watermark;

/// The entity kinds the exchange knows how to synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Company,
    Division,
    JewelryMetal,
    JewelryProof,
    JewelryType,
    TransferSheet,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Company,
        EntityKind::Division,
        EntityKind::JewelryMetal,
        EntityKind::JewelryProof,
        EntityKind::JewelryType,
        EntityKind::TransferSheet,
    ];

    /// Name used in the exchange entity table to bind a row to its task.
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Company => "Company",
            EntityKind::Division => "Division",
            EntityKind::JewelryMetal => "JewelryMetal",
            EntityKind::JewelryProof => "JewelryProof",
            EntityKind::JewelryType => "JewelryType",
            EntityKind::TransferSheet => "TransferSheet",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.name() == value)
            .ok_or_else(|| format!("unknown entity kind: {}", value))
    }
}

/// One row of the exchange entity table: what to sync, in which order, and
/// how far it has been synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEntity {
    pub name: String,
    /// Lower priorities are synchronized first.
    pub priority: i32,
    pub last_state: Watermark,
}

impl ExchangeEntity {
    pub fn new(name: &str, priority: i32, last_state: Watermark) -> Self {
        Self {
            name: name.to_string(),
            priority,
            last_state,
        }
    }
}

/// Sort exchange entities into orchestration order.
///
/// The sort is stable so entities sharing a priority keep their store order.
pub fn order_by_priority(entities: &mut [ExchangeEntity]) {
    entities.sort_by_key(|entity| entity.priority);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub uid: Uuid,
    pub is_deleted: bool,
    pub code: Option<String>,
    pub name: String,
    pub full_name: Option<String>,
    pub inn: Option<String>,
    pub ogrn: Option<String>,
    pub kpp: Option<String>,
    pub okpo: Option<String>,
    pub okud: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Division {
    pub uid: Uuid,
    pub is_deleted: bool,
    pub code: Option<String>,
    pub code_1c: Option<String>,
    pub name: String,
    pub short_name: Option<String>,
    pub company_uid: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JewelryMetal {
    pub uid: Uuid,
    pub is_deleted: bool,
    pub name: String,
    pub short_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JewelryProof {
    pub uid: Uuid,
    pub is_deleted: bool,
    pub code: Option<String>,
    pub name: String,
    pub cleanness: Option<Decimal>,
    pub jewelry_metal_uid: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JewelryType {
    pub uid: Uuid,
    pub is_deleted: bool,
    pub name: String,
    pub short_name: Option<String>,
}

/// Lifecycle of a transfer sheet on the destination side.
///
/// Every sheet arrives as `Moved`. `Accepted` is set by the receiving side and
/// freezes the sheet against further synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferSheetStatus {
    #[default]
    Moved,
    Accepted,
}

impl TransferSheetStatus {
    pub fn code(&self) -> i16 {
        match self {
            TransferSheetStatus::Moved => 1,
            TransferSheetStatus::Accepted => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(TransferSheetStatus::Moved),
            2 => Some(TransferSheetStatus::Accepted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSheet {
    pub uid: Uuid,
    pub number: String,
    pub date_package: Option<NaiveDateTime>,
    pub manager_name: String,
    pub courier_name: String,
    pub division_uid: Uuid,
    pub amount_of_money: Option<Decimal>,
    pub is_deleted: bool,
    pub status: TransferSheetStatus,
    /// Items carried by the sheet. Owned exclusively by the sheet.
    pub subjects: Vec<JewelrySubject>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JewelrySubject {
    pub uid: Uuid,
    pub transfer_sheet_uid: Uuid,
    pub ticket_number: String,
    pub ticket_info: String,
    pub ticket_manager_name: String,
    pub date_process: Option<NaiveDateTime>,
    pub percent_rate: Option<Decimal>,
    pub jewelry_type_uid: Uuid,
    pub jewelry_proof_uid: Uuid,
    pub diamond_insert: Option<String>,
    pub weight: Option<Decimal>,
    pub metal_weight: Option<Decimal>,
    pub estimate_cost: Option<Decimal>,
    pub credit: Option<Decimal>,
    pub jewelry_category_name: Option<String>,
    pub jewelry_category_code: Option<String>,
    pub is_deleted: bool,
}

/// Any destination record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Company(Company),
    Division(Division),
    JewelryMetal(JewelryMetal),
    JewelryProof(JewelryProof),
    JewelryType(JewelryType),
    TransferSheet(TransferSheet),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Company(_) => EntityKind::Company,
            Record::Division(_) => EntityKind::Division,
            Record::JewelryMetal(_) => EntityKind::JewelryMetal,
            Record::JewelryProof(_) => EntityKind::JewelryProof,
            Record::JewelryType(_) => EntityKind::JewelryType,
            Record::TransferSheet(_) => EntityKind::TransferSheet,
        }
    }

    pub fn uid(&self) -> Uuid {
        match self {
            Record::Company(r) => r.uid,
            Record::Division(r) => r.uid,
            Record::JewelryMetal(r) => r.uid,
            Record::JewelryProof(r) => r.uid,
            Record::JewelryType(r) => r.uid,
            Record::TransferSheet(r) => r.uid,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Record::Company(r) => r.is_deleted,
            Record::Division(r) => r.is_deleted,
            Record::JewelryMetal(r) => r.is_deleted,
            Record::JewelryProof(r) => r.is_deleted,
            Record::JewelryType(r) => r.is_deleted,
            Record::TransferSheet(r) => r.is_deleted,
        }
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        match self {
            Record::Company(r) => r.is_deleted = deleted,
            Record::Division(r) => r.is_deleted = deleted,
            Record::JewelryMetal(r) => r.is_deleted = deleted,
            Record::JewelryProof(r) => r.is_deleted = deleted,
            Record::JewelryType(r) => r.is_deleted = deleted,
            Record::TransferSheet(r) => r.is_deleted = deleted,
        }
    }
}

/// A concrete destination record type that can travel as a [`Record`].
pub trait DestinationRecord: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn uid(&self) -> Uuid;

    fn into_record(self) -> Record;

    fn from_record(record: Record) -> Option<Self>;
}

macro_rules! destination_record {
    ($ty:ident) => {
        impl DestinationRecord for $ty {
            const KIND: EntityKind = EntityKind::$ty;

            fn uid(&self) -> Uuid {
                self.uid
            }

            fn into_record(self) -> Record {
                Record::$ty(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

destination_record!(Company);
destination_record!(Division);
destination_record!(JewelryMetal);
destination_record!(JewelryProof);
destination_record!(JewelryType);
destination_record!(TransferSheet);
