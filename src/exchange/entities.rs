// ABOUTME: Per-entity mapping strategies for the plain (non-composite) exchange entities
// ABOUTME: Each strategy maps a source row to a destination record and merges it onto an existing one

use super::model::{
    Company, DestinationRecord, Division, EntityKind, JewelryMetal, JewelryProof, JewelryType,
};
use super::reconciler::assign_if_present;
use super::row::{MappingError, SourceRow};

/// Field rules of one entity kind, plugged into the generic entity task.
pub trait EntityMapping: Send + Sync + 'static {
    type Record: DestinationRecord;

    /// Plural label used in progress events ("requesting companies from source").
    const LABEL: &'static str;

    fn kind() -> EntityKind {
        <Self::Record as DestinationRecord>::KIND
    }

    /// Build a destination record from a source row.
    fn map_row(row: &SourceRow) -> Result<Self::Record, MappingError>;

    /// Copy the incoming fields onto an existing record.
    ///
    /// Fields not touched here keep their destination value.
    fn merge(existing: &mut Self::Record, incoming: Self::Record);
}

pub struct CompanyMapping;

impl EntityMapping for CompanyMapping {
    type Record = Company;
    const LABEL: &'static str = "companies";

    fn map_row(row: &SourceRow) -> Result<Company, MappingError> {
        Ok(Company {
            uid: row.uid()?,
            is_deleted: row.is_deleted()?,
            code: row.opt_text("code")?,
            name: row.text("name")?,
            full_name: row.opt_text("full_name")?,
            inn: row.opt_text("inn")?,
            ogrn: row.opt_text("ogrn")?,
            kpp: row.opt_text("kpp")?,
            okpo: row.opt_text("okpo")?,
            okud: row.opt_text("okud")?,
            address: row.opt_text("address")?,
        })
    }

    // Address is only written on insert.
    fn merge(existing: &mut Company, incoming: Company) {
        existing.is_deleted = incoming.is_deleted;
        existing.code = incoming.code;
        existing.full_name = incoming.full_name;
        existing.inn = incoming.inn;
        existing.kpp = incoming.kpp;
        existing.name = incoming.name;
        existing.ogrn = incoming.ogrn;
        assign_if_present(&mut existing.okpo, incoming.okpo);
        assign_if_present(&mut existing.okud, incoming.okud);
    }
}

pub struct DivisionMapping;

impl EntityMapping for DivisionMapping {
    type Record = Division;
    const LABEL: &'static str = "divisions";

    fn map_row(row: &SourceRow) -> Result<Division, MappingError> {
        Ok(Division {
            uid: row.uid()?,
            is_deleted: row.is_deleted()?,
            code: row.opt_text("code")?,
            code_1c: row.opt_text("code_1c")?,
            name: row.text("name")?,
            short_name: row.opt_text("short_name")?,
            company_uid: row.opt_uuid("company_uid")?,
        })
    }

    fn merge(existing: &mut Division, incoming: Division) {
        existing.is_deleted = incoming.is_deleted;
        existing.code = incoming.code;
        existing.code_1c = incoming.code_1c;
        existing.company_uid = incoming.company_uid;
        existing.name = incoming.name;
        existing.short_name = incoming.short_name;
    }
}

pub struct JewelryMetalMapping;

impl EntityMapping for JewelryMetalMapping {
    type Record = JewelryMetal;
    const LABEL: &'static str = "jewelry metals";

    fn map_row(row: &SourceRow) -> Result<JewelryMetal, MappingError> {
        Ok(JewelryMetal {
            uid: row.uid()?,
            is_deleted: row.is_deleted()?,
            name: row.text("name")?,
            short_name: row.opt_text("short_name")?,
        })
    }

    fn merge(existing: &mut JewelryMetal, incoming: JewelryMetal) {
        existing.is_deleted = incoming.is_deleted;
        existing.name = incoming.name;
        existing.short_name = incoming.short_name;
    }
}

pub struct JewelryProofMapping;

impl EntityMapping for JewelryProofMapping {
    type Record = JewelryProof;
    const LABEL: &'static str = "jewelry proofs";

    fn map_row(row: &SourceRow) -> Result<JewelryProof, MappingError> {
        Ok(JewelryProof {
            uid: row.uid()?,
            is_deleted: row.is_deleted()?,
            code: row.opt_text("code")?,
            name: row.text("name")?,
            cleanness: row.opt_decimal("cleanness")?,
            jewelry_metal_uid: row.opt_uuid("jewelry_metal_uid")?,
        })
    }

    fn merge(existing: &mut JewelryProof, incoming: JewelryProof) {
        existing.is_deleted = incoming.is_deleted;
        existing.name = incoming.name;
        existing.cleanness = incoming.cleanness;
        existing.code = incoming.code;
        existing.jewelry_metal_uid = incoming.jewelry_metal_uid;
    }
}

pub struct JewelryTypeMapping;

impl EntityMapping for JewelryTypeMapping {
    type Record = JewelryType;
    const LABEL: &'static str = "jewelry types";

    fn map_row(row: &SourceRow) -> Result<JewelryType, MappingError> {
        Ok(JewelryType {
            uid: row.uid()?,
            is_deleted: row.is_deleted()?,
            name: row.text("name")?,
            short_name: row.opt_text("short_name")?,
        })
    }

    fn merge(existing: &mut JewelryType, incoming: JewelryType) {
        existing.is_deleted = incoming.is_deleted;
        existing.name = incoming.name;
        existing.short_name = incoming.short_name;
    }
}
