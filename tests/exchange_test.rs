// ABOUTME: End-to-end exchange runs against the in-memory stores
// ABOUTME: Covers watermark bookkeeping, reconciliation, the transfer sheet guard and interruption

use mpr_exchange::exchange::{
    CallbackSink, Company, EntityKind, EventSink, ExchangeError, ExchangeEvent, ExchangeStatus,
    FieldValue, JewelryMetal, MemoryDestination, MemorySource, Record, RunOutcome, RunState,
    SourceRow, StopHandle, SyncOrchestrator, TransferSheet, TransferSheetStatus, Watermark,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

type EventLog = Arc<Mutex<Vec<ExchangeEvent>>>;

fn collecting_sink() -> (EventLog, Arc<dyn EventSink>) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let captured = log.clone();
    let sink = CallbackSink(move |event: ExchangeEvent| captured.lock().push(event));
    (log, Arc::new(sink))
}

fn orchestrator(
    source: &MemorySource,
    destination: &MemoryDestination,
    events: Arc<dyn EventSink>,
) -> SyncOrchestrator {
    SyncOrchestrator::new(
        Arc::new(source.clone()),
        Arc::new(destination.clone()),
        events,
    )
}

fn wm(value: u64) -> Watermark {
    Watermark::from_u64(value)
}

fn metal_row(uid: Uuid, version: u64, name: &str) -> SourceRow {
    SourceRow::new()
        .with("uid", uid)
        .with("version", wm(version))
        .with("is_deleted", false)
        .with("name", name)
        .with("short_name", FieldValue::Null)
}

fn company_row(uid: Uuid, version: u64, okpo: &str) -> SourceRow {
    SourceRow::new()
        .with("uid", uid)
        .with("version", wm(version))
        .with("is_deleted", false)
        .with("code", "01")
        .with("name", "Lombard")
        .with("full_name", "Lombard LLC")
        .with("inn", "7700000000")
        .with("ogrn", "1027700000000")
        .with("kpp", "770001001")
        .with("okpo", okpo)
        .with("okud", FieldValue::Null)
        .with("address", "Main street 1")
}

fn division_row(uid: Uuid, version: u64) -> SourceRow {
    SourceRow::new()
        .with("uid", uid)
        .with("version", wm(version))
        .with("is_deleted", false)
        .with("code", "02")
        .with("code_1c", FieldValue::Null)
        .with("name", "Central")
        .with("short_name", "C")
        .with("company_uid", FieldValue::Null)
}

fn sheet_row(uid: Uuid, version: u64, number: &str, is_deleted: bool) -> SourceRow {
    SourceRow::new()
        .with("uid", uid)
        .with("version", wm(version))
        .with("is_deleted", is_deleted)
        .with("number", number)
        .with("date_package", FieldValue::Null)
        .with("manager_name", "Petrov P.P.")
        .with("courier_name", "Sidorov S.S.")
        .with("division_uid", Uuid::nil())
        .with("amount_of_money", Decimal::new(150000, 2))
}

fn subject_row(uid: Uuid, ticket_number: &str) -> SourceRow {
    SourceRow::new()
        .with("uid", uid)
        .with("ticket_number", ticket_number)
        .with("ticket_info", "credit 1000 for 30 days")
        .with("ticket_manager_name", "Petrov P.P.")
        .with("date_process", FieldValue::Null)
        .with("percent_rate", Decimal::new(5, 1))
        .with("jewelry_type_uid", Uuid::nil())
        .with("jewelry_proof_uid", Uuid::nil())
        .with("diamond_insert", FieldValue::Null)
        .with("weight", Decimal::new(325, 2))
        .with("metal_weight", Decimal::new(300, 2))
        .with("estimate_cost", Decimal::new(9000, 0))
        .with("credit", Decimal::new(1000, 0))
        .with("jewelry_category_name", "Gold")
        .with("jewelry_category_code", "G")
        .with("is_deleted", false)
}

fn record_events(log: &EventLog) -> Vec<(ExchangeStatus, Option<Uuid>)> {
    log.lock()
        .iter()
        .filter(|e| matches!(e.status, ExchangeStatus::Insert | ExchangeStatus::Update))
        .map(|e| (e.status, e.entity_uid))
        .collect()
}

fn sheet(destination: &MemoryDestination, uid: Uuid) -> TransferSheet {
    match destination.record(EntityKind::TransferSheet, uid) {
        Some(Record::TransferSheet(sheet)) => sheet,
        other => panic!("expected transfer sheet {}, got {:?}", uid, other),
    }
}

#[tokio::test]
async fn test_metal_scenario_insert_update_and_watermark() {
    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(u1, 101, "Silver"));
    source.add_row("JewelryMetal", metal_row(u2, 105, "Gold 999"));
    // Already synced before the watermark.
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 90, "Platinum"));

    let destination = MemoryDestination::new().with_entity("JewelryMetal", 1, wm(100));
    destination.put_record(Record::JewelryMetal(JewelryMetal {
        uid: u2,
        name: "Gold".to_string(),
        ..Default::default()
    }));

    let (log, sink) = collecting_sink();
    let summary = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    assert_eq!(
        record_events(&log),
        vec![
            (ExchangeStatus::Insert, Some(u1)),
            (ExchangeStatus::Update, Some(u2))
        ]
    );
    assert_eq!(destination.watermark("JewelryMetal"), Some(wm(105)));
    assert_eq!(summary.entities[0].stats.fetched, 2);
    assert_eq!(summary.entities[0].persisted, Some(wm(105)));
    assert_eq!(summary.outcome, RunOutcome::Completed);
    match destination.record(EntityKind::JewelryMetal, u2) {
        Some(Record::JewelryMetal(metal)) => assert_eq!(metal.name, "Gold 999"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_event_order_for_one_entity() {
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 1, "Gold"));
    let destination = MemoryDestination::new().with_entity("JewelryMetal", 1, Watermark::ZERO);

    let (log, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    let events = log.lock();
    let comments: Vec<&str> = events.iter().map(|e| e.comment.as_str()).collect();
    assert_eq!(
        comments,
        vec![
            "Requesting jewelry metals from source",
            "Prepared 1 records for update",
            "Successful insert",
            "Data update finished",
            "Exchange finished",
        ]
    );
    let finishes: Vec<bool> = events.iter().map(|e| e.is_finish).collect();
    assert_eq!(finishes, vec![false, false, false, false, true]);
}

#[tokio::test]
async fn test_second_run_without_changes_is_idempotent() {
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 7, "Gold"));
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 9, "Silver"));
    let destination = MemoryDestination::new().with_entity("JewelryMetal", 1, Watermark::ZERO);

    let (first, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();
    assert_eq!(record_events(&first).len(), 2);

    let (second, sink) = collecting_sink();
    let summary = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();
    assert!(record_events(&second).is_empty());
    assert_eq!(summary.totals().fetched, 0);
    assert_eq!(destination.watermark("JewelryMetal"), Some(wm(9)));
}

#[tokio::test]
async fn test_entities_run_in_priority_order() {
    let source = MemorySource::new();
    let destination = MemoryDestination::new()
        .with_entity("TransferSheet", 10, Watermark::ZERO)
        .with_entity("Company", 1, Watermark::ZERO)
        .with_entity("JewelryType", 4, Watermark::ZERO)
        .with_entity("Division", 2, Watermark::ZERO);

    let (_log, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    assert_eq!(
        source.fetched(),
        vec!["Company", "Division", "JewelryType", "TransferSheet"]
    );
}

#[tokio::test]
async fn test_zero_watermark_is_never_persisted() {
    let source = MemorySource::new();
    let destination = MemoryDestination::new().with_entity("JewelryType", 1, Watermark::ZERO);

    let (_log, sink) = collecting_sink();
    let summary = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    assert!(destination.watermark_writes().is_empty());
    assert_eq!(summary.entities[0].persisted, None);
    assert_eq!(destination.watermark("JewelryType"), Some(Watermark::ZERO));
}

#[tokio::test]
async fn test_stop_is_honored_between_entities() {
    let source = MemorySource::new();
    source.add_row("Company", company_row(Uuid::new_v4(), 3, "1"));
    source.add_row("Division", division_row(Uuid::new_v4(), 4));
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 5, "Gold"));
    let destination = MemoryDestination::new()
        .with_entity("Company", 1, Watermark::ZERO)
        .with_entity("Division", 2, Watermark::ZERO)
        .with_entity("JewelryMetal", 3, Watermark::ZERO);

    // Request the stop while Division is being processed.
    let stop = StopHandle::new();
    let trigger = stop.clone();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let captured = log.clone();
    let sink = CallbackSink(move |event: ExchangeEvent| {
        if event.entity.as_deref() == Some("Division") && event.status == ExchangeStatus::Insert {
            trigger.request_stop();
        }
        captured.lock().push(event);
    });

    let orchestrator = orchestrator(&source, &destination, Arc::new(sink)).with_stop_handle(stop);
    let summary = orchestrator.start_exchange().await.unwrap();

    assert_eq!(source.fetched(), vec!["Company", "Division"]);
    assert_eq!(
        summary.outcome,
        RunOutcome::Interrupted {
            last_entity: "Division".to_string()
        }
    );
    assert_eq!(orchestrator.state(), RunState::Interrupted);
    assert_eq!(destination.watermark("Division"), Some(wm(4)));
    assert_eq!(destination.watermark("JewelryMetal"), Some(Watermark::ZERO));

    let events = log.lock();
    let last = events.last().unwrap();
    assert!(last.is_finish);
    assert_eq!(last.status, ExchangeStatus::Unknown);
    assert!(last.comment.contains("Division"));
    assert_eq!(events.iter().filter(|e| e.is_finish).count(), 1);
}

#[tokio::test]
async fn test_company_preserve_if_blank_and_insert_only_address() {
    let uid = Uuid::new_v4();
    let source = MemorySource::new();
    source.add_row("Company", company_row(uid, 12, "   "));
    let destination = MemoryDestination::new().with_entity("Company", 1, wm(10));
    destination.put_record(Record::Company(Company {
        uid,
        name: "Old name".to_string(),
        okpo: Some("12345678".to_string()),
        address: Some("Local address".to_string()),
        ..Default::default()
    }));

    let (_log, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    match destination.record(EntityKind::Company, uid) {
        Some(Record::Company(company)) => {
            assert_eq!(company.name, "Lombard");
            assert_eq!(company.okpo.as_deref(), Some("12345678"));
            assert_eq!(company.address.as_deref(), Some("Local address"));
            assert_eq!(company.inn.as_deref(), Some("7700000000"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_new_sheet_is_inserted_with_subjects() {
    let sheet_uid = Uuid::new_v4();
    let source = MemorySource::new();
    source.add_row("TransferSheet", sheet_row(sheet_uid, 20, "TS-1", false));
    source.add_child(sheet_uid, subject_row(Uuid::new_v4(), "02 1001"));
    source.add_child(sheet_uid, subject_row(Uuid::new_v4(), "02 1002"));
    let destination = MemoryDestination::new().with_entity("TransferSheet", 1, Watermark::ZERO);

    let (log, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    let stored = sheet(&destination, sheet_uid);
    assert_eq!(stored.status, TransferSheetStatus::Moved);
    assert_eq!(stored.subjects.len(), 2);
    assert!(stored.subjects.iter().all(|s| s.transfer_sheet_uid == sheet_uid));
    assert_eq!(
        record_events(&log),
        vec![(ExchangeStatus::Insert, Some(sheet_uid))]
    );
    // Sheet and subjects went in as one unit.
    assert_eq!(destination.commit_count(), 1);
}

#[tokio::test]
async fn test_moved_sheet_is_fully_replaced() {
    let sheet_uid = Uuid::new_v4();
    let old_subject = Uuid::new_v4();
    let new_subject = Uuid::new_v4();

    let destination = MemoryDestination::new().with_entity("TransferSheet", 1, wm(20));
    let mut existing = TransferSheet {
        uid: sheet_uid,
        number: "TS-1".to_string(),
        status: TransferSheetStatus::Moved,
        ..Default::default()
    };
    existing.subjects.push(mpr_exchange::exchange::JewelrySubject {
        uid: old_subject,
        transfer_sheet_uid: sheet_uid,
        ..Default::default()
    });
    destination.put_record(Record::TransferSheet(existing));

    let source = MemorySource::new();
    source.add_row("TransferSheet", sheet_row(sheet_uid, 21, "TS-1b", false));
    source.add_child(sheet_uid, subject_row(new_subject, "02 2001"));

    let (log, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    let stored = sheet(&destination, sheet_uid);
    assert_eq!(stored.number, "TS-1b");
    assert_eq!(stored.manager_name, "Petrov P.P.");
    let subjects: Vec<Uuid> = stored.subjects.iter().map(|s| s.uid).collect();
    assert_eq!(subjects, vec![new_subject]);
    assert_eq!(
        record_events(&log),
        vec![(ExchangeStatus::Update, Some(sheet_uid))]
    );
}

#[tokio::test]
async fn test_moved_sheet_soft_delete_only_flips_flag() {
    let sheet_uid = Uuid::new_v4();
    let subject_uid = Uuid::new_v4();
    let destination = MemoryDestination::new().with_entity("TransferSheet", 1, wm(20));
    let mut existing = TransferSheet {
        uid: sheet_uid,
        number: "TS-1".to_string(),
        manager_name: "Local manager".to_string(),
        status: TransferSheetStatus::Moved,
        ..Default::default()
    };
    existing.subjects.push(mpr_exchange::exchange::JewelrySubject {
        uid: subject_uid,
        transfer_sheet_uid: sheet_uid,
        ..Default::default()
    });
    destination.put_record(Record::TransferSheet(existing.clone()));

    let source = MemorySource::new();
    source.add_row("TransferSheet", sheet_row(sheet_uid, 22, "TS-CHANGED", true));
    source.add_child(sheet_uid, subject_row(Uuid::new_v4(), "02 3001"));

    let (log, sink) = collecting_sink();
    let summary = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    let stored = sheet(&destination, sheet_uid);
    assert!(stored.is_deleted);
    assert_eq!(stored.number, existing.number);
    assert_eq!(stored.manager_name, existing.manager_name);
    assert_eq!(stored.subjects, existing.subjects);
    assert_eq!(summary.entities[0].stats.soft_deleted, 1);
    assert_eq!(
        record_events(&log),
        vec![(ExchangeStatus::Update, Some(sheet_uid))]
    );
}

#[tokio::test]
async fn test_accepted_sheet_is_rejected_without_mutation() {
    let sheet_uid = Uuid::new_v4();
    let destination = MemoryDestination::new().with_entity("TransferSheet", 1, wm(20));
    let existing = TransferSheet {
        uid: sheet_uid,
        number: "TS-1".to_string(),
        status: TransferSheetStatus::Accepted,
        ..Default::default()
    };
    destination.put_record(Record::TransferSheet(existing.clone()));

    let source = MemorySource::new();
    source.add_row("TransferSheet", sheet_row(sheet_uid, 25, "TS-CHANGED", false));
    source.add_row("TransferSheet", sheet_row(sheet_uid, 26, "TS-CHANGED", true));

    let (log, sink) = collecting_sink();
    let summary = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    assert_eq!(sheet(&destination, sheet_uid), existing);
    assert_eq!(destination.commit_count(), 0);
    assert_eq!(summary.entities[0].stats.rejected, 2);

    let events = log.lock();
    let rejections: Vec<&ExchangeEvent> = events.iter().filter(|e| e.is_error()).collect();
    assert_eq!(rejections.len(), 2);
    for event in rejections {
        assert_eq!(event.status, ExchangeStatus::Update);
        assert_eq!(event.comment, "Update failed");
        assert!(event.error_text.as_deref().unwrap().contains("accepted"));
    }
    // Rejected versions still move the watermark.
    assert_eq!(destination.watermark("TransferSheet"), Some(wm(26)));
    assert_eq!(summary.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_duplicate_uid_reconciles_against_stale_snapshot() {
    let uid = Uuid::new_v4();
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(uid, 31, "Gold"));
    source.add_row("JewelryMetal", metal_row(uid, 32, "Gold 585"));
    let destination = MemoryDestination::new().with_entity("JewelryMetal", 1, wm(30));

    let (log, sink) = collecting_sink();
    orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    // Both rows see the snapshot from before the pass, so both are inserts.
    assert_eq!(
        record_events(&log),
        vec![
            (ExchangeStatus::Insert, Some(uid)),
            (ExchangeStatus::Insert, Some(uid))
        ]
    );
    match destination.record(EntityKind::JewelryMetal, uid) {
        Some(Record::JewelryMetal(metal)) => assert_eq!(metal.name, "Gold 585"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_source_failure_aborts_run_and_keeps_watermark() {
    let source = MemorySource::new();
    source.add_row("Company", company_row(Uuid::new_v4(), 3, "1"));
    source.add_row("Division", division_row(Uuid::new_v4(), 8));
    source.fail_fetch("Division");
    let destination = MemoryDestination::new()
        .with_entity("Company", 1, Watermark::ZERO)
        .with_entity("Division", 2, wm(5))
        .with_entity("JewelryMetal", 3, Watermark::ZERO);

    let (log, sink) = collecting_sink();
    let orchestrator = orchestrator(&source, &destination, sink);
    let err = orchestrator.start_exchange().await.unwrap_err();

    assert!(matches!(err, ExchangeError::Transport { .. }));
    assert_eq!(orchestrator.state(), RunState::Failed);
    assert_eq!(destination.watermark("Company"), Some(wm(3)));
    assert_eq!(destination.watermark("Division"), Some(wm(5)));
    assert_eq!(source.fetched(), vec!["Company", "Division"]);

    let events = log.lock();
    let last = events.last().unwrap();
    assert_eq!(last.status, ExchangeStatus::UnknownError);
    assert!(last.is_finish);
    assert!(last.error_text.as_deref().unwrap().contains("source connection lost"));
}

#[tokio::test]
async fn test_commit_failure_mid_entity_keeps_watermark() {
    let good = Uuid::new_v4();
    let bad = Uuid::new_v4();
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(good, 41, "Gold"));
    source.add_row("JewelryMetal", metal_row(bad, 42, "Silver"));
    let destination = MemoryDestination::new().with_entity("JewelryMetal", 1, wm(40));
    destination.fail_commit_for(bad);

    let (_log, sink) = collecting_sink();
    let err = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::Transport { .. }));
    assert!(destination.record(EntityKind::JewelryMetal, good).is_some());
    assert!(destination.record(EntityKind::JewelryMetal, bad).is_none());
    assert_eq!(destination.watermark("JewelryMetal"), Some(wm(40)));
    assert!(destination.watermark_writes().is_empty());
}

#[tokio::test]
async fn test_snapshot_failure_is_transport_error() {
    let source = MemorySource::new();
    source.add_row("JewelryType", metal_row(Uuid::new_v4(), 2, "Ring"));
    let destination = MemoryDestination::new().with_entity("JewelryType", 1, Watermark::ZERO);
    destination.fail_load(EntityKind::JewelryType);

    let (_log, sink) = collecting_sink();
    let err = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Transport { .. }));
    assert!(destination.watermark_writes().is_empty());
}

#[tokio::test]
async fn test_malformed_row_aborts_run() {
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 51, "Gold"));
    source.add_row(
        "JewelryMetal",
        SourceRow::new()
            .with("uid", "not-a-uid")
            .with("version", wm(52))
            .with("is_deleted", false)
            .with("name", "Broken")
            .with("short_name", FieldValue::Null),
    );
    let destination = MemoryDestination::new().with_entity("JewelryMetal", 1, wm(50));

    let (_log, sink) = collecting_sink();
    let err = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap_err();

    match err {
        ExchangeError::Mapping { entity, .. } => assert_eq!(entity, "JewelryMetal"),
        other => panic!("expected mapping error, got {}", other),
    }
    assert_eq!(destination.watermark("JewelryMetal"), Some(wm(50)));
}

#[tokio::test]
async fn test_unknown_entity_is_skipped() {
    let source = MemorySource::new();
    source.add_row("JewelryMetal", metal_row(Uuid::new_v4(), 3, "Gold"));
    let destination = MemoryDestination::new()
        .with_entity("Metal", 0, Watermark::ZERO)
        .with_entity("JewelryMetal", 1, Watermark::ZERO);

    let (log, sink) = collecting_sink();
    let summary = orchestrator(&source, &destination, sink)
        .start_exchange()
        .await
        .unwrap();

    assert_eq!(summary.skipped, vec!["Metal".to_string()]);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(source.fetched(), vec!["JewelryMetal"]);
    assert_eq!(destination.watermark("JewelryMetal"), Some(wm(3)));

    let events = log.lock();
    let skipped = events
        .iter()
        .find(|e| e.entity.as_deref() == Some("Metal"))
        .unwrap();
    assert_eq!(skipped.status, ExchangeStatus::UnknownError);
    assert!(!skipped.is_finish);
    assert!(events.last().unwrap().is_finish);
}
