//! Integration tests for the hash-chained audit ledger
//!
//! The chain per target is what makes the trail tamper-evident: every entry
//! carries the previous entry's hash, the first entry starts from the empty
//! hash, and each entry's own hash must recompute from its stored payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use sled::open;
use tempfile::tempdir;

use armory_custody::audit::{EventKind, TargetRef};
use armory_custody::custody::{Actor, ItemSpec};
use armory_custody::error::CustodyError;
use armory_custody::inventory::{AmmunitionLot, AmmunitionStock};
use armory_custody::policy::PolicyConfig;
use armory_custody::service::{CustodyService, DEFAULT_LOCATION};

fn seeded_service(db: Arc<sled::Db>) -> anyhow::Result<CustodyService> {
    let service = CustodyService::new(db, PolicyConfig::default());
    let store = service.store();
    store.put_lot(&AmmunitionLot::new("lot_9mm", "9mm", "L-2025-01"))?;
    store.put_stock(&AmmunitionStock::empty("lot_9mm", DEFAULT_LOCATION).with_available(100))?;
    Ok(service)
}

#[test]
fn lifecycle_emits_one_chained_event_per_transition() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("chain_lifecycle.db"))?);
    db.clear()?;
    let service = seeded_service(db)?;

    let requester = Actor::new("user_requester");
    let supervisor = Actor::new("user_supervisor");

    let record = service
        .request_custody(
            &requester,
            None,
            &[ItemSpec::ammunition("lot_9mm", 30)],
            None,
            "range day",
            "",
        )
        .context("request failed")?;
    let record = service.approve_custody(&record.id, &supervisor, None)?;
    let record = service.deliver_custody(&record.id, &supervisor, None)?;
    let mut returned = BTreeMap::new();
    returned.insert("lot_9mm".to_string(), 30);
    let record =
        service.return_custody(&record.id, &supervisor, None, Some(&returned), None, None)?;

    let target = TargetRef::custody(&record.id);
    let events = service.ledger().events_for(&target)?;

    assert_eq!(events.len(), 4);
    assert_eq!(
        events.iter().map(|e| e.kind).collect::<Vec<_>>(),
        vec![
            EventKind::Solicitar,
            EventKind::Aprovar,
            EventKind::Entregar,
            EventKind::Devolver,
        ]
    );

    // the request event opens the chain with no prior state
    assert_eq!(events[0].hash_prev, "");
    assert!(events[0].before.is_none());
    assert!(events[0].after.is_some());

    for pair in events.windows(2) {
        assert_eq!(pair[1].hash_prev, pair[0].hash_current);
    }
    assert_eq!(service.ledger().verify_chain(&target)?, 4);

    // the approval snapshots capture the transition and the item list
    let before: serde_json::Value = serde_json::from_str(events[1].before.as_deref().unwrap())?;
    let after: serde_json::Value = serde_json::from_str(events[1].after.as_deref().unwrap())?;
    assert_eq!(before["status"], "PENDING");
    assert_eq!(after["status"], "APPROVED");
    assert_eq!(after["items"][0]["kind"], "AMMUNITION");
    assert_eq!(after["items"][0]["quantity"], 30);
    assert_eq!(after["requester"], "user_requester");

    Ok(())
}

#[test]
fn failed_attempts_leave_no_event_behind() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("chain_failures.db"))?);
    db.clear()?;
    let service = seeded_service(db)?;

    let requester = Actor::new("user_requester");
    let supervisor = Actor::new("user_supervisor");

    let record = service.request_custody(
        &requester,
        None,
        &[ItemSpec::ammunition("lot_9mm", 30)],
        None,
        "",
        "",
    )?;
    service.approve_custody(&record.id, &supervisor, None)?;

    // approving twice is a precondition failure and must not be logged
    let err = service
        .approve_custody(&record.id, &supervisor, None)
        .unwrap_err();
    assert!(matches!(err, CustodyError::Precondition(_)), "got {err:?}");

    let events = service.ledger().events_for(&TargetRef::custody(&record.id))?;
    assert_eq!(events.len(), 2);

    Ok(())
}

#[test]
fn replaying_a_persisted_event_is_rejected() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("chain_replay.db"))?);
    db.clear()?;
    let service = seeded_service(db)?;

    let requester = Actor::new("user_requester");
    let record = service.request_custody(
        &requester,
        None,
        &[ItemSpec::ammunition("lot_9mm", 10)],
        None,
        "",
        "",
    )?;

    let target = TargetRef::custody(&record.id);
    let events = service.ledger().events_for(&target)?;
    assert_eq!(events.len(), 1);

    let err = service.ledger().append(&events[0]).unwrap_err();
    assert!(matches!(err, CustodyError::AppendOnly { .. }), "got {err:?}");

    // the rejection left the ledger exactly as it was
    let after = service.ledger().events_for(&target)?;
    assert_eq!(after, events);

    Ok(())
}

#[test]
fn standalone_events_chain_independently_per_target() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("chain_targets.db"))?);
    db.clear()?;
    let service = seeded_service(db)?;
    let ledger = service.ledger();

    let asset_target = TargetRef::asset("asset_pistol");
    let first = ledger.log_event(
        Some("user_armorer"),
        asset_target.clone(),
        EventKind::Outro,
        "annual inspection",
        None,
        Some(serde_json::json!({"condition": "good"})),
        None,
    )?;
    let second = ledger.log_event(
        Some("user_armorer"),
        asset_target.clone(),
        EventKind::Outro,
        "barrel swap",
        Some(serde_json::json!({"condition": "good"})),
        Some(serde_json::json!({"condition": "refitted"})),
        None,
    )?;

    assert_eq!(first.hash_prev, "");
    assert_eq!(second.hash_prev, first.hash_current);
    assert_eq!(ledger.verify_chain(&asset_target)?, 2);

    // a different target starts its own chain from scratch
    let lot_target = TargetRef::lot("lot_9mm");
    let lot_event = ledger.log_event(
        None,
        lot_target.clone(),
        EventKind::Outro,
        "expiry inspection",
        None,
        None,
        None,
    )?;
    assert_eq!(lot_event.hash_prev, "");
    assert_eq!(ledger.verify_chain(&lot_target)?, 1);

    Ok(())
}

#[test]
fn tampering_and_deletion_gaps_are_detected() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("chain_tamper.db"))?);
    db.clear()?;
    let service = seeded_service(db.clone())?;
    let ledger = service.ledger();

    let target = TargetRef::asset("asset_pistol");
    for note in ["inspection", "cleaning", "test fire"] {
        ledger.log_event(
            Some("user_armorer"),
            target.clone(),
            EventKind::Outro,
            note,
            None,
            Some(serde_json::json!({ "note": note })),
            None,
        )?;
    }
    assert_eq!(ledger.verify_chain(&target)?, 3);

    // rewrite the second entry's payload in place; its stored hash no
    // longer recomputes
    let events = ledger.events_for(&target)?;
    let mut tampered = events[1].clone();
    tampered.after = Some("{\"note\":\"nothing happened\"}".to_string());
    let key = format!("audit/{}/{:020}", target.ident(), tampered.seq);
    db.insert(key.as_bytes(), minicbor::to_vec(&tampered).unwrap())?;

    let err = ledger.verify_chain(&target).unwrap_err();
    assert!(matches!(err, CustodyError::ChainBroken { seq: 2, .. }), "got {err:?}");

    // restore, then drop the first entry: the survivor no longer starts
    // from the empty hash
    db.insert(key.as_bytes(), minicbor::to_vec(&events[1]).unwrap())?;
    assert_eq!(ledger.verify_chain(&target)?, 3);

    let first_key = format!("audit/{}/{:020}", target.ident(), events[0].seq);
    db.remove(first_key.as_bytes())?;
    let err = ledger.verify_chain(&target).unwrap_err();
    assert!(matches!(err, CustodyError::ChainBroken { .. }), "got {err:?}");

    Ok(())
}
