use granite::disk::DiskStore;
use granite::{Engine, EngineConfig, EngineError, Row};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn small_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(dir.path());
    config.buffer_pool_size = 8;
    config.page_capacity = 4;
    config.lock_timeout = Duration::from_millis(200);
    config
}

fn open_engine(dir: &TempDir) -> Engine {
    let engine = Engine::open(small_config(dir)).expect("engine opens");
    engine.recover().expect("recovery succeeds");
    engine
}

fn row(id: i64, payload: &str) -> Row {
    Row::new(id, payload.as_bytes().to_vec())
}

#[test]
fn insert_read_round_trip_within_and_across_transactions() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    engine.insert(&mut tx, row(1, "alice,20")).unwrap();
    engine.insert(&mut tx, row(2, "bob,25")).unwrap();
    // a transaction sees its own writes
    assert_eq!(engine.read(&mut tx, 1).unwrap(), row(1, "alice,20"));
    engine.commit(&mut tx).unwrap();

    let mut tx = engine.begin();
    assert_eq!(engine.read(&mut tx, 2).unwrap(), row(2, "bob,25"));
    engine.commit(&mut tx).unwrap();
}

#[test]
fn duplicate_insert_is_rejected_and_the_transaction_stays_usable() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    engine.insert(&mut tx, row(1, "first")).unwrap();
    let err = engine.insert(&mut tx, row(1, "second")).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateRowId(1)));

    // the failure did not poison the transaction
    engine.insert(&mut tx, row(2, "fine")).unwrap();
    engine.commit(&mut tx).unwrap();

    let mut tx = engine.begin();
    assert_eq!(engine.read(&mut tx, 1).unwrap(), row(1, "first"));
    engine.rollback(&mut tx).unwrap();
}

#[test]
fn absent_rows_surface_missing_for_every_operation() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    assert!(matches!(
        engine.read(&mut tx, 42).unwrap_err(),
        EngineError::Missing(42)
    ));
    assert!(matches!(
        engine.update(&mut tx, 42, row(42, "x")).unwrap_err(),
        EngineError::Missing(42)
    ));
    assert!(matches!(
        engine.delete(&mut tx, 42).unwrap_err(),
        EngineError::Missing(42)
    ));
    // still usable afterwards
    engine.insert(&mut tx, row(42, "now exists")).unwrap();
    engine.commit(&mut tx).unwrap();
}

#[test]
fn update_and_delete_round_trips() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    engine.insert(&mut tx, row(1, "v1")).unwrap();
    engine.commit(&mut tx).unwrap();

    let mut tx = engine.begin();
    engine.update(&mut tx, 1, row(1, "v2")).unwrap();
    assert_eq!(engine.read(&mut tx, 1).unwrap(), row(1, "v2"));
    engine.delete(&mut tx, 1).unwrap();
    assert!(matches!(
        engine.read(&mut tx, 1).unwrap_err(),
        EngineError::Missing(1)
    ));
    engine.commit(&mut tx).unwrap();

    let mut tx = engine.begin();
    assert!(matches!(
        engine.read(&mut tx, 1).unwrap_err(),
        EngineError::Missing(1)
    ));
    engine.rollback(&mut tx).unwrap();
}

#[test]
fn rollback_restores_the_visible_state_before_begin() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut setup = engine.begin();
    engine.insert(&mut setup, row(1, "alice,30")).unwrap();
    engine.insert(&mut setup, row(2, "bob,25")).unwrap();
    engine.commit(&mut setup).unwrap();

    let mut tx = engine.begin();
    engine.update(&mut tx, 1, row(1, "alice,31")).unwrap();
    engine.insert(&mut tx, row(3, "charlie,35")).unwrap();
    engine.delete(&mut tx, 2).unwrap();
    engine.rollback(&mut tx).unwrap();
    // rolling back twice is a no-op
    engine.rollback(&mut tx).unwrap();

    let mut check = engine.begin();
    assert_eq!(engine.read(&mut check, 1).unwrap(), row(1, "alice,30"));
    assert_eq!(engine.read(&mut check, 2).unwrap(), row(2, "bob,25"));
    assert!(matches!(
        engine.read(&mut check, 3).unwrap_err(),
        EngineError::Missing(3)
    ));
    engine.commit(&mut check).unwrap();
}

#[test]
fn a_full_page_spills_inserts_onto_a_new_page() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    // page_capacity is 4, so 10 rows need at least 3 pages
    let mut tx = engine.begin();
    for id in 1..=10 {
        engine.insert(&mut tx, row(id, "payload")).unwrap();
    }
    engine.commit(&mut tx).unwrap();
    engine.checkpoint().unwrap();

    let disk = DiskStore::open(dir.path()).unwrap();
    assert!(disk.enumerate().unwrap().len() >= 3);

    let mut tx = engine.begin();
    for id in 1..=10 {
        assert_eq!(engine.read(&mut tx, id).unwrap(), row(id, "payload"));
    }
    engine.commit(&mut tx).unwrap();
}

#[test]
fn an_oversized_working_set_exhausts_the_pool() {
    let dir = tempdir().unwrap();
    let mut config = small_config(&dir);
    config.buffer_pool_size = 2;
    config.page_capacity = 1;
    let engine = Engine::open(config).unwrap();
    engine.recover().unwrap();

    // each insert dirties its own page, and pages dirtied by an in-flight
    // transaction cannot be evicted
    let mut tx = engine.begin();
    engine.insert(&mut tx, row(1, "a")).unwrap();
    engine.insert(&mut tx, row(2, "b")).unwrap();
    let err = engine.insert(&mut tx, row(3, "c")).unwrap_err();
    assert!(matches!(err, EngineError::BufferExhausted));
    engine.rollback(&mut tx).unwrap();

    // after the rollback the frames are reclaimable again
    let mut tx = engine.begin();
    engine.insert(&mut tx, row(4, "d")).unwrap();
    engine.commit(&mut tx).unwrap();
}

#[test]
fn operations_on_a_finished_transaction_are_rejected() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    engine.insert(&mut tx, row(1, "x")).unwrap();
    engine.commit(&mut tx).unwrap();

    assert!(matches!(
        engine.insert(&mut tx, row(2, "y")).unwrap_err(),
        EngineError::InvalidState(_)
    ));
    assert!(matches!(
        engine.commit(&mut tx).unwrap_err(),
        EngineError::InvalidState(_)
    ));
    assert!(matches!(
        engine.rollback(&mut tx).unwrap_err(),
        EngineError::InvalidState(_)
    ));
}

#[test]
fn a_read_only_commit_leaves_no_trace_in_the_log() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    engine.insert(&mut tx, row(1, "x")).unwrap();
    engine.commit(&mut tx).unwrap();

    let disk = DiskStore::open(dir.path()).unwrap();
    let log_before = disk.read_artifact("redo_log").unwrap();

    let mut reader = engine.begin();
    assert_eq!(engine.read(&mut reader, 1).unwrap(), row(1, "x"));
    engine.commit(&mut reader).unwrap();

    assert_eq!(engine.active_transactions(), 0);
    assert_eq!(disk.read_artifact("redo_log").unwrap(), log_before);
}

#[test]
fn close_checkpoints_so_a_fresh_engine_reads_without_replay() {
    let dir = tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut tx = engine.begin();
    engine.insert(&mut tx, row(7, "kept")).unwrap();
    engine.commit(&mut tx).unwrap();
    engine.close().unwrap();

    // after an orderly close the redo log is truncated and the pages and
    // index are in place
    let disk = DiskStore::open(dir.path()).unwrap();
    assert!(!disk.enumerate().unwrap().is_empty());

    let engine = open_engine(&dir);
    let mut tx = engine.begin();
    assert_eq!(engine.read(&mut tx, 7).unwrap(), row(7, "kept"));
    engine.commit(&mut tx).unwrap();
}
