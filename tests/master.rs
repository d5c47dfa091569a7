//! Master coordinator: dispatch envelope, lock brokerage, id batches,
//! slave commits, store copy, and the idle-transaction reaper.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sable::records::NodeRecord;
use sable::tx::encode_stream;
use sable::{
    Command, GraphStore, IdType, LockResult, LockType, MasterConfig, MasterCoordinator, Response,
    Result, SlaveContext, StoreConfig, StoreWriter, DATA_SOURCE_NAME, NO_MASTER,
};
use tempfile::TempDir;

fn master(dir: &TempDir) -> Result<MasterCoordinator> {
    master_with_config(dir, MasterConfig::default())
}

fn master_with_config(dir: &TempDir, config: MasterConfig) -> Result<MasterCoordinator> {
    let store = Arc::new(GraphStore::open_with_config(
        dir.path(),
        StoreConfig {
            machine_id: 1,
            ..StoreConfig::default()
        },
    )?);
    MasterCoordinator::with_config(store, config)
}

fn ctx(session: i64, machine: i32, applied: u64) -> SlaveContext {
    SlaveContext::new(
        session,
        machine,
        0,
        vec![(DATA_SOURCE_NAME.to_owned(), applied)],
    )
}

fn seed_node(master: &MasterCoordinator, node_id: u64) -> Result<u64> {
    let store = master.store();
    let mut tx = store.begin_tx();
    tx.node_create(node_id);
    store.commit(&mut tx)
}

fn node_command_stream(node_id: u64) -> Vec<u8> {
    let mut record = NodeRecord::new(node_id);
    record.in_use = true;
    record.created = true;
    encode_stream(&[Command::Node(record)])
}

#[test]
fn interleaved_contexts_keep_their_own_transactions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let slave_a = ctx(1, 2, 0);
    let slave_b = ctx(2, 3, 0);

    // Interleave requests for two contexts on one worker thread; each
    // context's transaction keeps its own lock state.
    let response = master.acquire_node_read_lock(&slave_a, &[1])?;
    assert_eq!(response.response, LockResult::Granted);
    let response = master.acquire_node_read_lock(&slave_b, &[2])?;
    assert_eq!(response.response, LockResult::Granted);
    // The upgrade only succeeds if slave A's transaction still owns the
    // read lock it took two requests ago.
    let response = master.acquire_node_write_lock(&slave_a, &[1])?;
    assert_eq!(response.response, LockResult::Granted);

    let ongoing = master.ongoing_transactions();
    assert_eq!(ongoing[&2], vec![slave_a.clone()]);
    assert_eq!(ongoing[&3], vec![slave_b.clone()]);

    master.finish_transaction(&slave_a)?;
    master.finish_transaction(&slave_b)?;
    assert!(master.ongoing_transactions().is_empty());
    master.shutdown();
    Ok(())
}

#[test]
fn unknown_resource_code_is_not_locked() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let slave = ctx(1, 2, 0);
    let response = master.acquire_lock(&slave, LockType::Write, 99, &[1])?;
    assert_eq!(response.response, LockResult::NotLocked);
    master.shutdown();
    Ok(())
}

#[test]
fn lock_contention_is_released_by_finish() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = Arc::new(master(&dir)?);
    let holder = ctx(1, 2, 0);
    let waiter = ctx(2, 3, 0);

    let response = master.acquire_node_write_lock(&holder, &[7])?;
    assert_eq!(response.response, LockResult::Granted);

    let contender = Arc::clone(&master);
    let waiter_clone = waiter.clone();
    let handle =
        thread::spawn(move || contender.acquire_node_write_lock(&waiter_clone, &[7]));
    thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished());

    master.finish_transaction(&holder)?;
    let response = handle.join().expect("waiter thread")?;
    assert_eq!(response.response, LockResult::Granted);
    master.finish_transaction(&waiter)?;
    master.shutdown();
    Ok(())
}

#[test]
fn deadlock_is_returned_as_a_value() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = Arc::new(master(&dir)?);
    let slave_a = ctx(1, 2, 0);
    let slave_b = ctx(2, 3, 0);

    assert_eq!(
        master.acquire_node_write_lock(&slave_a, &[1])?.response,
        LockResult::Granted
    );
    assert_eq!(
        master.acquire_node_write_lock(&slave_b, &[2])?.response,
        LockResult::Granted
    );

    // Slave A blocks on node 2, then slave B closing the cycle on node 1
    // gets a structured deadlock response rather than an error.
    let blocked = Arc::clone(&master);
    let slave_a_clone = slave_a.clone();
    let handle = thread::spawn(move || blocked.acquire_node_write_lock(&slave_a_clone, &[2]));
    thread::sleep(Duration::from_millis(100));

    let response = master.acquire_node_write_lock(&slave_b, &[1])?;
    assert!(matches!(response.response, LockResult::Deadlock(_)));

    master.finish_transaction(&slave_b)?;
    let response = handle.join().expect("blocked thread")?;
    assert_eq!(response.response, LockResult::Granted);
    master.finish_transaction(&slave_a)?;
    master.shutdown();
    Ok(())
}

#[test]
fn idle_transactions_are_reaped_and_contexts_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master_with_config(
        &dir,
        MasterConfig {
            reap_interval: Duration::from_millis(50),
            idle_threshold: Duration::from_millis(150),
            id_grab_size: 1000,
        },
    )?;
    let slave = ctx(1, 2, 0);

    let response = master.acquire_node_write_lock(&slave, &[1])?;
    assert_eq!(response.response, LockResult::Granted);
    assert_eq!(master.ongoing_transactions().len(), 1);

    thread::sleep(Duration::from_millis(500));
    assert!(master.ongoing_transactions().is_empty());

    // The rollback released the lock, and the same context begins a fresh
    // transaction on its next request.
    let other = ctx(2, 3, 0);
    assert_eq!(
        master.acquire_node_write_lock(&other, &[1])?.response,
        LockResult::Granted
    );
    master.finish_transaction(&other)?;
    assert_eq!(
        master.acquire_node_write_lock(&slave, &[1])?.response,
        LockResult::Granted
    );
    master.finish_transaction(&slave)?;
    master.shutdown();
    Ok(())
}

#[test]
fn a_transaction_waiting_for_a_lock_is_never_reaped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = Arc::new(master_with_config(
        &dir,
        MasterConfig {
            reap_interval: Duration::from_millis(50),
            idle_threshold: Duration::from_millis(300),
            id_grab_size: 1000,
        },
    )?);
    let holder = ctx(1, 2, 0);
    let waiter = ctx(2, 3, 0);

    assert_eq!(
        master.acquire_node_write_lock(&holder, &[1])?.response,
        LockResult::Granted
    );

    let blocked = Arc::clone(&master);
    let waiter_clone = waiter.clone();
    let handle = thread::spawn(move || blocked.acquire_node_write_lock(&waiter_clone, &[1]));

    // Keep the holder fresh while the waiter sits blocked well past the
    // idle threshold; the reaper must skip the active waiter.
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(100));
        master.pull_updates(&holder)?;
        assert!(!handle.is_finished());
    }

    master.finish_transaction(&holder)?;
    let response = handle.join().expect("waiter thread")?;
    assert_eq!(response.response, LockResult::Granted);
    master.finish_transaction(&waiter)?;
    master.shutdown();
    Ok(())
}

#[test]
fn id_batches_are_disjoint_and_sized() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master_with_config(
        &dir,
        MasterConfig {
            id_grab_size: 10,
            ..MasterConfig::default()
        },
    )?;

    let first = master.allocate_ids(IdType::Node)?.response;
    let second = master.allocate_ids(IdType::Node)?.response;
    assert_eq!(first.ids.len(), 10);
    assert_eq!(second.ids.len(), 10);
    for id in &first.ids {
        assert!(!second.ids.contains(id));
    }
    assert!(second.high_id >= 20);

    let relationships = master.allocate_ids(IdType::Relationship)?.response;
    assert_eq!(relationships.ids[0], 0);
    master.shutdown();
    Ok(())
}

#[test]
fn slave_commit_applies_and_streams_up_to_the_new_tx() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let seeded_tx = seed_node(&master, 1)?;

    let slave = ctx(1, 2, 0);
    let Response { response: tx_id, stream } = master.commit_single_resource_transaction(
        &slave,
        DATA_SOURCE_NAME,
        &node_command_stream(50),
    )?;
    assert_eq!(tx_id, seeded_tx + 1);
    // The stream carries everything up to, but not including, the new tx.
    let streamed: Vec<u64> = stream.transactions.iter().map(|tx| tx.tx_id).collect();
    assert_eq!(streamed, vec![seeded_tx]);
    assert!(master.store().stores().nodes().is_in_use(50));
    assert_eq!(master.store().last_committed_tx(), tx_id);

    // The slave's id is beyond anything allocated locally; the generator
    // caught up during the apply.
    assert!(master.store().stores().nodes().id_generator().high_id() >= 51);

    master.finish_transaction(&slave)?;
    master.shutdown();
    Ok(())
}

#[test]
fn unknown_resource_name_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let slave = ctx(1, 2, 0);
    let result =
        master.commit_single_resource_transaction(&slave, "elsewhere", &node_command_stream(5));
    assert!(result.is_err());
    master.finish_transaction(&slave).ok();
    master.shutdown();
    Ok(())
}

#[test]
fn pull_updates_streams_missing_transactions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let first = seed_node(&master, 1)?;
    let second = seed_node(&master, 2)?;

    let stale = ctx(1, 2, first);
    let response = master.pull_updates(&stale)?;
    let streamed: Vec<u64> = response.stream.transactions.iter().map(|tx| tx.tx_id).collect();
    assert_eq!(streamed, vec![second]);

    let fresh = ctx(2, 2, second);
    assert!(master.pull_updates(&fresh)?.stream.is_empty());
    master.shutdown();
    Ok(())
}

#[derive(Default)]
struct CollectingWriter {
    files: Vec<String>,
    done: bool,
}

impl StoreWriter for CollectingWriter {
    fn write_file(&mut self, name: &str, _bytes: &[u8]) -> io::Result<()> {
        self.files.push(name.to_owned());
        Ok(())
    }

    fn done(&mut self) {
        self.done = true;
    }
}

#[test]
fn copy_store_streams_files_and_walks_the_horizon_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    seed_node(&master, 1)?;
    let last = seed_node(&master, 2)?;

    let mut writer = CollectingWriter::default();
    // An up-to-date slave still receives the latest transaction so it can
    // learn the master id for it.
    let up_to_date = ctx(1, 2, last);
    let response = master.copy_store(&up_to_date, &mut writer)?;
    assert!(writer.done);
    assert!(writer.files.iter().any(|name| name == "sable.nodes"));
    assert!(writer.files.iter().any(|name| name == "sable.relationships"));
    assert!(writer.files.iter().any(|name| name.starts_with("sable.log")));
    let streamed: Vec<u64> = response.stream.transactions.iter().map(|tx| tx.tx_id).collect();
    assert_eq!(streamed, vec![last]);
    master.shutdown();
    Ok(())
}

#[test]
fn relationship_type_creation_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let slave = ctx(1, 2, 0);

    let first = master.create_relationship_type(&slave, "KNOWS")?.response;
    let second = master.create_relationship_type(&slave, "KNOWS")?.response;
    assert_eq!(first, second);
    let other = master.create_relationship_type(&slave, "LIKES")?.response;
    assert_ne!(first, other);
    assert!(master.store().stores().relationship_types().is_in_use(first));
    master.shutdown();
    Ok(())
}

#[test]
fn master_id_is_reported_for_committed_transactions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let master = master(&dir)?;
    let tx_id = seed_node(&master, 1)?;

    assert_eq!(master.get_master_id_for_committed_tx(tx_id)?.response, 1);
    assert_eq!(
        master.get_master_id_for_committed_tx(tx_id + 99)?.response,
        NO_MASTER
    );
    master.shutdown();
    Ok(())
}
