use sable::records::{PropertyData, PropertyValue};
use sable::{GraphStore, Result, SableError, NO_PROPERTY, NO_RELATIONSHIP};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Result<GraphStore> {
    GraphStore::open(dir.path())
}

#[test]
fn relationship_create_links_both_chain_heads() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;
    let before = db.last_committed_tx();

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_create(2);
    tx.relationship_create(100, 0, 1, 2)?;
    db.commit(&mut tx)?;

    assert_eq!(db.last_committed_tx(), before + 1);
    let stores = db.stores();
    assert_eq!(stores.nodes().get_record(1)?.next_rel, 100);
    assert_eq!(stores.nodes().get_record(2)?.next_rel, 100);
    let rel = stores.relationships().get_record(100)?;
    assert_eq!(rel.first_prev_rel, NO_RELATIONSHIP);
    assert_eq!(rel.first_next_rel, NO_RELATIONSHIP);
    assert_eq!(rel.second_prev_rel, NO_RELATIONSHIP);
    assert_eq!(rel.second_next_rel, NO_RELATIONSHIP);
    Ok(())
}

#[test]
fn deleting_the_middle_relationship_splices_the_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_create(2);
    tx.relationship_create(100, 0, 1, 2)?;
    tx.relationship_create(101, 0, 1, 2)?;
    tx.relationship_create(102, 0, 1, 2)?;
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    tx.rel_delete(101)?;
    db.commit(&mut tx)?;

    let stores = db.stores();
    // Heads prepend, so the youngest relationship stays the head.
    assert_eq!(stores.nodes().get_record(1)?.next_rel, 102);
    assert_eq!(stores.nodes().get_record(2)?.next_rel, 102);
    let newest = stores.relationships().get_record(102)?;
    assert_eq!(newest.first_next_rel, 100);
    assert_eq!(newest.second_next_rel, 100);
    let oldest = stores.relationships().get_record(100)?;
    assert_eq!(oldest.first_prev_rel, 102);
    assert_eq!(oldest.second_prev_rel, 102);
    assert!(!stores.relationships().is_in_use(101));
    Ok(())
}

#[test]
fn deleting_a_node_with_live_relationships_fails_prepare() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_create(2);
    tx.relationship_create(100, 0, 1, 2)?;
    db.commit(&mut tx)?;
    let last_committed = db.last_committed_tx();

    let mut tx = db.begin_tx();
    tx.node_delete(1)?;
    let result = tx.prepare();
    assert!(matches!(result, Err(SableError::Integrity(_))));
    assert_eq!(db.last_committed_tx(), last_committed);
    tx.rollback()?;
    assert!(db.stores().nodes().is_in_use(1));
    Ok(())
}

#[test]
fn self_loops_use_both_sides_of_one_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.relationship_create(100, 0, 1, 1)?;
    tx.relationship_create(101, 0, 1, 1)?;
    db.commit(&mut tx)?;

    let stores = db.stores();
    assert_eq!(stores.nodes().get_record(1)?.next_rel, 101);
    let head = stores.relationships().get_record(101)?;
    assert_eq!(head.first_next_rel, 100);
    assert_eq!(head.second_next_rel, 100);
    assert_eq!(head.first_prev_rel, NO_RELATIONSHIP);
    assert_eq!(head.second_prev_rel, NO_RELATIONSHIP);
    let tail = stores.relationships().get_record(100)?;
    assert_eq!(tail.first_prev_rel, 101);
    assert_eq!(tail.second_prev_rel, 101);

    let mut tx = db.begin_tx();
    tx.rel_delete(101)?;
    db.commit(&mut tx)?;
    let stores = db.stores();
    assert_eq!(stores.nodes().get_record(1)?.next_rel, 100);
    let survivor = stores.relationships().get_record(100)?;
    assert_eq!(survivor.first_prev_rel, NO_RELATIONSHIP);
    assert_eq!(survivor.second_prev_rel, NO_RELATIONSHIP);

    let mut tx = db.begin_tx();
    tx.rel_delete(100)?;
    db.commit(&mut tx)?;
    assert_eq!(db.stores().nodes().get_record(1)?.next_rel, NO_RELATIONSHIP);
    Ok(())
}

#[test]
fn property_overflow_prepends_a_new_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    // Each string block takes 8 bytes of the 32-byte payload, so the fifth
    // property overflows the first record.
    for key in 0..5u32 {
        tx.node_add_property(1, key, PropertyValue::String(format!("value-{key}")))?;
    }
    db.commit(&mut tx)?;

    let stores = db.stores();
    let node = stores.nodes().get_record(1)?;
    let head = stores.properties().get_record(node.next_prop)?;
    assert_eq!(head.blocks.len(), 1);
    assert_eq!(head.blocks[0].key_id, 4);
    assert_ne!(head.next_prop, NO_PROPERTY);
    let tail = stores.properties().get_record(head.next_prop)?;
    assert_eq!(tail.prev_prop, head.id);
    assert_eq!(tail.next_prop, NO_PROPERTY);
    let tail_keys: Vec<u32> = tail.blocks.iter().map(|block| block.key_id).collect();
    assert_eq!(tail_keys, vec![0, 1, 2, 3]);

    let mut tx = db.begin_tx();
    let properties = tx.node_load_properties(1, false)?.expect("committed chain");
    assert_eq!(properties.len(), 5);
    for key in 0..5u32 {
        assert_eq!(
            properties[&key].value,
            Some(PropertyValue::String(format!("value-{key}")))
        );
    }
    tx.rollback()?;
    Ok(())
}

#[test]
fn out_of_sequence_commit_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;
    let last_committed = db.last_committed_tx();

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.prepare()?;
    let result = tx.commit(last_committed + 2);
    assert!(matches!(result, Err(SableError::Integrity(_))));
    assert_eq!(db.last_committed_tx(), last_committed);
    assert!(!db.stores().nodes().is_in_use(1));
    tx.rollback()?;
    Ok(())
}

#[test]
fn rollback_returns_every_allocated_id() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;
    let stores = db.stores();

    let node_id = stores.nodes().next_id();
    let rel_id = stores.relationships().next_id();
    let type_id = stores.relationship_types().next_id();

    let mut tx = db.begin_tx();
    tx.create_relationship_type(type_id, "KNOWS");
    tx.node_create(node_id);
    let other_node = stores.nodes().next_id();
    tx.node_create(other_node);
    tx.relationship_create(rel_id, type_id, node_id, other_node)?;
    let property =
        tx.node_add_property(node_id, 0, PropertyValue::String("long enough to chain".into()))?;
    let property_record_id = property.id;
    tx.rollback()?;

    assert!(!stores.nodes().is_in_use(node_id));
    assert!(!stores.nodes().is_in_use(other_node));
    assert!(!stores.relationships().is_in_use(rel_id));
    assert!(!stores.relationship_types().is_in_use(type_id));
    assert!(!stores.properties().is_in_use(property_record_id));

    // Every id goes back to its free list.
    assert!(stores.nodes().id_generator().defrag_count() >= 2);
    assert_eq!(stores.relationships().id_generator().defrag_count(), 1);
    assert_eq!(stores.relationship_types().id_generator().defrag_count(), 1);
    assert_eq!(stores.properties().id_generator().defrag_count(), 1);
    assert!(stores.properties().string_store().id_generator().defrag_count() >= 1);
    assert_eq!(db.cache().relationship_type_id("KNOWS"), None);
    Ok(())
}

#[test]
fn committed_state_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let last_committed;
    {
        let db = open(&dir)?;
        let mut tx = db.begin_tx();
        tx.create_relationship_type(0, "KNOWS");
        tx.create_property_index("name", 0);
        tx.node_create(1);
        tx.node_create(2);
        tx.relationship_create(100, 0, 1, 2)?;
        tx.node_add_property(1, 0, PropertyValue::String("a value that spans blocks".into()))?;
        tx.rel_add_property(100, 0, PropertyValue::Int(42))?;
        db.commit(&mut tx)?;
        last_committed = db.last_committed_tx();
    }

    let db = open(&dir)?;
    assert_eq!(db.last_committed_tx(), last_committed);
    let stores = db.stores();
    assert_eq!(stores.nodes().get_record(1)?.next_rel, 100);
    assert_eq!(stores.nodes().get_record(2)?.next_rel, 100);
    assert!(stores.relationships().is_in_use(100));
    assert_eq!(db.cache().relationship_type_id("KNOWS"), Some(0));
    assert_eq!(db.cache().property_key_id("name"), Some(0));

    let mut tx = db.begin_tx();
    let node_props = tx.node_load_properties(1, false)?.expect("node chain");
    assert_eq!(
        node_props[&0].value,
        Some(PropertyValue::String("a value that spans blocks".into()))
    );
    let rel_props = tx.rel_load_properties(100, false)?.expect("rel chain");
    assert_eq!(rel_props[&0].value, Some(PropertyValue::Int(42)));
    tx.rollback()?;

    // Id generators resume past recovered records.
    assert!(stores.nodes().id_generator().high_id() >= 3);
    assert!(stores.relationships().id_generator().high_id() >= 101);
    Ok(())
}

#[test]
fn double_delete_is_surfaced_and_survivable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_create(2);
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    tx.node_delete(1)?;
    assert!(matches!(
        tx.node_delete(1),
        Err(SableError::AlreadyDeleted("node", 1))
    ));
    // The transaction is still usable after the surfaced error.
    tx.node_delete(2)?;
    db.commit(&mut tx)?;
    assert!(!db.stores().nodes().is_in_use(1));
    assert!(!db.stores().nodes().is_in_use(2));
    Ok(())
}

#[test]
fn missing_property_block_is_surfaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    let property = tx.node_add_property(1, 0, PropertyValue::Bool(true))?;
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    let bogus = PropertyData {
        id: property.id,
        key_id: 99,
        value: None,
    };
    assert!(matches!(
        tx.node_remove_property(1, &bogus),
        Err(SableError::MissingBlock { key: 99, .. })
    ));
    tx.rollback()?;
    Ok(())
}

#[test]
fn growing_a_property_relocates_its_block() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    let small = tx.node_add_property(1, 0, PropertyValue::Int(5))?;
    for key in 1..4u32 {
        tx.node_add_property(1, key, PropertyValue::String(format!("v{key}")))?;
    }
    db.commit(&mut tx)?;
    let first_host = small.id;

    // An in-place change keeps the record.
    let mut tx = db.begin_tx();
    let changed = tx.node_change_property(1, &small, PropertyValue::Int(6))?;
    assert_eq!(changed.id, first_host);
    db.commit(&mut tx)?;

    // Growing past the inline size forces a move; the host record is full,
    // so a new head record appears.
    let mut tx = db.begin_tx();
    let grown = tx.node_change_property(1, &changed, PropertyValue::Int(i64::MAX))?;
    assert_ne!(grown.id, first_host);
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    let properties = tx.node_load_properties(1, false)?.expect("chain");
    assert_eq!(properties[&0].value, Some(PropertyValue::Int(i64::MAX)));
    assert_eq!(properties.len(), 4);
    tx.rollback()?;
    Ok(())
}

#[test]
fn removing_the_last_block_unlinks_the_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    let property = tx.node_add_property(1, 0, PropertyValue::Bool(true))?;
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    tx.node_remove_property(1, &property)?;
    db.commit(&mut tx)?;

    let stores = db.stores();
    assert_eq!(stores.nodes().get_record(1)?.next_prop, NO_PROPERTY);
    assert!(!stores.properties().is_in_use(property.id));
    Ok(())
}

#[test]
fn node_delete_reports_its_properties() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_add_property(1, 3, PropertyValue::String("gone".into()))?;
    tx.node_add_property(1, 4, PropertyValue::Int(9))?;
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    let removed = tx.node_delete(1)?;
    assert_eq!(removed.len(), 2);
    assert_eq!(removed[&3].value, Some(PropertyValue::String("gone".into())));
    assert_eq!(removed[&4].value, Some(PropertyValue::Int(9)));
    db.commit(&mut tx)?;
    assert!(!db.stores().nodes().is_in_use(1));
    Ok(())
}

#[test]
fn light_loads_see_staged_state_first() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(&dir)?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_create(2);
    tx.relationship_create(100, 0, 1, 2)?;
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    assert!(tx.node_load_light(1));
    assert!(!tx.node_load_light(99));
    // Repeated loads hit the warmed cache and agree with the store.
    let first = tx.rel_load_light(100).expect("committed relationship");
    let second = tx.rel_load_light(100).expect("cached relationship");
    assert_eq!(first, second);

    // A deletion staged in this transaction is visible to its own light
    // loads before commit.
    tx.rel_delete(100)?;
    let staged = tx.rel_load_light(100).expect("staged record");
    assert!(!staged.in_use);
    tx.rollback()?;
    Ok(())
}

#[test]
fn incremental_chain_reads_follow_the_committed_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = GraphStore::open_with_config(
        dir.path(),
        sable::StoreConfig {
            relationship_grab_size: 2,
            ..sable::StoreConfig::default()
        },
    )?;

    let mut tx = db.begin_tx();
    tx.node_create(1);
    tx.node_create(2);
    for rel_id in 100..105u64 {
        tx.relationship_create(rel_id, 0, 1, 2)?;
    }
    db.commit(&mut tx)?;

    let mut tx = db.begin_tx();
    let mut position = tx.relationship_chain_position(1)?;
    let mut seen = Vec::new();
    while position != NO_RELATIONSHIP {
        let (batch, next) = tx.more_relationships(1, position)?;
        assert!(batch.len() <= 2);
        seen.extend(batch.into_iter().map(|rel| rel.id));
        position = next;
    }
    assert_eq!(seen, vec![104, 103, 102, 101, 100]);
    tx.rollback()?;
    Ok(())
}
