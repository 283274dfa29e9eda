#![allow(missing_docs)]

use std::sync::Arc;

use sombra_undo::storage::{
    Datum, Engine, EngineOptions, IndexDef, IndexField, MemParts, ReadView, TableSchema,
    TrxState,
};
use sombra_undo::types::{IndexId, Result, SombraError, TableId, TrxId};

const PEOPLE: TableId = TableId(1);
const PRIMARY: IndexId = IndexId(1);
const BY_NAME: IndexId = IndexId(2);

fn people() -> Result<TableSchema> {
    TableSchema::builder(PEOPLE, "people")
        .column("id")
        .column("name")
        .column("city")
        .primary_key(PRIMARY, &[0])
        .index(IndexDef::secondary(
            BY_NAME,
            "by_name",
            vec![IndexField::stored(1)],
        ))
        .build()
}

fn setup() -> Result<(Arc<Engine>, MemParts)> {
    let (engine, parts) = Engine::open_in_memory(EngineOptions::new())?;
    parts.catalog.create_table(people()?)?;
    Ok((engine, parts))
}

fn row(id: i64, name: &str, city: &str) -> Vec<Datum> {
    vec![Datum::Int(id), Datum::text(name), Datum::text(city)]
}

fn key(id: i64) -> Vec<Datum> {
    vec![Datum::Int(id)]
}

fn name_seen(engine: &Engine, id: i64, view: &ReadView) -> Result<Option<Datum>> {
    Ok(engine
        .consistent_read(PEOPLE, &key(id), view)?
        .map(|r| r.col(1).clone()))
}

#[test]
fn snapshot_keeps_seeing_the_version_it_started_with() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;

    let before = engine.open_view();
    let t2 = engine.begin();
    engine.update(&t2, PEOPLE, &key(1), &[(1, Datum::text("grace"))])?;
    engine.commit(&t2)?;
    let t3 = engine.begin();
    engine.update(&t3, PEOPLE, &key(1), &[(2, Datum::text("paris"))])?;
    engine.commit(&t3)?;
    let after = engine.open_view();

    let old = engine
        .consistent_read(PEOPLE, &key(1), &before)?
        .expect("row visible to the older view");
    assert_eq!(old.cols, row(1, "ada", "london"));
    let new = engine
        .consistent_read(PEOPLE, &key(1), &after)?
        .expect("row visible to the newer view");
    assert_eq!(new.cols, row(1, "grace", "paris"));

    engine.close_view(&before);
    engine.close_view(&after);
    Ok(())
}

#[test]
fn uncommitted_changes_are_private_to_their_writer() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;

    let writer = engine.begin();
    engine.update(&writer, PEOPLE, &key(1), &[(1, Datum::text("grace"))])?;
    let own = engine.read_view(&writer);
    assert_eq!(name_seen(&engine, 1, &own)?, Some(Datum::text("grace")));

    let other = engine.open_view();
    assert_eq!(name_seen(&engine, 1, &other)?, Some(Datum::text("ada")));

    // A row inserted by an active transaction does not exist for others.
    engine.insert(&writer, PEOPLE, row(2, "alan", "wilmslow"))?;
    assert_eq!(name_seen(&engine, 2, &other)?, None);
    engine.close_view(&other);
    engine.commit(&writer)?;
    assert_eq!(writer.state(), TrxState::Committed);
    Ok(())
}

#[test]
fn delete_mark_is_visible_only_to_later_views() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;
    let before = engine.open_view();

    let t2 = engine.begin();
    engine.delete(&t2, PEOPLE, &key(1))?;
    engine.commit(&t2)?;
    let after = engine.open_view();

    assert_eq!(name_seen(&engine, 1, &before)?, Some(Datum::text("ada")));
    assert_eq!(name_seen(&engine, 1, &after)?, None);
    let version = engine
        .consistent_read_version(PEOPLE, &key(1), &after)?
        .expect("delete-marked version");
    assert!(version.rec.delete_marked);
    engine.close_view(&before);
    engine.close_view(&after);
    Ok(())
}

#[test]
fn semi_consistent_read_returns_last_committed_value() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;

    let writer = engine.begin();
    engine.update(&writer, PEOPLE, &key(1), &[(1, Datum::text("grace"))])?;
    let committed = engine
        .semi_consistent_read(PEOPLE, &key(1))?
        .expect("committed version");
    assert_eq!(committed.col(1), &Datum::text("ada"));

    engine.commit(&writer)?;
    let latest = engine
        .semi_consistent_read(PEOPLE, &key(1))?
        .expect("live version");
    assert_eq!(latest.col(1), &Datum::text("grace"));
    Ok(())
}

#[test]
fn semi_consistent_read_of_fresh_insert_is_absent() -> Result<()> {
    let (engine, _parts) = setup()?;
    let writer = engine.begin();
    engine.insert(&writer, PEOPLE, row(1, "ada", "london"))?;
    assert!(engine.semi_consistent_read(PEOPLE, &key(1))?.is_none());
    Ok(())
}

#[test]
fn purged_history_is_reported_as_missing() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;
    let before = engine.open_view();
    let t2 = engine.begin();
    engine.update(&t2, PEOPLE, &key(1), &[(1, Datum::text("grace"))])?;
    engine.commit(&t2)?;

    // Drop the update's undo record behind the reader's back.
    let rec = engine
        .clustered_record(PEOPLE, &key(1))?
        .expect("live record");
    assert!(engine.undo_store().release(rec.roll_ptr));
    let err = engine
        .consistent_read(PEOPLE, &key(1), &before)
        .expect_err("history is gone");
    assert!(matches!(err, SombraError::MissingHistory { .. }));
    engine.close_view(&before);
    Ok(())
}

#[test]
fn purge_resets_history_of_settled_rows() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;
    let t2 = engine.begin();
    engine.update(&t2, PEOPLE, &key(1), &[(2, Datum::text("paris"))])?;
    engine.commit(&t2)?;

    let stats = engine.purge_all()?;
    assert_eq!(stats.records, 2);
    assert_eq!(stats.trx_ids_reset, 1);
    let rec = engine
        .clustered_record(PEOPLE, &key(1))?
        .expect("live record");
    assert_eq!(rec.trx_id, TrxId::RESET);
    assert!(rec.roll_ptr.ends_chain());

    let view = engine.open_view();
    assert_eq!(
        engine.consistent_read(PEOPLE, &key(1), &view)?.map(|r| r.cols),
        Some(row(1, "ada", "paris"))
    );
    engine.close_view(&view);
    assert_eq!(engine.stats().history_len, 0);
    Ok(())
}

#[test]
fn writes_conflicting_with_an_active_writer_are_rejected() -> Result<()> {
    let (engine, _parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, PEOPLE, row(1, "ada", "london"))?;
    engine.commit(&t1)?;

    let a = engine.begin();
    let b = engine.begin();
    engine.update(&a, PEOPLE, &key(1), &[(2, Datum::text("paris"))])?;
    let err = engine
        .update(&b, PEOPLE, &key(1), &[(2, Datum::text("rome"))])
        .expect_err("row is locked by a");
    assert!(matches!(err, SombraError::Invalid(_)));
    let dup = engine
        .insert(&b, PEOPLE, row(1, "x", "y"))
        .expect_err("duplicate key");
    assert!(matches!(dup, SombraError::Invalid(_)));
    engine.commit(&a)?;
    engine.update(&b, PEOPLE, &key(1), &[(2, Datum::text("rome"))])?;
    engine.commit(&b)?;
    Ok(())
}
