#![allow(missing_docs)]

use std::sync::Arc;

use sombra_undo::storage::{
    Datum, Engine, EngineOptions, FnEvaluator, IndexDef, IndexField, IndexRecord, MemParts, Row,
    TableSchema,
};
use sombra_undo::types::{IndexId, Result, SombraError, TableId};

const TAGS: TableId = TableId(9);
const PRIMARY: IndexId = IndexId(1);
const BY_LOWER: IndexId = IndexId(2);

fn tags() -> Result<TableSchema> {
    TableSchema::builder(TAGS, "tags")
        .column("id")
        .column("label")
        .virtual_column("label_lower", &[1])
        .primary_key(PRIMARY, &[0])
        .index(IndexDef::secondary(
            BY_LOWER,
            "by_label_lower",
            vec![IndexField::virtual_col(0)],
        ))
        .build()
}

fn lower(row: &Row) -> Datum {
    match row.col(1) {
        Datum::Text(s) => Datum::text(s.to_lowercase()),
        other => other.clone(),
    }
}

fn setup() -> Result<(Arc<Engine>, MemParts)> {
    let parts = MemParts::new();
    let evaluator = FnEvaluator::new().with(TAGS, 0, lower);
    let engine = Engine::open(
        EngineOptions::new(),
        parts.collaborators().evaluator(Arc::new(evaluator)),
    )?;
    parts.catalog.create_table(tags()?)?;
    Ok((engine, parts))
}

fn tag(id: i64, label: &str) -> Vec<Datum> {
    vec![Datum::Int(id), Datum::text(label)]
}

fn key(id: i64) -> Vec<Datum> {
    vec![Datum::Int(id)]
}

fn lower_entries(parts: &MemParts) -> Vec<(Datum, bool)> {
    parts
        .indexes
        .records(TAGS, BY_LOWER)
        .into_iter()
        .filter_map(IndexRecord::into_secondary)
        .map(|rec| (rec.fields[0].clone(), rec.delete_marked))
        .collect()
}

fn insert_committed(engine: &Engine, id: i64, label: &str) -> Result<()> {
    let trx = engine.begin();
    engine.insert(&trx, TAGS, tag(id, label))?;
    engine.commit(&trx)?;
    Ok(())
}

#[test]
fn index_entries_carry_the_computed_value() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_committed(&engine, 1, "Rust")?;
    assert_eq!(lower_entries(&parts), vec![(Datum::text("rust"), false)]);

    let view = engine.open_view();
    let row = engine.consistent_read(TAGS, &key(1), &view)?.expect("row");
    assert_eq!(row.vcol(0), &Datum::text("rust"));
    engine.close_view(&view);
    Ok(())
}

#[test]
fn change_that_keeps_the_computed_value_keeps_the_entry() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_committed(&engine, 1, "rust")?;
    let trx = engine.begin();
    assert!(engine.update(&trx, TAGS, &key(1), &[(1, Datum::text("RUST"))])?);
    engine.commit(&trx)?;
    assert_eq!(lower_entries(&parts), vec![(Datum::text("rust"), false)]);

    engine.purge_all()?;
    assert_eq!(lower_entries(&parts), vec![(Datum::text("rust"), false)]);
    Ok(())
}

#[test]
fn old_versions_rebuild_their_virtual_values() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_committed(&engine, 1, "Ada")?;
    let before = engine.open_view();
    let trx = engine.begin();
    engine.update(&trx, TAGS, &key(1), &[(1, Datum::text("Bob"))])?;
    engine.commit(&trx)?;
    assert_eq!(
        lower_entries(&parts),
        vec![(Datum::text("ada"), true), (Datum::text("bob"), false)]
    );

    let old = engine.consistent_read(TAGS, &key(1), &before)?.expect("row");
    assert_eq!(old.col(1), &Datum::text("Ada"));
    assert_eq!(old.vcol(0), &Datum::text("ada"));

    // The old entry is still reachable through the open view.
    engine.purge_all()?;
    assert_eq!(lower_entries(&parts).len(), 2);
    engine.close_view(&before);
    let stats = engine.purge_all()?;
    assert_eq!(stats.secondary_removed, 1);
    assert_eq!(lower_entries(&parts), vec![(Datum::text("bob"), false)]);
    Ok(())
}

#[test]
fn rollback_restores_virtual_entries() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_committed(&engine, 1, "Ada")?;
    let trx = engine.begin();
    engine.update(&trx, TAGS, &key(1), &[(1, Datum::text("Bob"))])?;
    engine.rollback(&trx)?;
    assert_eq!(lower_entries(&parts), vec![(Datum::text("ada"), false)]);

    let trx = engine.begin();
    engine.delete(&trx, TAGS, &key(1))?;
    engine.insert(&trx, TAGS, tag(2, "Cy"))?;
    engine.rollback(&trx)?;
    assert_eq!(lower_entries(&parts), vec![(Datum::text("ada"), false)]);
    Ok(())
}

#[test]
fn missing_expression_is_reported() -> Result<()> {
    let (engine, parts) = Engine::open_in_memory(EngineOptions::new())?;
    parts.catalog.create_table(tags()?)?;
    let trx = engine.begin();
    let err = engine
        .insert(&trx, TAGS, tag(1, "Rust"))
        .expect_err("no expression registered");
    assert!(matches!(
        err,
        SombraError::VirtualColumnUnavailable { table: TAGS, vcol: 0 }
    ));
    assert!(parts.indexes.records(TAGS, PRIMARY).is_empty());
    engine.rollback(&trx)?;
    Ok(())
}
