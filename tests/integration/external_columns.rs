#![allow(missing_docs)]

use std::sync::Arc;

use sombra_undo::storage::{
    Datum, Engine, EngineOptions, ExternRef, IndexDef, IndexField, MemParts, TableSchema,
};
use sombra_undo::types::{IndexId, Result, TableId};

const DOCS: TableId = TableId(12);

fn setup() -> Result<(Arc<Engine>, MemParts)> {
    let opts = EngineOptions::new()
        .extern_threshold(64)
        .extern_prefix_len(16);
    let (engine, parts) = Engine::open_in_memory(opts)?;
    let schema = TableSchema::builder(DOCS, "docs")
        .column("id")
        .column("title")
        .column("body")
        .primary_key(IndexId(1), &[0])
        .index(IndexDef::secondary(
            IndexId(2),
            "by_title",
            vec![IndexField::stored(1)],
        ))
        .build()?;
    parts.catalog.create_table(schema)?;
    Ok((engine, parts))
}

fn body(fill: char) -> String {
    std::iter::repeat(fill).take(200).collect()
}

fn key(id: i64) -> Vec<Datum> {
    vec![Datum::Int(id)]
}

fn body_ref(engine: &Engine, id: i64) -> Result<ExternRef> {
    let rec = engine.clustered_record(DOCS, &key(id))?.expect("row");
    Ok(rec.cols[2].extern_ref().expect("body stored externally"))
}

fn insert_doc(engine: &Engine, id: i64, fill: char) -> Result<()> {
    let trx = engine.begin();
    engine.insert(
        &trx,
        DOCS,
        vec![Datum::Int(id), Datum::text("notes"), Datum::text(body(fill))],
    )?;
    engine.commit(&trx)?;
    Ok(())
}

#[test]
fn long_values_move_out_of_the_row() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_doc(&engine, 1, 'a')?;

    let rec = engine.clustered_record(DOCS, &key(1))?.expect("row");
    assert_eq!(rec.cols[1], Datum::text("notes"));
    let Datum::Extern(field) = &rec.cols[2] else {
        panic!("body kept inline: {:?}", rec.cols[2]);
    };
    assert_eq!(field.prefix, body('a').as_bytes()[..16].to_vec());
    assert_eq!(field.eref.len, 200);
    assert_eq!(&engine.read_extern(field.eref)?[..], body('a').as_bytes());
    assert_eq!(parts.externs.stats().live, 1);
    Ok(())
}

#[test]
fn purge_frees_values_replaced_by_an_update() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_doc(&engine, 1, 'a')?;
    let old = body_ref(&engine, 1)?;
    let reader = engine.open_view();

    let trx = engine.begin();
    engine.update(&trx, DOCS, &key(1), &[(2, Datum::text(body('b')))])?;
    engine.commit(&trx)?;
    assert_eq!(parts.externs.stats().live, 2);

    let seen = engine.consistent_read(DOCS, &key(1), &reader)?.expect("row");
    assert_eq!(seen.col(2).extern_ref(), Some(old));
    assert_eq!(&engine.read_extern(old)?[..], body('a').as_bytes());

    engine.purge_all()?;
    assert_eq!(parts.externs.stats().live, 2, "the reader still needs it");
    engine.close_view(&reader);
    let stats = engine.purge_all()?;
    assert_eq!(stats.externs_freed, 1);
    assert_eq!(parts.externs.stats().live, 1);
    assert!(engine.read_extern(old).is_err());
    assert_eq!(&engine.read_extern(body_ref(&engine, 1)?)?[..], body('b').as_bytes());
    Ok(())
}

#[test]
fn shrinking_a_value_frees_the_external_copy() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_doc(&engine, 1, 'a')?;
    let trx = engine.begin();
    engine.update(&trx, DOCS, &key(1), &[(2, Datum::text("short"))])?;
    engine.commit(&trx)?;

    engine.purge_all()?;
    assert_eq!(parts.externs.stats().live, 0);
    let rec = engine.clustered_record(DOCS, &key(1))?.expect("row");
    assert_eq!(rec.cols[2], Datum::text("short"));
    Ok(())
}

#[test]
fn purging_a_delete_frees_every_value() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_doc(&engine, 1, 'a')?;
    insert_doc(&engine, 2, 'b')?;
    let trx = engine.begin();
    engine.delete(&trx, DOCS, &key(1))?;
    engine.commit(&trx)?;

    let stats = engine.purge_all()?;
    assert_eq!(stats.clustered_removed, 1);
    assert_eq!(stats.externs_freed, 1);
    let externs = parts.externs.stats();
    assert_eq!((externs.stored, externs.freed, externs.live), (2, 1, 1));
    Ok(())
}

#[test]
fn rollback_frees_values_it_introduced() -> Result<()> {
    let (engine, parts) = setup()?;
    insert_doc(&engine, 1, 'a')?;
    let original = body_ref(&engine, 1)?;

    let trx = engine.begin();
    engine.update(&trx, DOCS, &key(1), &[(2, Datum::text(body('z')))])?;
    engine.insert(
        &trx,
        DOCS,
        vec![Datum::Int(2), Datum::text("draft"), Datum::text(body('q'))],
    )?;
    assert_eq!(parts.externs.stats().live, 3);
    engine.rollback(&trx)?;

    assert_eq!(parts.externs.stats().live, 1);
    assert_eq!(body_ref(&engine, 1)?, original);
    assert_eq!(&engine.read_extern(original)?[..], body('a').as_bytes());
    assert!(engine.clustered_record(DOCS, &key(2))?.is_none());
    Ok(())
}
