#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};

use sombra_undo::storage::{
    CounterMetrics, Datum, Engine, EngineOptions, IndexDef, IndexField, IndexKind, IndexRecord,
    MemIndexStore, MemParts, RetryCfg, TableSchema,
};
use sombra_undo::types::{IndexId, Result, SombraError, TableId};
use tracing_subscriber::EnvFilter;

const ITEMS: TableId = TableId(9);
const PRIMARY: IndexId = IndexId(90);
const BY_NAME: IndexId = IndexId(91);
const BY_SHAPE: IndexId = IndexId(92);

fn items() -> Result<TableSchema> {
    TableSchema::builder(ITEMS, "items")
        .column("id")
        .column("name")
        .column("shape")
        .primary_key(PRIMARY, &[0])
        .index(IndexDef::secondary(
            BY_NAME,
            "by_name",
            vec![IndexField::stored(1)],
        ))
        .index(
            IndexDef::secondary(BY_SHAPE, "by_shape", vec![IndexField::stored(2)])
                .with_kind(IndexKind::Spatial),
        )
        .build()
}

fn setup_with(opts: EngineOptions, parts: MemParts) -> Result<Arc<Engine>> {
    let engine = Engine::open(opts, parts.collaborators())?;
    parts.catalog.create_table(items()?)?;
    Ok(engine)
}

fn setup() -> Result<(Arc<Engine>, MemParts)> {
    let parts = MemParts::new();
    let engine = setup_with(EngineOptions::new(), parts.clone())?;
    Ok((engine, parts))
}

fn item(id: i64, name: &str) -> Vec<Datum> {
    vec![Datum::Int(id), Datum::text(name), Datum::text("square")]
}

fn key(id: i64) -> Vec<Datum> {
    vec![Datum::Int(id)]
}

fn names(parts: &MemParts) -> Vec<(Datum, bool)> {
    parts
        .indexes
        .records(ITEMS, BY_NAME)
        .into_iter()
        .filter_map(IndexRecord::into_secondary)
        .map(|sec| (sec.fields[0].clone(), sec.delete_marked))
        .collect()
}

fn rename(engine: &Engine, id: i64, name: &str) -> Result<()> {
    let trx = engine.begin();
    engine.update(&trx, ITEMS, &key(id), &[(1, Datum::text(name))])?;
    engine.commit(&trx)?;
    Ok(())
}

#[test]
fn entry_coming_back_to_an_old_key_is_retained() -> Result<()> {
    let (engine, parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, ITEMS, item(1, "K"))?;
    engine.commit(&t1)?;
    let reader = engine.open_view();

    rename(&engine, 1, "K2")?;
    rename(&engine, 1, "K")?;
    assert_eq!(
        names(&parts),
        vec![(Datum::text("K"), false), (Datum::text("K2"), true)]
    );

    // Only the insert is purgeable while the reader is open.
    let first = engine.purge_all()?;
    assert_eq!(first.records, 1);
    assert_eq!(names(&parts).len(), 2);
    assert_eq!(
        engine
            .consistent_read(ITEMS, &key(1), &reader)?
            .map(|r| r.col(1).clone()),
        Some(Datum::text("K"))
    );
    engine.close_view(&reader);

    let second = engine.purge_all()?;
    assert_eq!(second.records, 2);
    assert_eq!(second.secondary_kept, 1, "K is still the live entry");
    assert_eq!(second.secondary_removed, 1, "K2 is obsolete");
    assert_eq!(names(&parts), vec![(Datum::text("K"), false)]);
    Ok(())
}

#[test]
fn old_entry_survives_until_no_view_needs_it() -> Result<()> {
    let (engine, parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, ITEMS, item(1, "old"))?;
    engine.commit(&t1)?;
    let reader = engine.open_view();
    rename(&engine, 1, "new")?;

    engine.purge_all()?;
    assert!(names(&parts).contains(&(Datum::text("old"), true)));

    engine.close_view(&reader);
    let stats = engine.purge_all()?;
    assert_eq!(stats.secondary_removed, 1);
    assert_eq!(names(&parts), vec![(Datum::text("new"), false)]);
    Ok(())
}

#[test]
fn deleted_row_is_removed_from_every_index() -> Result<()> {
    let (engine, parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, ITEMS, item(1, "gone"))?;
    engine.insert(&t1, ITEMS, item(2, "kept"))?;
    engine.commit(&t1)?;
    let t2 = engine.begin();
    engine.delete(&t2, ITEMS, &key(1))?;
    engine.commit(&t2)?;

    let stats = engine.purge_all()?;
    assert_eq!(stats.clustered_removed, 1);
    assert_eq!(stats.secondary_removed, 2, "one entry in each secondary index");
    assert_eq!(parts.indexes.records(ITEMS, BY_SHAPE).len(), 1);
    assert!(engine.clustered_record(ITEMS, &key(1))?.is_none());
    assert_eq!(names(&parts), vec![(Datum::text("kept"), false)]);
    assert_eq!(engine.stats().history_len, 0);
    Ok(())
}

#[test]
fn reinserted_row_is_not_purged() -> Result<()> {
    let (engine, parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, ITEMS, item(1, "same"))?;
    engine.commit(&t1)?;
    let t2 = engine.begin();
    engine.delete(&t2, ITEMS, &key(1))?;
    engine.commit(&t2)?;
    let t3 = engine.begin();
    engine.insert(&t3, ITEMS, item(1, "same"))?;
    engine.commit(&t3)?;

    let stats = engine.purge_all()?;
    assert_eq!(stats.clustered_removed, 0);
    assert_eq!(stats.secondary_removed, 0);
    let rec = engine
        .clustered_record(ITEMS, &key(1))?
        .expect("row survives purge");
    assert!(!rec.delete_marked);
    assert_eq!(names(&parts), vec![(Datum::text("same"), false)]);
    Ok(())
}

#[test]
fn predicate_locked_spatial_entry_is_vetoed() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let parts = MemParts::new();
    let engine = setup_with(EngineOptions::new().metrics(metrics.clone()), parts.clone())?;
    parts.indexes.lock_predicate(ITEMS, BY_SHAPE);

    let t1 = engine.begin();
    engine.insert(&t1, ITEMS, item(1, "blob"))?;
    engine.commit(&t1)?;
    let t2 = engine.begin();
    engine.delete(&t2, ITEMS, &key(1))?;
    engine.commit(&t2)?;

    let stats = engine.purge_all()?;
    assert_eq!(stats.secondary_removed, 1);
    assert_eq!(stats.clustered_removed, 1);
    let shapes = parts.indexes.records(ITEMS, BY_SHAPE);
    assert_eq!(shapes.len(), 1);
    assert!(shapes[0].is_delete_marked());
    assert_eq!(metrics.secondary_skipped.load(Ordering::Relaxed), 1);
    Ok(())
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_undo::storage::purge=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn crowded() -> Result<(Arc<Engine>, MemParts, Arc<CounterMetrics>)> {
    init_tracing();
    let metrics = Arc::new(CounterMetrics::default());
    // Two records per page: deleting row 1 empties its page and needs the tree latch.
    let parts = MemParts {
        indexes: Arc::new(MemIndexStore::new(2)),
        ..MemParts::new()
    };
    let opts = EngineOptions::new()
        .metrics(metrics.clone())
        .retry(RetryCfg {
            max_attempts: 3,
            backoff_ms: 0,
        });
    let engine = setup_with(opts, parts.clone())?;
    let t1 = engine.begin();
    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        engine.insert(&t1, ITEMS, item(id, name))?;
    }
    engine.commit(&t1)?;
    let t2 = engine.begin();
    engine.delete(&t2, ITEMS, &key(1))?;
    engine.commit(&t2)?;
    Ok((engine, parts, metrics))
}

#[test]
fn transient_out_of_space_is_retried() -> Result<()> {
    let (engine, parts, metrics) = crowded()?;
    parts.indexes.inject_out_of_space(2);
    let stats = engine.purge_all()?;
    assert_eq!(stats.clustered_removed, 1);
    assert!(engine.clustered_record(ITEMS, &key(1))?.is_none());
    assert_eq!(metrics.delete_retries.load(Ordering::Relaxed), 2);
    Ok(())
}

#[test]
fn retry_exhaustion_is_fatal_and_keeps_the_entry() -> Result<()> {
    let (engine, parts, _metrics) = crowded()?;
    parts.indexes.inject_out_of_space(10);
    let err = engine.purge_all().expect_err("retries exhausted");
    assert!(matches!(err, SombraError::RetryExhausted { attempts: 3 }));
    assert_eq!(engine.history().len(), 1, "the delete-mark record is requeued");
    assert!(engine.clustered_record(ITEMS, &key(1))?.is_some());

    parts.indexes.inject_out_of_space(0);
    let stats = engine.purge_all()?;
    assert_eq!(stats.records, 1);
    assert_eq!(stats.clustered_removed, 1);
    assert!(engine.history().is_empty());
    Ok(())
}

#[test]
fn history_of_dropped_table_is_skipped() -> Result<()> {
    let (engine, parts) = setup()?;
    let t1 = engine.begin();
    engine.insert(&t1, ITEMS, item(1, "x"))?;
    engine.delete(&t1, ITEMS, &key(1))?;
    engine.commit(&t1)?;
    parts.catalog.drop_table(ITEMS);

    let stats = engine.purge_all()?;
    assert_eq!(stats.records, 2);
    assert_eq!(stats.skipped, 2);
    let undo = engine.undo_store().metrics();
    assert_eq!(undo.records_written, undo.records_released);
    Ok(())
}
