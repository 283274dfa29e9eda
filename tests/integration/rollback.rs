#![allow(missing_docs)]

use std::sync::Arc;

use sombra_undo::storage::{
    Datum, Engine, EngineOptions, IndexDef, IndexField, IndexRecord, MemParts, TableSchema,
    TrxState,
};
use sombra_undo::types::{IndexId, Result, SombraError, TableId, TrxId};

const ACCOUNTS: TableId = TableId(3);
const PRIMARY: IndexId = IndexId(1);
const BY_OWNER: IndexId = IndexId(2);

fn accounts_schema() -> Result<TableSchema> {
    TableSchema::builder(ACCOUNTS, "accounts")
        .column("id")
        .column("owner")
        .column("balance")
        .primary_key(PRIMARY, &[0])
        .index(IndexDef::secondary(
            BY_OWNER,
            "by_owner",
            vec![IndexField::stored(1)],
        ))
        .build()
}

fn setup() -> Result<(Arc<Engine>, MemParts)> {
    let (engine, parts) = Engine::open_in_memory(EngineOptions::new())?;
    parts.catalog.create_table(accounts_schema()?)?;
    Ok((engine, parts))
}

fn account(id: i64, owner: &str, balance: i64) -> Vec<Datum> {
    vec![Datum::Int(id), Datum::text(owner), Datum::Int(balance)]
}

fn key(id: i64) -> Vec<Datum> {
    vec![Datum::Int(id)]
}

/// Owner entries as `(owner, delete_marked)`.
fn owner_entries(parts: &MemParts) -> Vec<(Datum, bool)> {
    parts
        .indexes
        .records(ACCOUNTS, BY_OWNER)
        .into_iter()
        .filter_map(IndexRecord::into_secondary)
        .map(|rec| (rec.fields[0].clone(), rec.delete_marked))
        .collect()
}

fn committed(engine: &Engine, rows: &[Vec<Datum>]) -> Result<()> {
    let trx = engine.begin();
    for row in rows {
        engine.insert(&trx, ACCOUNTS, row.clone())?;
    }
    engine.commit(&trx)?;
    Ok(())
}

#[test]
fn rolled_back_insert_leaves_no_trace() -> Result<()> {
    let (engine, parts) = setup()?;
    let trx = engine.begin();
    engine.insert(&trx, ACCOUNTS, account(1, "ada", 10))?;
    engine.insert(&trx, ACCOUNTS, account(2, "bob", 20))?;
    assert_eq!(trx.undo_len(), 2);

    engine.rollback(&trx)?;
    assert_eq!(trx.state(), TrxState::RolledBack);
    assert_eq!(trx.undo_len(), 0);
    assert!(parts.indexes.records(ACCOUNTS, PRIMARY).is_empty());
    assert!(owner_entries(&parts).is_empty());
    assert_eq!(engine.undo_store().metrics().live_records(), 0);
    assert!(engine.history().is_empty());
    Ok(())
}

#[test]
fn rolled_back_update_restores_row_and_entries() -> Result<()> {
    let (engine, parts) = setup()?;
    committed(&engine, &[account(1, "ada", 10)])?;
    let writer = engine.begin();
    let before = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row");

    engine.update(
        &writer,
        ACCOUNTS,
        &key(1),
        &[(1, Datum::text("bob")), (2, Datum::Int(99))],
    )?;
    assert_eq!(
        owner_entries(&parts),
        vec![(Datum::text("ada"), true), (Datum::text("bob"), false)]
    );

    engine.rollback(&writer)?;
    let after = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row");
    assert_eq!(after.cols, before.cols);
    assert!(!after.delete_marked);
    // Every view already sees the inserter, so the row carries no history.
    assert_eq!(after.trx_id, TrxId::RESET);
    assert!(after.roll_ptr.ends_chain());
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ada"), false)]);
    Ok(())
}

#[test]
fn rolled_back_update_keeps_history_an_older_view_needs() -> Result<()> {
    let (engine, _parts) = setup()?;
    let inserter = engine.begin();
    engine.insert(&inserter, ACCOUNTS, account(1, "ada", 10))?;
    let early = engine.open_view();
    engine.commit(&inserter)?;
    let before = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row");

    let writer = engine.begin();
    engine.update(&writer, ACCOUNTS, &key(1), &[(2, Datum::Int(11))])?;
    engine.rollback(&writer)?;

    assert_eq!(engine.clustered_record(ACCOUNTS, &key(1))?, Some(before));
    assert!(engine.consistent_read(ACCOUNTS, &key(1), &early)?.is_none());
    engine.close_view(&early);
    Ok(())
}

#[test]
fn history_reset_on_rollback_can_be_disabled() -> Result<()> {
    let mut opts = EngineOptions::new();
    opts.purge.reset_trx_id = false;
    let (engine, parts) = Engine::open_in_memory(opts)?;
    parts.catalog.create_table(accounts_schema()?)?;
    committed(&engine, &[account(1, "ada", 10)])?;
    let before = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row");

    let deleter = engine.begin();
    engine.delete(&deleter, ACCOUNTS, &key(1))?;
    engine.rollback(&deleter)?;
    assert_eq!(engine.clustered_record(ACCOUNTS, &key(1))?, Some(before));
    Ok(())
}

#[test]
fn rolled_back_delete_unmarks_everything() -> Result<()> {
    let (engine, parts) = setup()?;
    committed(&engine, &[account(1, "ada", 10)])?;
    let before = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row");

    let deleter = engine.begin();
    engine.delete(&deleter, ACCOUNTS, &key(1))?;
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ada"), true)]);
    engine.rollback(&deleter)?;

    let after = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row");
    assert_eq!(after.cols, before.cols);
    assert!(!after.delete_marked);
    assert_eq!(after.trx_id, TrxId::RESET);
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ada"), false)]);
    Ok(())
}

#[test]
fn savepoint_rollback_keeps_earlier_work() -> Result<()> {
    let (engine, parts) = setup()?;
    let trx = engine.begin();
    engine.insert(&trx, ACCOUNTS, account(1, "ada", 10))?;
    let savepoint = trx.savepoint();
    engine.insert(&trx, ACCOUNTS, account(2, "bob", 20))?;
    engine.update(&trx, ACCOUNTS, &key(1), &[(1, Datum::text("eve"))])?;

    engine.rollback_to_savepoint(&trx, savepoint)?;
    assert_eq!(trx.state(), TrxState::Active);
    assert_eq!(trx.undo_len(), 1);
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ada"), false)]);

    engine.insert(&trx, ACCOUNTS, account(3, "cy", 30))?;
    engine.commit(&trx)?;
    let view = engine.open_view();
    let first = engine
        .consistent_read(ACCOUNTS, &key(1), &view)?
        .expect("kept row");
    assert_eq!(first.cols, account(1, "ada", 10));
    assert!(engine.consistent_read(ACCOUNTS, &key(2), &view)?.is_none());
    assert!(engine.consistent_read(ACCOUNTS, &key(3), &view)?.is_some());
    engine.close_view(&view);
    Ok(())
}

#[test]
fn reinsert_rollback_restores_delete_mark_while_a_view_needs_it() -> Result<()> {
    let (engine, parts) = setup()?;
    committed(&engine, &[account(1, "ada", 10)])?;
    let reader = engine.open_view();
    let deleter = engine.begin();
    engine.delete(&deleter, ACCOUNTS, &key(1))?;
    engine.commit(&deleter)?;

    let reinserter = engine.begin();
    engine.insert(&reinserter, ACCOUNTS, account(1, "bob", 5))?;
    engine.rollback(&reinserter)?;

    let rec = engine.clustered_record(ACCOUNTS, &key(1))?.expect("record kept");
    assert!(rec.delete_marked);
    assert_eq!(rec.trx_id, deleter.id());
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ada"), true)]);
    let seen = engine
        .consistent_read(ACCOUNTS, &key(1), &reader)?
        .expect("reader still sees the row");
    assert_eq!(seen.cols, account(1, "ada", 10));
    engine.close_view(&reader);

    engine.purge_all()?;
    assert!(parts.indexes.records(ACCOUNTS, PRIMARY).is_empty());
    assert!(owner_entries(&parts).is_empty());
    Ok(())
}

#[test]
fn reinsert_rollback_drops_row_nobody_can_see() -> Result<()> {
    let (engine, parts) = setup()?;
    committed(&engine, &[account(1, "ada", 10)])?;
    let deleter = engine.begin();
    engine.delete(&deleter, ACCOUNTS, &key(1))?;
    engine.commit(&deleter)?;

    let reinserter = engine.begin();
    engine.insert(&reinserter, ACCOUNTS, account(1, "bob", 5))?;
    engine.rollback(&reinserter)?;

    assert!(parts.indexes.records(ACCOUNTS, PRIMARY).is_empty());
    assert!(owner_entries(&parts).is_empty());

    // The delete's history entry finds nothing left to remove.
    let stats = engine.purge_all()?;
    assert_eq!(stats.clustered_removed, 0);
    assert!(engine.history().is_empty());
    Ok(())
}

#[test]
fn reinsert_rollback_under_own_snapshot_keeps_the_committed_row() -> Result<()> {
    let (engine, parts) = setup()?;
    committed(&engine, &[account(1, "ann", 10)])?;

    // The transaction's own snapshot is the oldest open view.
    let trx = engine.begin();
    let own = engine.read_view(&trx);
    engine.delete(&trx, ACCOUNTS, &key(1))?;
    engine.insert(&trx, ACCOUNTS, account(1, "bob", 20))?;
    assert!(!engine.trx_sys().purge_view().is_visible(trx.id()));
    assert!(own.is_visible(trx.id()));
    engine.rollback(&trx)?;

    let rec = engine.clustered_record(ACCOUNTS, &key(1))?.expect("row survives");
    assert!(!rec.delete_marked);
    assert_eq!(rec.cols, account(1, "ann", 10));
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ann"), false)]);

    let view = engine.open_view();
    let row = engine
        .consistent_read(ACCOUNTS, &key(1), &view)?
        .expect("visible to new readers");
    assert_eq!(row.col(1), &Datum::text("ann"));
    engine.close_view(&view);

    engine.purge_all()?;
    assert_eq!(parts.indexes.records(ACCOUNTS, PRIMARY).len(), 1);
    assert_eq!(owner_entries(&parts), vec![(Datum::text("ann"), false)]);
    Ok(())
}

#[test]
fn rename_rollback_restores_the_name() -> Result<()> {
    let (engine, _parts) = setup()?;
    let trx = engine.begin();
    engine.rename_table(&trx, ACCOUNTS, "ledger")?;
    assert_eq!(engine.schema(ACCOUNTS)?.table.name, "ledger");
    engine.rollback(&trx)?;
    assert_eq!(engine.schema(ACCOUNTS)?.table.name, "accounts");
    Ok(())
}

#[test]
fn bulk_insert_rollback_empties_the_table() -> Result<()> {
    let (engine, parts) = setup()?;
    let trx = engine.begin();
    engine.begin_bulk_insert(&trx, ACCOUNTS)?;
    for id in 0..50 {
        engine.insert(&trx, ACCOUNTS, account(id, "bulk", id))?;
    }
    engine.rollback(&trx)?;
    assert!(parts.indexes.records(ACCOUNTS, PRIMARY).is_empty());
    assert!(owner_entries(&parts).is_empty());
    Ok(())
}

#[test]
fn metadata_insert_rollback_removes_the_record() -> Result<()> {
    let (engine, parts) = setup()?;
    committed(&engine, &[account(1, "ada", 10)])?;
    let trx = engine.begin();
    engine.insert_metadata(&trx, ACCOUNTS)?;
    assert_eq!(parts.indexes.records(ACCOUNTS, PRIMARY).len(), 2);
    assert!(matches!(
        engine.insert_metadata(&trx, ACCOUNTS),
        Err(SombraError::Invalid(_))
    ));
    engine.rollback(&trx)?;
    assert_eq!(parts.indexes.records(ACCOUNTS, PRIMARY).len(), 1);
    Ok(())
}

#[test]
fn finished_transactions_cannot_roll_back() -> Result<()> {
    let (engine, _parts) = setup()?;
    let trx = engine.begin();
    engine.insert(&trx, ACCOUNTS, account(1, "ada", 10))?;
    engine.commit(&trx)?;
    assert!(matches!(engine.rollback(&trx), Err(SombraError::Invalid(_))));

    let other = engine.begin();
    engine.rollback(&other)?;
    assert!(matches!(engine.rollback(&other), Err(SombraError::Invalid(_))));
    assert!(matches!(
        engine.insert(&other, ACCOUNTS, account(2, "bob", 1)),
        Err(SombraError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn rollback_skips_records_of_dropped_tables() -> Result<()> {
    let (engine, parts) = setup()?;
    let trx = engine.begin();
    engine.insert(&trx, ACCOUNTS, account(1, "ada", 10))?;
    parts.catalog.drop_table(ACCOUNTS);
    engine.rollback(&trx)?;
    assert_eq!(trx.state(), TrxState::RolledBack);
    assert_eq!(engine.undo_store().metrics().live_records(), 0);
    Ok(())
}
