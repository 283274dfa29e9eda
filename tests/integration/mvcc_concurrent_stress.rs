//! MVCC concurrent stress tests
//!
//! Writers move balance between rows they own while readers sum every row
//! under their own read views and background purge trims history.
//!
//! These tests verify:
//! - Every read view sees a consistent total, twice in a row
//! - Rolled back transfers leave no trace
//! - Purge never removes a version an open view still needs
//! - Index entries converge to one live entry per row

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_undo::storage::{
    Datum, Engine, EngineOptions, IndexDef, IndexField, IndexRecord, MemParts, PurgeCfg,
    ReadView, TableSchema,
};
use sombra_undo::types::{IndexId, Result, TableId};

const LEDGER: TableId = TableId(40);
const PRIMARY: IndexId = IndexId(1);
const BY_BALANCE: IndexId = IndexId(2);

const ROWS: i64 = 48;
const WRITERS: i64 = 4;
const READERS: usize = 3;
const TRANSFERS_PER_WRITER: usize = 300;
const INITIAL_BALANCE: i64 = 1_000;
const TOTAL: i64 = ROWS * INITIAL_BALANCE;

fn setup(purge: PurgeCfg) -> Result<(Arc<Engine>, MemParts)> {
    let (engine, parts) = Engine::open_in_memory(EngineOptions::new().purge(purge))?;
    let schema = TableSchema::builder(LEDGER, "ledger")
        .column("id")
        .column("balance")
        .primary_key(PRIMARY, &[0])
        .index(IndexDef::secondary(
            BY_BALANCE,
            "by_balance",
            vec![IndexField::stored(1)],
        ))
        .build()?;
    parts.catalog.create_table(schema)?;
    let trx = engine.begin();
    for id in 0..ROWS {
        engine.insert(
            &trx,
            LEDGER,
            vec![Datum::Int(id), Datum::Int(INITIAL_BALANCE)],
        )?;
    }
    engine.commit(&trx)?;
    Ok((engine, parts))
}

fn stress_purge() -> PurgeCfg {
    PurgeCfg {
        background: true,
        batch_size: 32,
        workers: 2,
        idle_wait_ms: 5,
        ..PurgeCfg::default()
    }
}

fn balance_of(engine: &Engine, id: i64, view: &ReadView) -> Result<i64> {
    let row = engine
        .consistent_read(LEDGER, &[Datum::Int(id)], view)?
        .expect("ledger rows are never deleted");
    match row.col(1) {
        Datum::Int(v) => Ok(*v),
        other => panic!("balance column holds {other:?}"),
    }
}

fn sum_under(engine: &Engine, view: &ReadView) -> Result<i64> {
    let mut sum = 0;
    for id in 0..ROWS {
        sum += balance_of(engine, id, view)?;
    }
    Ok(sum)
}

/// Rows owned by `writer`; writers never touch each other's rows.
fn owned_rows(writer: i64) -> Vec<i64> {
    (0..ROWS).filter(|id| id % WRITERS == writer).collect()
}

/// Runs transfers for one writer, returning the balances it committed.
fn run_writer(engine: &Engine, writer: i64, seed: u64) -> Result<Vec<(i64, i64)>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let rows = owned_rows(writer);
    let mut balances: Vec<i64> = vec![INITIAL_BALANCE; rows.len()];
    for _ in 0..TRANSFERS_PER_WRITER {
        let from = rng.gen_range(0..rows.len());
        let mut to = rng.gen_range(0..rows.len());
        if to == from {
            to = (to + 1) % rows.len();
        }
        let amount = rng.gen_range(1..50);
        let trx = engine.begin();
        let new_from = balances[from] - amount;
        let new_to = balances[to] + amount;
        engine.update(
            &trx,
            LEDGER,
            &[Datum::Int(rows[from])],
            &[(1, Datum::Int(new_from))],
        )?;
        engine.update(
            &trx,
            LEDGER,
            &[Datum::Int(rows[to])],
            &[(1, Datum::Int(new_to))],
        )?;
        if rng.gen_bool(0.2) {
            engine.rollback(&trx)?;
        } else {
            engine.commit(&trx)?;
            balances[from] = new_from;
            balances[to] = new_to;
        }
    }
    Ok(rows.into_iter().zip(balances).collect())
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        if Instant::now() > deadline {
            panic!("{what} did not happen in time");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn live_balance_entries(parts: &MemParts) -> (usize, usize) {
    let records = parts.indexes.records(LEDGER, BY_BALANCE);
    let live = records
        .iter()
        .filter(|rec| !rec.is_delete_marked())
        .count();
    (live, records.len())
}

/// Test 1.1: Readers see a constant total while writers transfer
///
/// Verifies that:
/// - Each reader's view yields the same total on two passes
/// - Final balances match what the writers committed
/// - Purge reduces the balance index to one entry per row
#[test]
fn readers_see_constant_total_under_transfers() -> Result<()> {
    let (engine, parts) = setup(stress_purge())?;
    let stop = Arc::new(AtomicBool::new(false));
    let snapshots = Arc::new(AtomicU64::new(0));
    let start = Arc::new(Barrier::new(WRITERS as usize + READERS));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let snapshots = Arc::clone(&snapshots);
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<()> {
                start.wait();
                while !stop.load(Ordering::Acquire) {
                    let view = engine.open_view();
                    let first = sum_under(&engine, &view)?;
                    let second = sum_under(&engine, &view)?;
                    engine.close_view(&view);
                    assert_eq!(first, TOTAL);
                    assert_eq!(second, first, "repeatable read broke");
                    snapshots.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let engine = Arc::clone(&engine);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                run_writer(&engine, w, 0x5eed_0000 + w as u64)
            })
        })
        .collect();

    let mut expected = Vec::new();
    for writer in writers {
        expected.extend(writer.join().expect("writer panicked")?);
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader panicked")?;
    }
    assert!(snapshots.load(Ordering::Relaxed) > 0);

    let view = engine.open_view();
    for (id, balance) in &expected {
        assert_eq!(balance_of(&engine, *id, &view)?, *balance, "row {id}");
    }
    assert_eq!(sum_under(&engine, &view)?, TOTAL);
    engine.close_view(&view);

    wait_until("history drain", || {
        engine.history().is_empty() && live_balance_entries(&parts).1 == ROWS as usize
    });
    assert_eq!(live_balance_entries(&parts), (ROWS as usize, ROWS as usize));
    engine.shutdown();
    Ok(())
}

/// Test 1.2: A pinned view survives concurrent purge
///
/// A view opened before any transfer must keep reading the initial balances
/// while writers and the purge worker run.
#[test]
fn pinned_view_survives_concurrent_purge() -> Result<()> {
    let (engine, _parts) = setup(stress_purge())?;
    let pinned = engine.open_view();

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || run_writer(&engine, w, 0xfeed_0000 + w as u64))
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer panicked")?;
    }

    for id in 0..ROWS {
        assert_eq!(balance_of(&engine, id, &pinned)?, INITIAL_BALANCE);
    }
    assert!(!engine.history().is_empty(), "history held for the pinned view");

    engine.close_view(&pinned);
    wait_until("history drain", || engine.history().is_empty());
    engine.shutdown();
    Ok(())
}
