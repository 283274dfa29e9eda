#![no_main]

use libfuzzer_sys::arbitrary::{self, Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use sombra_undo::storage::{Datum, Engine, EngineOptions, IndexDef, IndexField, TableSchema};
use sombra_undo::types::{IndexId, TableId};

const T: TableId = TableId(1);

#[derive(Debug, Clone)]
enum Operation {
    Insert { id: i64, name: u8 },
    Update { id: i64, name: u8 },
    Delete { id: i64 },
    Commit,
    Rollback,
    OpenView,
    CloseView,
    Purge,
}

impl<'a> Arbitrary<'a> for Operation {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(match u.int_in_range::<u8>(0..=7)? {
            0 => Operation::Insert {
                id: u.int_in_range(0..=15)?,
                name: u.int_in_range(0..=3)?,
            },
            1 => Operation::Update {
                id: u.int_in_range(0..=15)?,
                name: u.int_in_range(0..=3)?,
            },
            2 => Operation::Delete {
                id: u.int_in_range(0..=15)?,
            },
            3 => Operation::Commit,
            4 => Operation::Rollback,
            5 => Operation::OpenView,
            6 => Operation::CloseView,
            _ => Operation::Purge,
        })
    }
}

fuzz_target!(|ops: Vec<Operation>| {
    let (engine, parts) = Engine::open_in_memory(EngineOptions::new()).expect("engine");
    let schema = TableSchema::builder(T, "t")
        .column("id")
        .column("name")
        .primary_key(IndexId(1), &[0])
        .index(IndexDef::secondary(IndexId(2), "by_name", vec![IndexField::stored(1)]))
        .build()
        .expect("schema");
    parts.catalog.create_table(schema).expect("create");

    let name = |n: u8| Datum::text(format!("n{n}"));
    let mut trx = engine.begin();
    let mut views = Vec::new();
    for op in ops {
        match op {
            Operation::Insert { id, name: n } => {
                let _ = engine.insert(&trx, T, vec![Datum::Int(id), name(n)]);
            }
            Operation::Update { id, name: n } => {
                let _ = engine.update(&trx, T, &[Datum::Int(id)], &[(1, name(n))]);
            }
            Operation::Delete { id } => {
                let _ = engine.delete(&trx, T, &[Datum::Int(id)]);
            }
            Operation::Commit => {
                engine.commit(&trx).expect("commit");
                trx = engine.begin();
            }
            Operation::Rollback => {
                engine.rollback(&trx).expect("rollback");
                trx = engine.begin();
            }
            Operation::OpenView => views.push(engine.open_view()),
            Operation::CloseView => {
                if let Some(view) = views.pop() {
                    engine.close_view(&view);
                }
            }
            Operation::Purge => {
                engine.purge_all().expect("purge");
            }
        }
    }
    engine.rollback(&trx).expect("final rollback");
    for view in views.drain(..) {
        engine.close_view(&view);
    }
    engine.purge_all().expect("final purge");
    assert!(engine.history().is_empty());
    let live = parts
        .indexes
        .records(T, IndexId(1))
        .into_iter()
        .filter(|rec| !rec.is_delete_marked())
        .count();
    let entries = parts
        .indexes
        .records(T, IndexId(2))
        .into_iter()
        .filter(|rec| !rec.is_delete_marked())
        .count();
    assert_eq!(live, entries);
});
