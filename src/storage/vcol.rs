//! Virtual (generated) column evaluation.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::storage::row::{Datum, Row};
use crate::storage::schema::TableSchema;
use crate::types::{Result, SombraError, TableId};

/// Computes virtual column values from stored columns.
pub trait VirtualColumnEvaluator: Send + Sync {
    /// Computes virtual column `vcol` of `row`.
    fn evaluate(&self, schema: &TableSchema, vcol: u16, row: &Row) -> Result<Datum>;

    /// Returns `row` with every virtual column whose base columns are known
    /// filled in; the others stay [`Datum::Missing`].
    fn evaluate_virtual_columns(&self, row: &Row, schema: &TableSchema) -> Result<Row> {
        let mut out = row.clone();
        out.vcols.resize(schema.n_vcols(), Datum::Missing);
        for (i, def) in schema.virtual_columns.iter().enumerate() {
            let vcol = i as u16;
            if def.base_columns.iter().any(|c| row.col(*c).is_missing()) {
                continue;
            }
            out.vcols[i] = self.evaluate(schema, vcol, row)?;
        }
        Ok(out)
    }
}

/// Evaluator for tables without virtual columns; any request is unavailable.
#[derive(Default)]
pub struct NoVirtualColumns;

impl VirtualColumnEvaluator for NoVirtualColumns {
    fn evaluate(&self, schema: &TableSchema, vcol: u16, _row: &Row) -> Result<Datum> {
        Err(SombraError::VirtualColumnUnavailable {
            table: schema.id,
            vcol,
        })
    }
}

type VcolFn = Box<dyn Fn(&Row) -> Datum + Send + Sync>;

/// Evaluator backed by registered closures.
#[derive(Default)]
pub struct FnEvaluator {
    funcs: FxHashMap<(TableId, u16), VcolFn>,
}

impl FnEvaluator {
    /// Creates an evaluator with no expressions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the expression of virtual column `vcol` of `table`.
    pub fn with(
        mut self,
        table: TableId,
        vcol: u16,
        f: impl Fn(&Row) -> Datum + Send + Sync + 'static,
    ) -> Self {
        self.funcs.insert((table, vcol), Box::new(f));
        self
    }
}

impl VirtualColumnEvaluator for FnEvaluator {
    fn evaluate(&self, schema: &TableSchema, vcol: u16, row: &Row) -> Result<Datum> {
        self.funcs
            .get(&(schema.id, vcol))
            .map(|f| f(row))
            .ok_or(SombraError::VirtualColumnUnavailable {
                table: schema.id,
                vcol,
            })
    }
}

/// Table definition plus the evaluator for its virtual columns.
#[derive(Clone)]
pub struct SchemaContext {
    /// Table definition.
    pub table: Arc<TableSchema>,
    /// Virtual column evaluator.
    pub evaluator: Arc<dyn VirtualColumnEvaluator>,
}

impl SchemaContext {
    /// Bundles a table and an evaluator.
    pub fn new(table: Arc<TableSchema>, evaluator: Arc<dyn VirtualColumnEvaluator>) -> Self {
        Self { table, evaluator }
    }

    /// Context for a table without virtual columns.
    pub fn plain(table: Arc<TableSchema>) -> Self {
        Self::new(table, Arc::new(NoVirtualColumns))
    }

    /// Fills the virtual columns of `row`.
    pub fn materialize(&self, row: &Row) -> Result<Row> {
        if self.table.n_vcols() == 0 {
            return Ok(row.clone());
        }
        self.evaluator.evaluate_virtual_columns(row, &self.table)
    }
}
