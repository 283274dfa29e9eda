//! Table and index definitions, index entry construction and the catalog seam.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::storage::row::{Collation, Datum, Row};
use crate::types::{IndexId, Result, SombraError, TableId};

/// Column referenced by an index field or an undo record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FieldRef {
    /// Stored column number.
    Stored(u16),
    /// Virtual column number.
    Virtual(u16),
}

impl FieldRef {
    /// Packs the reference as `col << 1 | is_virtual`.
    pub fn encode(self) -> u64 {
        match self {
            FieldRef::Stored(col) => u64::from(col) << 1,
            FieldRef::Virtual(vcol) => (u64::from(vcol) << 1) | 1,
        }
    }

    /// Inverse of [`FieldRef::encode`].
    pub fn decode(raw: u64) -> Result<Self> {
        let n = u16::try_from(raw >> 1)
            .map_err(|_| SombraError::Corruption("field number overflow"))?;
        Ok(if raw & 1 == 0 {
            FieldRef::Stored(n)
        } else {
            FieldRef::Virtual(n)
        })
    }
}

/// One field of an index definition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexField {
    /// Column the field reads.
    pub field: FieldRef,
    /// Comparison rule.
    pub collation: Collation,
}

impl IndexField {
    /// Binary-collated stored column field.
    pub fn stored(col: u16) -> Self {
        Self {
            field: FieldRef::Stored(col),
            collation: Collation::Binary,
        }
    }

    /// Binary-collated virtual column field.
    pub fn virtual_col(vcol: u16) -> Self {
        Self {
            field: FieldRef::Virtual(vcol),
            collation: Collation::Binary,
        }
    }

    /// Overrides the collation.
    pub fn collate(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }
}

/// Index flavour.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndexKind {
    /// Primary key index holding the full row.
    Clustered,
    /// Ordinary secondary index.
    Secondary,
    /// Spatial index; purge consults the index store's veto hook.
    Spatial,
    /// Full-text index, maintained outside this subsystem.
    FullText,
}

/// Build state of an index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndexState {
    /// Fully built and maintained.
    Ready,
    /// Being built online; purge and rollback leave it alone.
    Building,
}

/// Definition of one index of a table.
#[derive(Clone, Debug)]
pub struct IndexDef {
    /// Index identifier.
    pub id: IndexId,
    /// Human readable name.
    pub name: String,
    /// Flavour.
    pub kind: IndexKind,
    /// Build state.
    pub state: IndexState,
    key: Vec<IndexField>,
    fields: Vec<IndexField>,
}

impl IndexDef {
    /// Declares a secondary index over `key`; the clustered key suffix is added
    /// when the owning table is built.
    pub fn secondary(id: IndexId, name: impl Into<String>, key: Vec<IndexField>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: IndexKind::Secondary,
            state: IndexState::Ready,
            fields: key.clone(),
            key,
        }
    }

    /// Overrides the index kind.
    pub fn with_kind(mut self, kind: IndexKind) -> Self {
        self.kind = kind;
        self
    }

    /// Marks the index as still being built.
    pub fn building(mut self) -> Self {
        self.state = IndexState::Building;
        self
    }

    /// User-declared key fields.
    pub fn key_fields(&self) -> &[IndexField] {
        &self.key
    }

    /// Full entry layout, including the clustered key suffix for secondaries.
    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    /// Returns `true` for the clustered index.
    pub fn is_clustered(&self) -> bool {
        self.kind == IndexKind::Clustered
    }

    /// Returns `true` once the index is fully built.
    pub fn is_ready(&self) -> bool {
        self.state == IndexState::Ready
    }

    /// Secondary indexes whose entries purge and rollback maintain.
    pub fn is_maintained(&self) -> bool {
        !self.is_clustered() && self.is_ready() && self.kind != IndexKind::FullText
    }

    /// Returns `true` when any entry field reads `field`.
    pub fn reads(&self, field: FieldRef) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }

    /// Returns `true` when the index has virtual column fields.
    pub fn has_virtual_fields(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f.field, FieldRef::Virtual(_)))
    }

    /// Projects `row` onto this index.
    ///
    /// `Ok(None)` means a stored field is [`Datum::Missing`], which happens when
    /// the row image came from an undo record written before the index existed.
    /// A missing virtual field is [`SombraError::VirtualColumnUnavailable`].
    pub fn build_entry(&self, table: &TableSchema, row: &Row) -> Result<Option<Vec<Datum>>> {
        let mut entry = Vec::with_capacity(self.fields.len());
        let mut missing_vcol = None;
        for field in &self.fields {
            match field.field {
                FieldRef::Stored(col) => {
                    let value = row.col(col);
                    if value.is_missing() {
                        return Ok(None);
                    }
                    entry.push(value.index_image());
                }
                FieldRef::Virtual(vcol) => {
                    let value = row.vcol(vcol);
                    if value.is_missing() {
                        missing_vcol.get_or_insert(vcol);
                    }
                    entry.push(value.index_image());
                }
            }
        }
        match missing_vcol {
            Some(vcol) => Err(SombraError::VirtualColumnUnavailable {
                table: table.id,
                vcol,
            }),
            None => Ok(Some(entry)),
        }
    }

    /// Collation-aware comparison of two entries (or entry prefixes).
    pub fn compare(&self, a: &[Datum], b: &[Datum]) -> Ordering {
        for ((x, y), field) in a.iter().zip(b.iter()).zip(self.fields.iter()) {
            match field.collation.compare(x, y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }

    /// Byte-exact equality, used after a collation-equal match.
    pub fn binary_eq(a: &[Datum], b: &[Datum]) -> bool {
        a == b
    }
}

/// Stored column definition.
#[derive(Clone, Debug)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
}

/// Virtual (generated) column definition.
#[derive(Clone, Debug)]
pub struct VirtualColumnDef {
    /// Column name.
    pub name: String,
    /// Stored columns the expression reads.
    pub base_columns: Vec<u16>,
}

/// Definition of a table and its indexes. The clustered index is always first.
#[derive(Clone, Debug)]
pub struct TableSchema {
    /// Table identifier.
    pub id: TableId,
    /// Current name.
    pub name: String,
    /// Stored columns.
    pub columns: Vec<ColumnDef>,
    /// Virtual columns.
    pub virtual_columns: Vec<VirtualColumnDef>,
    indexes: Vec<IndexDef>,
}

impl TableSchema {
    /// Starts a schema definition.
    pub fn builder(id: TableId, name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            id,
            name: name.into(),
            columns: Vec::new(),
            virtual_columns: Vec::new(),
            primary: None,
            secondaries: Vec::new(),
        }
    }

    /// The clustered index.
    pub fn clustered(&self) -> &IndexDef {
        &self.indexes[0]
    }

    /// All indexes, clustered first.
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Secondary, spatial and full-text indexes.
    pub fn secondaries(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().skip(1)
    }

    /// Looks up an index by id.
    pub fn index(&self, id: IndexId) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.id == id)
    }

    /// Number of stored columns.
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Number of virtual columns.
    pub fn n_vcols(&self) -> usize {
        self.virtual_columns.len()
    }

    /// Projects stored columns onto the clustered key (the row reference).
    pub fn row_ref(&self, cols: &[Datum]) -> Vec<Datum> {
        self.clustered()
            .fields()
            .iter()
            .map(|f| match f.field {
                FieldRef::Stored(col) => cols
                    .get(usize::from(col))
                    .cloned()
                    .unwrap_or(Datum::Missing),
                FieldRef::Virtual(_) => Datum::Missing,
            })
            .collect()
    }

    /// Columns that order some ready index, clustered key included.
    pub fn ordering_fields(&self) -> Vec<FieldRef> {
        let mut out: Vec<FieldRef> = self
            .indexes
            .iter()
            .filter(|idx| idx.is_ready() && idx.kind != IndexKind::FullText)
            .flat_map(|idx| idx.fields.iter().map(|f| f.field))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Returns `true` when changing `col` changes some index entry.
    pub fn is_ordering_column(&self, col: u16) -> bool {
        self.indexes
            .iter()
            .filter(|idx| idx.kind != IndexKind::FullText)
            .any(|idx| {
                idx.reads(FieldRef::Stored(col))
                    || self
                        .dependent_vcols(col)
                        .any(|v| idx.reads(FieldRef::Virtual(v)))
            })
    }

    /// Virtual columns computed from stored column `col`.
    pub fn dependent_vcols(&self, col: u16) -> impl Iterator<Item = u16> + '_ {
        self.virtual_columns
            .iter()
            .enumerate()
            .filter(move |(_, v)| v.base_columns.contains(&col))
            .map(|(i, _)| i as u16)
    }

    /// Virtual columns read by some index.
    pub fn indexed_vcols(&self) -> Vec<u16> {
        (0..self.n_vcols() as u16)
            .filter(|v| self.indexes.iter().any(|idx| idx.reads(FieldRef::Virtual(*v))))
            .collect()
    }

    /// Copy of the schema under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.name = name.into();
        copy
    }

    /// Copy of the schema with one index moved to `state`.
    pub fn with_index_state(&self, id: IndexId, state: IndexState) -> Self {
        let mut copy = self.clone();
        for idx in copy.indexes.iter_mut().filter(|idx| idx.id == id) {
            idx.state = state;
        }
        copy
    }
}

/// Builder for [`TableSchema`].
pub struct TableSchemaBuilder {
    id: TableId,
    name: String,
    columns: Vec<ColumnDef>,
    virtual_columns: Vec<VirtualColumnDef>,
    primary: Option<(IndexId, Vec<u16>)>,
    secondaries: Vec<IndexDef>,
}

impl TableSchemaBuilder {
    /// Appends a stored column.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef { name: name.into() });
        self
    }

    /// Appends a virtual column computed from `base_columns`.
    pub fn virtual_column(mut self, name: impl Into<String>, base_columns: &[u16]) -> Self {
        self.virtual_columns.push(VirtualColumnDef {
            name: name.into(),
            base_columns: base_columns.to_vec(),
        });
        self
    }

    /// Declares the clustered index over stored columns `cols`.
    pub fn primary_key(mut self, id: IndexId, cols: &[u16]) -> Self {
        self.primary = Some((id, cols.to_vec()));
        self
    }

    /// Adds a secondary index.
    pub fn index(mut self, index: IndexDef) -> Self {
        self.secondaries.push(index);
        self
    }

    /// Validates column references and lays out index entries.
    pub fn build(self) -> Result<TableSchema> {
        let (pk_id, pk_cols) = self
            .primary
            .ok_or(SombraError::Invalid("table needs a primary key"))?;
        if pk_cols.is_empty() {
            return Err(SombraError::Invalid("primary key needs a column"));
        }
        let n_cols = self.columns.len();
        let n_vcols = self.virtual_columns.len();
        let valid = |field: FieldRef| match field {
            FieldRef::Stored(c) => usize::from(c) < n_cols,
            FieldRef::Virtual(v) => usize::from(v) < n_vcols,
        };
        if pk_cols.iter().any(|c| !valid(FieldRef::Stored(*c))) {
            return Err(SombraError::Invalid("primary key column out of range"));
        }
        if self
            .virtual_columns
            .iter()
            .flat_map(|v| v.base_columns.iter())
            .any(|c| usize::from(*c) >= n_cols)
        {
            return Err(SombraError::Invalid("virtual column base out of range"));
        }
        let pk_fields: Vec<IndexField> = pk_cols.iter().map(|c| IndexField::stored(*c)).collect();
        let mut indexes = vec![IndexDef {
            id: pk_id,
            name: "PRIMARY".to_owned(),
            kind: IndexKind::Clustered,
            state: IndexState::Ready,
            key: pk_fields.clone(),
            fields: pk_fields.clone(),
        }];
        for mut index in self.secondaries {
            if index.key.is_empty() || index.key.iter().any(|f| !valid(f.field)) {
                return Err(SombraError::Invalid("index field out of range"));
            }
            if index.kind == IndexKind::Clustered {
                return Err(SombraError::Invalid("only one clustered index"));
            }
            if indexes.iter().any(|idx| idx.id == index.id) {
                return Err(SombraError::Invalid("duplicate index id"));
            }
            let mut fields = index.key.clone();
            for pk in &pk_fields {
                if !fields.iter().any(|f| f.field == pk.field) {
                    fields.push(*pk);
                }
            }
            index.fields = fields;
            indexes.push(index);
        }
        Ok(TableSchema {
            id: self.id,
            name: self.name,
            columns: self.columns,
            virtual_columns: self.virtual_columns,
            indexes,
        })
    }
}

/// Source of table definitions.
pub trait TableCatalog: Send + Sync {
    /// Returns the current definition, or `None` once the table is dropped.
    fn table(&self, id: TableId) -> Option<Arc<TableSchema>>;

    /// Renames a table; used when a rename is rolled back.
    fn rename_table(&self, id: TableId, name: &str) -> Result<()>;
}

/// In-memory [`TableCatalog`].
#[derive(Default)]
pub struct MemCatalog {
    tables: RwLock<FxHashMap<TableId, Arc<TableSchema>>>,
}

impl MemCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new table.
    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>> {
        let mut tables = self.tables.write();
        if tables.contains_key(&schema.id) {
            return Err(SombraError::Invalid("table id already registered"));
        }
        let schema = Arc::new(schema);
        tables.insert(schema.id, Arc::clone(&schema));
        Ok(schema)
    }

    /// Replaces a table definition, e.g. after an index finished building.
    pub fn replace_table(&self, schema: TableSchema) -> Arc<TableSchema> {
        let schema = Arc::new(schema);
        self.tables.write().insert(schema.id, Arc::clone(&schema));
        schema
    }

    /// Drops a table.
    pub fn drop_table(&self, id: TableId) -> Option<Arc<TableSchema>> {
        self.tables.write().remove(&id)
    }
}

impl TableCatalog for MemCatalog {
    fn table(&self, id: TableId) -> Option<Arc<TableSchema>> {
        self.tables.read().get(&id).cloned()
    }

    fn rename_table(&self, id: TableId, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let current = tables.get(&id).ok_or(SombraError::NotFound)?;
        let renamed = Arc::new(current.renamed(name));
        tables.insert(id, renamed);
        Ok(())
    }
}
