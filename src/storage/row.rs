//! Column values, rows and collation-aware comparison.

use std::cmp::Ordering;

/// Reference to a value stored outside the row in external storage.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ExternRef {
    /// Allocation identifier inside the external store.
    pub id: u64,
    /// Total length of the stored value.
    pub len: u64,
}

/// Externally stored column: the locally kept prefix plus the reference.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExternField {
    /// Leading bytes kept in the row; indexes on the column use this prefix.
    pub prefix: Vec<u8>,
    /// Location of the full value.
    pub eref: ExternRef,
}

/// A single column value.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Datum {
    /// SQL NULL.
    Null,
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Value held in external storage.
    Extern(ExternField),
    /// Not captured by the record it was read from. Distinct from [`Datum::Null`].
    Missing,
}

static MISSING: Datum = Datum::Missing;

impl Datum {
    /// Convenience constructor for text values.
    pub fn text(value: impl Into<String>) -> Self {
        Datum::Text(value.into())
    }

    /// Returns `true` for [`Datum::Missing`].
    pub fn is_missing(&self) -> bool {
        matches!(self, Datum::Missing)
    }

    /// Returns the external reference, if the value lives in external storage.
    pub fn extern_ref(&self) -> Option<ExternRef> {
        match self {
            Datum::Extern(field) => Some(field.eref),
            _ => None,
        }
    }

    /// Value as stored in an index entry: external columns are indexed by prefix.
    pub fn index_image(&self) -> Datum {
        match self {
            Datum::Extern(field) => Datum::Bytes(field.prefix.clone()),
            other => other.clone(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Int(_) => 1,
            Datum::Text(_) | Datum::Bytes(_) | Datum::Extern(_) => 2,
            Datum::Missing => 3,
        }
    }

    fn byte_image(&self) -> &[u8] {
        match self {
            Datum::Text(s) => s.as_bytes(),
            Datum::Bytes(b) => b,
            Datum::Extern(field) => &field.prefix,
            _ => &[],
        }
    }
}

/// Comparison rule of an index field.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Collation {
    /// Byte-wise comparison.
    #[default]
    Binary,
    /// ASCII case-insensitive comparison; `'abc'` and `'ABC'` compare equal.
    CaseInsensitive,
}

impl Collation {
    /// Compares two values under this collation.
    pub fn compare(self, a: &Datum, b: &Datum) -> Ordering {
        match (a, b) {
            (Datum::Int(x), Datum::Int(y)) => x.cmp(y),
            _ if a.rank() != b.rank() => a.rank().cmp(&b.rank()),
            _ if a.rank() != 2 => Ordering::Equal,
            _ => {
                let (x, y) = (a.byte_image(), b.byte_image());
                match self {
                    Collation::Binary => x.cmp(y),
                    Collation::CaseInsensitive => x
                        .iter()
                        .map(u8::to_ascii_lowercase)
                        .cmp(y.iter().map(u8::to_ascii_lowercase)),
                }
            }
        }
    }
}

/// A row image: stored columns in table order plus virtual column slots.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Row {
    /// Stored column values.
    pub cols: Vec<Datum>,
    /// Virtual column values, [`Datum::Missing`] when not known.
    pub vcols: Vec<Datum>,
}

impl Row {
    /// Creates a row with no virtual column values.
    pub fn new(cols: Vec<Datum>) -> Self {
        Self {
            cols,
            vcols: Vec::new(),
        }
    }

    /// Creates a row with `n_cols` stored and `n_vcols` virtual columns, all missing.
    pub fn missing(n_cols: usize, n_vcols: usize) -> Self {
        Self {
            cols: vec![Datum::Missing; n_cols],
            vcols: vec![Datum::Missing; n_vcols],
        }
    }

    /// Stored column `i`, or [`Datum::Missing`] past the end.
    pub fn col(&self, i: u16) -> &Datum {
        self.cols.get(usize::from(i)).unwrap_or(&MISSING)
    }

    /// Virtual column `i`, or [`Datum::Missing`] past the end.
    pub fn vcol(&self, i: u16) -> &Datum {
        self.vcols.get(usize::from(i)).unwrap_or(&MISSING)
    }

    /// Writes stored column `i`, growing the row when needed.
    pub fn set_col(&mut self, i: u16, value: Datum) {
        let idx = usize::from(i);
        if self.cols.len() <= idx {
            self.cols.resize(idx + 1, Datum::Missing);
        }
        self.cols[idx] = value;
    }

    /// Writes virtual column `i`, growing the row when needed.
    pub fn set_vcol(&mut self, i: u16, value: Datum) {
        let idx = usize::from(i);
        if self.vcols.len() <= idx {
            self.vcols.resize(idx + 1, Datum::Missing);
        }
        self.vcols[idx] = value;
    }

    /// External references held by stored columns.
    pub fn extern_refs(&self) -> impl Iterator<Item = ExternRef> + '_ {
        self.cols.iter().filter_map(Datum::extern_ref)
    }
}
