//! Undo record model and its byte format.
//!
//! ```text
//! u32 total_len | u8 kind | u8 flags | varint undo_no | varint table_id | varint trx_id
//! | kind body | u32 crc32
//! ```
//!
//! Column values are written as `varint field_ref | varint len | datum`, so a
//! reader can skip columns it does not know. `total_len` covers the whole
//! record including the checksum; a record cut short by a crash fails the
//! length check and decodes to [`SombraError::Corruption`].

use smallvec::SmallVec;

use crate::primitives::bytes::buf::{put_len_prefixed, Reader};
use crate::primitives::bytes::var;
use crate::storage::roll_ptr::RollPtr;
use crate::storage::row::{Datum, ExternField, ExternRef, Row};
use crate::storage::schema::{FieldRef, TableSchema};
use crate::types::checksum::record_crc32;
use crate::types::{Result, SombraError, TableId, TrxId, UndoNo};

const LEN_PREFIX: usize = 4;
const CRC_LEN: usize = 4;
const MIN_RECORD_LEN: usize = LEN_PREFIX + 2 + 3 + CRC_LEN;

/// Update did not change any ordering column.
pub const FLAG_NO_ORD_CHANGE: u8 = 0x01;
/// Update touched an externally stored column.
pub const FLAG_UPDATED_EXTERN: u8 = 0x02;
const FLAG_HAS_PARTIAL: u8 = 0x04;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_TEXT: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_EXTERN: u8 = 4;
const TAG_MISSING: u8 = 5;

/// Kind of an undo record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UndoKind {
    /// Table rename; rollback restores the old name.
    RenameTable,
    /// Insert of the hidden metadata record.
    InsertMetadata,
    /// Row insert.
    Insert,
    /// In-place update of a live row.
    UpdateExisting,
    /// Insert over a delete-marked row with the same key.
    UpdateDeleteMarked,
    /// Delete-mark of a row.
    DeleteMark,
    /// Bulk insert into an empty table; rollback empties it again.
    Empty,
}

impl UndoKind {
    fn code(self) -> u8 {
        match self {
            UndoKind::RenameTable => 9,
            UndoKind::InsertMetadata => 10,
            UndoKind::Insert => 11,
            UndoKind::UpdateExisting => 12,
            UndoKind::UpdateDeleteMarked => 13,
            UndoKind::DeleteMark => 14,
            UndoKind::Empty => 15,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            9 => UndoKind::RenameTable,
            10 => UndoKind::InsertMetadata,
            11 => UndoKind::Insert,
            12 => UndoKind::UpdateExisting,
            13 => UndoKind::UpdateDeleteMarked,
            14 => UndoKind::DeleteMark,
            15 => UndoKind::Empty,
            _ => return Err(SombraError::Corruption("unknown undo record kind")),
        })
    }

    /// Kinds whose roll pointer carries the insert flag.
    pub fn is_insert(self) -> bool {
        matches!(
            self,
            UndoKind::Insert | UndoKind::InsertMetadata | UndoKind::Empty | UndoKind::RenameTable
        )
    }
}

/// Fields every undo record carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UndoHeader {
    /// Position in the writing transaction's undo log.
    pub undo_no: UndoNo,
    /// Table the record belongs to.
    pub table_id: TableId,
    /// Writing transaction.
    pub trx_id: TrxId,
}

/// System columns of the version a modification replaced.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PriorSys {
    /// `DB_TRX_ID` before the modification.
    pub trx_id: TrxId,
    /// `DB_ROLL_PTR` before the modification.
    pub roll_ptr: RollPtr,
    /// Delete mark before the modification.
    pub delete_marked: bool,
}

/// One entry of an update vector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateField {
    /// Updated column.
    pub field: FieldRef,
    /// Value before the update.
    pub old: Datum,
    /// Value after the update; kept for virtual columns only.
    pub new: Option<Datum>,
}

/// Columns changed by a modification, with their prior values.
pub type UpdateVector = SmallVec<[UpdateField; 4]>;

/// Insert: the full new row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InsertUndo {
    /// Common fields.
    pub header: UndoHeader,
    /// Stored columns and indexed virtual columns of the inserted row.
    pub fields: Vec<(FieldRef, Datum)>,
}

/// Update-existing, update-delete-marked and delete-mark payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModifyUndo {
    /// Common fields.
    pub header: UndoHeader,
    /// System columns of the replaced version.
    pub prior: PriorSys,
    /// No ordering column changed.
    pub no_ord_change: bool,
    /// An externally stored column was replaced.
    pub updated_extern: bool,
    /// Clustered key of the row.
    pub row_ref: Vec<Datum>,
    /// Inverse delta.
    pub update: UpdateVector,
    /// Prior values of every ordering column, when the modification touched any.
    pub partial: Option<Vec<(FieldRef, Datum)>>,
}

/// Rename payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RenameUndo {
    /// Common fields.
    pub header: UndoHeader,
    /// Name before the rename.
    pub old_name: String,
}

/// Payload-free table level record (metadata insert, empty-table insert).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableUndo {
    /// Common fields.
    pub header: UndoHeader,
}

/// A decoded undo record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UndoRecord {
    /// See [`UndoKind::Insert`].
    Insert(InsertUndo),
    /// See [`UndoKind::InsertMetadata`].
    InsertMetadata(TableUndo),
    /// See [`UndoKind::UpdateExisting`].
    UpdateExisting(ModifyUndo),
    /// See [`UndoKind::UpdateDeleteMarked`].
    UpdateDeleteMarked(ModifyUndo),
    /// See [`UndoKind::DeleteMark`].
    DeleteMark(ModifyUndo),
    /// See [`UndoKind::RenameTable`].
    RenameTable(RenameUndo),
    /// See [`UndoKind::Empty`].
    Empty(TableUndo),
}

impl UndoRecord {
    /// Record kind.
    pub fn kind(&self) -> UndoKind {
        match self {
            UndoRecord::Insert(_) => UndoKind::Insert,
            UndoRecord::InsertMetadata(_) => UndoKind::InsertMetadata,
            UndoRecord::UpdateExisting(_) => UndoKind::UpdateExisting,
            UndoRecord::UpdateDeleteMarked(_) => UndoKind::UpdateDeleteMarked,
            UndoRecord::DeleteMark(_) => UndoKind::DeleteMark,
            UndoRecord::RenameTable(_) => UndoKind::RenameTable,
            UndoRecord::Empty(_) => UndoKind::Empty,
        }
    }

    /// Common fields.
    pub fn header(&self) -> &UndoHeader {
        match self {
            UndoRecord::Insert(r) => &r.header,
            UndoRecord::InsertMetadata(r) | UndoRecord::Empty(r) => &r.header,
            UndoRecord::UpdateExisting(r)
            | UndoRecord::UpdateDeleteMarked(r)
            | UndoRecord::DeleteMark(r) => &r.header,
            UndoRecord::RenameTable(r) => &r.header,
        }
    }

    /// The modification payload, for the three modify kinds.
    pub fn as_modify(&self) -> Option<&ModifyUndo> {
        match self {
            UndoRecord::UpdateExisting(r)
            | UndoRecord::UpdateDeleteMarked(r)
            | UndoRecord::DeleteMark(r) => Some(r),
            _ => None,
        }
    }
}

impl ModifyUndo {
    /// Rebuilds the version this record's modification replaced.
    ///
    /// `cols`/`vcols` are the newer version. Stored columns unknown to the
    /// newer version are ignored. Virtual columns computed from a restored
    /// column become [`Datum::Missing`] unless the record logged their prior value.
    pub fn apply_to(
        &self,
        schema: &TableSchema,
        cols: &[Datum],
        vcols: &[Datum],
    ) -> (Vec<Datum>, Vec<Datum>) {
        let mut cols = cols.to_vec();
        let mut vcols = vcols.to_vec();
        if vcols.len() < schema.n_vcols() {
            vcols.resize(schema.n_vcols(), Datum::Missing);
        }
        for upd in &self.update {
            if let FieldRef::Stored(col) = upd.field {
                let Some(slot) = cols.get_mut(usize::from(col)) else {
                    continue;
                };
                *slot = upd.old.clone();
                for v in schema.dependent_vcols(col) {
                    vcols[usize::from(v)] = Datum::Missing;
                }
            }
        }
        let logged_vcols = self
            .update
            .iter()
            .map(|u| (u.field, &u.old))
            .chain(self.partial.iter().flatten().map(|(f, d)| (*f, d)));
        for (field, value) in logged_vcols {
            if let FieldRef::Virtual(v) = field {
                if let Some(slot) = vcols.get_mut(usize::from(v)) {
                    if !value.is_missing() {
                        *slot = value.clone();
                    }
                }
            }
        }
        (cols, vcols)
    }

    /// Returns `true` when the update vector touches stored column `col`.
    pub fn updates(&self, field: FieldRef) -> bool {
        self.update.iter().any(|u| u.field == field)
    }
}

/// Serialises a record.
pub fn encode(record: &UndoRecord) -> Result<Vec<u8>> {
    let mut out = vec![0u8; LEN_PREFIX];
    out.push(record.kind().code());
    let flags = match record.as_modify() {
        Some(m) => {
            let mut flags = 0;
            if m.no_ord_change {
                flags |= FLAG_NO_ORD_CHANGE;
            }
            if m.updated_extern {
                flags |= FLAG_UPDATED_EXTERN;
            }
            if m.partial.is_some() {
                flags |= FLAG_HAS_PARTIAL;
            }
            flags
        }
        None => 0,
    };
    out.push(flags);
    let header = record.header();
    var::encode_u64(header.undo_no.0, &mut out);
    var::encode_u64(header.table_id.0, &mut out);
    var::encode_u64(header.trx_id.0, &mut out);
    match record {
        UndoRecord::Insert(ins) => put_fields(&mut out, &ins.fields),
        UndoRecord::InsertMetadata(_) | UndoRecord::Empty(_) => {}
        UndoRecord::RenameTable(r) => put_len_prefixed(&mut out, r.old_name.as_bytes()),
        UndoRecord::UpdateExisting(m)
        | UndoRecord::UpdateDeleteMarked(m)
        | UndoRecord::DeleteMark(m) => put_modify(&mut out, m),
    }
    let total = out.len() + CRC_LEN;
    let total = u32::try_from(total).map_err(|_| SombraError::Invalid("undo record too large"))?;
    out[..LEN_PREFIX].copy_from_slice(&total.to_be_bytes());
    let crc = record_crc32(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Parses a record. Total over arbitrary input: any defect is `Corruption`.
pub fn decode(bytes: &[u8]) -> Result<UndoRecord> {
    if bytes.len() < MIN_RECORD_LEN {
        return Err(SombraError::Corruption("undo record truncated"));
    }
    let mut len_raw = [0u8; LEN_PREFIX];
    len_raw.copy_from_slice(&bytes[..LEN_PREFIX]);
    let total = u32::from_be_bytes(len_raw) as usize;
    if total != bytes.len() {
        return Err(SombraError::Corruption("undo record length mismatch"));
    }
    let body_end = total - CRC_LEN;
    let mut crc_raw = [0u8; CRC_LEN];
    crc_raw.copy_from_slice(&bytes[body_end..]);
    if u32::from_be_bytes(crc_raw) != record_crc32(&bytes[..body_end]) {
        return Err(SombraError::Corruption("undo record checksum mismatch"));
    }
    let mut r = Reader::new(&bytes[LEN_PREFIX..body_end]);
    let kind = UndoKind::from_code(r.u8()?)?;
    let flags = r.u8()?;
    let header = UndoHeader {
        undo_no: UndoNo(r.varint()?),
        table_id: TableId(r.varint()?),
        trx_id: TrxId(r.varint()?),
    };
    let record = match kind {
        UndoKind::Insert => UndoRecord::Insert(InsertUndo {
            header,
            fields: get_fields(&mut r)?,
        }),
        UndoKind::InsertMetadata => UndoRecord::InsertMetadata(TableUndo { header }),
        UndoKind::Empty => UndoRecord::Empty(TableUndo { header }),
        UndoKind::RenameTable => {
            let name = std::str::from_utf8(r.len_prefixed()?)
                .map_err(|_| SombraError::Corruption("table name not UTF-8"))?;
            UndoRecord::RenameTable(RenameUndo {
                header,
                old_name: name.to_owned(),
            })
        }
        UndoKind::UpdateExisting => UndoRecord::UpdateExisting(get_modify(&mut r, header, flags)?),
        UndoKind::UpdateDeleteMarked => {
            UndoRecord::UpdateDeleteMarked(get_modify(&mut r, header, flags)?)
        }
        UndoKind::DeleteMark => UndoRecord::DeleteMark(get_modify(&mut r, header, flags)?),
    };
    if r.remaining() != 0 {
        return Err(SombraError::Corruption("trailing bytes in undo record"));
    }
    Ok(record)
}

/// Builds the prior row image of a modification: the row reference plus the
/// partial row, every other column [`Datum::Missing`].
///
/// Field references the schema no longer knows are skipped. A partial row that
/// lacks a stored ordering column of a ready index is malformed.
pub fn decode_partial(record: &ModifyUndo, schema: &TableSchema) -> Result<Row> {
    let partial = record
        .partial
        .as_ref()
        .ok_or(SombraError::Corruption("undo record has no partial row"))?;
    let mut row = Row::missing(schema.n_cols(), schema.n_vcols());
    for (field, value) in schema.clustered().fields().iter().zip(&record.row_ref) {
        if let FieldRef::Stored(col) = field.field {
            row.set_col(col, value.clone());
        }
    }
    for (field, value) in partial {
        match *field {
            FieldRef::Stored(col) if usize::from(col) < schema.n_cols() => {
                row.set_col(col, value.clone())
            }
            FieldRef::Virtual(vcol) if usize::from(vcol) < schema.n_vcols() => {
                row.set_vcol(vcol, value.clone())
            }
            _ => {}
        }
    }
    let complete = schema.ordering_fields().into_iter().all(|f| match f {
        FieldRef::Stored(col) => !row.col(col).is_missing(),
        FieldRef::Virtual(_) => true,
    });
    if !complete {
        return Err(SombraError::Corruption(
            "undo partial row lacks an ordering column",
        ));
    }
    Ok(row)
}

/// Builds the inserted row from an insert record.
pub fn decode_row(record: &InsertUndo, schema: &TableSchema) -> Row {
    let mut row = Row::missing(schema.n_cols(), schema.n_vcols());
    for (field, value) in &record.fields {
        match *field {
            FieldRef::Stored(col) if usize::from(col) < schema.n_cols() => {
                row.set_col(col, value.clone())
            }
            FieldRef::Virtual(vcol) if usize::from(vcol) < schema.n_vcols() => {
                row.set_vcol(vcol, value.clone())
            }
            _ => {}
        }
    }
    row
}

fn put_modify(out: &mut Vec<u8>, m: &ModifyUndo) {
    var::encode_u64(m.prior.trx_id.0, out);
    out.extend_from_slice(&m.prior.roll_ptr.to_bytes());
    out.push(u8::from(m.prior.delete_marked));
    var::encode_u64(m.row_ref.len() as u64, out);
    for value in &m.row_ref {
        put_datum_block(out, value);
    }
    var::encode_u64(m.update.len() as u64, out);
    for upd in &m.update {
        var::encode_u64(upd.field.encode(), out);
        put_datum_block(out, &upd.old);
        match &upd.new {
            Some(new) => {
                out.push(1);
                put_datum_block(out, new);
            }
            None => out.push(0),
        }
    }
    if let Some(partial) = &m.partial {
        put_fields(out, partial);
    }
}

fn get_modify(r: &mut Reader<'_>, header: UndoHeader, flags: u8) -> Result<ModifyUndo> {
    let prior = PriorSys {
        trx_id: TrxId(r.varint()?),
        roll_ptr: RollPtr::from_bytes(r.take(crate::storage::roll_ptr::ROLL_PTR_LEN)?)?,
        delete_marked: match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(SombraError::Corruption("bad delete mark byte")),
        },
    };
    let n_ref = bounded_count(r)?;
    let mut row_ref = Vec::with_capacity(n_ref);
    for _ in 0..n_ref {
        row_ref.push(get_datum_block(r)?);
    }
    let n_upd = bounded_count(r)?;
    let mut update = UpdateVector::with_capacity(n_upd);
    for _ in 0..n_upd {
        let field = FieldRef::decode(r.varint()?)?;
        let old = get_datum_block(r)?;
        let new = match r.u8()? {
            0 => None,
            1 => Some(get_datum_block(r)?),
            _ => return Err(SombraError::Corruption("bad update entry marker")),
        };
        update.push(UpdateField { field, old, new });
    }
    let partial = if flags & FLAG_HAS_PARTIAL != 0 {
        Some(get_fields(r)?)
    } else {
        None
    };
    Ok(ModifyUndo {
        header,
        prior,
        no_ord_change: flags & FLAG_NO_ORD_CHANGE != 0,
        updated_extern: flags & FLAG_UPDATED_EXTERN != 0,
        row_ref,
        update,
        partial,
    })
}

fn put_fields(out: &mut Vec<u8>, fields: &[(FieldRef, Datum)]) {
    var::encode_u64(fields.len() as u64, out);
    for (field, value) in fields {
        var::encode_u64(field.encode(), out);
        put_datum_block(out, value);
    }
}

fn get_fields(r: &mut Reader<'_>) -> Result<Vec<(FieldRef, Datum)>> {
    let n = bounded_count(r)?;
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        let field = FieldRef::decode(r.varint()?)?;
        fields.push((field, get_datum_block(r)?));
    }
    Ok(fields)
}

/// Element counts are capped by the bytes left, so hostile input cannot force
/// a huge allocation.
fn bounded_count(r: &mut Reader<'_>) -> Result<usize> {
    let n = r.varint()?;
    if n > r.remaining() as u64 {
        return Err(SombraError::Corruption("undo element count exceeds record"));
    }
    Ok(n as usize)
}

fn put_datum_block(out: &mut Vec<u8>, value: &Datum) {
    let mut block = Vec::new();
    match value {
        Datum::Null => block.push(TAG_NULL),
        Datum::Int(v) => {
            block.push(TAG_INT);
            var::encode_i64(*v, &mut block);
        }
        Datum::Text(s) => {
            block.push(TAG_TEXT);
            block.extend_from_slice(s.as_bytes());
        }
        Datum::Bytes(b) => {
            block.push(TAG_BYTES);
            block.extend_from_slice(b);
        }
        Datum::Extern(field) => {
            block.push(TAG_EXTERN);
            var::encode_u64(field.eref.id, &mut block);
            var::encode_u64(field.eref.len, &mut block);
            block.extend_from_slice(&field.prefix);
        }
        Datum::Missing => block.push(TAG_MISSING),
    }
    put_len_prefixed(out, &block);
}

fn get_datum_block(r: &mut Reader<'_>) -> Result<Datum> {
    let block = r.len_prefixed()?;
    let mut inner = Reader::new(block);
    let tag = inner.u8()?;
    let value = match tag {
        TAG_NULL => Datum::Null,
        TAG_INT => Datum::Int(inner.varint_i64()?),
        TAG_TEXT => {
            let rest = inner.take(inner.remaining())?;
            let text = std::str::from_utf8(rest)
                .map_err(|_| SombraError::Corruption("undo text value not UTF-8"))?;
            Datum::Text(text.to_owned())
        }
        TAG_BYTES => Datum::Bytes(inner.take(inner.remaining())?.to_vec()),
        TAG_EXTERN => {
            let id = inner.varint()?;
            let len = inner.varint()?;
            let prefix = inner.take(inner.remaining())?.to_vec();
            Datum::Extern(ExternField {
                prefix,
                eref: ExternRef { id, len },
            })
        }
        TAG_MISSING => Datum::Missing,
        _ => return Err(SombraError::Corruption("unknown datum tag")),
    };
    if inner.remaining() != 0 {
        return Err(SombraError::Corruption("datum block has trailing bytes"));
    }
    Ok(value)
}
