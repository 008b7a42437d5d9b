//! Row-major in-memory stores.
//!
//! A `RowStore` holds the base table image that the execution backend maps
//! into its arena: rows encoded back to back per the store layout of the
//! table's schema. The decoder ([`RowStore::read_row`]) mirrors the encoder
//! exactly so that round-trip tests close the loop over the layout.

use thiserror::Error;

use crate::layout::{RowLayout, RowLayoutFactory};
use crate::schema::{Schema, SchemaEntry};
use crate::tuple::Tuple;
use crate::types::{DataType, Value};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tuple arity {got} does not match schema arity {expected}")]
    Arity { expected: usize, got: usize },
    #[error("value type mismatch for column `{0}`")]
    TypeMismatch(String),
    #[error("string for column `{column}` exceeds capacity {capacity}")]
    StringTooLong { column: String, capacity: u32 },
}

/// A named table definition.
#[derive(Clone, Debug)]
pub struct Table {
    pub name: String,
    pub schema: Schema,
}

impl Table {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

pub struct RowStore {
    table: Table,
    layout: RowLayout,
    data: Vec<u8>,
    rows: u32,
}

impl RowStore {
    pub fn new(table: Table, factory: &RowLayoutFactory) -> Self {
        let layout = factory.store_layout(&table.schema);
        Self {
            table,
            layout,
            data: Vec::new(),
            rows: 0,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn schema(&self) -> &Schema {
        &self.table.schema
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn num_rows(&self) -> u32 {
        self.rows
    }

    pub fn row_size(&self) -> u32 {
        self.layout.stride()
    }

    /// The raw table image, `num_rows * row_size` bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn append(&mut self, tuple: &Tuple) -> Result<(), StoreError> {
        let schema = &self.table.schema;
        if tuple.arity() != schema.len() {
            return Err(StoreError::Arity {
                expected: schema.len(),
                got: tuple.arity(),
            });
        }
        let mut row = vec![0u8; self.layout.stride() as usize];
        for (i, entry) in schema.iter().enumerate() {
            match tuple.get(i) {
                None => {
                    let byte = RowLayout::null_byte(i) as usize;
                    row[byte] |= 1 << RowLayout::null_bit(i);
                }
                Some(value) => {
                    encode(&mut row, self.layout.offset_of(i) as usize, entry, value)?
                }
            }
        }
        self.data.extend_from_slice(&row);
        self.rows += 1;
        Ok(())
    }

    /// Decodes row `row` back into a tuple, `None` past the end.
    pub fn read_row(&self, row: u32) -> Option<Tuple> {
        if row >= self.rows {
            return None;
        }
        let schema = &self.table.schema;
        let base = (row * self.layout.stride()) as usize;
        let bytes = &self.data[base..base + self.layout.stride() as usize];
        let mut tuple = Tuple::with_arity(schema.len());
        for (i, entry) in schema.iter().enumerate() {
            let null_byte = bytes[RowLayout::null_byte(i) as usize];
            if null_byte & (1 << RowLayout::null_bit(i)) != 0 {
                continue;
            }
            let off = self.layout.offset_of(i) as usize;
            tuple.set(i, Some(decode(bytes, off, entry.ty)));
        }
        Some(tuple)
    }
}

fn encode(
    row: &mut [u8],
    off: usize,
    entry: &SchemaEntry,
    value: &Value,
) -> Result<(), StoreError> {
    match (entry.ty, value) {
        (DataType::Bool, Value::Bool(v)) => row[off] = *v as u8,
        (DataType::I8, Value::I8(v)) => row[off] = *v as u8,
        (DataType::I16, Value::I16(v)) => row[off..off + 2].copy_from_slice(&v.to_le_bytes()),
        (DataType::I32, Value::I32(v)) => row[off..off + 4].copy_from_slice(&v.to_le_bytes()),
        (DataType::I64, Value::I64(v)) => row[off..off + 8].copy_from_slice(&v.to_le_bytes()),
        (DataType::F32, Value::F32(v)) => row[off..off + 4].copy_from_slice(&v.to_le_bytes()),
        (DataType::F64, Value::F64(v)) => row[off..off + 8].copy_from_slice(&v.to_le_bytes()),
        (DataType::Decimal { .. }, Value::Decimal(v)) => {
            row[off..off + 8].copy_from_slice(&v.to_le_bytes())
        }
        (DataType::Date, Value::Date(v)) => row[off..off + 4].copy_from_slice(&v.to_le_bytes()),
        (DataType::DateTime, Value::DateTime(v)) => {
            row[off..off + 8].copy_from_slice(&v.to_le_bytes())
        }
        (DataType::Char(capacity), Value::Str(s)) => {
            if s.len() as u32 + 1 > capacity {
                return Err(StoreError::StringTooLong {
                    column: entry.ident.clone(),
                    capacity,
                });
            }
            row[off..off + s.len()].copy_from_slice(s.as_bytes());
            row[off + s.len()] = 0;
        }
        _ => return Err(StoreError::TypeMismatch(entry.ident.clone())),
    }
    Ok(())
}

fn decode(row: &[u8], off: usize, ty: DataType) -> Value {
    let le4 = |o: usize| <[u8; 4]>::try_from(&row[o..o + 4]).unwrap();
    let le8 = |o: usize| <[u8; 8]>::try_from(&row[o..o + 8]).unwrap();
    match ty {
        DataType::Bool => Value::Bool(row[off] != 0),
        DataType::I8 => Value::I8(row[off] as i8),
        DataType::I16 => Value::I16(i16::from_le_bytes([row[off], row[off + 1]])),
        DataType::I32 => Value::I32(i32::from_le_bytes(le4(off))),
        DataType::I64 => Value::I64(i64::from_le_bytes(le8(off))),
        DataType::F32 => Value::F32(f32::from_le_bytes(le4(off))),
        DataType::F64 => Value::F64(f64::from_le_bytes(le8(off))),
        DataType::Decimal { .. } => Value::Decimal(i64::from_le_bytes(le8(off))),
        DataType::Date => Value::Date(i32::from_le_bytes(le4(off))),
        DataType::DateTime => Value::DateTime(i64::from_le_bytes(le8(off))),
        DataType::Char(capacity) => {
            let field = &row[off..off + capacity as usize];
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            Value::Str(String::from_utf8_lossy(&field[..end]).into_owned())
        }
        DataType::Null => unreachable!("NULL-typed columns are never stored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaEntry;
    use crate::types::pack_date;

    fn store() -> RowStore {
        let schema = Schema::new(vec![
            SchemaEntry::new("id", DataType::I32),
            SchemaEntry::new("name", DataType::Char(8)),
            SchemaEntry::new("born", DataType::Date),
        ]);
        RowStore::new(Table::new("people", schema), &RowLayoutFactory)
    }

    #[test]
    fn append_and_read_round_trip() {
        let mut s = store();
        let rows = vec![
            Tuple::from(vec![
                Some(Value::I32(1)),
                Some(Value::Str("ada".into())),
                Some(Value::Date(pack_date(1815, 12, 10))),
            ]),
            Tuple::from(vec![Some(Value::I32(2)), None, None]),
        ];
        for row in &rows {
            s.append(row).unwrap();
        }
        assert_eq!(s.num_rows(), 2);
        assert_eq!(s.bytes().len(), (s.row_size() * 2) as usize);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(&s.read_row(i as u32).unwrap(), row);
        }
        assert!(s.read_row(2).is_none());
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut s = store();
        let err = s
            .append(&Tuple::from(vec![
                Some(Value::I32(1)),
                Some(Value::Str("much too long".into())),
                None,
            ]))
            .unwrap_err();
        assert!(matches!(err, StoreError::StringTooLong { .. }));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut s = store();
        let err = s
            .append(&Tuple::from(vec![
                Some(Value::Bool(true)),
                None,
                None,
            ]))
            .unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch(_)));
    }
}
