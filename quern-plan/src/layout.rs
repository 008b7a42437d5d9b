//! Physical row layouts.
//!
//! A `RowLayout` describes one row of a schema in memory: a leading NULL
//! bitmap of `ceil(n / 8)` bytes, then the fields in schema order at their
//! natural alignment, with the stride rounded up to the widest alignment so
//! rows can be stacked back to back.
//!
//! The same layout code serves two encodings that differ only in how strings
//! are represented:
//!
//! - [`StringRepr::Inline`] for store rows: `Char(n)` occupies `n` bytes
//!   in-row, NUL-terminated.
//! - [`StringRepr::Pointer`] for result-buffer rows: `Char(_)` occupies a
//!   4-byte arena offset to NUL-terminated bytes.

use crate::schema::Schema;
use crate::types::DataType;

/// How `Char` columns are encoded in a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringRepr {
    Inline,
    Pointer,
}

#[derive(Clone, Debug)]
pub struct RowLayout {
    offsets: Vec<u32>,
    sizes: Vec<u32>,
    null_bytes: u32,
    stride: u32,
    repr: StringRepr,
}

impl RowLayout {
    pub fn new(schema: &Schema, repr: StringRepr) -> Self {
        let null_bytes = schema.len().div_ceil(8) as u32;
        let mut offsets = Vec::with_capacity(schema.len());
        let mut sizes = Vec::with_capacity(schema.len());
        let mut cursor = null_bytes;
        let mut max_align = 1;
        for entry in schema.iter() {
            let (size, align) = field_shape(entry.ty, repr);
            max_align = max_align.max(align);
            cursor = align_up(cursor, align);
            offsets.push(cursor);
            sizes.push(size);
            cursor += size;
        }
        Self {
            offsets,
            sizes,
            null_bytes,
            stride: align_up(cursor, max_align),
            repr,
        }
    }

    pub fn offset_of(&self, i: usize) -> u32 {
        self.offsets[i]
    }

    pub fn field_size(&self, i: usize) -> u32 {
        self.sizes[i]
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn null_bitmap_len(&self) -> u32 {
        self.null_bytes
    }

    pub fn string_repr(&self) -> StringRepr {
        self.repr
    }

    /// Byte within the bitmap holding column `i`'s NULL bit.
    pub fn null_byte(i: usize) -> u32 {
        (i / 8) as u32
    }

    /// Bit within that byte.
    pub fn null_bit(i: usize) -> u32 {
        (i % 8) as u32
    }
}

fn field_shape(ty: DataType, repr: StringRepr) -> (u32, u32) {
    match (ty, repr) {
        (DataType::Char(_), StringRepr::Pointer) => (4, 4),
        (ty, _) => (ty.inline_size(), ty.inline_align()),
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two() || align == 1);
    value.div_ceil(align) * align
}

/// The `data_layout()` collaborator: hands out layouts for schemas.
#[derive(Clone, Copy, Debug, Default)]
pub struct RowLayoutFactory;

impl RowLayoutFactory {
    /// Layout of a base-table row (strings inline).
    pub fn store_layout(&self, schema: &Schema) -> RowLayout {
        RowLayout::new(schema, StringRepr::Inline)
    }

    /// Layout of a result-buffer row (strings as arena offsets).
    pub fn payload_layout(&self, schema: &Schema) -> RowLayout {
        RowLayout::new(schema, StringRepr::Pointer)
    }
}
