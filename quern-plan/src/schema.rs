//! Schemas and their derived views.
//!
//! A result schema may mention the same column twice (`SELECT id, id`) and
//! may contain constant-valued entries (`SELECT 1, x`). The backend stores
//! neither: result buffers hold exactly the columns of
//! [`Schema::deduplicated_without_constants`]. Both derived views preserve
//! first-occurrence order.

use crate::types::DataType;

/// One column of a schema.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaEntry {
    pub ident: String,
    pub ty: DataType,
    /// Entry whose value is fixed by a projection expression and therefore
    /// absent from the result buffer.
    pub constant: bool,
}

impl SchemaEntry {
    pub fn new(ident: impl Into<String>, ty: DataType) -> Self {
        Self {
            ident: ident.into(),
            ty,
            constant: false,
        }
    }

    pub fn constant(ident: impl Into<String>, ty: DataType) -> Self {
        Self {
            ident: ident.into(),
            ty,
            constant: true,
        }
    }
}

/// Ordered sequence of schema entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    entries: Vec<SchemaEntry>,
}

impl Schema {
    pub fn new(entries: Vec<SchemaEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: SchemaEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&SchemaEntry> {
        self.entries.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter()
    }

    /// Position of the first entry named `ident`.
    pub fn position(&self, ident: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.ident == ident)
    }

    /// Duplicate identifiers collapsed; the first occurrence wins.
    pub fn deduplicated(&self) -> Schema {
        let mut out = Schema::default();
        for entry in &self.entries {
            if out.position(&entry.ident).is_none() {
                out.push(entry.clone());
            }
        }
        out
    }

    /// [`Schema::deduplicated`] with constant entries removed. The result
    /// buffer contains exactly these columns.
    pub fn deduplicated_without_constants(&self) -> Schema {
        let mut out = Schema::default();
        for entry in &self.entries {
            if !entry.constant && out.position(&entry.ident).is_none() {
                out.push(entry.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            SchemaEntry::new("id", DataType::I32),
            SchemaEntry::constant("one", DataType::I32),
            SchemaEntry::new("id", DataType::I32),
            SchemaEntry::new("name", DataType::Char(8)),
        ])
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let d = schema().deduplicated();
        let idents: Vec<_> = d.iter().map(|e| e.ident.as_str()).collect();
        assert_eq!(idents, ["id", "one", "name"]);
    }

    #[test]
    fn payload_view_drops_constants_and_duplicates() {
        let p = schema().deduplicated_without_constants();
        let idents: Vec<_> = p.iter().map(|e| e.ident.as_str()).collect();
        assert_eq!(idents, ["id", "name"]);
    }

    #[test]
    fn all_constant_schema_has_empty_payload_view() {
        let s = Schema::new(vec![
            SchemaEntry::constant("a", DataType::I32),
            SchemaEntry::constant("b", DataType::Null),
        ]);
        assert!(s.deduplicated_without_constants().is_empty());
    }
}
