//! The catalog: tables, their stores, and registered execution backends.

use std::collections::HashMap;

use crate::layout::RowLayoutFactory;
use crate::store::{RowStore, Table};

#[derive(Default)]
pub struct Catalog {
    stores: HashMap<String, RowStore>,
    layouts: RowLayoutFactory,
    backends: Vec<(String, String)>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) the store backing `table`.
    pub fn create_store(&mut self, table: Table) -> &mut RowStore {
        let name = table.name.clone();
        let store = RowStore::new(table, &self.layouts);
        self.stores.insert(name.clone(), store);
        self.stores.get_mut(&name).expect("store was just inserted")
    }

    pub fn store(&self, name: &str) -> Option<&RowStore> {
        self.stores.get(name)
    }

    pub fn store_mut(&mut self, name: &str) -> Option<&mut RowStore> {
        self.stores.get_mut(name)
    }

    /// The data-layout factory shared by stores and result readers.
    pub fn data_layout(&self) -> &RowLayoutFactory {
        &self.layouts
    }

    /// Registration hook for execution backends.
    pub fn register_backend(&mut self, name: impl Into<String>, desc: impl Into<String>) {
        self.backends.push((name.into(), desc.into()));
    }

    pub fn backends(&self) -> &[(String, String)] {
        &self.backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, SchemaEntry};
    use crate::types::DataType;

    #[test]
    fn create_and_look_up_store() {
        let mut catalog = Catalog::new();
        let schema = Schema::new(vec![SchemaEntry::new("id", DataType::I32)]);
        catalog.create_store(Table::new("t", schema));
        assert!(catalog.store("t").is_some());
        assert!(catalog.store("missing").is_none());
    }

    #[test]
    fn backend_registration() {
        let mut catalog = Catalog::new();
        catalog.register_backend("wasm", "WebAssembly execution backend");
        assert_eq!(catalog.backends().len(), 1);
    }
}
