//! Per-query host state and the process-wide context registry.
//!
//! Host callbacks are invoked by the guest with nothing but the module id;
//! the registry is the sole mechanism by which they recover the query's
//! state. Contexts are inserted at query start and removed at query end;
//! those are the only writes, lookups happen in between.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use quern_plan::{PhysicalPlan, RowLayoutFactory};

use crate::abi::MessageTable;
use crate::arena::Arena;
use crate::config::ContextConfig;
use crate::error::{BackendError, Result};
use crate::index::IndexHandle;
use crate::result::ResultSink;

/// Where a mapped base table lives in the arena.
#[derive(Clone, Copy, Debug)]
pub struct TableMapping {
    pub offset: u32,
    pub num_rows: u32,
}

/// Host-side state of one query, addressed by module id.
pub struct WasmContext {
    id: u32,
    arena: Arena,
    tables: HashMap<String, TableMapping>,
    indexes: Vec<IndexHandle>,
    config: ContextConfig,
    plan: Arc<PhysicalPlan>,
    layouts: RowLayoutFactory,
    sink: Mutex<ResultSink>,
    messages: MessageTable,
}

impl WasmContext {
    pub fn create(
        id: u32,
        plan: Arc<PhysicalPlan>,
        config: ContextConfig,
        layouts: RowLayoutFactory,
        sink: ResultSink,
        arena_size: usize,
    ) -> Result<Self> {
        let arena = Arena::reserve(arena_size, config.trap_guard_pages)?;
        Ok(Self {
            id,
            arena,
            tables: HashMap::new(),
            indexes: Vec::new(),
            config,
            plan,
            layouts,
            sink: Mutex::new(sink),
            messages: MessageTable::default(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn config(&self) -> ContextConfig {
        self.config
    }

    pub fn plan(&self) -> &PhysicalPlan {
        &self.plan
    }

    /// Shared handle to the plan; lets callers hold it across arena writes.
    pub fn plan_arc(&self) -> Arc<PhysicalPlan> {
        self.plan.clone()
    }

    pub fn layouts(&self) -> &RowLayoutFactory {
        &self.layouts
    }

    /// Copies a base table image into the arena and records its mapping.
    pub fn map_table(&mut self, name: &str, image: &[u8], num_rows: u32) -> Result<u32> {
        let offset = self.arena.append_region(image)?;
        self.tables
            .insert(name.to_string(), TableMapping { offset, num_rows });
        Ok(offset)
    }

    pub fn table(&self, name: &str) -> Option<&TableMapping> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&String, &TableMapping)> {
        self.tables.iter()
    }

    /// Registers an index handle; its id is the position in registration
    /// order.
    pub fn add_index(&mut self, handle: IndexHandle) -> u64 {
        self.indexes.push(handle);
        self.indexes.len() as u64 - 1
    }

    pub fn index(&self, id: u64) -> Result<&IndexHandle> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.indexes.get(i))
            .ok_or_else(|| BackendError::Invariant(format!("no index with id {id}")))
    }

    pub fn set_messages(&mut self, messages: MessageTable) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &MessageTable {
        &self.messages
    }

    pub fn with_sink<R>(&self, f: impl FnOnce(&mut ResultSink) -> R) -> R {
        f(&mut self.sink.lock().unwrap())
    }
}

/// Process-wide registry: module id -> live context.
pub mod registry {
    use super::*;

    static CONTEXTS: OnceLock<Mutex<HashMap<u32, Arc<WasmContext>>>> = OnceLock::new();

    fn contexts() -> &'static Mutex<HashMap<u32, Arc<WasmContext>>> {
        CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Makes a fully built context visible to host callbacks.
    pub fn install(ctx: WasmContext) -> Arc<WasmContext> {
        let ctx = Arc::new(ctx);
        contexts().lock().unwrap().insert(ctx.id(), ctx.clone());
        ctx
    }

    pub fn get(id: u32) -> Result<Arc<WasmContext>> {
        contexts()
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(BackendError::UnknownContext(id))
    }

    pub fn dispose(id: u32) -> Result<()> {
        contexts()
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::UnknownContext(id))
    }

    pub fn len() -> usize {
        contexts().lock().unwrap().len()
    }
}

/// Serializes tests that observe the process-wide registry; size
/// assertions would otherwise race concurrently executing queries.
#[cfg(test)]
pub(crate) fn test_serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quern_plan::{Operator, Schema, SchemaEntry};

    fn test_context(id: u32) -> WasmContext {
        let scan = Operator::scan(
            "t",
            Schema::new(vec![SchemaEntry::new("id", quern_plan::DataType::I32)]),
        );
        WasmContext::create(
            id,
            Arc::new(PhysicalPlan::new(Operator::noop(scan))),
            ContextConfig::default(),
            RowLayoutFactory,
            ResultSink::noop(),
            2 * crate::config::WASM_PAGE_SIZE,
        )
        .unwrap()
    }

    #[test]
    fn registry_installs_looks_up_and_disposes() {
        let _serial = super::test_serial();
        let before = registry::len();
        let ctx = registry::install(test_context(9001));
        assert_eq!(registry::get(9001).unwrap().id(), ctx.id());
        registry::dispose(9001).unwrap();
        assert_eq!(registry::len(), before);
        assert!(matches!(
            registry::get(9001),
            Err(BackendError::UnknownContext(9001))
        ));
        assert!(matches!(
            registry::dispose(9001),
            Err(BackendError::UnknownContext(9001))
        ));
    }

    #[test]
    fn table_mappings_round_trip() {
        let mut ctx = test_context(9002);
        let offset = ctx.map_table("t", &[1, 2, 3, 4], 1).unwrap();
        let mapping = ctx.table("t").unwrap();
        assert_eq!(mapping.offset, offset);
        assert_eq!(mapping.num_rows, 1);
        assert_eq!(ctx.arena().read_bytes(offset, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn index_ids_follow_registration_order() {
        let mut ctx = test_context(9003);
        let id = ctx.add_index(crate::index::IndexHandle::over_i32(
            crate::index::IndexKind::Array,
            vec![(1, 0)],
        ));
        assert_eq!(id, 0);
        assert!(ctx.index(0).is_ok());
        assert!(ctx.index(5).is_err());
    }
}
