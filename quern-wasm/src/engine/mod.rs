//! The engine driver.
//!
//! Responsibilities per query:
//! 1. Build the engine configuration once, up front: enlarged guest stack,
//!    optimizer level, baseline-vs-optimizing strategy, optional module
//!    cache, and the arena memory creator.
//! 2. Create the Wasm context, map the plan's base tables into the arena,
//!    and drive the module builder through code generation.
//! 3. Define the host callbacks and the per-table environment globals in a
//!    linker, instantiate, and call `exports.main(ctx_id)`.
//! 4. Print the `<n> rows` trailer for print sinks (unless quiet) and
//!    dispose the context, also on failure.
//!
//! The instance's linear memory is obtained through the arena creator, so
//! host and guest share one mapping for the whole query; nothing is copied
//! at the `main` boundary.

pub(crate) mod imports;

use std::io::Write;
use std::sync::Arc;

use wasmtime::{
    Cache, Config, Engine, Global, GlobalType, Linker, Module, Mutability, OptLevel, Store,
    Strategy, Val, ValType,
};

use quern_plan::{Catalog, OperatorKind, PhysicalPlan};

use crate::abi::{guest_exports, IMPORT_MODULE};
use crate::arena::ArenaMemoryCreator;
use crate::codegen;
use crate::config::BackendOptions;
use crate::context::{registry, WasmContext};
use crate::error::{BackendError, Result};
use crate::index::IndexHandle;
use crate::module::ModuleBuilder;
use crate::result::ResultSink;

/// Store data for one query; host callbacks recover everything else from
/// the registry.
pub(crate) struct QueryHost {
    pub context_id: u32,
}

pub struct EngineDriver {
    engine: Engine,
    creator: Arc<ArenaMemoryCreator>,
    options: BackendOptions,
    /// Held for the whole compile + instantiate + `main` span; the memory
    /// creator can only serve one query at a time.
    query_lock: std::sync::Mutex<()>,
}

impl EngineDriver {
    pub fn new(options: BackendOptions) -> Result<Self> {
        let creator = Arc::new(ArenaMemoryCreator::new());
        let mut cfg = Config::new();
        cfg.max_wasm_stack(8 * 1024 * 1024);
        cfg.wasm_multi_value(true);
        cfg.wasm_bulk_memory(true);
        if options.adaptive {
            // Baseline compiler: fast startup at the cost of code quality.
            cfg.strategy(Strategy::Winch);
        } else {
            cfg.strategy(Strategy::Cranelift);
            cfg.cranelift_opt_level(match options.optimization_level {
                0 => OptLevel::None,
                1 => OptLevel::Speed,
                _ => OptLevel::SpeedAndSize,
            });
        }
        if options.compilation_cache {
            let cache =
                Cache::from_file(None).map_err(|e| BackendError::Engine(e.to_string()))?;
            cfg.cache(Some(cache));
        }
        // The aliased arena carries no engine guard region, so bounds checks
        // stay explicit.
        cfg.memory_reservation(0);
        cfg.memory_guard_size(0);
        let host_memory: Arc<dyn wasmtime::MemoryCreator> = creator.clone();
        cfg.with_host_memory(host_memory);
        let engine = Engine::new(&cfg).map_err(|e| BackendError::Engine(e.to_string()))?;
        Ok(Self {
            engine,
            creator,
            options,
            query_lock: std::sync::Mutex::new(()),
        })
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Compiles and runs one query; returns the number of result tuples.
    pub fn execute(
        &self,
        catalog: &Catalog,
        plan: Arc<PhysicalPlan>,
        sink: ResultSink,
    ) -> Result<u32> {
        self.execute_with_indexes(catalog, plan, sink, Vec::new())
    }

    pub fn execute_with_indexes(
        &self,
        catalog: &Catalog,
        plan: Arc<PhysicalPlan>,
        sink: ResultSink,
        indexes: Vec<IndexHandle>,
    ) -> Result<u32> {
        let _query = self
            .query_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut builder = ModuleBuilder::new(self.options.arena_size);
        let mut ctx = WasmContext::create(
            builder.id(),
            plan.clone(),
            self.options.context_config(),
            *catalog.data_layout(),
            sink,
            self.options.arena_size,
        )?;
        for handle in indexes {
            ctx.add_index(handle);
        }
        for table in codegen::collect_tables(&plan) {
            let store = catalog.store(&table).ok_or_else(|| {
                BackendError::Invariant(format!("plan references unknown table `{table}`"))
            })?;
            ctx.map_table(&table, store.bytes(), store.num_rows())?;
        }
        codegen::emit_query(&mut builder, &mut ctx, catalog)?;
        ctx.set_messages(builder.take_messages());
        let bytes = builder.finish()?;

        if self.options.wasm_dump {
            match wasmprinter::print_bytes(&bytes) {
                Ok(text) => println!("{text}"),
                Err(e) => log::warn!("cannot print the generated module: {e}"),
            }
        }
        if self.options.asm_dump {
            log::warn!("asm_dump requested, but the engine does not expose generated machine code");
        }
        log::debug!("query module {}: {} bytes", ctx.id(), bytes.len());

        #[cfg(feature = "inspector")]
        let inspector = self.maybe_start_inspector(ctx.id(), &bytes)?;

        self.creator.install(ctx.arena().view());
        let ctx = registry::install(ctx);
        let outcome = self.run_module(&bytes, &ctx);
        self.creator.clear();

        if let Ok(rows) = outcome {
            if ctx.plan().matched_root().kind == OperatorKind::Print && !self.options.quiet {
                ctx.with_sink(|sink| {
                    if let ResultSink::Print(w) = sink {
                        let _ = writeln!(w, "{rows} rows");
                        let _ = w.flush();
                    }
                });
            }
        }

        #[cfg(feature = "inspector")]
        if let Some(server) = &inspector {
            server.push_event(&match &outcome {
                Ok(rows) => format!("main returned {rows} rows"),
                Err(e) => format!("query failed: {e}"),
            });
        }

        registry::dispose(ctx.id())?;
        outcome
    }

    fn run_module(&self, bytes: &[u8], ctx: &WasmContext) -> Result<u32> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BackendError::Engine(format!("module compilation failed: {e:#}")))?;
        let mut store = Store::new(
            &self.engine,
            QueryHost {
                context_id: ctx.id(),
            },
        );
        let mut linker = Linker::new(&self.engine);
        imports::define_imports(&mut linker)
            .map_err(|e| BackendError::Engine(format!("defining host imports failed: {e:#}")))?;
        for (name, mapping) in ctx.tables() {
            let ty = GlobalType::new(ValType::I32, Mutability::Const);
            let mem = Global::new(&mut store, ty.clone(), Val::I32(mapping.offset as i32))
                .map_err(|e| BackendError::Engine(e.to_string()))?;
            linker
                .define(&mut store, IMPORT_MODULE, &format!("{name}_mem"), mem)
                .map_err(|e| BackendError::Engine(e.to_string()))?;
            let rows = Global::new(&mut store, ty, Val::I32(mapping.num_rows as i32))
                .map_err(|e| BackendError::Engine(e.to_string()))?;
            linker
                .define(&mut store, IMPORT_MODULE, &format!("{name}_num_rows"), rows)
                .map_err(|e| BackendError::Engine(e.to_string()))?;
        }
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| BackendError::Engine(format!("instantiation failed: {e:#}")))?;
        let main = instance
            .get_typed_func::<i32, u32>(&mut store, guest_exports::MAIN)
            .map_err(|e| BackendError::Engine(format!("resolving `main` failed: {e:#}")))?;
        main.call(&mut store, ctx.id() as i32)
            .map_err(|e| match e.downcast::<BackendError>() {
                Ok(backend) => backend,
                Err(e) => BackendError::Engine(format!("{e:#}")),
            })
    }

    #[cfg(feature = "inspector")]
    fn maybe_start_inspector(
        &self,
        id: u32,
        bytes: &[u8],
    ) -> Result<Option<crate::inspector::InspectorServer>> {
        if self.options.cdt_port < 1024 {
            return Ok(None);
        }
        let server =
            crate::inspector::InspectorServer::start(self.options.cdt_port, id, bytes.to_vec())
                .map_err(|e| BackendError::Engine(format!("inspector: {e}")))?;
        log::info!("inspector listening at {}", server.url());
        server.wait_for_bootstrap(std::time::Duration::from_secs(60));
        Ok(Some(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quern_plan::{DataType, Operator, RowLayoutFactory, Schema, SchemaEntry};

    use crate::config::{ContextConfig, WASM_PAGE_SIZE};
    use crate::index::{IndexHandle, IndexKind};

    const TEST_ARENA: usize = 16 * WASM_PAGE_SIZE;

    fn test_options() -> BackendOptions {
        BackendOptions {
            arena_size: TEST_ARENA,
            ..BackendOptions::default()
        }
    }

    fn bare_context(id: u32) -> WasmContext {
        let scan = Operator::scan(
            "t",
            Schema::new(vec![SchemaEntry::new("id", DataType::I32)]),
        );
        WasmContext::create(
            id,
            Arc::new(PhysicalPlan::new(Operator::noop(scan))),
            ContextConfig::default(),
            RowLayoutFactory,
            ResultSink::noop(),
            TEST_ARENA,
        )
        .unwrap()
    }

    /// End to end over the aliased memory: a hand-written guest probes the
    /// array-index callbacks and the host writes tuple ids into the arena.
    #[test]
    fn index_callbacks_reach_guest_memory() {
        let _serial = crate::context::test_serial();
        let driver = EngineDriver::new(test_options()).unwrap();
        let mut ctx = bare_context(700_001);
        ctx.add_index(IndexHandle::over_i32(
            IndexKind::Array,
            vec![(1, 10), (3, 11), (3, 12), (5, 13)],
        ));
        let out = ctx.arena_mut().preallocate(64).unwrap();
        driver.creator.install(ctx.arena().view());
        let ctx = registry::install(ctx);

        let pages = TEST_ARENA / WASM_PAGE_SIZE;
        let wat = format!(
            r#"(module
              (import "env" "idx_lower_bound_array_i4" (func $lb (param i64 i32) (result i32)))
              (import "env" "idx_upper_bound_array_i4" (func $ub (param i64 i32) (result i32)))
              (import "env" "idx_scan_array_i4" (func $scan (param i64 i32 i32 i32)))
              (memory (export "memory") {pages} {pages})
              (func (export "lower") (param i32) (result i32)
                i64.const 0
                local.get 0
                call $lb)
              (func (export "upper") (param i32) (result i32)
                i64.const 0
                local.get 0
                call $ub)
              (func (export "scan") (param i32 i32 i32)
                i64.const 0
                local.get 0
                local.get 1
                local.get 2
                call $scan))"#
        );
        let wasm = wat::parse_str(&wat).unwrap();
        let module = Module::new(&driver.engine, &wasm).unwrap();
        let mut store = Store::new(
            &driver.engine,
            QueryHost {
                context_id: ctx.id(),
            },
        );
        let mut linker = Linker::new(&driver.engine);
        imports::define_imports(&mut linker).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();

        let lower = instance
            .get_typed_func::<i32, i32>(&mut store, "lower")
            .unwrap();
        let upper = instance
            .get_typed_func::<i32, i32>(&mut store, "upper")
            .unwrap();
        assert_eq!(lower.call(&mut store, 3).unwrap(), 1);
        assert_eq!(upper.call(&mut store, 3).unwrap(), 3);

        let scan = instance
            .get_typed_func::<(i32, i32, i32), ()>(&mut store, "scan")
            .unwrap();
        scan.call(&mut store, (1, out as i32, 2)).unwrap();
        let written = ctx.arena().read_bytes(out, 8).unwrap();
        assert_eq!(&written[0..4], &11u32.to_le_bytes());
        assert_eq!(&written[4..8], &12u32.to_le_bytes());

        driver.creator.clear();
        registry::dispose(ctx.id()).unwrap();
    }

    /// A guest `throw` surfaces as a typed error at the `main` call site.
    #[test]
    fn guest_throw_surfaces_as_typed_error() {
        let _serial = crate::context::test_serial();
        let driver = EngineDriver::new(test_options()).unwrap();
        let mut ctx = bare_context(700_002);
        let mut messages = crate::abi::MessageTable::default();
        let msg = messages.add("pipeline.rs", 17, "division by zero in filter");
        ctx.set_messages(messages);
        let ctx = registry::install(ctx);

        let wat = format!(
            r#"(module
              (import "env" "throw" (func $throw (param i64 i64)))
              (func (export "boom")
                i64.const 2
                i64.const {msg}
                call $throw))"#
        );
        let wasm = wat::parse_str(&wat).unwrap();
        let module = Module::new(&driver.engine, &wasm).unwrap();
        let mut store = Store::new(
            &driver.engine,
            QueryHost {
                context_id: ctx.id(),
            },
        );
        let mut linker = Linker::new(&driver.engine);
        imports::define_imports(&mut linker).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let boom = instance.get_typed_func::<(), ()>(&mut store, "boom").unwrap();

        let err = boom.call(&mut store, ()).unwrap_err();
        match err.downcast::<BackendError>() {
            Ok(BackendError::Guest {
                kind,
                file,
                line,
                msg,
            }) => {
                assert_eq!(kind, crate::error::ExceptionKind::DivisionByZero);
                assert_eq!(file, "pipeline.rs");
                assert_eq!(line, 17);
                assert_eq!(msg, "division by zero in filter");
            }
            other => panic!("expected a guest exception, got {other:?}"),
        }

        registry::dispose(ctx.id()).unwrap();
    }
}
