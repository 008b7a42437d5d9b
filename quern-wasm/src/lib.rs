//! quern-wasm: the WebAssembly execution backend of the quern analytical
//! database.
//!
//! Given a matched physical plan, the backend
//!
//! 1. emits a Wasm module implementing the plan's pipelines (`module`,
//!    `codegen`),
//! 2. instantiates it inside an embedded engine whose linear memory aliases
//!    the query's arena (`arena`, `engine`); host and guest share one
//!    mapping, nothing is copied across the `main` boundary,
//! 3. decodes the guest-written result buffer back into typed rows for a
//!    callback or print sink (`result`).
//!
//! The guest imports the host ABI defined in `abi`: tracing prints,
//! `insist`/`throw` diagnostics, `read_result_set`, and typed index
//! callbacks over every (kind × key type) pair (`index`). Per-query state
//! lives in a `WasmContext` addressed by module id through a process-wide
//! registry (`context`); host callbacks receive only that id.
//!
//! An optional remote-debug channel is available behind the `inspector`
//! feature (`inspector`).

mod abi;
mod arena;
mod codegen;
mod config;
mod context;
mod engine;
mod error;
mod index;
mod module;
mod result;

#[cfg(feature = "inspector")]
mod inspector;

#[cfg(test)]
mod tests;

pub use abi::{guest_exports, host_imports, index_import_name, IndexOp, KeyType, MessageTable,
    IMPORT_MODULE};
pub use arena::{Arena, ArenaMemoryCreator, ArenaView};
pub use codegen::{collect_string_literals, collect_tables, EmitInfo};
pub use config::{BackendOptions, ContextConfig, WASM_PAGE_SIZE};
pub use context::{registry, TableMapping, WasmContext};
pub use engine::EngineDriver;
pub use error::{BackendError, ExceptionKind, Result};
pub use index::{
    ArrayIndex, BoundOp, HostKey, IndexHandle, IndexKey, IndexKind, KeyedIndex, OrderedIndex,
    RmiIndex,
};
pub use module::ModuleBuilder;
pub use result::{read_result_set, ResultSink};

#[cfg(feature = "inspector")]
pub use inspector::InspectorServer;

/// Registers this backend with a catalog.
pub fn register(catalog: &mut quern_plan::Catalog) {
    catalog.register_backend("wasm", "WebAssembly execution backend (wasmtime)");
}
