//! Backend and per-context configuration.

/// Size of one WebAssembly page. Arena sizes are multiples of this so the
/// reservation maps exactly onto the guest's linear memory.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Options recognized by the execution backend. Defaults are conservative.
#[derive(Clone, Debug)]
pub struct BackendOptions {
    /// Optimizer pass level, 0..=2. Maps onto the engine's codegen levels.
    pub optimization_level: u8,
    /// Prefer the engine's baseline compiler for fast startup over the
    /// optimizing tier.
    pub adaptive: bool,
    /// Enable the engine's compiled-module cache.
    pub compilation_cache: bool,
    /// Print the generated module in text format to stdout.
    pub wasm_dump: bool,
    /// Print generated machine code to stdout. The embedded engine does not
    /// expose it; the option is accepted and reported as unavailable.
    pub asm_dump: bool,
    /// Ports >= 1024 activate the inspector (requires the `inspector`
    /// feature).
    pub cdt_port: u16,
    /// Suppress the trailing `<n> rows` line on print sinks.
    pub quiet: bool,
    /// Bytes reserved per query arena; rounded up to a whole number of
    /// Wasm pages.
    pub arena_size: usize,
    /// Interleave unmapped guard pages between host-appended arena regions.
    pub trap_guard_pages: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            optimization_level: 1,
            adaptive: false,
            compilation_cache: false,
            wasm_dump: false,
            asm_dump: false,
            cdt_port: 0,
            quiet: false,
            arena_size: 512 * 1024 * 1024,
            trap_guard_pages: false,
        }
    }
}

/// Per-context flag set.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextConfig {
    /// `TRAP_GUARD_PAGES`: every host-appended region is followed by at
    /// least one unmapped page, so overshooting guest pointer arithmetic
    /// traps instead of corrupting the next region.
    pub trap_guard_pages: bool,
}

impl BackendOptions {
    pub(crate) fn context_config(&self) -> ContextConfig {
        ContextConfig {
            trap_guard_pages: self.trap_guard_pages,
        }
    }
}
