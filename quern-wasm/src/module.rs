//! The module builder.
//!
//! Accumulates everything code generation produces for one query (typed
//! function imports, per-table global imports, the string-literal pool,
//! pre-allocated arena regions, the diagnostic message table and the `run`
//! body) and assembles the final binary:
//!
//! - `run` executes the pipelines and leaves the row count in a module
//!   global,
//! - `main(ctx_id) -> u32` wraps `run`, reports allocator counters through
//!   `print_memory_consumption` (when imported) and returns the row count,
//! - the memory is defined (not imported) and sized to the arena, so the
//!   engine's memory creator aliases it onto the arena at instantiation.
//!
//! In debug builds the binary is validated before use; a failure is a
//! code-generator bug and aborts the query with a module dump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use wasm_encoder::{
    CodeSection, ConstExpr, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    GlobalSection, GlobalType, ImportSection, Instruction, MemorySection, MemoryType, Module,
    TypeSection, ValType,
};

use crate::abi::{host_imports, IMPORT_MODULE, MessageTable};
use crate::arena::Arena;
use crate::config::WASM_PAGE_SIZE;
use crate::error::{BackendError, Result};

static NEXT_MODULE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug)]
pub struct ModuleBuilder {
    id: u32,
    memory_pages: u64,
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    func_imports: Vec<(String, u32)>,
    func_import_index: HashMap<String, u32>,
    global_imports: Vec<String>,
    global_import_index: HashMap<String, u32>,
    literal_offsets: HashMap<String, u32>,
    preallocated_total: u32,
    messages: MessageTable,
    run_body: Option<Function>,
}

impl ModuleBuilder {
    pub fn new(arena_size: usize) -> Self {
        Self {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            memory_pages: arena_size.div_ceil(WASM_PAGE_SIZE) as u64,
            types: Vec::new(),
            func_imports: Vec::new(),
            func_import_index: HashMap::new(),
            global_imports: Vec::new(),
            global_import_index: HashMap::new(),
            literal_offsets: HashMap::new(),
            preallocated_total: 0,
            messages: MessageTable::default(),
            run_body: None,
        }
    }

    /// Module id; doubles as the wasm-context id for this query.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Registers a typed function import and returns its function index.
    /// Re-registering the same name returns the existing index.
    pub fn import_func(&mut self, name: &str, params: &[ValType], results: &[ValType]) -> u32 {
        if let Some(&idx) = self.func_import_index.get(name) {
            return idx;
        }
        let type_idx = self.intern_type(params.to_vec(), results.to_vec());
        let idx = self.func_imports.len() as u32;
        self.func_imports.push((name.to_string(), type_idx));
        self.func_import_index.insert(name.to_string(), idx);
        idx
    }

    pub fn func_index(&self, name: &str) -> Option<u32> {
        self.func_import_index.get(name).copied()
    }

    /// Registers an imported constant `i32` global (table environment).
    pub fn import_global(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.global_import_index.get(name) {
            return idx;
        }
        let idx = self.global_imports.len() as u32;
        self.global_imports.push(name.to_string());
        self.global_import_index.insert(name.to_string(), idx);
        idx
    }

    pub fn add_message(&mut self, file: &str, line: u32, msg: &str) -> i64 {
        self.messages.add(file, line, msg)
    }

    pub fn take_messages(&mut self) -> MessageTable {
        std::mem::take(&mut self.messages)
    }

    /// Concatenates the deduplicated literals NUL-terminated into one arena
    /// region and records each literal's offset.
    pub fn install_literals(&mut self, arena: &mut Arena, literals: &[String]) -> Result<()> {
        let mut pool = Vec::new();
        let mut relative = Vec::new();
        for literal in literals {
            if self.literal_offsets.contains_key(literal)
                || relative.iter().any(|(l, _)| l == literal)
            {
                continue;
            }
            relative.push((literal.clone(), pool.len() as u32));
            pool.extend_from_slice(literal.as_bytes());
            pool.push(0);
        }
        if pool.is_empty() {
            return Ok(());
        }
        let base = arena.append_region(&pool)?;
        for (literal, rel) in relative {
            self.literal_offsets.insert(literal, base + rel);
        }
        Ok(())
    }

    pub fn literal_offset(&self, literal: &str) -> Option<u32> {
        self.literal_offsets.get(literal).copied()
    }

    /// Reserves a zeroed arena region on the guest's behalf (result
    /// buffers, scratch) and tracks the total for the allocator report.
    pub fn preallocate(&mut self, arena: &mut Arena, len: u32) -> Result<u32> {
        let offset = arena.preallocate(len as usize)?;
        self.preallocated_total += len;
        Ok(offset)
    }

    pub fn preallocated_total(&self) -> u32 {
        self.preallocated_total
    }

    pub fn num_func_imports(&self) -> u32 {
        self.func_imports.len() as u32
    }

    /// Function index of `run` (first defined function).
    pub fn run_func_index(&self) -> u32 {
        self.func_imports.len() as u32
    }

    pub fn main_func_index(&self) -> u32 {
        self.run_func_index() + 1
    }

    /// Index of the defined mutable global holding the row count. Imported
    /// globals precede defined ones, so this is only stable once every
    /// global import has been registered.
    pub fn rows_global_index(&self) -> u32 {
        self.global_imports.len() as u32
    }

    pub fn set_run_body(&mut self, body: Function) {
        self.run_body = Some(body);
    }

    fn intern_type(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        if let Some(idx) = self
            .types
            .iter()
            .position(|(p, r)| *p == params && *r == results)
        {
            return idx as u32;
        }
        self.types.push((params, results));
        self.types.len() as u32 - 1
    }

    /// Emits the binary. Validated in debug builds; a validation failure is
    /// fatal and carries a textual module dump in the log.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let run_type = self.intern_type(vec![], vec![]);
        let main_type = self.intern_type(vec![ValType::I32], vec![ValType::I32]);

        let mut module = Module::new();

        let mut types = TypeSection::new();
        for (params, results) in &self.types {
            types
                .ty()
                .function(params.iter().copied(), results.iter().copied());
        }
        module.section(&types);

        let mut imports = ImportSection::new();
        for (name, type_idx) in &self.func_imports {
            imports.import(IMPORT_MODULE, name, EntityType::Function(*type_idx));
        }
        for name in &self.global_imports {
            imports.import(
                IMPORT_MODULE,
                name,
                EntityType::Global(GlobalType {
                    val_type: ValType::I32,
                    mutable: false,
                    shared: false,
                }),
            );
        }
        module.section(&imports);

        let mut functions = FunctionSection::new();
        functions.function(run_type);
        functions.function(main_type);
        module.section(&functions);

        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: self.memory_pages,
            maximum: Some(self.memory_pages),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);

        let mut globals = GlobalSection::new();
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: true,
                shared: false,
            },
            &ConstExpr::i32_const(0),
        );
        module.section(&globals);

        let mut exports = ExportSection::new();
        exports.export(
            crate::abi::guest_exports::MAIN,
            ExportKind::Func,
            self.main_func_index(),
        );
        exports.export(crate::abi::guest_exports::MEMORY, ExportKind::Memory, 0);
        module.section(&exports);

        let mut code = CodeSection::new();
        let run = self.run_body.take().unwrap_or_else(|| {
            let mut f = Function::new(vec![]);
            f.instruction(&Instruction::End);
            f
        });
        code.function(&run);
        code.function(&self.build_main());
        module.section(&code);

        let bytes = module.finish();
        if cfg!(debug_assertions) {
            if let Err(e) = wasmparser::Validator::new().validate_all(&bytes) {
                let dump = wasmprinter::print_bytes(&bytes)
                    .unwrap_or_else(|_| "<module not printable>".to_string());
                log::error!("generated module failed validation: {e}\n{dump}");
                return Err(BackendError::Validation(e.to_string()));
            }
        }
        Ok(bytes)
    }

    fn build_main(&self) -> Function {
        let mut main = Function::new(vec![]);
        main.instruction(&Instruction::Call(self.run_func_index()));
        if let Some(pmc) = self.func_index(host_imports::PRINT_MEMORY_CONSUMPTION) {
            // Result buffers are pre-allocated host side, so total == peak.
            let total = self.preallocated_total as i32;
            main.instruction(&Instruction::I32Const(total));
            main.instruction(&Instruction::I32Const(total));
            main.instruction(&Instruction::Call(pmc));
        }
        main.instruction(&Instruction::GlobalGet(self.rows_global_index()));
        main.instruction(&Instruction::End);
        main
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_module_validates() {
        let mut builder = ModuleBuilder::new(WASM_PAGE_SIZE);
        let bytes = builder.finish().unwrap();
        wasmparser::Validator::new().validate_all(&bytes).unwrap();
    }

    #[test]
    fn module_ids_are_unique() {
        let a = ModuleBuilder::new(WASM_PAGE_SIZE);
        let b = ModuleBuilder::new(WASM_PAGE_SIZE);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn imports_are_deduplicated() {
        let mut builder = ModuleBuilder::new(WASM_PAGE_SIZE);
        let a = builder.import_func("read_result_set", &[ValType::I32, ValType::I32], &[]);
        let b = builder.import_func("read_result_set", &[ValType::I32, ValType::I32], &[]);
        let c = builder.import_func("insist", &[ValType::I64], &[]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(builder.num_func_imports(), 2);
        assert_eq!(builder.run_func_index(), 2);
        assert_eq!(builder.main_func_index(), 3);
    }

    #[test]
    fn literal_pool_is_nul_terminated_and_deduplicated() {
        let mut arena = Arena::reserve(WASM_PAGE_SIZE, false).unwrap();
        let mut builder = ModuleBuilder::new(WASM_PAGE_SIZE);
        builder
            .install_literals(
                &mut arena,
                &["ash".to_string(), "flint".to_string(), "ash".to_string()],
            )
            .unwrap();
        let ash = builder.literal_offset("ash").unwrap();
        let flint = builder.literal_offset("flint").unwrap();
        assert_eq!(arena.read_bytes(ash, 4).unwrap(), b"ash\0");
        assert_eq!(arena.read_bytes(flint, 6).unwrap(), b"flint\0");
        assert_eq!(arena.read_cstr(ash).unwrap(), "ash");
        assert!(builder.literal_offset("granite").is_none());
    }

    #[test]
    fn module_with_imports_and_globals_validates() {
        let mut builder = ModuleBuilder::new(WASM_PAGE_SIZE);
        let rrs = builder.import_func("read_result_set", &[ValType::I32, ValType::I32], &[]);
        let rows_global = builder.import_global("t_num_rows");
        let mut run = Function::new(vec![]);
        run.instruction(&Instruction::GlobalGet(rows_global));
        run.instruction(&Instruction::GlobalSet(builder.rows_global_index()));
        run.instruction(&Instruction::I32Const(0));
        run.instruction(&Instruction::GlobalGet(builder.rows_global_index()));
        run.instruction(&Instruction::Call(rrs));
        run.instruction(&Instruction::End);
        builder.set_run_body(run);
        let bytes = builder.finish().unwrap();
        wasmparser::Validator::new().validate_all(&bytes).unwrap();
    }
}
