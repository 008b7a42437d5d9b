//! The host–guest ABI.
//!
//! This module defines the contract between:
//! - **Host**: the engine driver and its callback table
//! - **Guest**: the generated query module
//!
//! ## Imports (guest -> host)
//! Imported from module `"env"`.
//!
//! ### Tracing
//! - `print_i32(v: i32)` / `print_i64(v: i64)` / `print_f32(v: f32)` /
//!   `print_f64(v: f64)` / `print_str(offset: u32)`: print one value to
//!   stdout. String arguments are arena offsets to NUL-terminated bytes.
//!
//! ### Diagnostics
//! - `insist(message_id: i64)`: a generated check failed; the host prints
//!   `file:line[: msg]` and aborts. Never returns.
//! - `throw(kind: i64, message_id: i64)`: raises a typed exception that
//!   unwinds through the engine to the driver. Never returns.
//! - `print_memory_consumption(total: u32, peak: u32)`: allocator counters
//!   in bytes, reported to stdout in MiB.
//!
//! ### Results
//! - `read_result_set(offset: u32, count: u32)`: decode `count` tuples
//!   from the result buffer at `offset` and feed them to the query's sink.
//!   Constant-only queries pass `offset = 0`.
//!
//! ### Indexes
//! For every index kind (`array`, `rmi`) and key type (`b`, `i1`, `i2`,
//! `i4`, `i8`, `f`, `d`, `p`):
//! - `idx_lower_bound_<kind>_<key>(idx: u64, key) -> u32`
//! - `idx_upper_bound_<kind>_<key>(idx: u64, key) -> u32`
//! - `idx_scan_<kind>_<key>(idx: u64, entry: u32, out: u32, batch: u32)`
//!
//! Bounds return the distance from `begin()` to the matched iterator; scan
//! writes `batch` consecutive tuple ids starting at `entry` into guest
//! memory at `out`. String keys (`p`) are `u32` arena offsets to
//! NUL-terminated bytes.
//!
//! ### Table environment
//! For every base table `t` referenced by the plan, the module imports two
//! constant globals: `t_mem` (arena offset of the table image) and
//! `t_num_rows`.
//!
//! ## Exports (host -> guest)
//! - `main(ctx_id: i32) -> u32`: runs the pipelines, returns the number of
//!   result tuples.
//! - `memory`: the instance's linear memory (aliased onto the arena).

use crate::index::IndexKind;

/// Import module name used by generated code.
pub const IMPORT_MODULE: &str = "env";

/// Host import names provided to the guest.
pub mod host_imports {
    pub const PRINT_I32: &str = "print_i32";
    pub const PRINT_I64: &str = "print_i64";
    pub const PRINT_F32: &str = "print_f32";
    pub const PRINT_F64: &str = "print_f64";
    pub const PRINT_STR: &str = "print_str";

    pub const INSIST: &str = "insist";
    pub const THROW: &str = "throw";
    pub const PRINT_MEMORY_CONSUMPTION: &str = "print_memory_consumption";

    pub const READ_RESULT_SET: &str = "read_result_set";
}

/// Guest export names.
pub mod guest_exports {
    pub const MAIN: &str = "main";
    pub const MEMORY: &str = "memory";
}

/// Index callback families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOp {
    LowerBound,
    UpperBound,
    Scan,
}

impl IndexOp {
    fn suffix(self) -> &'static str {
        match self {
            IndexOp::LowerBound => "lower_bound",
            IndexOp::UpperBound => "upper_bound",
            IndexOp::Scan => "scan",
        }
    }
}

/// Key-type naming convention: `b` bool, `i1`/`i2`/`i4`/`i8` signed ints of
/// that byte width, `f` f32, `d` f64, `p` string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    B,
    I1,
    I2,
    I4,
    I8,
    F,
    D,
    P,
}

impl KeyType {
    pub const ALL: [KeyType; 8] = [
        KeyType::B,
        KeyType::I1,
        KeyType::I2,
        KeyType::I4,
        KeyType::I8,
        KeyType::F,
        KeyType::D,
        KeyType::P,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            KeyType::B => "b",
            KeyType::I1 => "i1",
            KeyType::I2 => "i2",
            KeyType::I4 => "i4",
            KeyType::I8 => "i8",
            KeyType::F => "f",
            KeyType::D => "d",
            KeyType::P => "p",
        }
    }
}

/// Canonical import name of an index callback.
pub fn index_import_name(op: IndexOp, kind: IndexKind, key: KeyType) -> String {
    format!("idx_{}_{}_{}", op.suffix(), kind.suffix(), key.suffix())
}

/// One `insist`/`throw` diagnostic: source location plus optional text.
#[derive(Clone, Debug)]
struct Message {
    file: String,
    line: u32,
    msg: String,
}

/// Diagnostics indexed by the ids generated code passes to `insist` and
/// `throw`. Built by the module builder, consulted by the host callbacks.
#[derive(Clone, Debug, Default)]
pub struct MessageTable {
    entries: Vec<Message>,
}

impl MessageTable {
    pub fn add(&mut self, file: impl Into<String>, line: u32, msg: impl Into<String>) -> i64 {
        self.entries.push(Message {
            file: file.into(),
            line,
            msg: msg.into(),
        });
        self.entries.len() as i64 - 1
    }

    pub fn get(&self, id: i64) -> Option<(&str, u32, &str)> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|m| (m.file.as_str(), m.line, m.msg.as_str()))
    }

    /// Renders `file:line` or `file:line: msg` for diagnostics. Unknown ids
    /// render as such instead of failing: this runs on the abort path.
    pub fn render(&self, id: i64) -> String {
        match self.get(id) {
            Some((file, line, "")) => format!("{file}:{line}"),
            Some((file, line, msg)) => format!("{file}:{line}: {msg}"),
            None => format!("<unknown message id {id}>"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
