//! Backend error taxonomy.
//!
//! The split mirrors how failures surface at runtime: invariant violations
//! and unknown context ids indicate corruption and are treated as fatal by
//! the embedding shell, guest exceptions carry their source location out of
//! the engine, and everything the engine itself rejects (compile,
//! instantiate, validation) is reported as a failed query. The backend never
//! retries.

use thiserror::Error;

/// Exception kinds a guest can raise through the `throw` callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Malformed input reached generated code.
    Invalid,
    /// An access left the region generated code was allowed to touch.
    OutOfBounds,
    DivisionByZero,
    /// Generated code reached a branch the generator believed dead.
    Unreachable,
}

impl ExceptionKind {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            1 => ExceptionKind::OutOfBounds,
            2 => ExceptionKind::DivisionByZero,
            3 => ExceptionKind::Unreachable,
            _ => ExceptionKind::Invalid,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            ExceptionKind::Invalid => 0,
            ExceptionKind::OutOfBounds => 1,
            ExceptionKind::DivisionByZero => 2,
            ExceptionKind::Unreachable => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// A host callback was handed a module id with no live context.
    #[error("unknown wasm context id {0}")]
    UnknownContext(u32),

    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The pipeline shape needs the external plan emitter, which is not
    /// part of this backend.
    #[error("unsupported plan shape: {0}")]
    Unsupported(String),

    #[error("arena exhausted: {requested} bytes requested, {available} free")]
    ArenaExhausted { requested: usize, available: usize },

    #[error("virtual memory: {0}")]
    VirtualMemory(String),

    /// The generated module failed validation; this is a code-generator bug.
    #[error("generated module failed validation: {0}")]
    Validation(String),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("sink failure: {0}")]
    Sink(String),

    /// A typed exception raised by the guest through `throw`.
    #[error("guest exception {kind:?} at {file}:{line}: {msg}")]
    Guest {
        kind: ExceptionKind,
        file: String,
        line: u32,
        msg: String,
    },

    #[error(transparent)]
    Store(#[from] quern_plan::StoreError),
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;
