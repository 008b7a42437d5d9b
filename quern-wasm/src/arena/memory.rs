//! Aliasing the arena as the guest's linear memory.
//!
//! The engine is configured with an [`ArenaMemoryCreator`] before the first
//! query. When a generated module is instantiated, the engine asks the
//! creator for the instance's defined memory and receives a view of the
//! current query's arena instead of a fresh allocation. Both sides then
//! share one mapping and nothing is copied across the `main` boundary.
//!
//! The driver installs the view right before instantiation and clears it
//! right after the query, so the creator can never hand out a stale arena.

use std::sync::Mutex;

use wasmtime::{LinearMemory, MemoryCreator, MemoryType};

/// Raw view of one query's arena.
#[derive(Clone, Copy, Debug)]
pub struct ArenaView {
    pub base: *mut u8,
    pub size: usize,
}

// The view is only dereferenced while its arena (kept alive in the context
// registry) outlives the instance; the driver tears the instance down before
// disposing the context.
unsafe impl Send for ArenaView {}
unsafe impl Sync for ArenaView {}

/// Hands out the current query's arena as instance memory.
#[derive(Debug, Default)]
pub struct ArenaMemoryCreator {
    current: Mutex<Option<ArenaView>>,
}

impl ArenaMemoryCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, view: ArenaView) {
        *self.current.lock().unwrap() = Some(view);
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }
}

unsafe impl MemoryCreator for ArenaMemoryCreator {
    fn new_memory(
        &self,
        _ty: MemoryType,
        minimum: usize,
        maximum: Option<usize>,
        _reserved_size_in_bytes: Option<usize>,
        _guard_size_in_bytes: usize,
    ) -> Result<Box<dyn LinearMemory>, String> {
        let view = *self.current.lock().unwrap();
        let view = view.ok_or_else(|| "no arena installed for instantiation".to_string())?;
        if view.size < minimum {
            return Err(format!(
                "arena of {} bytes cannot back a memory with minimum {minimum}",
                view.size
            ));
        }
        if maximum.is_some_and(|max| max < view.size) {
            return Err(format!(
                "memory maximum {} is smaller than the arena ({} bytes)",
                maximum.unwrap_or_default(),
                view.size
            ));
        }
        Ok(Box::new(ArenaLinearMemory { view }))
    }
}

struct ArenaLinearMemory {
    view: ArenaView,
}

unsafe impl LinearMemory for ArenaLinearMemory {
    fn byte_size(&self) -> usize {
        self.view.size
    }

    fn byte_capacity(&self) -> usize {
        self.view.size
    }

    fn grow_to(&mut self, new_size: usize) -> wasmtime::Result<()> {
        if new_size <= self.view.size {
            Ok(())
        } else {
            anyhow::bail!("arena-backed memory is fixed at {} bytes", self.view.size)
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.view.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_refuses_without_an_installed_arena() {
        let creator = ArenaMemoryCreator::new();
        let err = creator
            .new_memory(
                MemoryType::new(1, Some(1)),
                64 * 1024,
                Some(64 * 1024),
                None,
                0,
            )
            .err()
            .unwrap();
        assert!(err.contains("no arena installed"));
    }

    #[test]
    fn creator_hands_out_the_installed_view() {
        let mut backing = vec![0u8; 2 * 64 * 1024];
        let creator = ArenaMemoryCreator::new();
        creator.install(ArenaView {
            base: backing.as_mut_ptr(),
            size: backing.len(),
        });
        let memory = creator
            .new_memory(
                MemoryType::new(2, Some(2)),
                2 * 64 * 1024,
                Some(2 * 64 * 1024),
                None,
                0,
            )
            .unwrap();
        assert_eq!(memory.byte_size(), backing.len());
        assert_eq!(memory.as_ptr(), backing.as_mut_ptr());
        creator.clear();
    }
}
