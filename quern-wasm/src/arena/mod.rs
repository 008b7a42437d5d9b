//! The per-query memory arena.
//!
//! One fixed virtual-memory reservation serves as both the host's heap for
//! table images, string literals and result buffers, and as the guest's
//! linear memory (see [`memory`]). Host regions are bump-allocated from the
//! low end; the high end stays free for the guest.
//!
//! Two invariants hold at every observation point:
//! - `heap % page_size == 0` before and after every append
//! - with `TRAP_GUARD_PAGES` set, every appended region is followed by at
//!   least one unmapped page
//!
//! Guest pointers are 32-bit offsets into the reservation; the host
//! translates by adding the base pointer.

pub mod memory;

use region::{Allocation, Protection};

use crate::config::WASM_PAGE_SIZE;
use crate::error::{BackendError, Result};

pub use memory::{ArenaMemoryCreator, ArenaView};

pub struct Arena {
    alloc: Allocation,
    size: usize,
    heap: usize,
    page_size: usize,
    guard_pages: bool,
}

// The allocation is owned exclusively by one query; host callbacks only run
// while the guest is parked inside them, so no two sides touch the arena at
// the same time.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserves `size` bytes of readable/writable virtual memory, rounded up
    /// to a whole number of Wasm pages.
    pub fn reserve(size: usize, guard_pages: bool) -> Result<Self> {
        let size = size.div_ceil(WASM_PAGE_SIZE) * WASM_PAGE_SIZE;
        let alloc = region::alloc(size, Protection::READ_WRITE)
            .map_err(|e| BackendError::VirtualMemory(e.to_string()))?;
        Ok(Self {
            alloc,
            size,
            heap: 0,
            page_size: region::page::size(),
            guard_pages,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// First free byte; always page aligned.
    pub fn heap(&self) -> usize {
        self.heap
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.alloc.as_ptr::<u8>() as *mut u8
    }

    /// View handed to the engine's memory creator.
    pub fn view(&self) -> ArenaView {
        ArenaView {
            base: self.base_ptr(),
            size: self.size,
        }
    }

    /// Appends a region with `bytes` copied in and returns its offset.
    pub fn append_region(&mut self, bytes: &[u8]) -> Result<u32> {
        let offset = self.reserve_region(bytes.len())?;
        // Reserved space starts out zeroed; only the payload needs copying.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base_ptr().add(offset as usize), bytes.len());
        }
        Ok(offset)
    }

    /// Appends a zeroed region of `len` bytes and returns its offset.
    pub fn preallocate(&mut self, len: usize) -> Result<u32> {
        self.reserve_region(len)
    }

    fn reserve_region(&mut self, len: usize) -> Result<u32> {
        debug_assert_eq!(self.heap % self.page_size, 0);
        let guard = if self.guard_pages { self.page_size } else { 0 };
        let rounded = len.div_ceil(self.page_size) * self.page_size;
        let needed = rounded + guard;
        if self.heap + needed > self.size {
            return Err(BackendError::ArenaExhausted {
                requested: needed,
                available: self.size - self.heap,
            });
        }
        let offset = self.heap;
        self.heap += rounded;
        if self.guard_pages {
            unsafe {
                region::protect(self.base_ptr().add(self.heap), self.page_size, Protection::NONE)
                    .map_err(|e| BackendError::VirtualMemory(e.to_string()))?;
            }
            self.heap += self.page_size;
        }
        debug_assert_eq!(self.heap % self.page_size, 0);
        Ok(offset as u32)
    }

    /// Bounds-checked read of `len` bytes at `offset`.
    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let offset = offset as usize;
        if offset + len > self.size {
            return Err(BackendError::Invariant(format!(
                "arena read of {len} bytes at offset {offset} exceeds arena size {}",
                self.size
            )));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.base_ptr().add(offset), len) })
    }

    /// Reads a NUL-terminated string starting at `offset`.
    pub fn read_cstr(&self, offset: u32) -> Result<String> {
        let bytes = self.read_cstr_bytes(offset)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the raw bytes of a NUL-terminated string (terminator excluded).
    pub fn read_cstr_bytes(&self, offset: u32) -> Result<Vec<u8>> {
        let start = offset as usize;
        if start >= self.size {
            return Err(BackendError::Invariant(format!(
                "arena string read at offset {start} exceeds arena size {}",
                self.size
            )));
        }
        let tail = unsafe { std::slice::from_raw_parts(self.base_ptr().add(start), self.size - start) };
        match tail.iter().position(|&b| b == 0) {
            Some(end) => Ok(tail[..end].to_vec()),
            None => Err(BackendError::Invariant(format!(
                "unterminated string at arena offset {start}"
            ))),
        }
    }

    /// Writes `bytes` at `offset`. Takes `&self`: host callbacks write
    /// tuple-id batches into guest-visible memory while the guest is parked
    /// in the call, which is the only writer at that moment.
    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let offset = offset as usize;
        if offset + bytes.len() > self.size {
            return Err(BackendError::Invariant(format!(
                "arena write of {} bytes at offset {offset} exceeds arena size {}",
                bytes.len(),
                self.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base_ptr().add(offset), bytes.len());
        }
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Guard pages must be writable again before the reservation is
        // returned to the allocator.
        if self.guard_pages && self.heap > 0 {
            unsafe {
                let _ = region::protect(self.base_ptr(), self.heap, Protection::READ_WRITE);
            }
        }
    }
}
