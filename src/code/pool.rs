use core::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use log::{debug, error};

use crate::arch::arm64::relocator::{INSN_BUDGET, MAX_INSTRUCTIONS};
use crate::types::HookError;

/// Bytes per trampoline slot: the worst-case expansion of a full displaced
/// window, tail branch included.
pub const SLOT_SIZE: usize = MAX_INSTRUCTIONS * INSN_BUDGET;

// Slots must keep their literal pools 8-byte aligned.
const _: () = assert!(SLOT_SIZE % 8 == 0);

/// Default number of slots, bounding the number of simultaneous hooks
/// served by one pool.
pub const DEFAULT_BACKUPS: usize = 256;

/// Fixed-capacity arena of executable trampoline slots.
///
/// Slot issuance is a wait-free atomic fetch-add over a bounded index;
/// slots are never recycled. The backing store is mapped
/// read/write/execute lazily, when the first slot is taken, so merely
/// constructing a pool costs nothing.
#[derive(Debug)]
pub struct TrampolinePool {
    slots: usize,
    next: AtomicI32,
    base: OnceLock<usize>,
}

impl Default for TrampolinePool {
    fn default() -> Self {
        Self::new(DEFAULT_BACKUPS)
    }
}

impl TrampolinePool {
    /// A pool with room for `max_backups` hooks.
    pub fn new(max_backups: usize) -> Self {
        Self {
            slots: max_backups,
            next: AtomicI32::new(0),
            base: OnceLock::new(),
        }
    }

    /// Total bytes of one slot; caller-provided buffers are measured
    /// against the same per-instruction budget.
    pub fn slot_size(&self) -> usize {
        SLOT_SIZE
    }

    fn backing(&self) -> Result<usize, HookError> {
        if let Some(&base) = self.base.get() {
            return Ok(base);
        }

        let len = self.slots * SLOT_SIZE;
        let map = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            error!(
                "trampoline pool mapping of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            );
            return Err(HookError::PoolExhausted);
        }

        match self.base.set(map as usize) {
            Ok(()) => {
                debug!("trampoline pool mapped: {len} bytes, {} slots", self.slots);
                Ok(map as usize)
            }
            Err(_) => {
                // Another thread won the race; discard ours.
                unsafe { libc::munmap(map, len) };
                Ok(*self.base.get().expect("pool base published"))
            }
        }
    }

    /// Take the next free slot. Exhaustion has no side effects and is
    /// permanent for this pool.
    pub fn alloc(&self) -> Result<*mut u32, HookError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        if index < 0 || index as usize >= self.slots {
            error!("trampoline pool exhausted ({} slots)", self.slots);
            return Err(HookError::PoolExhausted);
        }

        let base = self.backing()?;
        Ok((base + index as usize * SLOT_SIZE) as *mut u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_issues_distinct_writable_slots() {
        let pool = TrampolinePool::new(4);
        let a = pool.alloc().expect("slot a");
        let b = pool.alloc().expect("slot b");
        assert_eq!(b as usize - a as usize, SLOT_SIZE);
        assert_eq!(a as usize % 8, 0, "slots must be 8-byte aligned");
        unsafe {
            a.write(0xD503_201F);
            b.write(0xD65F_03C0);
            assert_eq!(a.read(), 0xD503_201F);
            assert_eq!(b.read(), 0xD65F_03C0);
        }
    }

    #[test]
    fn exhausted_pool_reports_and_stays_empty() {
        let pool = TrampolinePool::new(2);
        pool.alloc().unwrap();
        pool.alloc().unwrap();
        assert_eq!(pool.alloc(), Err(HookError::PoolExhausted));
        assert_eq!(pool.alloc(), Err(HookError::PoolExhausted));
    }

    #[test]
    fn zero_capacity_pool_never_maps() {
        let pool = TrampolinePool::new(0);
        assert_eq!(pool.alloc(), Err(HookError::PoolExhausted));
        assert!(pool.base.get().is_none(), "no backing store was mapped");
    }

    #[test]
    fn slot_holds_a_full_window_expansion() {
        assert_eq!(SLOT_SIZE, 200);
        assert!(SLOT_SIZE >= MAX_INSTRUCTIONS * INSN_BUDGET);
    }
}
