use core::sync::atomic::{AtomicU32, Ordering};

use log::error;

use crate::types::HookError;

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Grant read/write/execute over every page spanning `[addr, addr + len)`.
///
/// Nothing has been modified when this fails; the caller aborts the
/// install and reports [`HookError::ProtectionDenied`].
///
/// # Safety
/// `addr` must lie inside a mapping of the current process.
pub unsafe fn make_rwx(addr: *mut u8, len: usize) -> Result<(), HookError> {
    let page = page_size();
    let start = (addr as usize) & !(page - 1);
    let end = ((addr as usize) + len + page - 1) & !(page - 1);

    if libc::mprotect(
        start as *mut libc::c_void,
        end - start,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        error!(
            "mprotect(rwx) failed at {:#x}+{:#x}: {}",
            start,
            end - start,
            std::io::Error::last_os_error()
        );
        return Err(HookError::ProtectionDenied);
    }
    Ok(())
}

/// Replace one instruction word atomically against its expected pre-image.
///
/// An aligned 32-bit store is observed whole by instruction fetch, so a
/// thread racing through the word executes either the old instruction or
/// the new one, never a torn mix. Returns `false` when the word no longer
/// holds `expected` (nothing is written then).
///
/// # Safety
/// `addr` must be 4-byte aligned, writable, and valid for the lifetime of
/// the call.
pub unsafe fn cas_insn(addr: *mut u32, expected: u32, new: u32) -> bool {
    AtomicU32::from_ptr(addr)
        .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_insn_swaps_on_matching_preimage() {
        let mut word: u32 = 0xD503_201F;
        unsafe {
            assert!(cas_insn(&mut word, 0xD503_201F, 0x1400_0400));
        }
        assert_eq!(word, 0x1400_0400);
    }

    #[test]
    fn cas_insn_refuses_stale_preimage() {
        let mut word: u32 = 0xD65F_03C0;
        unsafe {
            assert!(!cas_insn(&mut word, 0xD503_201F, 0x1400_0400));
        }
        assert_eq!(word, 0xD65F_03C0, "mismatch must leave the word alone");
    }

    #[test]
    fn make_rwx_covers_unaligned_ranges() {
        unsafe {
            let page = page_size();
            let map = libc::mmap(
                core::ptr::null_mut(),
                page * 2,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(map, libc::MAP_FAILED);

            // span the page boundary from an interior address
            let addr = (map as *mut u8).add(page - 8);
            make_rwx(addr, 16).expect("rwx");

            // both sides of the boundary must now accept writes
            addr.write(0xAA);
            addr.add(15).write(0xBB);
            assert_eq!(addr.read(), 0xAA);

            libc::munmap(map, page * 2);
        }
    }
}
