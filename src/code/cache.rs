#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
    fn sys_dcache_flush(addr: *mut core::ffi::c_void, size: usize);
}

/// Make freshly written code visible to instruction fetch.
///
/// AArch64 instruction and data caches are not coherent: stores to a code
/// region land in the D-cache while the I-cache keeps serving stale words.
/// This pushes the stores out and invalidates the I-cache lines over
/// `[addr, addr + len)`; it must run after the last code store and before
/// any thread may execute the region.
///
/// # Safety
/// `addr` must point to at least `len` accessible bytes.
pub unsafe fn flush_icache(addr: *mut u8, len: usize) {
    #[cfg(target_os = "macos")]
    {
        sys_dcache_flush(addr as *mut core::ffi::c_void, len);
        sys_icache_invalidate(addr as *mut core::ffi::c_void, len);
    }

    #[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
    {
        extern "C" {
            fn __clear_cache(begin: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(len) as *mut libc::c_void);
    }

    // Coherent-I-cache targets (notably x86_64 hosts running the unit
    // tests) need nothing.
    #[cfg(all(not(target_os = "macos"), not(target_arch = "aarch64")))]
    {
        let _ = (addr, len);
    }
}
