use core::ffi::c_void;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use log::{debug, error};

use crate::arch::arm64::insn::NOP;
use crate::arch::arm64::relocator::{
    Arm64Relocator, BR_X17, INSN_BUDGET, LDR_X17_PC8, MAX_INSTRUCTIONS,
};
use crate::arch::arm64::writer::Arm64Writer;
use crate::code::cache::flush_icache;
use crate::code::patcher::{cas_insn, make_rwx};
use crate::code::pool::TrampolinePool;
use crate::types::HookError;

/// Entry bytes a long-form redirect may overwrite.
const PATCH_SPAN: usize = MAX_INSTRUCTIONS * 4;

struct InstalledHook {
    original_bytes: [u8; PATCH_SPAN],
    patch_len: usize,
}

/// Installs and removes inline hooks, keeping the original entry bytes so
/// they can be put back.
///
/// One process-wide instance backed by the default trampoline pool is
/// available through [`Interceptor::obtain`]; [`Interceptor::with_pool`]
/// builds an independent one around an explicit pool.
pub struct Interceptor {
    pool: TrampolinePool,
    installed: Mutex<HashMap<usize, InstalledHook>>,
}

impl Interceptor {
    /// The shared instance over the default pool.
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: OnceLock<Interceptor> = OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor::with_pool(TrampolinePool::default()))
    }

    pub fn with_pool(pool: TrampolinePool) -> Self {
        Self {
            pool,
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Redirect calls of `function` to `replacement`.
    ///
    /// When `original` is non-null it receives the address of a trampoline
    /// that behaves like the unhooked `function` (or null if installation
    /// fails). Passing null skips trampoline construction entirely and no
    /// pool slot is consumed.
    ///
    /// # Safety
    /// `function` must be the entry of a function with at least
    /// [`MAX_INSTRUCTIONS`] patchable instructions, and no thread may be
    /// executing inside those entry bytes while a long-form (far) redirect
    /// is written. `replacement` must be ABI-compatible with `function`.
    pub unsafe fn install(
        &self,
        function: *mut c_void,
        replacement: *const c_void,
        original: *mut *const c_void,
    ) -> Result<(), HookError> {
        if !original.is_null() {
            *original = core::ptr::null();
        }

        let key = function as usize;
        let mut map = self.installed.lock().unwrap();
        if map.contains_key(&key) {
            return Err(HookError::AlreadyInstalled);
        }

        let buf = if original.is_null() {
            None
        } else {
            Some((self.pool.alloc()? as *mut u8, self.pool.slot_size()))
        };

        let record = install_at(function as *mut u32, replacement as u64, buf)?;
        map.insert(key, record);

        if let Some((tramp, _)) = buf {
            *original = tramp as *const c_void;
        }
        Ok(())
    }

    /// Like [`Interceptor::install`], but relocating into a caller-owned
    /// RWX buffer of `buf_size` bytes instead of a pool slot. Returns the
    /// trampoline entry (`buf` itself).
    ///
    /// # Safety
    /// As for [`Interceptor::install`]; additionally `buf` must be valid
    /// for writes of `buf_size` bytes and mapped executable.
    pub unsafe fn install_with_buffer(
        &self,
        function: *mut c_void,
        replacement: *const c_void,
        buf: *mut u8,
        buf_size: usize,
    ) -> Result<*const c_void, HookError> {
        let key = function as usize;
        let mut map = self.installed.lock().unwrap();
        if map.contains_key(&key) {
            return Err(HookError::AlreadyInstalled);
        }

        let record = install_at(function as *mut u32, replacement as u64, Some((buf, buf_size)))?;
        map.insert(key, record);
        Ok(buf as *const c_void)
    }

    /// Write the saved entry bytes back. Unknown addresses are a no-op.
    ///
    /// Trampolines handed out for this hook keep working (they still branch
    /// into the function past the entry), but the slot is not reclaimed.
    ///
    /// # Safety
    /// No thread may be executing within the patched entry bytes, and any
    /// callers still holding the replacement path must be quiesced.
    pub unsafe fn restore(&self, function: *mut c_void) -> Result<(), HookError> {
        let key = function as usize;
        let mut map = self.installed.lock().unwrap();
        let Some(entry) = map.remove(&key) else {
            return Ok(());
        };

        if let Err(e) = make_rwx(function as *mut u8, entry.patch_len) {
            map.insert(key, entry);
            return Err(e);
        }
        core::ptr::copy_nonoverlapping(
            entry.original_bytes.as_ptr(),
            function as *mut u8,
            entry.patch_len,
        );
        flush_icache(function as *mut u8, entry.patch_len);
        debug!("hook removed from {key:#x}, {} bytes restored", entry.patch_len);
        Ok(())
    }
}

/// Relocate the displaced window into `buf`, if one was supplied.
unsafe fn emit_trampoline(
    function: *const u32,
    count: usize,
    buf: Option<(*mut u8, usize)>,
) -> Result<(), HookError> {
    let Some((buf, len)) = buf else {
        return Ok(());
    };

    let needed = count * INSN_BUDGET;
    if len < needed {
        error!("trampoline buffer too small: need {needed} bytes, have {len}");
        return Err(HookError::BufferTooSmall { needed, have: len });
    }

    let mut w = Arm64Writer::new(buf, len, buf as u64);
    let r = Arm64Relocator::new(function, function as u64);
    r.relocate(&mut w, count)
}

/// The installation protocol. Nothing at `function` is touched until the
/// trampoline has been emitted and the entry pages are writable.
unsafe fn install_at(
    function: *mut u32,
    replacement: u64,
    buf: Option<(*mut u8, usize)>,
) -> Result<InstalledHook, HookError> {
    let f_pc = function as u64;
    let distance = (replacement as i64).wrapping_sub(f_pc as i64);
    let original_bytes = core::ptr::read_unaligned(function as *const [u8; PATCH_SPAN]);

    if distance.unsigned_abs() < 1 << 27 {
        // Near replacement: a single branch reaches it, so only one
        // instruction is displaced and the entry patch is one atomic store.
        emit_trampoline(function, 1, buf)?;
        make_rwx(function as *mut u8, PATCH_SPAN)?;

        let pre = u32::from_le_bytes([
            original_bytes[0],
            original_bytes[1],
            original_bytes[2],
            original_bytes[3],
        ]);
        let branch = 0x1400_0000 | (((distance >> 2) as u32) & 0x03FF_FFFF);
        if !cas_insn(function, pre, branch) {
            error!("entry word at {f_pc:#x} changed under us; hook aborted");
            return Err(HookError::EntryRaced);
        }
        flush_icache(function as *mut u8, 4);

        debug!("inline hook {f_pc:#x} -> {replacement:#x} installed, 4 bytes overwritten");
        Ok(InstalledHook {
            original_bytes,
            patch_len: 4,
        })
    } else {
        // Far replacement: ldr x17, #8 ; br x17 ; .quad replacement, with a
        // leading nop when the entry is not 8-byte aligned so the literal
        // lands aligned.
        let count = if (f_pc + 8) & 7 != 0 { 5 } else { 4 };
        emit_trampoline(function, count, buf)?;
        make_rwx(function as *mut u8, PATCH_SPAN)?;

        let mut p = function;
        if count == 5 {
            p.write(NOP);
            p = p.add(1);
        }
        p.write(LDR_X17_PC8);
        p.add(1).write(BR_X17);
        (p.add(2) as *mut u64).write(replacement);
        flush_icache(function as *mut u8, PATCH_SPAN);

        debug!(
            "inline hook {f_pc:#x} -> {replacement:#x} installed, {} bytes overwritten",
            count * 4
        );
        Ok(InstalledHook {
            original_bytes,
            patch_len: PATCH_SPAN,
        })
    }
}

/// Hook `function` through the process-default pool. See
/// [`Interceptor::install`].
///
/// # Safety
/// As for [`Interceptor::install`].
pub unsafe fn install_hook(
    function: *mut c_void,
    replacement: *const c_void,
    original: *mut *const c_void,
) -> Result<(), HookError> {
    Interceptor::obtain().install(function, replacement, original)
}

/// Hook `function` relocating into a caller-owned buffer. See
/// [`Interceptor::install_with_buffer`].
///
/// # Safety
/// As for [`Interceptor::install_with_buffer`].
pub unsafe fn install_hook_with_buffer(
    function: *mut c_void,
    replacement: *const c_void,
    buf: *mut u8,
    buf_size: usize,
) -> Result<*const c_void, HookError> {
    Interceptor::obtain().install_with_buffer(function, replacement, buf, buf_size)
}
