//! a64-intercept: inline function hooking for AArch64.
//!
//! Redirects calls of a target function to a replacement while keeping the
//! original callable through a generated trampoline. The entry redirect
//! itself is a single branch (or an `ldr x17 / br x17` pair with an inline
//! address when the replacement is out of branch range); the interesting
//! work is relocating the displaced entry instructions into the trampoline
//! so that branches, literal loads and address computations still observe
//! the values they would have at their original addresses.
//!
//! ```no_run
//! use core::ffi::c_void;
//!
//! unsafe {
//!     let mut original: *const c_void = core::ptr::null();
//!     a64_intercept::install_hook(
//!         target as *mut c_void,
//!         replacement as *const c_void,
//!         &mut original,
//!     )?;
//!     // `original` is now callable as the unhooked target.
//! }
//! # extern "C" fn target() {}
//! # extern "C" fn replacement() {}
//! # Ok::<(), a64_intercept::HookError>(())
//! ```
//!
//! Short (near) redirects are installed with a single atomic store and are
//! safe against concurrent callers. Far redirects overwrite up to 20 entry
//! bytes non-atomically; the caller must ensure no thread executes those
//! bytes during installation. Hook removal carries the same obligation.

pub mod arch;
pub mod code;
pub mod hook;
pub mod types;

pub use code::pool::TrampolinePool;
pub use hook::{install_hook, install_hook_with_buffer, Interceptor};
pub use types::HookError;

/// Process-global lock for tests that patch executable code, so concurrent
/// tests never stomp the same function.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
