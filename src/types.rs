use thiserror::Error;

/// Failures surfaced by hook installation.
///
/// Relocation and entry patching never leave the target function in a
/// half-modified state: every variant below is reported before the first
/// byte of the target is overwritten, except [`HookError::EntryRaced`],
/// which means the compare-and-swap found the entry word changed and wrote
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HookError {
    /// The trampoline pool has no free slot left.
    #[error("trampoline pool exhausted")]
    PoolExhausted,

    /// The OS rejected the page-permission change on the target.
    #[error("memory protection change rejected")]
    ProtectionDenied,

    /// A caller-supplied trampoline buffer cannot hold the relocated window.
    #[error("trampoline buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// The deferred-patch table of a relocation slot overflowed. The table
    /// is sized so this cannot happen for any valid window; seeing it means
    /// a relocator bug, and emission is aborted.
    #[error("deferred patch table overflow")]
    PatchTableOverflow,

    /// The entry instruction changed between snapshot and patch.
    #[error("entry instruction changed during installation")]
    EntryRaced,

    /// The target entry already carries a hook installed by this process.
    #[error("function entry is already hooked")]
    AlreadyInstalled,
}
