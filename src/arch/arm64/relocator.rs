use log::{error, warn};

use crate::arch::arm64::insn::{self, classify, InsnClass};
use crate::arch::arm64::writer::Arm64Writer;
use crate::code::cache::flush_icache;
use crate::types::HookError;

/// Upper bound on the displaced window. A far entry redirect needs
/// LDR+BR plus an 8-byte address (4 words) and at most one alignment NOP.
pub const MAX_INSTRUCTIONS: usize = 5;

/// Worst case, every displaced instruction contributes two references to
/// the same slot.
const MAX_REFERENCES: usize = MAX_INSTRUCTIONS * 2;

/// Per-instruction worst-case expansion budget, in bytes. A relocated
/// window of N instructions always fits in `N * INSN_BUDGET`, tail branch
/// and alignment padding included.
pub const INSN_BUDGET: usize = 10 * 4;

pub(crate) const LDR_X17_PC8: u32 = 0x5800_0051; // ldr x17, [pc, #8]
const LDR_X17_PC12: u32 = 0x5800_0071; // ldr x17, [pc, #12]
pub(crate) const BR_X17: u32 = 0xD61F_0220; // br x17
const ADR_X30_PC16: u32 = 0x1000_009E; // adr x30, #16

/// A displacement field of an already-emitted word, waiting for its target
/// slot to land.
#[derive(Debug, Clone, Copy, Default)]
struct PendingPatch {
    /// Word index of the emitted instruction to patch.
    site: usize,
    /// Bit position of the field's LSB.
    lshift: u32,
    /// Mask of the field within the word.
    mask: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// PC of this source instruction's first emitted word.
    emitted_pc: u64,
    pending: [PendingPatch; MAX_REFERENCES],
    pending_len: usize,
}

/// Bookkeeping for one displaced window: where each source instruction
/// ended up, and which earlier emissions still need their displacement
/// back-patched.
struct RelocationContext {
    basep: u64,
    endp: u64,
    slots: [Slot; MAX_INSTRUCTIONS],
}

impl RelocationContext {
    fn new(basep: u64, count: usize) -> Self {
        Self {
            basep,
            endp: basep + (count * 4) as u64,
            slots: [Slot::default(); MAX_INSTRUCTIONS],
        }
    }

    /// Is `addr` one of the displaced instructions?
    fn contains(&self, addr: i64) -> bool {
        (addr as u64) >= self.basep && (addr as u64) < self.endp
    }

    fn slot_of(&self, addr: u64) -> usize {
        ((addr - self.basep) / 4) as usize
    }

    /// Record (or re-record, after alignment padding) where slot `idx` was
    /// emitted.
    fn record(&mut self, idx: usize, pc: u64) {
        self.slots[idx].emitted_pc = pc;
    }

    fn emitted_pc(&self, idx: usize) -> u64 {
        self.slots[idx].emitted_pc
    }

    /// Register a forward reference: once slot `idx` lands, OR its
    /// displacement into the field described by (`lshift`, `mask`) at `site`.
    fn defer(&mut self, idx: usize, site: usize, lshift: u32, mask: u32) -> Result<(), HookError> {
        let slot = &mut self.slots[idx];
        if slot.pending_len == MAX_REFERENCES {
            error!("deferred patch table full for slot {idx}; aborting relocation");
            return Err(HookError::PatchTableOverflow);
        }
        slot.pending[slot.pending_len] = PendingPatch { site, lshift, mask };
        slot.pending_len += 1;
        Ok(())
    }

    /// Apply every patch that was waiting on slot `idx`.
    ///
    /// # Safety
    /// All recorded sites must be words already emitted through `w`.
    unsafe fn resolve(&mut self, idx: usize, w: &mut Arm64Writer) {
        let emitted = self.slots[idx].emitted_pc;
        for i in 0..self.slots[idx].pending_len {
            let p = self.slots[idx].pending[i];
            let diff = (emitted as i64).wrapping_sub(w.pc_at(p.site) as i64);
            w.or_word(p.site, (((diff >> 2) as u32) << p.lshift) & p.mask);
        }
        self.slots[idx].pending_len = 0;
    }
}

/// Relocates the first instructions of a function into a trampoline,
/// rewriting every PC-dependent instruction so it computes the same values
/// and reaches the same targets from its new address.
///
/// `input` is where the source words are read from; `input_pc` is the
/// address they execute at. The two normally coincide and are only split
/// so windows can be assembled from copies.
pub struct Arm64Relocator {
    input: *const u32,
    input_pc: u64,
}

impl Arm64Relocator {
    pub fn new(input: *const u32, input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Readable location of the byte that executes at `addr`.
    fn host_ptr(&self, addr: u64) -> *const u8 {
        (self.input as u64).wrapping_add(addr.wrapping_sub(self.input_pc)) as *const u8
    }

    /// Relocate `count` instructions into `w`, then append the tail branch
    /// back to the first non-displaced instruction and flush the
    /// instruction cache over everything emitted.
    ///
    /// Each slot is visited once, left to right. Backward references inside
    /// the window resolve immediately; forward references are deferred and
    /// patched when their target slot lands.
    ///
    /// # Safety
    /// `input` must point to `count` valid instruction words, plus any data
    /// read by literal loads that get inlined. The writer's buffer must
    /// have at least `count * INSN_BUDGET` bytes of headroom.
    pub unsafe fn relocate(&self, w: &mut Arm64Writer, count: usize) -> Result<(), HookError> {
        debug_assert!(count >= 1 && count <= MAX_INSTRUCTIONS);

        let mut ctx = RelocationContext::new(self.input_pc, count);

        for idx in 0..count {
            let ins = self.input.add(idx).read();
            let src_pc = self.input_pc.wrapping_add((idx * 4) as u64);
            ctx.record(idx, w.pc());

            let class = classify(ins);
            match class {
                InsnClass::B | InsnClass::Bl => {
                    self.rewrite_branch(&mut ctx, w, ins, src_pc, idx)?;
                }
                InsnClass::BCond | InsnClass::CbzCbnz | InsnClass::TbzTbnz => {
                    self.rewrite_cond_branch(&mut ctx, w, ins, src_pc, idx, class)?;
                }
                InsnClass::LdrLit | InsnClass::LdrLitSimd | InsnClass::LdrswLit => {
                    self.rewrite_literal_load(&mut ctx, w, ins, src_pc, idx, class);
                }
                InsnClass::PrfmLit => {
                    // A prefetch aimed at the old neighbourhood is useless
                    // here; drop it.
                }
                InsnClass::Adr => {
                    self.rewrite_adr(&mut ctx, w, ins, src_pc, idx)?;
                }
                InsnClass::Adrp => {
                    self.rewrite_adrp(&mut ctx, w, ins, src_pc, idx);
                }
                InsnClass::Other => w.put_u32(ins),
            }

            ctx.resolve(idx, w);
        }

        // Hand control back to the first instruction the redirect did not
        // overwrite.
        let resume = self.input_pc + (count * 4) as u64;
        let disp = (resume as i64).wrapping_sub(w.pc() as i64) >> 2;
        if disp.unsigned_abs() >= 1 << 25 {
            if (w.pc() + 8) & 7 != 0 {
                w.put_nop();
            }
            w.put_u32(LDR_X17_PC8);
            w.put_u32(BR_X17);
            w.put_u64_literal(resume);
        } else {
            w.put_b(resume);
        }

        flush_icache(w.base_ptr(), w.offset());
        Ok(())
    }

    /// B / BL (imm26, ±128 MiB).
    unsafe fn rewrite_branch(
        &self,
        ctx: &mut RelocationContext,
        w: &mut Arm64Writer,
        ins: u32,
        src_pc: u64,
        idx: usize,
    ) -> Result<(), HookError> {
        let opc = ins & 0xFC00_0000;
        let target = insn::branch_target(src_pc, ins);
        let in_window = ctx.contains(target);
        let mut disp = target.wrapping_sub(w.pc() as i64) >> 2;

        if !in_window && disp.unsigned_abs() >= 1 << 25 {
            if opc == 0x1400_0000 {
                // ldr x17, #8 ; br x17 ; .quad target
                if (w.pc() + 8) & 7 != 0 {
                    w.put_nop();
                    ctx.record(idx, w.pc());
                }
                w.put_u32(LDR_X17_PC8);
                w.put_u32(BR_X17);
                w.put_u64_literal(target as u64);
            } else {
                // ldr x17, #12 ; adr x30, #16 ; br x17 ; .quad target
                //
                // BR does not link, so the return address is formed by hand:
                // x30 = pc of the word after the literal. The literal sits
                // one word later than in the B form, which inverts the
                // alignment condition.
                if (w.pc() + 8) & 7 == 0 {
                    w.put_nop();
                    ctx.record(idx, w.pc());
                }
                w.put_u32(LDR_X17_PC12);
                w.put_u32(ADR_X30_PC16);
                w.put_u32(BR_X17);
                w.put_u64_literal(target as u64);
            }
            return Ok(());
        }

        if in_window {
            let ref_idx = ctx.slot_of(target as u64);
            if ref_idx <= idx {
                disp = (ctx.emitted_pc(ref_idx) as i64).wrapping_sub(w.pc() as i64) >> 2;
            } else {
                ctx.defer(ref_idx, w.word_index(), 0, 0x03FF_FFFF)?;
                disp = 0;
            }
        }
        w.put_u32(opc | (disp as u32 & 0x03FF_FFFF));
        Ok(())
    }

    /// B.cond / CBZ / CBNZ (imm19, ±1 MiB) and TBZ / TBNZ (imm14, ±32 KiB).
    unsafe fn rewrite_cond_branch(
        &self,
        ctx: &mut RelocationContext,
        w: &mut Arm64Writer,
        ins: u32,
        src_pc: u64,
        idx: usize,
        class: InsnClass,
    ) -> Result<(), HookError> {
        let (keep, target) = if class == InsnClass::TbzTbnz {
            (0xFFF8_001Fu32, insn::imm14_target(src_pc, ins))
        } else {
            (0xFF00_001Fu32, insn::imm19_target(src_pc, ins))
        };
        let field = !keep;
        let in_window = ctx.contains(target);
        let mut disp = target.wrapping_sub(w.pc() as i64) >> 2;

        if !in_window && disp.unsigned_abs() >= (field >> 6) as u64 {
            // The original condition, retargeted to hop over the
            // fall-through branch onto an absolute jump:
            //   <cond> #8
            //   b      #20
            //   ldr    x17, #8
            //   br     x17
            //   .quad  target
            if (w.pc() + 16) & 7 != 0 {
                w.put_nop();
                ctx.record(idx, w.pc());
            }
            w.put_u32(((2u32 << 5) & field) | (ins & keep));
            w.put_u32(0x1400_0005);
            w.put_u32(LDR_X17_PC8);
            w.put_u32(BR_X17);
            w.put_u64_literal(target as u64);
            return Ok(());
        }

        if in_window {
            let ref_idx = ctx.slot_of(target as u64);
            if ref_idx <= idx {
                disp = (ctx.emitted_pc(ref_idx) as i64).wrapping_sub(w.pc() as i64) >> 2;
            } else {
                ctx.defer(ref_idx, w.word_index(), 5, field)?;
                disp = 0;
            }
        }
        w.put_u32((((disp as u32) << 5) & field) | (ins & keep));
        Ok(())
    }

    /// LDR / LDRSW (literal). Either re-encoded with a padded displacement
    /// or turned into a load from a snapshot of the datum placed right
    /// behind it.
    unsafe fn rewrite_literal_load(
        &self,
        ctx: &mut RelocationContext,
        w: &mut Arm64Writer,
        ins: u32,
        src_pc: u64,
        idx: usize,
        class: InsnClass,
    ) {
        let size = insn::literal_datum_size(class, ins);
        let target = insn::imm19_target(src_pc, ins);
        let keep = 0xFF00_001Fu32;
        let field = 0x00FF_FFE0u32;
        let in_window = ctx.contains(target);
        let mut disp = target.wrapping_sub(w.pc() as i64) >> 2;

        // Alignment padding can push the load a few words forward; budget
        // for that in the range check.
        if in_window || disp.unsigned_abs() + (size - 4) / 4 >= (field >> 6) as u64 {
            // Inline the datum:
            //   ldr <reg>, #8
            //   b   <past the data>
            //   .data (4/8/16 bytes, naturally aligned)
            //
            // The copy is a snapshot; later stores to the original datum are
            // not seen through the trampoline.
            while (w.pc() + 8) & (size - 1) != 0 {
                w.put_nop();
            }
            ctx.record(idx, w.pc());
            w.put_u32(((2u32 << 5) & field) | (ins & keep));
            w.put_u32(0x1400_0001 + (size / 4) as u32);
            w.put_bytes(self.host_ptr(target as u64), size as usize);
        } else {
            // Keep it PC-relative; pad until the displacement satisfies the
            // datum's alignment in word units.
            let word_align = (size / 4 - 1) as i64;
            while disp & word_align != 0 {
                w.put_nop();
                disp = target.wrapping_sub(w.pc() as i64) >> 2;
            }
            ctx.record(idx, w.pc());
            w.put_u32((((disp as u32) << 5) & field) | (ins & keep));
        }
    }

    /// ADR (imm21, ±1 MiB).
    unsafe fn rewrite_adr(
        &self,
        ctx: &mut RelocationContext,
        w: &mut Arm64Writer,
        ins: u32,
        src_pc: u64,
        idx: usize,
    ) -> Result<(), HookError> {
        let target = insn::adr_target(src_pc, ins);
        let in_window = ctx.contains(target);
        let mut off = target.wrapping_sub(w.pc() as i64);

        if !in_window && off.unsigned_abs() >= 0xF_FFFF {
            put_materialized_address(ctx, w, insn::rt(ins), target as u64, idx);
            return Ok(());
        }

        if in_window {
            let ref_idx = ctx.slot_of(target as u64 & !3);
            if ref_idx <= idx {
                off = (ctx.emitted_pc(ref_idx) as i64).wrapping_sub(w.pc() as i64);
            } else {
                ctx.defer(ref_idx, w.word_index(), 5, 0x00FF_FFFF)?;
                off = 0;
            }
        }
        let immlo = (off as u32) & 0x3;
        let immhi = ((off as u32) >> 2) & 0x7_FFFF;
        w.put_u32(0x1000_0000 | (immlo << 29) | (immhi << 5) | insn::rt(ins));
        Ok(())
    }

    /// ADRP (imm21 pages, ±4 GiB).
    unsafe fn rewrite_adrp(
        &self,
        ctx: &mut RelocationContext,
        w: &mut Arm64Writer,
        ins: u32,
        src_pc: u64,
        idx: usize,
    ) {
        let target = insn::adrp_target(src_pc, ins);
        if ctx.contains(target) {
            // The page base this computes is tied to the original pc. A
            // faithful rewrite would need the later instruction that
            // consumes the page address as well, so forward it unchanged
            // and flag it.
            warn!(
                "adrp {ins:#010x} at {src_pc:#x} targets the displaced window; copied verbatim"
            );
            w.put_u32(ins);
        } else {
            put_materialized_address(ctx, w, insn::rt(ins), target as u64, idx);
        }
    }
}

/// `ldr xd, #8 ; b #12 ; .quad target` — replaces an address computation
/// with a load of the precomputed result.
unsafe fn put_materialized_address(
    ctx: &mut RelocationContext,
    w: &mut Arm64Writer,
    rd: u32,
    target: u64,
    idx: usize,
) {
    if (w.pc() + 8) & 7 != 0 {
        w.put_nop();
        ctx.record(idx, w.pc());
    }
    w.put_u32(0x5800_0040 | rd);
    w.put_u32(0x1400_0003);
    w.put_u64_literal(target);
}
