pub mod insn;
pub mod relocator;
pub mod writer;
