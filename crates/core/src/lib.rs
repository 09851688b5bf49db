//! Pascal VM Core: bytecode and value primitives shared by the compiler and the VM
//!
//! This crate is the foundation shared between `pasc-compiler` (which writes
//! bytecode into a [`Chunk`]) and `pasc-vm` (which reads it back out and
//! executes it). Neither of those crates depends on the other; both depend
//! on this one, so the wire format between them lives in exactly one place.
//!
//! # Modules
//!
//! - `pstring`: small-string-optimized mutable string value used for both
//!   compile-time literals and runtime string values.
//! - `opcode`: the 16-bit instruction encoding (`Op`, field packing/unpacking,
//!   per-opcode word length, and branch-patch helpers).
//! - `chunk`: the `Chunk` container (code, globals, entry point, debug index).

pub mod chunk;
pub mod opcode;
pub mod pstring;

pub use chunk::{Chunk, DebugIndex};
pub use opcode::{Op, PatchKind, Reg, FP, GP, SP};
pub use pstring::PString;
