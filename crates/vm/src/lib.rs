//! Pascal VM runtime: a register-based bytecode interpreter for `Chunk`s
//! produced by `pasc-compiler`.
//!
//! This crate depends only on `pasc-core` — the shared wire format — and
//! never on `pasc-compiler` itself (the dependency only runs the other way,
//! in this crate's integration tests). A `Vm` owns a `Chunk`, a register
//! file, and a preallocated data stack, and interprets it to completion or
//! until a `Trap` fires.
//!
//! # Modules
//!
//! - `vm`: the `Vm` struct and its fetch/decode/dispatch loop.
//! - `config`: `VmConfig`, tunables for stack size and call depth.
//! - `trap`: `Trap`/`TrapKind`, the runtime fault type.
//! - `sink`: `SharedBuffer`, an in-memory `Write` sink for capturing
//!   `WRITE` output in tests.

pub mod config;
pub mod sink;
pub mod trap;
pub mod vm;

pub use config::VmConfig;
pub use sink::SharedBuffer;
pub use trap::{Trap, TrapKind};
pub use vm::{Vm, VmResult};
