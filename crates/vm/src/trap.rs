//! Runtime fault reporting.
//!
//! Mirrors `pasc_compiler::error::CompileError`'s texture: a small enum tag
//! plus a human-readable message, a manual `Display`/`Error` impl, no
//! `thiserror`/`anyhow`. The one addition a compile-time error doesn't need
//! is the faulting code offset, since a trap has no source span of its own
//! to report — only the debug index's best-effort line lookup.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    DivisionByZero,
    /// The return stack (nested `CALL`s) or the data stack (frames and
    /// register spills) grew past the configured bound. Both stem from the
    /// same cause in practice (unbounded recursion), so this one kind
    /// covers both; see `VmConfig`.
    CallStackOverflow,
    /// An opcode byte that doesn't name any `Op`, or an operation on
    /// malformed/out-of-range state (a memory access outside the chunk's
    /// globals or the VM's stack, an unresolved sink write). A well-formed
    /// chunk produced by `pasc-compiler` never triggers this; it exists for
    /// hand-assembled or corrupted chunks.
    IllegalInstruction,
}

/// A runtime fault: what went wrong, where, and (if the chunk carries debug
/// info for that offset) which source line it maps back to.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub kind: TrapKind,
    /// Code-word offset of the faulting instruction.
    pub ip: u32,
    pub line: Option<u32>,
    pub message: String,
}

impl Trap {
    pub fn new(kind: TrapKind, ip: u32, line: Option<u32>, message: impl Into<String>) -> Self {
        Trap {
            kind,
            ip,
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {} (ip={})", line, self.message, self.ip),
            None => write!(f, "{} (ip={})", self.message, self.ip),
        }
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_line_when_known() {
        let t = Trap::new(TrapKind::DivisionByZero, 12, Some(4), "division by zero");
        assert_eq!(t.to_string(), "line 4: division by zero (ip=12)");
    }

    #[test]
    fn display_falls_back_to_just_the_offset() {
        let t = Trap::new(TrapKind::IllegalInstruction, 3, None, "bad opcode");
        assert_eq!(t.to_string(), "bad opcode (ip=3)");
    }
}
