//! The `Chunk`: a compiled program's bytecode, globals, and debug index.
//!
//! A `Chunk` is the only thing that crosses the boundary between
//! `pasc-compiler` and `pasc-vm`. It is read-only once the VM starts
//! executing it — the compiler is the only writer, and it only ever appends
//! to `code`/`globals` or patches a `code` word that was previously emitted
//! as a forward reference.

use crate::opcode::{self, Op, PatchKind};

/// One run of consecutive code words that map to the same source line.
///
/// The index is run-length encoded rather than one entry per instruction:
/// most instructions in a run come from the same statement, so storing a
/// `(start, line)` pair per *change* keeps the index small even for long
/// programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineRun {
    start: u32,
    line: u32,
}

/// Maps code offsets back to source line numbers for error reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugIndex {
    runs: Vec<LineRun>,
}

impl DebugIndex {
    pub fn new() -> Self {
        DebugIndex { runs: Vec::new() }
    }

    /// Record that the instruction at `code_index` belongs to `line`. A new
    /// run is only pushed when the line actually changes from the previous
    /// run, so emitting ten words for one statement costs one entry.
    pub fn record(&mut self, code_index: u32, line: u32) {
        match self.runs.last() {
            Some(run) if run.line == line => {}
            _ => self.runs.push(LineRun {
                start: code_index,
                line,
            }),
        }
    }

    /// Look up the source line that covers `code_index`, if any was recorded.
    pub fn line_for(&self, code_index: u32) -> Option<u32> {
        match self.runs.partition_point(|r| r.start <= code_index) {
            0 => None,
            n => Some(self.runs[n - 1].line),
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Drop any run that starts at or past `code_index`, for undoing the
    /// debug info of code the compiler discarded (a dead `if`/`while` arm
    /// with a constant condition).
    fn truncate(&mut self, code_index: u32) {
        self.runs.retain(|r| r.start < code_index);
    }
}

/// Word length, in `u16`s, of the instruction a given `PatchKind` addresses.
fn patch_instr_len(kind: PatchKind) -> u32 {
    match kind {
        PatchKind::Cond20 => 2,
        PatchKind::Rel24 => 2,
        PatchKind::Inc16 => 2,
        PatchKind::Rip32 => 3,
    }
}

/// A compiled unit: bytecode, global data, the entry point, and debug info.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    code: Vec<u16>,
    globals: Vec<u8>,
    entry_point: u32,
    debug: DebugIndex,
    /// String literals gathered while compiling, indexed by position. The
    /// VM seeds its runtime string heap from this pool at load time, so
    /// pool index `i` is also the initial runtime handle for that literal
    /// (see `pasc_vm::Vm::load`): a literal's content is never mutated in
    /// place, only cloned on assignment, so sharing the slot is safe.
    strings: Vec<String>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk {
            code: Vec::new(),
            globals: Vec::new(),
            entry_point: 0,
            debug: DebugIndex::new(),
            strings: Vec::new(),
        }
    }

    // --- string literal pool ------------------------------------------------

    /// Record a string literal, returning its pool index (stable for the
    /// life of the chunk). No deduplication: repeated identical literals
    /// get distinct entries, matching repeated `MOVI`-style constant
    /// materialization elsewhere in the emitter.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        idx
    }

    pub fn string_literal(&self, idx: u32) -> &str {
        &self.strings[idx as usize]
    }

    pub fn string_literals(&self) -> &[String] {
        &self.strings
    }

    // --- code stream ------------------------------------------------------

    /// Append one raw word, returning its code index.
    pub fn emit_word(&mut self, word: u16) -> u32 {
        let idx = self.code.len() as u32;
        self.code.push(word);
        idx
    }

    /// Append an opcode word (`op`, `rd`, `rs`), returning its code index.
    pub fn emit_op(&mut self, op: Op, rd: u8, rs: u8) -> u32 {
        self.emit_word(opcode::encode_op_word(op, rd, rs))
    }

    /// Append a register-list word (`op`, 8-bit bitmap), returning its code
    /// index.
    pub fn emit_reglist(&mut self, op: Op, bitmap: u8) -> u32 {
        self.emit_word(opcode::encode_reglist_word(op, bitmap))
    }

    pub fn code_len(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn code(&self) -> &[u16] {
        &self.code
    }

    /// Discard every word from `code_index` onward, along with the debug
    /// info that pointed at it. Used to compile a dead `if`/`while` arm for
    /// type-checking purposes only (a constant condition resolves it at
    /// compile time) and then erase the code it emitted. Must only be
    /// called with a mark taken before any forward-reference patch that
    /// might still need to target code at or past `code_index`.
    pub fn truncate_code(&mut self, code_index: u32) {
        self.code.truncate(code_index as usize);
        self.debug.truncate(code_index);
    }

    pub fn read_word(&self, idx: u32) -> u16 {
        self.code[idx as usize]
    }

    /// Overwrite a single previously-emitted word directly, for fixing up
    /// an immediate (such as `ENTER`'s frame-size operand) that isn't one
    /// of the branch-patch shapes `patch` understands.
    pub fn patch_raw_word(&mut self, idx: u32, value: u16) {
        self.code[idx as usize] = value;
    }

    // --- branch patching ----------------------------------------------------

    /// Patch the branch/forward-reference instruction whose opcode word is
    /// at code index `at` so it targets code index `target`. `kind` selects
    /// the bit-packing pattern; in debug builds the opcode byte already at
    /// `at` is checked against the family `kind` implies, catching
    /// patch-site bookkeeping bugs (wrong `at`, stale patch list) early.
    pub fn patch(&mut self, at: u32, target: u32, kind: PatchKind) {
        let instr_len = patch_instr_len(kind);
        let rel = target as i64 - (at as i64 + instr_len as i64);
        let rel = rel as i32;
        match kind {
            PatchKind::Cond20 => {
                debug_assert!(matches!(
                    opcode::decode_op_word(self.code[at as usize]).0,
                    b if b == Op::Bez as u8 || b == Op::Bnz as u8
                ));
                let (lo, hi) = opcode::pack_cond20(rel);
                let word = self.code[at as usize];
                self.code[at as usize] = (word & !0xF) | lo;
                self.code[at as usize + 1] = hi;
            }
            PatchKind::Rel24 => {
                debug_assert!(matches!(
                    opcode::decode_op_word(self.code[at as usize]).0,
                    b if b == Op::Br as u8 || b == Op::Call as u8
                        || b == Op::Bct as u8 || b == Op::Bcf as u8
                ));
                let (lo, hi) = opcode::pack_rel24(rel);
                let op_byte = self.code[at as usize] & 0xFF00;
                self.code[at as usize] = op_byte | lo;
                self.code[at as usize + 1] = hi;
            }
            PatchKind::Inc16 => {
                debug_assert_eq!(
                    opcode::decode_op_word(self.code[at as usize]).0,
                    Op::Bri as u8
                );
                self.code[at as usize + 1] = rel as u16;
            }
            PatchKind::Rip32 => {
                debug_assert_eq!(
                    opcode::decode_op_word(self.code[at as usize]).0,
                    Op::Ldrip as u8
                );
                let bits = rel as u32;
                self.code[at as usize + 1] = (bits & 0xFFFF) as u16;
                self.code[at as usize + 2] = (bits >> 16) as u16;
            }
        }
    }

    /// Decode the offset a previously patched instruction carries, for
    /// round-trip testing.
    pub fn read_patched_offset(&self, at: u32, kind: PatchKind) -> i32 {
        match kind {
            PatchKind::Cond20 => {
                let word = self.code[at as usize];
                let lo = word & 0xF;
                let hi = self.code[at as usize + 1];
                opcode::unpack_cond20(lo, hi)
            }
            PatchKind::Rel24 => {
                let lo = self.code[at as usize] & 0xFF;
                let hi = self.code[at as usize + 1];
                opcode::unpack_rel24(lo, hi)
            }
            PatchKind::Inc16 => self.code[at as usize + 1] as i16 as i32,
            PatchKind::Rip32 => {
                let lo = self.code[at as usize + 1] as u32;
                let hi = self.code[at as usize + 2] as u32;
                ((hi << 16) | lo) as i32
            }
        }
    }

    /// Recover the absolute target code index a patched instruction points
    /// at, given where it lives.
    pub fn patched_target(&self, at: u32, kind: PatchKind) -> u32 {
        let instr_len = patch_instr_len(kind) as i64;
        (at as i64 + instr_len + self.read_patched_offset(at, kind) as i64) as u32
    }

    // --- globals -------------------------------------------------------------

    pub fn push_global_bytes(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.globals.len() as u32;
        self.globals.extend_from_slice(bytes);
        offset
    }

    pub fn globals(&self) -> &[u8] {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut [u8] {
        &mut self.globals
    }

    pub fn globals_len(&self) -> u32 {
        self.globals.len() as u32
    }

    // --- entry point & debug info ---------------------------------------------

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn set_entry_point(&mut self, at: u32) {
        self.entry_point = at;
    }

    pub fn record_line(&mut self, code_index: u32, line: u32) {
        self.debug.record(code_index, line);
    }

    pub fn line_for(&self, code_index: u32) -> Option<u32> {
        self.debug.line_for(code_index)
    }

    pub fn debug_index(&self) -> &DebugIndex {
        &self.debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Op;

    #[test]
    fn cond20_patch_round_trips_target() {
        let mut chunk = Chunk::new();
        let at = chunk.emit_op(Op::Bez, 1, 0);
        chunk.emit_word(0); // second half-word
        let target = chunk.emit_op(Op::Add32, 0, 0);
        chunk.patch(at, target, PatchKind::Cond20);
        assert_eq!(chunk.patched_target(at, PatchKind::Cond20), target);
    }

    #[test]
    fn rel24_patch_round_trips_backward_target() {
        let mut chunk = Chunk::new();
        let loop_top = chunk.emit_op(Op::Add32, 0, 0);
        let at = chunk.emit_op(Op::Br, 0, 0);
        chunk.emit_word(0);
        chunk.patch(at, loop_top, PatchKind::Rel24);
        assert_eq!(chunk.patched_target(at, PatchKind::Rel24), loop_top);
    }

    #[test]
    fn rip32_patch_round_trips() {
        let mut chunk = Chunk::new();
        let at = chunk.emit_op(Op::Ldrip, 2, 0);
        chunk.emit_word(0);
        chunk.emit_word(0);
        let target = chunk.emit_op(Op::Enter, 0, 0);
        chunk.emit_word(0);
        chunk.emit_word(0);
        chunk.patch(at, target, PatchKind::Rip32);
        assert_eq!(chunk.patched_target(at, PatchKind::Rip32), target);
    }

    #[test]
    fn debug_index_compresses_runs_and_looks_up_lines() {
        let mut chunk = Chunk::new();
        chunk.record_line(0, 1);
        chunk.record_line(1, 1);
        chunk.record_line(2, 1);
        chunk.record_line(3, 2);
        assert_eq!(chunk.debug_index().len(), 2);
        assert_eq!(chunk.line_for(0), Some(1));
        assert_eq!(chunk.line_for(2), Some(1));
        assert_eq!(chunk.line_for(3), Some(2));
        assert_eq!(chunk.line_for(100), Some(2));
    }

    #[test]
    fn interned_strings_keep_stable_indices() {
        let mut chunk = Chunk::new();
        let a = chunk.intern_string("hello");
        let b = chunk.intern_string("world");
        assert_eq!(chunk.string_literal(a), "hello");
        assert_eq!(chunk.string_literal(b), "world");
    }

    #[test]
    fn idempotent_emission_produces_identical_chunks() {
        fn build() -> Chunk {
            let mut c = Chunk::new();
            c.emit_op(Op::Add32, 1, 2);
            c.push_global_bytes(&42i64.to_le_bytes());
            c.set_entry_point(0);
            c.record_line(0, 1);
            c
        }
        let a = build();
        let b = build();
        assert_eq!(a.code(), b.code());
        assert_eq!(a.globals(), b.globals());
        assert_eq!(a.entry_point(), b.entry_point());
        assert_eq!(a.debug_index(), b.debug_index());
    }
}
