//! `Value`: the result of compiling an expression.
//!
//! There is no AST node for "expression" — every expression-compiling
//! routine in `compiler.rs` returns a `Value` directly, which is either a
//! still-folded compile-time constant, a register, a memory operand, or the
//! VM's condition flag. This is the single-pass unification this dialect
//! relies on: a `Value` *is* the code already emitted to produce it, plus
//! enough bookkeeping to consume it (coerce it, store it, free its
//! register) without re-deriving anything.

use pasc_core::{Chunk, Op, Reg};

use crate::emitter::{Emitter, RegKind};
use crate::symtab::ConstValue;
use crate::types::{self, ExecWidth, IntKind, TypeArena, TypeDesc, TypeId};

/// Where a compiled expression's value currently lives.
#[derive(Debug, Clone)]
pub enum ValueLoc {
    /// Folded at compile time; never touched a register.
    Const(ConstValue),
    /// Live in a register. String-typed registers hold a heap handle,
    /// pointer-typed registers a pointer, everything else the raw value.
    Reg(Reg),
    /// A memory-resident operand (local/global): a frame- or
    /// globals-relative byte offset.
    Mem { offset: i32, is_global: bool },
    /// A location reached through a pointer already materialized into a
    /// register: the address is `base`'s runtime value plus `offset`, with
    /// no FP/GP-relative lookup involved. Produced by `^` and by any
    /// `.field`/`[index]` chained off a dereferenced pointer.
    Indirect { base: Reg, offset: i32 },
    /// The VM's single condition flag, produced by a comparison and not yet
    /// materialized into a register.
    Flag,
}

#[derive(Debug, Clone)]
pub struct Value {
    pub type_id: TypeId,
    pub loc: ValueLoc,
    /// Set when `loc` is a `Reg` this expression allocated for itself (as
    /// opposed to a named variable's persistent register, or one borrowed
    /// from an outer construct like a loop counter): only an owned register
    /// is freed when the value is consumed.
    pub owned_reg: bool,
}

impl Value {
    pub fn constant(type_id: TypeId, c: ConstValue) -> Value {
        Value {
            type_id,
            loc: ValueLoc::Const(c),
            owned_reg: false,
        }
    }

    pub fn register(type_id: TypeId, reg: Reg, owned: bool) -> Value {
        Value {
            type_id,
            loc: ValueLoc::Reg(reg),
            owned_reg: owned,
        }
    }

    pub fn memory(type_id: TypeId, offset: i32, is_global: bool) -> Value {
        Value {
            type_id,
            loc: ValueLoc::Mem { offset, is_global },
            owned_reg: false,
        }
    }

    pub fn indirect(type_id: TypeId, base: Reg, offset: i32, owned_reg: bool) -> Value {
        Value {
            type_id,
            loc: ValueLoc::Indirect { base, offset },
            owned_reg,
        }
    }

    /// A read-only alias of `v`'s location that does not own its register:
    /// used when a location must be read (e.g. as the left side of a
    /// compound assignment) without transferring away the responsibility
    /// to free it, which stays with the original `Value`.
    pub fn borrow(v: &Value) -> Value {
        Value {
            type_id: v.type_id,
            loc: v.loc.clone(),
            owned_reg: false,
        }
    }

    pub fn flag(type_id: TypeId) -> Value {
        Value {
            type_id,
            loc: ValueLoc::Flag,
            owned_reg: false,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self.loc, ValueLoc::Const(_))
    }

    pub fn as_const(&self) -> Option<&ConstValue> {
        match &self.loc {
            ValueLoc::Const(c) => Some(c),
            _ => None,
        }
    }
}

/// Which register bank a type lives in.
pub fn reg_kind_of(arena: &TypeArena, ty: TypeId) -> RegKind {
    if arena.is_float(ty) {
        RegKind::Fpr
    } else {
        RegKind::Gpr
    }
}

/// Load/store opcode pair for a scalar type's natural width, used by
/// `load_to_reg`/`store_reg_to_mem`. Records and arrays are not handled
/// here; they always move through `MEMCPY`.
fn mem_ops(arena: &TypeArena, ty: TypeId) -> (Op, Op, bool) {
    // (long-form-free short load, short store, is_long_needed placeholder)
    match arena.get(ty) {
        TypeDesc::Int(IntKind::I8) => (Op::LdS8, Op::St8, false),
        TypeDesc::Int(IntKind::U8) | TypeDesc::Bool | TypeDesc::Char => (Op::Ld8, Op::St8, false),
        TypeDesc::Int(IntKind::I16) => (Op::LdS16, Op::St16, false),
        TypeDesc::Int(IntKind::U16) => (Op::Ld16, Op::St16, false),
        TypeDesc::Int(IntKind::I32) | TypeDesc::Int(IntKind::U32) => (Op::Ld32, Op::St32, false),
        TypeDesc::Int(IntKind::I64) | TypeDesc::Int(IntKind::U64) => (Op::Ld64, Op::St64, false),
        // Distinct FPR-bank opcodes: a value::reg_kind_of(F32|F64) value
        // loads into an FPR register, which a plain Ld32/St32 can't address.
        TypeDesc::F32 => (Op::LdF32, Op::StF32, false),
        TypeDesc::F64 => (Op::LdF64, Op::StF64, false),
        TypeDesc::Pointer { .. } => (Op::Ld64, Op::St64, false),
        TypeDesc::String => (Op::Ld32, Op::St32, false),
        other => panic!("mem_ops: {other:?} has no scalar load/store form"),
    }
}

/// Long-form variants of a load/store pair, used when the byte offset does
/// not fit the short form's 16-bit signed displacement.
fn long_mem_ops(op: (Op, Op, bool)) -> (Op, Op) {
    let long_ld = match op.0 {
        Op::Ld8 => Op::Ld8L,
        Op::Ld16 => Op::Ld16L,
        Op::Ld32 => Op::Ld32L,
        Op::Ld64 => Op::Ld64L,
        Op::LdS8 => Op::LdS8L,
        Op::LdS16 => Op::LdS16L,
        Op::LdS32 => Op::LdS32L,
        Op::LdF32 => Op::LdF32L,
        Op::LdF64 => Op::LdF64L,
        other => other,
    };
    let long_st = match op.1 {
        Op::St8 => Op::St8L,
        Op::St16 => Op::St16L,
        Op::St32 => Op::St32L,
        Op::St64 => Op::St64L,
        Op::StF32 => Op::StF32L,
        Op::StF64 => Op::StF64L,
        other => other,
    };
    (long_ld, long_st)
}

fn fits_i16(offset: i32) -> bool {
    i16::try_from(offset).is_ok()
}

/// Emit a load of `base`-relative `offset` into `rd`, choosing the short or
/// long displacement form for the load/store encoding. `base` is
/// FP/GP for a named variable's storage, or any register already holding a
/// pointer's address for a dereferenced location.
fn emit_load(emitter: &Emitter, chunk: &mut Chunk, ty_ops: (Op, Op, bool), rd: Reg, offset: i32, base: Reg) {
    if fits_i16(offset) {
        emitter.emit(chunk, ty_ops.0, rd, base);
        chunk.emit_word(offset as u16);
    } else {
        let (long_ld, _) = long_mem_ops(ty_ops);
        emitter.emit(chunk, long_ld, rd, base);
        chunk.emit_word((offset as u32 & 0xFFFF) as u16);
        chunk.emit_word(((offset as u32) >> 16) as u16);
    }
}

fn emit_store(emitter: &Emitter, chunk: &mut Chunk, ty_ops: (Op, Op, bool), rs: Reg, offset: i32, base: Reg) {
    if fits_i16(offset) {
        emitter.emit(chunk, ty_ops.1, rs, base);
        chunk.emit_word(offset as u16);
    } else {
        let (_, long_st) = long_mem_ops(ty_ops);
        emitter.emit(chunk, long_st, rs, base);
        chunk.emit_word((offset as u32 & 0xFFFF) as u16);
        chunk.emit_word(((offset as u32) >> 16) as u16);
    }
}

fn base_of(is_global: bool) -> Reg {
    if is_global { crate::emitter::GP } else { crate::emitter::FP }
}

/// Materialize a value's condition flag (if that's where it lives) into a
/// fresh boolean-typed register via `GETFLAG`: an expression result is
/// single-consumer unless explicitly materialized.
pub fn materialize_flag(emitter: &mut Emitter, chunk: &mut Chunk, v: Value) -> Value {
    match v.loc {
        ValueLoc::Flag => {
            let (r, spilled) = emitter.regs.allocate(RegKind::Gpr);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, r, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            emitter.emit(chunk, Op::GetFlag, r, 0);
            Value::register(v.type_id, r, true)
        }
        _ => v,
    }
}

/// Load `v` into a fresh-or-existing register, emitting a `MOVI` for a
/// constant or a load for a memory operand. Registers already in a
/// register stay put (not re-copied).
pub fn load_to_reg(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, v: &Value) -> Reg {
    let kind = reg_kind_of(arena, v.type_id);
    match &v.loc {
        ValueLoc::Reg(r) => *r,
        ValueLoc::Const(c) => {
            let (r, spilled) = emitter.regs.allocate(kind);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(kind, r, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            emit_const_into(emitter, chunk, c, r, v.type_id, arena);
            r
        }
        ValueLoc::Mem { offset, is_global } => {
            let (r, spilled) = emitter.regs.allocate(kind);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(kind, r, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            let ops = mem_ops(arena, v.type_id);
            emit_load(emitter, chunk, ops, r, *offset, base_of(*is_global));
            r
        }
        ValueLoc::Indirect { base, offset } => {
            let (r, spilled) = emitter.regs.allocate(kind);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(kind, r, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            let ops = mem_ops(arena, v.type_id);
            emit_load(emitter, chunk, ops, r, *offset, *base);
            r
        }
        ValueLoc::Flag => {
            let (r, spilled) = emitter.regs.allocate(RegKind::Gpr);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, r, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            emitter.emit(chunk, Op::GetFlag, r, 0);
            r
        }
    }
}

fn emit_const_into(emitter: &Emitter, chunk: &mut Chunk, c: &ConstValue, rd: Reg, ty: TypeId, arena: &TypeArena) {
    match c {
        ConstValue::Int(i) => {
            emitter.emit_movi(chunk, rd, *i);
        }
        ConstValue::UInt(u) => {
            emitter.emit_movi(chunk, rd, *u as i64);
        }
        ConstValue::Bool(b) => {
            emitter.emit_movi(chunk, rd, *b as i64);
        }
        ConstValue::Char(ch) => {
            emitter.emit_movi(chunk, rd, *ch as i64);
        }
        ConstValue::Float(f) => {
            if matches!(arena.get(ty), TypeDesc::F32) {
                let bits = (*f as f32).to_bits();
                emitter.emit_movi_fpr_bits(chunk, rd, bits as u64, false);
            } else {
                let bits = f.to_bits();
                emitter.emit_movi_fpr_bits(chunk, rd, bits, true);
            }
        }
        ConstValue::Str(s) => {
            let idx = chunk.intern_string(s);
            emitter.emit_movi(chunk, rd, idx as i64);
        }
    }
}

/// Free `v`'s register if it owns one; otherwise a no-op (memory, const,
/// flag, or a borrowed/persistent register all free for free).
pub fn free_value(emitter: &mut Emitter, chunk: &mut Chunk, arena: &TypeArena, v: &Value) {
    if !v.owned_reg {
        return;
    }
    match v.loc {
        ValueLoc::Reg(r) => {
            let kind = reg_kind_of(arena, v.type_id);
            let needs_unspill = emitter.regs.free(kind, r);
            if needs_unspill {
                let (op, bit) = crate::emitter::reglist_bit(kind, r, false);
                emitter.emit_reglist(chunk, op, bit);
            }
        }
        ValueLoc::Indirect { base, .. } => {
            // The address register is always a GPR regardless of the
            // pointee's own bank (a float field is still reached through
            // an integer address).
            let needs_unspill = emitter.regs.free(RegKind::Gpr, base);
            if needs_unspill {
                let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, base, false);
                emitter.emit_reglist(chunk, op, bit);
            }
        }
        _ => {}
    }
}

/// Store `v` (already coerced to the destination type by the caller) into
/// a memory slot at `offset`. Records go through `MEMCPY`; scalars through
/// a plain load/store pair, spilling `v` into a register first if it is
/// not one already.
pub fn store_to_memory(
    arena: &TypeArena,
    emitter: &mut Emitter,
    chunk: &mut Chunk,
    v: Value,
    offset: i32,
    is_global: bool,
) {
    store_at(arena, emitter, chunk, v, base_of(is_global), offset);
}

/// Store `v` through a pointer already materialized into `base` (the
/// destination of a `^`/`.field`/`[index]` chain rooted at a dereference),
/// rather than a named variable's FP/GP-relative slot.
pub fn store_to_indirect(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, v: Value, base: Reg, offset: i32) {
    store_at(arena, emitter, chunk, v, base, offset);
}

fn store_at(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, v: Value, base: Reg, offset: i32) {
    if let TypeDesc::Record { size, .. } = arena.get(v.type_id) {
        let size = *size;
        store_record_at(arena, emitter, chunk, v, base, offset, size);
        return;
    }
    let ops = mem_ops(arena, v.type_id);
    let r = load_to_reg(arena, emitter, chunk, &v);
    emit_store(emitter, chunk, ops, r, offset, base);
    free_value(emitter, chunk, arena, &v);
}

fn store_record_at(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, v: Value, dst_base: Reg, dst_offset: i32, size: u32) {
    let (src_base, src_off) = match v.loc {
        ValueLoc::Mem { offset, is_global } => (base_of(is_global), offset),
        ValueLoc::Indirect { base, offset } => (base, offset),
        _ => panic!("record value must be memory-resident"),
    };
    let offset = dst_offset;
    let dst_base = dst_base;
    let (dst_addr, spilled1) = emitter.regs.allocate(RegKind::Gpr);
    if spilled1 {
        let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, dst_addr, true);
        emitter.emit_reglist(chunk, op, bit);
    }
    emitter.emit(chunk, Op::Lea, dst_addr, dst_base);
    chunk.emit_word(offset as u16);
    let (src_addr, spilled2) = emitter.regs.allocate(RegKind::Gpr);
    if spilled2 {
        let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, src_addr, true);
        emitter.emit_reglist(chunk, op, bit);
    }
    emitter.emit(chunk, Op::Lea, src_addr, src_base);
    chunk.emit_word(src_off as u16);
    emitter.emit(chunk, Op::MemCpy, dst_addr, src_addr);
    chunk.emit_word((size & 0xFFFF) as u16);
    chunk.emit_word((size >> 16) as u16);
    let un2 = emitter.regs.free(RegKind::Gpr, src_addr);
    if un2 {
        let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, src_addr, false);
        emitter.emit_reglist(chunk, op, bit);
    }
    let un1 = emitter.regs.free(RegKind::Gpr, dst_addr);
    if un1 {
        let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, dst_addr, false);
        emitter.emit_reglist(chunk, op, bit);
    }
}

/// Emit `Rd := &(base-relative offset)` — the address of a memory operand,
/// used by `@name` and by record/array element access.
pub fn emit_lea(emitter: &mut Emitter, chunk: &mut Chunk, offset: i32, is_global: bool) -> Reg {
    emit_lea_reg(emitter, chunk, base_of(is_global), offset)
}

/// Emit `Rd := &(base-relative offset)` against an arbitrary base register,
/// not just FP/GP — used to take the address of a location already reached
/// through a pointer (`ValueLoc::Indirect`), e.g. `@(p^.field)`.
pub fn emit_lea_reg(emitter: &mut Emitter, chunk: &mut Chunk, base: Reg, offset: i32) -> Reg {
    let (r, spilled) = emitter.regs.allocate(RegKind::Gpr);
    if spilled {
        let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, r, true);
        emitter.emit_reglist(chunk, op, bit);
    }
    emitter.emit(chunk, Op::Lea, r, base);
    chunk.emit_word(offset as u16);
    r
}

/// Convert a register holding a value of `from` into one holding `to`,
/// emitting a widen/narrow/convert instruction as needed. Returns the
/// (possibly same) register that now holds the converted value.
pub fn convert_reg(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, r: Reg, from: TypeId, to: TypeId) -> Reg {
    if from == to {
        return r;
    }
    match (arena.get(from), arena.get(to)) {
        (TypeDesc::Int(fk), TypeDesc::Int(tk)) => {
            let (fw, tw) = (fk.exec_width(), tk.exec_width());
            if fw == tw {
                return r;
            }
            let op = if fk.is_signed() {
                match fk {
                    IntKind::I8 => Op::Sx8To64,
                    IntKind::I16 => Op::Sx16To64,
                    IntKind::I32 => Op::Sx32To64,
                    _ => return r,
                }
            } else {
                match fk {
                    IntKind::U8 => Op::Zx8To64,
                    IntKind::U16 => Op::Zx16To64,
                    IntKind::U32 => Op::Zx32To64,
                    _ => return r,
                }
            };
            let _ = tw;
            emitter.emit(chunk, op, r, r);
            r
        }
        (TypeDesc::Int(fk), TypeDesc::F32 | TypeDesc::F64) => {
            let (fr, spilled) = emitter.regs.allocate(RegKind::Fpr);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(RegKind::Fpr, fr, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            let op = if matches!(arena.get(to), TypeDesc::F64) {
                Op::I2F64
            } else {
                Op::I2F32
            };
            let _ = fk;
            emitter.emit(chunk, op, fr, r);
            emitter.regs.free(RegKind::Gpr, r);
            fr
        }
        (TypeDesc::F32 | TypeDesc::F64, TypeDesc::Int(_)) => {
            let (ir, spilled) = emitter.regs.allocate(RegKind::Gpr);
            if spilled {
                let (op, bit) = crate::emitter::reglist_bit(RegKind::Gpr, ir, true);
                emitter.emit_reglist(chunk, op, bit);
            }
            let op = if matches!(arena.get(from), TypeDesc::F64) {
                Op::F2I64
            } else {
                Op::F2I32
            };
            emitter.emit(chunk, op, ir, r);
            emitter.regs.free(RegKind::Fpr, r);
            ir
        }
        (TypeDesc::F32, TypeDesc::F64) => {
            emitter.emit(chunk, Op::F32ToF64, r, r);
            r
        }
        (TypeDesc::F64, TypeDesc::F32) => {
            emitter.emit(chunk, Op::F64ToF32, r, r);
            r
        }
        (TypeDesc::Pointer { .. }, TypeDesc::Pointer { .. }) => r,
        _ => r,
    }
}

/// Coerce `v` to `target`, converting a constant numerically, or emitting
/// a convert instruction for a register (loading memory operands into a
/// register first). No-op if the types already match.
pub fn coerce_value(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, v: Value, target: TypeId) -> Value {
    if v.type_id == target {
        return v;
    }
    if let ValueLoc::Const(c) = &v.loc {
        if let Some(folded) = fold_const_convert(c, target, arena) {
            return Value::constant(target, folded);
        }
    }
    let was_owned = v.owned_reg;
    let r = load_to_reg(arena, emitter, chunk, &v);
    let r2 = convert_reg(arena, emitter, chunk, r, v.type_id, target);
    Value::register(target, r2, was_owned || r2 != r)
}

fn fold_const_convert(c: &ConstValue, target: TypeId, arena: &TypeArena) -> Option<ConstValue> {
    match (c, arena.get(target)) {
        (ConstValue::Int(i), TypeDesc::Int(_)) => Some(ConstValue::Int(*i)),
        (ConstValue::Int(i), TypeDesc::F32 | TypeDesc::F64) => Some(ConstValue::Float(*i as f64)),
        (ConstValue::UInt(u), TypeDesc::Int(_)) => Some(ConstValue::UInt(*u)),
        (ConstValue::UInt(u), TypeDesc::F32 | TypeDesc::F64) => Some(ConstValue::Float(*u as f64)),
        (ConstValue::Float(f), TypeDesc::F32 | TypeDesc::F64) => Some(ConstValue::Float(*f)),
        _ => None,
    }
}

/// The outcome of evaluating a constant binary numeric op at compile time.
pub fn fold_binary_const(
    arena: &TypeArena,
    op_is_float: bool,
    a: &ConstValue,
    b: &ConstValue,
    apply: impl Fn(f64, f64) -> f64,
    apply_i: impl Fn(i64, i64) -> Option<i64>,
) -> Option<ConstValue> {
    let _ = arena;
    if op_is_float {
        let af = const_as_f64(a)?;
        let bf = const_as_f64(b)?;
        Some(ConstValue::Float(apply(af, bf)))
    } else {
        let ai = const_as_i64(a)?;
        let bi = const_as_i64(b)?;
        apply_i(ai, bi).map(ConstValue::Int)
    }
}

pub fn const_as_f64(c: &ConstValue) -> Option<f64> {
    match c {
        ConstValue::Int(i) => Some(*i as f64),
        ConstValue::UInt(u) => Some(*u as f64),
        ConstValue::Float(f) => Some(*f),
        ConstValue::Char(c) => Some(*c as u32 as f64),
        _ => None,
    }
}

pub fn const_as_i64(c: &ConstValue) -> Option<i64> {
    match c {
        ConstValue::Int(i) => Some(*i),
        ConstValue::UInt(u) => Some(*u as i64),
        ConstValue::Bool(b) => Some(*b as i64),
        ConstValue::Char(c) => Some(*c as i64),
        _ => None,
    }
}

/// True if `ty` is a float type (used to pick the arithmetic family).
pub fn is_float_ty(arena: &TypeArena, ty: TypeId) -> bool {
    arena.is_float(ty)
}

/// Resolve the exec width / signedness pair used to pick an opcode variant
/// for an integer type (32- vs 64-bit, signed vs unsigned).
pub fn int_shape(arena: &TypeArena, ty: TypeId) -> Option<(ExecWidth, bool)> {
    arena.int_kind(ty).map(|k| (k.exec_width(), k.is_signed()))
}

pub use types::coerce as coerce_types;
