//! The small set of predeclared names every program gets for free:
//! `write`/`writeln` (variadic output via the `WRITE` syscall) and
//! `sizeof` (a compile-time constant fold over a type name). Everything
//! else a Pascal program can call is user-declared.

use pasc_core::{Chunk, Op};

use crate::emitter::Emitter;
use crate::error::{CompileError, ErrorKind};
use crate::symtab::ConstValue;
use crate::types::{TypeArena, TypeDesc, TypeId};
use crate::value::{self, Value, ValueLoc};

/// Tag byte the VM's `WRITE` syscall reads off the stack ahead of each
/// argument's payload, telling it how to format the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteTag {
    I32 = 0,
    U32 = 1,
    I64 = 2,
    U64 = 3,
    F32 = 4,
    F64 = 5,
    Bool = 6,
    Char = 7,
    StringHandle = 8,
    Newline = 9,
}

fn write_tag_for(arena: &TypeArena, ty: TypeId) -> Option<WriteTag> {
    match arena.get(ty) {
        TypeDesc::Int(k) => Some(match k {
            crate::types::IntKind::I64 => WriteTag::I64,
            crate::types::IntKind::U64 => WriteTag::U64,
            k if k.is_signed() => WriteTag::I32,
            _ => WriteTag::U32,
        }),
        TypeDesc::F32 => Some(WriteTag::F32),
        TypeDesc::F64 => Some(WriteTag::F64),
        TypeDesc::Bool => Some(WriteTag::Bool),
        TypeDesc::Char => Some(WriteTag::Char),
        TypeDesc::String => Some(WriteTag::StringHandle),
        _ => None,
    }
}

/// Name recognized as a builtin, independent of any user declaration
/// (user code may not redeclare these; see `ErrorKind::RedefinitionOfPredefined`).
pub fn lookup(name: &str) -> Option<&'static str> {
    const NAMES: [&str; 3] = ["write", "writeln", "sizeof"];
    NAMES.iter().find(|n| n.eq_ignore_ascii_case(name)).copied()
}

/// Emit one argument's `WRITE` syscall push: a `MOVQI`/`MOVI` tag byte
/// followed by the value itself, each in its natural-width register.
fn emit_write_arg(arena: &TypeArena, emitter: &mut Emitter, chunk: &mut Chunk, arg: Value, line: u32) -> Result<(), CompileError> {
    let tag = write_tag_for(arena, arg.type_id).ok_or_else(|| {
        CompileError::new(
            ErrorKind::TypeMismatch,
            line,
            format!(
                "write/writeln cannot format a value of type {}",
                arena.display_name(arg.type_id)
            ),
        )
    })?;
    let arg = if matches!(arg.loc, ValueLoc::Flag) {
        value::materialize_flag(emitter, chunk, arg)
    } else {
        arg
    };
    let r = value::load_to_reg(arena, emitter, chunk, &arg);
    let tag_reg = emitter.regs.allocate(crate::emitter::RegKind::Gpr).0;
    // MOVQI's immediate is a sign-extended nibble (-8..7); tags run 0..9,
    // so MOVI (full-width) is used instead to keep StringHandle/Newline
    // from being misread as negative.
    emitter.emit_movi(chunk, tag_reg, tag as i64);
    emitter.emit(chunk, Op::Write, tag_reg, r);
    emitter.regs.free(crate::emitter::RegKind::Gpr, tag_reg);
    value::free_value(emitter, chunk, arena, &arg);
    Ok(())
}

/// Compile a call to `write`/`writeln`: each argument becomes one `WRITE`
/// syscall; `writeln` appends a trailing newline marker.
pub fn compile_write(
    arena: &TypeArena,
    emitter: &mut Emitter,
    chunk: &mut Chunk,
    args: Vec<Value>,
    newline: bool,
    line: u32,
) -> Result<(), CompileError> {
    for arg in args {
        emit_write_arg(arena, emitter, chunk, arg, line)?;
    }
    if newline {
        let tag_reg = emitter.regs.allocate(crate::emitter::RegKind::Gpr).0;
        emitter.emit_movi(chunk, tag_reg, WriteTag::Newline as i64);
        emitter.emit(chunk, Op::Write, tag_reg, 0);
        emitter.regs.free(crate::emitter::RegKind::Gpr, tag_reg);
    }
    Ok(())
}

/// `sizeof(<type name>)`: folds entirely at compile time, never emits
/// anything.
pub fn compile_sizeof(arena: &TypeArena, ty: TypeId) -> Value {
    let size = arena.size_of(ty);
    Value::constant(crate::types::TY_U32, ConstValue::UInt(size as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("WriteLn"), Some("writeln"));
        assert_eq!(lookup("SizeOf"), Some("sizeof"));
        assert_eq!(lookup("frobnicate"), None);
    }

    #[test]
    fn sizeof_folds_to_a_constant() {
        let arena = TypeArena::new();
        let v = compile_sizeof(&arena, crate::types::TY_I64);
        match v.as_const() {
            Some(ConstValue::UInt(8)) => {}
            other => panic!("expected UInt(8), got {other:?}"),
        }
    }
}
