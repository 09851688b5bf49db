//! The type model: a fixed-size type descriptor arena plus the coercion
//! table that drives implicit conversion.
//!
//! Type descriptors are not `Rc`/`Box` trees: Pascal's `^T` lets a record
//! contain a pointer to itself (directly or through a chain), which would
//! make a naive owned-tree representation a cycle. Instead every descriptor
//! lives in a `TypeArena` and refers to others by index (`TypeId`), the
//! usual way to give a self-referential graph stable edges without `Rc`.

use std::fmt;

/// Index into a `TypeArena`. Stable for the arena's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Ordinal/float kind used by the coercion table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl IntKind {
    pub fn size(self) -> u32 {
        match self {
            IntKind::I8 | IntKind::U8 => 1,
            IntKind::I16 | IntKind::U16 => 2,
            IntKind::I32 | IntKind::U32 => 4,
            IntKind::I64 | IntKind::U64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, IntKind::I8 | IntKind::I16 | IntKind::I32 | IntKind::I64)
    }

    /// Width class used to pick 32- vs 64-bit instruction forms. 8/16-bit
    /// values are always worked on as 32-bit; they promote before any
    /// arithmetic touches them.
    pub fn exec_width(self) -> ExecWidth {
        match self {
            IntKind::I64 | IntKind::U64 => ExecWidth::W64,
            _ => ExecWidth::W32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecWidth {
    W32,
    W64,
}

/// A field in a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    pub ty: TypeId,
    pub offset: u32,
}

/// How a subroutine parameter is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    /// Plain pass-by-value.
    Value,
    /// Pass-by-value, but the body may not assign to it.
    Const,
    /// Pass-by-reference: the caller passes the variable's address and
    /// every read/write is compiled as a dereference.
    ByRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDesc {
    pub name: String,
    pub ty: TypeId,
    pub mode: ParamMode,
}

/// A type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    Invalid,
    Int(IntKind),
    F32,
    F64,
    Bool,
    Char,
    /// `pointee = None` models an opaque pointer (`nil`'s type, or the
    /// result of a cast with an unknown target): it is assignment- and
    /// comparison-compatible with every pointer type.
    Pointer {
        pointee: Option<TypeId>,
    },
    String,
    Record {
        name: Option<String>,
        fields: Vec<FieldDesc>,
        size: u32,
    },
    Subroutine {
        params: Vec<ParamDesc>,
        ret: Option<TypeId>,
        stack_arg_size: u32,
        hidden_params: u8,
    },
    StaticArray {
        low: i64,
        high: i64,
        elem: TypeId,
    },
}

/// An arena of type descriptors, indexed by `TypeId`.
pub struct TypeArena {
    types: Vec<TypeDesc>,
}

// Fixed indices for the built-in scalar types, seeded by `TypeArena::new`.
pub const TY_INVALID: TypeId = TypeId(0);
pub const TY_I8: TypeId = TypeId(1);
pub const TY_U8: TypeId = TypeId(2);
pub const TY_I16: TypeId = TypeId(3);
pub const TY_U16: TypeId = TypeId(4);
pub const TY_I32: TypeId = TypeId(5);
pub const TY_U32: TypeId = TypeId(6);
pub const TY_I64: TypeId = TypeId(7);
pub const TY_U64: TypeId = TypeId(8);
pub const TY_F32: TypeId = TypeId(9);
pub const TY_F64: TypeId = TypeId(10);
pub const TY_BOOL: TypeId = TypeId(11);
pub const TY_CHAR: TypeId = TypeId(12);
pub const TY_STRING: TypeId = TypeId(13);
/// The canonical opaque pointer type, used for `nil` literals and casts.
pub const TY_OPAQUE_PTR: TypeId = TypeId(14);

impl TypeArena {
    pub fn new() -> Self {
        let mut types = Vec::with_capacity(16);
        types.push(TypeDesc::Invalid); // TY_INVALID
        types.push(TypeDesc::Int(IntKind::I8));
        types.push(TypeDesc::Int(IntKind::U8));
        types.push(TypeDesc::Int(IntKind::I16));
        types.push(TypeDesc::Int(IntKind::U16));
        types.push(TypeDesc::Int(IntKind::I32));
        types.push(TypeDesc::Int(IntKind::U32));
        types.push(TypeDesc::Int(IntKind::I64));
        types.push(TypeDesc::Int(IntKind::U64));
        types.push(TypeDesc::F32);
        types.push(TypeDesc::F64);
        types.push(TypeDesc::Bool);
        types.push(TypeDesc::Char);
        types.push(TypeDesc::String);
        types.push(TypeDesc::Pointer { pointee: None });
        TypeArena { types }
    }

    pub fn push(&mut self, desc: TypeDesc) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(desc);
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeDesc {
        &self.types[id.0 as usize]
    }

    pub fn make_pointer(&mut self, pointee: TypeId) -> TypeId {
        self.push(TypeDesc::Pointer {
            pointee: Some(pointee),
        })
    }

    /// Byte size of a type. Pointers and subroutine values are host
    /// pointer-width (`usize`).
    pub fn size_of(&self, id: TypeId) -> u32 {
        match self.get(id) {
            TypeDesc::Invalid => 0,
            TypeDesc::Int(k) => k.size(),
            TypeDesc::F32 => 4,
            TypeDesc::F64 => 8,
            TypeDesc::Bool => 1,
            TypeDesc::Char => 1,
            TypeDesc::Pointer { .. } => std::mem::size_of::<usize>() as u32,
            // A runtime string value is a 4-byte handle into the VM's
            // string heap (`pasc_vm::Vm::string_heap`), not the `PString`
            // struct itself: memory here is a flat byte buffer, and a
            // `PString`'s heap variant owns a real `Box<String>` that can't
            // be bitwise-copied into it without aliasing. See DESIGN.md.
            TypeDesc::String => 4,
            TypeDesc::Record { size, .. } => *size,
            TypeDesc::Subroutine { .. } => std::mem::size_of::<usize>() as u32,
            TypeDesc::StaticArray { low, high, elem } => {
                let count = (high - low + 1).max(0) as u32;
                count * self.size_of(*elem)
            }
        }
    }

    /// Structural equality: pointers compare by pointee equality (an opaque
    /// pointer is equal to any pointer type); records compare by field
    /// table, not name; arrays by bounds and element type; subroutines by
    /// signature.
    pub fn structurally_eq(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (TypeDesc::Pointer { pointee: pa }, TypeDesc::Pointer { pointee: pb }) => {
                match (pa, pb) {
                    (None, _) | (_, None) => true,
                    (Some(pa), Some(pb)) => self.structurally_eq(*pa, *pb),
                }
            }
            (
                TypeDesc::Record { fields: fa, .. },
                TypeDesc::Record { fields: fb, .. },
            ) => {
                fa.len() == fb.len()
                    && fa.iter().zip(fb.iter()).all(|(x, y)| {
                        x.name == y.name && x.offset == y.offset && self.structurally_eq(x.ty, y.ty)
                    })
            }
            (
                TypeDesc::StaticArray {
                    low: la,
                    high: ha,
                    elem: ea,
                },
                TypeDesc::StaticArray {
                    low: lb,
                    high: hb,
                    elem: eb,
                },
            ) => la == lb && ha == hb && self.structurally_eq(*ea, *eb),
            (
                TypeDesc::Subroutine {
                    params: pa,
                    ret: ra,
                    ..
                },
                TypeDesc::Subroutine {
                    params: pb,
                    ret: rb,
                    ..
                },
            ) => {
                pa.len() == pb.len()
                    && pa
                        .iter()
                        .zip(pb.iter())
                        .all(|(x, y)| x.mode == y.mode && self.structurally_eq(x.ty, y.ty))
                    && match (ra, rb) {
                        (None, None) => true,
                        (Some(ra), Some(rb)) => self.structurally_eq(*ra, *rb),
                        _ => false,
                    }
            }
            _ => false,
        }
    }

    pub fn is_int(&self, id: TypeId) -> bool {
        matches!(self.get(id), TypeDesc::Int(_))
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(self.get(id), TypeDesc::F32 | TypeDesc::F64)
    }

    pub fn is_ordinal(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            TypeDesc::Int(_) | TypeDesc::Bool | TypeDesc::Char
        )
    }

    pub fn int_kind(&self, id: TypeId) -> Option<IntKind> {
        match self.get(id) {
            TypeDesc::Int(k) => Some(*k),
            _ => None,
        }
    }

    pub fn display_name(&self, id: TypeId) -> String {
        match self.get(id) {
            TypeDesc::Invalid => "<invalid>".to_string(),
            TypeDesc::Int(IntKind::I8) => "shortint".to_string(),
            TypeDesc::Int(IntKind::U8) => "byte".to_string(),
            TypeDesc::Int(IntKind::I16) => "smallint".to_string(),
            TypeDesc::Int(IntKind::U16) => "word".to_string(),
            TypeDesc::Int(IntKind::I32) => "integer".to_string(),
            TypeDesc::Int(IntKind::U32) => "cardinal".to_string(),
            TypeDesc::Int(IntKind::I64) => "int64".to_string(),
            TypeDesc::Int(IntKind::U64) => "uint64".to_string(),
            TypeDesc::F32 => "single".to_string(),
            TypeDesc::F64 => "double".to_string(),
            TypeDesc::Bool => "boolean".to_string(),
            TypeDesc::Char => "char".to_string(),
            TypeDesc::String => "string".to_string(),
            TypeDesc::Pointer { pointee: None } => "pointer".to_string(),
            TypeDesc::Pointer {
                pointee: Some(inner),
            } => format!("^{}", self.display_name(*inner)),
            TypeDesc::Record { name, .. } => {
                name.clone().unwrap_or_else(|| "record".to_string())
            }
            TypeDesc::Subroutine { ret, .. } => match ret {
                Some(_) => "function".to_string(),
                None => "procedure".to_string(),
            },
            TypeDesc::StaticArray { low, high, elem } => {
                format!("array[{}..{}] of {}", low, high, self.display_name(*elem))
            }
        }
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeArena({} types)", self.types.len())
    }
}

/// The outcome of coercing two operand types together for a binary
/// operation: the common type both sides convert to, or `None` if no
/// implicit conversion applies.
pub fn coerce(arena: &TypeArena, l: TypeId, r: TypeId) -> Option<TypeId> {
    if l == r {
        return Some(l);
    }
    match (arena.get(l), arena.get(r)) {
        (TypeDesc::Int(_), TypeDesc::Int(_)) => Some(widen_int(arena, l, r)),
        (TypeDesc::F32 | TypeDesc::F64, TypeDesc::Int(_))
        | (TypeDesc::Int(_), TypeDesc::F32 | TypeDesc::F64) => Some(widen_float_int(arena, l, r)),
        (TypeDesc::F32 | TypeDesc::F64, TypeDesc::F32 | TypeDesc::F64) => {
            if matches!(arena.get(l), TypeDesc::F64) || matches!(arena.get(r), TypeDesc::F64) {
                Some(TY_F64)
            } else {
                Some(TY_F32)
            }
        }
        (TypeDesc::Pointer { .. }, TypeDesc::Int(_)) => Some(l),
        (TypeDesc::Int(_), TypeDesc::Pointer { .. }) => Some(r),
        (TypeDesc::Pointer { .. }, TypeDesc::Pointer { .. }) => {
            if arena.structurally_eq(l, r) {
                Some(l)
            } else {
                None
            }
        }
        (TypeDesc::String, TypeDesc::String) => Some(TY_STRING),
        (TypeDesc::Bool, TypeDesc::Bool) => Some(TY_BOOL),
        _ => None,
    }
}

fn widen_int(arena: &TypeArena, l: TypeId, r: TypeId) -> TypeId {
    let lk = arena.int_kind(l).unwrap();
    let rk = arena.int_kind(r).unwrap();
    // 8/16-bit always promote to (at least) 32-bit.
    let lk32 = promote_small(lk);
    let rk32 = promote_small(rk);
    if lk32.size() != rk32.size() {
        return if lk32.size() > rk32.size() { l } else { r };
    }
    // Same width, mixed signedness: promote to unsigned of that width.
    if lk32.is_signed() == rk32.is_signed() {
        if lk32 == lk { l } else { r }
    } else if !lk32.is_signed() {
        if lk32 == lk { l } else { r }
    } else if rk32 == rk {
        r
    } else {
        l
    }
}

fn promote_small(k: IntKind) -> IntKind {
    match k {
        IntKind::I8 | IntKind::I16 => IntKind::I32,
        IntKind::U8 | IntKind::U16 => IntKind::U32,
        other => other,
    }
}

fn widen_float_int(arena: &TypeArena, l: TypeId, r: TypeId) -> TypeId {
    if arena.is_float(l) {
        l
    } else if arena.is_float(r) {
        r
    } else {
        TY_F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_sizes_are_correct() {
        let arena = TypeArena::new();
        assert_eq!(arena.size_of(TY_I32), 4);
        assert_eq!(arena.size_of(TY_I64), 8);
        assert_eq!(arena.size_of(TY_BOOL), 1);
        assert_eq!(arena.size_of(TY_F64), 8);
    }

    #[test]
    fn opaque_pointer_equals_any_pointer() {
        let mut arena = TypeArena::new();
        let p_int = arena.make_pointer(TY_I32);
        assert!(arena.structurally_eq(p_int, TY_OPAQUE_PTR));
        assert!(arena.structurally_eq(TY_OPAQUE_PTR, p_int));
    }

    #[test]
    fn records_compare_structurally_not_by_name() {
        let mut arena = TypeArena::new();
        let fields = vec![
            FieldDesc {
                name: "a".into(),
                ty: TY_I32,
                offset: 0,
            },
            FieldDesc {
                name: "b".into(),
                ty: TY_I32,
                offset: 4,
            },
        ];
        let r1 = arena.push(TypeDesc::Record {
            name: Some("Point".into()),
            fields: fields.clone(),
            size: 8,
        });
        let r2 = arena.push(TypeDesc::Record {
            name: Some("Coord".into()),
            fields,
            size: 8,
        });
        assert!(arena.structurally_eq(r1, r2));
    }

    #[test]
    fn small_ints_promote_to_32_bit() {
        let arena = TypeArena::new();
        let common = coerce(&arena, TY_I8, TY_I16).unwrap();
        assert_eq!(common, TY_I32);
    }

    #[test]
    fn int_and_float_widen_to_float() {
        let arena = TypeArena::new();
        assert_eq!(coerce(&arena, TY_I32, TY_F64), Some(TY_F64));
        assert_eq!(coerce(&arena, TY_I32, TY_F32), Some(TY_F32));
    }

    #[test]
    fn pointer_and_ordinal_coerce_to_pointer() {
        let mut arena = TypeArena::new();
        let p = arena.make_pointer(TY_I32);
        assert_eq!(coerce(&arena, p, TY_I32), Some(p));
    }

    #[test]
    fn mismatched_pointee_pointers_do_not_coerce() {
        let mut arena = TypeArena::new();
        let p1 = arena.make_pointer(TY_I32);
        let p2 = arena.make_pointer(TY_BOOL);
        assert_eq!(coerce(&arena, p1, p2), None);
    }
}
