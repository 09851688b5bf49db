//! Symbol table: an open-addressed hash table of bindings, chained into a
//! stack of scopes.
//!
//! Grounded in `Vartab.h` from the reference implementation this dialect is
//! drawn from: a 0.75 max load factor, ×2 growth, and FNV-1a string hashing
//! (`VARTAB_MAX_LOAD = 3/4`, `VARTAB_GROW_FACTOR = 2`). Tombstones are kept
//! distinct from empty slots so probing after a delete still terminates
//! correctly.

use crate::types::TypeId;
use pasc_core::Reg;
use std::collections::HashMap;

/// FNV-1a over the raw bytes of a name, case-folded so Pascal's
/// case-insensitive identifiers hash identically regardless of spelling.
fn fnv1a_hash(name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for b in name.bytes() {
        hash ^= b.to_ascii_lowercase() as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const GROW_FACTOR: usize = 2;
const INITIAL_CAPACITY: usize = 8;

/// A unique id for a compiled subroutine, stable for the life of the
/// `Compiler` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubroutineId(pub u32);

/// A folded compile-time constant value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Char(char),
    Str(String),
}

/// Where a subroutine's call sites need to be patched once its entry offset
/// is known.
#[derive(Debug, Clone, Copy)]
pub struct PendingCallPatch {
    pub call_site: u32,
    pub kind: pasc_core::PatchKind,
}

#[derive(Debug, Clone)]
pub struct SubroutineDesc {
    pub name: String,
    pub type_id: TypeId,
    /// Set once the subroutine's body has been compiled (vs. only
    /// `forward`-declared).
    pub defined: bool,
    /// Code offset of the subroutine's `ENTER` instruction, once defined.
    pub entry: Option<u32>,
    /// Call sites recorded before `entry` was known.
    pub pending_patches: Vec<PendingCallPatch>,
}

/// A storage representation for a name in scope. A binding is a tagged
/// variant held by value inside the `Symbol` rather than a pointer into a
/// shared pool, so popping a scope simply drops it.
#[derive(Debug, Clone)]
pub enum Binding {
    Literal(ConstValue),
    Register(Reg),
    /// A memory-resident value: a frame-relative (local) or global byte
    /// offset, depending on which table owns the symbol.
    Memory { offset: i32, is_global: bool },
    Flag,
    Subroutine(SubroutineId),
    Builtin(&'static str),
    /// A name visible only as a type (used for casts / `sizeof`); it has no
    /// storage.
    TypeName,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub line: u32,
    pub type_id: TypeId,
    pub binding: Binding,
}

enum Slot {
    Empty,
    Tombstone,
    Occupied(Symbol),
}

/// One lexical scope: an open-addressed hash table of symbols.
pub struct Scope {
    slots: Vec<Slot>,
    len: usize, // occupied, not counting tombstones
}

impl Scope {
    pub fn new() -> Self {
        Scope::with_capacity(INITIAL_CAPACITY)
    }

    fn with_capacity(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || Slot::Empty);
        Scope { slots, len: 0 }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn load_factor_exceeded(&self) -> bool {
        self.len * MAX_LOAD_DEN >= self.capacity() * MAX_LOAD_NUM
    }

    fn grow(&mut self) {
        let new_cap = self.capacity() * GROW_FACTOR;
        let old = std::mem::replace(&mut self.slots, {
            let mut v = Vec::with_capacity(new_cap);
            v.resize_with(new_cap, || Slot::Empty);
            v
        });
        self.len = 0;
        for slot in old {
            if let Slot::Occupied(sym) = slot {
                self.insert_no_grow(sym);
            }
        }
    }

    fn insert_no_grow(&mut self, sym: Symbol) {
        let cap = self.capacity();
        let hash = fnv1a_hash(&sym.name) as usize;
        let mut idx = hash % cap;
        loop {
            match &self.slots[idx] {
                Slot::Empty | Slot::Tombstone => {
                    self.slots[idx] = Slot::Occupied(sym);
                    self.len += 1;
                    return;
                }
                Slot::Occupied(existing) if names_eq(&existing.name, &sym.name) => {
                    self.slots[idx] = Slot::Occupied(sym);
                    return;
                }
                _ => idx = (idx + 1) % cap,
            }
        }
    }

    fn find_index(&self, name: &str) -> Option<usize> {
        let cap = self.capacity();
        let hash = fnv1a_hash(name) as usize;
        let mut idx = hash % cap;
        let mut probes = 0;
        while probes < cap {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(sym) if names_eq(&sym.name, name) => return Some(idx),
                _ => {
                    idx = (idx + 1) % cap;
                    probes += 1;
                }
            }
        }
        None
    }

    /// Look up a binding by name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.find_index(name).map(|i| match &self.slots[i] {
            Slot::Occupied(sym) => sym,
            _ => unreachable!(),
        })
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        let idx = self.find_index(name)?;
        match &mut self.slots[idx] {
            Slot::Occupied(sym) => Some(sym),
            _ => unreachable!(),
        }
    }

    /// Define `name` in this scope, returning the previous symbol of that
    /// name if one already existed (the caller diagnoses a redefinition).
    pub fn set(&mut self, symbol: Symbol) -> Option<Symbol> {
        if self.load_factor_exceeded() {
            self.grow();
        }
        let prior = self.find_index(&symbol.name).map(|i| match &self.slots[i] {
            Slot::Occupied(sym) => sym.clone(),
            _ => unreachable!(),
        });
        self.insert_no_grow(symbol);
        prior
    }

    /// Remove a symbol, replacing its slot with a tombstone so later probes
    /// do not terminate early.
    pub fn delete(&mut self, name: &str) -> Option<Symbol> {
        let idx = self.find_index(name)?;
        match std::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied(sym) => {
                self.len -= 1;
                Some(sym)
            }
            _ => unreachable!(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// The full symbol table: a global scope plus a stack of nested local
/// scopes. Lookup walks innermost-first, then falls back to globals.
pub struct SymbolTable {
    globals: Scope,
    locals: Vec<Scope>,
    subroutines: Vec<SubroutineDesc>,
    by_name: HashMap<String, SubroutineId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            globals: Scope::new(),
            locals: Vec::new(),
            subroutines: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn push_scope(&mut self) {
        self.locals.push(Scope::new());
    }

    pub fn pop_scope(&mut self) -> Scope {
        self.locals.pop().expect("pop_scope without matching push")
    }

    pub fn is_global_scope(&self) -> bool {
        self.locals.is_empty()
    }

    fn current_mut(&mut self) -> &mut Scope {
        self.locals.last_mut().unwrap_or(&mut self.globals)
    }

    fn current(&self) -> &Scope {
        self.locals.last().unwrap_or(&self.globals)
    }

    /// Define a name in the current (innermost) scope. Returns `Some(prior)`
    /// if the name already existed there — a caller-level redefinition
    /// error, distinguished (predefined vs. user) by `prior.line`.
    pub fn define(&mut self, symbol: Symbol) -> Option<Symbol> {
        self.current_mut().set(symbol)
    }

    /// Define a name directly at global scope regardless of current nesting
    /// (used for top-level `const`/`type`/`var`/subroutine names).
    pub fn define_global(&mut self, symbol: Symbol) -> Option<Symbol> {
        self.globals.set(symbol)
    }

    /// Walk the scope stack innermost-first, then globals.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        for scope in self.locals.iter().rev() {
            if let Some(sym) = scope.find(name) {
                return Some(sym);
            }
        }
        self.globals.find(name)
    }

    pub fn find_in_current_scope(&self, name: &str) -> Option<&Symbol> {
        self.current().find(name)
    }

    // --- subroutines -------------------------------------------------------

    pub fn declare_subroutine(&mut self, name: &str, type_id: TypeId) -> SubroutineId {
        let id = SubroutineId(self.subroutines.len() as u32);
        self.subroutines.push(SubroutineDesc {
            name: name.to_string(),
            type_id,
            defined: false,
            entry: None,
            pending_patches: Vec::new(),
        });
        self.by_name.insert(name.to_ascii_lowercase(), id);
        id
    }

    pub fn subroutine(&self, id: SubroutineId) -> &SubroutineDesc {
        &self.subroutines[id.0 as usize]
    }

    pub fn subroutine_mut(&mut self, id: SubroutineId) -> &mut SubroutineDesc {
        &mut self.subroutines[id.0 as usize]
    }

    pub fn subroutine_id_by_name(&self, name: &str) -> Option<SubroutineId> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// Record a forward call site against a subroutine not yet defined.
    pub fn record_pending_call(&mut self, id: SubroutineId, call_site: u32, kind: pasc_core::PatchKind) {
        self.subroutine_mut(id)
            .pending_patches
            .push(PendingCallPatch { call_site, kind });
    }

    /// All subroutines, for the finalization pass that patches every
    /// pending call once every entry point is known.
    pub fn subroutines(&self) -> &[SubroutineDesc] {
        &self.subroutines
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TY_I32;

    fn sym(name: &str, line: u32) -> Symbol {
        Symbol {
            name: name.to_string(),
            line,
            type_id: TY_I32,
            binding: Binding::Invalid,
        }
    }

    #[test]
    fn define_then_find_round_trips() {
        let mut t = SymbolTable::new();
        t.define(sym("x", 1));
        assert!(t.find("x").is_some());
        assert!(t.find("X").is_some(), "lookup is case-insensitive");
        assert!(t.find("y").is_none());
    }

    #[test]
    fn scoped_symbols_are_not_visible_outside_their_scope() {
        let mut t = SymbolTable::new();
        t.define_global(sym("g", 1));
        t.push_scope();
        t.define(sym("local_only", 2));
        assert!(t.find("local_only").is_some());
        assert!(t.find("g").is_some(), "inner scope still sees globals");
        t.pop_scope();
        assert!(t.find("local_only").is_none());
    }

    #[test]
    fn redefinition_in_same_scope_returns_prior() {
        let mut t = SymbolTable::new();
        assert!(t.define(sym("x", 1)).is_none());
        let prior = t.define(sym("x", 2));
        assert!(prior.is_some());
        assert_eq!(prior.unwrap().line, 1);
    }

    #[test]
    fn inner_scope_shadows_outer_without_conflict() {
        let mut t = SymbolTable::new();
        t.define_global(sym("x", 1));
        t.push_scope();
        assert!(t.define(sym("x", 2)).is_none(), "shadowing is not a redefinition");
        assert_eq!(t.find("x").unwrap().line, 2);
        t.pop_scope();
        assert_eq!(t.find("x").unwrap().line, 1);
    }

    #[test]
    fn grows_past_load_factor_without_losing_entries() {
        let mut t = SymbolTable::new();
        for i in 0..100 {
            t.define(sym(&format!("v{i}"), i));
        }
        for i in 0..100 {
            assert!(t.find(&format!("v{i}")).is_some());
        }
    }

    #[test]
    fn delete_leaves_tombstone_that_does_not_break_later_probes() {
        let mut t = SymbolTable::new();
        t.define(sym("a", 1));
        t.define(sym("b", 2));
        t.current_mut().delete("a");
        assert!(t.find("b").is_some());
        assert!(t.find("a").is_none());
    }

    #[test]
    fn forward_subroutine_records_pending_patches_until_defined() {
        let mut t = SymbolTable::new();
        let id = t.declare_subroutine("f", TY_I32);
        assert!(!t.subroutine(id).defined);
        t.record_pending_call(id, 10, pasc_core::PatchKind::Rel24);
        assert_eq!(t.subroutine(id).pending_patches.len(), 1);
        t.subroutine_mut(id).defined = true;
        t.subroutine_mut(id).entry = Some(42);
        assert_eq!(t.subroutine(id).entry, Some(42));
    }
}
