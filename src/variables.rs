//! The variable store.
//!
//! Named bindings live in a slab of slots with a hash index keyed by the
//! lower-cased spelling (names themselves stay case-sensitive: `count%`
//! and `Count%` are distinct entries that happen to share a bucket key
//! prefix). The 27 static integers `A%..Z%` and `@%` bypass the slab.
//! Creation is lazy on first assignment; reading an unknown name raises
//! `VarMiss`.

use std::collections::HashMap;

use crate::errors::{BResult, BasicError, ErrorKind, raise};
use crate::values::{ArrayData, ArrayShape, ElementKind};

/// Index of `@%` in the static table.
pub const AT_PERCENT: usize = 26;

/// Parameter passing mode of a PROC/FN parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    Value,
    Return,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub kind: ElementKind,
    pub mode: ParamMode,
}

/// A PROC or FN definition: where its DEF line lives and what it takes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcDef {
    pub line_off: usize,
    /// Payload position just past the name (and parameter list).
    pub body_pos: usize,
    pub line_no: u16,
    pub params: Vec<ParamDef>,
    /// Set when the definition lives in an installed library.
    pub library: Option<usize>,
}

/// An installed library: a tokenised line-store image carved off the top
/// of the workspace, below the old HIMEM.
#[derive(Debug, Clone, PartialEq)]
pub struct Library {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayVar {
    pub kind: ElementKind,
    pub shape: ArrayShape,
    pub data: ArrayData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int32(i32),
    Float(f64),
    Str(Vec<u8>),
    Int64(i64),
    Uint8(u8),
    Array(ArrayVar),
    Proc(ProcDef),
    Fn(ProcDef),
}

impl VarValue {
    pub fn zero_of(kind: ElementKind) -> VarValue {
        match kind {
            ElementKind::Int32 => VarValue::Int32(0),
            ElementKind::Float => VarValue::Float(0.0),
            ElementKind::Str => VarValue::Str(Vec::new()),
            ElementKind::Int64 => VarValue::Int64(0),
            ElementKind::Uint8 => VarValue::Uint8(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VarSlot {
    pub name: String,
    pub value: VarValue,
}

/// Scalar kind encoded by a name's suffix.
pub fn kind_of_name(name: &str) -> ElementKind {
    if name.ends_with("%%") {
        ElementKind::Int64
    } else if name.ends_with('%') {
        ElementKind::Int32
    } else if name.ends_with('&') {
        ElementKind::Uint8
    } else if name.ends_with('$') {
        ElementKind::Str
    } else {
        ElementKind::Float
    }
}

/// Whether a name is one of the 27 static integers.
pub fn static_index(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    if bytes.len() == 2 && bytes[1] == b'%' {
        match bytes[0] {
            b'A'..=b'Z' => Some((bytes[0] - b'A') as usize),
            b'@' => Some(AT_PERCENT),
            _ => None,
        }
    } else {
        None
    }
}

pub struct VarStore {
    slots: Vec<VarSlot>,
    /// Buckets keyed by the lower-cased spelling; entries within a bucket
    /// are matched by exact name.
    index: HashMap<String, Vec<usize>>,
    pub statics: [i32; 27],
    libraries: Vec<Library>,
}

/// Default `@%`: general format, 9 significant digits, width 10.
pub const DEFAULT_AT: i32 = 0x0000_090A;

impl VarStore {
    pub fn new() -> Self {
        let mut statics = [0; 27];
        statics[AT_PERCENT] = DEFAULT_AT;
        VarStore { slots: Vec::new(), index: HashMap::new(), statics, libraries: Vec::new() }
    }

    /// CLEAR: drop all dynamic variables. Statics and libraries survive.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    pub fn clear_libraries(&mut self) {
        self.libraries.clear();
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index
            .get(&Self::key(name))?
            .iter()
            .copied()
            .find(|&slot| self.slots[slot].name == name)
    }

    pub fn slot(&self, id: usize) -> BResult<&VarSlot> {
        self.slots.get(id).ok_or_else(|| BasicError::broken("variables: bad slot id"))
    }

    pub fn slot_mut(&mut self, id: usize) -> BResult<&mut VarSlot> {
        self.slots.get_mut(id).ok_or_else(|| BasicError::broken("variables: bad slot id"))
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Find or create the slot for `name`, zero-initialised to its kind.
    pub fn define(&mut self, name: &str) -> usize {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let id = self.slots.len();
        self.slots.push(VarSlot {
            name: name.to_string(),
            value: VarValue::zero_of(kind_of_name(name)),
        });
        self.index.entry(Self::key(name)).or_default().push(id);
        id
    }

    /// Lookup for a read; raises `VarMiss` when the name is unknown.
    pub fn read(&self, name: &str) -> BResult<&VarValue> {
        match self.lookup(name) {
            Some(id) => Ok(&self.slots[id].value),
            None => Err(BasicError::with_text(ErrorKind::VarMiss, name)),
        }
    }

    /// Install an array variable. Redimensioning an existing array is
    /// refused as the dialect requires.
    pub fn dim_array(
        &mut self,
        name: &str,
        bounds: Vec<usize>,
    ) -> BResult<usize> {
        let kind = kind_of_name(name.trim_end_matches('(')) ;
        let id = self.define(name);
        if let VarValue::Array(_) = self.slots[id].value {
            return raise(ErrorKind::BadDim);
        }
        let shape = ArrayShape::new(bounds);
        let count = shape.count();
        self.slots[id].value = VarValue::Array(ArrayVar {
            kind,
            shape,
            data: ArrayData::zeroed(kind, count),
        });
        Ok(id)
    }

    pub fn array(&self, id: usize) -> BResult<&ArrayVar> {
        match &self.slot(id)?.value {
            VarValue::Array(a) => Ok(a),
            _ => Err(BasicError::with_text(
                ErrorKind::VarArray,
                self.slot(id)?.name.clone(),
            )),
        }
    }

    pub fn array_mut(&mut self, id: usize) -> BResult<&mut ArrayVar> {
        let name = self.slot(id)?.name.clone();
        match &mut self.slots[id].value {
            VarValue::Array(a) => Ok(a),
            _ => Err(BasicError::with_text(ErrorKind::VarArray, name)),
        }
    }

    pub fn add_library(&mut self, lib: Library) -> usize {
        self.libraries.push(lib);
        self.libraries.len() - 1
    }

    pub fn libraries(&self) -> &[Library] {
        &self.libraries
    }

    /// All slots, for LVAR listings.
    pub fn slots(&self) -> &[VarSlot] {
        &self.slots
    }
}

impl Default for VarStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_selects_the_kind() {
        assert_eq!(kind_of_name("count%"), ElementKind::Int32);
        assert_eq!(kind_of_name("big%%"), ElementKind::Int64);
        assert_eq!(kind_of_name("flag&"), ElementKind::Uint8);
        assert_eq!(kind_of_name("name$"), ElementKind::Str);
        assert_eq!(kind_of_name("rate"), ElementKind::Float);
    }

    #[test]
    fn statics_are_recognised() {
        assert_eq!(static_index("A%"), Some(0));
        assert_eq!(static_index("Z%"), Some(25));
        assert_eq!(static_index("@%"), Some(AT_PERCENT));
        assert_eq!(static_index("a%"), None);
        assert_eq!(static_index("AB%"), None);
    }

    #[test]
    fn read_of_unknown_variable_raises_varmiss() {
        let store = VarStore::new();
        assert_eq!(store.read("missing").unwrap_err().kind, ErrorKind::VarMiss);
    }

    #[test]
    fn define_is_lazy_and_zeroed() {
        let mut store = VarStore::new();
        let id = store.define("total");
        assert_eq!(store.slot(id).unwrap().value, VarValue::Float(0.0));
        assert_eq!(store.define("total"), id);
        assert_eq!(store.slot_count(), 1);
    }

    #[test]
    fn names_are_case_sensitive_within_a_bucket() {
        let mut store = VarStore::new();
        let a = store.define("Total");
        let b = store.define("total");
        assert_ne!(a, b);
        assert_eq!(store.lookup("Total"), Some(a));
        assert_eq!(store.lookup("total"), Some(b));
    }

    #[test]
    fn arrays_cannot_be_redimensioned() {
        let mut store = VarStore::new();
        store.dim_array("a(", vec![3]).unwrap();
        assert_eq!(store.dim_array("a(", vec![5]).unwrap_err().kind, ErrorKind::BadDim);
    }

    #[test]
    fn clear_keeps_statics() {
        let mut store = VarStore::new();
        store.statics[0] = 42;
        store.define("x");
        store.clear();
        assert_eq!(store.statics[0], 42);
        assert_eq!(store.slot_count(), 0);
        assert_eq!(store.statics[AT_PERCENT], DEFAULT_AT);
    }
}
