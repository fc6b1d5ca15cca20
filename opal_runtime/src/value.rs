//! The tagged word-size cell.
//!
//! A `Value` is one machine word of payload: an integer, a float, a heap
//! reference or a code pointer. In debug builds every cell also carries its
//! [`ValueKind`] tag and accessors assert against it; in release builds the
//! tag is elided entirely and the cell is exactly one word, which is the
//! layout the transpiled native code compiles against.

use crate::object::RefHeader;
use opal_bytecode::ValueKind;

/// Untagged payload. `#[repr(C)]` so transpiled code can declare a matching
/// union.
#[derive(Clone, Copy)]
#[repr(C)]
pub union ValueRepr {
    pub ival: i64,
    pub fval: f64,
    pub rptr: *mut RefHeader,
    pub fptr: *const (),
}

/// One operand-stack / variable cell. Copy semantics; refcounts are managed
/// explicitly by the opcode helpers, never by clone/drop.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Value {
    repr: ValueRepr,
    #[cfg(debug_assertions)]
    kind: ValueKind,
}

impl Value {
    #[inline(always)]
    const fn raw(repr: ValueRepr, kind: ValueKind) -> Value {
        #[cfg(not(debug_assertions))]
        let _ = kind;
        Value {
            repr,
            #[cfg(debug_assertions)]
            kind,
        }
    }

    /// The nil cell: a null reference.
    #[inline(always)]
    pub const fn nil() -> Value {
        Value::raw(ValueRepr { ival: 0 }, ValueKind::Nil)
    }

    #[inline(always)]
    pub const fn int(v: i64) -> Value {
        Value::raw(ValueRepr { ival: v }, ValueKind::Int)
    }

    #[inline(always)]
    pub const fn float(v: f64) -> Value {
        Value::raw(ValueRepr { fval: v }, ValueKind::Float)
    }

    /// A heap reference. `kind` is the object's static ref kind; it is only
    /// materialized in debug builds.
    #[inline(always)]
    pub fn from_ref(ptr: *mut RefHeader, kind: ValueKind) -> Value {
        debug_assert!(kind.is_ref());
        Value::raw(ValueRepr { rptr: ptr }, kind)
    }

    /// A code pointer (function value).
    #[inline(always)]
    pub fn from_fun(ptr: *const ()) -> Value {
        Value::raw(ValueRepr { fptr: ptr }, ValueKind::Function)
    }

    #[inline(always)]
    pub fn ival(self) -> i64 {
        #[cfg(debug_assertions)]
        debug_assert!(self.kind == ValueKind::Int, "ival() on {:?}", self.kind);
        // Safety: all variants are one word; the static type plan (checked by
        // the tag in debug builds) guarantees this cell holds an int.
        unsafe { self.repr.ival }
    }

    #[inline(always)]
    pub fn fval(self) -> f64 {
        #[cfg(debug_assertions)]
        debug_assert!(self.kind == ValueKind::Float, "fval() on {:?}", self.kind);
        // Safety: as `ival`.
        unsafe { self.repr.fval }
    }

    /// The reference payload. Must be a non-nil ref cell.
    #[inline(always)]
    pub fn rptr(self) -> *mut RefHeader {
        #[cfg(debug_assertions)]
        debug_assert!(self.kind.is_ref(), "rptr() on {:?}", self.kind);
        // Safety: as `ival`.
        unsafe { self.repr.rptr }
    }

    /// The reference payload of a ref-or-nil cell; null for nil.
    #[inline(always)]
    pub fn rptr_nil(self) -> *mut RefHeader {
        #[cfg(debug_assertions)]
        debug_assert!(self.kind.is_ref_nil(), "rptr_nil() on {:?}", self.kind);
        // Safety: nil cells are constructed with a zeroed word.
        unsafe { self.repr.rptr }
    }

    #[inline(always)]
    pub fn fptr(self) -> *const () {
        #[cfg(debug_assertions)]
        debug_assert!(self.kind == ValueKind::Function, "fptr() on {:?}", self.kind);
        // Safety: as `ival`.
        unsafe { self.repr.fptr }
    }

    /// Truthiness: a zeroed word (int 0 or nil) is false.
    #[inline(always)]
    pub fn is_false(self) -> bool {
        // Safety: reads the word as an int regardless of variant.
        unsafe { self.repr.ival == 0 }
    }

    /// The raw word, for hex dumps of cells of unknown type.
    #[inline(always)]
    pub fn any_bits(self) -> u64 {
        // Safety: as `is_false`.
        unsafe { self.repr.ival as u64 }
    }

    /// The debug-build tag.
    #[cfg(debug_assertions)]
    #[inline(always)]
    pub fn kind(self) -> ValueKind {
        self.kind
    }
}

impl Default for Value {
    #[inline]
    fn default() -> Value {
        Value::nil()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(debug_assertions)]
        {
            match self.kind {
                ValueKind::Int => write!(f, "Value::int({})", self.ival()),
                ValueKind::Float => write!(f, "Value::float({})", self.fval()),
                ValueKind::Nil => write!(f, "Value::nil"),
                k => write!(f, "Value::{:?}({:#x})", k, self.any_bits()),
            }
        }
        #[cfg(not(debug_assertions))]
        write!(f, "Value({:#x})", self.any_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(Value::int(42).ival(), 42);
        assert_eq!(Value::int(-1).ival(), -1);
        assert!((Value::float(2.5).fval() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_nil_is_false() {
        assert!(Value::nil().is_false());
        assert!(Value::int(0).is_false());
        assert!(!Value::int(1).is_false());
        assert!(Value::nil().rptr_nil().is_null());
    }

    #[test]
    fn test_release_layout() {
        // The transpiled C Value is one word (plus the tag in debug builds).
        #[cfg(not(debug_assertions))]
        assert_eq!(std::mem::size_of::<Value>(), 8);
        assert_eq!(std::mem::size_of::<ValueRepr>(), 8);
    }
}
