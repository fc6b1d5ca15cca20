//! Heap object layouts.
//!
//! Every heap object begins with a [`RefHeader`]: the refcount and the
//! object's type-table index. The type tag never changes after allocation.
//! Strings and user objects store their payload inline after the header;
//! vectors own a separately allocated element buffer so they can grow.
//!
//! These are raw `#[repr(C)]` layouts addressed through pointers; all
//! lifetime management goes through [`crate::heap::Heap`].

use crate::value::Value;
use opal_bytecode::TypeIdx;
use std::ptr::NonNull;

/// Common object header. Starts every heap allocation.
#[repr(C)]
pub struct RefHeader {
    /// Reference count; ≥ 1 while any owner holds the reference.
    pub refc: i32,
    /// Type-table index; immutable after allocation.
    pub tti: TypeIdx,
    /// Allocation sequence number, for attributing leaks to their origin.
    #[cfg(feature = "delete_delay")]
    pub alloc_seq: u64,
}

impl RefHeader {
    /// Bump the refcount of a live object.
    ///
    /// # Safety
    ///
    /// `ro` must point at a live heap object owned by this VM's pool.
    #[inline(always)]
    pub unsafe fn inc(ro: *mut RefHeader) {
        // Safety: caller guarantees a live object.
        unsafe { (*ro).refc += 1 };
    }
}

/// Immutable byte buffer. `len` bytes of UTF-8 follow the struct inline.
#[repr(C)]
pub struct OString {
    pub hdr: RefHeader,
    pub len: i64,
}

impl OString {
    /// Allocation size for a string of `len` bytes (plus a NUL for host
    /// interop, as the transpiled C side expects).
    #[inline]
    pub fn alloc_size(len: usize) -> usize {
        std::mem::size_of::<OString>() + len + 1
    }

    /// # Safety
    ///
    /// `this` must point at a live `OString`.
    #[inline]
    pub unsafe fn data(this: *const OString) -> *const u8 {
        // Safety: payload starts directly after the header struct.
        unsafe { this.add(1) as *const u8 }
    }

    /// # Safety
    ///
    /// As [`Self::data`]; the payload was written as valid UTF-8.
    #[inline]
    pub unsafe fn as_str<'a>(this: *const OString) -> &'a str {
        // Safety: constructors only ever copy in valid UTF-8.
        unsafe {
            let bytes = std::slice::from_raw_parts(Self::data(this), (*this).len as usize);
            std::str::from_utf8_unchecked(bytes)
        }
    }
}

/// Growable ordered sequence of cells. Element type comes from the vector's
/// type-table entry.
#[repr(C)]
pub struct OVector {
    pub hdr: RefHeader,
    pub len: i64,
    pub cap: i64,
    pub buf: *mut Value,
}

impl OVector {
    /// # Safety
    ///
    /// `this` live, `i` in `0..len`.
    #[inline]
    pub unsafe fn at(this: *const OVector, i: i64) -> Value {
        debug_assert!(i >= 0 && i < unsafe { (*this).len });
        // Safety: caller guarantees bounds.
        unsafe { *(*this).buf.offset(i as isize) }
    }

    /// # Safety
    ///
    /// `this` live, `i` in `0..len`. Does not touch refcounts.
    #[inline]
    pub unsafe fn set(this: *mut OVector, i: i64, v: Value) {
        debug_assert!(i >= 0 && i < unsafe { (*this).len });
        // Safety: caller guarantees bounds.
        unsafe { *(*this).buf.offset(i as isize) = v };
    }
}

/// Fixed-arity tuple of cells with a class type. Field cells follow the
/// struct inline; arity comes from the type entry.
#[repr(C)]
pub struct OObject {
    pub hdr: RefHeader,
}

impl OObject {
    #[inline]
    pub fn alloc_size(len: usize) -> usize {
        std::mem::size_of::<OObject>() + len * std::mem::size_of::<Value>()
    }

    /// # Safety
    ///
    /// `this` must point at a live `OObject`.
    #[inline]
    pub unsafe fn fields(this: *mut OObject) -> *mut Value {
        // Safety: fields start directly after the header struct.
        unsafe { this.add(1) as *mut Value }
    }

    /// # Safety
    ///
    /// `this` live, `i` within the class arity.
    #[inline]
    pub unsafe fn at(this: *mut OObject, i: usize) -> Value {
        // Safety: caller guarantees bounds.
        unsafe { *Self::fields(this).add(i) }
    }

    /// # Safety
    ///
    /// As [`Self::at`]. Does not touch refcounts.
    #[inline]
    pub unsafe fn set(this: *mut OObject, i: usize, v: Value) {
        // Safety: caller guarantees bounds.
        unsafe { *Self::fields(this).add(i) = v };
    }
}

/// Descriptor for a host-owned resource kind.
pub struct ResourceType {
    pub name: &'static str,
    /// Destructor, run when the last reference drops.
    pub delete: unsafe fn(*mut ()),
}

/// Opaque host-owned pointer plus its descriptor.
#[repr(C)]
pub struct OResource {
    pub hdr: RefHeader,
    pub val: *mut (),
    pub rty: &'static ResourceType,
}

/// Typed pointer wrapper for a freshly allocated header region.
#[inline]
pub(crate) fn header_of<T>(p: NonNull<u8>) -> *mut T {
    p.as_ptr() as *mut T
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_first_field() {
        assert_eq!(std::mem::offset_of!(OString, hdr), 0);
        assert_eq!(std::mem::offset_of!(OVector, hdr), 0);
        assert_eq!(std::mem::offset_of!(OObject, hdr), 0);
        assert_eq!(std::mem::offset_of!(OResource, hdr), 0);
    }

    #[test]
    fn test_alloc_sizes() {
        assert_eq!(
            OString::alloc_size(5),
            std::mem::size_of::<OString>() + 6
        );
        assert_eq!(
            OObject::alloc_size(2),
            std::mem::size_of::<OObject>() + 2 * std::mem::size_of::<Value>()
        );
    }
}
