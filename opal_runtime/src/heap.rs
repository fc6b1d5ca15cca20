//! The refcounted heap.
//!
//! Typed constructors attach a fresh header (refcount 1, type index) to pool
//! allocations; decrements recurse structurally into owned sub-cells when a
//! count reaches zero. Vector element buffers are themselves pool objects
//! with a value-buffer header, so the leak report can account for them.
//!
//! With the `delete_delay` feature, destruction is deferred onto a queue that
//! is drained at program end, and every header carries an allocation sequence
//! number for leak forensics.

use crate::object::{header_of, OObject, OResource, OString, OVector, RefHeader, ResourceType};
use crate::pool::Pool;
use crate::print::{self, PrintPrefs};
use crate::value::Value;
use opal_bytecode::{type_info, BytecodeFile, TypeIdx, TypeInfo, ValueKind, TYPE_ELEM_STRING,
    TYPE_ELEM_VALUEBUF};
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::Arc;

/// Heap state: the pool, the (shared, read-only) program metadata needed to
/// walk object structure, and the delayed-delete queue.
pub struct Heap {
    pool: Pool,
    bcf: Arc<BytecodeFile>,
    delete_delay: Vec<*mut RefHeader>,
    #[cfg(feature = "delete_delay")]
    alloc_seq: u64,
}

impl Heap {
    pub fn new(bcf: Arc<BytecodeFile>) -> Heap {
        Heap {
            pool: Pool::new(),
            bcf,
            delete_delay: Vec::new(),
            #[cfg(feature = "delete_delay")]
            alloc_seq: 0,
        }
    }

    #[inline]
    pub fn bcf(&self) -> &BytecodeFile {
        &self.bcf
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[inline]
    pub fn type_info(&self, t: TypeIdx) -> TypeInfo<'_> {
        type_info(self.bcf.type_table(), t)
    }

    /// Kind of a live heap object.
    ///
    /// # Safety
    ///
    /// `ro` must point at a live object of this heap.
    #[inline]
    pub unsafe fn kind_of(&self, ro: *const RefHeader) -> ValueKind {
        // Safety: caller guarantees a live object; tti is immutable.
        self.type_info(unsafe { (*ro).tti }).kind()
    }

    fn fresh_header(&mut self, tti: TypeIdx) -> RefHeader {
        #[cfg(feature = "delete_delay")]
        {
            self.alloc_seq += 1;
            RefHeader { refc: 1, tti, alloc_seq: self.alloc_seq }
        }
        #[cfg(not(feature = "delete_delay"))]
        RefHeader { refc: 1, tti }
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    pub fn new_string(&mut self, s: &str) -> *mut OString {
        let p = self.alloc_string(s.len());
        // Safety: `alloc_string` returned a writable payload of s.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), OString::data(p) as *mut u8, s.len());
        }
        p
    }

    /// Concatenation without an intermediate buffer.
    pub fn new_string_cat(&mut self, a: &str, b: &str) -> *mut OString {
        let p = self.alloc_string(a.len() + b.len());
        // Safety: payload is a.len()+b.len() writable bytes.
        unsafe {
            let dst = OString::data(p) as *mut u8;
            std::ptr::copy_nonoverlapping(a.as_ptr(), dst, a.len());
            std::ptr::copy_nonoverlapping(b.as_ptr(), dst.add(a.len()), b.len());
        }
        p
    }

    fn alloc_string(&mut self, len: usize) -> *mut OString {
        let size = OString::alloc_size(len);
        let p = self.pool.alloc(size);
        let os: *mut OString = header_of(p);
        let hdr = self.fresh_header(TYPE_ELEM_STRING);
        // Safety: fresh allocation of `size` bytes; payload NUL-terminated
        // for host interop.
        unsafe {
            (*os).hdr = hdr;
            (*os).len = len as i64;
            *(OString::data(os) as *mut u8).add(len) = 0;
        }
        os
    }

    pub fn new_vector(&mut self, cap: i64, tti: TypeIdx) -> *mut OVector {
        debug_assert_eq!(self.type_info(tti).kind(), ValueKind::Vector);
        let buf = if cap > 0 { self.alloc_cells(cap as usize) } else { std::ptr::null_mut() };
        let p = self.pool.alloc_small(std::mem::size_of::<OVector>());
        let v: *mut OVector = header_of(p);
        let hdr = self.fresh_header(tti);
        // Safety: fresh allocation.
        unsafe {
            (*v).hdr = hdr;
            (*v).len = 0;
            (*v).cap = cap;
            (*v).buf = buf;
        }
        v
    }

    /// Append, growing the element buffer by doubling. Takes ownership of
    /// `val`'s reference (no inc).
    ///
    /// # Safety
    ///
    /// `v` must be a live vector of this heap.
    pub unsafe fn vector_push(&mut self, v: *mut OVector, val: Value) {
        // Safety: caller guarantees a live vector.
        unsafe {
            if (*v).len == (*v).cap {
                let ncap = if (*v).cap == 0 { 4 } else { (*v).cap * 2 };
                let nbuf = self.alloc_cells(ncap as usize);
                if !(*v).buf.is_null() {
                    std::ptr::copy_nonoverlapping((*v).buf, nbuf, (*v).len as usize);
                    self.dealloc_cells((*v).buf, (*v).cap as usize);
                }
                (*v).buf = nbuf;
                (*v).cap = ncap;
            }
            *(*v).buf.offset((*v).len as isize) = val;
            (*v).len += 1;
        }
    }

    /// New user object with all fields nil.
    pub fn new_object(&mut self, tti: TypeIdx) -> *mut OObject {
        let ti = self.type_info(tti);
        debug_assert!(ti.kind().is_udt());
        let len = ti.len() as usize;
        let p = self.pool.alloc(OObject::alloc_size(len));
        let o: *mut OObject = header_of(p);
        let hdr = self.fresh_header(tti);
        // Safety: fresh allocation with room for `len` field cells.
        unsafe {
            (*o).hdr = hdr;
            for i in 0..len {
                OObject::set(o, i, Value::nil());
            }
        }
        o
    }

    /// Initialise an object's fields from a slice, optionally taking new
    /// references.
    ///
    /// # Safety
    ///
    /// `o` must be a live object whose arity equals `src.len()`.
    pub unsafe fn object_init(&mut self, o: *mut OObject, src: &[Value], inc: bool) {
        let tti = unsafe { (*o).hdr.tti };
        let bcf = self.bcf.clone();
        let ti = type_info(bcf.type_table(), tti);
        debug_assert_eq!(ti.len() as usize, src.len());
        for (i, &v) in src.iter().enumerate() {
            if inc {
                let k = type_info(bcf.type_table(), ti.elem_type(i)).kind();
                self.inc_value(v, k);
            }
            // Safety: arity checked above.
            unsafe { OObject::set(o, i, v) };
        }
    }

    pub fn new_resource(&mut self, val: *mut (), rty: &'static ResourceType, tti: TypeIdx) -> *mut OResource {
        let p = self.pool.alloc_small(std::mem::size_of::<OResource>());
        let r: *mut OResource = header_of(p);
        let hdr = self.fresh_header(tti);
        // Safety: fresh allocation.
        unsafe {
            (*r).hdr = hdr;
            (*r).val = val;
            (*r).rty = rty;
        }
        r
    }

    /// Value-buffer allocation: a header followed by `n` cells. Used for
    /// vector element storage.
    fn alloc_cells(&mut self, n: usize) -> *mut Value {
        let size = std::mem::size_of::<RefHeader>() + n * std::mem::size_of::<Value>();
        let p = self.pool.alloc(size);
        let hdr: *mut RefHeader = header_of(p);
        let h = self.fresh_header(TYPE_ELEM_VALUEBUF);
        // Safety: fresh allocation.
        unsafe {
            *hdr = h;
            hdr.add(1) as *mut Value
        }
    }

    /// # Safety
    ///
    /// `cells` must have come from `alloc_cells(n)`.
    unsafe fn dealloc_cells(&mut self, cells: *mut Value, n: usize) {
        let size = std::mem::size_of::<RefHeader>() + n * std::mem::size_of::<Value>();
        // Safety: header sits directly before the cells.
        unsafe {
            let hdr = (cells as *mut RefHeader).sub(1);
            self.pool.dealloc(NonNull::new_unchecked(hdr as *mut u8), size);
        }
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Take a reference if the statically typed cell holds one.
    #[inline]
    pub fn inc_value(&self, v: Value, kind: ValueKind) {
        if kind.is_ref_nil() {
            let p = v.rptr_nil();
            if !p.is_null() {
                // Safety: non-null refs in typed cells are live objects.
                unsafe { RefHeader::inc(p) };
            }
        }
    }

    /// Drop one reference; destroys at zero.
    ///
    /// # Safety
    ///
    /// `ro` must point at a live object of this heap.
    pub unsafe fn dec(&mut self, ro: *mut RefHeader) {
        // Safety: caller guarantees a live object.
        unsafe {
            (*ro).refc -= 1;
            debug_assert!((*ro).refc >= 0, "refcount underflow");
            if (*ro).refc == 0 {
                #[cfg(feature = "delete_delay")]
                {
                    self.delete_delay.push(ro);
                }
                #[cfg(not(feature = "delete_delay"))]
                self.destroy(ro);
            }
        }
    }

    /// Typed decrement: drops the reference a statically typed cell holds,
    /// tolerating nil.
    pub fn dec_value(&mut self, v: Value, kind: ValueKind) {
        if kind.is_ref_nil() {
            let p = v.rptr_nil();
            if !p.is_null() {
                // Safety: non-null refs in typed cells are live objects.
                unsafe { self.dec(p) };
            }
        }
    }

    /// Type-leniency decrement: tolerates nil and (in debug builds, where the
    /// tag is present) non-reference cells. Used for keepvar and owned-local
    /// slots, which the compiler guarantees are reference-typed.
    pub fn dec_ref_nil(&mut self, v: Value) {
        #[cfg(debug_assertions)]
        if !v.kind().is_ref_nil() {
            return;
        }
        let p = v.rptr_nil();
        if !p.is_null() {
            // Safety: slot discipline guarantees a live reference.
            unsafe { self.dec(p) };
        }
    }

    /// Recursive destruction. Runs immediately at refcount zero, or from the
    /// delayed-delete drain.
    ///
    /// # Safety
    ///
    /// `ro` must be an object whose refcount has reached zero.
    unsafe fn destroy(&mut self, ro: *mut RefHeader) {
        let bcf = self.bcf.clone();
        // Safety: object is still materialized, only logically dead.
        let tti = unsafe { (*ro).tti };
        let ti = type_info(bcf.type_table(), tti);
        match ti.kind() {
            ValueKind::String => {
                // Safety: strings are OString allocations.
                unsafe {
                    let s = ro as *mut OString;
                    let size = OString::alloc_size((*s).len as usize);
                    self.pool.dealloc(NonNull::new_unchecked(ro as *mut u8), size);
                }
            }
            ValueKind::Vector | ValueKind::UntypedVector => {
                // Safety: vectors are OVector allocations.
                unsafe {
                    let v = ro as *mut OVector;
                    let elem_kind = type_info(bcf.type_table(), ti.subtype()).kind();
                    if elem_kind.is_ref_nil() {
                        let mut elems: SmallVec<[Value; 8]> = SmallVec::new();
                        for i in 0..(*v).len {
                            elems.push(OVector::at(v, i));
                        }
                        for e in elems {
                            self.dec_value(e, elem_kind);
                        }
                    }
                    if !(*v).buf.is_null() {
                        self.dealloc_cells((*v).buf, (*v).cap as usize);
                    }
                    self.pool.dealloc(
                        NonNull::new_unchecked(ro as *mut u8),
                        std::mem::size_of::<OVector>(),
                    );
                }
            }
            ValueKind::Class => {
                // Safety: classes are OObject allocations.
                unsafe {
                    let o = ro as *mut OObject;
                    let len = ti.len() as usize;
                    let mut fields: SmallVec<[(Value, ValueKind); 8]> = SmallVec::new();
                    for i in 0..len {
                        let k = type_info(bcf.type_table(), ti.elem_type(i)).kind();
                        if k.is_ref_nil() {
                            fields.push((OObject::at(o, i), k));
                        }
                    }
                    for (v, k) in fields {
                        self.dec_value(v, k);
                    }
                    self.pool.dealloc(
                        NonNull::new_unchecked(ro as *mut u8),
                        OObject::alloc_size(len),
                    );
                }
            }
            ValueKind::Resource => {
                // Safety: resources are OResource allocations.
                unsafe {
                    let r = ro as *mut OResource;
                    ((*r).rty.delete)((*r).val);
                    self.pool.dealloc(
                        NonNull::new_unchecked(ro as *mut u8),
                        std::mem::size_of::<OResource>(),
                    );
                }
            }
            k => debug_assert!(false, "destroy on non-heap kind {:?}", k),
        }
    }

    /// Drain the delayed-delete queue. Called once at program end.
    pub fn drain_delete_delay(&mut self) {
        while let Some(ro) = self.delete_delay.pop() {
            // Safety: queued objects reached refcount zero.
            unsafe { self.destroy(ro) };
        }
    }

    // =========================================================================
    // Leak report
    // =========================================================================

    /// Enumerate and log every unreleased allocation. Returns the leak count
    /// (value buffers excluded; they are owned by their vectors).
    pub fn dump_leaks(&self) -> usize {
        let mut leaks: Vec<*mut RefHeader> = self
            .pool
            .find_leaks()
            .into_iter()
            .map(|p| p.as_ptr() as *mut RefHeader)
            .collect();
        // Safety: every pool allocation starts with a RefHeader.
        leaks.retain(|&ro| unsafe {
            !matches!(self.kind_of(ro), ValueKind::ValueBuf | ValueKind::StackFrameBuf)
        });
        if leaks.is_empty() {
            return 0;
        }
        log::error!(
            "LEAKS FOUND (this indicates cycles in your object graph, or a bug in Opal)"
        );
        leaks.sort_by(|&a, &b| {
            // Safety: as above.
            let (ra, ta) = unsafe { ((*a).refc, (*a).tti.0) };
            let (rb, tb) = unsafe { ((*b).refc, (*b).tti.0) };
            rb.cmp(&ra).then(tb.cmp(&ta))
        });
        let prefs = PrintPrefs::leak();
        let mut sd = String::new();
        for &ro in &leaks {
            print::cycle_str(&mut sd, ro as usize);
            sd.push_str(" = ");
            print::ref_to_string(self, &mut sd, ro, &prefs);
            // Safety: as above.
            unsafe {
                sd.push_str(&format!(" ({})", (*ro).refc));
                #[cfg(feature = "delete_delay")]
                sd.push_str(&format!(" seq {}", (*ro).alloc_seq));
            }
            sd.push('\n');
        }
        log::error!("{}", sd);
        self.pool.log_stats();
        leaks.len()
    }
}
