//! Value stringification for program output, error dumps and the leak
//! report.
//!
//! The walker is cycle-safe: each heap object is marked on first visit and
//! revisits print a short tag instead of recursing (mark-and-skip, not a
//! traversal budget).

use crate::heap::Heap;
use crate::object::{OObject, OResource, OString, OVector, RefHeader};
use crate::value::Value;
use opal_bytecode::{TypeInfo, ValueKind};
use rustc_hash::FxHashSet;
use std::fmt::Write;

/// Formatting preferences.
#[derive(Debug, Clone, Copy)]
pub struct PrintPrefs {
    /// Max nesting depth; negative is unlimited.
    pub depth: i32,
    /// Output budget in bytes; the walker stops descending once exceeded.
    pub budget: usize,
    /// Quote and escape strings.
    pub quoted: bool,
    /// Float decimals; negative prints the shortest representation.
    pub decimals: i32,
}

impl PrintPrefs {
    /// Program output: unquoted, unbounded depth.
    pub fn program() -> PrintPrefs {
        PrintPrefs { depth: -1, budget: 100_000, quoted: false, decimals: -1 }
    }

    /// Error/trace dumps: quoted, shallow.
    pub fn debug() -> PrintPrefs {
        PrintPrefs { depth: 2, budget: 10_000, quoted: true, decimals: -1 }
    }

    /// Leak report: quoted, cycle tags matter more than depth.
    pub fn leak() -> PrintPrefs {
        PrintPrefs { depth: 3, budget: 10_000, quoted: true, decimals: -1 }
    }
}

/// Short per-object tag used when a cycle is cut.
pub fn cycle_str(sd: &mut String, addr: usize) {
    let _ = write!(sd, "_{:x}", (addr >> 4) & 0xffff);
}

/// Stringify a typed cell.
pub fn value_to_string(heap: &Heap, sd: &mut String, v: Value, ti: TypeInfo<'_>, prefs: &PrintPrefs) {
    let mut seen = FxHashSet::default();
    value_str(heap, sd, v, ti, prefs, prefs.depth, &mut seen);
}

/// Stringify a heap object from its header.
pub fn ref_to_string(heap: &Heap, sd: &mut String, ro: *const RefHeader, prefs: &PrintPrefs) {
    let mut seen = FxHashSet::default();
    ref_str(heap, sd, ro, prefs, prefs.depth, &mut seen);
}

fn value_str(
    heap: &Heap,
    sd: &mut String,
    v: Value,
    ti: TypeInfo<'_>,
    prefs: &PrintPrefs,
    depth: i32,
    seen: &mut FxHashSet<usize>,
) {
    match ti.kind() {
        ValueKind::Int => {
            let enumidx = ti.enumidx();
            if enumidx >= 0 && enum_name(heap, sd, v.ival(), enumidx as usize) {
                return;
            }
            let _ = write!(sd, "{}", v.ival());
        }
        ValueKind::Float => float_str(sd, v.fval(), prefs),
        ValueKind::Function => sd.push_str("<function>"),
        ValueKind::Nil => {
            let p = v.rptr_nil();
            if p.is_null() {
                sd.push_str("nil");
            } else {
                let sub = heap.type_info(ti.subtype());
                value_str(heap, sd, v, sub, prefs, depth, seen);
            }
        }
        k if k.is_ref() => {
            let p = v.rptr_nil();
            if p.is_null() {
                sd.push_str("nil");
            } else {
                ref_str(heap, sd, p, prefs, depth, seen);
            }
        }
        k => sd.push_str(k.base_name()),
    }
}

fn ref_str(
    heap: &Heap,
    sd: &mut String,
    ro: *const RefHeader,
    prefs: &PrintPrefs,
    depth: i32,
    seen: &mut FxHashSet<usize>,
) {
    if sd.len() > prefs.budget {
        sd.push_str("....");
        return;
    }
    if !seen.insert(ro as usize) {
        // Already on this walk: cut the cycle.
        cycle_str(sd, ro as usize);
        return;
    }
    // Safety: callers only hand live objects to the printer; the pool probe
    // guards the error-dump path.
    let ti = unsafe { heap.type_info((*ro).tti) };
    match ti.kind() {
        ValueKind::String => {
            // Safety: kind-checked above.
            let s = unsafe { OString::as_str(ro as *const OString) };
            if prefs.quoted {
                sd.push('"');
                for c in s.chars().take(256) {
                    match c {
                        '"' => sd.push_str("\\\""),
                        '\\' => sd.push_str("\\\\"),
                        '\n' => sd.push_str("\\n"),
                        '\t' => sd.push_str("\\t"),
                        c => sd.push(c),
                    }
                }
                sd.push('"');
            } else {
                sd.push_str(s);
            }
        }
        ValueKind::Vector | ValueKind::UntypedVector => {
            if depth == 0 {
                sd.push_str("[..]");
            } else {
                let elem_ti = heap.type_info(ti.subtype());
                sd.push('[');
                // Safety: kind-checked above.
                let v = ro as *const OVector;
                let len = unsafe { (*v).len };
                for i in 0..len {
                    if i > 0 {
                        sd.push_str(", ");
                    }
                    if sd.len() > prefs.budget {
                        sd.push_str("....");
                        break;
                    }
                    // Safety: i < len.
                    let e = unsafe { OVector::at(v, i) };
                    value_str(heap, sd, e, elem_ti, prefs, depth - 1, seen);
                }
                sd.push(']');
            }
        }
        ValueKind::Class => {
            let name = heap.bcf().udt_name(ti.structidx() as usize);
            sd.push_str(name);
            if depth == 0 {
                sd.push_str("{..}");
            } else {
                sd.push('{');
                for i in 0..ti.len() {
                    if i > 0 {
                        sd.push_str(", ");
                    }
                    if sd.len() > prefs.budget {
                        sd.push_str("....");
                        break;
                    }
                    let fti = heap.type_info(ti.elem_type(i as usize));
                    // Safety: i < arity.
                    let f = unsafe { OObject::at(ro as *const OObject as *mut OObject, i as usize) };
                    value_str(heap, sd, f, fti, prefs, depth - 1, seen);
                }
                sd.push('}');
            }
        }
        ValueKind::Resource => {
            // Safety: kind-checked above.
            let name = unsafe { (*(ro as *const OResource)).rty.name };
            let _ = write!(sd, "<resource:{}>", name);
        }
        k => sd.push_str(k.base_name()),
    }
    seen.remove(&(ro as usize));
}

fn float_str(sd: &mut String, f: f64, prefs: &PrintPrefs) {
    if prefs.decimals >= 0 {
        let _ = write!(sd, "{:.*}", prefs.decimals as usize, f);
    } else {
        let start = sd.len();
        let _ = write!(sd, "{}", f);
        // Keep float output distinguishable from ints (NaN/inf excepted).
        if !sd[start..].contains(['.', 'e', 'N', 'i']) {
            sd.push_str(".0");
        }
    }
}

/// Append the symbolic name(s) of an enum value; false when the value does
/// not map cleanly (unknown bits or no matching member).
fn enum_name(heap: &Heap, sd: &mut String, val: i64, enumidx: usize) -> bool {
    let bcf = heap.bcf();
    let lookup = |sd: &mut String, val: i64| -> bool {
        for j in 0..bcf.enum_num_vals(enumidx) {
            let (name, v) = bcf.enum_val(enumidx, j);
            if v == val {
                sd.push_str(name);
                return true;
            }
        }
        false
    };
    if !bcf.enum_flags(enumidx) || val == 0 {
        return lookup(sd, val);
    }
    let start = sd.len();
    for i in 0..64 {
        let bit = val & (1i64 << i);
        if bit != 0 {
            if sd.len() != start {
                sd.push('|');
            }
            if !lookup(sd, bit) {
                // Unknown bits; cannot display symbolically.
                sd.truncate(start);
                return false;
            }
        }
    }
    true
}

/// Append a word as hex, for stack cells of unknown type.
pub fn to_string_hex(sd: &mut String, bits: u64) {
    let _ = write!(sd, "{:#x}", bits);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use opal_bytecode::{
        type_info, BytecodeBuilder, Opcode, TypeIdx, TYPE_ELEM_INT, TYPE_ELEM_STRING,
    };
    use std::sync::Arc;

    struct Fixture {
        heap: Heap,
        vec_of_str: TypeIdx,
        vec_of_vec: TypeIdx,
        point: TypeIdx,
    }

    fn fixture() -> Fixture {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        b.emit(Opcode::PushInt, &[0]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        let vec_of_str = b.add_vector_type(TYPE_ELEM_STRING);
        let udt = b.add_udt("Point");
        let point = b.add_class_type(udt, 0, &[TYPE_ELEM_INT, TYPE_ELEM_INT]);
        b.add_enum("color", false, &[("red", 0), ("green", 1)]);
        let vec_of_vec = b.add_vector_type(vec_of_str);
        let blob = b.build();
        Fixture {
            heap: Heap::new(Arc::new(opal_bytecode::BytecodeFile::load(&blob).unwrap())),
            vec_of_str,
            vec_of_vec,
            point,
        }
    }

    #[test]
    fn test_scalars() {
        let f = fixture();
        let mut sd = String::new();
        let ti = type_info(f.heap.bcf().type_table(), TYPE_ELEM_INT);
        value_to_string(&f.heap, &mut sd, Value::int(42), ti, &PrintPrefs::program());
        assert_eq!(sd, "42");

        sd.clear();
        let ti = type_info(f.heap.bcf().type_table(), opal_bytecode::TYPE_ELEM_FLOAT);
        value_to_string(&f.heap, &mut sd, Value::float(2.0), ti, &PrintPrefs::program());
        assert_eq!(sd, "2.0");
    }

    #[test]
    fn test_vector_and_quoting() {
        let mut f = fixture();
        let v = f.heap.new_vector(0, f.vec_of_str);
        for t in ["a", "b"] {
            let s = f.heap.new_string(t);
            unsafe {
                f.heap
                    .vector_push(v, Value::from_ref(s as *mut RefHeader, ValueKind::String))
            };
        }
        let mut sd = String::new();
        ref_to_string(&f.heap, &mut sd, v as *const RefHeader, &PrintPrefs::debug());
        assert_eq!(sd, "[\"a\", \"b\"]");
        sd.clear();
        ref_to_string(&f.heap, &mut sd, v as *const RefHeader, &PrintPrefs::program());
        assert_eq!(sd, "[a, b]");
        unsafe { f.heap.dec(v as *mut RefHeader) };
        f.heap.drain_delete_delay();
    }

    #[test]
    fn test_object() {
        let mut f = fixture();
        let o = f.heap.new_object(f.point);
        unsafe {
            OObject::set(o, 0, Value::int(3));
            OObject::set(o, 1, Value::int(4));
        }
        let mut sd = String::new();
        ref_to_string(&f.heap, &mut sd, o as *const RefHeader, &PrintPrefs::debug());
        assert_eq!(sd, "Point{3, 4}");
        unsafe { f.heap.dec(o as *mut RefHeader) };
        f.heap.drain_delete_delay();
    }

    #[test]
    fn test_cycle_is_cut() {
        let mut f = fixture();
        // A vector that contains itself.
        let v = f.heap.new_vector(1, f.vec_of_vec);
        unsafe {
            RefHeader::inc(v as *mut RefHeader);
            f.heap
                .vector_push(v, Value::from_ref(v as *mut RefHeader, ValueKind::Vector));
        }
        let mut sd = String::new();
        ref_to_string(&f.heap, &mut sd, v as *const RefHeader, &PrintPrefs::debug());
        assert!(sd.starts_with('['));
        assert!(sd.contains('_'), "cycle tag expected: {}", sd);
        // Break the cycle by hand so the heap drains clean.
        unsafe {
            (*v).len = 0;
            f.heap.dec(v as *mut RefHeader);
            f.heap.dec(v as *mut RefHeader);
        }
        f.heap.drain_delete_delay();
        assert_eq!(f.heap.pool().num_live(), 0);
    }

    #[test]
    fn test_enum_names() {
        let f = fixture();
        let mut sd = String::new();
        assert!(enum_name(&f.heap, &mut sd, 1, 0));
        assert_eq!(sd, "green");
        sd.clear();
        assert!(!enum_name(&f.heap, &mut sd, 7, 0));
    }
}
