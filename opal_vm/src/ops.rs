//! The per-opcode implementation library.
//!
//! Every helper is a pure function over `(vm, sp, immediates) -> sp`, shared
//! by all execution paths: transpiled native code and jitted code call them
//! through the [`crate::dispatch`] trampolines, hand-written harness programs
//! call them directly. Helpers never read the instruction stream except
//! through their immediates (and the explicit stream pointer of the
//! variable-arg family).

use crate::stack::{pop, push, set_top, top, top_m};
use crate::vm::{FunBase, StackPtr, Vm};
use opal_bytecode::{TypeIdx, ValueKind};
use opal_runtime::{OObject, OString, OVector, RefHeader, Value};

// =============================================================================
// Constants
// =============================================================================

pub fn op_push_int(_vm: &mut Vm, sp: StackPtr, a: i32) -> StackPtr {
    // Safety: growth margin guarantees headroom inside a frame.
    unsafe { push(sp, Value::int(a as i64)) }
}

pub fn op_push_int64(_vm: &mut Vm, sp: StackPtr, lo: i32, hi: i32) -> StackPtr {
    let v = ((hi as i64) << 32) | (lo as u32 as i64);
    // Safety: as `op_push_int`.
    unsafe { push(sp, Value::int(v)) }
}

pub fn op_push_float(_vm: &mut Vm, sp: StackPtr, bits: i32) -> StackPtr {
    // Safety: as `op_push_int`.
    unsafe { push(sp, Value::float(f32::from_bits(bits as u32) as f64)) }
}

pub fn op_push_float64(_vm: &mut Vm, sp: StackPtr, lo: i32, hi: i32) -> StackPtr {
    let bits = ((hi as u32 as u64) << 32) | lo as u32 as u64;
    // Safety: as `op_push_int`.
    unsafe { push(sp, Value::float(f64::from_bits(bits))) }
}

pub fn op_push_str(vm: &mut Vm, sp: StackPtr, idx: i32) -> StackPtr {
    let s = vm.constant_string(idx as usize);
    // Safety: the constant slot keeps the string alive; each push takes its
    // own reference.
    unsafe {
        RefHeader::inc(s as *mut RefHeader);
        push(sp, Value::from_ref(s as *mut RefHeader, ValueKind::String))
    }
}

pub fn op_push_nil(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: as `op_push_int`.
    unsafe { push(sp, Value::nil()) }
}

// =============================================================================
// Variables
// =============================================================================

pub fn op_push_var(vm: &mut Vm, sp: StackPtr, varidx: i32) -> StackPtr {
    let v = vm.vars[varidx as usize];
    let k = vm.var_type_info(varidx as usize).kind();
    vm.heap.inc_value(v, k);
    // Safety: as `op_push_int`.
    unsafe { push(sp, v) }
}

/// Scalar store; the old value needs no release.
pub fn op_write_var(vm: &mut Vm, sp: StackPtr, varidx: i32) -> StackPtr {
    // Safety: one operand on the stack.
    let (sp, v) = unsafe { pop(sp) };
    vm.vars[varidx as usize] = v;
    sp
}

/// Reference store: releases the shadowed value, takes ownership of the
/// popped one.
pub fn op_write_var_ref(vm: &mut Vm, sp: StackPtr, varidx: i32) -> StackPtr {
    // Safety: one operand on the stack.
    let (sp, v) = unsafe { pop(sp) };
    let old = vm.vars[varidx as usize];
    vm.heap.dec_ref_nil(old);
    vm.vars[varidx as usize] = v;
    sp
}

/// Duplicate the top scalar.
pub fn op_dup(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one operand on the stack.
    let v = unsafe { top(sp) };
    #[cfg(debug_assertions)]
    debug_assert!(!v.kind().is_ref(), "dup on a reference cell");
    // Safety: as `op_push_int`.
    unsafe { push(sp, v) }
}

pub fn op_drop(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one operand on the stack.
    unsafe { pop(sp).0 }
}

pub fn op_drop_ref(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one operand on the stack.
    let (sp, v) = unsafe { pop(sp) };
    vm.heap.dec_ref_nil(v);
    sp
}

// =============================================================================
// Arithmetic and comparison
// =============================================================================

macro_rules! int_binop {
    ($name:ident, $a:ident, $b:ident, $expr:expr) => {
        pub fn $name(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
            // Safety: two operands on the stack.
            unsafe {
                let (sp, bv) = pop(sp);
                let $a = top(sp).ival();
                let $b = bv.ival();
                set_top(sp, Value::int($expr));
                sp
            }
        }
    };
}

macro_rules! float_binop {
    ($name:ident, $a:ident, $b:ident, $expr:expr) => {
        pub fn $name(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
            // Safety: two operands on the stack.
            unsafe {
                let (sp, bv) = pop(sp);
                let $a = top(sp).fval();
                let $b = bv.fval();
                set_top(sp, $expr);
                sp
            }
        }
    };
}

int_binop!(op_add_i, a, b, a.wrapping_add(b));
int_binop!(op_sub_i, a, b, a.wrapping_sub(b));
int_binop!(op_mul_i, a, b, a.wrapping_mul(b));
int_binop!(op_eq_i, a, b, (a == b) as i64);
int_binop!(op_ne_i, a, b, (a != b) as i64);
int_binop!(op_lt_i, a, b, (a < b) as i64);
int_binop!(op_gt_i, a, b, (a > b) as i64);
int_binop!(op_le_i, a, b, (a <= b) as i64);
int_binop!(op_ge_i, a, b, (a >= b) as i64);

float_binop!(op_add_f, a, b, Value::float(a + b));
float_binop!(op_sub_f, a, b, Value::float(a - b));
float_binop!(op_mul_f, a, b, Value::float(a * b));
float_binop!(op_div_f, a, b, Value::float(a / b));
float_binop!(op_eq_f, a, b, Value::int((a == b) as i64));
float_binop!(op_lt_f, a, b, Value::int((a < b) as i64));

pub fn op_div_i(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: two operands on the stack.
    unsafe {
        let b = top(sp).ival();
        if b == 0 {
            vm.error(sp, "division by zero".to_string());
        }
        let (sp, _) = pop(sp);
        let a = top(sp).ival();
        set_top(sp, Value::int(a.wrapping_div(b)));
        sp
    }
}

pub fn op_mod_i(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: two operands on the stack.
    unsafe {
        let b = top(sp).ival();
        if b == 0 {
            vm.error(sp, "division by zero".to_string());
        }
        let (sp, _) = pop(sp);
        let a = top(sp).ival();
        set_top(sp, Value::int(a.wrapping_rem(b)));
        sp
    }
}

pub fn op_not_l(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one operand on the stack.
    unsafe {
        let v = top(sp);
        set_top(sp, Value::int(v.is_false() as i64));
        sp
    }
}

/// String concatenation; consumes both operands.
pub fn op_add_s(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: two string operands on the stack.
    unsafe {
        let (sp, bv) = pop(sp);
        let av = top(sp);
        let ap = av.rptr() as *mut OString;
        let bp = bv.rptr() as *mut OString;
        let r = vm.heap.new_string_cat(OString::as_str(ap), OString::as_str(bp));
        vm.heap.dec(ap as *mut RefHeader);
        vm.heap.dec(bp as *mut RefHeader);
        set_top(sp, Value::from_ref(r as *mut RefHeader, ValueKind::String));
        sp
    }
}

// =============================================================================
// Vectors, objects, strings
// =============================================================================

pub fn op_new_vec(vm: &mut Vm, sp: StackPtr, tti: i32, len: i32) -> StackPtr {
    let v = vm.heap.new_vector(len as i64, TypeIdx(tti));
    // Safety: `len` element cells on the stack; ownership moves into the
    // vector.
    unsafe {
        for i in 0..len {
            vm.heap.vector_push(v, top_m(sp, (len - 1 - i) as isize));
        }
        let sp = sp.sub(len as usize);
        push(sp, Value::from_ref(v as *mut RefHeader, ValueKind::Vector))
    }
}

/// `[vector, index]` → element. Range-checked.
pub fn op_v_index_i(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: two operands on the stack.
    unsafe {
        let (sp, idxv) = pop(sp);
        let vecv = top(sp);
        let p = vecv.rptr_nil();
        if p.is_null() {
            vm.error(sp, "indexing a nil vector".to_string());
        }
        let v = p as *mut OVector;
        let i = idxv.ival();
        let len = (*v).len;
        if i < 0 || i >= len {
            vm.idx_err(sp, i, len, p);
        }
        let elem = OVector::at(v, i);
        let sub = vm.heap.type_info((*v).hdr.tti).subtype();
        let ek = vm.heap.type_info(sub).kind();
        vm.heap.inc_value(elem, ek);
        vm.heap.dec(p);
        set_top(sp, elem);
        sp
    }
}

pub fn op_v_len(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one vector operand on the stack.
    unsafe {
        let v = top(sp).rptr() as *mut OVector;
        let len = (*v).len;
        vm.heap.dec(v as *mut RefHeader);
        set_top(sp, Value::int(len));
        sp
    }
}

pub fn op_s_len(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one string operand on the stack.
    unsafe {
        let s = top(sp).rptr() as *mut OString;
        let len = (*s).len;
        vm.heap.dec(s as *mut RefHeader);
        set_top(sp, Value::int(len));
        sp
    }
}

pub fn op_new_object(vm: &mut Vm, sp: StackPtr, tti: i32) -> StackPtr {
    let len = vm.heap.type_info(TypeIdx(tti)).len() as usize;
    let o = vm.heap.new_object(TypeIdx(tti));
    // Safety: `len` field cells on the stack; ownership moves into the
    // object.
    unsafe {
        for i in 0..len {
            OObject::set(o, i, top_m(sp, (len - 1 - i) as isize));
        }
        let sp = sp.sub(len);
        push(sp, Value::from_ref(o as *mut RefHeader, ValueKind::Class))
    }
}

/// Replace the object on top with one of its fields.
pub fn op_push_fld(vm: &mut Vm, sp: StackPtr, fld: i32) -> StackPtr {
    // Safety: one object operand on the stack.
    unsafe {
        let ov = top(sp);
        let p = ov.rptr_nil();
        if p.is_null() {
            vm.error(sp, "field access on nil object".to_string());
        }
        let tti = (*p).tti;
        let et = vm.heap.type_info(tti).elem_type(fld as usize);
        let ek = vm.heap.type_info(et).kind();
        let f = OObject::at(p as *mut OObject, fld as usize);
        vm.heap.inc_value(f, ek);
        vm.heap.dec(p);
        set_top(sp, f);
        sp
    }
}

// =============================================================================
// Calls and returns
// =============================================================================

/// Function prologue; `ip` points at the `FunStart` instruction.
pub fn op_fun_start(vm: &mut Vm, sp: StackPtr, ip: *const i32) -> StackPtr {
    // Safety: `ip` points into this program's instruction stream.
    let pos = unsafe { ip.offset_from(vm.bcf().code().as_ptr()) } as usize;
    let mut sp = sp;
    vm.fun_intro(&mut sp, pos);
    sp
}

/// Direct-call bookkeeping. The continuation itself is sequenced by the
/// caller (generated code calls `fun_<target>` right after).
pub fn op_call(_vm: &mut Vm, sp: StackPtr, _target: i32) -> StackPtr {
    sp
}

/// Push a first-class function value.
pub fn op_push_fun(_vm: &mut Vm, sp: StackPtr, _id: i32, fcont: FunBase) -> StackPtr {
    // Safety: as `op_push_int`.
    unsafe { push(sp, Value::from_fun(fcont as *const ())) }
}

/// Indirect call dispatch: pops the function value and installs the call
/// target for the caller to invoke.
pub fn op_call_v(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one function operand on the stack.
    let (sp, f) = unsafe { pop(sp) };
    if f.is_false() {
        vm.error(sp, "calling a nil function value".to_string());
    }
    // Safety: non-nil function cells hold a FunBase pushed by op_push_fun.
    vm.next_call_target = Some(unsafe { std::mem::transmute::<*const (), FunBase>(f.fptr()) });
    sp
}

/// Dynamic dispatch: resolve the receiver's vtable entry and install it.
/// `rdepth` is the receiver's depth below the top of stack.
pub fn op_dd_call(vm: &mut Vm, sp: StackPtr, slot: i32, rdepth: i32) -> StackPtr {
    // Safety: receiver at the stated depth.
    let recv = unsafe { top_m(sp, rdepth as isize) };
    let p = recv.rptr_nil();
    if p.is_null() {
        vm.error(sp, "dynamic dispatch on nil".to_string());
    }
    // Safety: live object.
    let tti = unsafe { (*p).tti };
    let (kind, vstart) = {
        let ti = vm.heap.type_info(tti);
        let kind = ti.kind();
        (kind, if kind == ValueKind::Class { ti.vtable_start() } else { 0 })
    };
    if kind != ValueKind::Class {
        vm.error(sp, "dynamic dispatch on a non-class".to_string());
    }
    let idx = (vstart + slot) as usize;
    match vm.args.vtables.get(idx).copied().flatten() {
        Some(f) => vm.next_call_target = Some(f),
        None => vm.serious_error(format!("missing vtable entry {}", idx)),
    }
    sp
}

/// Native call through the registry, with the debug-build return-type check.
pub fn op_bcall_ret(vm: &mut Vm, sp: StackPtr, nfidx: i32, _nargs: i32) -> StackPtr {
    let natives = vm.args.natives.clone();
    let nf = natives.get(nfidx as usize);
    let sp = (nf.f)(vm, sp);
    #[cfg(debug_assertions)]
    vm.bcall_ret_check(sp, nf);
    sp
}

/// Function return. A `funid` other than the current frame's starts a
/// non-local return that outer frames propagate via `op_jump_if_unwound`.
pub fn op_return(vm: &mut Vm, sp: StackPtr, funid: i32, nrets: i32) -> StackPtr {
    let current = vm.current_function_id();
    let mut sp = sp;
    vm.fun_out(&mut sp, nrets as usize);
    if current != funid {
        vm.returning_from = funid;
    }
    sp
}

/// Return whatever is on the stack (entry blocks, unwind paths).
pub fn op_return_any(vm: &mut Vm, sp: StackPtr, nrets: i32) -> StackPtr {
    let mut sp = sp;
    vm.fun_out(&mut sp, nrets as usize);
    sp
}

/// Frameless return bookkeeping for transpiled functions, whose prologue and
/// epilogue live in their own register file instead of VM frames. `cur` is
/// the function being returned from (statically known to the transpiler);
/// any other `df` starts a non-local unwind.
pub fn op_fn_ret(vm: &mut Vm, psp: StackPtr, df: i32, cur: i32) -> StackPtr {
    if df != cur {
        vm.returning_from = df;
    }
    psp
}

/// Frameless counterpart of [`op_return_any`]: the emitted epilogue does all
/// the work; this is the trace point.
pub fn op_fn_ret_any(_vm: &mut Vm, psp: StackPtr, _nrets: i32) -> StackPtr {
    psp
}

// =============================================================================
// Jumps
// =============================================================================

/// Unconditional; the branch itself is lowered by codegen.
pub fn op_jump(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    sp
}

/// Leaves the condition for the caller's pop-and-test.
pub fn op_jump_false(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    sp
}

/// Inverts the condition so every conditional branch lowers to the same
/// pop-and-test-false shape.
pub fn op_jump_true(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one operand on the stack.
    unsafe {
        let v = top(sp);
        set_top(sp, Value::int(v.is_false() as i64));
        sp
    }
}

/// Pushes whether a non-local return is unwinding past this function
/// (`df`). Reaching its target function ends the unwind.
pub fn op_jump_if_unwound(vm: &mut Vm, sp: StackPtr, df: i32) -> StackPtr {
    let unwinding = vm.returning_from != -1;
    let past = if unwinding && vm.returning_from == df {
        vm.returning_from = -1;
        false
    } else {
        unwinding
    };
    // Safety: as `op_push_int`.
    unsafe { push(sp, Value::int(past as i64)) }
}

// =============================================================================
// Keepvars
// =============================================================================

fn keepvar_cell(vm: &mut Vm, slot: i32) -> *mut Value {
    let Some(stf) = vm.frames.last().copied() else {
        vm.serious_error("keepref outside a frame".to_string());
    };
    let bcf = vm.args.bcf.clone();
    let Some(fs) = opal_bytecode::read_funstart(bcf.code(), stf.funstart + 2) else {
        vm.serious_error("corrupt function header".to_string());
    };
    debug_assert!(slot < fs.nkeepvars);
    let depth = stf.spstart - fs.nkeepvars as isize + 1 + slot as isize;
    vm.stack_base().wrapping_offset(depth)
}

/// Park a reference in a keepvar slot so it outlives the ops that would
/// otherwise drop it. Released by the epilogue.
pub fn op_keep_ref(vm: &mut Vm, sp: StackPtr, stkofs: i32, slot: i32) -> StackPtr {
    let cell = keepvar_cell(vm, slot);
    // Safety: cell lies in the frame's keepvar region; operand at stkofs.
    unsafe { *cell = top_m(sp, stkofs as isize) };
    sp
}

/// As [`op_keep_ref`], but first releases the previous iteration's value.
pub fn op_keep_ref_loop(vm: &mut Vm, sp: StackPtr, stkofs: i32, slot: i32) -> StackPtr {
    let cell = keepvar_cell(vm, slot);
    // Safety: as `op_keep_ref`.
    unsafe {
        let old = *cell;
        vm.heap.dec_ref_nil(old);
        *cell = top_m(sp, stkofs as isize);
    }
    sp
}

// =============================================================================
// Program end
// =============================================================================

/// Pop the program result and run final cleanup.
pub fn op_exit(vm: &mut Vm, sp: StackPtr, tti: i32) -> StackPtr {
    // Safety: the result cell is on the stack.
    let (sp, ret) = unsafe { pop(sp) };
    let mut sp = sp;
    vm.end_eval(&mut sp, ret, TypeIdx(tti));
    sp
}

pub fn op_abort(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    let _ = sp;
    vm.serious_error("aborting".to_string());
}

// =============================================================================
// Transpiler prologue/epilogue support
// =============================================================================

/// Swap a global with the argument cell `pos` below the caller's top.
pub fn op_swap_vars(vm: &mut Vm, varidx: i32, psp: StackPtr, pos: i32) {
    // Safety: the caller pushed the argument cells onto `psp`.
    unsafe {
        std::mem::swap(&mut vm.vars[varidx as usize], &mut *psp.offset(-(pos as isize)));
    }
}

/// Save a global into a frame-local slot and nil the global, so recursion
/// sees a fresh binding.
///
/// # Safety
///
/// `dst` must be a writable cell.
pub unsafe fn op_backup_var(vm: &mut Vm, varidx: i32, dst: *mut Value) {
    // Safety: caller guarantees dst.
    unsafe { *dst = vm.vars[varidx as usize] };
    vm.vars[varidx as usize] = Value::nil();
}

/// Release an owned local's reference at function exit.
pub fn op_dec_owned(vm: &mut Vm, varidx: i32) {
    let v = vm.vars[varidx as usize];
    vm.heap.dec_ref_nil(v);
}

/// Pop one argument back into its global slot.
///
/// # Safety
///
/// `psp` must be non-empty.
pub unsafe fn op_pop_arg(vm: &mut Vm, varidx: i32, psp: StackPtr) -> StackPtr {
    // Safety: caller guarantees an argument cell.
    let (psp, v) = unsafe { pop(psp) };
    vm.vars[varidx as usize] = v;
    psp
}
