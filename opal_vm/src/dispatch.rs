//! Opcode trampolines and trace modes.
//!
//! Each opcode `x` has a pure implementation `op_x` in [`crate::ops`] and a
//! thin `extern "C-unwind"` trampoline `u_x` here that optionally emits a
//! trace line, then calls the implementation. Transpiled native code and
//! jitted code call the trampolines by symbol; hand-written test programs may
//! call either layer.
//!
//! Trace modes: `Off` costs one branch per op; `On` logs each op as it
//! executes; `Tail` writes into a fixed ring that is flushed into the error
//! message only when an error unwinds.

use crate::vm::{FunBase, StackPtr, Vm};
use opal_runtime::Value;

/// Per-op trace behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Off,
    /// Log every op immediately.
    On,
    /// Keep the last [`TRACE_RING_SIZE`] ops; dump them on error.
    Tail,
}

/// Ring capacity in `Tail` mode.
pub const TRACE_RING_SIZE: usize = 50;

impl Vm {
    /// Next slot in the trace ring ( capacity 1 outside `Tail` mode).
    pub(crate) fn trace_stream(&mut self) -> &mut String {
        let size = if self.trace == TraceMode::Tail { TRACE_RING_SIZE } else { 1 };
        if self.trace_ring.len() < size {
            self.trace_ring.resize(size, String::new());
        }
        if self.trace_ring_idx == size {
            self.trace_ring_idx = 0;
        }
        let idx = self.trace_ring_idx;
        self.trace_ring_idx += 1;
        let sd = &mut self.trace_ring[idx];
        sd.clear();
        sd
    }

    /// Record one op. In debug builds the top one or two cells are appended
    /// using their tags.
    pub fn trace_op(&mut self, name: &str, sp: StackPtr) {
        let mut line = String::with_capacity(48);
        line.push_str(name);
        #[cfg(debug_assertions)]
        {
            if self.depth(sp) >= 0 {
                // Safety: depth checked.
                let v = unsafe { crate::stack::top(sp) };
                line.push_str(" - ");
                append_tagged(&mut line, v);
                if self.depth(sp) >= 1 {
                    // Safety: depth checked.
                    let v = unsafe { crate::stack::top_m(sp, 1) };
                    line.push_str(" - ");
                    append_tagged(&mut line, v);
                }
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = sp;
        if self.trace == TraceMode::Tail {
            let sd = self.trace_stream();
            sd.push_str(&line);
            sd.push('\n');
        } else {
            log::debug!("{}", line);
        }
    }
}

#[cfg(debug_assertions)]
fn append_tagged(sd: &mut String, v: Value) {
    use opal_bytecode::ValueKind;
    match v.kind() {
        ValueKind::Int => sd.push_str(&v.ival().to_string()),
        ValueKind::Float => sd.push_str(&v.fval().to_string()),
        ValueKind::Nil if v.is_false() => sd.push_str("nil"),
        _ => sd.push_str(&format!("{:#x}", v.any_bits())),
    }
}

macro_rules! trampolines {
    ($( fn $name:ident($($arg:ident: $ty:ty),*) => $imp:ident; )*) => {$(
        /// Traced trampoline; see [`crate::ops`] for the semantics.
        #[no_mangle]
        pub unsafe extern "C-unwind" fn $name(
            vm: *mut Vm,
            sp: StackPtr
            $(, $arg: $ty)*
        ) -> StackPtr {
            // Safety: callers pass the VM that owns `sp`.
            let vm = unsafe { &mut *vm };
            if vm.trace != TraceMode::Off {
                vm.trace_op(stringify!($name), sp);
            }
            crate::ops::$imp(vm, sp $(, $arg)*)
        }
    )*};
}

trampolines! {
    fn u_push_int(a: i32) => op_push_int;
    fn u_push_int64(lo: i32, hi: i32) => op_push_int64;
    fn u_push_float(bits: i32) => op_push_float;
    fn u_push_float64(lo: i32, hi: i32) => op_push_float64;
    fn u_push_str(idx: i32) => op_push_str;
    fn u_push_nil() => op_push_nil;
    fn u_push_var(varidx: i32) => op_push_var;
    fn u_dup() => op_dup;
    fn u_drop() => op_drop;
    fn u_drop_ref() => op_drop_ref;
    fn u_add_i() => op_add_i;
    fn u_sub_i() => op_sub_i;
    fn u_mul_i() => op_mul_i;
    fn u_div_i() => op_div_i;
    fn u_mod_i() => op_mod_i;
    fn u_add_f() => op_add_f;
    fn u_sub_f() => op_sub_f;
    fn u_mul_f() => op_mul_f;
    fn u_div_f() => op_div_f;
    fn u_add_s() => op_add_s;
    fn u_eq_i() => op_eq_i;
    fn u_ne_i() => op_ne_i;
    fn u_lt_i() => op_lt_i;
    fn u_gt_i() => op_gt_i;
    fn u_le_i() => op_le_i;
    fn u_ge_i() => op_ge_i;
    fn u_eq_f() => op_eq_f;
    fn u_lt_f() => op_lt_f;
    fn u_not_l() => op_not_l;
    fn u_new_vec(tti: i32, len: i32) => op_new_vec;
    fn u_v_index_i() => op_v_index_i;
    fn u_v_len() => op_v_len;
    fn u_s_len() => op_s_len;
    fn u_new_object(tti: i32) => op_new_object;
    fn u_push_fld(fld: i32) => op_push_fld;
    fn u_write_var(varidx: i32) => op_write_var;
    fn u_write_var_ref(varidx: i32) => op_write_var_ref;
    fn u_fun_start(ip: *const i32) => op_fun_start;
    fn u_call(target: i32) => op_call;
    fn u_push_fun(id: i32, fcont: FunBase) => op_push_fun;
    fn u_call_v() => op_call_v;
    fn u_dd_call(slot: i32, rdepth: i32) => op_dd_call;
    fn u_bcall_ret(nfidx: i32, nargs: i32) => op_bcall_ret;
    fn u_return(funid: i32, nrets: i32) => op_return;
    fn u_return_any(nrets: i32) => op_return_any;
    fn u_fn_ret(df: i32, cur: i32) => op_fn_ret;
    fn u_fn_ret_any(nrets: i32) => op_fn_ret_any;
    fn u_jump() => op_jump;
    fn u_jump_false() => op_jump_false;
    fn u_jump_true() => op_jump_true;
    fn u_jump_if_unwound(df: i32) => op_jump_if_unwound;
    fn u_keep_ref(stkofs: i32, slot: i32) => op_keep_ref;
    fn u_keep_ref_loop(stkofs: i32, slot: i32) => op_keep_ref_loop;
    fn u_exit(tti: i32) => op_exit;
    fn u_abort() => op_abort;
}

// =============================================================================
// Transpiler support entry points
// =============================================================================
//
// The emitted prologue/epilogue calls these directly instead of going through
// an opcode; see the codegen crate for the call sites.

/// Swap a global slot with the argument cell `pos` below the caller's top.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_swap_vars(vm: *mut Vm, varidx: i32, psp: StackPtr, pos: i32) {
    // Safety: callers pass the VM that owns `psp`.
    let vm = unsafe { &mut *vm };
    crate::ops::op_swap_vars(vm, varidx, psp, pos);
}

/// Save a global slot into `dst` and nil the global.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_backup_var(vm: *mut Vm, varidx: i32, dst: *mut Value) {
    // Safety: as above; `dst` is a frame-local save slot.
    let vm = unsafe { &mut *vm };
    // Safety: dst is writable.
    unsafe { crate::ops::op_backup_var(vm, varidx, dst) };
}

/// Write nil into a frame-local slot.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_nil_val(dst: *mut Value) {
    // Safety: dst is a writable frame-local slot.
    unsafe { *dst = Value::nil() };
}

/// Release the reference held by an owned local.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_dec_owned(vm: *mut Vm, varidx: i32) {
    // Safety: callers pass a live VM.
    let vm = unsafe { &mut *vm };
    crate::ops::op_dec_owned(vm, varidx);
}

/// Release the reference held by a frame-local cell.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_dec_val(vm: *mut Vm, v: Value) {
    // Safety: callers pass a live VM.
    let vm = unsafe { &mut *vm };
    vm.heap.dec_ref_nil(v);
}

/// Restore a saved global slot.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_restore_backup(vm: *mut Vm, varidx: i32, v: Value) {
    // Safety: callers pass a live VM.
    let vm = unsafe { &mut *vm };
    vm.vars[varidx as usize] = v;
}

/// Pop one argument cell back into its global slot; returns the new top.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_pop_arg(vm: *mut Vm, varidx: i32, psp: StackPtr) -> StackPtr {
    // Safety: callers pass the VM that owns `psp`, non-empty.
    let vm = unsafe { &mut *vm };
    unsafe { crate::ops::op_pop_arg(vm, varidx, psp) }
}

/// The call target installed by the last indirect/dynamic call dispatch.
#[no_mangle]
pub unsafe extern "C-unwind" fn u_get_next_call_target(vm: *mut Vm) -> FunBase {
    // Safety: callers pass a live VM.
    let vm = unsafe { &mut *vm };
    match vm.next_call_target {
        Some(f) => f,
        None => vm.serious_error("indirect call with no target".to_string()),
    }
}

/// Handshake called once by C-mode output: the external compiler's Value must
/// be layout-identical to ours.
#[no_mangle]
pub extern "C-unwind" fn opal_entry_check(value_size: i32) {
    assert_eq!(
        value_size as usize,
        std::mem::size_of::<Value>(),
        "compiled code was built against a different Value layout"
    );
}
