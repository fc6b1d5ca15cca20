//! The native-function registry.
//!
//! A table mapping indices to host-provided functions; read-only and shared
//! between worker VMs. The `BCallRet` opcode dispatches through it. A default
//! registry ships for tests and self-contained runs; hosts register whatever
//! else they need before constructing VMs.

use crate::stack::{pop, push};
use crate::vm::{StackPtr, Vm};
use opal_bytecode::TypeIdx;
#[cfg(debug_assertions)]
use opal_bytecode::ValueKind;
use opal_runtime::print::{self, PrintPrefs};
use opal_runtime::{OString, RefHeader, Value};

/// Host function: same stack discipline as an opcode helper.
pub type NativeFn = fn(&mut Vm, StackPtr) -> StackPtr;

/// One registered host function.
pub struct NativeFun {
    pub name: &'static str,
    /// Argument cells consumed.
    pub nargs: i32,
    /// Kinds of the cells left on the stack, top last. Checked (loosely) in
    /// debug builds after each call.
    pub retvals: &'static [ValueKindTag],
    /// Continuation-style natives return intermediary values the check must
    /// skip.
    pub has_continuation: bool,
    /// Lowered to a direct host call by the transpiler instead of a registry
    /// dispatch.
    pub is_frame_hook: bool,
    pub f: NativeFn,
}

/// Alias so release builds (where `ValueKind` is only a table concept) keep
/// the same declaration shape.
pub type ValueKindTag = opal_bytecode::ValueKind;

/// Index-addressed table of native functions.
#[derive(Default)]
pub struct NativeRegistry {
    nfuns: Vec<NativeFun>,
}

impl NativeRegistry {
    pub fn new() -> NativeRegistry {
        NativeRegistry { nfuns: Vec::new() }
    }

    pub fn register(&mut self, nf: NativeFun) -> usize {
        self.nfuns.push(nf);
        self.nfuns.len() - 1
    }

    #[inline]
    pub fn get(&self, i: usize) -> &NativeFun {
        &self.nfuns[i]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nfuns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nfuns.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.nfuns.iter().position(|nf| nf.name == name)
    }
}

impl Vm {
    /// See if a native function is lying about what type it returns. Other
    /// (continuation) natives return intermediary values that don't
    /// correspond to final return values.
    #[cfg(debug_assertions)]
    pub(crate) fn bcall_ret_check(&self, sp: StackPtr, nf: &NativeFun) {
        if nf.has_continuation {
            return;
        }
        let n = nf.retvals.len();
        for (i, &want) in nf.retvals.iter().enumerate() {
            // Safety: the native left `n` return cells.
            let got = unsafe { crate::stack::top_m(sp, (n - 1 - i) as isize) }.kind();
            let ok = got == want
                || want == ValueKind::Any
                || (want.is_ref_nil() && got == ValueKind::Nil)
                // A declared UDT may come back as a vector; accepted as-is.
                || (want == ValueKind::Vector && got.is_udt());
            debug_assert!(ok, "native {} returned {:?} where {:?} was declared", nf.name, got, want);
        }
    }
}

// =============================================================================
// Default natives
// =============================================================================

fn n_print_i(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one int argument.
    let (sp, v) = unsafe { pop(sp) };
    println!("{}", v.ival());
    let _ = vm;
    // Safety: growth margin guarantees headroom.
    unsafe { push(sp, Value::nil()) }
}

fn n_print_s(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one string argument.
    unsafe {
        let (sp, v) = pop(sp);
        let s = v.rptr() as *mut OString;
        println!("{}", OString::as_str(s));
        vm.heap.dec(s as *mut RefHeader);
        push(sp, Value::nil())
    }
}

/// Stringify any ref argument with program preferences (debug aid).
fn n_to_string_ref(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one ref argument.
    unsafe {
        let (sp, v) = pop(sp);
        let p = v.rptr_nil();
        let mut out = String::new();
        if p.is_null() {
            out.push_str("nil");
        } else {
            print::ref_to_string(&vm.heap, &mut out, p, &PrintPrefs::program());
            vm.heap.dec(p);
        }
        let s = vm.heap.new_string(&out);
        push(sp, Value::from_ref(s as *mut RefHeader, opal_bytecode::ValueKind::String))
    }
}

fn n_worker_start(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one int argument.
    let (sp, n) = unsafe { pop(sp) };
    vm.start_workers(sp, n.ival());
    // Safety: headroom.
    unsafe { push(sp, Value::nil()) }
}

fn n_worker_write(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one ref argument.
    let (sp, v) = unsafe { pop(sp) };
    vm.worker_write(sp, v);
    let p = v.rptr_nil();
    if !p.is_null() {
        // Safety: non-null class ref, checked by worker_write.
        unsafe { vm.heap.dec(p) };
    }
    // Safety: headroom.
    unsafe { push(sp, Value::nil()) }
}

fn n_worker_read(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one int (type index) argument.
    let (sp, t) = unsafe { pop(sp) };
    let o = vm.worker_read(sp, TypeIdx(t.ival() as i32));
    let v = if o.is_null() {
        Value::nil()
    } else {
        Value::from_ref(o as *mut RefHeader, opal_bytecode::ValueKind::Class)
    };
    // Safety: headroom.
    unsafe { push(sp, v) }
}

fn n_worker_terminate(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    vm.terminate_workers();
    // Safety: headroom.
    unsafe { push(sp, Value::nil()) }
}

fn n_is_worker(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: headroom.
    unsafe { push(sp, Value::int(vm.is_worker() as i64)) }
}

fn n_set_max_stack_size(vm: &mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: one int argument.
    let (sp, n) = unsafe { pop(sp) };
    vm.set_max_stack_size(n.ival() as usize);
    // Safety: headroom.
    unsafe { push(sp, Value::nil()) }
}

/// Per-frame host hook. The transpiler lowers calls to it to a direct
/// `host_frame(sp, vm)` call linked from the host; through the registry it
/// is a no-op the host replaces.
fn n_host_frame(_vm: &mut Vm, sp: StackPtr) -> StackPtr {
    sp
}

/// The registry used by the driver and the test harness.
pub fn default_registry() -> NativeRegistry {
    use opal_bytecode::ValueKind as K;
    let mut reg = NativeRegistry::new();
    let mut add = |name, nargs, retvals, f| {
        reg.register(NativeFun {
            name,
            nargs,
            retvals,
            has_continuation: false,
            is_frame_hook: false,
            f,
        })
    };
    add("print_i", 1, &[K::Nil], n_print_i);
    add("print_s", 1, &[K::Nil], n_print_s);
    add("to_string", 1, &[K::String], n_to_string_ref);
    add("worker_start", 1, &[K::Nil], n_worker_start);
    add("worker_write", 1, &[K::Nil], n_worker_write);
    add("worker_read", 1, &[K::Class], n_worker_read);
    add("worker_terminate", 0, &[K::Nil], n_worker_terminate);
    add("is_worker", 0, &[K::Int], n_is_worker);
    add("set_max_stack_size", 1, &[K::Nil], n_set_max_stack_size);
    reg.register(NativeFun {
        name: "host_frame",
        nargs: 0,
        retvals: &[],
        has_continuation: false,
        is_frame_hook: true,
        f: n_host_frame,
    });
    reg
}
