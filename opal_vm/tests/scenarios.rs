//! End-to-end scenarios: each test assembles a blob, provides the compiled
//! entry function the transpiler would have produced for it, and runs the VM
//! through `eval_program`.

use opal_bytecode::{BytecodeBuilder, BytecodeFile, Opcode, TYPE_ELEM_INT, TYPE_ELEM_STRING};
use opal_vm::{default_registry, ops, stack, FunBase, StackPtr, TraceMode, Vm, VmArgs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

fn load(b: &BytecodeBuilder) -> Arc<BytecodeFile> {
    Arc::new(BytecodeFile::load(&b.build()).expect("test blob verifies"))
}

fn vm_with(bcf: Arc<BytecodeFile>, entry: FunBase) -> Vm {
    Vm::new(VmArgs::new(bcf, Arc::new(default_registry()), entry))
}

// =============================================================================
// Scenario: push 1, push 2, add, return
// =============================================================================

unsafe extern "C-unwind" fn entry_add(vm: *mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: the VM passed us its own pointer.
    let vm = unsafe { &mut *vm };
    let sp = ops::op_push_int(vm, sp, 1);
    let sp = ops::op_push_int(vm, sp, 2);
    let sp = ops::op_add_i(vm, sp);
    ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
}

#[test]
fn test_add_program_returns_three() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::AddI, &[]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
    let mut vm = vm_with(load(&b), entry_add);
    vm.eval_program().expect("program runs clean");
    assert_eq!(vm.eval_return(), "3");
    assert_eq!(vm.heap.pool().num_live(), 0);
    assert_eq!(vm.leak_count(), 0);
}

// =============================================================================
// Scenario: recursive factorial with save/restore of the shadowed global
// =============================================================================

// Specialised-identifier slots, in builder declaration order.
const VAR_X: i32 = 0;
const VAR_F: i32 = 1;

static FAC_START: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C-unwind" fn fun_fac(vm: *mut Vm, psp: StackPtr) -> StackPtr {
    let fs = FAC_START.load(Ordering::Relaxed) as usize;
    // Safety: the VM passed us its own pointer.
    let vmr = unsafe { &mut *vm };
    let mut sp = psp;
    sp = ops::op_fun_start(vmr, sp, vmr.code_ptr(fs));
    // if x == 0 then 1 else x * fac(x - 1)
    sp = ops::op_push_var(vmr, sp, VAR_X);
    sp = ops::op_push_int(vmr, sp, 0);
    sp = ops::op_eq_i(vmr, sp);
    sp = ops::op_jump_false(vmr, sp);
    // Safety: the comparison left the condition on top.
    let (mut sp, cond) = unsafe { stack::pop(sp) };
    if !cond.is_false() {
        sp = ops::op_push_int(vmr, sp, 1);
    } else {
        sp = ops::op_push_var(vmr, sp, VAR_X);
        sp = ops::op_push_var(vmr, sp, VAR_X);
        sp = ops::op_push_int(vmr, sp, 1);
        sp = ops::op_sub_i(vmr, sp);
        sp = ops::op_call(vmr, sp, fs as i32);
        // Safety: direct call, exactly as emitted code sequences it.
        sp = unsafe { fun_fac(vm, sp) };
        sp = ops::op_mul_i(vmr, sp);
    }
    ops::op_return(vmr, sp, 0, 1)
}

unsafe extern "C-unwind" fn entry_fac(vm: *mut Vm, sp: StackPtr) -> StackPtr {
    let fs = FAC_START.load(Ordering::Relaxed);
    // Safety: the VM passed us its own pointer.
    let vmr = unsafe { &mut *vm };
    let sp = ops::op_push_fun(vmr, sp, fs, fun_fac);
    let sp = ops::op_write_var(vmr, sp, VAR_F);
    let sp = ops::op_push_int(vmr, sp, 5);
    let sp = ops::op_call(vmr, sp, fs);
    // Safety: as above.
    let sp = unsafe { fun_fac(vm, sp) };
    ops::op_exit(vmr, sp, TYPE_ELEM_INT.0)
}

#[test]
fn test_factorial_recursion() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    let x = b.add_var("x", TYPE_ELEM_INT);
    assert_eq!(x as i32, VAR_X);
    let fv = b.add_var("fac", TYPE_ELEM_INT);
    assert_eq!(fv as i32, VAR_F);
    let f = b.add_function("fac");
    b.emit(Opcode::PushInt, &[5]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
    let fs = b.emit_funstart(f as i32, 8, &[x as i32], &[], 0, &[]);
    b.set_function_start(f, fs);
    b.emit(Opcode::PushVar, &[x as i32]);
    b.emit_with_delta(Opcode::Return, &[f as i32, 1], 0);
    FAC_START.store(fs as i32, Ordering::Relaxed);

    let mut vm = vm_with(load(&b), entry_fac);
    vm.eval_program().expect("program runs clean");
    assert_eq!(vm.eval_return(), "120");
    // The global binding written before the call survives it unchanged.
    let f_binding = vm.global(VAR_F as usize);
    assert_eq!(f_binding.fptr() as usize, fun_fac as usize);
    assert_eq!(vm.leak_count(), 0);
}

// =============================================================================
// Scenario: vector of strings, all references dropped
// =============================================================================

static VEC_OF_STR: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C-unwind" fn entry_vec_strings(vm: *mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: the VM passed us its own pointer.
    let vm = unsafe { &mut *vm };
    let sp = ops::op_push_str(vm, sp, 0);
    let sp = ops::op_push_str(vm, sp, 1);
    let sp = ops::op_push_str(vm, sp, 2);
    let sp = ops::op_new_vec(vm, sp, VEC_OF_STR.load(Ordering::Relaxed), 3);
    let sp = ops::op_drop_ref(vm, sp);
    let sp = ops::op_push_int(vm, sp, 0);
    ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
}

#[test]
fn test_vector_of_strings_leaves_no_leaks() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    let s0 = b.intern_string("alpha");
    let s1 = b.intern_string("beta");
    let s2 = b.intern_string("gamma");
    assert_eq!((s0, s1, s2), (0, 1, 2));
    let vec_of_str = b.add_vector_type(TYPE_ELEM_STRING);
    VEC_OF_STR.store(vec_of_str.0, Ordering::Relaxed);
    b.emit(Opcode::PushStr, &[0]);
    b.emit(Opcode::PushStr, &[1]);
    b.emit(Opcode::PushStr, &[2]);
    b.emit(Opcode::NewVec, &[vec_of_str.0, 3]);
    b.emit(Opcode::DropRef, &[]);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);

    let mut vm = vm_with(load(&b), entry_vec_strings);
    vm.eval_program().expect("program runs clean");
    assert_eq!(vm.eval_return(), "0");
    // Constant strings were released at end_eval; nothing lives on.
    assert_eq!(vm.heap.pool().num_live(), 0);
    assert_eq!(vm.leak_count(), 0);
}

// =============================================================================
// Scenario: out-of-range index inside a named function
// =============================================================================

static IDX_FUN_START: AtomicI32 = AtomicI32::new(-1);
static VEC_OF_INT: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C-unwind" fn fun_oob(vm: *mut Vm, psp: StackPtr) -> StackPtr {
    let fs = IDX_FUN_START.load(Ordering::Relaxed) as usize;
    // Safety: the VM passed us its own pointer.
    let vm = unsafe { &mut *vm };
    let mut sp = psp;
    sp = ops::op_fun_start(vm, sp, vm.code_ptr(fs));
    sp = ops::op_push_int(vm, sp, 1);
    sp = ops::op_push_int(vm, sp, 2);
    sp = ops::op_push_int(vm, sp, 3);
    sp = ops::op_new_vec(vm, sp, VEC_OF_INT.load(Ordering::Relaxed), 3);
    sp = ops::op_push_int(vm, sp, 5);
    sp = ops::op_v_index_i(vm, sp);
    ops::op_return(vm, sp, 0, 1)
}

unsafe extern "C-unwind" fn entry_oob(vm: *mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: the VM passed us its own pointer.
    let vmr = unsafe { &mut *vm };
    // Safety: direct call.
    let sp = unsafe { fun_oob(vm, sp) };
    ops::op_exit(vmr, sp, TYPE_ELEM_INT.0)
}

#[test]
fn test_index_out_of_range_reports_function_and_line() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    let file = b.add_filename("test.opal");
    b.add_line(7, file);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
    let f = b.add_function("pick");
    let vec_of_int = opal_bytecode::TYPE_ELEM_VECTOR_OF_INT;
    VEC_OF_INT.store(vec_of_int.0, Ordering::Relaxed);
    let fs = b.emit_funstart(f as i32, 8, &[], &[], 0, &[]);
    b.set_function_start(f, fs);
    IDX_FUN_START.store(fs as i32, Ordering::Relaxed);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::PushInt, &[3]);
    b.emit(Opcode::NewVec, &[vec_of_int.0, 3]);
    b.emit(Opcode::PushInt, &[5]);
    b.emit(Opcode::VIndexI, &[]);
    b.emit_with_delta(Opcode::Return, &[f as i32, 1], 0);

    let mut vm = vm_with(load(&b), entry_oob);
    let err = vm.eval_program().expect_err("index error");
    let msg = err.to_string();
    assert!(msg.contains("index 5 out of range 3 of:"), "{}", msg);
    assert!(msg.contains("in function: pick"), "{}", msg);
    assert!(msg.contains("test.opal:7"), "{}", msg);
}

// =============================================================================
// Scenario: workers exchanging tuples
// =============================================================================

static PAIR_TTI: AtomicI32 = AtomicI32::new(-1);

// Registry indices, fixed by default_registry order and asserted in the test.
const NF_WORKER_START: i32 = 3;
const NF_WORKER_WRITE: i32 = 4;
const NF_WORKER_READ: i32 = 5;
const NF_WORKER_TERMINATE: i32 = 6;

unsafe extern "C-unwind" fn entry_workers(vm: *mut Vm, sp: StackPtr) -> StackPtr {
    // Safety: the VM passed us its own pointer.
    let vm = unsafe { &mut *vm };
    let tti = PAIR_TTI.load(Ordering::Relaxed);
    let mut sp = sp;
    if vm.is_worker() {
        // Read one tuple (or nil after shutdown), then quit.
        sp = ops::op_push_int(vm, sp, tti);
        sp = ops::op_bcall_ret(vm, sp, NF_WORKER_READ, 1);
        sp = ops::op_drop_ref(vm, sp);
    } else {
        sp = ops::op_push_int(vm, sp, 4);
        sp = ops::op_bcall_ret(vm, sp, NF_WORKER_START, 1);
        sp = ops::op_drop(vm, sp);
        for i in 0..4 {
            sp = ops::op_push_int(vm, sp, i);
            sp = ops::op_push_int(vm, sp, i * 10);
            sp = ops::op_new_object(vm, sp, tti);
            sp = ops::op_bcall_ret(vm, sp, NF_WORKER_WRITE, 1);
            sp = ops::op_drop(vm, sp);
        }
        sp = ops::op_bcall_ret(vm, sp, NF_WORKER_TERMINATE, 0);
        sp = ops::op_drop(vm, sp);
    }
    sp = ops::op_push_int(vm, sp, 0);
    ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
}

#[test]
fn test_workers_roundtrip() {
    let reg = default_registry();
    assert_eq!(reg.lookup("worker_start"), Some(NF_WORKER_START as usize));
    assert_eq!(reg.lookup("worker_write"), Some(NF_WORKER_WRITE as usize));
    assert_eq!(reg.lookup("worker_read"), Some(NF_WORKER_READ as usize));
    assert_eq!(reg.lookup("worker_terminate"), Some(NF_WORKER_TERMINATE as usize));

    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    let udt = b.add_udt("Pair");
    let pair = b.add_class_type(udt, 0, &[TYPE_ELEM_INT, TYPE_ELEM_INT]);
    PAIR_TTI.store(pair.0, Ordering::Relaxed);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);

    let mut vm = vm_with(load(&b), entry_workers);
    vm.eval_program().expect("main runs clean");
    assert_eq!(vm.eval_return(), "0");
    assert_eq!(vm.num_workers(), 0, "all workers joined");
    assert_eq!(vm.leak_count(), 0);
}

#[test]
fn test_worker_count_is_clamped() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);

    unsafe extern "C-unwind" fn entry_quit(vm: *mut Vm, sp: StackPtr) -> StackPtr {
        // Safety: the VM passed us its own pointer.
        let vm = unsafe { &mut *vm };
        let sp = ops::op_push_int(vm, sp, 0);
        ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
    }

    let mut vm = vm_with(load(&b), entry_quit);
    let sp = std::ptr::null_mut();
    vm.start_workers(sp, 300);
    assert_eq!(vm.num_workers(), 256);
    vm.terminate_workers();
    assert_eq!(vm.num_workers(), 0);
}

#[test]
fn test_worker_write_nil_is_recoverable() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);

    unsafe extern "C-unwind" fn entry_bad_write(vm: *mut Vm, sp: StackPtr) -> StackPtr {
        // Safety: the VM passed us its own pointer.
        let vm = unsafe { &mut *vm };
        let mut sp = sp;
        sp = ops::op_push_int(vm, sp, 0);
        sp = ops::op_bcall_ret(vm, sp, NF_WORKER_START, 1);
        sp = ops::op_drop(vm, sp);
        sp = ops::op_push_nil(vm, sp);
        sp = ops::op_bcall_ret(vm, sp, NF_WORKER_WRITE, 1);
        sp = ops::op_drop(vm, sp);
        sp = ops::op_push_int(vm, sp, 0);
        ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
    }

    let mut vm = vm_with(load(&b), entry_bad_write);
    let err = vm.eval_program().expect_err("nil write raises");
    assert!(err.to_string().contains("thread write: nil reference"), "{}", err);
}

static MSG_TTI: AtomicI32 = AtomicI32::new(-1);

#[test]
fn test_worker_read_after_terminate_returns_nil() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    let udt = b.add_udt("Msg");
    let msg = b.add_class_type(udt, 0, &[TYPE_ELEM_INT]);
    MSG_TTI.store(msg.0, Ordering::Relaxed);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);

    unsafe extern "C-unwind" fn entry_read_only(vm: *mut Vm, sp: StackPtr) -> StackPtr {
        // Safety: the VM passed us its own pointer.
        let vm = unsafe { &mut *vm };
        let tti = MSG_TTI.load(Ordering::Relaxed);
        let mut sp = sp;
        if vm.is_worker() {
            // Blocks until shutdown, then gets nil instead of blocking
            // forever.
            sp = ops::op_push_int(vm, sp, tti);
            sp = ops::op_bcall_ret(vm, sp, NF_WORKER_READ, 1);
            sp = ops::op_drop_ref(vm, sp);
        } else {
            sp = ops::op_push_int(vm, sp, 2);
            sp = ops::op_bcall_ret(vm, sp, NF_WORKER_START, 1);
            sp = ops::op_drop(vm, sp);
            std::thread::sleep(std::time::Duration::from_millis(50));
            sp = ops::op_bcall_ret(vm, sp, NF_WORKER_TERMINATE, 0);
            sp = ops::op_drop(vm, sp);
        }
        sp = ops::op_push_int(vm, sp, 0);
        ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
    }

    let mut vm = vm_with(load(&b), entry_read_only);
    // Completes only because blocked readers wake with nil.
    vm.eval_program().expect("main runs clean");
    assert_eq!(vm.num_workers(), 0);
}

// =============================================================================
// Scenario: version mismatch refuses to load
// =============================================================================

#[test]
fn test_version_mismatch_fails_before_vm_exists() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
    let mut blob = b.build();
    let bumped = opal_bytecode::BYTECODE_FORMAT_VERSION + 1;
    blob[4..8].copy_from_slice(&bumped.to_le_bytes());
    let err = BytecodeFile::load(&blob).expect_err("version gate");
    assert!(err.to_string().contains("bytecode is from a different version"));
}

// =============================================================================
// Trace ring
// =============================================================================

#[test]
fn test_tail_trace_appears_in_error_in_order() {
    let mut b = BytecodeBuilder::new();
    let j = b.emit_jump(Opcode::Jump);
    b.patch_to_here(j);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);

    unsafe extern "C-unwind" fn entry_traced(vm: *mut Vm, sp: StackPtr) -> StackPtr {
        // Go through the trampolines so the ring sees each op.
        // Safety: trampoline ABI, VM's own pointer.
        unsafe {
            let sp = opal_vm::dispatch::u_push_int(vm, sp, 6);
            let sp = opal_vm::dispatch::u_push_int(vm, sp, 7);
            let sp = opal_vm::dispatch::u_mul_i(vm, sp);
            let sp = opal_vm::dispatch::u_push_int(vm, sp, 0);
            let sp = opal_vm::dispatch::u_div_i(vm, sp);
            let vm = &mut *vm;
            ops::op_exit(vm, sp, TYPE_ELEM_INT.0)
        }
    }

    let bcf = load(&b);
    let mut args = VmArgs::new(bcf, Arc::new(default_registry()), entry_traced);
    args.trace = TraceMode::Tail;
    let mut vm = Vm::new(args);
    let err = vm.eval_program().expect_err("division by zero");
    let msg = err.to_string();
    let a = msg.find("u_push_int").expect("first op traced");
    let m = msg.find("u_mul_i").expect("mul traced");
    let d = msg.find("u_div_i").expect("div traced");
    assert!(a < m && m < d, "ring flushed in execution order: {}", msg);
    assert!(msg.contains("division by zero"), "{}", msg);
}
