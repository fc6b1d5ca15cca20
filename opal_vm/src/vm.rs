//! The VM instance: operand stack, globals, call frames and the top-level
//! loop.
//!
//! One instance is owned by one thread. All mutable state (stack, globals,
//! heap, frames, trace ring, error buffer) lives here; the only things shared
//! between instances are the read-only blob, the native registry and the
//! worker tuple space.

use crate::dispatch::TraceMode;
use crate::error::RuntimeError;
use crate::natives::NativeRegistry;
use crate::workers::TupleSpace;
use opal_bytecode::{read_funstart, BytecodeFile, FunStartInfo, TypeIdx, TypeInfo};
use opal_runtime::print::{self, PrintPrefs};
use opal_runtime::{Heap, OString, Value};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Pointer to the current top operand-stack cell.
pub type StackPtr = *mut Value;

/// ABI of every compiled/jitted function and of the program entry: takes the
/// VM and the caller's stack top, returns the new top. `C-unwind` so the
/// error unwind may legally cross frames emitted by an external C compiler.
pub type FunBase = unsafe extern "C-unwind" fn(*mut Vm, StackPtr) -> StackPtr;

/// Initial operand stack size, in cells.
pub const INIT_STACK_SIZE: usize = 32 * 1024;

/// Default stack growth ceiling, in cells. Script-adjustable via
/// `set_max_stack_size()`.
pub const DEF_MAX_STACK_SIZE: usize = 512 * 1024;

/// Safety margin: the most the stack may grow by in a single call. Checked
/// once per function entry, so individual pushes stay check-free.
pub const STACK_MARGIN: usize = 8 * 1024;

/// One active call: where its `FunStart` lives and the operand-stack depth
/// recorded after its prologue.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    /// Word index of the function's `FunStart` instruction.
    pub funstart: usize,
    /// Stack depth at entry (after args/defs/keepvars are in place).
    pub spstart: isize,
}

/// Everything needed to construct a VM. Cloned to spawn workers.
#[derive(Clone)]
pub struct VmArgs {
    pub bcf: Arc<BytecodeFile>,
    pub natives: Arc<NativeRegistry>,
    /// Compiled or jitted program entry.
    pub entry: FunBase,
    /// Resolved vtable: blob slot → function, for dynamic dispatch.
    pub vtables: Arc<Vec<Option<FunBase>>>,
    pub program_args: Vec<String>,
    pub trace: TraceMode,
    pub max_stack_size: usize,
}

impl VmArgs {
    pub fn new(bcf: Arc<BytecodeFile>, natives: Arc<NativeRegistry>, entry: FunBase) -> VmArgs {
        VmArgs {
            bcf,
            natives,
            entry,
            vtables: Arc::new(Vec::new()),
            program_args: Vec::new(),
            trace: TraceMode::Off,
            max_stack_size: DEF_MAX_STACK_SIZE,
        }
    }
}

/// A virtual machine instance.
pub struct Vm {
    pub(crate) args: VmArgs,
    pub heap: Heap,

    stack: Box<[Value]>,
    /// Cached `&stack[1]`; `stack[0]` is the guard cell an empty sp points at.
    stack_base: *mut Value,
    stacksize: usize,
    pub maxstacksize: usize,

    /// Globals: one cell per specialised identifier.
    pub(crate) vars: Box<[Value]>,
    pub(crate) frames: Vec<FrameRecord>,

    /// Lazily interned constant strings, one slot per string-table entry.
    constant_strings: Box<[*mut OString]>,

    /// Call target installed by the dispatch of an indirect/dynamic call.
    pub(crate) next_call_target: Option<FunBase>,
    /// Function id a non-local return is unwinding towards; −1 when idle.
    pub(crate) returning_from: i32,

    pub trace: TraceMode,
    pub(crate) trace_ring: Vec<String>,
    pub(crate) trace_ring_idx: usize,

    pub(crate) errmsg: String,
    pub(crate) error_has_occured: bool,
    /// Stringified program result, written on normal completion.
    pub evalret: String,

    pub(crate) is_worker: bool,
    pub(crate) tuple_space: Option<Arc<TupleSpace>>,
    pub(crate) worker_threads: Vec<JoinHandle<()>>,

    #[cfg(debug_assertions)]
    max_sp: isize,
}

impl Vm {
    /// Construct a VM from a loaded blob. The globals array is sized from the
    /// blob's specialised-identifier count.
    pub fn new(args: VmArgs) -> Vm {
        let heap = Heap::new(args.bcf.clone());
        let mut stack = vec![Value::nil(); INIT_STACK_SIZE + 1].into_boxed_slice();
        let stack_base = unsafe { stack.as_mut_ptr().add(1) };
        let vars = vec![Value::nil(); args.bcf.num_specidents()].into_boxed_slice();
        let constant_strings =
            vec![std::ptr::null_mut(); args.bcf.num_strings()].into_boxed_slice();
        let trace = args.trace;
        let maxstacksize = args.max_stack_size;
        Vm {
            heap,
            stack,
            stack_base,
            stacksize: INIT_STACK_SIZE,
            maxstacksize,
            vars,
            frames: Vec::new(),
            constant_strings,
            next_call_target: None,
            returning_from: -1,
            trace,
            trace_ring: Vec::new(),
            trace_ring_idx: 0,
            errmsg: String::new(),
            error_has_occured: false,
            evalret: String::new(),
            is_worker: false,
            tuple_space: None,
            worker_threads: Vec::new(),
            #[cfg(debug_assertions)]
            max_sp: -1,
            args,
        }
    }

    #[inline]
    pub fn bcf(&self) -> &BytecodeFile {
        &self.args.bcf
    }

    #[inline]
    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.worker_threads.len()
    }

    /// Stringified program result (valid after a successful run).
    #[inline]
    pub fn eval_return(&self) -> &str {
        &self.evalret
    }

    /// Read a global binding (one cell per specialised identifier).
    #[inline]
    pub fn global(&self, varidx: usize) -> Value {
        self.vars[varidx]
    }

    /// Raise or lower the stack growth ceiling.
    #[inline]
    pub fn set_max_stack_size(&mut self, cells: usize) {
        self.maxstacksize = cells;
    }

    /// Current stack depth: −1 when empty.
    #[inline]
    pub(crate) fn depth(&self, sp: StackPtr) -> isize {
        // Safety: sp always points within the stack allocation (guard
        // included).
        unsafe { sp.offset_from(self.stack_base) }
    }

    /// Raw pointer to an instruction word, for variable-arg helpers.
    #[inline]
    pub fn code_ptr(&self, idx: usize) -> *const i32 {
        debug_assert!(idx < self.bcf().code().len());
        // Safety: bounds asserted; the blob outlives the VM.
        unsafe { self.bcf().code().as_ptr().add(idx) }
    }

    #[inline]
    pub(crate) fn stack_base(&self) -> StackPtr {
        self.stack_base
    }

    /// Static type of a variable, from the specialised-identifier table.
    #[inline]
    pub fn var_type_info(&self, varidx: usize) -> TypeInfo<'_> {
        let t = self.bcf().specident(varidx).typeidx;
        opal_bytecode::type_info(self.bcf().type_table(), t)
    }

    /// Lazily interned constant string. The slot owns one reference that is
    /// released at program end.
    pub fn constant_string(&mut self, i: usize) -> *mut OString {
        if self.constant_strings[i].is_null() {
            let bcf = self.args.bcf.clone();
            self.constant_strings[i] = self.heap.new_string(bcf.string(i));
        }
        self.constant_strings[i]
    }

    // =========================================================================
    // Function entry / exit
    // =========================================================================

    /// Function prologue. Only valid as the first thing a function body does.
    ///
    /// Pushes a frame, checks the growth margin, swaps each argument cell
    /// with its global slot, saves and nils each declared local, reserves
    /// keepvar scratch, then records the post-prologue depth.
    pub fn fun_intro(&mut self, sp: &mut StackPtr, funstart: usize) {
        self.frames.push(FrameRecord { funstart, spstart: self.depth(*sp) });

        if (self.depth(*sp) + 1) as usize > self.stacksize - STACK_MARGIN {
            // Per-call growth is bounded by the margin, so checking once at
            // entry is enough.
            self.grow_stack(sp);
        }

        let bcf = self.args.bcf.clone();
        let fs = match read_funstart(bcf.code(), funstart + 2) {
            Some(fs) => fs,
            None => self.serious_error("corrupt function header".to_string()),
        };

        let nargs = fs.args.len();
        for (i, &varidx) in fs.args.iter().enumerate() {
            // Safety: the caller pushed `nargs` argument cells.
            unsafe {
                std::mem::swap(
                    &mut self.vars[varidx as usize],
                    &mut *sp.sub(nargs - 1 - i),
                );
            }
        }
        for &varidx in fs.defs {
            // For most locals this saves a nil; only recursion sees a value.
            let saved = self.vars[varidx as usize];
            // Safety: within the growth margin.
            unsafe { *sp = crate::stack::push(*sp, saved) };
            self.vars[varidx as usize] = Value::nil();
        }
        for _ in 0..fs.nkeepvars {
            // Safety: within the growth margin.
            unsafe { *sp = crate::stack::push(*sp, Value::nil()) };
        }

        let depth = self.depth(*sp);
        self.frames.last_mut().expect("frame just pushed").spstart = depth;
        #[cfg(debug_assertions)]
        {
            if depth > self.max_sp {
                self.max_sp = depth;
            }
        }
    }

    /// Function epilogue: the mirror of [`Self::fun_intro`].
    ///
    /// Saves `nrv` return cells aside, releases keepvars and owned locals,
    /// restores saved locals and arguments into the globals in reverse order,
    /// pops the frame, then puts the return cells back on top.
    pub fn fun_out(&mut self, sp: &mut StackPtr, nrv: usize) {
        // Safety: the function body left `nrv` return cells on top.
        let rets = unsafe {
            *sp = sp.sub(nrv);
            crate::stack::top_ptr(*sp)
        };

        if self.frames.is_empty() {
            self.assert_failed("function exit without a frame");
        }
        let stf = *self.frames.last().expect("checked non-empty");
        if self.depth(*sp) != stf.spstart {
            self.assert_failed("stack misaligned on function exit");
        }

        let bcf = self.args.bcf.clone();
        let fs = match read_funstart(bcf.code(), stf.funstart + 2) {
            Some(fs) => fs,
            None => self.serious_error("corrupt function header".to_string()),
        };

        for _ in 0..fs.nkeepvars {
            // Safety: keepvars sit on top at the recorded depth.
            let v = unsafe {
                let (nsp, v) = crate::stack::pop(*sp);
                *sp = nsp;
                v
            };
            self.heap.dec_ref_nil(v);
        }
        for &varidx in fs.owned {
            let v = self.vars[varidx as usize];
            self.heap.dec_ref_nil(v);
        }
        for &varidx in fs.defs.iter().rev() {
            // Safety: the prologue pushed one save per local.
            unsafe {
                let (nsp, v) = crate::stack::pop(*sp);
                *sp = nsp;
                self.vars[varidx as usize] = v;
            }
        }
        for &varidx in fs.args.iter().rev() {
            // Safety: argument cells hold the shadowed globals.
            unsafe {
                let (nsp, v) = crate::stack::pop(*sp);
                *sp = nsp;
                self.vars[varidx as usize] = v;
            }
        }
        self.frames.pop();

        // Safety: destination is at or below the saved cells; copy handles
        // the zero-pop overlap case.
        unsafe {
            std::ptr::copy(rets, crate::stack::top_ptr(*sp), nrv);
            *sp = sp.add(nrv);
        }
    }

    /// Function id recorded in the current frame's `FunStart`.
    pub(crate) fn current_function_id(&self) -> i32 {
        let Some(stf) = self.frames.last() else { return -1 };
        let code = self.bcf().code();
        read_funstart(code, stf.funstart + 2).map_or(-1, |fs: FunStartInfo<'_>| fs.funid)
    }

    fn grow_stack(&mut self, sp: &mut StackPtr) {
        if self.stacksize >= self.maxstacksize {
            self.serious_error(
                "stack overflow! (use set_max_stack_size() if needed)".to_string(),
            );
        }
        let used = (self.depth(*sp) + 1) as usize;
        let nsize = self.stacksize * 2;
        let mut nstack = vec![Value::nil(); nsize + 1].into_boxed_slice();
        // Safety: `used + 1` cells (guard included) are live in the old stack
        // and the new one is strictly larger.
        unsafe {
            std::ptr::copy_nonoverlapping(self.stack.as_ptr(), nstack.as_mut_ptr(), used + 1);
            let base = nstack.as_mut_ptr().add(1);
            *sp = base.add(used).sub(1);
            self.stack_base = base;
        }
        self.stack = nstack;
        self.stacksize = nsize;
        log::debug!("stack grew to: {}", self.stacksize);
    }

    // =========================================================================
    // Top-level loop
    // =========================================================================

    /// Run the program: dispatch to the entry function, catching the error
    /// unwind. This is the only place the unwind is caught.
    pub fn eval_program(&mut self) -> Result<(), RuntimeError> {
        crate::error::install_unwind_hook();
        let entry = self.args.entry;
        let vm = self as *mut Vm;
        // Safety: the entry function follows the FunBase ABI; `sp` starts at
        // the guard cell (empty stack).
        let sp = self.stack_base.wrapping_sub(1);
        let result = catch_unwind(AssertUnwindSafe(|| unsafe { entry(vm, sp) }));
        match result {
            Ok(_) => Ok(()),
            Err(payload) => {
                if payload.downcast_ref::<crate::error::VmUnwind>().is_some() {
                    Err(RuntimeError::new(std::mem::take(&mut self.errmsg)))
                } else {
                    // Not ours (a host bug): keep unwinding.
                    resume_unwind(payload)
                }
            }
        }
    }

    /// Final cleanup, invoked by the program's exit op: stringify the result,
    /// verify the stack is empty, release constant strings, drain the
    /// delayed-delete queue and run the leak report.
    pub fn end_eval(&mut self, sp: &mut StackPtr, ret: Value, tti: TypeIdx) {
        self.terminate_workers();

        let bcf = self.args.bcf.clone();
        let ti = opal_bytecode::type_info(bcf.type_table(), tti);
        let mut out = String::new();
        print::value_to_string(&self.heap, &mut out, ret, ti, &PrintPrefs::program());
        self.evalret = out;
        self.heap.dec_value(ret, ti.kind());

        if self.depth(*sp) != -1 {
            log::error!("stack diff: {}", self.depth(*sp) + 1);
            while self.depth(*sp) >= 0 {
                // Safety: depth checked.
                let v = unsafe {
                    let (nsp, v) = crate::stack::pop(*sp);
                    *sp = nsp;
                    v
                };
                log::error!("left on the stack: {:#x}", v.any_bits());
            }
            debug_assert!(false, "operand stack not empty at program end");
        }
        debug_assert!(self.frames.is_empty(), "frames left at program end");
        #[cfg(debug_assertions)]
        log::info!("stack at its highest was: {}", self.max_sp);

        for i in 0..self.constant_strings.len() {
            let s = self.constant_strings[i];
            if !s.is_null() {
                // Safety: the slot owns one reference from interning.
                unsafe { self.heap.dec(s as *mut opal_runtime::RefHeader) };
                self.constant_strings[i] = std::ptr::null_mut();
            }
        }
        self.heap.drain_delete_delay();
        self.heap.dump_leaks();
    }

    /// Number of leaked objects right now (test hook; mirrors the report the
    /// program end emits).
    pub fn leak_count(&self) -> usize {
        self.heap.dump_leaks()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.terminate_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natives::default_registry;
    use opal_bytecode::{BytecodeBuilder, Opcode, TYPE_ELEM_INT};

    unsafe extern "C-unwind" fn nop_entry(_vm: *mut Vm, sp: StackPtr) -> StackPtr {
        sp
    }

    fn test_vm(build: impl FnOnce(&mut BytecodeBuilder)) -> Vm {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        b.emit(Opcode::PushInt, &[0]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        build(&mut b);
        let blob = b.build();
        let bcf = Arc::new(BytecodeFile::load(&blob).unwrap());
        Vm::new(VmArgs::new(bcf, Arc::new(default_registry()), nop_entry))
    }

    #[test]
    fn test_fun_intro_out_roundtrip() {
        let mut vm = test_vm(|b| {
            let x = b.add_var("x", TYPE_ELEM_INT);
            let l = b.add_var("l", TYPE_ELEM_INT);
            let f = b.add_function("f");
            let fs = b.emit_funstart(f as i32, 4, &[x as i32], &[l as i32], 1, &[]);
            b.set_function_start(f, fs);
            b.emit_with_delta(Opcode::Return, &[f as i32, 0], 0);
        });
        let funstart = vm.bcf().function(0).start_ip;

        // Pre-existing global values that the call must shadow and restore.
        vm.vars[0] = Value::int(111);
        vm.vars[1] = Value::int(222);

        let mut sp = vm.stack_base().wrapping_sub(1);
        // Caller pushes one argument.
        unsafe { sp = crate::stack::push(sp, Value::int(5)) };
        let depth_before = vm.depth(sp);

        vm.fun_intro(&mut sp, funstart);
        // Argument swapped into the global; local nilled out.
        assert_eq!(vm.vars[0].ival(), 5);
        assert!(vm.vars[1].rptr_nil().is_null());
        // arg save + def save + keepvar on the stack.
        assert_eq!(vm.depth(sp), depth_before + 2);
        assert_eq!(vm.frames.len(), 1);

        // Body pushes one return value.
        unsafe { sp = crate::stack::push(sp, Value::int(99)) };
        vm.fun_out(&mut sp, 1);

        assert_eq!(vm.frames.len(), 0);
        // sp_after == sp_before + nrets - nargs.
        assert_eq!(vm.depth(sp), depth_before + 1 - 1);
        // Globals restored.
        assert_eq!(vm.vars[0].ival(), 111);
        assert_eq!(vm.vars[1].ival(), 222);
        // Return value on top.
        unsafe { assert_eq!(crate::stack::top(sp).ival(), 99) };
    }

    #[test]
    fn test_stack_grows_at_margin() {
        let mut vm = test_vm(|b| {
            let f = b.add_function("f");
            let fs = b.emit_funstart(f as i32, 1, &[], &[], 0, &[]);
            b.set_function_start(f, fs);
            b.emit_with_delta(Opcode::Return, &[f as i32, 0], 0);
        });
        let funstart = vm.bcf().function(0).start_ip;
        let mut sp = vm.stack_base().wrapping_sub(1);
        // Exactly at the margin threshold: entry must not grow yet.
        let limit = (INIT_STACK_SIZE - STACK_MARGIN) as isize;
        unsafe {
            while vm.depth(sp) + 1 < limit {
                sp = crate::stack::push(sp, Value::int(0));
            }
        }
        assert_eq!(vm.stacksize, INIT_STACK_SIZE);
        vm.fun_intro(&mut sp, funstart);
        assert_eq!(vm.stacksize, INIT_STACK_SIZE);
        vm.fun_out(&mut sp, 0);
        // One past the threshold: entry grows by doubling.
        unsafe { sp = crate::stack::push(sp, Value::int(7)) };
        vm.fun_intro(&mut sp, funstart);
        assert_eq!(vm.stacksize, INIT_STACK_SIZE * 2);
        // Cells survived the move.
        unsafe { assert_eq!(crate::stack::top(sp).ival(), 7) };
        vm.fun_out(&mut sp, 0);
    }

    #[test]
    fn test_stack_overflow_is_recoverable() {
        let mut vm = test_vm(|b| {
            let f = b.add_function("f");
            let fs = b.emit_funstart(f as i32, 1, &[], &[], 0, &[]);
            b.set_function_start(f, fs);
            b.emit_with_delta(Opcode::Return, &[f as i32, 0], 0);
        });
        vm.set_max_stack_size(INIT_STACK_SIZE);
        let funstart = vm.bcf().function(0).start_ip;
        let vmp = &mut vm as *mut Vm;
        let r = std::panic::catch_unwind(AssertUnwindSafe(|| {
            // Safety: single-threaded re-borrow for the duration of the call.
            let vm = unsafe { &mut *vmp };
            let mut sp = vm.stack_base().wrapping_sub(1);
            unsafe {
                while vm.depth(sp) + 1 < (INIT_STACK_SIZE - STACK_MARGIN + 1) as isize {
                    sp = crate::stack::push(sp, Value::int(0));
                }
            }
            vm.fun_intro(&mut sp, funstart);
        }));
        assert!(r.is_err());
        assert!(vm.errmsg.contains("stack overflow"));
        assert!(vm.errmsg.contains("set_max_stack_size"));
    }
}
