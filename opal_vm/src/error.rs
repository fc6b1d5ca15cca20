//! Error composition and the single unwind site.
//!
//! Every non-fatal runtime error funnels through [`Vm::unwind_on_error`]: the
//! composed message is left in the VM's error buffer and a marker payload is
//! raised, to be caught only at the top of `eval_program`. The unwind uses
//! the `C-unwind` ABI end to end, so it may cross frames emitted by an
//! external C compiler; a setjmp/longjmp backend would only be needed on a
//! toolchain that cannot guarantee that propagation, at the documented cost
//! of skipping destructors on the jumped-over frames.

use crate::stack;
use crate::vm::{StackPtr, Vm};
use opal_bytecode::read_funstart;
use opal_runtime::print::{self, PrintPrefs};
use opal_runtime::{RefHeader, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Once;

/// Panic payload marking a VM error unwind. The message itself stays in the
/// VM's error buffer.
pub struct VmUnwind;

/// A runtime error as reported to the host. There is no in-language
/// recovery; the host decides whether to restart.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: String) -> RuntimeError {
        RuntimeError { message }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Silence the default panic printer for our own unwind payloads; anything
/// else keeps the previous hook's behavior.
pub(crate) fn install_unwind_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<VmUnwind>().is_none() {
                prev(info);
            }
        }));
    });
}

/// Budget past which per-frame variable dumps are dropped.
const ERRMSG_DUMP_BUDGET: usize = 10_000;

impl Vm {
    /// The single location from which execution unwinds on error.
    pub(crate) fn unwind_on_error(&mut self) -> ! {
        install_unwind_hook();
        std::panic::panic_any(VmUnwind);
    }

    /// Record the base message. Handles error-during-error re-entry and the
    /// tail-trace flush, both of which unwind immediately.
    pub(crate) fn error_base(&mut self, err: &str) {
        if self.error_has_occured {
            // Re-entry while composing a previous error: give the original
            // site something to append and get out.
            self.errmsg = err.to_string();
            self.unwind_on_error();
        }
        self.error_has_occured = true;
        if self.trace == crate::dispatch::TraceMode::Tail && !self.trace_ring.is_empty() {
            let mut sd = String::new();
            for i in self.trace_ring_idx..self.trace_ring.len() {
                sd += &self.trace_ring[i];
            }
            for i in 0..self.trace_ring_idx {
                sd += &self.trace_ring[i];
            }
            sd += err;
            self.errmsg = sd;
            self.unwind_on_error();
        }
        self.errmsg = format!("VM error: {}", err);
    }

    /// Raise a runtime error with a full trace: leftover stack cells above
    /// the top frame, then each frame with its argument and local values.
    pub fn error(&mut self, sp: StackPtr, err: String) -> ! {
        self.error_base(&err);
        let mut sd = std::mem::take(&mut self.errmsg);
        let mut sp = sp;
        let vmp = self as *mut Vm;
        let r = catch_unwind(AssertUnwindSafe(|| {
            // Safety: exclusive access for the duration of the dump; the
            // catch exists because the dump itself may raise.
            let vm = unsafe { &mut *vmp };
            vm.error_trace(&mut sd, &mut sp);
        }));
        if r.is_err() {
            // Error happened while we were building this stack trace.
            sd.push_str("\nRECURSIVE ERROR:\n");
            sd.push_str(&std::mem::take(&mut self.errmsg));
        }
        self.errmsg = sd;
        self.unwind_on_error();
    }

    /// Raise without attempting any variable dumping; used when the VM may
    /// already be in an inconsistent state.
    pub fn serious_error(&mut self, err: String) -> ! {
        self.error_base(&err);
        self.unwind_on_error();
    }

    /// Internal invariant breach.
    pub(crate) fn assert_failed(&mut self, what: &str) -> ! {
        self.serious_error(format!("VM internal assertion failure: {}", what));
    }

    /// Out-of-range vector index.
    pub fn idx_err(&mut self, sp: StackPtr, i: i64, n: i64, ro: *const RefHeader) -> ! {
        let mut sd = format!("index {} out of range {} of: ", i, n);
        print::ref_to_string(&self.heap, &mut sd, ro, &PrintPrefs::debug());
        self.error(sp, sd)
    }

    fn error_trace(&mut self, sd: &mut String, sp: &mut StackPtr) {
        // Cells above the top frame: values mid-expression whose types we
        // cannot know here. Printed as hex, plus a best-effort dereference
        // when the word is a live allocation. Popped without dec; leaks on
        // the error path are accepted.
        loop {
            let depth = self.depth(*sp);
            if depth < 0 {
                break;
            }
            if let Some(f) = self.frames.last() {
                if depth == f.spstart {
                    break;
                }
            }
            // Safety: depth checked above.
            let v = unsafe { stack::top(*sp) };
            sd.push_str("\n   stack: ");
            print::to_string_hex(sd, v.any_bits());
            let addr = v.any_bits() as usize;
            if self.heap.pool().pointer_is_in_allocator(addr) {
                sd.push_str(", maybe: ");
                print::ref_to_string(&self.heap, sd, addr as *const RefHeader, &PrintPrefs::debug());
            }
            // Safety: as above.
            unsafe {
                let (nsp, _) = stack::pop(*sp);
                *sp = nsp;
            }
        }

        loop {
            let Some(stf) = self.frames.last().copied() else { break };
            let bcf = self.args.bcf.clone();
            let Some(fs) = read_funstart(bcf.code(), stf.funstart + 2) else { break };
            if fs.funid >= 0 {
                sd.push_str("\nin function: ");
                sd.push_str(bcf.function_name(fs.funid as usize));
                self.dump_file_line(stf.funstart, sd);
            } else {
                sd.push_str("\nin block");
            }
            if sd.len() < ERRMSG_DUMP_BUDGET {
                for &varidx in fs.defs.iter().rev() {
                    self.dump_var(sd, self.vars[varidx as usize], varidx as usize);
                }
                for &varidx in fs.args.iter().rev() {
                    self.dump_var(sd, self.vars[varidx as usize], varidx as usize);
                }
            }
            // Unwind this frame exactly as fun_out would, minus refcounts.
            // Safety: the prologue put these cells here; depths match the
            // frame record.
            unsafe {
                *sp = sp.sub(fs.nkeepvars as usize);
                for &varidx in fs.defs.iter().rev() {
                    let (nsp, v) = stack::pop(*sp);
                    *sp = nsp;
                    self.vars[varidx as usize] = v;
                }
                for &varidx in fs.args.iter().rev() {
                    let (nsp, v) = stack::pop(*sp);
                    *sp = nsp;
                    self.vars[varidx as usize] = v;
                }
            }
            self.frames.pop();
            let restored = self.frames.last().map_or(-1, |f| f.spstart);
            *sp = self.stack_base().wrapping_offset(restored);
        }
    }

    /// Append `name = value` for one specialised identifier, when it is worth
    /// showing.
    fn dump_var(&self, sd: &mut String, x: Value, idx: usize) {
        let bcf = self.bcf();
        let sid = bcf.specident(idx);
        let id = bcf.ident(sid.ididx as usize);
        // Global constants add noise, not signal.
        if id.readonly && id.global {
            return;
        }
        let ti = opal_bytecode::type_info(bcf.type_table(), sid.typeidx);
        #[cfg(debug_assertions)]
        {
            // Tag mismatch on a scalar slot: likely uninitialized.
            use opal_bytecode::ValueKind;
            let k = ti.kind();
            if matches!(k, ValueKind::Int | ValueKind::Float) && x.kind() != k {
                return;
            }
        }
        sd.push_str("\n   ");
        sd.push_str(bcf.string(id.name as usize));
        sd.push_str(" = ");
        print::value_to_string(&self.heap, sd, x, ti, &PrintPrefs::debug());
    }

    /// Append `(file:line)` for an instruction, when line info is present.
    pub(crate) fn dump_file_line(&self, ip: usize, sd: &mut String) {
        let bcf = self.bcf();
        if let Some(li) = bcf.lookup_line(ip) {
            let file = bcf.filename(li.fileidx as usize);
            sd.push_str(&format!(" ({}:{})", file, li.line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natives::default_registry;
    use crate::vm::VmArgs;
    use opal_bytecode::{BytecodeBuilder, BytecodeFile, Opcode, TYPE_ELEM_INT};
    use std::sync::Arc;

    unsafe extern "C-unwind" fn nop_entry(_vm: *mut Vm, sp: StackPtr) -> StackPtr {
        sp
    }

    fn error_vm() -> Vm {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        let file = b.add_filename("err.opal");
        b.add_line(12, file);
        b.emit(Opcode::PushInt, &[0]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        let x = b.add_var("x", TYPE_ELEM_INT);
        let f = b.add_function("f");
        let fs = b.emit_funstart(f as i32, 2, &[x as i32], &[], 0, &[]);
        b.set_function_start(f, fs);
        b.emit_with_delta(Opcode::Return, &[f as i32, 0], 0);
        let bcf = Arc::new(BytecodeFile::load(&b.build()).unwrap());
        Vm::new(VmArgs::new(bcf, Arc::new(default_registry()), nop_entry))
    }

    #[test]
    fn test_error_message_has_frame_and_vars() {
        let mut vm = error_vm();
        let funstart = vm.bcf().function(0).start_ip;
        let vmp = &mut vm as *mut Vm;
        let r = catch_unwind(AssertUnwindSafe(|| {
            // Safety: single-threaded re-borrow.
            let vm = unsafe { &mut *vmp };
            let mut sp = vm.stack_base().wrapping_sub(1);
            unsafe { sp = stack::push(sp, Value::int(5)) };
            vm.fun_intro(&mut sp, funstart);
            unsafe { sp = stack::push(sp, Value::int(77)) };
            vm.error(sp, "something broke".to_string());
        }));
        assert!(r.is_err());
        let msg = &vm.errmsg;
        assert!(msg.contains("VM error: something broke"), "{}", msg);
        assert!(msg.contains("in function: f"), "{}", msg);
        assert!(msg.contains("x = 5"), "{}", msg);
        assert!(msg.contains("err.opal:12"), "{}", msg);
        assert!(msg.contains("stack:"), "{}", msg);
        // The walk unwound every frame.
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn test_serious_error_skips_dump() {
        let mut vm = error_vm();
        let vmp = &mut vm as *mut Vm;
        let r = catch_unwind(AssertUnwindSafe(|| {
            // Safety: single-threaded re-borrow.
            let vm = unsafe { &mut *vmp };
            vm.serious_error("invariant breach".to_string());
        }));
        assert!(r.is_err());
        assert!(vm.errmsg.contains("VM error: invariant breach"));
        assert!(!vm.errmsg.contains("in function"));
    }
}
