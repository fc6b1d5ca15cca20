//! The cross-worker tuple space.
//!
//! Independent VM instances exchange immutable record snapshots through
//! per-class blocking FIFOs. Writers deep-copy scalar fields into a fresh
//! row and signal one waiter; readers block until a row arrives or the space
//! is shut down. Per-queue order is FIFO; nothing is ordered across queues
//! and no fairness is promised among readers of one queue.

use crate::vm::{StackPtr, Vm, VmArgs};
use opal_bytecode::{type_info, TypeIdx, ValueKind};
use opal_runtime::{OObject, Value};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cap on worker count, to stop bad values from locking up the machine.
pub const MAX_WORKERS: i64 = 256;

/// One deep-copied record snapshot.
pub(crate) struct TupleRow(pub Box<[Value]>);

// Safety: rows hold scalar cells only; `worker_write` rejects reference
// fields before copying.
unsafe impl Send for TupleRow {}

pub(crate) struct TupleQueue {
    pub queue: Mutex<VecDeque<TupleRow>>,
    pub cond: Condvar,
}

impl Default for TupleQueue {
    fn default() -> Self {
        TupleQueue { queue: Mutex::new(VecDeque::new()), cond: Condvar::new() }
    }
}

/// Per-class blocking queues shared between worker VMs.
pub struct TupleSpace {
    pub(crate) tuple_types: Box<[TupleQueue]>,
    pub(crate) alive: AtomicBool,
}

impl TupleSpace {
    pub fn new(num_udts: usize) -> TupleSpace {
        TupleSpace {
            tuple_types: (0..num_udts).map(|_| TupleQueue::default()).collect(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Vm {
    /// Spawn `n` worker VMs (capped at [`MAX_WORKERS`]) sharing the read-only
    /// blob and a fresh tuple space sized by the blob's UDT count. Each worker
    /// runs the same program from its entry point.
    pub fn start_workers(&mut self, sp: StackPtr, n: i64) {
        if self.is_worker {
            self.error(sp, "workers can't start more worker threads".to_string());
        }
        if self.tuple_space.is_some() {
            self.error(sp, "workers already running".to_string());
        }
        let n = n.min(MAX_WORKERS);
        let space = Arc::new(TupleSpace::new(self.bcf().num_udts()));
        self.tuple_space = Some(space.clone());
        for _ in 0..n {
            // Each worker owns all its own memory and is completely
            // independent; only blob, registry and tuple space are shared.
            let mut wargs: VmArgs = self.args.clone();
            wargs.program_args.clear();
            wargs.trace = crate::dispatch::TraceMode::Off;
            let wspace = space.clone();
            self.worker_threads.push(std::thread::spawn(move || {
                let mut vm = Vm::new(wargs);
                vm.is_worker = true;
                vm.tuple_space = Some(wspace);
                if let Err(e) = vm.eval_program() {
                    log::error!("worker error: {}", e);
                }
            }));
        }
    }

    /// Shut the tuple space down and join every worker. Blocked readers
    /// observe `alive == false` and return nil.
    pub fn terminate_workers(&mut self) {
        if self.is_worker {
            return;
        }
        let Some(space) = self.tuple_space.take() else {
            return;
        };
        space.alive.store(false, Ordering::Release);
        for tt in space.tuple_types.iter() {
            tt.cond.notify_all();
        }
        for h in self.worker_threads.drain(..) {
            let _ = h.join();
        }
    }

    /// Deep-copy a scalar-only class instance into its type's queue and wake
    /// one waiter. Does not consume the caller's reference.
    pub fn worker_write(&mut self, sp: StackPtr, v: Value) {
        let Some(space) = self.tuple_space.clone() else {
            return;
        };
        let p = v.rptr_nil();
        if p.is_null() {
            self.error(sp, "thread write: nil reference".to_string());
        }
        // Safety: live object.
        let tti = unsafe { (*p).tti };
        let bcf = self.args.bcf.clone();
        let ti = type_info(bcf.type_table(), tti);
        if ti.kind() != ValueKind::Class {
            self.error(sp, "thread write: must be a class".to_string());
        }
        let len = ti.len() as usize;
        let structidx = ti.structidx() as usize;
        let mut row = Vec::with_capacity(len);
        for i in 0..len {
            let ek = type_info(bcf.type_table(), ti.elem_type(i)).kind();
            if ek.is_ref_nil() {
                self.error(
                    sp,
                    "thread write: only scalar class members supported for now".to_string(),
                );
            }
            // Safety: field index within the class arity.
            row.push(unsafe { OObject::at(p as *mut OObject, i) });
        }
        let tt = &space.tuple_types[structidx];
        {
            tt.queue.lock().push_back(TupleRow(row.into_boxed_slice()));
        }
        tt.cond.notify_one();
    }

    /// Block until a row of the given class type arrives, then materialize a
    /// fresh object from it. Returns null once the space is shut down.
    pub fn worker_read(&mut self, sp: StackPtr, tti: TypeIdx) -> *mut OObject {
        let bcf = self.args.bcf.clone();
        let ti = type_info(bcf.type_table(), tti);
        if ti.kind() != ValueKind::Class {
            self.error(sp, "thread read: must be a class type".to_string());
        }
        let Some(space) = self.tuple_space.clone() else {
            self.error(sp, "thread read: no workers running".to_string());
        };
        let structidx = ti.structidx() as usize;
        let tt = &space.tuple_types[structidx];
        let row = {
            let mut q = tt.queue.lock();
            tt.cond
                .wait_while(&mut q, |q| space.is_alive() && q.is_empty());
            q.pop_front()
        };
        let Some(row) = row else {
            return std::ptr::null_mut();
        };
        let o = self.heap.new_object(tti);
        // Safety: fresh object of the row's class; scalar fields, no incs.
        unsafe { self.heap.object_init(o, &row.0, false) };
        o
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo_order() {
        let space = TupleSpace::new(1);
        let tt = &space.tuple_types[0];
        for i in 0..3 {
            tt.queue
                .lock()
                .push_back(TupleRow(vec![Value::int(i)].into_boxed_slice()));
        }
        for i in 0..3 {
            let row = tt.queue.lock().pop_front().unwrap();
            assert_eq!(row.0[0].ival(), i);
        }
    }

    #[test]
    fn test_shutdown_wakes_blocked_reader() {
        let space = Arc::new(TupleSpace::new(1));
        let reader = {
            let space = space.clone();
            std::thread::spawn(move || {
                let tt = &space.tuple_types[0];
                let mut q = tt.queue.lock();
                tt.cond.wait_while(&mut q, |q| space.is_alive() && q.is_empty());
                q.pop_front().is_none()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        space.alive.store(false, Ordering::Release);
        space.tuple_types[0].cond.notify_all();
        assert!(reader.join().unwrap());
    }
}
