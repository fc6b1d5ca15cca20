//! The Opal virtual machine.
//!
//! Execution enters through a compiled or jitted entry function and runs as a
//! chain of calls into the per-opcode helper library; there is no interpreter
//! loop. This crate owns:
//!
//! - The VM instance: operand stack, globals, call frames, function
//!   entry/exit discipline and the top-level loop ([`vm`])
//! - The opcode helper library the transpiled code targets ([`ops`])
//! - The `extern "C-unwind"` trampolines and trace modes ([`dispatch`])
//! - Error composition and the single unwind site ([`error`])
//! - The native-function registry ([`natives`])
//! - The cross-worker tuple space ([`workers`])
//!
//! A VM instance is strictly single-threaded; parallelism is N instances
//! exchanging immutable record snapshots through the tuple space.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod dispatch;
pub mod error;
pub mod natives;
pub mod ops;
pub mod stack;
pub mod vm;
pub mod workers;

pub use dispatch::TraceMode;
pub use error::RuntimeError;
pub use natives::{default_registry, NativeFun, NativeRegistry};
pub use vm::{
    FrameRecord, FunBase, StackPtr, Vm, VmArgs, DEF_MAX_STACK_SIZE, INIT_STACK_SIZE, STACK_MARGIN,
};
pub use workers::TupleSpace;
