//! Opal bytecode: the compiled-program side of the runtime.
//!
//! This crate owns everything that is decided at compile time and merely
//! *read* at run time:
//!
//! - The instruction set: opcodes, signature families, arity table and the
//!   stream parser ([`instruction`])
//! - The flat type table and its decoded views ([`typetable`])
//! - The bytecode blob: a verified, sectioned word stream with zero-copy
//!   access on little-endian hosts ([`file`])
//! - A blob writer for tests and host tooling ([`builder`])
//!
//! The VM and the native-source transpiler both consume these views; neither
//! ever mutates a loaded blob.

pub mod builder;
pub mod file;
pub mod instruction;
pub mod typetable;

pub use builder::BytecodeBuilder;
pub use file::{BytecodeFile, LoadError, BYTECODE_FORMAT_VERSION, BYTECODE_MAGIC};
pub use instruction::{
    parse_op, read_funstart, CorruptOp, FunStartInfo, OpFamily, Opcode, ParsedOp, ILUNKNOWN,
};
pub use typetable::{
    type_info, TypeIdx, TypeInfo, ValueKind, TYPE_ELEM_ANY, TYPE_ELEM_FLOAT, TYPE_ELEM_INT,
    TYPE_ELEM_STACKFRAMEBUF, TYPE_ELEM_STRING, TYPE_ELEM_VALUEBUF, TYPE_ELEM_VECTOR_OF_FLOAT,
    TYPE_ELEM_VECTOR_OF_INT,
};
