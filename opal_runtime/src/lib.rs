//! Opal runtime: the mutable half of the core.
//!
//! This crate provides:
//! - The tagged word-size cell ([`value::Value`]); the tag is carried in
//!   debug builds and elided in release builds, where the static type plan
//!   makes it redundant
//! - Refcounted heap objects: strings, vectors, user objects and host
//!   resources, all starting with a common header ([`object`])
//! - The pooled allocator with a live-allocation index, leak enumeration and
//!   pointer probing for the error dumper ([`pool`])
//! - The heap: typed constructors, structural inc/dec, the delayed-delete
//!   queue and the leak report ([`heap`])
//! - Cycle-safe value stringification ([`print`])
//!
//! Everything here is owned by exactly one VM instance; nothing is shared
//! across threads.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod heap;
pub mod object;
pub mod pool;
pub mod print;
pub mod value;

pub use heap::Heap;
pub use object::{OObject, OResource, OString, OVector, RefHeader, ResourceType};
pub use pool::{Pool, SMALL_OBJECT_MAX};
pub use print::PrintPrefs;
pub use value::Value;
