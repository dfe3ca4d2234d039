//! In-process diagnostic library for native Linux programs.
//!
//! `detective` is loaded into the target process (usually as
//! `libdetective.so`), rewrites the PLT of registered objects so that
//! allocator and mutex calls land in its own wrappers, and reports
//! unreleased allocations and potential lock-order deadlocks on demand.
//!
//! The C ABI driver surface lives in [`ffi`]; everything else is the
//! machinery behind it.

#[macro_use]
extern crate lazy_static;

pub mod consts;
pub mod errors;
pub mod ffi;
pub mod image;
pub mod lock;
pub mod memory;
pub mod output;
pub mod patch;
pub mod proc;
pub mod report;
pub mod stack;
