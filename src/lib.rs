//! Memory and concurrency runtime core for a dynamically-typed
//! Lisp-family language: regions, transmigration, the store barrier,
//! components, fibers, channels and atoms.
//!
//! Layered leaves-first, L0 through L8, plus the ambient `runtime` and
//! `ffi` modules binding it all together for embedders.

pub mod atom;
pub mod barrier;
pub mod channel;
pub mod component;
pub mod constructors;
pub mod fiber;
pub mod ffi;
pub mod refcount;
pub mod region;
pub mod runtime;
pub mod transmigrate;
pub mod value;
