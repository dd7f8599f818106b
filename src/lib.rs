//! Guest/host bridge runtime
//!
//! Lets guest code hold live references to host objects, call into the host
//! and be called back, carry host exceptions across the boundary, schedule
//! continuations on the host event loop and hand objects between worker
//! threads. Built as an rlib for tests and as a static library for linking
//! into generated glue.

pub mod runtime;

pub use runtime::*;

#[cfg(test)]
mod tests;
