//! Specializing C code generator for Cinder CPU descriptions
//!
//! Takes a parsed [`cinder_dsl::Program`] and emits a C interpreter for
//! the described CPU: one specialized function (or labeled block) per
//! concrete opcode, with fields carried in the opcode constant-folded into
//! literals, synthesized flag updates, and a dispatch table plus `execute`
//! entry point. A companion header with the guest context record is
//! written separately.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod blocks;
mod emit;
mod flags;
mod generator;
mod header;
mod ops;
mod scope;

pub mod error;

pub use error::{Error, Result};
pub use generator::{Dispatch, Generator, Param};
pub use ops::{op_spec, Eval, OpKind, OpSpec};
