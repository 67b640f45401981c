/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Test-case generators for the fuzz targets.

pub mod action;
pub mod slicing;

pub use libfuzzer_sys::{arbitrary, fuzz_target};
