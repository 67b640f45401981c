/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use phvslice::fuzzing::fuzz_target;
use phvslice::fuzzing::slicing::{check, TestCase};

fuzz_target!(|testcase: TestCase| {
    let _ = env_logger::try_init();
    log::trace!("program:\n{:?}", testcase.program);
    check(&testcase);
});
