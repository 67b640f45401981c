/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use phvslice::fuzzing::action::{check, TestCase};
use phvslice::fuzzing::fuzz_target;

fuzz_target!(|testcase: TestCase| {
    let _ = env_logger::try_init();
    log::trace!("spec: {:?}", testcase.spec);
    check(&testcase);
});
