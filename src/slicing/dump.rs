/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Debugging output.

use super::{SearchState, SlicingIterator};
use crate::Program;

impl<'a, P: Program> SlicingIterator<'a, P> {
    pub(super) fn dump_state(&self, state: &SearchState) {
        log::info!("Unsettled super-clusters:");
        for (i, sc) in state.todo.iter().enumerate() {
            log::info!("todo{}: {:?}", i, sc);
        }
        log::info!("Settled super-clusters:");
        for (i, sc) in state.done.iter().enumerate() {
            log::info!("done{}:", i);
            for list in sc.lists() {
                log::info!(" * {:?} ({} bits)", list, list.width());
            }
        }
        log::info!("Constraints:");
        for (slice, c) in state.constraints.iter() {
            log::info!(" * {}: {}", slice, c);
        }
        log::info!(
            "Stats: {} steps, {} solver calls, {} backtracks",
            self.stats.steps,
            self.stats.solver_calls,
            self.stats.backtracks
        );
    }
}
