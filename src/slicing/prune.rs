/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Pruning predicates applied to every search node.

use super::{constraint_of, SearchState, SlicingIterator};
use crate::cluster::{check_settled_list, ClusterError, SliceList};
use crate::pack::PackingFailure;
use crate::{FieldSlice, Program};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;

/// Why a search node was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prune {
    /// A super-cluster violates a structural invariant.
    Structure(ClusterError),
    /// The decided container sizes of a list's slices cannot all hold.
    Constraint(FieldSlice),
    /// A metadata list is rotated with exact lists of different widths.
    Metadata(FieldSlice),
    /// Two conflicting slices share a list that can no longer be split.
    PackConflict(FieldSlice, FieldSlice),
    /// An action writing the lists cannot be synthesized.
    Packing(PackingFailure),
}

impl fmt::Display for Prune {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Prune::Structure(e) => write!(f, "{}", e),
            Prune::Constraint(s) => write!(f, "container sizes of the list at {} disagree", s),
            Prune::Metadata(s) => {
                write!(f, "metadata list at {} joins exact lists of different widths", s)
            }
            Prune::PackConflict(a, b) => write!(f, "{} and {} cannot share a container", a, b),
            Prune::Packing(failure) => write!(f, "{}", failure),
        }
    }
}

/// Do the decided sizes of the list's slices leave room for the list?
fn check_room<P: Program>(
    program: &P,
    state: &SearchState,
    list: &SliceList,
    settled: bool,
) -> Result<(), Prune> {
    let sizes: BTreeSet<_> = list
        .slices()
        .iter()
        .filter_map(|&s| constraint_of(&state.constraints, s).decided())
        .collect();
    if settled && sizes.len() > 1 {
        return Err(Prune::Constraint(list.head()));
    }
    let width = list.width();
    let exact = list.is_exact(program);
    for size in sizes {
        let fits = match (settled, exact) {
            (true, true) => width == size.bits(),
            (true, false) => width <= size.bits(),
            (false, true) => width >= size.bits(),
            (false, false) => true,
        };
        if !fits {
            return Err(Prune::Constraint(list.head()));
        }
    }
    Ok(())
}

impl<'a, P: Program> SlicingIterator<'a, P> {
    /// Run every pruning predicate on `state`, recording the outcome.
    pub(super) fn prune(&mut self, state: &SearchState) -> Result<(), Prune> {
        let result = self.check_node(state);
        if let Err(p) = &result {
            match p {
                Prune::Structure(_) => self.stats.prune_structure += 1,
                Prune::Constraint(_) => self.stats.prune_constraints += 1,
                Prune::Metadata(_) => self.stats.prune_metadata += 1,
                Prune::PackConflict(..) => self.stats.prune_pack_conflict += 1,
                Prune::Packing(failure) => {
                    self.stats.prune_packing += 1;
                    self.last_failure = Some(failure.clone());
                    self.invalidate(&failure.list);
                }
            }
        }
        result
    }

    fn check_node(&mut self, state: &SearchState) -> Result<(), Prune> {
        for sc in &state.todo {
            sc.check_well_formed(self.program).map_err(Prune::Structure)?;
        }
        for sc in &state.done {
            sc.check_settled(self.program).map_err(Prune::Structure)?;
        }

        let mut settled: Vec<&SliceList> = Vec::new();
        let mut unsettled: Vec<&SliceList> = Vec::new();
        for sc in state.all() {
            for list in sc.lists() {
                let is_settled = check_settled_list(self.program, list).is_ok();
                check_room(self.program, state, list, is_settled)?;
                if is_settled {
                    self.check_pack_conflicts(list)?;
                    settled.push(list);
                } else {
                    unsettled.push(list);
                }

                if list.slices().iter().any(|s| self.program.field(s.field).metadata) {
                    let widths: BTreeSet<u32> = list
                        .slices()
                        .iter()
                        .flat_map(|&s| sc.co_rotated(s))
                        .map(|t| sc.list_of(t))
                        .filter(|l| l.is_exact(self.program) && check_settled_list(self.program, l).is_ok())
                        .map(|l| l.width())
                        .collect();
                    if widths.len() > 1 {
                        return Err(Prune::Metadata(list.head()));
                    }
                }
            }
        }

        let result = self
            .validator
            .validate(&settled, &unsettled, &state.constraints)
            .map_err(Prune::Packing);
        self.stats.solver_calls = self.validator.solver_calls();
        result
    }

    fn check_pack_conflicts(&self, list: &SliceList) -> Result<(), Prune> {
        let slices = list.slices();
        for (i, &a) in slices.iter().enumerate() {
            for &b in &slices[i + 1..] {
                if self.program.has_pack_conflict(a, b) {
                    return Err(Prune::PackConflict(a, b));
                }
            }
        }
        Ok(())
    }
}
