/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Depth-first slicing search.
//!
//! The search state is a worklist of super-clusters that still hold an
//! unsettled slice list, the super-clusters that are already settled, and
//! the container-size constraints decided so far. Each step picks one
//! unsettled list, cuts it for one container size, prunes the resulting
//! node, and descends. States are shared between frames through `Rc`, so
//! backtracking is dropping a frame.
//!
//! The caller may report that a list from a solution could not be
//! allocated through `SlicingIterator::invalidate`. The search also does
//! this itself whenever the packing validator blames a list. A list that
//! keeps being invalidated unwinds the stack to the frame whose choice
//! created it.

use crate::cluster::{
    check_settled_list, split_super_cluster, SliceList, SliceListIndex, SplitSchema,
    SuperCluster,
};
use crate::pack::{PackingFailure, PackingValidator};
use crate::{ContainerSize, FxHashMap, FxHashSet, Program, SlicingError, SlicingOptions};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

mod constraint;
mod dump;
mod heuristics;
mod presplit;
mod prune;

pub use constraint::{AfterSplitConstraint, Constraints};
pub(crate) use constraint::{constraint_of, narrow};
pub use heuristics::{BoundaryAwareChooser, ChooseCut, Cut, GreedyPickNext, PickNext};
pub use prune::Prune;

/// Search statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub steps: usize,
    pub splits: usize,
    pub split_failures: usize,
    pub prune_structure: usize,
    pub prune_constraints: usize,
    pub prune_metadata: usize,
    pub prune_pack_conflict: usize,
    pub prune_packing: usize,
    pub solver_calls: usize,
    pub backtracks: usize,
    pub invalidations: usize,
    pub unwinds: usize,
    pub retries: usize,
    pub solutions: usize,
}

/// One complete slicing: every super-cluster is settled.
#[derive(Clone, Debug)]
pub struct Solution {
    pub clusters: Vec<SuperCluster>,
    /// The container sizes decided along the way.
    pub constraints: Constraints,
}

/// A search node.
#[derive(Clone, Debug)]
pub(crate) struct SearchState {
    /// Super-clusters with at least one unsettled list.
    pub(crate) todo: Vec<Rc<SuperCluster>>,
    pub(crate) done: Vec<Rc<SuperCluster>>,
    pub(crate) constraints: Rc<Constraints>,
}

impl SearchState {
    fn new<P: Program>(scs: Vec<SuperCluster>, constraints: Constraints, program: &P) -> Self {
        let mut state = SearchState {
            todo: Vec::new(),
            done: Vec::new(),
            constraints: Rc::new(constraints),
        };
        state.add(scs, program);
        state
    }

    fn add<P: Program>(&mut self, scs: Vec<SuperCluster>, program: &P) {
        for sc in scs {
            if is_settled(program, &sc) {
                self.done.push(Rc::new(sc));
            } else {
                self.todo.push(Rc::new(sc));
            }
        }
    }

    fn all(&self) -> impl Iterator<Item = &SuperCluster> {
        self.todo.iter().chain(self.done.iter()).map(|sc| &**sc)
    }

    fn solution(&self) -> Solution {
        let mut clusters: Vec<SuperCluster> = self.done.iter().map(|sc| (**sc).clone()).collect();
        clusters.sort_by_key(|sc| sc.lists()[SliceListIndex::new(0)].head());
        Solution {
            clusters,
            constraints: (*self.constraints).clone(),
        }
    }
}

fn is_settled<P: Program>(program: &P, sc: &SuperCluster) -> bool {
    sc.lists()
        .iter()
        .all(|l| check_settled_list(program, l).is_ok())
}

/// A settled list is never cut again, so its slices, and the slices
/// rotated with them, need a container at least as wide as the list.
/// Returns false if that contradicts an earlier decision.
fn narrow_settled<P: Program>(program: &P, sc: &SuperCluster, constraints: &mut Constraints) -> bool {
    for list in sc.lists().iter().filter(|l| !l.is_exact(program)) {
        let min = match ContainerSize::round_up(list.width()) {
            Some(size) => AfterSplitConstraint::Min(size),
            None => continue,
        };
        for &slice in list.slices() {
            let ok = core::iter::once(slice)
                .chain(sc.co_rotated(slice))
                .all(|s| narrow(constraints, s, min));
            if !ok {
                trace!("slicing: {} needs at least {}", slice, min);
                return false;
            }
        }
    }
    true
}

/// A point in the search tree where a list is being cut.
struct Frame {
    state: Rc<SearchState>,
    /// The super-cluster of `state.todo` and the list within it.
    sc: usize,
    list: SliceListIndex,
    choices: Vec<heuristics::Cut>,
    next: usize,
    /// Lists created by the choice currently being explored.
    produced: FxHashSet<SliceList>,
}

/// Lazily enumerates the complete slicings of a super-cluster.
pub struct SlicingIterator<'a, P: Program> {
    program: &'a P,
    options: SlicingOptions,
    input: SuperCluster,
    picker: Box<dyn PickNext<P> + 'a>,
    chooser: Box<dyn ChooseCut<P> + 'a>,
    validator: PackingValidator<'a, P>,
    stack: Vec<Frame>,
    /// A node that passed pruning and waits to be expanded.
    pending: Option<Rc<SearchState>>,
    invalidations: FxHashMap<SliceList, usize>,
    unwind_to: Option<SliceList>,
    steps: usize,
    retried: bool,
    exhausted: bool,
    stats: Stats,
    last_failure: Option<PackingFailure>,
}

impl<'a, P: Program> SlicingIterator<'a, P> {
    /// Start a search with the default orderings.
    pub fn new(
        program: &'a P,
        sc: SuperCluster,
        options: SlicingOptions,
    ) -> Result<Self, SlicingError> {
        Self::with_strategies(program, sc, options, GreedyPickNext, BoundaryAwareChooser)
    }

    /// Start a search with custom list and cut orderings.
    pub fn with_strategies<N, C>(
        program: &'a P,
        sc: SuperCluster,
        options: SlicingOptions,
        picker: N,
        chooser: C,
    ) -> Result<Self, SlicingError>
    where
        N: PickNext<P> + 'a,
        C: ChooseCut<P> + 'a,
    {
        sc.check_well_formed(program)?;
        let (scs, constraints) = presplit::presplit(program, &sc, false)?;
        let mut it = SlicingIterator {
            program,
            options,
            input: sc,
            picker: Box::new(picker),
            chooser: Box::new(chooser),
            validator: PackingValidator::new(program, &options),
            stack: Vec::new(),
            pending: None,
            invalidations: FxHashMap::default(),
            unwind_to: None,
            steps: 0,
            retried: false,
            exhausted: false,
            stats: Stats::default(),
            last_failure: None,
        };
        it.start(scs, constraints);
        Ok(it)
    }

    fn start(&mut self, scs: Vec<SuperCluster>, constraints: Constraints) {
        let root = SearchState::new(scs, constraints, self.program);
        trace!(
            "slicing: root with {} unsettled and {} settled super-clusters",
            root.todo.len(),
            root.done.len()
        );
        self.stack.clear();
        self.steps = 0;
        match self.prune(&root) {
            Ok(()) => self.pending = Some(Rc::new(root)),
            Err(p) => {
                log::debug!("slicing: root node rejected: {}", p);
                self.pending = None;
                self.exhausted = !self.retry();
            }
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The most recent packing failure seen by the search. When the
    /// search ends without a solution this names the list and action that
    /// could not be synthesized.
    pub fn last_failure(&self) -> Option<&PackingFailure> {
        self.last_failure.as_ref()
    }

    /// Report that `list` could not be used. Each list's first
    /// `max_ignored_invalidations` reports are absorbed by ordinary
    /// backtracking; after that, with smart backtracking, the search
    /// abandons the choice that created the list.
    pub fn invalidate(&mut self, list: &SliceList) {
        self.stats.invalidations += 1;
        let count = self.invalidations.entry(list.clone()).or_insert(0);
        *count += 1;
        trace!("slicing: invalidate {:?} ({} times)", list, count);
        if self.options.smart_backtracking && *count > self.options.max_ignored_invalidations {
            *count = 0;
            self.unwind_to = Some(list.clone());
        }
    }

    /// Call `f` on each solution until it returns false or the search
    /// ends. Returns the number of solutions seen.
    pub fn for_each_solution<F: FnMut(&Solution) -> bool>(&mut self, mut f: F) -> usize {
        let mut n = 0;
        while let Some(solution) = self.next() {
            n += 1;
            if !f(&solution) {
                break;
            }
        }
        n
    }

    fn unwind(&mut self, list: &SliceList) {
        let frame = self.stack.iter().rposition(|f| f.produced.contains(list));
        if let Some(i) = frame {
            trace!(
                "slicing: unwinding {} frames to the one that produced {:?}",
                self.stack.len() - 1 - i,
                list
            );
            self.stack.truncate(i + 1);
            self.pending = None;
            self.stats.unwinds += 1;
        }
    }

    /// Retry once from scratch with wide fields pre-split, if no solution
    /// has been found yet.
    fn retry(&mut self) -> bool {
        if self.retried || self.stats.solutions > 0 {
            return false;
        }
        self.retried = true;
        self.stats.retries += 1;
        log::info!(
            "slicing: no solution after {} steps, retrying with wide fields pre-split",
            self.steps
        );
        match presplit::presplit(self.program, &self.input, true) {
            Ok((scs, constraints)) => {
                self.start(scs, constraints);
                !self.exhausted
            }
            Err(e) => {
                log::debug!("slicing: wide pre-split failed: {}", e);
                false
            }
        }
    }

    fn push_frame(&mut self, state: Rc<SearchState>) {
        let mut candidates: Vec<(usize, SliceListIndex, &SliceList)> = Vec::new();
        for (i, sc) in state.todo.iter().enumerate() {
            for (li, list) in sc.lists().enumerate() {
                if check_settled_list(self.program, list).is_err() {
                    candidates.push((i, li, list));
                }
            }
        }
        let lists: Vec<&SliceList> = candidates.iter().map(|c| c.2).collect();
        let pick = self.picker.pick(self.program, &state.constraints, &lists);
        let (sc, list, chosen) = candidates[pick];
        let choices = self
            .chooser
            .choices(self.program, &state.constraints, chosen, &self.options);
        trace!(
            "slicing: depth {} cut {:?} with {} choices",
            self.stack.len(),
            chosen,
            choices.len()
        );
        let frame = Frame {
            state: state.clone(),
            sc,
            list,
            choices,
            next: 0,
            produced: FxHashSet::default(),
        };
        self.stack.push(frame);
    }

    /// Apply `cut` to the top frame's list and prune the result.
    fn expand(&mut self, cut: &heuristics::Cut) -> Option<(SearchState, FxHashSet<SliceList>)> {
        let frame = self.stack.last()?;
        let state = frame.state.clone();
        let list_index = frame.list;
        let sc = state.todo[frame.sc].clone();
        let todo_index = frame.sc;
        let list = sc.lists()[list_index].clone();

        let mut schema = SplitSchema::new();
        schema.insert(list_index, cut.offsets.clone());
        self.stats.splits += 1;
        let result = match split_super_cluster(self.program, &sc, &schema) {
            Ok(result) => result,
            Err(e) => {
                trace!("slicing: split failed: {}", e);
                self.stats.split_failures += 1;
                return None;
            }
        };

        let mut constraints = (*state.constraints).clone();
        for (old, pieces) in &result.replaced {
            if let Some(c) = constraints.remove(old) {
                for &piece in pieces {
                    constraints.insert(piece, c);
                }
            }
        }

        // The first piece (or every piece) goes into a container of the
        // chosen size, and so do the slices rotated with it.
        let first = cut.first();
        let decided = AfterSplitConstraint::Exact(cut.size);
        for (slice, offset) in list.with_offsets() {
            for piece in result.pieces(slice) {
                let at = offset + (piece.lo() - slice.lo());
                if at >= first && !cut.homogeneous {
                    continue;
                }
                let owner = match result.clusters.iter().find(|c| c.contains(piece)) {
                    Some(owner) => owner,
                    None => panic!("piece {} of {} is in no super-cluster", piece, slice),
                };
                let ok = core::iter::once(piece)
                    .chain(owner.co_rotated(piece))
                    .all(|s| narrow(&mut constraints, s, decided));
                if !ok {
                    trace!("slicing: {} cannot also be {}", piece, cut.size);
                    self.stats.prune_constraints += 1;
                    return None;
                }
            }
        }

        for settled in result.clusters.iter().filter(|c| is_settled(self.program, c)) {
            if !narrow_settled(self.program, settled, &mut constraints) {
                self.stats.prune_constraints += 1;
                return None;
            }
        }

        let old_lists: FxHashSet<&SliceList> = sc.lists().iter().collect();
        let produced: FxHashSet<SliceList> = result
            .clusters
            .iter()
            .flat_map(|c| c.lists().iter())
            .filter(|l| !old_lists.contains(l))
            .cloned()
            .collect();

        let mut child = SearchState {
            todo: state
                .todo
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != todo_index)
                .map(|(_, sc)| sc.clone())
                .collect(),
            done: state.done.clone(),
            constraints: Rc::new(constraints),
        };
        child.add(result.clusters, self.program);

        match self.prune(&child) {
            Ok(()) => Some((child, produced)),
            Err(p) => {
                trace!("slicing: pruned: {}", p);
                None
            }
        }
    }
}

impl<'a, P: Program> Iterator for SlicingIterator<'a, P> {
    type Item = Solution;

    fn next(&mut self) -> Option<Solution> {
        loop {
            if self.exhausted {
                return None;
            }
            if let Some(list) = self.unwind_to.take() {
                self.unwind(&list);
            }

            if let Some(state) = self.pending.take() {
                if state.todo.is_empty() {
                    self.stats.solutions += 1;
                    log::debug!(
                        "slicing: solution {} after {} steps",
                        self.stats.solutions,
                        self.steps
                    );
                    if self.options.verbose_log {
                        self.dump_state(&state);
                    }
                    return Some(state.solution());
                }
                self.push_frame(state);
                continue;
            }

            let frame = match self.stack.last_mut() {
                Some(frame) => frame,
                None => {
                    log::debug!(
                        "slicing: search exhausted with {} solutions",
                        self.stats.solutions
                    );
                    self.exhausted = true;
                    continue;
                }
            };
            if frame.next == frame.choices.len() {
                self.stack.pop();
                self.stats.backtracks += 1;
                continue;
            }
            let cut = frame.choices[frame.next].clone();
            frame.next += 1;
            frame.produced.clear();

            if self.steps >= self.options.max_search_steps {
                log::debug!("slicing: step budget of {} exhausted", self.options.max_search_steps);
                if !self.retry() {
                    self.exhausted = true;
                }
                continue;
            }
            self.steps += 1;
            self.stats.steps += 1;

            if let Some((child, produced)) = self.expand(&cut) {
                if let Some(frame) = self.stack.last_mut() {
                    frame.produced = produced;
                }
                self.pending = Some(Rc::new(child));
            }
        }
    }
}
