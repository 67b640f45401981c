/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Packing validator.
//!
//! While the search is still running no container has been chosen, but
//! the actions that write a group of slice lists may already be
//! impossible to synthesize. The validator speculates a container for
//! each list and asks the solver whether every action stays expressible.
//!
//! Settled lists get a speculated container size: the width of an exact
//! list, a size the search already decided for one of its slices, or the
//! size shared by the lists it is moved to and from. Lists whose size
//! cannot be pinned down this way are not checked. Lists that can still
//! be split are cut into bytes, the only packing that survives any
//! further split, and each byte is checked on its own in an 8-bit
//! container.
//!
//! For every action writing a checked unit, each start offset the unit
//! may take in its container is tried. Another list with a single possible
//! offset is placed there. One with several is guessed to start at the
//! same offset as the unit, and sources with no speculated container
//! become unallocated operands. If no offset works, the action is solved
//! once more with the guessed and unallocated sources dropped before the
//! unit is blamed, so that a guess about another list is never the only
//! reason for a failure.

use crate::action::{solve, ActionError, Assign, ContainerSpec, Operand, SolverOptions};
use crate::bitvec::BitSet;
use crate::cluster::{list_start_alignment, SliceList};
use crate::slicing::{constraint_of, Constraints};
use crate::unionfind::UnionFind;
use crate::{
    ActionId, BitRange, Container, ContainerSize, FieldId, FieldSlice, FxHashMap, Program,
    SlicingOptions, SourceOp, SourceOperand, WriteKind,
};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

/// The list and action blamed for an unsynthesizable packing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackingFailure {
    pub list: SliceList,
    pub action: ActionId,
    pub error: ActionError,
}

impl fmt::Display for PackingFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "action {} cannot write slice list {:?}: {}",
            self.action, self.list, self.error
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PackingFailure {}

define_index!(UnitIndex);

/// A list (or one byte of an unsettled list) checked as one container.
struct Unit<'l> {
    list: SliceList,
    /// The list reported on failure.
    origin: &'l SliceList,
    settled: bool,
    size: Option<ContainerSize>,
}

/// One write into a unit: the written slice of the unit, its offset in
/// the unit, and the operation.
struct UnitWrite {
    slice: FieldSlice,
    offset: u32,
    op: SourceOp,
}

/// Where each field slice of the checked units lives.
struct Locator {
    by_field: FxHashMap<FieldId, Vec<(FieldSlice, UnitIndex, u32)>>,
}

impl Locator {
    fn new(units: &[Unit]) -> Locator {
        let mut by_field: FxHashMap<FieldId, Vec<(FieldSlice, UnitIndex, u32)>> =
            FxHashMap::default();
        for (i, unit) in units.iter().enumerate() {
            for (slice, offset) in unit.list.with_offsets() {
                by_field
                    .entry(slice.field)
                    .or_default()
                    .push((slice, UnitIndex::new(i), offset));
            }
        }
        Locator { by_field }
    }

    /// The placed slices overlapping `src`.
    fn overlapping(&self, src: FieldSlice) -> impl Iterator<Item = &(FieldSlice, UnitIndex, u32)> {
        self.by_field
            .get(&src.field)
            .into_iter()
            .flatten()
            .filter(move |(t, _, _)| t.range.overlaps(src.range))
    }
}

/// Checks that the actions writing a set of slice lists stay
/// synthesizable under some packing.
pub struct PackingValidator<'a, P: Program> {
    program: &'a P,
    solver: SolverOptions,
    loose: bool,
    solver_calls: usize,
}

impl<'a, P: Program> PackingValidator<'a, P> {
    pub fn new(program: &'a P, options: &SlicingOptions) -> Self {
        PackingValidator {
            program,
            solver: SolverOptions::from(options),
            loose: options.loose_action_packing,
            solver_calls: 0,
        }
    }

    /// Number of solver invocations so far.
    pub fn solver_calls(&self) -> usize {
        self.solver_calls
    }

    /// Check `settled` lists, which will not be split further, and
    /// `unsettled` lists, which still may be.
    pub fn validate(
        &mut self,
        settled: &[&SliceList],
        unsettled: &[&SliceList],
        constraints: &Constraints,
    ) -> Result<(), PackingFailure> {
        let mut units: Vec<Unit> = settled
            .iter()
            .map(|&list| Unit {
                list: list.clone(),
                origin: list,
                settled: true,
                size: None,
            })
            .collect();
        if !self.loose {
            for &list in unsettled {
                for piece in byte_pieces(list) {
                    units.push(Unit {
                        list: piece,
                        origin: list,
                        settled: false,
                        size: Some(ContainerSize::B8),
                    });
                }
            }
        }
        let locator = Locator::new(&units);
        let writes: Vec<BTreeMap<ActionId, Vec<UnitWrite>>> =
            units.iter().map(|u| self.unit_writes(&u.list)).collect();
        self.speculate_sizes(&mut units, &writes, &locator, constraints);

        let offsets: Vec<SmallVec<[u32; 8]>> = units
            .iter()
            .map(|unit| match unit.size {
                Some(size) => self.offsets(&unit.list, size),
                None => {
                    trace!("pack: no size for {:?}, only sources counted", unit.list);
                    SmallVec::new()
                }
            })
            .collect();
        let layout = Layout {
            units: &units,
            locator: &locator,
            offsets: &offsets,
        };
        for i in 0..units.len() {
            for (&action, unit_writes) in &writes[i] {
                self.check_action(&layout, UnitIndex::new(i), action, unit_writes)?;
            }
        }
        Ok(())
    }

    fn unit_writes(&self, list: &SliceList) -> BTreeMap<ActionId, Vec<UnitWrite>> {
        let mut out: BTreeMap<ActionId, Vec<UnitWrite>> = BTreeMap::new();
        for (slice, offset) in list.with_offsets() {
            for (action, ops) in self.program.sources(slice) {
                let entry = out.entry(action).or_default();
                entry.extend(ops.into_iter().map(|op| UnitWrite { slice, offset, op }));
            }
        }
        out
    }

    /// Give each settled unit a container size if the evidence agrees on
    /// one. Units joined by moves share their evidence.
    fn speculate_sizes(
        &self,
        units: &mut [Unit],
        writes: &[BTreeMap<ActionId, Vec<UnitWrite>>],
        locator: &Locator,
        constraints: &Constraints,
    ) {
        let mut uf: UnionFind<UnitIndex> = UnionFind::new(units.len());
        for (i, unit_writes) in writes.iter().enumerate() {
            if !units[i].settled {
                continue;
            }
            for w in unit_writes.values().flatten() {
                if let (WriteKind::Move, SourceOperand::Slice(src)) = (w.op.kind, w.op.source) {
                    for &(_, v, _) in locator.overlapping(src) {
                        if units[v.index()].settled {
                            uf.union(UnitIndex::new(i), v);
                        }
                    }
                }
            }
        }

        let mut evidence: BTreeMap<UnitIndex, BTreeSet<ContainerSize>> = BTreeMap::new();
        let mut widest: FxHashMap<UnitIndex, u32> = FxHashMap::default();
        for (i, unit) in units.iter().enumerate() {
            if !unit.settled {
                continue;
            }
            let root = uf.find(UnitIndex::new(i));
            let sizes = evidence.entry(root).or_default();
            if unit.list.is_exact(self.program) {
                if let Some(size) = ContainerSize::from_bits(unit.list.width()) {
                    sizes.insert(size);
                }
            }
            for &slice in unit.list.slices() {
                if let Some(size) = constraint_of(constraints, slice).decided() {
                    sizes.insert(size);
                }
            }
            let w = widest.entry(root).or_insert(0);
            *w = (*w).max(unit.list.width());
        }

        for (i, unit) in units.iter_mut().enumerate() {
            if !unit.settled {
                continue;
            }
            let root = uf.find(UnitIndex::new(i));
            let sizes = &evidence[&root];
            unit.size = match sizes.iter().next() {
                Some(&size) if sizes.len() == 1 && size.bits() >= widest[&root] => Some(size),
                _ => None,
            };
        }
    }

    /// Start offsets a list may take in a container of `size`.
    fn offsets(&self, list: &SliceList, size: ContainerSize) -> SmallVec<[u32; 8]> {
        let width = list.width();
        if width > size.bits() {
            return SmallVec::new();
        }
        if list.is_exact(self.program) {
            return smallvec::smallvec![0];
        }
        let pinned = list
            .with_offsets()
            .any(|(s, off)| off == 0 && s.lo() == 0 && self.program.field(s.field).bottom_bits);
        if pinned {
            return smallvec::smallvec![0];
        }
        let align = list_start_alignment(self.program, list);
        (0..=size.bits() - width)
            .filter(|o| align.map_or(true, |a| o % 8 == a))
            .collect()
    }

    fn check_action(
        &mut self,
        layout: &Layout,
        unit: UnitIndex,
        action: ActionId,
        writes: &[UnitWrite],
    ) -> Result<(), PackingFailure> {
        let units = layout.units;
        let blame = |error| PackingFailure {
            list: units[unit.index()].origin.clone(),
            action,
            error,
        };

        let sources = distinct_sources(layout.locator, unit, writes);
        if sources > 2 {
            trace!(
                "pack: {} writes {:?} from {} sources",
                action,
                units[unit.index()].list,
                sources
            );
            return Err(blame(ActionError::TooManySources));
        }
        let offsets = &layout.offsets[unit.index()];
        let size = match units[unit.index()].size {
            Some(size) if !offsets.is_empty() => size,
            _ => return Ok(()),
        };

        let mut first_error = None;
        for &offset in offsets {
            let query = self.build(layout, unit, size, offset, writes, false);
            self.solver_calls += 1;
            match solve(&query.spec, &query.assigns, &self.solver) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        for &offset in offsets {
            let query = self.build(layout, unit, size, offset, writes, true);
            if !query.dropped {
                continue;
            }
            if query.assigns.is_empty() {
                return Ok(());
            }
            self.solver_calls += 1;
            if solve(&query.spec, &query.assigns, &self.solver).is_ok() {
                trace!(
                    "pack: {} on {:?} only fits without guessed sources",
                    action,
                    units[unit.index()].list
                );
                return Ok(());
            }
        }
        let error = first_error.unwrap_or(ActionError::Unsat);
        trace!(
            "pack: {} cannot write {:?}: {}",
            action,
            units[unit.index()].list,
            error
        );
        Err(blame(error))
    }

    /// Build the destination and assignments for `writes` with the unit
    /// at `offset`. With `local_only`, guessed and unallocated sources are
    /// dropped, and so are the live bits they write.
    fn build(
        &self,
        layout: &Layout,
        unit: UnitIndex,
        size: ContainerSize,
        offset: u32,
        writes: &[UnitWrite],
        local_only: bool,
    ) -> Query {
        let units = layout.units;
        let dest = Container::normal(size, unit.raw_u32());
        let width = size.bits();
        let mut live = BitSet::new();
        for (slice, off) in units[unit.index()].list.with_offsets() {
            if self.program.is_referenced(slice.field) {
                live.insert_range((offset + off) as usize, slice.size() as usize);
            }
        }

        let mut assigns = Vec::new();
        let mut dropped = BitSet::new();
        for w in writes {
            let pos = offset + w.offset + (w.op.dst.lo() - w.slice.lo());
            let len = w.op.dst.size();
            match w.op.source {
                SourceOperand::ActionData => assigns.push(Assign::new(
                    BitRange::start_len(pos, len),
                    Operand::ActionData(BitRange::start_len(0, len)),
                    w.op.kind,
                )),
                SourceOperand::Constant(_) => assigns.push(Assign::new(
                    BitRange::start_len(pos, len),
                    Operand::Constant(BitRange::start_len(0, len)),
                    w.op.kind,
                )),
                SourceOperand::Slice(src) => {
                    let mut covered = BitSet::new();
                    for &(t, v, t_off) in layout.locator.overlapping(src) {
                        let lo = t.lo().max(src.lo());
                        let hi = t.hi().min(src.hi());
                        let rel = lo - src.lo();
                        let n = hi - lo + 1;
                        covered.insert_range(rel as usize, n as usize);
                        let dst = BitRange::start_len(pos + rel, n);
                        let within = t_off + (lo - t.lo());
                        let operand = if v == unit {
                            Some(Operand::Container(dest, BitRange::start_len(offset + within, n)))
                        } else {
                            layout.place(v, size, offset).and_then(|(start, placed)| {
                                let bit = start + within;
                                if bit + n > width || (local_only && !placed) {
                                    return None;
                                }
                                let c = Container::normal(size, v.raw_u32());
                                Some(Operand::Container(c, BitRange::start_len(bit, n)))
                            })
                        };
                        match operand {
                            Some(operand) => assigns.push(Assign::new(dst, operand, w.op.kind)),
                            None if local_only => {
                                dropped.insert_range(dst.lo as usize, n as usize);
                            }
                            None => assigns.push(Assign::new(
                                dst,
                                Operand::Unallocated(BitRange::start_len(0, n)),
                                w.op.kind,
                            )),
                        }
                    }
                    let all = BitSet::from_range(0, len as usize);
                    for (lo, hi) in all.difference(&covered).ranges() {
                        let (lo, hi) = (lo as u32, hi as u32);
                        let dst = BitRange::new(pos + lo, pos + hi);
                        if local_only {
                            dropped.insert_range(dst.lo as usize, dst.size() as usize);
                        } else {
                            assigns.push(Assign::new(
                                dst,
                                Operand::Unallocated(BitRange::new(0, hi - lo)),
                                w.op.kind,
                            ));
                        }
                    }
                }
            }
        }
        live.subtract(&dropped);
        Query {
            spec: ContainerSpec::new(dest, live),
            assigns,
            dropped: !dropped.is_empty(),
        }
    }
}

/// The checked units with their candidate offsets.
struct Layout<'u, 'l> {
    units: &'u [Unit<'l>],
    locator: &'u Locator,
    offsets: &'u [SmallVec<[u32; 8]>],
}

impl Layout<'_, '_> {
    /// Where unit `v` starts when it shares the container size `size` of a
    /// unit at `offset`, and whether that start is certain rather than
    /// guessed.
    fn place(&self, v: UnitIndex, size: ContainerSize, offset: u32) -> Option<(u32, bool)> {
        if self.units[v.index()].size != Some(size) {
            return None;
        }
        match self.offsets[v.index()].as_slice() {
            [] => None,
            [only] => Some((*only, true)),
            _ => Some((offset, false)),
        }
    }
}

/// One solver query.
struct Query {
    spec: ContainerSpec,
    assigns: Vec<Assign>,
    /// Whether any source was left out.
    dropped: bool,
}

/// Count the distinct sources an action reads to write one unit: other
/// units, the action-data bus, and at most one stand-in for everything
/// not yet placed. The unit itself is the background and not counted.
fn distinct_sources(locator: &Locator, unit: UnitIndex, writes: &[UnitWrite]) -> usize {
    let mut others: BTreeSet<UnitIndex> = BTreeSet::new();
    let mut action_data = false;
    let mut unplaced = false;
    for w in writes {
        match w.op.source {
            SourceOperand::ActionData | SourceOperand::Constant(_) => action_data = true,
            SourceOperand::Slice(src) => {
                let mut covered = 0;
                for &(t, v, _) in locator.overlapping(src) {
                    covered += t.hi().min(src.hi()) + 1 - t.lo().max(src.lo());
                    if v != unit {
                        others.insert(v);
                    }
                }
                if covered < src.size() {
                    unplaced = true;
                }
            }
        }
    }
    others.len() + action_data as usize + unplaced as usize
}

/// Cut a list into the byte-sized pieces it occupies when the list
/// starts at a byte boundary.
fn byte_pieces(list: &SliceList) -> Vec<SliceList> {
    let width = list.width();
    let mut out = Vec::new();
    let mut start = 0;
    while start < width {
        let end = (start + 8).min(width);
        let mut piece = SmallVec::<[FieldSlice; 4]>::new();
        for (slice, off) in list.with_offsets() {
            let lo = off.max(start);
            let hi = (off + slice.size()).min(end);
            if lo < hi {
                piece.push(slice.sub(BitRange::new(lo - off, hi - off - 1)));
            }
        }
        out.push(SliceList::new(piece));
        start = end;
    }
    out
}
