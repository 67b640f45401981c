/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Variable and value ordering for the search: which slice list to cut
//! next, and in which order to try the cuts.
//!
//! Neither ordering affects which slicings exist, only how quickly the
//! search reaches them, so both are traits with replaceable defaults.

use super::constraint::{constraint_of, Constraints};
use crate::bitvec::BitSet;
use crate::cluster::{list_start_alignment, SliceList};
use crate::{ContainerSize, Program, SlicingOptions};
use alloc::vec::Vec;

/// One way to cut a slice list: the container size decided for the first
/// piece and the list offsets to cut at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cut {
    pub size: ContainerSize,
    pub offsets: BitSet,
    /// Every piece, not only the first, is decided to be of `size`.
    pub homogeneous: bool,
}

impl Cut {
    fn single(size: ContainerSize, offset: u32) -> Cut {
        let mut offsets = BitSet::new();
        offsets.insert(offset as usize);
        Cut {
            size,
            offsets,
            homogeneous: false,
        }
    }

    /// The end of the first piece.
    pub fn first(&self) -> u32 {
        self.offsets.min().map_or(0, |o| o as u32)
    }
}

/// Chooses the next slice list to cut.
pub trait PickNext<P: Program> {
    /// Return the index in `candidates` of the list to cut next.
    /// `candidates` is never empty.
    fn pick(&self, program: &P, constraints: &Constraints, candidates: &[&SliceList]) -> usize;
}

/// Orders the ways of cutting a slice list.
pub trait ChooseCut<P: Program> {
    fn choices(
        &self,
        program: &P,
        constraints: &Constraints,
        list: &SliceList,
        options: &SlicingOptions,
    ) -> Vec<Cut>;
}

/// Cut the list with the most evidence about its container sizes first:
/// exact-container lists, then lists whose decided slices sit nearest the
/// front, then narrower lists, then lists with more constrained slices.
#[derive(Clone, Copy, Debug, Default)]
pub struct GreedyPickNext;

impl<P: Program> PickNext<P> for GreedyPickNext {
    fn pick(&self, program: &P, constraints: &Constraints, candidates: &[&SliceList]) -> usize {
        let key = |list: &SliceList| {
            let decided_at = list
                .with_offsets()
                .find(|&(s, _)| constraint_of(constraints, s).decided().is_some())
                .map_or(u32::MAX, |(_, off)| off);
            let constrained = list
                .slices()
                .iter()
                .filter(|&&s| constraints.contains_key(&s))
                .count();
            (
                !list.is_exact(program),
                decided_at,
                list.width(),
                usize::MAX - constrained,
                list.head(),
            )
        };
        let mut best = 0;
        for i in 1..candidates.len() {
            if key(candidates[i]) < key(candidates[best]) {
                best = i;
            }
        }
        best
    }
}

/// Try container sizes from small to large, preferring cuts that fall on
/// slice boundaries, and among those cuts that separate referenced from
/// unreferenced fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoundaryAwareChooser;

impl BoundaryAwareChooser {
    fn candidates<P: Program>(
        &self,
        program: &P,
        constraints: &Constraints,
        list: &SliceList,
        options: &SlicingOptions,
    ) -> Vec<Cut> {
        let width = list.width();
        let exact = list.is_exact(program);
        let start = list_start_alignment(program, list).unwrap_or(0);
        let mut out = Vec::new();
        for size in ContainerSize::ALL {
            if size.bits() <= start {
                continue;
            }
            let cut = size.bits() - start;
            if cut >= width {
                continue;
            }
            if exact && cut % 8 != 0 {
                continue;
            }

            if exact && options.homogeneous_slicing && width % size.bits() == 0 {
                let offsets = (1..width / size.bits())
                    .map(|k| (k * size.bits()) as usize)
                    .collect();
                out.push(Cut {
                    size,
                    offsets,
                    homogeneous: true,
                });
                continue;
            }

            out.push(Cut::single(size, cut));
            // Exact pieces have no slack, so only non-exact lists may stop
            // short at an earlier slice boundary.
            if !exact {
                if let Some(b) = list.boundaries().filter(|&b| b < cut).last() {
                    out.push(Cut::single(size, b));
                }
            }
        }

        out.retain(|c| {
            let first = c.first();
            let allowed = list
                .with_offsets()
                .take_while(|&(_, off)| off < first)
                .all(|(s, _)| constraint_of(constraints, s).allows(c.size));
            let cuts_no_split = c.offsets.iter().any(|o| {
                list.slice_at(o as u32).map_or(false, |(s, start)| {
                    start != o as u32 && program.field(s.field).no_split
                })
            });
            allowed && !cuts_no_split
        });
        out
    }
}

impl<P: Program> ChooseCut<P> for BoundaryAwareChooser {
    fn choices(
        &self,
        program: &P,
        constraints: &Constraints,
        list: &SliceList,
        options: &SlicingOptions,
    ) -> Vec<Cut> {
        let mut cuts = self.candidates(program, constraints, list, options);
        let inside_slice = |o: u32| list.slice_at(o).map_or(false, |(_, start)| start != o);
        let referenced_edge = |o: u32| {
            let before = list.slice_at(o - 1).map(|(s, _)| program.is_referenced(s.field));
            let after = list.slice_at(o).map(|(s, _)| program.is_referenced(s.field));
            before != after
        };
        let packed = |c: &Cut| {
            let first = c.first();
            list.with_offsets().take_while(|&(_, off)| off < first).count()
        };
        cuts.sort_by_key(|c| {
            let fragments = c.offsets.iter().filter(|&o| inside_slice(o as u32)).count();
            let edge = c.offsets.iter().any(|o| referenced_edge(o as u32));
            let packing = if options.minimal_packing { packed(c) } else { 0 };
            (packing, fragments, !edge, c.size, c.first())
        });
        cuts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableProgram;
    use crate::{Field, FieldId, FieldSlice};

    fn whole(p: &TableProgram, f: FieldId) -> FieldSlice {
        FieldSlice::whole(f, p.field(f).size)
    }

    #[test]
    fn boundaries_first_then_small_sizes() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 12));
        let b = p.add_field(Field::new("b", 30));
        let list = SliceList::new([whole(&p, a), whole(&p, b)]);
        let cuts = BoundaryAwareChooser.choices(
            &p,
            &Constraints::new(),
            &list,
            &SlicingOptions::default(),
        );
        let summary: Vec<(ContainerSize, u32)> = cuts.iter().map(|c| (c.size, c.first())).collect();
        assert_eq!(
            summary,
            [
                (ContainerSize::B16, 12),
                (ContainerSize::B32, 12),
                (ContainerSize::B8, 8),
                (ContainerSize::B16, 16),
                (ContainerSize::B32, 32),
            ]
        );
    }

    #[test]
    fn exact_lists_are_cut_homogeneously() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::header("a", 48));
        let list = SliceList::new([whole(&p, a)]);
        let options = SlicingOptions {
            homogeneous_slicing: true,
            ..SlicingOptions::default()
        };
        let cuts = BoundaryAwareChooser.choices(&p, &Constraints::new(), &list, &options);
        assert_eq!(cuts.len(), 3);
        let b8 = cuts.iter().find(|c| c.size == ContainerSize::B8).unwrap();
        assert!(b8.homogeneous);
        assert_eq!(b8.offsets.count(), 5);
        let b32 = cuts.iter().find(|c| c.size == ContainerSize::B32).unwrap();
        assert!(!b32.homogeneous);
        assert_eq!(b32.first(), 32);
    }

    #[test]
    fn no_split_and_decided_sizes_filter_cuts() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field {
            no_split: true,
            ..Field::new("a", 20)
        });
        let b = p.add_field(Field::new("b", 20));
        let list = SliceList::new([whole(&p, a), whole(&p, b)]);
        let mut constraints = Constraints::new();
        constraints.insert(
            whole(&p, a),
            super::super::AfterSplitConstraint::Min(ContainerSize::B32),
        );
        let cuts = BoundaryAwareChooser.choices(&p, &constraints, &list, &SlicingOptions::default());
        let summary: Vec<(ContainerSize, u32)> = cuts.iter().map(|c| (c.size, c.first())).collect();
        assert_eq!(summary, [(ContainerSize::B32, 20), (ContainerSize::B32, 32)]);
    }

    #[test]
    fn minimal_packing_prefers_fewer_slices_first() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::header("a", 12));
        let b = p.add_field(Field::header("b", 4));
        let c = p.add_field(Field::header("c", 16));
        let list = SliceList::new([whole(&p, a), whole(&p, b), whole(&p, c)]);
        let summary = |options: &SlicingOptions| -> Vec<(ContainerSize, u32)> {
            BoundaryAwareChooser
                .choices(&p, &Constraints::new(), &list, options)
                .iter()
                .map(|c| (c.size, c.first()))
                .collect()
        };
        assert_eq!(
            summary(&SlicingOptions::default()),
            [(ContainerSize::B16, 16), (ContainerSize::B8, 8)]
        );
        let minimal = SlicingOptions {
            minimal_packing: true,
            ..SlicingOptions::default()
        };
        assert_eq!(
            summary(&minimal),
            [(ContainerSize::B8, 8), (ContainerSize::B16, 16)]
        );
    }

    #[test]
    fn exact_lists_go_first() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 40));
        let b = p.add_field(Field::header("b", 48));
        let la = SliceList::new([whole(&p, a)]);
        let lb = SliceList::new([whole(&p, b)]);
        assert_eq!(GreedyPickNext.pick(&p, &Constraints::new(), &[&la, &lb]), 1);
    }
}
