/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Mandatory cuts applied once, before the search starts.

use super::constraint::{narrow, AfterSplitConstraint, Constraints};
use crate::bitvec::BitSet;
use crate::cluster::{split_super_cluster, SliceList, SplitError, SplitSchema, SuperCluster};
use crate::{ContainerSize, FieldSlice, Program};
use alloc::vec;
use alloc::vec::Vec;

/// Slices at least this wide are cut into 32-bit chunks when the search
/// is retried.
const WIDE_FIELD_BITS: u32 = 64;

/// The list offsets at which a pass wants `list` cut.
type Pass<P> = fn(&P, &SliceList) -> BitSet;

/// Apply every pre-split pass to `sc`, in order. With `wide`, slices of
/// very wide fields are first cut into 32-bit-aligned chunks. Returns the
/// resulting super-clusters and the sizes fixed by container-size
/// directives.
pub(crate) fn presplit<P: Program>(
    program: &P,
    sc: &SuperCluster,
    wide: bool,
) -> Result<(Vec<SuperCluster>, Constraints), SplitError> {
    let mut passes: Vec<(&str, Pass<P>)> = Vec::new();
    if wide {
        passes.push(("wide fields", wide_field_cuts::<P>));
    }
    passes.push(("size directives", directive_cuts::<P>));
    passes.push(("pack conflicts", pack_conflict_cuts::<P>));
    passes.push(("bottom bits", bottom_bits_cuts::<P>));
    passes.push(("deparsed", deparsed_cuts::<P>));
    passes.push(("parser write mode", parser_mode_cuts::<P>));

    let mut scs = vec![sc.clone()];
    for (name, pass) in passes {
        let mut next = Vec::with_capacity(scs.len());
        for sc in scs {
            let mut schema = SplitSchema::new();
            for (li, list) in sc.lists().enumerate() {
                let cuts = pass(program, list);
                if !cuts.is_empty() {
                    schema.insert(li, cuts);
                }
            }
            if schema.is_empty() {
                next.push(sc);
                continue;
            }
            trace!("presplit {}: {:?}", name, schema);
            next.extend(split_super_cluster(program, &sc, &schema)?.clusters);
        }
        scs = next;
    }

    let mut constraints = Constraints::new();
    for sc in &scs {
        for slice in sc.slices() {
            if let Some(size) = directive_size(program, slice) {
                narrow(&mut constraints, slice, AfterSplitConstraint::Exact(size));
            }
        }
    }
    Ok((scs, constraints))
}

/// The list offset of field bit `bit` if it starts a new container: either
/// strictly inside a slice, or at the start of a slice that is not first.
fn cut_at_field_bit(slice: FieldSlice, offset: u32, bit: u32) -> Option<u32> {
    if slice.lo() < bit && bit <= slice.hi() {
        Some(offset + bit - slice.lo())
    } else if slice.lo() == bit && offset > 0 {
        Some(offset)
    } else {
        None
    }
}

/// Field bits at which the chunks of a size directive start.
fn directive_starts<P: Program>(program: &P, field: crate::FieldId) -> Vec<(u32, ContainerSize)> {
    let mut out = Vec::new();
    if let Some(sizes) = program.container_sizes(field) {
        let mut start = 0;
        for &size in sizes {
            out.push((start, size));
            start += size.bits();
        }
    }
    out
}

/// The directive size of the chunk that holds all of `slice`.
fn directive_size<P: Program>(program: &P, slice: FieldSlice) -> Option<ContainerSize> {
    directive_starts(program, slice.field)
        .into_iter()
        .find(|&(start, size)| start <= slice.lo() && slice.hi() < start + size.bits())
        .map(|(_, size)| size)
}

fn directive_cuts<P: Program>(program: &P, list: &SliceList) -> BitSet {
    let mut cuts = BitSet::new();
    for (slice, offset) in list.with_offsets() {
        let field = program.field(slice.field);
        for (start, size) in directive_starts(program, slice.field) {
            for bit in [start, start + size.bits()] {
                if bit < field.size {
                    if let Some(cut) = cut_at_field_bit(slice, offset, bit) {
                        cuts.insert(cut as usize);
                    }
                }
            }
        }
    }
    cuts
}

/// Separate every pair of conflicting slices, at a byte boundary between
/// them if there is one.
fn pack_conflict_cuts<P: Program>(program: &P, list: &SliceList) -> BitSet {
    let mut cuts = BitSet::new();
    let slices: Vec<(FieldSlice, u32)> = list.with_offsets().collect();
    for (i, &(a, a_off)) in slices.iter().enumerate() {
        for &(b, b_off) in &slices[i + 1..] {
            if !program.has_pack_conflict(a, b) {
                continue;
            }
            let lo = a_off + a.size();
            if cuts.iter().any(|c| lo as usize <= c && c <= b_off as usize) {
                continue;
            }
            let byte = (lo + 7) / 8 * 8;
            let cut = if byte <= b_off { byte } else { b_off };
            trace!("presplit: {} conflicts with {}, cut at {}", a, b, cut);
            cuts.insert(cut as usize);
        }
    }
    cuts
}

fn bottom_bits_cuts<P: Program>(program: &P, list: &SliceList) -> BitSet {
    list.with_offsets()
        .filter(|&(s, off)| off > 0 && s.lo() == 0 && program.field(s.field).bottom_bits)
        .map(|(_, off)| off as usize)
        .collect()
}

/// Cut wherever adjacent slices disagree on `differ`.
fn adjacent_cuts<F: Fn(FieldSlice, FieldSlice) -> bool>(list: &SliceList, differ: F) -> BitSet {
    let slices = list.slices();
    list.with_offsets()
        .skip(1)
        .zip(slices.iter())
        .filter(|&((s, _), &prev)| differ(prev, s))
        .map(|((_, off), _)| off as usize)
        .collect()
}

fn deparsed_cuts<P: Program>(program: &P, list: &SliceList) -> BitSet {
    adjacent_cuts(list, |a, b| {
        program.field(a.field).deparsed != program.field(b.field).deparsed
    })
}

fn parser_mode_cuts<P: Program>(program: &P, list: &SliceList) -> BitSet {
    adjacent_cuts(list, |a, b| {
        match (
            program.field(a.field).parser_write_mode,
            program.field(b.field).parser_write_mode,
        ) {
            (Some(x), Some(y)) => x != y,
            _ => false,
        }
    })
}

/// Cut slices of at least `WIDE_FIELD_BITS` at every 32nd field bit.
fn wide_field_cuts<P: Program>(_program: &P, list: &SliceList) -> BitSet {
    let mut cuts = BitSet::new();
    for (slice, offset) in list.with_offsets() {
        if slice.size() < WIDE_FIELD_BITS {
            continue;
        }
        for bit in (32..=slice.hi()).step_by(32) {
            if let Some(cut) = cut_at_field_bit(slice, offset, bit) {
                cuts.insert(cut as usize);
            }
        }
    }
    cuts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableProgram;
    use crate::{Field, FieldId, ParserWriteMode};

    fn whole(p: &TableProgram, f: FieldId) -> FieldSlice {
        FieldSlice::whole(f, p.field(f).size)
    }

    fn lists(scs: &[SuperCluster]) -> Vec<Vec<FieldSlice>> {
        let mut out: Vec<Vec<FieldSlice>> = scs
            .iter()
            .flat_map(|sc| sc.lists().iter().map(|l| l.slices().to_vec()))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn directives_fix_sizes() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 24));
        p.set_container_sizes(a, vec![ContainerSize::B16, ContainerSize::B8]);
        let sc = SuperCluster::from_list(SliceList::new([whole(&p, a)]));
        let (scs, constraints) = presplit(&p, &sc, false).unwrap();
        let lo = FieldSlice::new(a, crate::BitRange::new(0, 15));
        let hi = FieldSlice::new(a, crate::BitRange::new(16, 23));
        assert_eq!(lists(&scs), [vec![lo], vec![hi]]);
        assert_eq!(constraints[&lo], AfterSplitConstraint::Exact(ContainerSize::B16));
        assert_eq!(constraints[&hi], AfterSplitConstraint::Exact(ContainerSize::B8));
    }

    #[test]
    fn conflicts_are_cut_at_bytes() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 4));
        let b = p.add_field(Field::new("b", 6));
        let c = p.add_field(Field::new("c", 8));
        p.add_pack_conflict(a, c);
        let sc = SuperCluster::from_list(SliceList::new([whole(&p, a), whole(&p, b), whole(&p, c)]));
        let (scs, _) = presplit(&p, &sc, false).unwrap();
        // `b` is cut at the byte boundary between `a` and `c`.
        let b_lo = FieldSlice::new(b, crate::BitRange::new(0, 3));
        let b_hi = FieldSlice::new(b, crate::BitRange::new(4, 5));
        assert_eq!(
            lists(&scs),
            [vec![whole(&p, a), b_lo], vec![b_hi, whole(&p, c)]]
        );
    }

    #[test]
    fn layout_boundaries() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 8));
        let b = p.add_field(Field {
            bottom_bits: true,
            ..Field::new("b", 8)
        });
        let c = p.add_field(Field {
            deparsed: true,
            ..Field::new("c", 8)
        });
        let d = p.add_field(Field {
            deparsed: true,
            parser_write_mode: Some(ParserWriteMode::SingleWrite),
            ..Field::new("d", 8)
        });
        let e = p.add_field(Field {
            deparsed: true,
            parser_write_mode: Some(ParserWriteMode::BitwiseOr),
            ..Field::new("e", 8)
        });
        let list = SliceList::new([a, b, c, d, e].iter().map(|&f| whole(&p, f)));
        let (scs, _) = presplit(&p, &SuperCluster::from_list(list), false).unwrap();
        assert_eq!(
            lists(&scs),
            [
                vec![whole(&p, a)],
                vec![whole(&p, b)],
                vec![whole(&p, c), whole(&p, d)],
                vec![whole(&p, e)],
            ]
        );
    }

    #[test]
    fn wide_fields_are_chunked_on_retry() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 80));
        let sc = SuperCluster::from_list(SliceList::new([whole(&p, a)]));
        assert_eq!(presplit(&p, &sc, false).unwrap().0.len(), 1);
        let (scs, _) = presplit(&p, &sc, true).unwrap();
        let widths: Vec<u32> = scs.iter().map(|sc| sc.total_bits()).collect();
        assert_eq!(widths, [32, 32, 16]);
    }

    #[test]
    fn narrow_slices_of_wide_fields_stay_whole() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 80));
        let lo = FieldSlice::new(a, crate::BitRange::new(0, 39));
        let (scs, _) = presplit(&p, &SuperCluster::from_list(SliceList::new([lo])), true).unwrap();
        assert_eq!(lists(&scs), [vec![lo]]);

        let mid = FieldSlice::new(a, crate::BitRange::new(8, 79));
        let (scs, _) = presplit(&p, &SuperCluster::from_list(SliceList::new([mid])), true).unwrap();
        let widths: Vec<u32> = scs.iter().map(|sc| sc.total_bits()).collect();
        assert_eq!(widths, [24, 32, 16]);
    }

    #[test]
    fn exact_lists_reject_misaligned_passes() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::header("a", 4));
        let b = p.add_field(Field {
            deparsed: false,
            ..Field::header("b", 4)
        });
        let sc = SuperCluster::from_list(SliceList::new([whole(&p, a), whole(&p, b)]));
        assert!(matches!(
            presplit(&p, &sc, false),
            Err(SplitError::ExactContainerMisaligned { offset: 4, .. })
        ));
    }
}
