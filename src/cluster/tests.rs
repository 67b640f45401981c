/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::*;
use crate::table::TableProgram;
use crate::{BitRange, Field, FieldId, FieldSlice};
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

fn fs(field: FieldId, lo: u32, hi: u32) -> FieldSlice {
    FieldSlice::new(field, BitRange::new(lo, hi))
}

fn schema(list: usize, cuts: &[usize]) -> SplitSchema {
    let mut schema = SplitSchema::new();
    schema.insert(SliceListIndex::new(list), cuts.iter().copied().collect());
    schema
}

/// Per-field set of covered bits across a generation.
fn coverage(scs: &[SuperCluster]) -> BTreeMap<FieldId, Vec<u32>> {
    let mut out: BTreeMap<FieldId, Vec<u32>> = BTreeMap::new();
    for sc in scs {
        for slice in sc.slices() {
            out.entry(slice.field)
                .or_default()
                .extend(slice.lo()..=slice.hi());
        }
    }
    for bits in out.values_mut() {
        bits.sort_unstable();
    }
    out
}

#[test]
fn split_24_bit_field_at_16() {
    let mut p = TableProgram::new();
    let f = p.add_field(Field::new("f", 24));
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(f, 0, 23)]));

    let result = split_super_cluster(&p, &sc, &schema(0, &[16])).unwrap();
    assert_eq!(result.clusters.len(), 2);
    let first = &result.clusters[0];
    let second = &result.clusters[1];
    assert_eq!(first.lists().len(), 1);
    assert_eq!(first.lists().iter().next().unwrap().slices(), [fs(f, 0, 15)]);
    assert_eq!(first.clusters().len(), 1);
    assert_eq!(second.lists().iter().next().unwrap().slices(), [fs(f, 16, 23)]);
    assert_eq!(second.clusters().len(), 1);
    assert_eq!(
        result.pieces(fs(f, 0, 23)).as_slice(),
        [fs(f, 0, 15), fs(f, 16, 23)]
    );
}

#[test]
fn no_split_field_cannot_be_cut() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field::new("a", 4));
    let b = p.add_field(Field {
        no_split: true,
        ..Field::new("b", 12)
    });
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(a, 0, 3), fs(b, 0, 11)]));

    // Cutting at the field boundary is fine.
    assert!(split_super_cluster(&p, &sc, &schema(0, &[4])).is_ok());
    // Cutting inside it is not.
    assert_eq!(
        split_super_cluster(&p, &sc, &schema(0, &[8])).unwrap_err(),
        SplitError::NoSplit {
            slice: fs(b, 0, 11),
            offset: 4
        }
    );
}

#[test]
fn exact_lists_cut_on_bytes_only() {
    let mut p = TableProgram::new();
    let h = p.add_field(Field::header("h", 16));
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(h, 0, 15)]));
    assert!(matches!(
        split_super_cluster(&p, &sc, &schema(0, &[4])),
        Err(SplitError::ExactContainerMisaligned { offset: 4, .. })
    ));
    assert_eq!(
        split_super_cluster(&p, &sc, &schema(0, &[8]))
            .unwrap()
            .clusters
            .len(),
        2
    );
}

#[test]
fn empty_schema_is_identity() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field::new("a", 8));
    let b = p.add_field(Field::new("b", 8));
    let c = p.add_field(Field::new("c", 8));
    let sc = SuperCluster::new(
        vec![
            RotationalCluster::aligned(vec![fs(a, 0, 7), fs(c, 0, 7)]),
            RotationalCluster::aligned(vec![fs(b, 0, 7)]),
        ],
        vec![SliceList::new(vec![fs(a, 0, 7), fs(b, 0, 7)])],
    )
    .unwrap();

    let result = split_super_cluster(&p, &sc, &SplitSchema::new()).unwrap();
    assert_eq!(result.clusters, vec![sc]);
    assert!(result.replaced.is_empty());
}

#[test]
fn cut_propagates_through_rotational_cluster() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field::new("a", 16));
    let b = p.add_field(Field::new("b", 16));
    let x = p.add_field(Field::new("x", 8));
    // `a` and `b` are co-rotated; `b` also sits in a list after `x`.
    let sc = SuperCluster::new(
        vec![
            RotationalCluster::new(vec![
                AlignedCluster::new(vec![fs(a, 0, 15)]),
                AlignedCluster::new(vec![fs(b, 0, 15)]),
            ]),
            RotationalCluster::aligned(vec![fs(x, 0, 7)]),
        ],
        vec![SliceList::new(vec![fs(x, 0, 7), fs(b, 0, 15)])],
    )
    .unwrap();
    let a_list = sc.expect_location(fs(a, 0, 15)).list;

    let result = split_super_cluster(&p, &sc, &schema(a_list.index(), &[8])).unwrap();
    assert_eq!(
        result.pieces(fs(b, 0, 15)).as_slice(),
        [fs(b, 0, 7), fs(b, 8, 15)]
    );

    // The list holding `b` is not cut, so everything stays connected.
    assert_eq!(result.clusters.len(), 1);
    let sc2 = &result.clusters[0];
    assert_eq!(
        sc2.list_of(fs(x, 0, 7)).slices(),
        [fs(x, 0, 7), fs(b, 0, 7), fs(b, 8, 15)]
    );
    assert_eq!(
        sc2.co_rotated(fs(a, 0, 7)).collect::<Vec<_>>(),
        [fs(b, 0, 7)]
    );
    assert_eq!(
        sc2.co_rotated(fs(a, 8, 15)).collect::<Vec<_>>(),
        [fs(b, 8, 15)]
    );
    assert_eq!(coverage(&result.clusters), coverage(&[sc.clone()]));
}

#[test]
fn split_preserves_bit_coverage() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field::new("a", 20));
    let b = p.add_field(Field::new("b", 20));
    let c = p.add_field(Field::new("c", 12));
    let sc = SuperCluster::new(
        vec![
            RotationalCluster::aligned(vec![fs(a, 0, 19), fs(b, 0, 19)]),
            RotationalCluster::aligned(vec![fs(c, 0, 11)]),
        ],
        vec![SliceList::new(vec![fs(a, 0, 19), fs(c, 0, 11)])],
    )
    .unwrap();
    let li = sc.expect_location(fs(a, 0, 19)).list.index();

    for cuts in [&[8usize][..], &[16], &[8, 16, 24], &[20], &[3, 27]] {
        let result = split_super_cluster(&p, &sc, &schema(li, cuts)).unwrap();
        assert_eq!(coverage(&result.clusters), coverage(&[sc.clone()]));
        for out in &result.clusters {
            out.check_well_formed(&p).unwrap();
        }
    }
}

#[test]
fn wide_arith_pieces_stay_together() {
    let mut p = TableProgram::new();
    let w = p.add_field(Field {
        wide_arith: true,
        ..Field::new("w", 64)
    });
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(w, 0, 63)]));
    let result = split_super_cluster(&p, &sc, &schema(0, &[32])).unwrap();
    assert_eq!(result.clusters.len(), 1);
    assert_eq!(result.clusters[0].lists().len(), 2);
}

#[test]
fn container_group_merges() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field {
        container_group: Some(3),
        ..Field::new("a", 8)
    });
    let b = p.add_field(Field {
        container_group: Some(3),
        ..Field::new("b", 8)
    });
    let c = p.add_field(Field::new("c", 8));
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(a, 0, 7), fs(c, 0, 7), fs(b, 0, 7)]));
    let result = split_super_cluster(&p, &sc, &schema(0, &[8, 16])).unwrap();
    assert_eq!(result.clusters.len(), 2);
    let joint = result
        .clusters
        .iter()
        .find(|sc| sc.contains(fs(a, 0, 7)))
        .unwrap();
    assert!(joint.contains(fs(b, 0, 7)));
    assert!(!joint.contains(fs(c, 0, 7)));
}

#[test]
fn construction_rejects_bad_structure() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field::new("a", 8));
    let b = p.add_field(Field::new("b", 8));
    let wide = p.add_field(Field::new("wide", 16));

    assert_eq!(
        SuperCluster::new(
            vec![RotationalCluster::aligned(vec![fs(a, 0, 7), fs(b, 0, 7)])],
            vec![SliceList::new(vec![fs(a, 0, 7), fs(b, 0, 7)])],
        )
        .unwrap_err(),
        ClusterError::SameAlignedCluster(fs(a, 0, 7), fs(b, 0, 7))
    );
    assert_eq!(
        SuperCluster::new(
            vec![RotationalCluster::aligned(vec![fs(a, 0, 7), fs(wide, 0, 15)])],
            vec![],
        )
        .unwrap_err(),
        ClusterError::MixedWidths(fs(a, 0, 7), fs(wide, 0, 15))
    );
    assert_eq!(
        SuperCluster::new(
            vec![RotationalCluster::aligned(vec![fs(a, 0, 7)])],
            vec![SliceList::new(vec![fs(a, 0, 7), fs(b, 0, 7)])],
        )
        .unwrap_err(),
        ClusterError::SliceNotInCluster(fs(b, 0, 7))
    );

    // Unlisted slices get singleton lists.
    let sc = SuperCluster::new(vec![RotationalCluster::aligned(vec![fs(a, 0, 7)])], vec![]).unwrap();
    assert_eq!(sc.lists().len(), 1);
}

#[test]
fn alignment_and_settled_checks() {
    let mut p = TableProgram::new();
    let a = p.add_field(Field {
        alignment: Some(0),
        ..Field::new("a", 4)
    });
    let b = p.add_field(Field {
        alignment: Some(0),
        ..Field::new("b", 4)
    });
    let c = p.add_field(Field {
        bottom_bits: true,
        ..Field::new("c", 4)
    });

    // `b` at list offset 4 wants container bit 0: the list would have to
    // start at bit 4, but `a` wants it at bit 0.
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(a, 0, 3), fs(b, 0, 3)]));
    assert_eq!(
        sc.check_well_formed(&p).unwrap_err(),
        ClusterError::AlignmentConflict(fs(a, 0, 3), fs(b, 0, 3))
    );

    let sc = SuperCluster::from_list(SliceList::new(vec![fs(a, 0, 3), fs(c, 0, 3)]));
    sc.check_well_formed(&p).unwrap();
    assert_eq!(
        sc.check_settled(&p).unwrap_err(),
        ClusterError::BottomBits(fs(c, 0, 3))
    );

    let sc = SuperCluster::from_list(SliceList::new(vec![fs(c, 0, 3), fs(a, 0, 3)]));
    assert!(sc.check_settled(&p).is_err());
    let d = p.add_field(Field::new("d", 4));
    let sc = SuperCluster::from_list(SliceList::new(vec![fs(c, 0, 3), fs(d, 0, 3)]));
    sc.check_settled(&p).unwrap();
}
