/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The split operation: cut the slice lists of a super-cluster at given
//! offsets and rebuild the finest consistent set of super-clusters.

use super::{
    AlignedCluster, RotationalCluster, RotationalClusterIndex, SliceList, SliceListIndex,
    SuperCluster,
};
use crate::bitvec::BitSet;
use crate::unionfind::UnionFind;
use crate::{FieldSlice, Program};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::fmt;
use smallvec::{smallvec, SmallVec};

/// For each slice list to cut, the list offsets at which a new list
/// starts.
pub type SplitSchema = BTreeMap<SliceListIndex, BitSet>;

/// Why a split is infeasible. These are never fatal; the search treats
/// them as a failed branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplitError {
    /// The cut falls strictly inside a field that must not be split.
    NoSplit { slice: FieldSlice, offset: u32 },
    /// An exact-container list may only be cut at byte boundaries.
    ExactContainerMisaligned { head: FieldSlice, offset: u32 },
    /// A co-rotated slice cannot be cut at the same relative offset.
    Rotation { slice: FieldSlice, offset: u32 },
}

impl fmt::Display for SplitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SplitError::NoSplit { slice, offset } => {
                write!(f, "cannot cut no-split slice {} at +{}", slice, offset)
            }
            SplitError::ExactContainerMisaligned { head, offset } => write!(
                f,
                "exact-container list at {} cut at non-byte offset {}",
                head, offset
            ),
            SplitError::Rotation { slice, offset } => {
                write!(f, "co-rotated slice {} cannot be cut at +{}", slice, offset)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SplitError {}

/// The new generation produced by a split.
#[derive(Clone, Debug)]
pub struct SplitResult {
    pub clusters: Vec<SuperCluster>,
    /// Every slice that was cut, mapped to its pieces in bit order.
    pub replaced: BTreeMap<FieldSlice, SmallVec<[FieldSlice; 2]>>,
}

impl SplitResult {
    /// The pieces that `slice` became, or `slice` itself if it was not
    /// cut.
    pub fn pieces(&self, slice: FieldSlice) -> SmallVec<[FieldSlice; 2]> {
        match self.replaced.get(&slice) {
            Some(pieces) => pieces.clone(),
            None => smallvec![slice],
        }
    }
}

/// Split `sc` according to `schema`.
///
/// A cut inside a field slice cuts every slice of its rotational cluster
/// at the same relative offset, and therefore reaches every list that
/// holds one of those slices. Once all cuts are applied the lists and
/// clusters are regrouped by shared slices, and groups that share a wide
/// arithmetic field or a container group are merged back together.
pub fn split_super_cluster<P: Program>(
    program: &P,
    sc: &SuperCluster,
    schema: &SplitSchema,
) -> Result<SplitResult, SplitError> {
    trace!("split_super_cluster: {:?} with {:?}", sc, schema);

    // Relative cut offsets per rotational cluster.
    let mut cluster_cuts: BTreeMap<RotationalClusterIndex, BTreeSet<u32>> = BTreeMap::new();
    for (&li, cuts) in schema {
        let list = &sc.lists()[li];
        let exact = list.is_exact(program);
        let width = list.width();
        for cut in cuts.iter() {
            let cut = cut as u32;
            if cut == 0 || cut >= width {
                continue;
            }
            if exact && cut % 8 != 0 {
                return Err(SplitError::ExactContainerMisaligned {
                    head: list.head(),
                    offset: cut,
                });
            }
            let (slice, start) = match list.slice_at(cut) {
                Some(found) => found,
                None => unreachable!(),
            };
            if start == cut {
                continue;
            }
            let loc = sc.expect_location(slice);
            cluster_cuts
                .entry(loc.cluster)
                .or_default()
                .insert(cut - start);
        }
    }

    // Cut the slices of every affected cluster identically.
    let mut replaced: BTreeMap<FieldSlice, SmallVec<[FieldSlice; 2]>> = BTreeMap::new();
    for (&ci, cuts) in &cluster_cuts {
        for slice in sc.clusters()[ci].slices() {
            let field = program.field(slice.field);
            let mut pieces: SmallVec<[FieldSlice; 2]> = smallvec![];
            let mut rest = slice;
            let mut consumed = 0;
            for &cut in cuts {
                if cut >= slice.size() {
                    return Err(SplitError::Rotation { slice, offset: cut });
                }
                if field.no_split {
                    return Err(SplitError::NoSplit { slice, offset: cut });
                }
                let (lo, hi) = rest.split_at(cut - consumed);
                pieces.push(lo);
                rest = hi;
                consumed = cut;
            }
            pieces.push(rest);
            trace!(" -> cut {} into {:?}", slice, pieces);
            replaced.insert(slice, pieces);
        }
    }

    // New rotational clusters: piece `j` of every aligned cluster forms
    // rotational cluster `j`.
    let mut new_clusters: Vec<RotationalCluster> = Vec::new();
    for (ci, rot) in sc.clusters().enumerate() {
        let n_pieces = cluster_cuts.get(&ci).map_or(1, |cuts| cuts.len() + 1);
        if n_pieces == 1 {
            new_clusters.push(rot.clone());
            continue;
        }
        for j in 0..n_pieces {
            new_clusters.push(RotationalCluster::new(rot.aligned_clusters().iter().map(
                |aligned| AlignedCluster::new(aligned.slices().iter().map(|s| replaced[s][j])),
            )));
        }
    }

    // New slice lists: substitute pieces, then cut at the schema offsets,
    // which now all fall on slice boundaries.
    let mut new_lists: Vec<SliceList> = Vec::new();
    for (li, list) in sc.lists().enumerate() {
        let expanded = list.slices().iter().flat_map(|s| match replaced.get(s) {
            Some(pieces) => pieces.clone(),
            None => smallvec![*s],
        });
        let cuts = schema.get(&li);
        let mut current: SmallVec<[FieldSlice; 4]> = smallvec![];
        let mut offset = 0;
        for slice in expanded {
            if !current.is_empty() && cuts.map_or(false, |c| c.contains(offset as usize)) {
                new_lists.push(SliceList::new(current.drain(..)));
            }
            current.push(slice);
            offset += slice.size();
        }
        new_lists.push(SliceList::new(current));
    }

    let clusters = regroup(program, new_clusters, new_lists);
    trace!(" -> {} super-clusters", clusters.len());
    Ok(SplitResult { clusters, replaced })
}

/// Group lists and clusters into super-clusters by shared slices, then
/// merge the groups that must be allocated jointly.
fn regroup<P: Program>(
    program: &P,
    clusters: Vec<RotationalCluster>,
    lists: Vec<SliceList>,
) -> Vec<SuperCluster> {
    // Nodes 0..clusters.len() are clusters; the rest are lists.
    let n_clusters = clusters.len();
    let mut uf = UnionFind::<SliceListIndex>::new(n_clusters + lists.len());
    let mut cluster_of: BTreeMap<FieldSlice, usize> = BTreeMap::new();
    for (ci, rot) in clusters.iter().enumerate() {
        for slice in rot.slices() {
            cluster_of.insert(slice, ci);
        }
    }
    for (li, list) in lists.iter().enumerate() {
        for slice in list.slices() {
            let ci = match cluster_of.get(slice) {
                Some(&ci) => ci,
                None => panic!("slice {} lost its cluster during split", slice),
            };
            uf.union(
                SliceListIndex::new(n_clusters + li),
                SliceListIndex::new(ci),
            );
        }
    }

    let mut parts: BTreeMap<usize, (Vec<RotationalCluster>, Vec<SliceList>)> = BTreeMap::new();
    for (ci, rot) in clusters.into_iter().enumerate() {
        let root = uf.find(SliceListIndex::new(ci)).index();
        parts.entry(root).or_default().0.push(rot);
    }
    for (li, list) in lists.into_iter().enumerate() {
        let root = uf.find(SliceListIndex::new(n_clusters + li)).index();
        parts.entry(root).or_default().1.push(list);
    }
    let scs: Vec<SuperCluster> = parts
        .into_values()
        .map(|(clusters, lists)| SuperCluster::from_parts(clusters, lists))
        .collect();

    merge_joint_groups(program, scs)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum JointKey {
    WideArith(crate::FieldId),
    ContainerGroup(u32),
}

/// Merge super-clusters that hold slices of the same wide-arithmetic
/// field or of the same container group.
pub(crate) fn merge_joint_groups<P: Program>(
    program: &P,
    scs: Vec<SuperCluster>,
) -> Vec<SuperCluster> {
    let mut uf = UnionFind::<SliceListIndex>::new(scs.len());
    let mut owner: BTreeMap<JointKey, usize> = BTreeMap::new();
    for (i, sc) in scs.iter().enumerate() {
        for slice in sc.slices() {
            let field = program.field(slice.field);
            let mut keys: SmallVec<[JointKey; 2]> = smallvec![];
            if field.wide_arith {
                keys.push(JointKey::WideArith(slice.field));
            }
            if let Some(group) = field.container_group {
                keys.push(JointKey::ContainerGroup(group));
            }
            for key in keys {
                let first = *owner.entry(key).or_insert(i);
                uf.union(SliceListIndex::new(first), SliceListIndex::new(i));
            }
        }
    }

    let mut out: Vec<SuperCluster> = uf
        .groups()
        .into_iter()
        .map(|group| {
            if group.len() == 1 {
                scs[group[0].index()].clone()
            } else {
                trace!(" -> merging {} jointly allocated super-clusters", group.len());
                SuperCluster::merge(group.iter().map(|i| &scs[i.index()]))
            }
        })
        .collect();
    out.sort_unstable_by_key(|sc| sc.lists()[SliceListIndex::new(0)].head());
    out
}
