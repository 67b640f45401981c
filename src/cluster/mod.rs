/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Cluster data model: slice lists, aligned and rotational clusters, and
//! the super-clusters that group them.
//!
//! A `SuperCluster` is an immutable value. It owns its slice lists and
//! rotational clusters in two small arenas, indexed by
//! `SliceListIndex` and `RotationalClusterIndex`, plus lookup tables from
//! each field slice to the list and cluster containing it. Splitting
//! never mutates a super-cluster; it builds a new generation (see
//! `split`), so a search can backtrack simply by dropping the
//! generation it no longer needs.

use crate::{ContainerSize, FieldSlice, Program};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

mod split;
pub use split::{split_super_cluster, SplitError, SplitResult, SplitSchema};

/// Field slices that must be allocated contiguously, in order, as if
/// concatenated, inside one container (once the list is settled).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceList {
    slices: SmallVec<[FieldSlice; 4]>,
}

impl SliceList {
    pub fn new<I: IntoIterator<Item = FieldSlice>>(slices: I) -> Self {
        let slices: SmallVec<[FieldSlice; 4]> = slices.into_iter().collect();
        assert!(!slices.is_empty(), "empty slice list");
        SliceList { slices }
    }

    #[inline(always)]
    pub fn slices(&self) -> &[FieldSlice] {
        &self.slices[..]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    #[inline(always)]
    pub fn head(&self) -> FieldSlice {
        self.slices[0]
    }

    /// Total width in bits.
    pub fn width(&self) -> u32 {
        self.slices.iter().map(|s| s.size()).sum()
    }

    pub fn contains(&self, slice: FieldSlice) -> bool {
        self.slices.contains(&slice)
    }

    /// Each slice together with its bit offset from the start of the
    /// list.
    pub fn with_offsets(&self) -> impl Iterator<Item = (FieldSlice, u32)> + '_ {
        self.slices.iter().scan(0, |offset, &slice| {
            let here = *offset;
            *offset += slice.size();
            Some((slice, here))
        })
    }

    pub fn offset_of(&self, slice: FieldSlice) -> Option<u32> {
        self.with_offsets()
            .find(|&(s, _)| s == slice)
            .map(|(_, offset)| offset)
    }

    /// The slice covering list offset `offset`, and that slice's own
    /// offset.
    pub fn slice_at(&self, offset: u32) -> Option<(FieldSlice, u32)> {
        self.with_offsets()
            .find(|&(s, start)| start <= offset && offset < start + s.size())
    }

    /// Does the list hold any field that must occupy containers with no
    /// slack?
    pub fn is_exact<P: Program>(&self, program: &P) -> bool {
        self.slices
            .iter()
            .any(|s| program.field(s.field).exact_containers)
    }

    /// Offsets at which one slice ends and the next begins.
    pub fn boundaries(&self) -> impl Iterator<Item = u32> + '_ {
        self.with_offsets().skip(1).map(|(_, offset)| offset)
    }
}

impl fmt::Debug for SliceList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, s) in self.slices.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", s)?;
        }
        write!(f, "]")
    }
}

/// Field slices that must sit at the same bit position of whichever
/// containers they land in. All slices have the same width.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AlignedCluster {
    slices: SmallVec<[FieldSlice; 2]>,
}

impl AlignedCluster {
    pub fn new<I: IntoIterator<Item = FieldSlice>>(slices: I) -> Self {
        let mut slices: SmallVec<[FieldSlice; 2]> = slices.into_iter().collect();
        assert!(!slices.is_empty(), "empty aligned cluster");
        slices.sort_unstable();
        AlignedCluster { slices }
    }

    #[inline(always)]
    pub fn slices(&self) -> &[FieldSlice] {
        &self.slices[..]
    }

    pub fn width(&self) -> u32 {
        self.slices[0].size()
    }
}

/// Aligned clusters that must share a container up to a uniform
/// rotation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RotationalCluster {
    aligned: SmallVec<[AlignedCluster; 1]>,
}

impl RotationalCluster {
    pub fn new<I: IntoIterator<Item = AlignedCluster>>(aligned: I) -> Self {
        let mut aligned: SmallVec<[AlignedCluster; 1]> = aligned.into_iter().collect();
        assert!(!aligned.is_empty(), "empty rotational cluster");
        aligned.sort_unstable();
        RotationalCluster { aligned }
    }

    /// A rotational cluster with a single aligned cluster.
    pub fn aligned<I: IntoIterator<Item = FieldSlice>>(slices: I) -> Self {
        RotationalCluster::new(core::iter::once(AlignedCluster::new(slices)))
    }

    #[inline(always)]
    pub fn aligned_clusters(&self) -> &[AlignedCluster] {
        &self.aligned[..]
    }

    pub fn slices(&self) -> impl Iterator<Item = FieldSlice> + '_ {
        self.aligned.iter().flat_map(|a| a.slices.iter().copied())
    }

    pub fn width(&self) -> u32 {
        self.aligned[0].width()
    }

    fn first_slice(&self) -> FieldSlice {
        self.aligned[0].slices[0]
    }
}

define_index!(SliceListIndex, SliceLists, SliceList);
define_index!(RotationalClusterIndex, RotationalClusters, RotationalCluster);

/// Where a slice lives within its super-cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceLocation {
    pub list: SliceListIndex,
    pub cluster: RotationalClusterIndex,
    /// Index of the aligned cluster within the rotational cluster.
    pub aligned: u32,
}

/// A structural invariant violated by a super-cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterError {
    /// A slice appears in more than one aligned cluster.
    DuplicateSlice(FieldSlice),
    /// A slice appears in more than one slice list.
    SliceInTwoLists(FieldSlice),
    /// A listed slice is in no cluster.
    SliceNotInCluster(FieldSlice),
    /// A rotational cluster holds slices of different widths.
    MixedWidths(FieldSlice, FieldSlice),
    /// A slice list holds two slices of the same aligned cluster.
    SameAlignedCluster(FieldSlice, FieldSlice),
    /// Two slices of a list require incompatible byte alignments.
    AlignmentConflict(FieldSlice, FieldSlice),
    /// An exact-container list whose width can never fill whole
    /// containers.
    ExactWidth { head: FieldSlice, width: u32 },
    /// A settled list does not fit in any container.
    TooWide { head: FieldSlice, width: u32 },
    /// A bottom-bits field does not start its settled list.
    BottomBits(FieldSlice),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClusterError::DuplicateSlice(s) => write!(f, "{} is in two aligned clusters", s),
            ClusterError::SliceInTwoLists(s) => write!(f, "{} is in two slice lists", s),
            ClusterError::SliceNotInCluster(s) => write!(f, "{} is in no cluster", s),
            ClusterError::MixedWidths(a, b) => {
                write!(f, "{} and {} are co-rotated but differ in width", a, b)
            }
            ClusterError::SameAlignedCluster(a, b) => {
                write!(f, "{} and {} share an aligned cluster and a slice list", a, b)
            }
            ClusterError::AlignmentConflict(a, b) => {
                write!(f, "{} and {} require incompatible alignments", a, b)
            }
            ClusterError::ExactWidth { head, width } => write!(
                f,
                "exact-container list at {} has width {} which fills no containers",
                head, width
            ),
            ClusterError::TooWide { head, width } => {
                write!(f, "settled list at {} is {} bits wide", head, width)
            }
            ClusterError::BottomBits(s) => write!(f, "bottom-bits slice {} is not at bit 0", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ClusterError {}

/// The unit of allocation: slice lists and rotational clusters closed
/// under shared slices.
#[derive(Clone, PartialEq, Eq)]
pub struct SuperCluster {
    lists: SliceLists,
    clusters: RotationalClusters,
    locations: BTreeMap<FieldSlice, SliceLocation>,
}

impl SuperCluster {
    /// Build a super-cluster from clustering output. Slices that are in a
    /// cluster but in no list receive a singleton list.
    pub fn new(
        clusters: Vec<RotationalCluster>,
        lists: Vec<SliceList>,
    ) -> Result<SuperCluster, ClusterError> {
        let mut in_cluster: BTreeMap<FieldSlice, u32> = BTreeMap::new();
        for rot in &clusters {
            let width = rot.width();
            let first = rot.first_slice();
            for slice in rot.slices() {
                if slice.size() != width {
                    return Err(ClusterError::MixedWidths(first, slice));
                }
                if in_cluster.insert(slice, 0).is_some() {
                    return Err(ClusterError::DuplicateSlice(slice));
                }
            }
        }
        for list in &lists {
            for &slice in list.slices() {
                match in_cluster.get_mut(&slice) {
                    None => return Err(ClusterError::SliceNotInCluster(slice)),
                    Some(n) if *n > 0 => return Err(ClusterError::SliceInTwoLists(slice)),
                    Some(n) => *n += 1,
                }
            }
        }
        let mut lists = lists;
        for (&slice, &n) in &in_cluster {
            if n == 0 {
                lists.push(SliceList::new(core::iter::once(slice)));
            }
        }
        let sc = SuperCluster::from_parts(clusters, lists);
        sc.check_structure()?;
        Ok(sc)
    }

    /// Build a super-cluster from parts already known to be consistent:
    /// every slice is in exactly one aligned cluster and exactly one
    /// list.
    pub(crate) fn from_parts(
        mut clusters: Vec<RotationalCluster>,
        mut lists: Vec<SliceList>,
    ) -> SuperCluster {
        clusters.sort_unstable_by_key(|c| c.first_slice());
        lists.sort_unstable_by_key(|l| l.head());
        let clusters: RotationalClusters = clusters.into_iter().collect();
        let lists: SliceLists = lists.into_iter().collect();

        let mut cluster_of: BTreeMap<FieldSlice, (RotationalClusterIndex, u32)> = BTreeMap::new();
        for (ci, rot) in clusters.enumerate() {
            for (ai, aligned) in rot.aligned.iter().enumerate() {
                for &slice in aligned.slices() {
                    let prev = cluster_of.insert(slice, (ci, ai as u32));
                    assert!(prev.is_none(), "slice {} in two aligned clusters", slice);
                }
            }
        }
        let mut locations = BTreeMap::new();
        for (li, list) in lists.enumerate() {
            for &slice in list.slices() {
                let (cluster, aligned) = match cluster_of.get(&slice) {
                    Some(&loc) => loc,
                    None => panic!("slice {} of list {:?} is in no cluster", slice, list),
                };
                let prev = locations.insert(
                    slice,
                    SliceLocation {
                        list: li,
                        cluster,
                        aligned,
                    },
                );
                assert!(prev.is_none(), "slice {} in two slice lists", slice);
            }
        }
        assert_eq!(
            locations.len(),
            cluster_of.len(),
            "every clustered slice must be listed"
        );

        SuperCluster {
            lists,
            clusters,
            locations,
        }
    }

    /// A super-cluster holding one list whose slices are each in their
    /// own rotational cluster.
    pub fn from_list(list: SliceList) -> SuperCluster {
        let clusters = list
            .slices()
            .iter()
            .map(|&s| RotationalCluster::aligned(core::iter::once(s)))
            .collect();
        SuperCluster::from_parts(clusters, alloc::vec![list])
    }

    /// Merge several super-clusters into one.
    pub(crate) fn merge<'a, I: IntoIterator<Item = &'a SuperCluster>>(scs: I) -> SuperCluster {
        let mut clusters = Vec::new();
        let mut lists = Vec::new();
        for sc in scs {
            clusters.extend(sc.clusters.iter().cloned());
            lists.extend(sc.lists.iter().cloned());
        }
        SuperCluster::from_parts(clusters, lists)
    }

    #[inline(always)]
    pub fn lists(&self) -> &SliceLists {
        &self.lists
    }

    #[inline(always)]
    pub fn clusters(&self) -> &RotationalClusters {
        &self.clusters
    }

    pub fn slices(&self) -> impl Iterator<Item = FieldSlice> + '_ {
        self.locations.keys().copied()
    }

    pub fn contains(&self, slice: FieldSlice) -> bool {
        self.locations.contains_key(&slice)
    }

    pub fn location(&self, slice: FieldSlice) -> Option<SliceLocation> {
        self.locations.get(&slice).copied()
    }

    /// The location of a slice that is known to be in this cluster.
    pub fn expect_location(&self, slice: FieldSlice) -> SliceLocation {
        match self.locations.get(&slice) {
            Some(&loc) => loc,
            None => panic!("{} is not part of super-cluster {:?}", slice, self),
        }
    }

    pub fn list_of(&self, slice: FieldSlice) -> &SliceList {
        &self.lists[self.expect_location(slice).list]
    }

    pub fn cluster_of(&self, slice: FieldSlice) -> &RotationalCluster {
        &self.clusters[self.expect_location(slice).cluster]
    }

    /// Slices that must share a container with `slice` up to rotation,
    /// excluding `slice` itself.
    pub fn co_rotated(&self, slice: FieldSlice) -> impl Iterator<Item = FieldSlice> + '_ {
        self.cluster_of(slice).slices().filter(move |&s| s != slice)
    }

    /// The widest slice list.
    pub fn max_width(&self) -> u32 {
        self.lists.iter().map(|l| l.width()).max().unwrap_or(0)
    }

    /// Total bits covered by the super-cluster.
    pub fn total_bits(&self) -> u32 {
        self.slices().map(|s| s.size()).sum()
    }

    fn check_structure(&self) -> Result<(), ClusterError> {
        for list in &self.lists {
            let mut seen: BTreeMap<(RotationalClusterIndex, u32), FieldSlice> = BTreeMap::new();
            for &slice in list.slices() {
                let loc = self.expect_location(slice);
                if let Some(&other) = seen.get(&(loc.cluster, loc.aligned)) {
                    return Err(ClusterError::SameAlignedCluster(other, slice));
                }
                seen.insert((loc.cluster, loc.aligned), slice);
            }
        }
        Ok(())
    }

    /// Check the invariants that must hold for every super-cluster in the
    /// search, settled or not.
    pub fn check_well_formed<P: Program>(&self, program: &P) -> Result<(), ClusterError> {
        self.check_structure()?;
        for list in &self.lists {
            check_alignment(program, list)?;
            if list.is_exact(program) && list.width() % 8 != 0 {
                return Err(ClusterError::ExactWidth {
                    head: list.head(),
                    width: list.width(),
                });
            }
        }
        Ok(())
    }

    /// Check the invariants of a super-cluster that needs no further
    /// split: every list fits one container.
    pub fn check_settled<P: Program>(&self, program: &P) -> Result<(), ClusterError> {
        self.check_well_formed(program)?;
        for list in &self.lists {
            check_settled_list(program, list)?;
        }
        Ok(())
    }
}

/// Check that the alignment requirements of a list's slices agree on a
/// single placement of the list start.
pub(crate) fn check_alignment<P: Program>(program: &P, list: &SliceList) -> Result<(), ClusterError> {
    let mut start: Option<(u32, FieldSlice)> = None;
    for (slice, offset) in list.with_offsets() {
        if let Some(align) = slice.alignment(program.field(slice.field)) {
            let list_start = (align + 8 - offset % 8) % 8;
            match start {
                None => start = Some((list_start, slice)),
                Some((s, other)) if s != list_start => {
                    return Err(ClusterError::AlignmentConflict(other, slice));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// The container bit (mod 8) at which the list must start, if any slice
/// has an alignment requirement.
pub(crate) fn list_start_alignment<P: Program>(program: &P, list: &SliceList) -> Option<u32> {
    list.with_offsets().find_map(|(slice, offset)| {
        slice
            .alignment(program.field(slice.field))
            .map(|align| (align + 8 - offset % 8) % 8)
    })
}

pub(crate) fn check_settled_list<P: Program>(program: &P, list: &SliceList) -> Result<(), ClusterError> {
    let width = list.width();
    if width > ContainerSize::max().bits() {
        return Err(ClusterError::TooWide {
            head: list.head(),
            width,
        });
    }
    if list.is_exact(program) && ContainerSize::from_bits(width).is_none() {
        return Err(ClusterError::ExactWidth {
            head: list.head(),
            width,
        });
    }
    let start = list_start_alignment(program, list).unwrap_or(0);
    for (slice, offset) in list.with_offsets() {
        if program.field(slice.field).bottom_bits && slice.lo() == 0 && (offset != 0 || start != 0) {
            return Err(ClusterError::BottomBits(slice));
        }
    }
    Ok(())
}

impl fmt::Debug for SuperCluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SuperCluster {{ lists: [")?;
        for (i, list) in self.lists.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", list)?;
        }
        write!(f, "], clusters: [")?;
        for (i, rot) in self.clusters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "<")?;
            for (j, aligned) in rot.aligned_clusters().iter().enumerate() {
                if j > 0 {
                    write!(f, " ~ ")?;
                }
                write!(f, "{:?}", aligned.slices())?;
            }
            write!(f, ">")?;
        }
        write!(f, "] }}")
    }
}

#[cfg(test)]
mod tests;
