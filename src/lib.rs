/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Slicing search and action synthesis for packet-header container
//! allocation.
//!
//! Logical header and metadata fields must be placed into a fixed
//! inventory of 8/16/32-bit containers. Before any container can be
//! chosen, groups of co-located field slices (super-clusters) have to
//! be cut into container-sized pieces, and every cut must keep each
//! action that writes the pieces expressible as a single ALU
//! instruction. This crate implements that search:
//!
//! - [`cluster`]: the grouping structures and the split operation;
//! - [`action`]: the per-container instruction synthesis solver;
//! - [`pack`]: the packing validator that speculates container sizes
//!   and calls the solver while the search is still in progress;
//! - [`slicing`]: the depth-first slicing iterator.

#![allow(dead_code)]
#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

use alloc::collections::BTreeMap;
use alloc::string::String;
use core::fmt;
use smallvec::SmallVec;

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, rustc_hash::FxBuildHasher>;

#[macro_use]
mod index;

pub mod action;
pub mod bitvec;
pub mod checker;
pub mod cluster;
pub mod pack;
pub mod slicing;
pub mod table;
pub(crate) mod unionfind;

#[cfg(feature = "enable-serde")]
pub mod serialize;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

pub use action::{ActionError, Instruction};
pub use cluster::{SliceList, SuperCluster};
pub use pack::PackingFailure;
pub use slicing::{AfterSplitConstraint, SlicingIterator, Solution, Stats};

define_index!(FieldId);
define_index!(ActionId);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "act{}", self.0)
    }
}

/// A closed range of bit indices, `[lo, hi]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BitRange {
    pub lo: u32,
    pub hi: u32,
}

impl BitRange {
    #[inline(always)]
    pub fn new(lo: u32, hi: u32) -> Self {
        debug_assert!(lo <= hi);
        BitRange { lo, hi }
    }

    /// The range of `len` bits starting at `lo`.
    #[inline(always)]
    pub fn start_len(lo: u32, len: u32) -> Self {
        debug_assert!(len > 0);
        BitRange::new(lo, lo + len - 1)
    }

    #[inline(always)]
    pub fn size(self) -> u32 {
        self.hi - self.lo + 1
    }

    #[inline(always)]
    pub fn contains(self, bit: u32) -> bool {
        self.lo <= bit && bit <= self.hi
    }

    #[inline(always)]
    pub fn overlaps(self, other: BitRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    #[inline(always)]
    pub fn shifted(self, by: u32) -> BitRange {
        BitRange::new(self.lo + by, self.hi + by)
    }
}

impl fmt::Display for BitRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}..{}]", self.lo, self.hi)
    }
}

/// How the parser is allowed to write a field. Fields with different
/// modes can never share a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ParserWriteMode {
    SingleWrite,
    BitwiseOr,
    ClearOnWrite,
}

/// A logical packet-header or metadata field and the layout attributes
/// that the slicing search consults.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Field {
    pub name: String,
    /// Width in bits.
    pub size: u32,
    /// The field must never be cut into pieces.
    pub no_split: bool,
    /// The field must occupy containers with no slack.
    pub exact_containers: bool,
    /// Required container bit position (mod 8) of bit 0 of the field.
    pub alignment: Option<u32>,
    /// The field is emitted by the deparser.
    pub deparsed: bool,
    /// The field is metadata rather than a packet header field.
    pub metadata: bool,
    /// The lowest bit of the field must sit at container bit 0.
    pub bottom_bits: bool,
    pub parser_write_mode: Option<ParserWriteMode>,
    /// The field is an operand of a wide (multi-container) arithmetic
    /// operation; all of its slices are allocated together.
    pub wide_arith: bool,
    /// Fields sharing a group id are allocated together.
    pub container_group: Option<u32>,
}

impl Field {
    /// A plain field with no layout attributes.
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Field {
            name: name.into(),
            size,
            no_split: false,
            exact_containers: false,
            alignment: None,
            deparsed: false,
            metadata: false,
            bottom_bits: false,
            parser_write_mode: None,
            wide_arith: false,
            container_group: None,
        }
    }

    /// A deparsed header field: exact containers, deparsed.
    pub fn header(name: impl Into<String>, size: u32) -> Self {
        Field {
            exact_containers: true,
            deparsed: true,
            ..Field::new(name, size)
        }
    }

    /// A metadata field.
    pub fn metadata(name: impl Into<String>, size: u32) -> Self {
        Field {
            metadata: true,
            ..Field::new(name, size)
        }
    }
}

/// A contiguous bit range of one field. Equality is field identity plus
/// range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct FieldSlice {
    pub field: FieldId,
    pub range: BitRange,
}

impl FieldSlice {
    #[inline(always)]
    pub fn new(field: FieldId, range: BitRange) -> Self {
        FieldSlice { field, range }
    }

    /// The slice covering the whole of `field`.
    pub fn whole(field: FieldId, size: u32) -> Self {
        FieldSlice::new(field, BitRange::start_len(0, size))
    }

    #[inline(always)]
    pub fn size(self) -> u32 {
        self.range.size()
    }

    #[inline(always)]
    pub fn lo(self) -> u32 {
        self.range.lo
    }

    #[inline(always)]
    pub fn hi(self) -> u32 {
        self.range.hi
    }

    /// Cut this slice so that the second piece starts `offset` bits into
    /// it. `offset` must be strictly inside the slice.
    pub fn split_at(self, offset: u32) -> (FieldSlice, FieldSlice) {
        debug_assert!(offset > 0 && offset < self.size());
        let mid = self.range.lo + offset;
        (
            FieldSlice::new(self.field, BitRange::new(self.range.lo, mid - 1)),
            FieldSlice::new(self.field, BitRange::new(mid, self.range.hi)),
        )
    }

    /// The sub-slice `[lo, hi]` relative to the start of this slice.
    pub fn sub(self, rel: BitRange) -> FieldSlice {
        debug_assert!(rel.hi < self.size());
        FieldSlice::new(self.field, rel.shifted(self.range.lo))
    }

    /// Required container bit position (mod 8) of this slice's low bit,
    /// if the field has an alignment requirement.
    pub fn alignment(self, field: &Field) -> Option<u32> {
        field.alignment.map(|a| (a + self.range.lo) % 8)
    }
}

impl fmt::Debug for FieldSlice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.field, self.range)
    }
}

impl fmt::Display for FieldSlice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.field, self.range)
    }
}

/// The width of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ContainerSize {
    B8 = 8,
    B16 = 16,
    B32 = 32,
}

impl ContainerSize {
    pub const ALL: [ContainerSize; 3] = [ContainerSize::B8, ContainerSize::B16, ContainerSize::B32];

    #[inline(always)]
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<ContainerSize> {
        match bits {
            8 => Some(ContainerSize::B8),
            16 => Some(ContainerSize::B16),
            32 => Some(ContainerSize::B32),
            _ => None,
        }
    }

    /// The smallest container that holds `width` bits.
    pub fn round_up(width: u32) -> Option<ContainerSize> {
        ContainerSize::ALL.iter().copied().find(|s| s.bits() >= width)
    }

    #[inline(always)]
    pub fn max() -> ContainerSize {
        ContainerSize::B32
    }
}

impl fmt::Display for ContainerSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}b", self.bits())
    }
}

/// Container kinds. Only `Normal` containers have a full ALU; the
/// restricted kinds can only be overwritten as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ContainerKind {
    Normal,
    Mocha,
    Dark,
}

/// A physical (or speculated) container.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Container {
    kind: ContainerKind,
    size: ContainerSize,
    index: u32,
}

impl Container {
    #[inline(always)]
    pub const fn new(kind: ContainerKind, size: ContainerSize, index: u32) -> Self {
        Container { kind, size, index }
    }

    #[inline(always)]
    pub const fn normal(size: ContainerSize, index: u32) -> Self {
        Container::new(ContainerKind::Normal, size, index)
    }

    /// Normal 8-bit container `B<index>`.
    pub const fn b(index: u32) -> Self {
        Container::normal(ContainerSize::B8, index)
    }

    /// Normal 16-bit container `H<index>`.
    pub const fn h(index: u32) -> Self {
        Container::normal(ContainerSize::B16, index)
    }

    /// Normal 32-bit container `W<index>`.
    pub const fn w(index: u32) -> Self {
        Container::normal(ContainerSize::B32, index)
    }

    #[inline(always)]
    pub fn kind(self) -> ContainerKind {
        self.kind
    }

    #[inline(always)]
    pub fn size(self) -> ContainerSize {
        self.size
    }

    #[inline(always)]
    pub fn width(self) -> u32 {
        self.size.bits()
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ContainerKind::Normal => "",
            ContainerKind::Mocha => "M",
            ContainerKind::Dark => "D",
        };
        let size = match self.size {
            ContainerSize::B8 => "B",
            ContainerSize::B16 => "H",
            ContainerSize::B32 => "W",
        };
        write!(f, "{}{}{}", kind, size, self.index)
    }
}

/// How an action writes a destination slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum WriteKind {
    /// A register-to-register (or action-data-to-register) move.
    Move,
    /// A bitwise operation (and/or/xor/...), which the ALU applies to the
    /// whole container with no rotation.
    Bitwise,
    /// An operation that overwrites the whole container.
    WholeContainer,
}

/// What a write reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum SourceOperand {
    /// Another field slice, of the same width as the written slice.
    Slice(FieldSlice),
    /// Action data from the action-data bus.
    ActionData,
    /// An immediate constant.
    Constant(u64),
}

/// One write into (part of) a field slice, as reported by the action
/// source tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SourceOp {
    /// The written sub-slice of the queried slice.
    pub dst: FieldSlice,
    pub kind: WriteKind,
    pub source: SourceOperand,
}

pub type SourceOps = SmallVec<[SourceOp; 2]>;

/// The program whose fields are being sliced. This trait gathers all of
/// the collaborators the search consults: the field table, the action
/// source tracker, the referenced-field predicate, the pack-conflict
/// query and the per-field container size directives.
pub trait Program {
    fn num_fields(&self) -> usize;

    fn field(&self, field: FieldId) -> &Field;

    /// For each action that writes any bit of `slice`, the write
    /// operations restricted to `slice`. Source slices are returned
    /// bit-for-bit aligned with the written sub-slice.
    fn sources(&self, slice: FieldSlice) -> BTreeMap<ActionId, SourceOps>;

    /// Is the field read or written by any action?
    fn is_referenced(&self, _field: FieldId) -> bool {
        true
    }

    /// May `a` and `b` never share a container?
    fn has_pack_conflict(&self, _a: FieldSlice, _b: FieldSlice) -> bool {
        false
    }

    /// Explicit container-size layout directive for a field, in field bit
    /// order.
    fn container_sizes(&self, _field: FieldId) -> Option<&[ContainerSize]> {
        None
    }

    /// A name for the action, for diagnostics.
    fn action_name(&self, action: ActionId) -> String {
        alloc::format!("{}", action)
    }
}

/// Options for the slicing search.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SlicingOptions {
    /// Prefer choices that force fewer slices into a shared container.
    pub minimal_packing: bool,
    /// Only validate settled slice lists; skip the pessimistic per-byte
    /// check of lists that can still be split.
    pub loose_action_packing: bool,
    /// Unwind directly to the frame that produced a slice list once the
    /// list has been invalidated too many times.
    pub smart_backtracking: bool,
    /// Cut exact-container lists into equal pieces in one step.
    pub homogeneous_slicing: bool,
    /// Allow the solver to use bitmasked-set instructions.
    pub enable_bitmasked_set: bool,
    /// Search nodes to expand before giving up (and, once, retrying with
    /// wide slices pre-split).
    pub max_search_steps: usize,
    /// How many invalidations of one slice list are absorbed by ordinary
    /// backtracking before the search unwinds to the frame that made it.
    pub max_ignored_invalidations: usize,
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
}

impl Default for SlicingOptions {
    fn default() -> Self {
        SlicingOptions {
            minimal_packing: false,
            loose_action_packing: false,
            smart_backtracking: true,
            homogeneous_slicing: false,
            enable_bitmasked_set: false,
            max_search_steps: 1 << 16,
            max_ignored_invalidations: 8,
            verbose_log: false,
        }
    }
}

/// An error that prevents the slicing search from starting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlicingError {
    /// The input super-cluster violates a structural invariant.
    IllFormed(cluster::ClusterError),
    /// A mandatory pre-split could not be applied.
    PreSplit(cluster::SplitError),
}

impl fmt::Display for SlicingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlicingError::IllFormed(e) => write!(f, "ill-formed super-cluster: {}", e),
            SlicingError::PreSplit(e) => write!(f, "pre-split failed: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SlicingError {}

impl From<cluster::ClusterError> for SlicingError {
    fn from(e: cluster::ClusterError) -> Self {
        SlicingError::IllFormed(e)
    }
}

impl From<cluster::SplitError> for SlicingError {
    fn from(e: cluster::SplitError) -> Self {
        SlicingError::PreSplit(e)
    }
}

/// Slice `sc` into container-sized pieces. Returns the lazy sequence of
/// complete slicings.
pub fn slice<'a, P: Program>(
    program: &'a P,
    sc: SuperCluster,
    options: &SlicingOptions,
) -> Result<SlicingIterator<'a, P>, SlicingError> {
    SlicingIterator::new(program, sc, *options)
}
