/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Action constraint solver.
//!
//! Given the bits one action writes into one destination container, decide
//! whether a single ALU instruction can perform all of the writes at once,
//! and if so which one. The supported shapes are a closed set:
//!
//! ```text
//! deposit-field:      D = ((S1 rotl r) & M) | (S2 & ~M)           M contiguous
//! byte-rotate-merge:  D = ((S1 rotl r1) & M) | ((S2 rotl r2) & ~M) r1, r2, M in bytes
//! bitmasked-set:      D = (S1 & M) | (S2 & ~M)                    M arbitrary
//! container-set:      D = S
//! bitwise:            D = S1 op S2
//! ```
//!
//! Every instruction can be replayed bit by bit with `Instruction::eval`,
//! which is what the solver uses to accept a candidate and what the
//! checker uses to verify one independently.

use crate::bitvec::BitSet;
use crate::{BitRange, Container, WriteKind};
use alloc::vec::Vec;
use core::fmt;

mod solver;
pub use solver::solve;

/// What a destination range is written from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Operand {
    /// Bits of an allocated (or speculatively placed) container.
    Container(Container, BitRange),
    /// Action data. Action data and constants are laid out on the
    /// action-data bus to suit the destination, so they are always
    /// aligned.
    ActionData(BitRange),
    Constant(BitRange),
    /// A source field slice that has no container yet.
    Unallocated(BitRange),
}

impl Operand {
    /// The width of the operand in bits.
    pub fn size(&self) -> u32 {
        match *self {
            Operand::Container(_, r)
            | Operand::ActionData(r)
            | Operand::Constant(r)
            | Operand::Unallocated(r) => r.size(),
        }
    }
}

/// One write of a destination bit range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Assign {
    pub dst: BitRange,
    pub src: Operand,
    pub kind: WriteKind,
}

impl Assign {
    pub fn new(dst: BitRange, src: Operand, kind: WriteKind) -> Self {
        assert_eq!(
            dst.size(),
            src.size(),
            "assignment of {} from {:?} changes width",
            dst,
            src
        );
        Assign { dst, src, kind }
    }

    pub fn mov(dst: BitRange, src: Operand) -> Self {
        Assign::new(dst, src, WriteKind::Move)
    }

    /// The source bit that destination bit `bit` is written from, with
    /// action data and constants aligned to the destination.
    pub fn source_bit(&self, bit: u32) -> (Source, u32) {
        debug_assert!(self.dst.contains(bit));
        match self.src {
            Operand::Container(c, r) => (Source::Container(c), r.lo + (bit - self.dst.lo)),
            Operand::ActionData(_) | Operand::Constant(_) => (Source::ActionData, bit),
            Operand::Unallocated(_) => (Source::Unallocated, bit),
        }
    }
}

/// The destination container and which of its bits hold live fields.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ContainerSpec {
    pub container: Container,
    pub live: BitSet,
}

impl ContainerSpec {
    pub fn new(container: Container, live: BitSet) -> Self {
        debug_assert!(live.max().map_or(true, |m| m < container.width() as usize));
        ContainerSpec { container, live }
    }

    /// A container with every bit live.
    pub fn full(container: Container) -> Self {
        ContainerSpec::new(container, BitSet::from_range(0, container.width() as usize))
    }

    #[inline(always)]
    pub fn width(&self) -> u32 {
        self.container.width()
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Source {
    Container(Container),
    /// The action-data bus (action data and constants).
    ActionData,
    /// Whatever container the unallocated sources end up in.
    Unallocated,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Container(c) => write!(f, "{}", c),
            Source::ActionData => write!(f, "ad"),
            Source::Unallocated => write!(f, "?"),
        }
    }
}

/// A synthesized ALU instruction. Rotations are left rotations over the
/// destination width: destination bit `i` reads source bit
/// `(i - rot) mod width`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Instruction {
    DepositField {
        src1: Source,
        rot: u32,
        mask: BitRange,
        src2: Source,
    },
    ByteRotateMerge {
        src1: Source,
        rot1: u32,
        src2: Source,
        rot2: u32,
        mask: BitSet,
    },
    BitmaskedSet {
        src1: Source,
        src2: Source,
        mask: BitSet,
    },
    ContainerSet {
        src: Source,
    },
    Bitwise {
        src1: Source,
        src2: Option<Source>,
    },
}

/// The symbolic value of one destination bit after an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitValue {
    /// A copy of bit `.1` of a source.
    From(Source, u32),
    /// A bitwise combination of the same bit of two sources.
    Combine(Source, Source, u32),
}

impl BitValue {
    /// Does this bit carry bit `bit` of `src`?
    pub fn carries(self, src: Source, bit: u32) -> bool {
        match self {
            BitValue::From(s, b) => s == src && b == bit,
            BitValue::Combine(a, b, i) => (a == src || b == src) && i == bit,
        }
    }
}

impl Instruction {
    /// Replay the instruction on a `width`-bit destination.
    pub fn eval(&self, width: u32) -> Vec<BitValue> {
        let rotated = |src: Source, rot: u32, i: u32| BitValue::From(src, (i + width - rot) % width);
        (0..width)
            .map(|i| match self {
                Instruction::DepositField {
                    src1,
                    rot,
                    mask,
                    src2,
                } => {
                    if mask.contains(i) {
                        rotated(*src1, *rot, i)
                    } else {
                        BitValue::From(*src2, i)
                    }
                }
                Instruction::ByteRotateMerge {
                    src1,
                    rot1,
                    src2,
                    rot2,
                    mask,
                } => {
                    if mask.contains(i as usize) {
                        rotated(*src1, *rot1, i)
                    } else {
                        rotated(*src2, *rot2, i)
                    }
                }
                Instruction::BitmaskedSet { src1, src2, mask } => {
                    if mask.contains(i as usize) {
                        BitValue::From(*src1, i)
                    } else {
                        BitValue::From(*src2, i)
                    }
                }
                Instruction::ContainerSet { src } => BitValue::From(*src, i),
                Instruction::Bitwise { src1, src2 } => match src2 {
                    Some(src2) => BitValue::Combine(*src1, *src2, i),
                    None => BitValue::From(*src1, i),
                },
            })
            .collect()
    }

    /// The operands read by the instruction.
    pub fn sources(&self) -> impl Iterator<Item = Source> {
        let (a, b) = match *self {
            Instruction::DepositField { src1, src2, .. }
            | Instruction::ByteRotateMerge { src1, src2, .. }
            | Instruction::BitmaskedSet { src1, src2, .. } => (src1, Some(src2)),
            Instruction::ContainerSet { src } => (src, None),
            Instruction::Bitwise { src1, src2 } => (src1, src2),
        };
        core::iter::once(a).chain(b)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instruction::DepositField { .. } => "deposit-field",
            Instruction::ByteRotateMerge { .. } => "byte-rotate-merge",
            Instruction::BitmaskedSet { .. } => "bitmasked-set",
            Instruction::ContainerSet { .. } => "container-set",
            Instruction::Bitwise { .. } => "bitwise",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::DepositField {
                src1,
                rot,
                mask,
                src2,
            } => write!(
                f,
                "deposit-field {} rotl {} mask {}, {}",
                src1, rot, mask, src2
            ),
            Instruction::ByteRotateMerge {
                src1,
                rot1,
                src2,
                rot2,
                mask,
            } => write!(
                f,
                "byte-rotate-merge {} rotl {}, {} rotl {} mask {:?}",
                src1, rot1, src2, rot2, mask
            ),
            Instruction::BitmaskedSet { src1, src2, mask } => {
                write!(f, "bitmasked-set {}, {} mask {:?}", src1, src2, mask)
            }
            Instruction::ContainerSet { src } => write!(f, "container-set {}", src),
            Instruction::Bitwise { src1, src2: None } => write!(f, "bitwise {}", src1),
            Instruction::Bitwise {
                src1,
                src2: Some(src2),
            } => write!(f, "bitwise {}, {}", src1, src2),
        }
    }
}

/// Why no instruction realizes a set of assignments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ActionError {
    /// No candidate instruction reproduces the required bits.
    Unsat,
    /// More than two distinct sources.
    TooManySources,
    /// More than one rotated source, and they cannot be byte-rotated.
    TooManyUnalignedSources,
    /// The writes do not fit any instruction form (mixed write kinds,
    /// misaligned bitwise operands, mismatched container sizes).
    InvalidShape,
    /// Live bits are left unwritten, so the background operand must be the
    /// destination, but both operands are taken by other sources.
    BackgroundMustBeDest,
    /// A rotated source would need a rotation that is not a multiple of a
    /// byte.
    NotByteShiftable,
    /// A whole-container write would overwrite live bits it does not set.
    WholeContainerCorruptsLive,
    /// The source kind cannot be read by the destination container kind.
    DisallowedSource,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ActionError::Unsat => "no instruction realizes the assignments",
            ActionError::TooManySources => "too many sources",
            ActionError::TooManyUnalignedSources => "too many unaligned sources",
            ActionError::InvalidShape => "invalid shape for this instruction",
            ActionError::BackgroundMustBeDest => "background source must be the destination",
            ActionError::NotByteShiftable => "rotation is not byte-shiftable",
            ActionError::WholeContainerCorruptsLive => {
                "whole-container write would corrupt live bits"
            }
            ActionError::DisallowedSource => "source not allowed for this container kind",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ActionError {}

/// Solver options.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SolverOptions {
    /// Allow bitmasked-set, which consumes an extra action-data bus slot.
    pub enable_bitmasked_set: bool,
}

impl From<&crate::SlicingOptions> for SolverOptions {
    fn from(options: &crate::SlicingOptions) -> Self {
        SolverOptions {
            enable_bitmasked_set: options.enable_bitmasked_set,
        }
    }
}

#[cfg(test)]
mod tests;
