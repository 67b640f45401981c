/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies search and solver results independently of the code
//! that produced them.
//!
//! For instructions, the synthesized formula is replayed symbolically:
//! every destination bit becomes "bit `b` of source `S`" (or a bitwise
//! combination of two sources at the same bit). Each assigned bit must
//! then carry exactly the source bit the assignment names, and each live
//! bit that no assignment writes must carry the destination's own bit. On
//! top of the bit-level replay the checker enforces the structural limits
//! of each instruction form, which the replay alone cannot see: a
//! deposit-field mask is one contiguous run and its background is read
//! unrotated, byte-rotate-merge rotates and masks by whole bytes, and
//! restricted container kinds only accept container-set.
//!
//! For slicings, the checker confirms that the output super-clusters are
//! settled and cover exactly the bits of the input.

use crate::action::{Assign, BitValue, ContainerSpec, Instruction, Operand, Source};
use crate::bitvec::BitSet;
use crate::cluster::{ClusterError, SuperCluster};
use crate::{ContainerKind, FieldId, Program};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

/// A set of errors detected by the checker.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
    errors: Vec<CheckerError>,
}

impl CheckerErrors {
    pub fn errors(&self) -> &[CheckerError] {
        &self.errors[..]
    }
}

/// A single error detected by the checker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
    /// An assigned bit does not receive its source bit.
    WrongValue {
        bit: u32,
        expected: (Source, u32),
        actual: BitValue,
    },
    /// An unallocated source bit is taken from the destination or the
    /// action-data bus, or from the wrong position.
    BadUnallocated { bit: u32, actual: BitValue },
    /// A live bit that nothing writes was changed.
    LiveBitClobbered { bit: u32, actual: BitValue },
    /// A rotation outside the container or not allowed by the form.
    BadRotation { rot: u32 },
    /// A mask that the form cannot encode.
    BadMask,
    /// The destination container kind does not support the form.
    FormNotSupported,
    /// A source that the destination container kind cannot read.
    DisallowedSource(Source),
    /// A super-cluster of the solution is not settled.
    NotSettled(ClusterError),
    /// The bits of a field covered by the solution differ from the input.
    CoverageMismatch(FieldId),
}

impl fmt::Display for CheckerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CheckerError::WrongValue {
                bit,
                expected,
                actual,
            } => write!(
                f,
                "bit {} should be {}[{}] but is {:?}",
                bit, expected.0, expected.1, actual
            ),
            CheckerError::BadUnallocated { bit, actual } => {
                write!(f, "unallocated bit {} is taken from {:?}", bit, actual)
            }
            CheckerError::LiveBitClobbered { bit, actual } => {
                write!(f, "live bit {} is clobbered by {:?}", bit, actual)
            }
            CheckerError::BadRotation { rot } => write!(f, "invalid rotation {}", rot),
            CheckerError::BadMask => write!(f, "invalid mask"),
            CheckerError::FormNotSupported => {
                write!(f, "instruction form not supported by the container")
            }
            CheckerError::DisallowedSource(src) => write!(f, "source {} not allowed", src),
            CheckerError::NotSettled(e) => write!(f, "unsettled super-cluster: {}", e),
            CheckerError::CoverageMismatch(field) => {
                write!(f, "bits of {} are lost or duplicated", field)
            }
        }
    }
}

impl fmt::Display for CheckerErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CheckerErrors {}

fn into_result(errors: Vec<CheckerError>) -> Result<(), CheckerErrors> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CheckerErrors { errors })
    }
}

fn check_form(spec: &ContainerSpec, instr: &Instruction, errors: &mut Vec<CheckerError>) {
    let width = spec.width();
    let normal = spec.container.kind() == ContainerKind::Normal;
    match instr {
        Instruction::DepositField { rot, mask, .. } => {
            if !normal {
                errors.push(CheckerError::FormNotSupported);
            }
            if *rot >= width {
                errors.push(CheckerError::BadRotation { rot: *rot });
            }
            if mask.hi >= width {
                errors.push(CheckerError::BadMask);
            }
        }
        Instruction::ByteRotateMerge {
            rot1, rot2, mask, ..
        } => {
            if !normal {
                errors.push(CheckerError::FormNotSupported);
            }
            for &rot in &[*rot1, *rot2] {
                if rot >= width || rot % 8 != 0 {
                    errors.push(CheckerError::BadRotation { rot });
                }
            }
            let bytes_whole = mask
                .ranges()
                .iter()
                .all(|&(lo, hi)| lo % 8 == 0 && (hi + 1) % 8 == 0);
            if !bytes_whole || mask.max().map_or(false, |m| m >= width as usize) {
                errors.push(CheckerError::BadMask);
            }
        }
        Instruction::BitmaskedSet { mask, .. } => {
            if !normal {
                errors.push(CheckerError::FormNotSupported);
            }
            if mask.max().map_or(false, |m| m >= width as usize) {
                errors.push(CheckerError::BadMask);
            }
        }
        Instruction::Bitwise { .. } => {
            if !normal {
                errors.push(CheckerError::FormNotSupported);
            }
        }
        Instruction::ContainerSet { src } => {
            if spec.container.kind() == ContainerKind::Dark {
                let allowed = match src {
                    Source::Container(c) => c.kind() == ContainerKind::Normal,
                    Source::Unallocated => true,
                    Source::ActionData => false,
                };
                if !allowed {
                    errors.push(CheckerError::DisallowedSource(*src));
                }
            }
        }
    }
}

/// Verify that `instr` realizes `assigns` in the container described by
/// `spec` without disturbing any other live bit.
pub fn check_instruction(
    spec: &ContainerSpec,
    assigns: &[Assign],
    instr: &Instruction,
) -> Result<(), CheckerErrors> {
    let mut errors = Vec::new();
    check_form(spec, instr, &mut errors);

    let dest = Source::Container(spec.container);
    let values = instr.eval(spec.width());
    let mut written = BitSet::new();
    for assign in assigns {
        for bit in assign.dst.lo..=assign.dst.hi {
            written.insert(bit as usize);
            let actual = values[bit as usize];
            match assign.src {
                Operand::Unallocated(_) => {
                    let ok = match actual {
                        BitValue::From(src, b) => {
                            src != dest && src != Source::ActionData && b == bit
                        }
                        BitValue::Combine(_, _, b) => b == bit,
                    };
                    if !ok {
                        errors.push(CheckerError::BadUnallocated { bit, actual });
                    }
                }
                _ => {
                    let expected = assign.source_bit(bit);
                    if !actual.carries(expected.0, expected.1) {
                        errors.push(CheckerError::WrongValue {
                            bit,
                            expected,
                            actual,
                        });
                    }
                }
            }
        }
    }
    for bit in spec.live.difference(&written).iter() {
        let actual = values[bit];
        if actual != BitValue::From(dest, bit as u32) {
            errors.push(CheckerError::LiveBitClobbered {
                bit: bit as u32,
                actual,
            });
        }
    }
    into_result(errors)
}

fn coverage<'a, I: IntoIterator<Item = &'a SuperCluster>>(scs: I) -> BTreeMap<FieldId, Vec<u32>> {
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

/// Verify that `clusters` is a complete slicing of `input`: every
/// super-cluster is settled, and every bit of every field appears exactly
/// as often as in the input.
pub fn check_slicing<P: Program>(
    program: &P,
    input: &SuperCluster,
    clusters: &[SuperCluster],
) -> Result<(), CheckerErrors> {
    let mut errors = Vec::new();
    for sc in clusters {
        if let Err(e) = sc.check_settled(program) {
            errors.push(CheckerError::NotSettled(e));
        }
    }
    let expected = coverage(core::iter::once(input));
    let actual = coverage(clusters);
    for (field, bits) in &expected {
        if actual.get(field) != Some(bits) {
            errors.push(CheckerError::CoverageMismatch(*field));
        }
    }
    for field in actual.keys() {
        if !expected.contains_key(field) {
            errors.push(CheckerError::CoverageMismatch(*field));
        }
    }
    into_result(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BitRange, Container};

    #[test]
    fn catches_clobbered_live_bits() {
        let spec = ContainerSpec::full(Container::h(1));
        let assigns = [Assign::mov(
            BitRange::new(0, 3),
            Operand::Container(Container::h(2), BitRange::new(0, 3)),
        )];
        // The mask covers more than the assignment.
        let instr = Instruction::DepositField {
            src1: Source::Container(Container::h(2)),
            rot: 0,
            mask: BitRange::new(0, 7),
            src2: Source::Container(Container::h(1)),
        };
        let errors = check_instruction(&spec, &assigns, &instr).unwrap_err();
        assert_eq!(errors.errors().len(), 4);
        assert!(matches!(
            errors.errors()[0],
            CheckerError::LiveBitClobbered { bit: 4, .. }
        ));
    }

    #[test]
    fn catches_bad_forms() {
        let spec = ContainerSpec::new(Container::h(1), BitSet::new());
        let assigns = [Assign::mov(
            BitRange::new(0, 15),
            Operand::Container(Container::h(2), BitRange::new(0, 15)),
        )];
        let instr = Instruction::ByteRotateMerge {
            src1: Source::Container(Container::h(2)),
            rot1: 0,
            src2: Source::Container(Container::h(1)),
            rot2: 4,
            mask: BitSet::from_range(0, 16),
        };
        let errors = check_instruction(&spec, &assigns, &instr).unwrap_err();
        assert_eq!(errors.errors(), [CheckerError::BadRotation { rot: 4 }]);

        let wrong = Instruction::ContainerSet {
            src: Source::ActionData,
        };
        let errors = check_instruction(&spec, &assigns, &wrong).unwrap_err();
        assert_eq!(errors.errors().len(), 16);
        assert!(check_instruction(
            &spec,
            &assigns,
            &Instruction::ContainerSet {
                src: Source::Container(Container::h(2))
            }
        )
        .is_ok());
    }
}
