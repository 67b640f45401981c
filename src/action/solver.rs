/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Instruction synthesis for one destination container.

use super::{ActionError, Assign, BitValue, ContainerSpec, Instruction, Operand, SolverOptions, Source};
use crate::bitvec::BitSet;
use crate::{BitRange, ContainerKind, WriteKind};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use smallvec::{smallvec, SmallVec};

/// An instruction operand together with the rotation it is read with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Group {
    src: Source,
    rot: u32,
}

/// What a destination bit must hold after the instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Need {
    /// Bit `.1` of source `.0`.
    Bit(Source, u32),
    /// The same bit of any operand other than the destination.
    Unallocated,
}

/// The per-bit requirements of one write event, and the operands that can
/// satisfy them.
struct Problem {
    width: u32,
    dest: Source,
    needs: Vec<(u32, Need)>,
    /// Destination bits written from each operand group.
    groups: BTreeMap<Group, BitSet>,
    unallocated: BitSet,
    live_unassigned: BitSet,
}

impl Problem {
    fn new(spec: &ContainerSpec, assigns: &[Assign]) -> Problem {
        let width = spec.width();
        let dest = Source::Container(spec.container);
        let mut needs = Vec::new();
        let mut groups: BTreeMap<Group, BitSet> = BTreeMap::new();
        let mut unallocated = BitSet::new();
        let mut written = BitSet::new();
        for assign in assigns {
            assert!(
                assign.dst.hi < width,
                "assignment to {} overflows {}",
                assign.dst,
                spec.container
            );
            let bits = BitSet::from_range(assign.dst.lo as usize, assign.dst.size() as usize);
            written.union_with(&bits);
            match assign.src {
                Operand::Container(c, r) => {
                    let rot = (assign.dst.lo + width - r.lo % width) % width;
                    groups
                        .entry(Group {
                            src: Source::Container(c),
                            rot,
                        })
                        .or_default()
                        .union_with(&bits);
                }
                Operand::ActionData(_) | Operand::Constant(_) => {
                    groups
                        .entry(Group {
                            src: Source::ActionData,
                            rot: 0,
                        })
                        .or_default()
                        .union_with(&bits);
                }
                Operand::Unallocated(_) => unallocated.union_with(&bits),
            }
            for bit in assign.dst.lo..=assign.dst.hi {
                let need = match assign.src {
                    Operand::Unallocated(_) => Need::Unallocated,
                    _ => {
                        let (src, b) = assign.source_bit(bit);
                        Need::Bit(src, b)
                    }
                };
                needs.push((bit, need));
            }
        }
        let live_unassigned = spec.live.difference(&written);
        for bit in live_unassigned.iter() {
            needs.push((bit as u32, Need::Bit(dest, bit as u32)));
        }
        Problem {
            width,
            dest,
            needs,
            groups,
            unallocated,
            live_unassigned,
        }
    }

    fn rotated(&self) -> impl Iterator<Item = Group> + '_ {
        self.groups.keys().copied().filter(|g| g.rot != 0)
    }

    /// The bits that operand `g` is responsible for.
    fn bits_of(&self, g: Group) -> BitSet {
        if let Some(bits) = self.groups.get(&g) {
            return bits.clone();
        }
        if g.src == Source::Unallocated {
            self.unallocated.clone()
        } else if g.src == self.dest && g.rot == 0 {
            self.live_unassigned.clone()
        } else {
            BitSet::new()
        }
    }

    /// Candidate operands, in preference order for the rotated/masked
    /// operand S1: rotated groups, then the aligned groups, then the
    /// virtual operands.
    fn operands(&self) -> SmallVec<[Group; 4]> {
        let mut out: SmallVec<[Group; 4]> = self.rotated().collect();
        out.extend(self.groups.keys().copied().filter(|g| g.rot == 0));
        if !self.unallocated.is_empty() {
            out.push(Group {
                src: Source::Unallocated,
                rot: 0,
            });
        }
        let dest = Group {
            src: self.dest,
            rot: 0,
        };
        if !out.contains(&dest) {
            out.push(dest);
        }
        out
    }

    /// Candidates for the background operand S2, destination first.
    fn backgrounds(&self) -> SmallVec<[Group; 4]> {
        let mut out: SmallVec<[Group; 4]> = self
            .operands()
            .into_iter()
            .filter(|g| g.src != Source::ActionData)
            .collect();
        out.sort_by_key(|g| (g.src != self.dest, g.src == Source::Unallocated));
        out
    }

    fn verify(&self, instr: &Instruction) -> bool {
        let values = instr.eval(self.width);
        self.needs.iter().all(|&(bit, need)| {
            let value = values[bit as usize];
            match need {
                Need::Bit(src, b) => value.carries(src, b),
                Need::Unallocated => match value {
                    BitValue::From(src, b) => {
                        src != self.dest && src != Source::ActionData && b == bit
                    }
                    BitValue::Combine(_, _, b) => b == bit,
                },
            }
        })
    }
}

/// Find one instruction that performs every assignment of a write event
/// into `spec.container`, leaving every other live bit unchanged.
///
/// Assignments must not change width; that is a caller bug. Unallocated
/// operands are satisfied by any operand other than the destination that
/// supplies the same bit position: they stand for a source that will be
/// placed later, aligned with the destination.
pub fn solve(
    spec: &ContainerSpec,
    assigns: &[Assign],
    options: &SolverOptions,
) -> Result<Instruction, ActionError> {
    trace!(
        "solve: {} live {:?} <- {:?}",
        spec.container,
        spec.live,
        assigns
    );
    let result = solve_inner(spec, assigns, options);
    trace!(" -> {:?}", result);
    result
}

fn solve_inner(
    spec: &ContainerSpec,
    assigns: &[Assign],
    options: &SolverOptions,
) -> Result<Instruction, ActionError> {
    if assigns.is_empty() {
        return Err(ActionError::InvalidShape);
    }
    let kind = assigns[0].kind;
    if assigns.iter().any(|a| a.kind != kind) {
        return Err(ActionError::InvalidShape);
    }
    for assign in assigns {
        if let Operand::Container(c, _) = assign.src {
            if c.size() != spec.container.size() {
                return Err(ActionError::InvalidShape);
            }
        }
    }
    match kind {
        WriteKind::Bitwise => solve_bitwise(spec, assigns),
        WriteKind::WholeContainer => solve_container_set(spec, assigns),
        WriteKind::Move if spec.container.kind() != ContainerKind::Normal => {
            solve_container_set(spec, assigns)
        }
        WriteKind::Move => solve_move(spec, assigns, options),
    }
}

fn has_overlap(assigns: &[Assign]) -> bool {
    assigns.iter().enumerate().any(|(i, a)| {
        assigns[i + 1..]
            .iter()
            .any(|b| a.dst.overlaps(b.dst))
    })
}

fn solve_move(
    spec: &ContainerSpec,
    assigns: &[Assign],
    options: &SolverOptions,
) -> Result<Instruction, ActionError> {
    if has_overlap(assigns) {
        return Err(ActionError::InvalidShape);
    }
    let p = Problem::new(spec, assigns);

    // Structural rejections before any candidate is built.
    if p.groups.len() > 2 {
        return Err(ActionError::TooManySources);
    }
    let rotated: SmallVec<[Group; 2]> = p.rotated().collect();
    if rotated.len() == 2 && rotated.iter().any(|g| g.rot % 8 != 0) {
        return Err(ActionError::TooManyUnalignedSources);
    }
    let dest = Group {
        src: p.dest,
        rot: 0,
    };
    if !p.live_unassigned.is_empty() && p.groups.len() == 2 && !p.groups.contains_key(&dest) {
        return Err(ActionError::BackgroundMustBeDest);
    }

    let operands = p.operands();
    let backgrounds = p.backgrounds();

    // deposit-field
    for &s1 in &operands {
        let bits = p.bits_of(s1);
        let mut masks: SmallVec<[BitSet; 2]> = smallvec![bits.clone()];
        let shares_unallocated = s1.rot == 0
            && s1.src != p.dest
            && matches!(s1.src, Source::Container(_))
            && !p.unallocated.is_empty();
        if shares_unallocated {
            // Let the unallocated bits share S1 rather than the background.
            masks.push(bits.union(&p.unallocated));
        }
        for bits in &masks {
            let (lo, hi) = match (bits.min(), bits.max()) {
                (Some(lo), Some(hi)) => (lo as u32, hi as u32),
                _ => continue,
            };
            for &s2 in backgrounds.iter().filter(|&&g| g != s1 && g.rot == 0) {
                let instr = Instruction::DepositField {
                    src1: s1.src,
                    rot: s1.rot,
                    mask: BitRange::new(lo, hi),
                    src2: s2.src,
                };
                if p.verify(&instr) {
                    return Ok(instr);
                }
            }
        }
    }

    // byte-rotate-merge
    for &s1 in operands.iter().filter(|g| g.rot % 8 == 0) {
        let mask = byte_mask(&p.bits_of(s1));
        if mask.is_empty() {
            continue;
        }
        for &s2 in backgrounds.iter().filter(|&&g| g != s1 && g.rot % 8 == 0) {
            let instr = Instruction::ByteRotateMerge {
                src1: s1.src,
                rot1: s1.rot,
                src2: s2.src,
                rot2: s2.rot,
                mask: mask.clone(),
            };
            if p.verify(&instr) {
                return Ok(instr);
            }
        }
    }

    // bitmasked-set
    if options.enable_bitmasked_set {
        for &s1 in operands.iter().filter(|g| g.rot == 0) {
            let mask = p.bits_of(s1);
            if mask.is_empty() {
                continue;
            }
            for &s2 in backgrounds.iter().filter(|&&g| g != s1 && g.rot == 0) {
                let instr = Instruction::BitmaskedSet {
                    src1: s1.src,
                    src2: s2.src,
                    mask: mask.clone(),
                };
                if p.verify(&instr) {
                    return Ok(instr);
                }
            }
        }
    }

    Err(classify_failure(&p, &rotated))
}

/// Every byte that holds at least one member of `bits`.
fn byte_mask(bits: &BitSet) -> BitSet {
    let mut mask = BitSet::new();
    for bit in bits.iter() {
        mask.insert_range(bit / 8 * 8, 8);
    }
    mask
}

/// Name the most specific reason why no candidate worked.
fn classify_failure(p: &Problem, rotated: &[Group]) -> ActionError {
    if rotated.len() == 2 {
        return ActionError::TooManyUnalignedSources;
    }
    if let [g] = rotated {
        if g.rot % 8 != 0 && !p.bits_of(*g).is_contiguous() {
            return ActionError::NotByteShiftable;
        }
    }
    if !p.live_unassigned.is_empty() {
        return ActionError::BackgroundMustBeDest;
    }
    ActionError::Unsat
}

/// A write that replaces the whole destination: whole-container writes,
/// and any move into a container kind without a full ALU.
fn solve_container_set(spec: &ContainerSpec, assigns: &[Assign]) -> Result<Instruction, ActionError> {
    if has_overlap(assigns) {
        return Err(ActionError::InvalidShape);
    }
    let p = Problem::new(spec, assigns);
    if !p.live_unassigned.is_empty() {
        return Err(ActionError::WholeContainerCorruptsLive);
    }
    let groups: SmallVec<[Group; 2]> = p.groups.keys().copied().collect();
    let src = match groups[..] {
        [] => Source::Unallocated,
        [g] if g.rot == 0 => g.src,
        [_] => return Err(ActionError::InvalidShape),
        _ => return Err(ActionError::TooManySources),
    };
    if spec.container.kind() == ContainerKind::Dark {
        let allowed = match src {
            Source::Container(c) => c.kind() == ContainerKind::Normal,
            Source::Unallocated => true,
            Source::ActionData => false,
        };
        if !allowed {
            return Err(ActionError::DisallowedSource);
        }
    }
    let instr = Instruction::ContainerSet { src };
    if p.verify(&instr) {
        Ok(instr)
    } else {
        Err(ActionError::Unsat)
    }
}

/// Bitwise operations act on the whole container without rotation, so
/// every operand must be aligned and no live bit may be left unwritten.
fn solve_bitwise(spec: &ContainerSpec, assigns: &[Assign]) -> Result<Instruction, ActionError> {
    let width = spec.width();
    let mut srcs: SmallVec<[Source; 2]> = smallvec![];
    let mut written = BitSet::new();
    for assign in assigns {
        let src = match assign.src {
            Operand::Container(c, r) => {
                if r.lo != assign.dst.lo {
                    return Err(ActionError::InvalidShape);
                }
                Source::Container(c)
            }
            Operand::ActionData(_) | Operand::Constant(_) => Source::ActionData,
            Operand::Unallocated(_) => Source::Unallocated,
        };
        if !srcs.contains(&src) {
            srcs.push(src);
        }
        written.insert_range(assign.dst.lo as usize, assign.dst.size() as usize);
    }
    if srcs.len() > 2 {
        return Err(ActionError::TooManySources);
    }
    if !spec.live.is_subset(&written) {
        return Err(ActionError::WholeContainerCorruptsLive);
    }
    let instr = Instruction::Bitwise {
        src1: srcs[0],
        src2: srcs.get(1).copied(),
    };
    let values = instr.eval(width);
    let ok = assigns.iter().all(|a| {
        (a.dst.lo..=a.dst.hi).all(|bit| {
            let (src, b) = a.source_bit(bit);
            values[bit as usize].carries(src, b)
        })
    });
    if ok {
        Ok(instr)
    } else {
        Err(ActionError::Unsat)
    }
}
