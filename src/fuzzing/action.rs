/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fuzz the instruction solver against the checker.

use super::arbitrary::{Arbitrary, Result, Unstructured};
use crate::action::{solve, Assign, ContainerSpec, Operand, SolverOptions};
use crate::bitvec::BitSet;
use crate::checker::check_instruction;
use crate::{BitRange, Container, ContainerKind, ContainerSize, WriteKind};
use alloc::vec::Vec;

#[derive(Clone, Debug)]
pub struct TestCase {
    pub spec: ContainerSpec,
    pub assigns: Vec<Assign>,
    pub options: SolverOptions,
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<TestCase> {
        let size = *u.choose(&ContainerSize::ALL)?;
        let kind = if u.ratio(1, 8)? {
            *u.choose(&[ContainerKind::Mocha, ContainerKind::Dark])?
        } else {
            ContainerKind::Normal
        };
        let dest = Container::new(kind, size, 0);
        let width = size.bits();
        // Mostly moves, so that most cases have a solution.
        let write_kind = match u.int_in_range(0..=15)? {
            0 => WriteKind::Bitwise,
            1 => WriteKind::WholeContainer,
            _ => WriteKind::Move,
        };

        let mut live = BitSet::new();
        let mut assigns = Vec::new();
        let mut bit = 0;
        while bit < width {
            let len = u.int_in_range(1..=width - bit)?;
            let dst = BitRange::start_len(bit, len);
            bit += len;
            let src = match u.int_in_range(0..=7)? {
                // Dead bits.
                0 => continue,
                // Live bits that nothing writes.
                1 => {
                    live.insert_range(dst.lo as usize, len as usize);
                    continue;
                }
                2 => Operand::ActionData(BitRange::start_len(0, len)),
                3 => Operand::Constant(BitRange::start_len(0, len)),
                4 => Operand::Unallocated(BitRange::start_len(0, len)),
                _ => {
                    let index = u.int_in_range(0..=3)?;
                    let c = if index == 0 {
                        dest
                    } else if u.ratio(1, 16)? {
                        // A container of another size.
                        Container::normal(*u.choose(&ContainerSize::ALL)?, index)
                    } else {
                        Container::normal(size, index)
                    };
                    let lo = u.int_in_range(0..=c.width().saturating_sub(len))?;
                    if lo + len > c.width() {
                        continue;
                    }
                    Operand::Container(c, BitRange::start_len(lo, len))
                }
            };
            live.insert_range(dst.lo as usize, len as usize);
            assigns.push(Assign::new(dst, src, write_kind));
        }

        Ok(TestCase {
            spec: ContainerSpec::new(dest, live),
            assigns,
            options: SolverOptions {
                enable_bitmasked_set: bool::arbitrary(u)?,
            },
        })
    }
}

/// Whatever the solver returns must replay correctly.
pub fn check(t: &TestCase) {
    match solve(&t.spec, &t.assigns, &t.options) {
        Ok(instr) => {
            log::trace!("solved with {}", instr);
            if let Err(e) = check_instruction(&t.spec, &t.assigns, &instr) {
                panic!("checker rejects {} for {:?}: {}", instr, t, e);
            }
        }
        Err(e) => log::trace!("no instruction: {}", e),
    }
}
