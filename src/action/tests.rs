/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::*;
use crate::checker::check_instruction;
use crate::{Container, ContainerKind, ContainerSize};
use alloc::vec;

fn r(lo: u32, hi: u32) -> BitRange {
    BitRange::new(lo, hi)
}

fn mov(dst: BitRange, c: Container, src: BitRange) -> Assign {
    Assign::mov(dst, Operand::Container(c, src))
}

fn solve_checked(spec: &ContainerSpec, assigns: &[Assign]) -> Result<Instruction, ActionError> {
    let result = solve(spec, assigns, &SolverOptions::default());
    if let Ok(instr) = &result {
        check_instruction(spec, assigns, instr).unwrap();
    }
    result
}

#[test]
fn partial_move_into_live_container() {
    let h1 = Container::h(1);
    let spec = ContainerSpec::full(h1);
    let instr = solve_checked(&spec, &[mov(r(0, 2), Container::h(2), r(0, 2))]).unwrap();
    assert_eq!(
        instr,
        Instruction::DepositField {
            src1: Source::Container(Container::h(2)),
            rot: 0,
            mask: r(0, 2),
            src2: Source::Container(h1),
        }
    );
}

#[test]
fn rotated_move_keeps_destination_as_background() {
    let h1 = Container::h(1);
    let spec = ContainerSpec::full(h1);
    let instr = solve_checked(&spec, &[mov(r(0, 3), Container::h(2), r(4, 7))]).unwrap();
    assert_eq!(
        instr,
        Instruction::DepositField {
            src1: Source::Container(Container::h(2)),
            rot: 12,
            mask: r(0, 3),
            src2: Source::Container(h1),
        }
    );
}

#[test]
fn two_sources_with_no_other_live_bits() {
    let spec = ContainerSpec::new(Container::h(3), BitSet::from_range(0, 7));
    let assigns = [
        mov(r(0, 3), Container::h(2), r(0, 3)),
        mov(r(4, 6), Container::h(1), r(5, 7)),
    ];
    let instr = solve_checked(&spec, &assigns).unwrap();
    assert_eq!(
        instr,
        Instruction::DepositField {
            src1: Source::Container(Container::h(1)),
            rot: 15,
            mask: r(4, 6),
            src2: Source::Container(Container::h(2)),
        }
    );
}

#[test]
fn self_background_with_rotated_source() {
    // H1[0:3] from itself in place, H1[4:6] from H1[5:7]: one source, the
    // destination, read twice with two rotations.
    let h1 = Container::h(1);
    let spec = ContainerSpec::new(h1, BitSet::from_range(0, 7));
    let assigns = [mov(r(0, 3), h1, r(0, 3)), mov(r(4, 6), h1, r(5, 7))];
    let instr = solve_checked(&spec, &assigns).unwrap();
    assert!(matches!(
        instr,
        Instruction::DepositField {
            src1: Source::Container(c1),
            src2: Source::Container(c2),
            ..
        } if c1 == h1 && c2 == h1
    ));
}

#[test]
fn foreign_background_with_live_bits() {
    let spec = ContainerSpec::full(Container::h(1));
    let assigns = [
        mov(r(0, 3), Container::h(2), r(0, 3)),
        mov(r(4, 6), Container::h(3), r(5, 7)),
    ];
    assert_eq!(
        solve_checked(&spec, &assigns),
        Err(ActionError::BackgroundMustBeDest)
    );
}

#[test]
fn unallocated_gap_is_absorbed() {
    let spec = ContainerSpec::full(Container::h(1));
    let assigns = [
        mov(r(0, 7), Container::h(2), r(0, 7)),
        Assign::mov(r(8, 13), Operand::ActionData(r(0, 5))),
        Assign::mov(r(14, 15), Operand::Unallocated(r(0, 1))),
    ];
    let instr = solve_checked(&spec, &assigns).unwrap();
    assert_eq!(
        instr,
        Instruction::DepositField {
            src1: Source::ActionData,
            rot: 0,
            mask: r(8, 13),
            src2: Source::Container(Container::h(2)),
        }
    );
}

#[test]
fn unallocated_is_never_the_destination() {
    // Bits 8..15 stay live, so the background must be H1 itself; the
    // unallocated bits cannot be assumed to already be there.
    let h1 = Container::h(1);
    let spec = ContainerSpec::full(h1);
    let assigns = [
        mov(r(0, 3), Container::h(2), r(0, 3)),
        Assign::mov(r(4, 7), Operand::Unallocated(r(0, 3))),
    ];
    let instr = solve_checked(&spec, &assigns).unwrap();
    // The unallocated bits must share the aligned operand H2.
    assert_eq!(
        instr,
        Instruction::DepositField {
            src1: Source::Container(Container::h(2)),
            rot: 0,
            mask: r(0, 7),
            src2: Source::Container(h1),
        }
    );
}

#[test]
fn full_width_single_source() {
    for size in ContainerSize::ALL {
        let dst = Container::normal(size, 0);
        let src = Container::normal(size, 1);
        let spec = ContainerSpec::new(dst, BitSet::new());
        let w = size.bits();
        solve_checked(&spec, &[mov(r(0, w - 1), src, r(0, w - 1))]).unwrap();
    }
}

#[test]
fn too_many_sources() {
    let spec = ContainerSpec::new(Container::w(0), BitSet::new());
    let assigns = [
        mov(r(0, 7), Container::w(1), r(0, 7)),
        mov(r(8, 15), Container::w(2), r(8, 15)),
        mov(r(16, 23), Container::w(3), r(16, 23)),
    ];
    assert_eq!(solve_checked(&spec, &assigns), Err(ActionError::TooManySources));
}

#[test]
fn two_rotated_sources() {
    let spec = ContainerSpec::new(Container::h(0), BitSet::new());
    // Byte rotations: fine as byte-rotate-merge.
    let assigns = [
        mov(r(0, 7), Container::h(1), r(8, 15)),
        mov(r(8, 15), Container::h(2), r(0, 7)),
    ];
    let instr = solve_checked(&spec, &assigns).unwrap();
    assert_eq!(instr.name(), "byte-rotate-merge");

    // Bit rotations: rejected.
    let assigns = [
        mov(r(0, 3), Container::h(1), r(1, 4)),
        mov(r(8, 11), Container::h(2), r(0, 3)),
    ];
    assert_eq!(
        solve_checked(&spec, &assigns),
        Err(ActionError::TooManyUnalignedSources)
    );
}

#[test]
fn bitmasked_set_only_when_enabled() {
    // Interleaved bits of two aligned sources: no contiguous mask works.
    let spec = ContainerSpec::new(Container::b(0), BitSet::new());
    let assigns = [
        mov(r(0, 0), Container::b(1), r(0, 0)),
        mov(r(1, 1), Container::b(2), r(1, 1)),
        mov(r(2, 2), Container::b(1), r(2, 2)),
        mov(r(3, 3), Container::b(2), r(3, 3)),
    ];
    assert_eq!(solve_checked(&spec, &assigns), Err(ActionError::Unsat));
    let options = SolverOptions {
        enable_bitmasked_set: true,
    };
    let instr = solve(&spec, &assigns, &options).unwrap();
    assert_eq!(instr.name(), "bitmasked-set");
    check_instruction(&spec, &assigns, &instr).unwrap();
}

#[test]
fn restricted_containers() {
    let mocha = Container::new(ContainerKind::Mocha, ContainerSize::B16, 0);
    let dark = Container::new(ContainerKind::Dark, ContainerSize::B16, 0);

    // Partial writes would clobber the rest of the container.
    let spec = ContainerSpec::full(mocha);
    assert_eq!(
        solve_checked(&spec, &[mov(r(0, 7), Container::h(1), r(0, 7))]),
        Err(ActionError::WholeContainerCorruptsLive)
    );
    let spec = ContainerSpec::new(mocha, BitSet::from_range(0, 8));
    assert_eq!(
        solve_checked(&spec, &[Assign::mov(r(0, 7), Operand::ActionData(r(0, 7)))]),
        Ok(Instruction::ContainerSet {
            src: Source::ActionData
        })
    );

    let spec = ContainerSpec::new(dark, BitSet::from_range(0, 16));
    assert_eq!(
        solve_checked(&spec, &[Assign::mov(r(0, 15), Operand::Constant(r(0, 15)))]),
        Err(ActionError::DisallowedSource)
    );
    assert_eq!(
        solve_checked(&spec, &[mov(r(0, 15), mocha, r(0, 15))]),
        Err(ActionError::DisallowedSource)
    );
    assert!(solve_checked(&spec, &[mov(r(0, 15), Container::h(4), r(0, 15))]).is_ok());
}

#[test]
fn bitwise_writes() {
    let spec = ContainerSpec::new(Container::b(0), BitSet::from_range(0, 8));
    let and = |dst: BitRange, c: Container| {
        Assign::new(dst, Operand::Container(c, dst), WriteKind::Bitwise)
    };
    let assigns = [and(r(0, 7), Container::b(1)), and(r(0, 7), Container::b(2))];
    let instr = solve_checked(&spec, &assigns).unwrap();
    assert_eq!(
        instr,
        Instruction::Bitwise {
            src1: Source::Container(Container::b(1)),
            src2: Some(Source::Container(Container::b(2))),
        }
    );

    // Bitwise on part of a live container.
    assert_eq!(
        solve_checked(&spec, &[and(r(0, 3), Container::b(1))]),
        Err(ActionError::WholeContainerCorruptsLive)
    );
    // Rotated bitwise operand.
    let rotated = Assign::new(
        r(0, 3),
        Operand::Container(Container::b(1), r(4, 7)),
        WriteKind::Bitwise,
    );
    assert_eq!(solve_checked(&spec, &[rotated]), Err(ActionError::InvalidShape));
}

#[test]
fn malformed_write_events() {
    let spec = ContainerSpec::full(Container::h(0));
    assert_eq!(solve_checked(&spec, &[]), Err(ActionError::InvalidShape));
    let mixed = [
        mov(r(0, 7), Container::h(1), r(0, 7)),
        Assign::new(
            r(8, 15),
            Operand::Container(Container::h(1), r(8, 15)),
            WriteKind::Bitwise,
        ),
    ];
    assert_eq!(solve_checked(&spec, &mixed), Err(ActionError::InvalidShape));
    let other_size = [mov(r(0, 7), Container::b(1), r(0, 7))];
    assert_eq!(solve_checked(&spec, &other_size), Err(ActionError::InvalidShape));
}

#[test]
fn eval_replays_formula() {
    let instr = Instruction::ByteRotateMerge {
        src1: Source::Container(Container::h(1)),
        rot1: 8,
        src2: Source::ActionData,
        rot2: 0,
        mask: BitSet::from_range(0, 8),
    };
    let bits = instr.eval(16);
    assert_eq!(bits[0], BitValue::From(Source::Container(Container::h(1)), 8));
    assert_eq!(bits[7], BitValue::From(Source::Container(Container::h(1)), 15));
    assert_eq!(bits[8], BitValue::From(Source::ActionData, 8));
    assert_eq!(
        alloc::format!("{}", instr),
        "byte-rotate-merge H1 rotl 8, ad rotl 0 mask {0-7}"
    );
    assert_eq!(
        instr.sources().collect::<alloc::vec::Vec<_>>(),
        vec![Source::Container(Container::h(1)), Source::ActionData]
    );
}
