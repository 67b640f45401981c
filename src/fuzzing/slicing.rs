/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fuzz the slicing search: every solution it yields must be a complete
//! slicing of its input.

use super::arbitrary::{Arbitrary, Error, Result, Unstructured};
use crate::checker::check_slicing;
use crate::cluster::{RotationalCluster, SliceList, SuperCluster};
use crate::table::TableProgram;
use crate::{
    BitRange, Field, FieldId, FieldSlice, ParserWriteMode, SlicingOptions, SourceOperand,
    WriteKind,
};
use alloc::format;
use alloc::vec::Vec;

/// Solutions to check per test case.
const MAX_SOLUTIONS: usize = 8;

#[derive(Clone, Debug)]
pub struct TestCase {
    pub program: TableProgram,
    pub sc: SuperCluster,
    pub options: SlicingOptions,
}

fn arbitrary_field(u: &mut Unstructured, i: usize) -> Result<Field> {
    let name = format!("f{}", i);
    let mut field = if u.ratio(1, 3)? {
        Field::header(name, 8 * u.int_in_range(1..=6)?)
    } else if u.ratio(1, 2)? {
        Field::metadata(name, u.int_in_range(1..=40)?)
    } else {
        Field::new(name, u.int_in_range(1..=72)?)
    };
    field.no_split = u.ratio(1, 8)?;
    field.bottom_bits = u.ratio(1, 16)?;
    if u.ratio(1, 8)? {
        field.alignment = Some(u.int_in_range(0..=7)?);
    }
    if field.deparsed && u.ratio(1, 4)? {
        field.parser_write_mode = Some(*u.choose(&[
            ParserWriteMode::SingleWrite,
            ParserWriteMode::BitwiseOr,
            ParserWriteMode::ClearOnWrite,
        ])?);
    }
    Ok(field)
}

fn arbitrary_slice(u: &mut Unstructured, field: FieldId, size: u32, len: u32) -> Result<FieldSlice> {
    let lo = u.int_in_range(0..=size - len)?;
    Ok(FieldSlice::new(field, BitRange::start_len(lo, len)))
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<TestCase> {
        let mut program = TableProgram::new();
        let mut fields = Vec::new();
        for i in 0..u.int_in_range(1..=6)? {
            let field = arbitrary_field(u, i)?;
            fields.push((program.add_field(field.clone()), field.size));
        }

        for a in 0..u.int_in_range(0..=3)? {
            let action = program.add_action(format!("act{}", a));
            while u.ratio(2, 3)? {
                let &(df, dsize) = u.choose(&fields)?;
                let kind = *u.choose(&[WriteKind::Move, WriteKind::Move, WriteKind::Bitwise])?;
                match u.int_in_range(0..=3)? {
                    0 => {
                        let len = u.int_in_range(1..=dsize)?;
                        let dst = arbitrary_slice(u, df, dsize, len)?;
                        program.add_write(action, dst, kind, SourceOperand::ActionData);
                    }
                    1 => {
                        let len = u.int_in_range(1..=dsize)?;
                        let dst = arbitrary_slice(u, df, dsize, len)?;
                        let value = u64::arbitrary(u)?;
                        program.add_write(action, dst, kind, SourceOperand::Constant(value));
                    }
                    _ => {
                        let &(sf, ssize) = u.choose(&fields)?;
                        let len = u.int_in_range(1..=dsize.min(ssize))?;
                        let dst = arbitrary_slice(u, df, dsize, len)?;
                        let src = arbitrary_slice(u, sf, ssize, len)?;
                        program.add_write(action, dst, kind, SourceOperand::Slice(src));
                    }
                }
            }
        }

        if fields.len() > 1 && u.ratio(1, 4)? {
            let &(a, _) = u.choose(&fields)?;
            let &(b, _) = u.choose(&fields)?;
            if a != b {
                program.add_pack_conflict(a, b);
            }
        }

        // Distribute the fields over up to three lists, each field in a
        // rotational cluster of its own.
        let mut lists: Vec<Vec<FieldSlice>> = Vec::new();
        for &(f, size) in &fields {
            let slice = FieldSlice::whole(f, size);
            if lists.is_empty() || u.ratio(1, 3)? && lists.len() < 3 {
                lists.push(Vec::new());
            }
            let n = lists.len();
            lists[n - 1].push(slice);
        }
        let clusters = fields
            .iter()
            .map(|&(f, size)| RotationalCluster::aligned(core::iter::once(FieldSlice::whole(f, size))))
            .collect();
        let lists = lists.into_iter().map(SliceList::new).collect();
        let sc = SuperCluster::new(clusters, lists).map_err(|_| Error::IncorrectFormat)?;

        let options = SlicingOptions {
            minimal_packing: bool::arbitrary(u)?,
            loose_action_packing: bool::arbitrary(u)?,
            smart_backtracking: bool::arbitrary(u)?,
            homogeneous_slicing: bool::arbitrary(u)?,
            enable_bitmasked_set: bool::arbitrary(u)?,
            max_search_steps: u.int_in_range(16..=512)?,
            max_ignored_invalidations: u.int_in_range(0..=4)?,
            verbose_log: false,
        };
        Ok(TestCase {
            program,
            sc,
            options,
        })
    }
}

pub fn check(t: &TestCase) {
    let it = match crate::slice(&t.program, t.sc.clone(), &t.options) {
        Ok(it) => it,
        Err(e) => {
            log::trace!("input rejected: {}", e);
            return;
        }
    };
    for solution in it.take(MAX_SOLUTIONS) {
        if let Err(e) = check_slicing(&t.program, &t.sc, &solution.clusters) {
            panic!("bad slicing {:?}: {}", solution.clusters, e);
        }
    }
}
