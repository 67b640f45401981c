/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A table-driven `Program`: fields, actions and their writes held in
//! plain vectors. Used by the tests, the fuzz targets and the command-line
//! tool.

use crate::{
    ActionId, BitRange, ContainerSize, Field, FieldId, FieldSlice, Program, SourceOp,
    SourceOperand, SourceOps, WriteKind,
};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// One write of an action into a field slice.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
struct Write {
    action: ActionId,
    op: SourceOp,
}

#[derive(Clone, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TableProgram {
    fields: Vec<Field>,
    actions: Vec<String>,
    writes: Vec<Write>,
    unreferenced: Vec<FieldId>,
    pack_conflicts: Vec<(FieldId, FieldId)>,
    container_sizes: BTreeMap<FieldId, Vec<ContainerSize>>,
}

impl TableProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, field: Field) -> FieldId {
        let id = FieldId::new(self.fields.len());
        self.fields.push(field);
        id
    }

    pub fn add_action(&mut self, name: impl Into<String>) -> ActionId {
        let id = ActionId::new(self.actions.len());
        self.actions.push(name.into());
        id
    }

    /// Record that `action` writes `dst` from `source`. A slice source
    /// must have the width of `dst`.
    pub fn add_write(
        &mut self,
        action: ActionId,
        dst: FieldSlice,
        kind: WriteKind,
        source: SourceOperand,
    ) {
        if let SourceOperand::Slice(src) = source {
            assert_eq!(src.size(), dst.size(), "move of {} from {}", dst, src);
        }
        self.writes.push(Write {
            action,
            op: SourceOp { dst, kind, source },
        });
    }

    pub fn add_move(&mut self, action: ActionId, dst: FieldSlice, src: FieldSlice) {
        self.add_write(action, dst, WriteKind::Move, SourceOperand::Slice(src));
    }

    pub fn add_pack_conflict(&mut self, a: FieldId, b: FieldId) {
        self.pack_conflicts.push((a, b));
    }

    pub fn set_unreferenced(&mut self, field: FieldId) {
        self.unreferenced.push(field);
    }

    pub fn set_container_sizes(&mut self, field: FieldId, sizes: Vec<ContainerSize>) {
        self.container_sizes.insert(field, sizes);
    }

    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, f)| (FieldId::new(i), f))
    }

    pub fn num_actions(&self) -> usize {
        self.actions.len()
    }
}

/// Restrict `op` to the bits of `slice`, if it writes any of them.
fn restrict(op: &SourceOp, slice: FieldSlice) -> Option<SourceOp> {
    if op.dst.field != slice.field || !op.dst.range.overlaps(slice.range) {
        return None;
    }
    let lo = op.dst.lo().max(slice.lo());
    let hi = op.dst.hi().min(slice.hi());
    let rel = BitRange::new(lo - op.dst.lo(), hi - op.dst.lo());
    let source = match op.source {
        SourceOperand::Slice(src) => SourceOperand::Slice(src.sub(rel)),
        SourceOperand::Constant(value) => {
            let bits = rel.size();
            let shifted = value.checked_shr(rel.lo).unwrap_or(0);
            SourceOperand::Constant(if bits >= 64 {
                shifted
            } else {
                shifted & ((1u64 << bits) - 1)
            })
        }
        SourceOperand::ActionData => SourceOperand::ActionData,
    };
    Some(SourceOp {
        dst: op.dst.sub(rel),
        kind: op.kind,
        source,
    })
}

impl Program for TableProgram {
    fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn field(&self, field: FieldId) -> &Field {
        &self.fields[field.index()]
    }

    fn sources(&self, slice: FieldSlice) -> BTreeMap<ActionId, SourceOps> {
        let mut out: BTreeMap<ActionId, SourceOps> = BTreeMap::new();
        for write in &self.writes {
            if let Some(op) = restrict(&write.op, slice) {
                out.entry(write.action).or_default().push(op);
            }
        }
        out
    }

    fn is_referenced(&self, field: FieldId) -> bool {
        !self.unreferenced.contains(&field)
    }

    fn has_pack_conflict(&self, a: FieldSlice, b: FieldSlice) -> bool {
        self.pack_conflicts
            .iter()
            .any(|&(x, y)| (x, y) == (a.field, b.field) || (y, x) == (a.field, b.field))
    }

    fn container_sizes(&self, field: FieldId) -> Option<&[ContainerSize]> {
        self.container_sizes.get(&field).map(|s| &s[..])
    }

    fn action_name(&self, action: ActionId) -> String {
        self.actions[action.index()].clone()
    }
}

impl fmt::Debug for TableProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{{")?;
        for (id, field) in self.fields() {
            write!(f, "  {}: {} <{}>", id, field.name, field.size)?;
            if field.no_split {
                write!(f, " no_split")?;
            }
            if field.exact_containers {
                write!(f, " exact")?;
            }
            if let Some(a) = field.alignment {
                write!(f, " align({})", a)?;
            }
            if field.deparsed {
                write!(f, " deparsed")?;
            }
            if field.metadata {
                write!(f, " metadata")?;
            }
            if field.bottom_bits {
                write!(f, " bottom_bits")?;
            }
            if let Some(sizes) = self.container_sizes.get(&id) {
                write!(f, " sizes{:?}", sizes)?;
            }
            writeln!(f)?;
        }
        for (i, name) in self.actions.iter().enumerate() {
            let action = ActionId::new(i);
            writeln!(f, "  {} ({}):", action, name)?;
            for write in self.writes.iter().filter(|w| w.action == action) {
                writeln!(
                    f,
                    "    {} <- {:?} ({:?})",
                    write.op.dst, write.op.source, write.op.kind
                )?;
            }
        }
        for (a, b) in &self.pack_conflicts {
            writeln!(f, "  conflict {} {}", a, b)?;
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_restricted_to_the_query() {
        let mut p = TableProgram::new();
        let a = p.add_field(Field::new("a", 16));
        let b = p.add_field(Field::new("b", 16));
        let set = p.add_action("set");
        p.add_move(set, FieldSlice::whole(a, 16), FieldSlice::whole(b, 16));
        p.add_write(
            set,
            FieldSlice::whole(b, 16),
            WriteKind::Move,
            SourceOperand::Constant(0xabcd),
        );

        let q = FieldSlice::new(a, BitRange::new(4, 11));
        let ops = p.sources(q);
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[&set].as_slice(),
            [SourceOp {
                dst: q,
                kind: WriteKind::Move,
                source: SourceOperand::Slice(FieldSlice::new(b, BitRange::new(4, 11))),
            }]
        );

        let ops = p.sources(FieldSlice::new(b, BitRange::new(8, 15)));
        assert_eq!(ops[&set][0].source, SourceOperand::Constant(0xab));
        assert!(p.sources(FieldSlice::new(b, BitRange::new(0, 3)))[&set].len() == 1);
    }
}
