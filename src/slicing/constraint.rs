/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Container-size constraints accumulated by the search.

use crate::{ContainerSize, FieldSlice};
use alloc::collections::BTreeMap;
use core::fmt;

/// The container sizes still compatible with a field slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum AfterSplitConstraint {
    /// Any size.
    None,
    /// The given size or larger.
    Min(ContainerSize),
    /// Exactly the given size.
    Exact(ContainerSize),
    /// No size at all: two decisions disagree.
    Conflict,
}

impl AfterSplitConstraint {
    /// The sizes allowed by both constraints.
    #[inline(always)]
    pub fn intersect(self, other: AfterSplitConstraint) -> AfterSplitConstraint {
        use AfterSplitConstraint::*;
        match (self, other) {
            (None, other) | (other, None) => other,
            (Conflict, _) | (_, Conflict) => Conflict,
            (Min(a), Min(b)) => Min(a.max(b)),
            (Exact(e), Min(m)) | (Min(m), Exact(e)) => {
                if e >= m {
                    Exact(e)
                } else {
                    Conflict
                }
            }
            (Exact(a), Exact(b)) if a == b => Exact(a),
            _ => Conflict,
        }
    }

    pub fn allows(self, size: ContainerSize) -> bool {
        match self {
            AfterSplitConstraint::None => true,
            AfterSplitConstraint::Min(m) => size >= m,
            AfterSplitConstraint::Exact(e) => size == e,
            AfterSplitConstraint::Conflict => false,
        }
    }

    /// The single size this constraint leaves, if it is decided.
    pub fn decided(self) -> Option<ContainerSize> {
        match self {
            AfterSplitConstraint::Exact(e) => Some(e),
            _ => Option::None,
        }
    }

    pub fn is_conflict(self) -> bool {
        self == AfterSplitConstraint::Conflict
    }
}

impl Default for AfterSplitConstraint {
    fn default() -> Self {
        AfterSplitConstraint::None
    }
}

impl fmt::Display for AfterSplitConstraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AfterSplitConstraint::None => write!(f, "any"),
            AfterSplitConstraint::Min(m) => write!(f, ">={}", m),
            AfterSplitConstraint::Exact(e) => write!(f, "={}", e),
            AfterSplitConstraint::Conflict => write!(f, "conflict"),
        }
    }
}

/// Per-slice constraints of one search node.
pub type Constraints = BTreeMap<FieldSlice, AfterSplitConstraint>;

/// Narrow the constraint of `slice` by `c`. Returns false if this leaves
/// the slice with no size.
pub(crate) fn narrow(constraints: &mut Constraints, slice: FieldSlice, c: AfterSplitConstraint) -> bool {
    let entry = constraints.entry(slice).or_default();
    *entry = entry.intersect(c);
    !entry.is_conflict()
}

/// The constraint recorded for `slice`.
pub(crate) fn constraint_of(constraints: &Constraints, slice: FieldSlice) -> AfterSplitConstraint {
    constraints.get(&slice).copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::AfterSplitConstraint::*;
    use crate::ContainerSize::*;

    #[test]
    fn lattice() {
        assert_eq!(None.intersect(Min(B16)), Min(B16));
        assert_eq!(Min(B8).intersect(Min(B16)), Min(B16));
        assert_eq!(Min(B16).intersect(Exact(B32)), Exact(B32));
        assert_eq!(Exact(B8).intersect(Min(B16)), Conflict);
        assert_eq!(Exact(B8).intersect(Exact(B8)), Exact(B8));
        assert_eq!(Exact(B8).intersect(Exact(B16)), Conflict);
        assert_eq!(Conflict.intersect(None), Conflict);
        assert!(Min(B16).allows(B32));
        assert!(!Min(B16).allows(B8));
        assert_eq!(Exact(B16).decided(), Some(B16));
        assert_eq!(Min(B16).decided(), Option::None);
    }
}
