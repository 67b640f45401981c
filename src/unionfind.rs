/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Union-find over dense arena indices.

use crate::index::ArenaIndex;
use alloc::vec::Vec;
use core::marker::PhantomData;

/// A disjoint-set forest. `find` uses path halving; `union` always makes
/// the smaller root the representative, so results do not depend on the
/// order in which unions are performed.
#[derive(Clone, Debug)]
pub struct UnionFind<T: ArenaIndex> {
    parents: Vec<u32>,
    _phantom: PhantomData<T>,
}

impl<T: ArenaIndex> UnionFind<T> {
    pub fn new(n: usize) -> Self {
        UnionFind {
            parents: (0..n as u32).collect(),
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Add a new singleton set and return its element.
    pub fn push(&mut self) -> T {
        let i = self.parents.len();
        self.parents.push(i as u32);
        T::from_usize(i)
    }

    pub fn find(&mut self, x: T) -> T {
        let mut i = x.to_usize();
        while self.parents[i] as usize != i {
            let grandparent = self.parents[self.parents[i] as usize];
            self.parents[i] = grandparent;
            i = grandparent as usize;
        }
        T::from_usize(i)
    }

    /// Merge the sets containing `a` and `b`. Returns `false` if they
    /// were already the same set.
    pub fn union(&mut self, a: T, b: T) -> bool {
        let ra = self.find(a).to_usize();
        let rb = self.find(b).to_usize();
        if ra == rb {
            return false;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parents[child] = root as u32;
        true
    }

    pub fn same(&mut self, a: T, b: T) -> bool {
        self.find(a) == self.find(b)
    }

    /// Partition all elements by set. Sets are ordered by their smallest
    /// element, and elements within a set are in increasing order.
    pub fn groups(&mut self) -> Vec<Vec<T>> {
        let n = self.parents.len();
        let mut slot_of_root: Vec<Option<usize>> = alloc::vec![None; n];
        let mut out: Vec<Vec<T>> = Vec::new();
        for i in 0..n {
            let root = self.find(T::from_usize(i)).to_usize();
            let slot = match slot_of_root[root] {
                Some(slot) => slot,
                None => {
                    out.push(Vec::new());
                    slot_of_root[root] = Some(out.len() - 1);
                    out.len() - 1
                }
            };
            out[slot].push(T::from_usize(i));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    define_index!(Node);

    #[test]
    fn union_and_groups() {
        let mut uf = UnionFind::<Node>::new(6);
        assert!(uf.union(Node::new(4), Node::new(1)));
        assert!(uf.union(Node::new(5), Node::new(4)));
        assert!(!uf.union(Node::new(1), Node::new(5)));
        assert!(uf.same(Node::new(5), Node::new(1)));
        assert!(!uf.same(Node::new(0), Node::new(1)));
        assert_eq!(uf.find(Node::new(5)), Node::new(1));
        let groups = uf.groups();
        assert_eq!(
            groups,
            vec![
                vec![Node::new(0)],
                vec![Node::new(1), Node::new(4), Node::new(5)],
                vec![Node::new(2)],
                vec![Node::new(3)],
            ]
        );
        let extra = uf.push();
        assert_eq!(extra, Node::new(6));
        assert_eq!(uf.len(), 7);
    }
}
