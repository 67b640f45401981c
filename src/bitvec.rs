/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Bit sets: growable sets of small integers, used for bit positions
//! within containers and slice lists, masks and split schemas.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

type Frame = u64;
const BITS_PER_FRAME: usize = core::mem::size_of::<Frame>() * 8;

/// A set of bit positions. Trailing zero frames are always trimmed, so
/// two sets with the same members compare equal.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BitSet {
    bits: Vec<Frame>,
}

impl BitSet {
    pub fn new() -> Self {
        Self { bits: vec![] }
    }

    /// The set `{lo, lo + 1, ..., lo + len - 1}`.
    pub fn from_range(lo: usize, len: usize) -> Self {
        let mut set = BitSet::new();
        set.insert_range(lo, len);
        set
    }

    #[inline(always)]
    fn compute_index(el: usize) -> (usize, usize) {
        (el / BITS_PER_FRAME, el % BITS_PER_FRAME)
    }

    fn trim(&mut self) {
        while let Some(&0) = self.bits.last() {
            self.bits.pop();
        }
    }

    pub fn insert(&mut self, el: usize) {
        let (frame_no, idx) = Self::compute_index(el);
        if frame_no >= self.bits.len() {
            self.bits.resize(frame_no + 1, 0);
        }
        self.bits[frame_no] |= 1 << idx;
    }

    pub fn insert_range(&mut self, lo: usize, len: usize) {
        for el in lo..lo + len {
            self.insert(el);
        }
    }

    pub fn remove(&mut self, el: usize) {
        let (frame_no, idx) = Self::compute_index(el);
        if let Some(frame) = self.bits.get_mut(frame_no) {
            *frame &= !(1 << idx);
        }
        self.trim();
    }

    pub fn contains(&self, el: usize) -> bool {
        let (frame_no, idx) = Self::compute_index(el);
        self.bits
            .get(frame_no)
            .map_or(false, |frame| frame & (1 << idx) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|f| f.count_ones() as usize).sum()
    }

    pub fn min(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn max(&self) -> Option<usize> {
        let last = self.bits.len().checked_sub(1)?;
        let frame = self.bits[last];
        Some(last * BITS_PER_FRAME + (BITS_PER_FRAME - 1 - frame.leading_zeros() as usize))
    }

    pub fn union_with(&mut self, other: &BitSet) {
        if other.bits.len() > self.bits.len() {
            self.bits.resize(other.bits.len(), 0);
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }

    pub fn intersect_with(&mut self, other: &BitSet) {
        self.bits.truncate(other.bits.len());
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= *b;
        }
        self.trim();
    }

    pub fn subtract(&mut self, other: &BitSet) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !*b;
        }
        self.trim();
    }

    pub fn union(&self, other: &BitSet) -> BitSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn intersection(&self, other: &BitSet) -> BitSet {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    pub fn difference(&self, other: &BitSet) -> BitSet {
        let mut out = self.clone();
        out.subtract(other);
        out
    }

    pub fn intersects(&self, other: &BitSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn is_subset(&self, other: &BitSet) -> bool {
        self.bits.iter().enumerate().all(|(i, a)| {
            let b = other.bits.get(i).copied().unwrap_or(0);
            a & !b == 0
        })
    }

    /// Every member moved up by `n`.
    pub fn shifted_up(&self, n: usize) -> BitSet {
        self.iter().map(|el| el + n).collect()
    }

    /// Every member moved down by `n`; members below `n` are dropped.
    pub fn shifted_down(&self, n: usize) -> BitSet {
        self.iter().filter(|&el| el >= n).map(|el| el - n).collect()
    }

    /// Every member `el < width` rotated up by `n` modulo `width`.
    pub fn rotated(&self, n: usize, width: usize) -> BitSet {
        debug_assert!(self.max().map_or(true, |m| m < width));
        self.iter().map(|el| (el + n) % width).collect()
    }

    /// Are all members adjacent?
    pub fn is_contiguous(&self) -> bool {
        match (self.min(), self.max()) {
            (Some(lo), Some(hi)) => self.count() == hi - lo + 1,
            _ => true,
        }
    }

    /// Maximal runs of adjacent members, as `(lo, hi)` pairs.
    pub fn ranges(&self) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = vec![];
        for el in self.iter() {
            match out.last_mut() {
                Some((_, hi)) if *hi + 1 == el => *hi = el,
                _ => out.push((el, el)),
            }
        }
        out
    }

    pub fn iter(&self) -> BitSetIter {
        BitSetIter {
            next_frame_idx: 0,
            curr_frame: 0,
            bits: &self.bits,
        }
    }
}

impl core::iter::FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for el in iter {
            set.insert(el);
        }
        set
    }
}

pub struct BitSetIter<'a> {
    next_frame_idx: usize,
    curr_frame: Frame,
    bits: &'a [Frame],
}

impl<'a> Iterator for BitSetIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.curr_frame == 0 {
            if self.next_frame_idx >= self.bits.len() {
                return None;
            }
            self.curr_frame = self.bits[self.next_frame_idx];
            self.next_frame_idx += 1;
        }
        let skip = self.curr_frame.trailing_zeros();
        self.curr_frame &= !(1 << skip);
        Some((self.next_frame_idx - 1) * BITS_PER_FRAME + skip as usize)
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (lo, hi)) in self.ranges().into_iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}-{hi}")?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations() {
        let mut set = BitSet::new();
        set.insert(10);
        set.insert(11);
        set.insert(199);
        set.insert(23);
        set.insert(45);
        let els = [10, 11, 23, 45, 199];
        assert_eq!(set.iter().collect::<Vec<_>>(), els);
        assert!(set.contains(10));
        assert!(!set.contains(12));
        assert!(!set.contains(197));
        assert!(!set.contains(4000));
        set.remove(23);
        assert!(!set.contains(23));
        set.insert(73);
        assert_eq!(set.iter().collect::<Vec<_>>(), [10, 11, 45, 73, 199]);
        assert_eq!(set.min(), Some(10));
        assert_eq!(set.max(), Some(199));
        assert_eq!(set.count(), 5);
    }

    #[test]
    fn empty_after_remove_compares_equal() {
        let mut set = BitSet::new();
        assert!(set.is_empty());
        set.insert(100);
        assert!(!set.is_empty());
        set.remove(100);
        assert!(set.is_empty());
        assert_eq!(set, BitSet::new());
    }

    #[test]
    fn set_algebra() {
        let a = BitSet::from_range(0, 8);
        let b = BitSet::from_range(4, 8);
        assert_eq!(a.union(&b), BitSet::from_range(0, 12));
        assert_eq!(a.intersection(&b), BitSet::from_range(4, 4));
        assert_eq!(a.difference(&b), BitSet::from_range(0, 4));
        assert!(a.intersects(&b));
        assert!(BitSet::from_range(5, 2).is_subset(&a));
        assert!(!b.is_subset(&a));
        assert_eq!(a.shifted_up(60), BitSet::from_range(60, 8));
        assert_eq!(b.shifted_down(6), BitSet::from_range(0, 6));
        assert_eq!(
            BitSet::from_range(12, 4).rotated(8, 16),
            BitSet::from_range(4, 4)
        );
    }

    #[test]
    fn runs() {
        let set: BitSet = [0, 1, 2, 5, 7, 8].iter().copied().collect();
        assert_eq!(set.ranges(), [(0, 2), (5, 5), (7, 8)]);
        assert!(!set.is_contiguous());
        assert!(BitSet::from_range(3, 9).is_contiguous());
        assert_eq!(alloc::format!("{:?}", set), "{0-2,5,7-8}");
    }
}
