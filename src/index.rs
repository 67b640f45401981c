/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Typed indices and the arenas they index.

#[macro_export]
macro_rules! define_index {
    ($ix:ident, $storage:ident, $elem:ident) => {
        define_index!($ix);

        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $storage {
            storage: alloc::vec::Vec<$elem>,
        }

        impl $storage {
            #[inline(always)]
            pub fn new() -> Self {
                Self {
                    storage: alloc::vec::Vec::new(),
                }
            }

            #[inline(always)]
            pub fn with_capacity(n: usize) -> Self {
                Self {
                    storage: alloc::vec::Vec::with_capacity(n),
                }
            }

            #[inline(always)]
            pub fn len(&self) -> usize {
                self.storage.len()
            }

            #[inline(always)]
            pub fn is_empty(&self) -> bool {
                self.storage.is_empty()
            }

            #[inline(always)]
            pub fn iter(&self) -> impl Iterator<Item = &$elem> {
                self.storage.iter()
            }

            /// Iterate over `(index, element)` pairs.
            #[inline(always)]
            pub fn enumerate(&self) -> impl Iterator<Item = ($ix, &$elem)> {
                self.storage
                    .iter()
                    .enumerate()
                    .map(|(i, e)| ($ix::new(i), e))
            }

            #[inline(always)]
            pub fn indices(&self) -> impl Iterator<Item = $ix> {
                (0..self.storage.len()).map($ix::new)
            }

            #[inline(always)]
            pub fn push(&mut self, value: $elem) -> $ix {
                let idx = $ix(self.storage.len() as u32);
                self.storage.push(value);
                idx
            }
        }

        impl core::ops::Index<$ix> for $storage {
            type Output = $elem;

            #[inline(always)]
            fn index(&self, i: $ix) -> &Self::Output {
                &self.storage[i.index()]
            }
        }

        impl core::ops::IndexMut<$ix> for $storage {
            #[inline(always)]
            fn index_mut(&mut self, i: $ix) -> &mut Self::Output {
                &mut self.storage[i.index()]
            }
        }

        impl<'a> IntoIterator for &'a $storage {
            type Item = &'a $elem;
            type IntoIter = core::slice::Iter<'a, $elem>;

            #[inline(always)]
            fn into_iter(self) -> Self::IntoIter {
                self.storage.iter()
            }
        }

        impl core::iter::FromIterator<$elem> for $storage {
            fn from_iter<I: IntoIterator<Item = $elem>>(iter: I) -> Self {
                Self {
                    storage: iter.into_iter().collect(),
                }
            }
        }
    };

    ($ix:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "enable-serde",
            derive(::serde::Serialize, ::serde::Deserialize)
        )]
        pub struct $ix(pub u32);
        impl $ix {
            #[inline(always)]
            pub fn new(i: usize) -> Self {
                Self(i as u32)
            }
            #[inline(always)]
            pub fn index(self) -> usize {
                debug_assert!(self.is_valid());
                self.0 as usize
            }
            #[inline(always)]
            pub fn invalid() -> Self {
                Self(u32::MAX)
            }
            #[inline(always)]
            pub fn is_invalid(self) -> bool {
                self == Self::invalid()
            }
            #[inline(always)]
            pub fn is_valid(self) -> bool {
                self != Self::invalid()
            }
            #[inline(always)]
            pub fn raw_u32(self) -> u32 {
                self.0
            }
        }

        impl crate::index::ArenaIndex for $ix {
            #[inline(always)]
            fn from_usize(i: usize) -> Self {
                Self::new(i)
            }
            #[inline(always)]
            fn to_usize(self) -> usize {
                self.index()
            }
        }
    };
}

/// Dense indices into an arena, usable as union-find keys.
pub trait ArenaIndex: Clone + Copy + core::fmt::Debug + PartialEq + Eq {
    fn from_usize(i: usize) -> Self;
    fn to_usize(self) -> usize;
}
