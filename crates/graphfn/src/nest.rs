//! Nested argument and result structures.
//!
//! A [`Nest`] is a tree whose leaves carry values and whose interior nodes are
//! ordered sequences. Tracing flattens arguments and results into leaf lists plus
//! a [`Structure`] descriptor, and rebuilds the same shape from a leaf list after
//! execution.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Nest<T> {
    Leaf(T),
    Seq(Vec<Nest<T>>),
}

/// Shape of a [`Nest`] with the leaves removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Structure {
    Leaf,
    Seq(Vec<Structure>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NestError {
    #[error("structure expects {expected} leaves but only {actual} were supplied")]
    TooFewLeaves { expected: usize, actual: usize },
    #[error("structure expects {expected} leaves but more were supplied")]
    TooManyLeaves { expected: usize },
}

impl<T> Nest<T> {
    pub fn leaf(value: T) -> Self {
        Nest::Leaf(value)
    }

    pub fn seq(items: impl IntoIterator<Item = Nest<T>>) -> Self {
        Nest::Seq(items.into_iter().collect())
    }

    /// A one-level sequence of leaves.
    pub fn flat(values: impl IntoIterator<Item = T>) -> Self {
        Nest::Seq(values.into_iter().map(Nest::Leaf).collect())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Nest::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Nest::Leaf(value) => Some(value),
            Nest::Seq(_) => None,
        }
    }

    pub fn into_leaf(self) -> Option<T> {
        match self {
            Nest::Leaf(value) => Some(value),
            Nest::Seq(_) => None,
        }
    }

    /// Positional child of a sequence.
    pub fn get(&self, index: usize) -> Option<&Nest<T>> {
        match self {
            Nest::Leaf(_) => None,
            Nest::Seq(items) => items.get(index),
        }
    }

    pub fn structure(&self) -> Structure {
        match self {
            Nest::Leaf(_) => Structure::Leaf,
            Nest::Seq(items) => Structure::Seq(items.iter().map(Nest::structure).collect()),
        }
    }

    /// Leaves in depth-first, left-to-right order.
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Nest::Leaf(value) => out.push(value),
            Nest::Seq(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
        }
    }

    pub fn flatten(self) -> (Vec<T>, Structure) {
        let structure = self.structure();
        let mut leaves = Vec::with_capacity(structure.leaf_count());
        self.collect_owned(&mut leaves);
        (leaves, structure)
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Nest::Leaf(value) => out.push(value),
            Nest::Seq(items) => {
                for item in items {
                    item.collect_owned(out);
                }
            }
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Nest<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(self, f: &mut impl FnMut(T) -> U) -> Nest<U> {
        match self {
            Nest::Leaf(value) => Nest::Leaf(f(value)),
            Nest::Seq(items) => Nest::Seq(items.into_iter().map(|item| item.map_inner(f)).collect()),
        }
    }

    pub fn try_map_ref<U, E>(&self, mut f: impl FnMut(&T) -> Result<U, E>) -> Result<Nest<U>, E> {
        self.try_map_ref_inner(&mut f)
    }

    fn try_map_ref_inner<U, E>(
        &self,
        f: &mut impl FnMut(&T) -> Result<U, E>,
    ) -> Result<Nest<U>, E> {
        match self {
            Nest::Leaf(value) => Ok(Nest::Leaf(f(value)?)),
            Nest::Seq(items) => items
                .iter()
                .map(|item| item.try_map_ref_inner(f))
                .collect::<Result<Vec<_>, E>>()
                .map(Nest::Seq),
        }
    }
}

impl<T> Nest<Option<T>> {
    /// Non-`None` leaves in order, dropping the placeholders for absent values.
    pub fn into_present(self) -> Vec<T> {
        self.flatten().0.into_iter().flatten().collect()
    }
}

impl Structure {
    pub fn leaf_count(&self) -> usize {
        match self {
            Structure::Leaf => 1,
            Structure::Seq(items) => items.iter().map(Structure::leaf_count).sum(),
        }
    }

    /// Rebuilds a nest of this shape, consuming exactly `leaf_count` values.
    pub fn rebuild<T>(&self, leaves: impl IntoIterator<Item = T>) -> Result<Nest<T>, NestError> {
        let expected = self.leaf_count();
        let mut iter = leaves.into_iter();
        let mut consumed = 0usize;
        let nest = self.rebuild_from(&mut iter, &mut consumed, expected)?;
        if iter.next().is_some() {
            return Err(NestError::TooManyLeaves { expected });
        }
        Ok(nest)
    }

    fn rebuild_from<T>(
        &self,
        iter: &mut impl Iterator<Item = T>,
        consumed: &mut usize,
        expected: usize,
    ) -> Result<Nest<T>, NestError> {
        match self {
            Structure::Leaf => {
                let value = iter.next().ok_or(NestError::TooFewLeaves {
                    expected,
                    actual: *consumed,
                })?;
                *consumed += 1;
                Ok(Nest::Leaf(value))
            }
            Structure::Seq(items) => items
                .iter()
                .map(|item| item.rebuild_from(iter, consumed, expected))
                .collect::<Result<Vec<_>, _>>()
                .map(Nest::Seq),
        }
    }
}

impl<T> From<Vec<Nest<T>>> for Nest<T> {
    fn from(items: Vec<Nest<T>>) -> Self {
        Nest::Seq(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_then_rebuild_preserves_shape() {
        let nest = Nest::seq([
            Nest::leaf(1),
            Nest::seq([Nest::leaf(2), Nest::seq([]), Nest::leaf(3)]),
        ]);
        let (leaves, structure) = nest.clone().flatten();
        assert_eq!(leaves, vec![1, 2, 3]);
        assert_eq!(structure.rebuild(leaves).unwrap(), nest);
    }

    #[test]
    fn bare_leaf_is_distinct_from_singleton_sequence() {
        let bare = Nest::leaf(5).structure();
        let wrapped = Nest::flat([5]).structure();
        assert_ne!(bare, wrapped);
        assert_eq!(bare.leaf_count(), wrapped.leaf_count());
    }

    #[test]
    fn rebuild_reports_leaf_count_mismatch() {
        let structure = Nest::flat([0, 0]).structure();
        assert_eq!(
            structure.rebuild([1]).unwrap_err(),
            NestError::TooFewLeaves {
                expected: 2,
                actual: 1
            }
        );
        assert_eq!(
            structure.rebuild([1, 2, 3]).unwrap_err(),
            NestError::TooManyLeaves { expected: 2 }
        );
    }

    #[test]
    fn into_present_skips_absent_leaves() {
        let nest = Nest::seq([Nest::leaf(Some(1)), Nest::leaf(None), Nest::leaf(Some(3))]);
        assert_eq!(nest.into_present(), vec![1, 3]);
    }
}
