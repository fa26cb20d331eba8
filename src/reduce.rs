//! Parallel reduce over an associative operator.
//!
//! The source splits into contiguous work units; each unit computes a
//! serial left-fold of its slice, and the driver then folds the partial
//! results serially in submission order with the same operator. Because the
//! final fold is ordered, only associativity is required of the operator,
//! not commutativity.
//!
//! With an explicit seed, every work unit starts from a copy of the seed
//! and the final fold starts from the seed as well, so the seed should be
//! an identity of the operator. Without a seed, each unit starts from its
//! first element.

use std::sync::Arc;

use crate::amap::amap_core;
use crate::batch::resolve_work_unit;
use crate::error::Error;
use crate::pool::{PoolInner, TaskPool};

// -----------------------------------------------------------------------------
// Core

fn unit_ranges(len: usize, work_unit: usize) -> Vec<(usize, usize)> {
    (0..len)
        .step_by(work_unit)
        .map(|start| (start, len.min(start + work_unit)))
        .collect()
}

fn fold_slice<T, F>(slice: &[T], seed: Option<T>, op: &F) -> T
where
    T: Clone,
    F: Fn(T, T) -> T,
{
    let mut iter = slice.iter();
    let mut acc = match seed {
        Some(seed) => seed,
        None => iter.next().expect("work units are non-empty").clone(),
    };
    for item in iter {
        acc = op(acc, item.clone());
    }
    acc
}

pub(crate) fn reduce_core<T, F>(
    pool: &Arc<PoolInner>,
    items: &[T],
    work_unit: Option<usize>,
    seed: Option<T>,
    op: &F,
) -> Result<T, Error>
where
    T: Clone + Send + Sync,
    F: Fn(T, T) -> T + Sync,
{
    if items.is_empty() {
        return match seed {
            Some(seed) => Ok(seed),
            None => Err(Error::EmptyReduce),
        };
    }
    let work_unit = resolve_work_unit(work_unit, pool.size(), items.len())?;
    let ranges = unit_ranges(items.len(), work_unit);
    let partials = amap_core(pool, &ranges, Some(1), &|&(start, end): &(usize, usize)| {
        fold_slice(&items[start..end], seed.clone(), op)
    })?;

    let mut partials = partials.into_iter();
    let mut acc = match seed {
        Some(seed) => seed,
        None => partials.next().expect("at least one work unit"),
    };
    for partial in partials {
        acc = op(acc, partial);
    }
    Ok(acc)
}

pub(crate) fn reduce_pair_core<T, F, G>(
    pool: &Arc<PoolInner>,
    items: &[T],
    work_unit: Option<usize>,
    seeds: (T, T),
    ops: (&F, &G),
) -> Result<(T, T), Error>
where
    T: Clone + Send + Sync,
    F: Fn(T, T) -> T + Sync,
    G: Fn(T, T) -> T + Sync,
{
    if items.is_empty() {
        return Ok(seeds);
    }
    let work_unit = resolve_work_unit(work_unit, pool.size(), items.len())?;
    let ranges = unit_ranges(items.len(), work_unit);
    let partials = amap_core(pool, &ranges, Some(1), &|&(start, end): &(usize, usize)| {
        let mut first = seeds.0.clone();
        let mut second = seeds.1.clone();
        for item in &items[start..end] {
            first = ops.0(first, item.clone());
            second = ops.1(second, item.clone());
        }
        (first, second)
    })?;

    let (mut first, mut second) = seeds;
    for (partial_first, partial_second) in partials {
        first = ops.0(first, partial_first);
        second = ops.1(second, partial_second);
    }
    Ok((first, second))
}

// -----------------------------------------------------------------------------
// Pool surface

impl TaskPool {
    /// Reduces `items` under an associative operator, seeding each work
    /// unit with its first element.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyReduce`] when `items` is empty.
    pub fn reduce<T, F>(&self, items: &[T], work_unit: Option<usize>, op: F) -> Result<T, Error>
    where
        T: Clone + Send + Sync,
        F: Fn(T, T) -> T + Sync,
    {
        reduce_core(self.inner(), items, work_unit, None, &op)
    }

    /// Reduces `items` under an associative operator with an explicit seed.
    /// The seed should be an identity of the operator; every work unit
    /// folds from a copy of it. An empty source returns the seed.
    pub fn fold<T, F>(
        &self,
        items: &[T],
        work_unit: Option<usize>,
        seed: T,
        op: F,
    ) -> Result<T, Error>
    where
        T: Clone + Send + Sync,
        F: Fn(T, T) -> T + Sync,
    {
        reduce_core(self.inner(), items, work_unit, Some(seed), &op)
    }

    /// Folds two independent accumulators over `items` in one parallel
    /// pass, one per operator, each seeded with its half of `seeds`.
    pub fn reduce2<T, F, G>(
        &self,
        items: &[T],
        work_unit: Option<usize>,
        seeds: (T, T),
        ops: (F, G),
    ) -> Result<(T, T), Error>
    where
        T: Clone + Send + Sync,
        F: Fn(T, T) -> T + Sync,
        G: Fn(T, T) -> T + Sync,
    {
        reduce_pair_core(self.inner(), items, work_unit, seeds, (&ops.0, &ops.1))
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_match_the_serial_fold() {
        for workers in [0, 1, 4] {
            let pool = TaskPool::with_threads(workers);
            let items: Vec<u64> = (1..=1000).collect();
            let total = pool.reduce(&items, Some(7), |a, b| a + b).unwrap();
            assert_eq!(total, 500_500);
        }
    }

    #[test]
    fn subtraction_keeps_source_order() {
        // Not associative, but the ordered final fold still makes the
        // outcome depend only on the unit boundaries; with a unit per
        // element it must equal the serial left fold.
        let pool = TaskPool::with_threads(3);
        let items: Vec<i64> = (0..50).collect();
        let serial = items.iter().skip(1).fold(items[0], |a, &b| a - b);
        let parallel = pool.reduce(&items, Some(1), |a, b| a - b).unwrap();
        assert_eq!(parallel, serial);
    }

    #[test]
    fn string_concatenation_is_ordered() {
        let pool = TaskPool::with_threads(4);
        let words: Vec<String> = (0..40).map(|i| format!("{i},")).collect();
        let expected = words.concat();
        let joined = pool
            .fold(&words, Some(3), String::new(), |a, b| a + &b)
            .unwrap();
        assert_eq!(joined, expected);
    }

    #[test]
    fn empty_without_seed_is_an_error() {
        let pool = TaskPool::with_threads(2);
        let empty: [i32; 0] = [];
        assert!(matches!(
            pool.reduce(&empty, None, |a, b| a + b),
            Err(Error::EmptyReduce)
        ));
        assert_eq!(pool.fold(&empty, None, 9, |a, b| a + b).unwrap(), 9);
    }

    #[test]
    fn single_element_source() {
        let pool = TaskPool::with_threads(2);
        assert_eq!(pool.reduce(&[41], None, |a, b| a + b).unwrap(), 41);
    }

    #[test]
    fn pair_reduction_folds_components_independently() {
        let pool = TaskPool::with_threads(2);
        let items = [1, 2, 3, 4];
        let (sum, product) = pool
            .reduce2(&items, Some(2), (0, 1), (|a, b| a + b, |a, b| a * b))
            .unwrap();
        assert_eq!((sum, product), (10, 24));
    }

    #[test]
    fn operator_panic_is_reported() {
        let pool = TaskPool::with_threads(2);
        let items: Vec<i32> = (0..100).collect();
        let err = pool
            .reduce(&items, Some(4), |a, b| {
                if b == 63 {
                    panic!("bad operand");
                }
                a + b
            })
            .unwrap_err();
        assert!(matches!(err, Error::WorkUnits(_)));
    }
}
