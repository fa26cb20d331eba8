//! Integration tests for the data-parallel operations.

use core::ops::ControlFlow;
use core::sync::atomic::{AtomicUsize, Ordering};

use taskforce::{Error, TaskPool};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().compact().without_time().try_init();
}

#[test]
fn reduce_matches_serial_for_any_pool_size() {
    init_tracing();
    for workers in [0, 1, 2, 8] {
        let pool = TaskPool::with_threads(workers);
        assert_eq!(pool.reduce(&[1, 2, 3, 4], None, |a, b| a + b).unwrap(), 10);
        let (sum, product) = pool
            .reduce2(&[1, 2, 3, 4], None, (0, 1), (|a, b| a + b, |a, b| a * b))
            .unwrap();
        assert_eq!((sum, product), (10, 24));
    }
}

#[test]
fn amap_squares_and_rejects_short_buffers() {
    let pool = TaskPool::with_threads(3);
    let squares = pool.amap(&[1, 2, 3, 4, 5], None, |x| x * x).unwrap();
    assert_eq!(squares, [1, 4, 9, 16, 25]);

    let mut short = [0; 4];
    assert!(matches!(
        pool.amap_into(&[1, 2, 3, 4, 5], &mut short, None, |x| x * x),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn worker_local_storage_accumulates_a_full_sum() {
    let pool = TaskPool::with_threads(4);
    let mut values: Vec<usize> = (0..1000).collect();
    let mut storage = pool.worker_local(|| 0usize);
    pool.for_each(&mut values, Some(1), |value| {
        storage.with(|slot| *slot += *value);
    })
    .unwrap();

    let range = storage.to_range();
    assert_eq!(range.len(), pool.size() + 1);
    assert_eq!(range.iter().sum::<usize>(), 499_500);
}

#[test]
fn seedless_reduce_of_empty_source_fails() {
    let pool = TaskPool::with_threads(2);
    let empty: [u32; 0] = [];
    assert!(matches!(
        pool.reduce(&empty, None, |a, b| a + b),
        Err(Error::EmptyReduce)
    ));
}

#[test]
fn break_chains_concurrent_faults() {
    // Two work units; each blocks on the barrier before acting, so both
    // are in flight before either the break or the panic lands, whatever
    // the execution order.
    let barrier = std::sync::Barrier::new(2);
    let pool = TaskPool::with_threads(1);
    let mut values = [0u32, 0, 1, 1];
    let err = pool
        .try_for_each_indexed(&mut values, Some(2), |index, _value| {
            barrier.wait();
            if index < 2 {
                ControlFlow::Break(())
            } else {
                panic!("other unit failed");
            }
        })
        .unwrap_err();
    match err {
        Error::Break { chained } => {
            let fault = chained.expect("the panicking unit is chained in");
            assert_eq!(fault.message(), Some("other unit failed"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn chained_map_overrides_the_outer_buffer_size() {
    let pool = TaskPool::with_threads(2);
    let source: Vec<u32> = (0..500).collect();
    let inner = pool.async_buf(source.clone().into_iter(), 64).unwrap();
    let outer = pool.map_pipeline(inner, |x: &u32| x + 1).unwrap();
    assert_eq!(outer.block_size(), 64);

    let collected: Vec<u32> = outer.collect();
    let expected: Vec<u32> = source.iter().map(|x| x + 1).collect();
    assert_eq!(collected, expected);
}

#[test]
fn faults_in_first_middle_and_last_units() {
    let pool = TaskPool::with_threads(2);
    let items: Vec<usize> = (0..90).collect();
    for bad in [0, 45, 89] {
        let err = pool
            .amap(&items, Some(10), |&i| {
                if i == bad {
                    panic!("unit fault");
                }
                i
            })
            .unwrap_err();
        match err {
            Error::WorkUnits(fault) => assert_eq!(fault.message(), Some("unit fault")),
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn awkward_work_unit_sizes() {
    let pool = TaskPool::with_threads(3);
    let items: Vec<u64> = (0..37).collect();
    let serial: u64 = items.iter().sum();
    // One element per unit, units larger than the source, and a size that
    // does not divide the length.
    for work_unit in [1, 5, 64] {
        assert_eq!(
            pool.reduce(&items, Some(work_unit), |a, b| a + b).unwrap(),
            serial
        );
    }
    assert!(matches!(
        pool.reduce(&items, Some(0), |a, b| a + b),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn foreach_iterates_pipelines_without_copying() {
    let pool = TaskPool::with_threads(2);
    let mapped = pool.map(0..256u64, 32, |x: &u64| x * 3).unwrap();
    let sum = AtomicUsize::new(0);
    pool.for_each_pipeline(mapped, |value| {
        sum.fetch_add(value as usize, Ordering::Relaxed);
    })
    .unwrap();
    assert_eq!(sum.load(Ordering::Relaxed), (0..256).map(|x| x * 3).sum::<u64>() as usize);
}

#[test]
fn zero_worker_pool_runs_everything_inline() {
    let pool = TaskPool::with_threads(0);
    let mut values: Vec<u32> = (0..64).collect();
    pool.for_each(&mut values, None, |v| *v += 1).unwrap();
    assert_eq!(pool.reduce(&values, None, |a, b| a + b).unwrap(), (1..=64).sum());
    let mapped = pool.amap(&values, None, |v| v * 2).unwrap();
    assert_eq!(mapped.len(), 64);
    let buffered: Vec<u32> = pool.async_buf(values.into_iter(), 8).unwrap().collect();
    assert_eq!(buffered.len(), 64);
}
