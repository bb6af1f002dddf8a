//! 性能基准测试
//!
//! 测试 rslock 在不同场景下的性能表现：
//! - 无竞争 acquire/release 吞吐
//! - 不同重入深度
//! - 双线程争用下的所有权切换

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rslock::LockManager;

/// 无竞争场景：同一线程反复拿放
fn bench_uncontended(c: &mut Criterion) {
    let manager = LockManager::new();
    let lock = manager.new_lock();

    c.bench_function("uncontended_acquire_release", |b| {
        b.iter(|| {
            lock.acquire();
            black_box(lock.depth());
            lock.release();
        });
    });
}

/// 重入深度对开销的影响
fn bench_reentrant_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("reentrant_depth");

    for depth in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let manager = LockManager::new();
            let lock = manager.new_lock();
            b.iter(|| {
                for _ in 0..depth {
                    lock.acquire();
                }
                for _ in 0..depth {
                    lock.release();
                }
            });
        });
    }

    group.finish();
}

/// 双线程争用：测量所有权在线程间来回切换的开销
fn bench_contended_handoff(c: &mut Criterion) {
    c.bench_function("contended_handoff", |b| {
        b.iter_custom(|iters| {
            let manager = LockManager::new();
            let lock = manager.new_lock();
            let stop = Arc::new(AtomicBool::new(false));

            let contender = {
                let lock = lock.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        lock.acquire();
                        lock.release();
                    }
                })
            };

            let start = Instant::now();
            for _ in 0..iters {
                lock.acquire();
                lock.release();
            }
            let elapsed = start.elapsed();

            stop.store(true, Ordering::Relaxed);
            contender.join().unwrap();
            elapsed.max(Duration::from_nanos(1))
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_reentrant_depth,
    bench_contended_handoff
);
criterion_main!(benches);
