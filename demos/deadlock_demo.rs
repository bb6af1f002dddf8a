//! rslock 死锁自动恢复演示
//!
//! 两个线程以相反的顺序获取两把锁，制造经典的 AB-BA 死锁；
//! 协调器检测到等待环后挂起其中一个线程持有的锁，双方都能完成。

use std::sync::Barrier;
use std::thread;

use rslock::LockManager;

fn main() {
    env_logger::init();

    println!("🔒 rslock 死锁自动恢复演示");
    println!("==========================");

    let manager = LockManager::new();
    let lock_a = manager.new_lock();
    let lock_b = manager.new_lock();
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        let (lock_a, lock_b, barrier) = (&lock_a, &lock_b, &barrier);
        let forward = thread::Builder::new()
            .name("forward".to_string())
            .spawn_scoped(scope, move || {
                lock_a.acquire();
                println!("  forward  持有 A，等待 B ...");
                barrier.wait();
                lock_b.acquire();
                println!("  forward  同时持有 A 和 B ✅");
                lock_b.release();
                lock_a.release();
            })
            .unwrap();
        let reverse = thread::Builder::new()
            .name("reverse".to_string())
            .spawn_scoped(scope, move || {
                lock_b.acquire();
                println!("  reverse  持有 B，等待 A ...");
                barrier.wait();
                lock_a.acquire();
                println!("  reverse  同时持有 A 和 B ✅");
                lock_a.release();
                lock_b.release();
            })
            .unwrap();
        forward.join().unwrap();
        reverse.join().unwrap();
    });

    println!("\n📊 协调器统计");
    println!("{:#?}", manager.metrics().snapshot());
}
