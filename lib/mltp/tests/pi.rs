// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Computes pi by numerical integration with unbound threads sharing a
//! locked sum.

use std::sync::{Arc, Mutex};

use mltp::{yield_now, Barrier, Lock, LockClass, Scheduler};

fn integrate(class: LockClass, threads: usize, intervals: usize, vps: usize) -> f64 {
    let s = Scheduler::new();
    let lock = Arc::new(Lock::new(class).unwrap());
    // The inner mutex is never contended, `lock` does the exclusion.
    let sum = Arc::new(Mutex::new(0.0f64));
    let barrier = Arc::new(Barrier::new());
    let width = 1.0 / intervals as f64;

    for tid in 0..threads {
        let lock = lock.clone();
        let sum = sum.clone();
        let barrier = barrier.clone();
        s.create(move || {
            barrier.enter(threads);

            let mut local = 0.0;
            for i in (tid..intervals).step_by(threads) {
                let x = (i as f64 + 0.5) * width;
                local += 4.0 / (1.0 + x * x);
                if i % 100 == 0 {
                    yield_now();
                }
            }

            let _g = lock.lock();
            let mut sum = sum.try_lock().expect("lock doesn't exclude");
            *sum += local * width;
        })
        .unwrap();
    }

    s.start(vps).unwrap();
    let pi = *sum.lock().unwrap();
    pi
}

#[test]
fn pi_two_vps() {
    let _r = env_logger::try_init();

    let pi = integrate(LockClass::Spin, 4, 1000, 2);
    assert!((pi - std::f64::consts::PI).abs() < 0.01, "pi = {}", pi);
}

#[test]
fn pi_every_lock_class() {
    let _r = env_logger::try_init();

    for class in [
        LockClass::Spin,
        LockClass::Block,
        LockClass::BlockFront,
        LockClass::Semaphore,
    ]
    .iter()
    {
        let pi = integrate(*class, 8, 10_000, 3);
        assert!(
            (pi - std::f64::consts::PI).abs() < 1e-6,
            "{:?}: pi = {}",
            class,
            pi
        );
    }
}
