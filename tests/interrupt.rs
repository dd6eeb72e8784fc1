//! Interrupt handling, in its own test binary: the pending interrupt is
//! process-wide and would otherwise stop unrelated pools running in
//! parallel.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use forkpool::worker::{CHANNEL_PROJECT, SEMAPHORE_PROJECT};
use forkpool::{Channel, IpcKey, Pool, PoolConfig, PoolError, Semaphore, Value, WorkUnit};
use nix::sys::signal::{Signal, raise};
use tempfile::NamedTempFile;

#[test]
fn test_sigint_stops_run_and_removes_resources() {
    let seed = NamedTempFile::new().unwrap();
    let mut pool = Pool::new(
        PoolConfig::default()
            .with_workers(2)
            .with_key_seed(seed.path())
            .with_poll_interval(Duration::from_millis(2)),
    );
    for i in 0..4 {
        pool.submit(WorkUnit::from_fn(format!("long-{}", i), || {
            thread::sleep(Duration::from_secs(5));
            Ok(Value::Null)
        }))
        .unwrap();
    }

    // Interrupt the root once both workers are busy
    let forks = Rc::new(Cell::new(0));
    let counter = Rc::clone(&forks);
    pool.set_post_fork_parent(move |_| {
        counter.set(counter.get() + 1);
        if counter.get() == 2 {
            raise(Signal::SIGINT).unwrap();
        }
    });

    let started = Instant::now();
    let err = pool.run().unwrap_err();
    assert!(
        matches!(err, PoolError::Interrupted(Signal::SIGINT)),
        "unexpected error: {}",
        err
    );
    // Running children were killed, not waited for
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(forks.get(), 2);
    assert_eq!(pool.running(), 0);
    assert_eq!(pool.queued(), 0);

    let channel = IpcKey::derive(seed.path(), CHANNEL_PROJECT).unwrap();
    let semaphore = IpcKey::derive(seed.path(), SEMAPHORE_PROJECT).unwrap();
    assert!(!Channel::exists(channel));
    assert!(!Semaphore::exists(semaphore));
}
