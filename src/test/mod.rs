//! In-crate integration tests, run against the scripted server in
//! [`harness`].

mod auth;
mod cursor;
mod topology;

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use lazy_static::lazy_static;

lazy_static! {
    static ref SERIAL: Mutex<()> = Mutex::new(());
}

/// Serializes tests that talk to servers or read the process-wide stats;
/// the counters are global, so overlapping tests would see each other.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Like [`serial`], additionally zeroing the stats for absolute assertions.
pub(crate) fn serial_with_stats() -> MutexGuard<'static, ()> {
    let guard = serial();
    crate::stats::reset_stats();
    guard
}

/// Polls `condition` for a couple of seconds, for effects that trail the
/// operation that caused them (fire-and-forget writes, cursor kills).
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// [`eventually`] for conditions that must themselves run driver
/// operations.
pub(crate) async fn eventually_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
