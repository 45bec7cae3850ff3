//! Periodic shard optimizer
//!
//! A background thread runs `PRAGMA optimize` on every distinct shard on a
//! fixed period, each pass under the shard's write lock. Failures are
//! logged and swallowed; cancellation stops further ticks without aborting
//! an in-flight pass.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::shards::ShardPool;

/// Default period between optimizer passes
pub const OPTIMIZE_PERIOD: Duration = Duration::from_secs(3 * 60 * 60);

pub struct Optimizer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Optimizer {
    /// Start the optimizer with the default three hour period
    pub fn start(pool: Arc<ShardPool>) -> Self {
        Self::with_period(pool, OPTIMIZE_PERIOD)
    }

    pub fn with_period(pool: Arc<ShardPool>, period: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let (flag, signal) = &*shared;
            loop {
                let mut stopped = flag.lock();
                if !*stopped {
                    signal.wait_for(&mut stopped, period);
                }
                if *stopped {
                    break;
                }
                drop(stopped);

                Self::optimize_all(&pool);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn optimize_all(pool: &ShardPool) {
        debug!("running optimize pass over {} shard(s)", pool.shards().len());

        crossbeam::thread::scope(|scope| {
            for shard in pool.shards() {
                scope.spawn(move |_| {
                    let writer = shard.writer();
                    if let Err(error) = writer.execute_batch("PRAGMA optimize") {
                        warn!("optimize pass on shard {} failed: {error}", shard.number());
                    }
                });
            }
        })
        .ok();
    }

    /// Stop future ticks; an in-flight pass is allowed to finish
    pub fn cancel(&mut self) {
        let (flag, signal) = &*self.stop;
        *flag.lock() = true;
        signal.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Optimizer {
    fn drop(&mut self) {
        self.cancel();
    }
}
