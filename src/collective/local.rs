use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::Collective;
use crate::error::{Result, TrainError};

/// In-process worker group: one `LocalCollective` handle per simulated
/// worker (typically one per thread).
///
/// Used by tests and single-host simulations; semantics match
/// `TcpCollective` including the timeout behavior. A participant that times
/// out poisons the group so its siblings fail fast instead of waiting for
/// their own full window.
pub struct LocalGroup {
    shared: Arc<Shared>,
}

struct Shared {
    world_size: usize,
    join_timeout: Duration,
    sync_timeout: Duration,
    slot: Mutex<Slot>,
    cv: Condvar,
}

struct Slot {
    /// Completed-rounds counter; doubles as the wakeup condition.
    generation: u64,
    arrived: usize,
    /// Sum accumulator for the in-flight reduction.
    acc: Vec<f32>,
    /// Averaged output of the last completed reduction. Kept separate from
    /// `acc` (and swapped, not copied) so a slow worker can still read round
    /// *n*'s result while round *n+1* accumulates.
    result: Vec<f32>,
    poisoned: bool,
}

impl LocalGroup {
    pub fn new(world_size: NonZeroUsize, join_timeout: Duration, sync_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                world_size: world_size.get(),
                join_timeout,
                sync_timeout,
                slot: Mutex::new(Slot {
                    generation: 0,
                    arrived: 0,
                    acc: Vec::new(),
                    result: Vec::new(),
                    poisoned: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Hands out the collective endpoint for `rank`.
    ///
    /// # Panics
    /// If `rank` is out of range.
    pub fn handle(&self, rank: usize) -> LocalCollective {
        assert!(rank < self.shared.world_size, "rank out of range");
        LocalCollective {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One worker's endpoint into a `LocalGroup`.
pub struct LocalCollective {
    rank: usize,
    shared: Arc<Shared>,
}

enum Wait {
    Join,
    Sync(&'static str),
}

impl Wait {
    fn timeout(&self, shared: &Shared) -> Duration {
        match self {
            Wait::Join => shared.join_timeout,
            Wait::Sync(_) => shared.sync_timeout,
        }
    }

    fn error(&self, waited: Duration) -> TrainError {
        match self {
            Wait::Join => TrainError::JoinTimeout { waited },
            Wait::Sync(op) => TrainError::SyncStall { op, waited },
        }
    }
}

impl LocalCollective {
    /// One group-wide rendezvous round, optionally carrying a reduction.
    ///
    /// Every participant of a round must agree on whether it carries data;
    /// the session guarantees this because all workers execute the same
    /// operation sequence.
    fn rendezvous(&self, mut contrib: Option<&mut [f32]>, wait: Wait) -> Result<()> {
        let shared = &self.shared;
        let timeout = wait.timeout(shared);
        let mut slot = shared.slot.lock();

        if slot.poisoned {
            return Err(wait.error(Duration::ZERO));
        }

        let round = slot.generation;

        if let Some(buf) = contrib.as_deref() {
            if slot.arrived == 0 {
                slot.acc.clear();
                slot.acc.extend_from_slice(buf);
            } else {
                if slot.acc.len() != buf.len() {
                    slot.poisoned = true;
                    shared.cv.notify_all();
                    return Err(TrainError::Shape {
                        what: "all-reduce buffer",
                        got: buf.len(),
                        expected: slot.acc.len(),
                    });
                }
                for (a, v) in slot.acc.iter_mut().zip(buf) {
                    *a += v;
                }
            }
        }

        slot.arrived += 1;

        if slot.arrived == shared.world_size {
            if contrib.is_some() {
                let world = shared.world_size as f32;
                for a in slot.acc.iter_mut() {
                    *a /= world;
                }
                let Slot { acc, result, .. } = &mut *slot;
                std::mem::swap(acc, result);
            }
            slot.arrived = 0;
            slot.generation += 1;
            shared.cv.notify_all();
        } else {
            let start = Instant::now();
            let deadline = start + timeout;
            while slot.generation == round && !slot.poisoned {
                if shared.cv.wait_until(&mut slot, deadline).timed_out() {
                    slot.poisoned = true;
                    shared.cv.notify_all();
                    return Err(wait.error(start.elapsed()));
                }
            }
            if slot.poisoned {
                return Err(wait.error(start.elapsed()));
            }
        }

        if let Some(buf) = contrib.as_deref_mut() {
            buf.copy_from_slice(&slot.result);
        }

        Ok(())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn join(&mut self) -> Result<()> {
        self.rendezvous(None, Wait::Join)
    }

    fn all_reduce_average(&mut self, buf: &mut [f32]) -> Result<()> {
        self.rendezvous(Some(buf), Wait::Sync("gradient all-reduce"))
    }

    fn barrier(&mut self) -> Result<()> {
        self.rendezvous(None, Wait::Sync("barrier"))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const FAST: Duration = Duration::from_secs(5);

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn all_reduce_averages_across_workers() {
        let group = LocalGroup::new(nz(2), FAST, FAST);
        let mut a = group.handle(0);
        let mut b = group.handle(1);

        let tb = thread::spawn(move || {
            b.join().unwrap();
            let mut buf = vec![3.0, 4.0];
            b.all_reduce_average(&mut buf).unwrap();
            buf
        });

        a.join().unwrap();
        let mut buf = vec![1.0, 2.0];
        a.all_reduce_average(&mut buf).unwrap();

        assert_eq!(buf, vec![2.0, 3.0]);
        assert_eq!(tb.join().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn consecutive_rounds_do_not_bleed() {
        let group = LocalGroup::new(nz(2), FAST, FAST);
        let mut a = group.handle(0);
        let mut b = group.handle(1);

        let tb = thread::spawn(move || {
            b.join().unwrap();
            let mut out = Vec::new();
            for v in [10.0, 20.0, 30.0] {
                let mut buf = vec![v];
                b.all_reduce_average(&mut buf).unwrap();
                out.push(buf[0]);
            }
            out
        });

        a.join().unwrap();
        let mut out = Vec::new();
        for v in [0.0, 0.0, 0.0] {
            let mut buf = vec![v];
            a.all_reduce_average(&mut buf).unwrap();
            out.push(buf[0]);
        }

        assert_eq!(out, vec![5.0, 10.0, 15.0]);
        assert_eq!(tb.join().unwrap(), vec![5.0, 10.0, 15.0]);
    }

    #[test]
    fn join_times_out_when_a_worker_is_missing() {
        let group = LocalGroup::new(nz(2), Duration::from_millis(100), FAST);
        let mut a = group.handle(0);

        let start = Instant::now();
        let err = a.join().unwrap_err();
        assert!(matches!(err, TrainError::JoinTimeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn timeout_poisons_the_group() {
        let group = LocalGroup::new(nz(3), FAST, Duration::from_millis(100));
        let mut a = group.handle(0);
        let mut b = group.handle(1);
        let mut c = group.handle(2);

        // everyone joins, then rank 2 never shows up for the reduction
        let tb = thread::spawn(move || {
            b.join().unwrap();
            let mut buf = vec![1.0];
            b.all_reduce_average(&mut buf).unwrap_err()
        });
        let tc = thread::spawn(move || c.join());

        a.join().unwrap();
        tc.join().unwrap().unwrap();

        let mut buf = vec![1.0];
        let err = a.all_reduce_average(&mut buf).unwrap_err();
        assert!(matches!(err, TrainError::SyncStall { .. }), "{err}");
        assert!(matches!(
            tb.join().unwrap(),
            TrainError::SyncStall { .. }
        ));
    }
}
