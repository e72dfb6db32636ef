// Transfer progress accounting — byte counters plus a throughput/ETA
// readout, and the reporter seam the jobs layer hangs task updates on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Receives fraction-complete updates as a transfer advances. The jobs
/// layer implements this with a closure that folds the fraction into the
/// owning task's percentage.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, fraction: f64);
}

impl<F> ProgressReporter for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, fraction: f64) {
        self(fraction)
    }
}

/// Reporter that discards updates.
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _fraction: f64) {}
}

struct MeterSample {
    at: Instant,
    done: u64,
}

#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub done_bytes: u64,
    pub total_bytes: u64,
    /// In [0, 1]; 0 when the total is unknown.
    pub fraction: f64,
    pub throughput_bps: u64,
    pub eta: Option<Duration>,
}

/// Per-transfer byte meter. `total` may be zero when the server did not
/// announce a content length; fraction then stays 0 and only the byte
/// counters are meaningful.
pub struct ProgressMeter {
    total: AtomicU64,
    done: AtomicU64,
    last_sample: Mutex<MeterSample>,
}

impl ProgressMeter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
            last_sample: Mutex::new(MeterSample {
                at: Instant::now(),
                done: 0,
            }),
        }
    }

    /// Reset for a fresh attempt. `done` seeds the counter with bytes
    /// already on disk when resuming.
    pub fn start(&self, total: u64, done: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(done, Ordering::Relaxed);
        let mut sample = self.last_sample.lock();
        sample.at = Instant::now();
        sample.done = done;
    }

    pub fn advance(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn fraction(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.done.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let now = Instant::now();
        let total = self.total.load(Ordering::Relaxed);
        let done = self.done.load(Ordering::Relaxed);

        let throughput_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((done.saturating_sub(sample.done)) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.done = done;
            bps
        };

        let remaining = total.saturating_sub(done);
        let eta = if throughput_bps > 0 && total > 0 {
            Some(Duration::from_secs(remaining / throughput_bps))
        } else {
            None
        };

        ProgressSnapshot {
            done_bytes: done,
            total_bytes: total,
            fraction: if total == 0 {
                0.0
            } else {
                (done as f64 / total as f64).min(1.0)
            },
            throughput_bps,
            eta,
        }
    }
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self::new()
    }
}
