//! Shared progress accounting for concurrent part uploads.
//!
//! One atomic counter tracks total bytes sent; parts add to it as chunks
//! leave for the network and roll their contribution back on retry.
//! Publication happens on two strides, a dot at every 2% and a log line at
//! every 20%, each won by a compare-and-swap so concurrent parts crossing
//! the same stride report it once.

use bytesize::ByteSize;
use std::{
    io::{self, Write},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

const DOT_STRIDES: u64 = 50; // one dot per 2%
const LOG_STRIDES: u64 = 5; // one log line per 20%

struct LogPoint {
    at: Instant,
    bytes: u64,
}

pub struct Progress {
    total: u64,
    uploaded: AtomicU64,
    dot_stride: AtomicU64,
    log_stride: AtomicU64,
    started: Instant,
    last_log: Mutex<LogPoint>,
}

impl Progress {
    #[must_use]
    pub fn new(total: u64) -> Self {
        let now = Instant::now();

        Self {
            total: total.max(1),
            uploaded: AtomicU64::new(0),
            dot_stride: AtomicU64::new(0),
            log_stride: AtomicU64::new(0),
            started: now,
            last_log: Mutex::new(LogPoint { at: now, bytes: 0 }),
        }
    }

    /// Account `bytes` written to the sink and publish any stride crossed.
    pub fn add(&self, bytes: u64) {
        let uploaded = self.uploaded.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.publish_dots(uploaded);
        self.publish_log(uploaded);
    }

    /// Rewind a part's contribution before its retry. Published strides are
    /// deliberately left alone; the CAS suppresses duplicates when the
    /// counter climbs past them again.
    pub fn rollback(&self, bytes: u64) {
        self.uploaded.fetch_sub(bytes, Ordering::SeqCst);
    }

    #[must_use]
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn dots_published(&self) -> u64 {
        self.dot_stride.load(Ordering::SeqCst)
    }

    fn publish_dots(&self, uploaded: u64) {
        let stride = (uploaded.min(self.total) * DOT_STRIDES) / self.total;

        let Some(seen) = claim_stride(&self.dot_stride, stride) else {
            return;
        };

        let mut stderr = io::stderr().lock();
        for _ in seen..stride {
            let _ = stderr.write_all(b".");
        }
        let _ = stderr.flush();
    }

    fn publish_log(&self, uploaded: u64) {
        let stride = (uploaded.min(self.total) * LOG_STRIDES) / self.total;

        if claim_stride(&self.log_stride, stride).is_some() {
            let now = Instant::now();
            let mut last = self.last_log.lock().unwrap_or_else(PoisonError::into_inner);

            let instant_rate = rate(uploaded.saturating_sub(last.bytes), last.at, now);
            let average_rate = rate(uploaded, self.started, now);

            last.at = now;
            last.bytes = uploaded;
            drop(last);

            log::info!(
                "{}% uploaded, {}/s current, {}/s average",
                stride * (100 / LOG_STRIDES),
                ByteSize(instant_rate),
                ByteSize(average_rate),
            );
        }
    }
}

// Advance `counter` to `stride`, returning the previous value for the
// winner and `None` for every racer that lost or had nothing to publish.
fn claim_stride(counter: &AtomicU64, stride: u64) -> Option<u64> {
    let mut seen = counter.load(Ordering::SeqCst);

    while stride > seen {
        match counter.compare_exchange(seen, stride, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return Some(seen),
            Err(current) => seen = current,
        }
    }

    None
}

fn rate(bytes: u64, from: Instant, to: Instant) -> u64 {
    let elapsed = to.duration_since(from).as_secs_f64();
    if elapsed > 0.0 {
        (bytes as f64 / elapsed) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_tracks_adds_and_rollbacks() {
        let progress = Progress::new(100);

        progress.add(40);
        assert_eq!(progress.uploaded(), 40);

        progress.rollback(40);
        assert_eq!(progress.uploaded(), 0);

        progress.add(100);
        assert_eq!(progress.uploaded(), 100);
    }

    #[test]
    fn test_dot_strides_advance_with_bytes() {
        let progress = Progress::new(1000);

        progress.add(20); // 2%
        assert_eq!(progress.dots_published(), 1);

        progress.add(20); // 4%
        assert_eq!(progress.dots_published(), 2);

        progress.add(960);
        assert_eq!(progress.dots_published(), DOT_STRIDES);
    }

    #[test]
    fn test_strides_survive_rollback_without_duplicates() {
        let progress = Progress::new(1000);

        progress.add(500);
        assert_eq!(progress.dots_published(), 25);

        // a failed part rewinds, then re-uploads: no extra dots on the way back up
        progress.rollback(500);
        progress.add(500);
        assert_eq!(progress.dots_published(), 25);

        progress.add(500);
        assert_eq!(progress.dots_published(), DOT_STRIDES);
        assert_eq!(progress.uploaded(), 1000);
    }

    #[test]
    fn test_tiny_totals_do_not_panic() {
        let progress = Progress::new(0);
        progress.add(1);
        assert_eq!(progress.uploaded(), 1);
    }

    #[test]
    fn test_concurrent_adds_publish_each_stride_once() {
        use std::sync::Arc;
        use std::thread;

        let progress = Arc::new(Progress::new(10_000));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let progress = Arc::clone(&progress);
                thread::spawn(move || {
                    for _ in 0..25 {
                        progress.add(100);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(progress.uploaded(), 10_000);
        assert_eq!(progress.dots_published(), DOT_STRIDES);
    }
}
