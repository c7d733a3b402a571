//! Per-direction pump statistics.
//!
//! Counters and per-stage timings accumulate in atomics and are reported
//! (then reset) every five seconds. The series are monotonic and
//! non-negative between resets; exact values are not part of any contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::types::Shutdown;

/// Reporting interval.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Counters for one tunnel direction.
#[derive(Debug, Default)]
pub struct DirectionStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    flushes: AtomicU64,

    // Per-stage time, microseconds.
    tun_us: AtomicU64,
    crypto_us: AtomicU64,
    lock_us: AtomicU64,
    net_us: AtomicU64,
    flush_us: AtomicU64,
}

impl DirectionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_packet(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_flush_count(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tun(&self, elapsed: Duration) {
        self.tun_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_crypto(&self, elapsed: Duration) {
        self.crypto_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_lock_wait(&self, elapsed: Duration) {
        self.lock_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_net_read(&self, elapsed: Duration) {
        self.net_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_net_write(&self, elapsed: Duration) {
        self.net_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_flush(&self, elapsed: Duration) {
        self.flush_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Take-and-reset a snapshot of the accumulated window.
    pub fn drain(&self) -> StatsWindow {
        StatsWindow {
            packets: self.packets.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            flushes: self.flushes.swap(0, Ordering::Relaxed),
            tun_us: self.tun_us.swap(0, Ordering::Relaxed),
            crypto_us: self.crypto_us.swap(0, Ordering::Relaxed),
            lock_us: self.lock_us.swap(0, Ordering::Relaxed),
            net_us: self.net_us.swap(0, Ordering::Relaxed),
            flush_us: self.flush_us.swap(0, Ordering::Relaxed),
        }
    }
}

/// One reporting window, drained from [`DirectionStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsWindow {
    pub packets: u64,
    pub bytes: u64,
    pub flushes: u64,
    pub tun_us: u64,
    pub crypto_us: u64,
    pub lock_us: u64,
    pub net_us: u64,
    pub flush_us: u64,
}

impl StatsWindow {
    fn avg(&self, total_us: u64) -> f64 {
        if self.packets == 0 {
            0.0
        } else {
            total_us as f64 / self.packets as f64
        }
    }
}

/// Spawn the five-second reporter for one direction.
pub fn spawn_reporter(
    label: &'static str,
    stats: Arc<DirectionStats>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        // The first tick fires immediately; skip it so windows are full-length.
        interval.tick().await;
        let mut last_report = Instant::now();

        while shutdown.is_active() {
            tokio::select! {
                () = shutdown.triggered() => break,
                _ = interval.tick() => {}
            }

            let window = stats.drain();
            let elapsed = last_report.elapsed().as_secs_f64();
            last_report = Instant::now();
            if window.packets == 0 {
                continue;
            }

            let pps = window.packets as f64 / elapsed;
            let mbps = (window.bytes as f64 * 8.0) / (elapsed * 1_000_000.0);
            let pkt_per_flush = if window.flushes == 0 {
                0.0
            } else {
                window.packets as f64 / window.flushes as f64
            };

            tracing::info!(
                "[{label}] {pps:.0} pkt/s, {mbps:.2} Mbps, {pkt_per_flush:.1} pkt/flush"
            );
            tracing::info!(
                "[{label}] tun:{:.0}us crypto:{:.0}us lock:{:.0}us net:{:.0}us flush:{:.0}us",
                window.avg(window.tun_us),
                window.avg(window.crypto_us),
                window.avg(window.lock_us),
                window.avg(window.net_us),
                window.avg(window.flush_us),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_drain() {
        let stats = DirectionStats::new();
        stats.add_packet(1400);
        stats.add_packet(60);
        stats.add_flush_count();
        stats.add_tun(Duration::from_micros(12));
        stats.add_crypto(Duration::from_micros(3));

        let window = stats.drain();
        assert_eq!(window.packets, 2);
        assert_eq!(window.bytes, 1460);
        assert_eq!(window.flushes, 1);
        assert_eq!(window.tun_us, 12);
        assert_eq!(window.crypto_us, 3);

        // Drained: the next window starts from zero.
        let window = stats.drain();
        assert_eq!(window.packets, 0);
        assert_eq!(window.bytes, 0);
    }

    #[test]
    fn averages_handle_empty_windows() {
        let window = StatsWindow::default();
        assert_eq!(window.avg(1000), 0.0);
    }
}
