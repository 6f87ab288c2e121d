use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters shared by all sessions.
#[derive(Default)]
pub struct Meter {
    received_frames: AtomicU64,
    inferred_frames: AtomicU64,
    dropped_frames: AtomicU64,
    failed_frames: AtomicU64,
}

/// Counter values between two readings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeterReading {
    pub received: u64,
    pub inferred: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            received_frames: AtomicU64::new(0),
            inferred_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            failed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_received(&self) {
        self.received_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_inferred(&self) {
        self.inferred_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame was replaced by a newer one or arrived before the model was ready.
    pub fn tick_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed(&self) {
        self.failed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset(&self) -> MeterReading {
        MeterReading {
            received: self.received_frames.swap(0, Ordering::Relaxed),
            inferred: self.inferred_frames.swap(0, Ordering::Relaxed),
            dropped: self.dropped_frames.swap(0, Ordering::Relaxed),
            failed: self.failed_frames.swap(0, Ordering::Relaxed),
        }
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let reading = METER.get_reset();
            if reading == MeterReading::default() {
                continue;
            }

            let elapsed = start.elapsed().as_secs_f32();
            log::info!(
                "Frames per second: received {:.2}, inferred {:.2}, dropped {:.2}, failed {:.2}",
                reading.received as f32 / elapsed,
                reading.inferred as f32 / elapsed,
                reading.dropped as f32 / elapsed,
                reading.failed as f32 / elapsed,
            );
        }
    })
}
