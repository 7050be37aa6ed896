// src/alert.rs

use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgcodecs,
    prelude::*,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

/// Monotonic time source, injectable so debounce behavior is testable
/// without real delays.
pub trait Clock {
    fn monotonic(&self) -> Duration;
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Writes a JPEG snapshot of a violating frame to the violations
/// directory, at most once per debounce window. Prevents a sustained
/// violation from flooding storage with near-duplicate frames.
pub struct ViolationRecorder {
    dir: PathBuf,
    debounce: Duration,
    last_alert: Option<Duration>,
    seq: u64,
    clock: Box<dyn Clock>,
}

impl ViolationRecorder {
    pub fn new(dir: impl Into<PathBuf>, debounce_seconds: f64) -> Result<Self> {
        Self::with_clock(dir, debounce_seconds, Box::new(SystemClock::new()))
    }

    pub fn with_clock(
        dir: impl Into<PathBuf>,
        debounce_seconds: f64,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            debounce: Duration::from_secs_f64(debounce_seconds),
            last_alert: None,
            seq: 0,
            clock,
        })
    }

    /// Persists the frame if it shows a violation and the debounce
    /// window since the previous snapshot has elapsed. Returns the
    /// written path, or `None` when suppressed.
    pub fn maybe_snapshot(
        &mut self,
        frame: &Mat,
        missing: &BTreeSet<String>,
    ) -> Result<Option<PathBuf>> {
        if missing.is_empty() {
            return Ok(None);
        }

        let now = self.clock.monotonic();
        if let Some(last) = self.last_alert {
            if now.saturating_sub(last) < self.debounce {
                return Ok(None);
            }
        }

        self.seq += 1;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{}_{}.jpg", stamp, self.seq));

        let ok = imgcodecs::imwrite(&path.to_string_lossy(), frame, &core::Vector::new())?;
        anyhow::ensure!(ok, "imwrite refused {}", path.display());

        self.last_alert = Some(now);
        warn!(
            "[ALERT] Safety violation snapshot saved: {} (missing: {})",
            path.display(),
            missing.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(Some(path))
    }
}
