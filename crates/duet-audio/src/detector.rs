//! End-of-turn detection.
//!
//! [`SilenceDetector`] is the per-sample decision and holds no timers.
//! [`SilenceWatch`] drives it from a sampling interval and adds the safety
//! deadline; dropping the watch cancels both.

use std::pin::Pin;
use std::time::Duration;

use duet_core::DetectorConfig;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval, sleep};
use tracing::{debug, info, trace};

use crate::capture::{LevelTap, StopReason};

/// Floor of the representable scale for 16-bit audio.
pub const MIN_DB: f32 = -96.0;

/// Loudness of a time-domain buffer in dBFS, from the mean absolute
/// amplitude. Empty or all-zero buffers report [`MIN_DB`].
pub fn amplitude_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return MIN_DB;
    }
    let mean = samples.iter().map(|s| s.abs().min(1.0)).sum::<f32>() / samples.len() as f32;
    if mean.is_nan() || mean <= 0.0 {
        return MIN_DB;
    }
    (20.0 * mean.log10()).clamp(MIN_DB, 0.0)
}

/// Tracks the current silence window and decides when it is long enough.
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold_db: f32,
    silence_duration: Duration,
    window: Option<Instant>,
    triggered: bool,
}

impl SilenceDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            threshold_db: config.silence_db_threshold,
            silence_duration: config.silence_duration(),
            window: None,
            triggered: false,
        }
    }

    pub fn is_silent(&self, db: f32) -> bool {
        db < self.threshold_db
    }

    /// Start of the open silence window, if any.
    pub fn silence_started(&self) -> Option<Instant> {
        self.window
    }

    /// Feed one sample. Returns true exactly once, on the sample that
    /// completes a continuous silence window; every later call returns false
    /// until [`SilenceDetector::reset`].
    pub fn observe(&mut self, now: Instant, db: f32) -> bool {
        if self.triggered {
            return false;
        }

        if !self.is_silent(db) {
            if self.window.take().is_some() {
                trace!(db, "Sound resumed, silence window cleared");
            }
            return false;
        }

        match self.window {
            None => {
                trace!(db, "Silence window opened");
                self.window = Some(now);
                false
            }
            Some(start) if now.saturating_duration_since(start) >= self.silence_duration => {
                self.window = None;
                self.triggered = true;
                true
            }
            Some(_) => false,
        }
    }

    pub fn reset(&mut self) {
        self.window = None;
        self.triggered = false;
    }
}

/// Timers for one recording: a sampling interval feeding the detector and a
/// single safety deadline.
#[derive(Debug)]
pub struct SilenceWatch {
    detector: SilenceDetector,
    level: LevelTap,
    ticker: Interval,
    deadline: Pin<Box<Sleep>>,
    fired: bool,
}

impl SilenceWatch {
    /// Start both timers now.
    pub fn start(config: &DetectorConfig, level: LevelTap) -> Self {
        let period = config.sample_interval().max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            sample_interval_ms = config.sample_interval_ms,
            silence_db_threshold = config.silence_db_threshold,
            silence_duration_ms = config.silence_duration_ms,
            max_duration_ms = config.max_duration_ms,
            "Silence watch started"
        );

        Self {
            detector: SilenceDetector::new(config),
            level,
            ticker,
            deadline: Box::pin(sleep(config.max_duration())),
            fired: false,
        }
    }

    /// Resolves once with the reason the recording should stop, then never
    /// again.
    pub async fn next_stop(&mut self) -> StopReason {
        if self.fired {
            return std::future::pending().await;
        }

        loop {
            tokio::select! {
                biased;

                _ = &mut self.deadline => {
                    self.fired = true;
                    info!("Maximum recording length reached");
                    return StopReason::MaxDuration;
                }
                now = self.ticker.tick() => {
                    let db = amplitude_db(&self.level.snapshot());
                    if self.detector.observe(now, db) {
                        self.fired = true;
                        info!(db, "Silence detected, ending turn");
                        return StopReason::Silence;
                    }
                }
            }
        }
    }
}
