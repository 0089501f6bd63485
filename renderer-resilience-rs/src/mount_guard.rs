//! # Mount Cycle Detection
//!
//! Some failures never produce an error message: a component that is torn
//! down and recreated over and over is broken structurally, whatever it logs.
//! The guard watches mount timing only and flags two patterns:
//!
//! - a subject mounted `rapid_mount_limit` times in a row, each mount less
//!   than `rapid_interval` after the previous one
//! - more than `global_mount_limit` mounts across all subjects within the
//!   rolling `global_window`; the window restarts once a storm is reported,
//!   so one storm flags one mount
//!
//! Detection is reported to the caller, which forces the breaker to
//! Permanent and requests a fallback.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use crate::config::MountGuardConfig;

/// Per-subject mount bookkeeping, stored alongside the breaker state
#[derive(Debug, Clone, Default, Serialize)]
pub struct MountTrack {
    /// Total mounts observed
    pub attempts: u32,
    #[serde(skip)]
    pub last_mount: Option<Instant>,
    /// Mounts in the current run of rapid mounts
    pub rapid_streak: u32,
    /// Set once a cycle has been detected
    pub cycle_detected: bool,
}

impl MountTrack {
    /// Restarts the rapid streak and forgets a detected cycle
    pub fn clear_cycle(&mut self) {
        self.rapid_streak = 0;
        self.cycle_detected = false;
    }
}

/// A detected mount cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountCycle {
    /// One subject remounted too quickly too many times
    RapidRemount { mounts: u32, interval: Duration },
    /// Too many mounts across the whole process
    GlobalStorm { mounts: usize, window: Duration },
}

impl MountCycle {
    pub fn describe(&self) -> String {
        match self {
            MountCycle::RapidRemount { mounts, interval } => {
                format!("{} mounts each less than {}ms apart", mounts, interval.as_millis())
            }
            MountCycle::GlobalStorm { mounts, window } => {
                format!("{} mounts across all subjects within {}ms", mounts, window.as_millis())
            }
        }
    }
}

/// Detects rapid create/destroy loops
#[derive(Debug)]
pub struct MountCycleGuard {
    config: MountGuardConfig,
    recent: Mutex<VecDeque<Instant>>,
}

impl MountCycleGuard {
    pub fn new(config: MountGuardConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Records a mount and reports a cycle if one is detected
    pub fn observe(&self, subject: &str, track: &mut MountTrack, now: Instant) -> Option<MountCycle> {
        track.attempts += 1;
        track.rapid_streak = match track.last_mount {
            Some(previous) if now.saturating_duration_since(previous) < self.config.rapid_interval() => {
                track.rapid_streak + 1
            }
            _ => 1,
        };
        track.last_mount = Some(now);
        let rapid = track.rapid_streak >= self.config.rapid_mount_limit;

        let global_mounts = {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.push_back(now);
            let window = self.config.global_window();
            while let Some(oldest) = recent.front() {
                if now.saturating_duration_since(*oldest) > window {
                    recent.pop_front();
                } else {
                    break;
                }
            }
            let mounts = recent.len();
            if !rapid && mounts > self.config.global_mount_limit {
                recent.clear();
            }
            mounts
        };

        let cycle = if rapid {
            Some(MountCycle::RapidRemount {
                mounts: track.rapid_streak,
                interval: self.config.rapid_interval(),
            })
        } else if global_mounts > self.config.global_mount_limit {
            Some(MountCycle::GlobalStorm {
                mounts: global_mounts,
                window: self.config.global_window(),
            })
        } else {
            None
        };

        if let Some(cycle) = cycle {
            if !track.cycle_detected {
                warn!(subject = %subject, cycle = %cycle.describe(), "Mount cycle detected");
            }
            track.cycle_detected = true;
        }

        cycle
    }

    /// Mounts across all subjects within the rolling window
    pub fn global_mounts(&self, now: Instant) -> usize {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.config.global_window();
        recent
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= window)
            .count()
    }

    /// Forgets the process-wide mount history
    pub fn reset(&self) {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> MountCycleGuard {
        MountCycleGuard::new(MountGuardConfig::default())
    }

    #[test]
    fn test_three_rapid_mounts_form_cycle() {
        let guard = guard();
        let mut track = MountTrack::default();
        let start = Instant::now();

        assert!(guard.observe("hero", &mut track, start).is_none());
        assert!(guard.observe("hero", &mut track, start + Duration::from_millis(500)).is_none());
        let cycle = guard.observe("hero", &mut track, start + Duration::from_millis(1000));

        assert!(matches!(cycle, Some(MountCycle::RapidRemount { mounts: 3, .. })));
        assert!(track.cycle_detected);
        assert_eq!(track.attempts, 3);
    }

    #[test]
    fn test_slow_mounts_reset_streak() {
        let guard = guard();
        let mut track = MountTrack::default();
        let start = Instant::now();

        for i in 0..6u64 {
            let at = start + Duration::from_millis(2500 * i);
            assert!(guard.observe("hero", &mut track, at).is_none());
        }
        assert_eq!(track.rapid_streak, 1);
        assert!(!track.cycle_detected);
    }

    #[test]
    fn test_global_storm_across_subjects() {
        let guard = guard();
        let start = Instant::now();
        let mut tracks: Vec<MountTrack> = (0..6).map(|_| MountTrack::default()).collect();

        let mut detected = None;
        for (i, track) in tracks.iter_mut().enumerate() {
            let at = start + Duration::from_millis(100 * i as u64);
            detected = guard.observe(&format!("card-{}", i), track, at);
        }

        assert!(matches!(detected, Some(MountCycle::GlobalStorm { mounts: 6, .. })));
        assert!(tracks[5].cycle_detected);
        assert!(!tracks[0].cycle_detected);
    }

    #[test]
    fn test_storm_reported_once() {
        let guard = guard();
        let start = Instant::now();
        for i in 0..6u64 {
            let mut track = MountTrack::default();
            guard.observe("card", &mut track, start + Duration::from_millis(100 * i));
        }
        assert_eq!(guard.global_mounts(start + Duration::from_millis(500)), 0);

        let mut late = MountTrack::default();
        assert!(guard
            .observe("late", &mut late, start + Duration::from_millis(600))
            .is_none());
        assert!(!late.cycle_detected);
    }

    #[test]
    fn test_global_window_rolls() {
        let guard = guard();
        let start = Instant::now();
        for i in 0..5u64 {
            let mut track = MountTrack::default();
            guard.observe("card", &mut track, start + Duration::from_millis(10 * i));
        }
        assert_eq!(guard.global_mounts(start + Duration::from_millis(100)), 5);
        assert_eq!(guard.global_mounts(start + Duration::from_secs(5)), 0);

        guard.reset();
        assert_eq!(guard.global_mounts(start), 0);
    }
}
