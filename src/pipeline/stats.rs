//! Share accounting, best-difficulty tracking, and the hashrate ring.

use std::sync::Arc;
use std::time::Instant;

use crate::settings::{Settings, StatusHandle};
use crate::tracing::prelude::*;
use crate::types::{suffix_string, HashRate};

/// Accepted/rejected share counters. Guarded by the shared-state mutex.
#[derive(Debug, Default, Clone)]
pub struct ShareCounters {
    pub accepted: u64,
    pub rejected: u64,
    pub last_reject_reason: Option<String>,
}

/// Best share difficulty, session and all-time.
///
/// The all-time value persists through the settings collaborator; work
/// below difficulty 1 is never persisted.
pub struct BestDifficulty {
    session: f64,
    all_time: f64,
}

impl BestDifficulty {
    pub fn load(settings: &dyn Settings) -> Self {
        Self {
            session: 0.0,
            all_time: settings.best_difficulty() as f64,
        }
    }

    pub fn session(&self) -> f64 {
        self.session
    }

    pub fn all_time(&self) -> f64 {
        self.all_time
    }

    /// Fold in a found difficulty; updates the status strings and persists
    /// a new all-time best. Returns true when the share beats the network
    /// difficulty, i.e. a block was found.
    pub fn record(
        &mut self,
        difficulty: f64,
        network_difficulty: f64,
        settings: &Arc<dyn Settings>,
        status: &StatusHandle,
    ) -> bool {
        if difficulty > self.session {
            self.session = difficulty;
            status.write().unwrap().best_session_diff_string =
                suffix_string(difficulty as u64);
        }

        if difficulty <= self.all_time {
            return false;
        }
        self.all_time = difficulty;

        if difficulty >= 1.0 {
            settings.set_best_difficulty(difficulty as u64);
        }
        status.write().unwrap().best_diff_string = suffix_string(difficulty as u64);

        let found_block = difficulty > network_difficulty;
        if found_block {
            status.write().unwrap().found_block = true;
            info!(
                difficulty,
                network_difficulty, "FOUND BLOCK!!!"
            );
        }
        found_block
    }
}

/// Number of nonce samples in the hashrate window.
const HISTORY_LENGTH: usize = 100;

/// Rolling hashrate estimate from reported nonces.
///
/// Each reported nonce represents `difficulty * 2^32` expected hashes at
/// the chain's ticket-mask difficulty. Samples live in a fixed ring; once
/// the ring is full the estimate is smoothed 9:1 against the previous
/// value. Owned exclusively by the receiver task.
pub struct HashrateTracker {
    difficulty: [u64; HISTORY_LENGTH],
    timestamp: [Option<Instant>; HISTORY_LENGTH],
    index: usize,
    filled: usize,
    window_start: Instant,
    current: f64,
}

impl HashrateTracker {
    pub fn new(start: Instant) -> Self {
        Self {
            difficulty: [0; HISTORY_LENGTH],
            timestamp: [None; HISTORY_LENGTH],
            index: 0,
            filled: 0,
            window_start: start,
            current: 0.0,
        }
    }

    /// Record one reported nonce worth `asic_difficulty` and return the
    /// updated estimate.
    pub fn record_nonce(&mut self, asic_difficulty: u32, now: Instant) -> HashRate {
        self.difficulty[self.index] = asic_difficulty as u64;
        self.timestamp[self.index] = Some(now);
        self.index = (self.index + 1) % HISTORY_LENGTH;

        if self.filled < HISTORY_LENGTH {
            self.filled += 1;
        } else if let Some(oldest) = self.timestamp[self.index] {
            // Window slides: it starts at the oldest retained sample.
            self.window_start = oldest;
        }

        let sum: u64 = self.difficulty.iter().take(self.filled).sum();
        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        if elapsed <= 0.0 {
            return HashRate(self.current);
        }

        let rate = (sum as f64) * 4_294_967_296.0 / elapsed;
        self.current = if self.filled < HISTORY_LENGTH {
            rate
        } else {
            (self.current * 9.0 + rate) / 10.0
        };

        HashRate(self.current)
    }

    pub fn current(&self) -> HashRate {
        HashRate(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{new_status, MemSettings};
    use std::time::Duration;

    #[test]
    fn best_difficulty_persists_and_detects_blocks() {
        let settings: Arc<dyn Settings> = Arc::new(MemSettings::new());
        let status = new_status(settings.as_ref());
        let mut best = BestDifficulty::load(settings.as_ref());

        // Ordinary share: session and all-time advance, persisted.
        assert!(!best.record(29_588.0, 1e12, &settings, &status));
        assert_eq!(settings.best_difficulty(), 29_588);
        assert_eq!(best.session(), 29_588.0);

        // Lower share changes nothing.
        assert!(!best.record(100.0, 1e12, &settings, &status));
        assert_eq!(settings.best_difficulty(), 29_588);

        // Beating the network difficulty is a block.
        assert!(best.record(2e12, 1e12, &settings, &status));
        assert!(status.read().unwrap().found_block);
    }

    #[test]
    fn sub_one_difficulty_is_never_persisted() {
        let settings: Arc<dyn Settings> = Arc::new(MemSettings::new());
        let status = new_status(settings.as_ref());
        let mut best = BestDifficulty::load(settings.as_ref());

        best.record(0.5, 1e12, &settings, &status);
        assert_eq!(best.session(), 0.5);
        assert_eq!(settings.best_difficulty(), 0, "store must stay untouched");
    }

    #[test]
    fn session_best_survives_all_time_reload() {
        let settings: Arc<dyn Settings> = Arc::new(MemSettings::new());
        settings.set_best_difficulty(1_000_000);
        let status = new_status(settings.as_ref());
        let mut best = BestDifficulty::load(settings.as_ref());

        best.record(500.0, 1e12, &settings, &status);
        assert_eq!(best.session(), 500.0);
        assert_eq!(best.all_time(), 1_000_000.0);
        assert_eq!(settings.best_difficulty(), 1_000_000);
    }

    #[test]
    fn hashrate_from_steady_nonce_stream() {
        let start = Instant::now();
        let mut tracker = HashrateTracker::new(start);

        // One difficulty-256 nonce per second: 256 * 2^32 H/s expected.
        let mut rate = HashRate(0.0);
        for i in 1..=50u64 {
            rate = tracker.record_nonce(256, start + Duration::from_secs(i));
        }

        let expected = 50.0 * 256.0 * 4_294_967_296.0 / 50.0;
        let ratio = rate.0 / expected;
        assert!((ratio - 1.0).abs() < 0.05, "rate {} vs {}", rate.0, expected);
    }

    #[test]
    fn hashrate_window_slides_when_full() {
        let start = Instant::now();
        let mut tracker = HashrateTracker::new(start);

        for i in 1..=(HISTORY_LENGTH as u64 + 50) {
            tracker.record_nonce(256, start + Duration::from_secs(i));
        }

        // Still roughly one difficulty-256 nonce per second.
        let expected = 256.0 * 4_294_967_296.0;
        let ratio = tracker.current().0 / expected;
        assert!((ratio - 1.0).abs() < 0.1, "rate {}", tracker.current().0);
    }
}
