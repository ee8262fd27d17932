//! Receiver policy and scan scheduler (C7): the per-packet accept/reject
//! gate ahead of time discipline, and the phase-locked BLE scan window
//! scheduler.

use thiserror::Error;

use crate::time::{BeaconReport, TimeDiscipline};

/// Number of accepted beacons required to reach `LOCKED`.
pub const LOCK_BEACON_COUNT: u32 = 3;
/// Coarse sanity gate ahead of the finer-grained time discipline gates.
pub const ESTIMATE_ERROR_THRESHOLD_MS: f64 = 10_000.0;
/// Consecutive scan misses before a caller should force a reacquire
/// (from the original scan scheduler's missed-sync counter).
pub const SCAN_MISSED_SYNC_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AcceptState {
    Invalid,
    Locking,
    Locked,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ReceiverReject {
    #[error("beacon time is behind the last accepted beacon")]
    TimeBackwards,
    #[error("beacon disagrees with the current time estimate by more than the coarse gate")]
    EstimateError,
}

#[derive(Debug)]
pub enum ReceiverOutcome {
    Rejected(ReceiverReject),
    Accepted(BeaconReport),
}

/// Per-packet acceptance policy and the three/four-state lock machine it
/// drives, wrapping one [`TimeDiscipline`] (§4.6).
pub struct ReceiverPolicy {
    time: TimeDiscipline,
    accepted_count: u32,
    last_accepted_master_unix_ms: Option<u64>,
    reacquire_armed: bool,
}

impl Default for ReceiverPolicy {
    fn default() -> Self {
        ReceiverPolicy {
            time: TimeDiscipline::new(),
            accepted_count: 0,
            last_accepted_master_unix_ms: None,
            reacquire_armed: false,
        }
    }
}

impl ReceiverPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AcceptState {
        match self.accepted_count {
            0 => AcceptState::Invalid,
            n if n < LOCK_BEACON_COUNT => AcceptState::Locking,
            _ => AcceptState::Locked,
        }
    }

    pub fn time(&self) -> &TimeDiscipline {
        &self.time
    }

    /// Arms an unconditional accept-and-reanchor on the next packet,
    /// used by external "reacquire after prolonged silence" policy.
    pub fn arm_reacquire(&mut self) {
        self.reacquire_armed = true;
    }

    pub fn is_reacquire_armed(&self) -> bool {
        self.reacquire_armed
    }

    /// Applies the per-packet policy to one accepted-by-the-codec beacon
    /// (§4.6). `preserve_freq_on_reacquire` only matters while a
    /// reacquire is armed.
    pub fn on_packet(
        &mut self,
        master_unix_ms: u64,
        rtc_rx: u32,
        preserve_freq_on_reacquire: bool,
    ) -> ReceiverOutcome {
        if self.reacquire_armed {
            self.time
                .reanchor(rtc_rx, master_unix_ms, preserve_freq_on_reacquire);
            self.last_accepted_master_unix_ms = Some(master_unix_ms);
            self.accepted_count = 1;
            self.reacquire_armed = false;

            return ReceiverOutcome::Accepted(BeaconReport {
                accepted: true,
                raw_predict_ms: master_unix_ms as f64,
                pre_local_ms: master_unix_ms,
                post_local_ms: master_unix_ms,
                delta_real_ms: 0.0,
                delta_t_ms: 0,
                freq_ppm: self.time.freq_ppm(),
                offset_b_ms: 0.0,
                initialized: true,
            });
        }

        if let Some(last) = self.last_accepted_master_unix_ms {
            if master_unix_ms < last {
                return ReceiverOutcome::Rejected(ReceiverReject::TimeBackwards);
            }
        }

        if self.time.is_initialized() {
            let predicted = self.time.predict(rtc_rx);
            if (master_unix_ms as f64 - predicted).abs() > ESTIMATE_ERROR_THRESHOLD_MS {
                return ReceiverOutcome::Rejected(ReceiverReject::EstimateError);
            }
        }

        self.last_accepted_master_unix_ms = Some(master_unix_ms);
        self.accepted_count += 1;
        let report = self.time.on_beacon(master_unix_ms, rtc_rx);
        ReceiverOutcome::Accepted(report)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanSchedConfig {
    pub period_ms: u32,
    pub scan_duration_ms: u32,
    pub initial_phase_offset_ms: u32,
    pub prelock_back_to_back: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanDecision {
    None,
    Start(u32),
}

/// Phase-locked BLE scan window scheduler (§4.6).
pub struct ScanScheduler {
    config: ScanSchedConfig,
    locked: bool,
    next_scan_unix: u64,
    consecutive_misses: u32,
}

impl ScanScheduler {
    pub fn new(config: ScanSchedConfig) -> Self {
        ScanScheduler {
            config,
            locked: false,
            next_scan_unix: 0,
            consecutive_misses: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// `poll`: given the current state, returns `None` or `Start(duration)`.
    pub fn poll(&mut self, unix_now: u64, scan_active: bool) -> ScanDecision {
        if scan_active {
            return ScanDecision::None;
        }

        if !self.locked {
            return if self.config.prelock_back_to_back {
                ScanDecision::Start(self.config.scan_duration_ms)
            } else {
                ScanDecision::None
            };
        }

        if unix_now >= self.next_scan_unix {
            self.next_scan_unix += self.config.period_ms as u64;
            ScanDecision::Start(self.config.scan_duration_ms)
        } else {
            ScanDecision::None
        }
    }

    /// Called on every accepted beacon. The *first* one that locks
    /// derives the phase-locked boundary; later beacons only reset the
    /// miss counter.
    pub fn on_beacon_accepted(&mut self, beacon_unix_ms: u64) {
        if !self.locked {
            let period = self.config.period_ms as u64;
            let next_boundary = (beacon_unix_ms / period + 1) * period;
            self.next_scan_unix = next_boundary + self.config.initial_phase_offset_ms as u64;
            self.locked = true;
        }
        self.consecutive_misses = 0;
    }

    /// Resets lock state while preserving configuration, used by an
    /// external reacquire policy after prolonged silence.
    pub fn force_prelock(&mut self) {
        self.locked = false;
    }

    pub fn note_scan_miss(&mut self) -> u32 {
        self.consecutive_misses += 1;
        self.consecutive_misses
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn should_force_reacquire(&self) -> bool {
        self.consecutive_misses >= SCAN_MISSED_SYNC_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s5_rejects_a_beacon_earlier_than_the_last_accepted() {
        let mut policy = ReceiverPolicy::new();
        let t0 = 1_700_000_000_000u64;
        assert!(matches!(
            policy.on_packet(t0, 0, false),
            ReceiverOutcome::Accepted(_)
        ));

        let before = policy.time().predict(0);
        let outcome = policy.on_packet(t0 - 1, 60_000, false);
        assert!(matches!(
            outcome,
            ReceiverOutcome::Rejected(ReceiverReject::TimeBackwards)
        ));
        assert_eq!(policy.time().predict(0), before);
    }

    #[test]
    fn accepted_count_drives_the_lock_state() {
        let mut policy = ReceiverPolicy::new();
        assert_eq!(policy.state(), AcceptState::Invalid);

        policy.on_packet(1_700_000_000_000, 0, false);
        assert_eq!(policy.state(), AcceptState::Locking);

        policy.on_packet(1_700_000_060_000, 60_000, false);
        policy.on_packet(1_700_000_120_000, 120_000, false);
        assert_eq!(policy.state(), AcceptState::Locked);
    }

    #[test]
    fn reacquire_bypasses_the_normal_gates_and_relocks_to_one() {
        let mut policy = ReceiverPolicy::new();
        policy.on_packet(1_700_000_000_000, 0, false);
        policy.on_packet(1_700_000_060_000, 60_000, false);
        policy.on_packet(1_700_000_120_000, 120_000, false);
        assert_eq!(policy.state(), AcceptState::Locked);

        policy.arm_reacquire();
        // An "earlier" beacon would normally be rejected, but reacquire
        // bypasses the backwards-time gate entirely.
        let outcome = policy.on_packet(1_600_000_000_000, 500_000, true);
        assert!(matches!(outcome, ReceiverOutcome::Accepted(_)));
        assert_eq!(policy.state(), AcceptState::Locking);
        assert!(!policy.is_reacquire_armed());
    }

    #[test]
    fn scan_scheduler_stays_prelock_until_a_beacon_locks_it() {
        let config = ScanSchedConfig {
            period_ms: 60_000,
            scan_duration_ms: 5_000,
            initial_phase_offset_ms: 500,
            prelock_back_to_back: true,
        };
        let mut sched = ScanScheduler::new(config);
        assert_eq!(sched.poll(0, false), ScanDecision::Start(5_000));

        sched.on_beacon_accepted(1_700_000_000_000);
        assert!(sched.is_locked());

        let expected_next = (1_700_000_000_000u64 / 60_000 + 1) * 60_000 + 500;
        assert_eq!(sched.poll(expected_next - 1, false), ScanDecision::None);
        assert_eq!(
            sched.poll(expected_next, false),
            ScanDecision::Start(5_000)
        );
    }

    #[test]
    fn force_prelock_resets_lock_but_keeps_config() {
        let config = ScanSchedConfig {
            period_ms: 1_000,
            scan_duration_ms: 100,
            initial_phase_offset_ms: 0,
            prelock_back_to_back: false,
        };
        let mut sched = ScanScheduler::new(config);
        sched.on_beacon_accepted(10_000);
        assert!(sched.is_locked());

        sched.force_prelock();
        assert!(!sched.is_locked());
        assert_eq!(sched.poll(0, false), ScanDecision::None);
    }

    #[test]
    fn consecutive_misses_reach_the_forced_reacquire_threshold() {
        let config = ScanSchedConfig {
            period_ms: 1_000,
            scan_duration_ms: 100,
            initial_phase_offset_ms: 0,
            prelock_back_to_back: false,
        };
        let mut sched = ScanScheduler::new(config);
        for _ in 0..SCAN_MISSED_SYNC_THRESHOLD {
            sched.note_scan_miss();
        }
        assert!(sched.should_force_reacquire());
    }
}
