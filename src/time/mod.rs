//! Time discipline (C6): an anchored PLL+FLL model that tracks a
//! reference (beacon) clock from a free-running local monotonic
//! counter, with a monotonic "now" latch.

pub const K_PHASE: f64 = 0.15;
pub const K_FREQ: f64 = 0.01;
pub const PHASE_REJECT_WINDOW_MS: f64 = 100.0;
pub const FREQ_DEADBAND_MS: f64 = 5.0;
pub const FREQ_CLAMP_PPM: f64 = 2000.0;
pub const DELTA_T_MIN_MS: u32 = 30_000;
pub const DELTA_T_MAX_MS: u32 = 3_000_000;

/// Diagnostic record returned by every [`TimeDiscipline::on_beacon`] call.
#[derive(Debug, Clone, Copy)]
pub struct BeaconReport {
    pub accepted: bool,
    /// The undisciplined prediction at `rtc_rx`, before this update.
    pub raw_predict_ms: f64,
    pub pre_local_ms: u64,
    pub post_local_ms: u64,
    pub delta_real_ms: f64,
    pub delta_t_ms: u32,
    pub freq_ppm: f64,
    /// `epoch_unix_ms − epoch_rtc_ms`, a diagnostic offset.
    pub offset_b_ms: f64,
    pub initialized: bool,
}

/// Anchored `(epoch_rtc_ms, epoch_unix_ms, freq_ppm, phase_ms)` state and
/// its prediction/update rules (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct TimeDiscipline {
    epoch_rtc_ms: u32,
    epoch_unix_ms: u64,
    freq_ppm: f64,
    phase_ms: f64,
    initialized: bool,
    prev_rtc: Option<u32>,
    last_local_ms: Option<u64>,
}

impl Default for TimeDiscipline {
    fn default() -> Self {
        TimeDiscipline {
            epoch_rtc_ms: 0,
            epoch_unix_ms: 0,
            freq_ppm: 0.0,
            phase_ms: 0.0,
            initialized: false,
            prev_rtc: None,
            last_local_ms: None,
        }
    }
}

impl TimeDiscipline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn freq_ppm(&self) -> f64 {
        self.freq_ppm
    }

    /// The undisciplined mapping from local monotonic time to Unix time
    /// under the current anchor, without touching the monotonic latch.
    pub fn predict(&self, rtc: u32) -> f64 {
        let elapsed = rtc.wrapping_sub(self.epoch_rtc_ms) as f64;
        self.epoch_unix_ms as f64 + elapsed * (1.0 + self.freq_ppm * 1e-6) + self.phase_ms
    }

    fn offset_b_ms(&self) -> f64 {
        self.epoch_unix_ms as f64 - self.epoch_rtc_ms as f64
    }

    /// Feeds one accepted-by-caller beacon sample into the discipline
    /// loop. The receiver policy (§4.6) is responsible for gating which
    /// beacons reach here at all; this only applies the PLL/FLL update
    /// and its own Δt/phase gates.
    pub fn on_beacon(&mut self, beacon_unix_ms: u64, rtc_rx: u32) -> BeaconReport {
        if !self.initialized {
            self.epoch_rtc_ms = rtc_rx;
            self.epoch_unix_ms = beacon_unix_ms;
            self.freq_ppm = 0.0;
            self.phase_ms = 0.0;
            self.prev_rtc = Some(rtc_rx);
            self.last_local_ms = Some(beacon_unix_ms);
            self.initialized = true;

            return BeaconReport {
                accepted: true,
                raw_predict_ms: beacon_unix_ms as f64,
                pre_local_ms: beacon_unix_ms,
                post_local_ms: beacon_unix_ms,
                delta_real_ms: 0.0,
                delta_t_ms: 0,
                freq_ppm: 0.0,
                offset_b_ms: self.offset_b_ms(),
                initialized: true,
            };
        }

        let raw_predict = self.predict(rtc_rx);
        let delta_real = beacon_unix_ms as f64 - raw_predict;
        let delta_t = self.prev_rtc.map(|prev| rtc_rx.wrapping_sub(prev));

        let accept = matches!(delta_t, Some(dt) if (DELTA_T_MIN_MS..=DELTA_T_MAX_MS).contains(&dt))
            && delta_real.abs() <= PHASE_REJECT_WINDOW_MS;

        if !accept {
            return BeaconReport {
                accepted: false,
                raw_predict_ms: raw_predict,
                pre_local_ms: raw_predict.max(0.0) as u64,
                post_local_ms: raw_predict.max(0.0) as u64,
                delta_real_ms: delta_real,
                delta_t_ms: delta_t.unwrap_or(0),
                freq_ppm: self.freq_ppm,
                offset_b_ms: self.offset_b_ms(),
                initialized: true,
            };
        }

        let delta_t_ms = delta_t.unwrap();
        let pre_local_ms = raw_predict;

        self.phase_ms += K_PHASE * delta_real;
        if delta_real.abs() > FREQ_DEADBAND_MS {
            let adj = K_FREQ * (delta_real / delta_t_ms as f64) * 1e6;
            self.freq_ppm = (self.freq_ppm + adj).clamp(-FREQ_CLAMP_PPM, FREQ_CLAMP_PPM);
        }

        let mut post = self.predict(rtc_rx);
        if let Some(last) = self.last_local_ms {
            post = post.max(last as f64);
        }

        self.epoch_rtc_ms = rtc_rx;
        self.epoch_unix_ms = post as u64;
        self.phase_ms = 0.0;
        self.prev_rtc = Some(rtc_rx);
        self.last_local_ms = Some(post as u64);

        BeaconReport {
            accepted: true,
            raw_predict_ms: raw_predict,
            pre_local_ms: pre_local_ms.max(0.0) as u64,
            post_local_ms: post as u64,
            delta_real_ms: delta_real,
            delta_t_ms,
            freq_ppm: self.freq_ppm,
            offset_b_ms: self.offset_b_ms(),
            initialized: true,
        }
    }

    /// Unconditional reanchor, used by reacquire (§4.6). Clears the
    /// monotonic latch to the new anchor.
    pub fn reanchor(&mut self, rtc_rx: u32, beacon_unix_ms: u64, preserve_freq: bool) {
        self.epoch_rtc_ms = rtc_rx;
        self.epoch_unix_ms = beacon_unix_ms;
        self.phase_ms = 0.0;
        if !preserve_freq {
            self.freq_ppm = 0.0;
        }
        self.prev_rtc = Some(rtc_rx);
        self.last_local_ms = Some(beacon_unix_ms);
        self.initialized = true;
    }

    /// `time_now_unix_ms`: predicts, then enforces and updates the
    /// monotonic latch.
    pub fn time_now_unix_ms(&mut self, rtc: u32) -> u64 {
        let mut predicted = self.predict(rtc).max(0.0) as u64;
        if let Some(last) = self.last_local_ms {
            predicted = predicted.max(last);
        }
        self.last_local_ms = Some(predicted);
        predicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_first_beacon_hard_initializes() {
        let mut td = TimeDiscipline::new();
        td.on_beacon(1_700_000_000_000, 10_000);
        assert_eq!(td.time_now_unix_ms(10_000), 1_700_000_000_000);
    }

    #[test]
    fn s4_subsequent_beacon_applies_phase_and_frequency_correction() {
        let mut td = TimeDiscipline::new();
        td.on_beacon(1_700_000_000_000, 10_000);

        let report = td.on_beacon(1_700_000_060_050, 70_000);
        assert!(report.accepted);
        assert!((report.freq_ppm - 8.333).abs() < 0.01);

        let now = td.time_now_unix_ms(70_000);
        assert!(now >= 1_700_000_060_000);
        assert!(now <= 1_700_000_060_100);
    }

    #[test]
    fn rejects_delta_t_outside_the_gate() {
        let mut td = TimeDiscipline::new();
        td.on_beacon(1_700_000_000_000, 0);
        // Only 1 second later: below the 30s Δt floor.
        let report = td.on_beacon(1_700_000_001_000, 1_000);
        assert!(!report.accepted);
    }

    #[test]
    fn rejects_phase_error_outside_window() {
        let mut td = TimeDiscipline::new();
        td.on_beacon(1_700_000_000_000, 0);
        let report = td.on_beacon(1_700_000_060_500, 60_000);
        assert!(!report.accepted);
    }

    #[test]
    fn now_is_monotonic_even_immediately_after_a_rejected_beacon() {
        let mut td = TimeDiscipline::new();
        td.on_beacon(1_700_000_000_000, 0);
        td.on_beacon(1_700_000_060_500, 60_000); // rejected
        let a = td.time_now_unix_ms(61_000);
        let b = td.time_now_unix_ms(61_000);
        assert!(b >= a);
    }

    #[test]
    fn repeated_accepted_beacons_shrink_the_residual_error() {
        let mut td = TimeDiscipline::new();
        let mut rtc = 0u32;
        let mut beacon = 1_700_000_000_000u64;
        td.on_beacon(beacon, rtc);

        let mut last_abs_delta = f64::MAX;
        for _ in 0..5 {
            rtc += 60_000;
            beacon += 60_000 + 20; // a small constant real skew per interval
            let report = td.on_beacon(beacon, rtc);
            assert!(report.accepted);
            assert!(report.delta_real_ms.abs() <= last_abs_delta + 1.0);
            last_abs_delta = report.delta_real_ms.abs();
        }
    }

    #[test]
    fn reanchor_can_preserve_frequency() {
        let mut td = TimeDiscipline::new();
        td.on_beacon(1_700_000_000_000, 0);
        td.on_beacon(1_700_000_060_050, 60_000);
        let freq_before = td.freq_ppm();

        td.reanchor(60_000, 1_700_000_060_050, true);
        assert_eq!(td.freq_ppm(), freq_before);

        td.reanchor(60_000, 1_700_000_060_050, false);
        assert_eq!(td.freq_ppm(), 0.0);
    }
}
