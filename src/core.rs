//! Coordinator composite (§9): `LoggerCore` owns the receiver policy,
//! scan scheduler, and recording engine so the beacon-accept cycle is a
//! one-way call instead of the three modules referencing each other.

use crate::beacon::ParsedBeacon;
use crate::flash::Flash;
use crate::receiver::{ReceiverOutcome, ReceiverPolicy, ScanDecision, ScanSchedConfig, ScanScheduler};
use crate::recording::RecordingEngine;

pub struct LoggerCore<F: Flash> {
    pub recording: RecordingEngine<F>,
    pub receiver: ReceiverPolicy,
    pub scheduler: ScanScheduler,
}

impl<F: Flash> LoggerCore<F> {
    pub fn new(recording: RecordingEngine<F>, scan_config: ScanSchedConfig) -> Self {
        LoggerCore {
            recording,
            receiver: ReceiverPolicy::new(),
            scheduler: ScanScheduler::new(scan_config),
        }
    }

    /// The single entry point for a freshly decoded beacon: consults the
    /// receiver policy and, only on accept, drives the scheduler and the
    /// recording engine's sync-frame timestamp. Callers never talk to
    /// `receiver`/`scheduler`/`recording` directly to wire this up.
    pub fn ingest_beacon(&mut self, parsed: &ParsedBeacon, rtc_rx: u32) -> ReceiverOutcome {
        let outcome = self.receiver.on_packet(parsed.master_unix_ms, rtc_rx, true);
        if let ReceiverOutcome::Accepted(_) = &outcome {
            self.scheduler.on_beacon_accepted(parsed.master_unix_ms);
            self.recording.note_accepted_beacon(parsed.master_unix_ms);
        }
        outcome
    }

    pub fn poll_scan(&mut self, unix_now: u64, scan_active: bool) -> ScanDecision {
        self.scheduler.poll(unix_now, scan_active)
    }

    pub fn note_scan_miss(&mut self) -> u32 {
        self.scheduler.note_scan_miss()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::AddrMode;
    use crate::flash::emulated::EmulatedFlash;
    use crate::storage::StorageEngine;
    use std::io::Cursor;

    fn harness(total_pages: u32) -> LoggerCore<EmulatedFlash<Cursor<Vec<u8>>>> {
        let needed = total_pages as u64 * crate::flash::PAGE_SIZE as u64;
        let capacity = needed.next_power_of_two();
        let flash =
            EmulatedFlash::new(Cursor::new(vec![0xFFu8; capacity as usize]), capacity).unwrap();
        let storage = StorageEngine::new(flash).unwrap();
        let recording = RecordingEngine::boot(storage).unwrap();
        let scan_config = ScanSchedConfig {
            period_ms: 60_000,
            scan_duration_ms: 5_000,
            initial_phase_offset_ms: 0,
            prelock_back_to_back: true,
        };
        LoggerCore::new(recording, scan_config)
    }

    fn beacon(master_unix_ms: u64) -> ParsedBeacon {
        ParsedBeacon {
            addr_mode: AddrMode::All,
            addr_list: vec![],
            window_len: 0,
            mode: 0,
            flags: 0,
            master_unix_ms,
            mac_verified: None,
        }
    }

    #[test]
    fn accepted_beacon_reaches_both_the_scheduler_and_the_recording_engine() {
        let mut core = harness(4096 / crate::flash::PAGE_SIZE as u32 + 256);
        assert!(!core.scheduler.is_locked());

        let outcome = core.ingest_beacon(&beacon(1_700_000_000_000), 0);
        assert!(matches!(outcome, ReceiverOutcome::Accepted(_)));
        assert!(core.scheduler.is_locked());
        assert_eq!(core.recording.last_accepted_beacon_unix_ms(), 1_700_000_000_000);

        let outcome = core.ingest_beacon(&beacon(1_700_000_060_000), 60_000);
        assert!(matches!(outcome, ReceiverOutcome::Accepted(_)));
        assert_eq!(core.recording.last_accepted_beacon_unix_ms(), 1_700_000_060_000);
    }

    #[test]
    fn rejected_beacon_never_reaches_the_scheduler_or_the_recording_engine() {
        let mut core = harness(4096 / crate::flash::PAGE_SIZE as u32 + 256);
        core.ingest_beacon(&beacon(1_700_000_000_000), 0);

        let outcome = core.ingest_beacon(&beacon(1_699_999_999_999), 60_000);
        assert!(matches!(outcome, ReceiverOutcome::Rejected(_)));
        assert_eq!(
            core.recording.last_accepted_beacon_unix_ms(),
            1_700_000_000_000
        );
    }
}
