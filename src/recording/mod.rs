//! Recording/playback engine (C4): the IDLE/RECORDING/PLAYBACK mode
//! state machine, page flush policy, sync sub-log scheduler, and dual
//! format streaming.

pub mod sink;

use thiserror::Error;

use crate::flash::Flash;
use crate::storage::frame::{
    Frame20, SyncFrame, FOOTER_SIZE, FRAMES_PER_PAGE, PAGE_MAGIC, SYNC_FRAMES_PER_PAGE,
    TEMP_UNAVAILABLE,
};
use crate::storage::{StorageEngine, StorageError, FOOTER_OFFSET};
use sink::Sink;

pub const SYNC_INTERVAL_MS: u32 = 60_000;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("engine is not idle")]
    NotIdle,

    #[error("engine is not recording")]
    NotRecording,

    #[error("sync region is already full; cannot start a new session")]
    SyncRegionFull,
}

/// The three-state run mode (§4.3).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Idle,
    Recording,
    Playback,
}

/// Narrow contract for the IMU collaborator (out of scope; §1).
pub trait FrameSource {
    /// Non-blocking: returns `None` if no new sample is ready.
    fn try_read_frame(&mut self) -> Option<Frame20>;
    /// Flushes the device's FIFO/DMP, called at the start of a session.
    fn reset(&mut self);
}

/// Narrow contract for a die-temperature collaborator.
pub trait TemperatureSource {
    /// Returns [`TEMP_UNAVAILABLE`] when no reading can be taken.
    fn temp_c_x100(&self) -> i16;
}

/// Result of one live-frame probe service call.
#[derive(Debug, Clone, Copy)]
pub struct LiveFrameResult {
    pub frame: Frame20,
    pub timed_out: bool,
}

/// A decoded IMU page, used by the ASCII/binary playback streamers.
#[derive(Debug, Clone)]
pub struct PlaybackPage {
    pub page_index: u32,
    pub valid_frames: u16,
    pub first_frame_id: u32,
    pub page_start_ms: u32,
    pub crc16: u16,
    pub crc_ok: bool,
    pub frames: Vec<Frame20>,
}

/// A decoded sync page, used by the `sdump` streamer.
#[derive(Debug, Clone)]
pub struct PlaybackSyncPage {
    pub page_index: u32,
    pub valid_frames: u16,
    pub first_sync_id: u32,
    pub page_start_ms: u32,
    pub frames: Vec<SyncFrame>,
}

pub struct RecordingEngine<F: Flash> {
    storage: StorageEngine<F>,
    mode: Mode,

    frame_buf: [Frame20; FRAMES_PER_PAGE],
    frame_index: usize,
    frame_counter: u32,
    page_first_id: u32,
    page_start_ms: u32,
    current_page: u32,
    record_start_page: u32,
    record_page_limit: Option<u32>,

    sync_buf: [SyncFrame; SYNC_FRAMES_PER_PAGE],
    sync_index: usize,
    sync_counter: u32,
    sync_page_cursor: u32,
    sync_region_full: bool,
    last_sync_ms: Option<u32>,
    last_accepted_beacon_unix_ms: u64,

    playback_cursor: u32,
    playback_limit: u32,
    playback_warning_count: u32,
}

impl<F: Flash> RecordingEngine<F> {
    /// Boots the engine: runs the IMU and sync boot scans and reconstructs
    /// the append frontier and frame/sync counters (§4.2).
    pub fn boot(mut storage: StorageEngine<F>) -> Result<Self, RecordingError> {
        let imu_scan = storage.boot_scan_imu()?;
        let sync_scan = storage.boot_scan_sync()?;

        Ok(RecordingEngine {
            storage,
            mode: Mode::Idle,
            frame_buf: [Frame20::default(); FRAMES_PER_PAGE],
            frame_index: 0,
            frame_counter: imu_scan.frame_counter,
            page_first_id: imu_scan.frame_counter,
            page_start_ms: 0,
            current_page: imu_scan.pages_found,
            record_start_page: imu_scan.pages_found,
            record_page_limit: None,
            sync_buf: [SyncFrame::default(); SYNC_FRAMES_PER_PAGE],
            sync_index: 0,
            sync_counter: sync_scan.frame_counter,
            sync_page_cursor: sync_scan.pages_found,
            sync_region_full: sync_scan.pages_found >= storage.geometry().sync_pages,
            last_sync_ms: None,
            last_accepted_beacon_unix_ms: 0,
            playback_cursor: 0,
            playback_limit: 0,
            playback_warning_count: 0,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn storage(&mut self) -> &mut StorageEngine<F> {
        &mut self.storage
    }

    /// Records an accepted beacon's master Unix time so the next sync
    /// frame carries it (populated by the receiver policy on accept).
    pub fn note_accepted_beacon(&mut self, master_unix_ms: u64) {
        self.last_accepted_beacon_unix_ms = master_unix_ms;
    }

    pub fn last_accepted_beacon_unix_ms(&self) -> u64 {
        self.last_accepted_beacon_unix_ms
    }

    /// `startNewRecordingSession` (§4.3).
    pub fn start_session(
        &mut self,
        now_ms: u32,
        record_page_limit: Option<u32>,
        frame_source: &mut dyn FrameSource,
    ) -> Result<(), RecordingError> {
        if self.mode != Mode::Idle {
            return Err(RecordingError::NotIdle);
        }
        if self.sync_region_full {
            return Err(RecordingError::SyncRegionFull);
        }

        self.frame_index = 0;
        self.record_start_page = self.current_page;
        self.record_page_limit = record_page_limit;
        self.sync_index = 0;
        self.last_sync_ms = Some(now_ms.wrapping_sub(SYNC_INTERVAL_MS));

        frame_source.reset();
        self.mode = Mode::Recording;
        Ok(())
    }

    /// `log_frame` (§4.3): appends one frame and handles the sync
    /// scheduler and page-flush policy.
    pub fn log_frame(
        &mut self,
        frame: Frame20,
        now_ms: u32,
        temp_source: &dyn TemperatureSource,
    ) -> Result<(), RecordingError> {
        if self.mode != Mode::Recording {
            return Err(RecordingError::NotRecording);
        }

        self.maybe_sample_sync(now_ms, temp_source)?;

        if self.frame_index == 0 {
            if self.current_page >= self.storage.geometry().imu_pages {
                self.stop_session()?;
                return Ok(());
            }
            if let Some(limit) = self.record_page_limit {
                if self.current_page - self.record_start_page >= limit {
                    self.stop_session()?;
                    return Ok(());
                }
            }
            self.page_start_ms = now_ms;
            self.page_first_id = self.frame_counter;
        }

        self.frame_buf[self.frame_index] = frame;
        self.frame_index += 1;
        self.frame_counter += 1;

        if self.frame_index == FRAMES_PER_PAGE {
            self.flush_imu_page_full()?;
        }

        Ok(())
    }

    fn flush_imu_page_full(&mut self) -> Result<(), RecordingError> {
        self.storage.flush_imu_page(
            self.current_page,
            &self.frame_buf,
            self.frame_index,
            self.page_first_id,
            self.page_start_ms,
        )?;
        self.current_page += 1;
        self.frame_index = 0;
        Ok(())
    }

    fn maybe_sample_sync(
        &mut self,
        now_ms: u32,
        temp_source: &dyn TemperatureSource,
    ) -> Result<(), RecordingError> {
        if self.sync_region_full {
            return Ok(());
        }

        let last = match self.last_sync_ms {
            Some(last) => last,
            None => {
                self.last_sync_ms = Some(now_ms);
                return Ok(());
            }
        };

        let elapsed = now_ms.wrapping_sub(last);
        if elapsed < SYNC_INTERVAL_MS {
            return Ok(());
        }

        let intervals = elapsed / SYNC_INTERVAL_MS;
        self.last_sync_ms = Some(last.wrapping_add(intervals * SYNC_INTERVAL_MS));
        self.sample_sync_frame(now_ms, temp_source.temp_c_x100())
    }

    fn sample_sync_frame(&mut self, now_ms: u32, temp: i16) -> Result<(), RecordingError> {
        let mut frame = SyncFrame {
            master_unix_ms: self.last_accepted_beacon_unix_ms,
            local_ms: now_ms,
            temp_c_x100: temp,
            crc16: 0,
        };
        frame.crc16 = frame.compute_crc();

        self.sync_buf[self.sync_index] = frame;
        self.sync_index += 1;
        self.sync_counter += 1;

        if self.sync_index == SYNC_FRAMES_PER_PAGE {
            self.flush_sync_page_full()?;
        }
        Ok(())
    }

    fn flush_sync_page_full(&mut self) -> Result<(), RecordingError> {
        self.flush_sync_page(self.sync_index)?;
        if self.sync_page_cursor >= self.storage.geometry().sync_pages {
            self.sync_region_full = true;
        }
        Ok(())
    }

    fn flush_sync_page(&mut self, valid_frames: usize) -> Result<(), RecordingError> {
        let first_sync_id = self.sync_counter - valid_frames as u32 + 1;
        let abs_page = self.storage.geometry().sync_region_start() + self.sync_page_cursor;
        self.storage
            .flush_sync_page(abs_page, &self.sync_buf, valid_frames, first_sync_id)?;
        self.sync_page_cursor += 1;
        self.sync_index = 0;
        Ok(())
    }

    /// Explicit stop (page-limit/flash-full/stop), flushing any pending
    /// partial IMU and sync pages before returning to IDLE (§4.3).
    pub fn stop_session(&mut self) -> Result<(), RecordingError> {
        if self.frame_index > 0 {
            self.flush_imu_page_full()?;
        }
        if self.sync_index > 0 && !self.sync_region_full {
            self.flush_sync_page_full()?;
        }
        self.mode = Mode::Idle;
        Ok(())
    }

    /// `startPlayback` with an optional page-count limit (§4.3).
    pub fn start_playback(&mut self, limit: Option<u32>) -> Result<(), RecordingError> {
        if self.mode != Mode::Idle {
            return Err(RecordingError::NotIdle);
        }

        let limit = limit.unwrap_or(self.current_page).min(self.current_page);
        self.playback_cursor = 0;
        self.playback_limit = limit;
        self.playback_warning_count = 0;
        self.mode = Mode::Playback;
        Ok(())
    }

    pub fn playback_warning_count(&self) -> u32 {
        self.playback_warning_count
    }

    /// Cooperative playback step: loads and decodes one page. Returns
    /// `None` once the stream is exhausted (and returns the engine to
    /// IDLE).
    pub fn playback_tick(&mut self) -> Result<Option<PlaybackPage>, RecordingError> {
        if self.mode != Mode::Playback {
            return Err(RecordingError::NotIdle);
        }

        if self.playback_cursor >= self.playback_limit {
            self.mode = Mode::Idle;
            return Ok(None);
        }

        let page_index = self.playback_cursor;
        let raw = {
            let mut buf = [0u8; crate::flash::PAGE_SIZE];
            self.storage.flash_mut().read(
                page_index * crate::flash::PAGE_SIZE as u32,
                &mut buf,
            )?;
            buf
        };

        let footer = crate::storage::frame::PageFooter::from_bytes(
            raw[FOOTER_OFFSET..FOOTER_OFFSET + FOOTER_SIZE].try_into().unwrap(),
        );
        let frames_bytes = &raw[0..FOOTER_OFFSET];
        let crc_ok = footer.magic == PAGE_MAGIC
            && footer.valid_frames as usize <= FRAMES_PER_PAGE
            && footer.compute_crc(frames_bytes) == footer.crc16;

        if !crc_ok {
            self.playback_warning_count += 1;
        }

        let count = (footer.valid_frames as usize).min(FRAMES_PER_PAGE);
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            let off = i * crate::storage::frame::FRAME_SIZE;
            let bytes: [u8; crate::storage::frame::FRAME_SIZE] = frames_bytes
                [off..off + crate::storage::frame::FRAME_SIZE]
                .try_into()
                .unwrap();
            frames.push(Frame20::from_bytes(&bytes));
        }

        self.playback_cursor += 1;

        Ok(Some(PlaybackPage {
            page_index,
            valid_frames: footer.valid_frames,
            first_frame_id: footer.first_frame_id,
            page_start_ms: footer.page_start_ms,
            crc16: footer.crc16,
            crc_ok,
            frames,
        }))
    }

    /// Streams every page as ASCII text into `sink` (§6 "ASCII playback
    /// lines"). `crc_ok` in the header is the *actual* comparison result
    /// (the original reporting bug is not reproduced; see DESIGN.md).
    pub fn stream_playback_ascii(&mut self, sink: &mut dyn Sink) -> Result<(), RecordingError> {
        while let Some(page) = self.playback_tick()? {
            sink.writeln(&format!(
                "@PAGE {} {} {} {} 0x{:04X} {}",
                page.page_index,
                page.valid_frames,
                page.first_frame_id,
                page.page_start_ms,
                page.crc16,
                if page.crc_ok { "OK" } else { "BAD" }
            ));

            for (i, frame) in page.frames.iter().enumerate() {
                let id = page.first_frame_id + i as u32;
                sink.writeln(&format!(
                    "{} {} {} {} {} {} {} {} {} {} {}",
                    id,
                    frame.q0,
                    frame.q1,
                    frame.q2,
                    frame.q3,
                    frame.ax,
                    frame.ay,
                    frame.az,
                    frame.mx,
                    frame.my,
                    frame.mz
                ));
            }
        }
        Ok(())
    }

    /// Streams every page in the binary framing (§6 "Binary playback
    /// framing").
    pub fn stream_playback_binary(&mut self, sink: &mut dyn Sink) -> Result<(), RecordingError> {
        while let Some(page) = self.playback_tick()? {
            let footer_bytes = crate::storage::frame::PageFooter {
                magic: PAGE_MAGIC,
                valid_frames: page.valid_frames,
                crc16: page.crc16,
                first_frame_id: page.first_frame_id,
                page_start_ms: page.page_start_ms,
            }
            .to_bytes();

            sink.write(&[0x56, 0xAA, 0x10, 0x00]);
            sink.write(&footer_bytes);

            for frame in &page.frames {
                sink.write(&[0x55, 0xAA, 0x14, 0x00]);
                sink.write(&frame.to_bytes());
            }
        }
        Ok(())
    }

    /// Reads and decodes one sync page for `sdump`.
    pub fn read_sync_page(&mut self, index: u32) -> Result<PlaybackSyncPage, RecordingError> {
        let abs_page = self.storage.geometry().sync_region_start() + index;
        let mut buf = [0u8; crate::flash::PAGE_SIZE];
        self.storage
            .flash_mut()
            .read(abs_page * crate::flash::PAGE_SIZE as u32, &mut buf)?;

        let footer = crate::storage::frame::SyncPageFooter::from_bytes(
            buf[FOOTER_OFFSET..FOOTER_OFFSET + FOOTER_SIZE].try_into().unwrap(),
        );

        let count = (footer.valid_frames as usize).min(SYNC_FRAMES_PER_PAGE);
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            let off = i * crate::storage::frame::SYNC_FRAME_SIZE;
            let bytes: [u8; crate::storage::frame::SYNC_FRAME_SIZE] = buf
                [off..off + crate::storage::frame::SYNC_FRAME_SIZE]
                .try_into()
                .unwrap();
            frames.push(SyncFrame::from_bytes(&bytes));
        }

        Ok(PlaybackSyncPage {
            page_index: index,
            valid_frames: footer.valid_frames,
            first_sync_id: footer.first_sync_id,
            page_start_ms: footer.page_start_ms,
            frames,
        })
    }

    /// Streams every written sync page as ASCII (`sdump`, §6).
    pub fn stream_sync_ascii(&mut self, sink: &mut dyn Sink) -> Result<(), RecordingError> {
        for i in 0..self.sync_page_cursor {
            let page = self.read_sync_page(i)?;
            sink.writeln(&format!(
                "@SYNC_PAGE {} frames={} firstID={} start_ms={}",
                page.page_index, page.valid_frames, page.first_sync_id, page.page_start_ms
            ));

            for (i, frame) in page.frames.iter().enumerate() {
                let id = page.first_sync_id + i as u32;
                sink.writeln(&format!(
                    "  {} unix_ms={} local_ms={} temp_x100={} crc=0x{:04X}",
                    id, frame.master_unix_ms, frame.local_ms, frame.temp_c_x100, frame.crc16
                ));
            }
        }
        Ok(())
    }

    /// Live-frame probe service call (§4.3, §5): one bounded attempt per
    /// call, until `deadline_ms`. Caller supplies the last known
    /// accel/mag sample for the failure-frame fallback.
    pub fn service_live_frame(
        frame_source: &mut dyn FrameSource,
        now_ms: u32,
        deadline_ms: u32,
        last_known: Frame20,
    ) -> Option<LiveFrameResult> {
        if let Some(frame) = frame_source.try_read_frame() {
            return Some(LiveFrameResult {
                frame,
                timed_out: false,
            });
        }

        if now_ms >= deadline_ms {
            let failure = Frame20 {
                q0: 0,
                q1: 0,
                q2: 0,
                q3: 0,
                ax: last_known.ax,
                ay: last_known.ay,
                az: last_known.az,
                mx: last_known.mx,
                my: last_known.my,
                mz: last_known.mz,
            };
            return Some(LiveFrameResult {
                frame: failure,
                timed_out: true,
            });
        }

        None
    }
}

/// A no-sync-available temperature source, returning the "unavailable"
/// sentinel (§3 `SyncFrame`).
pub struct NoTemperature;

impl TemperatureSource for NoTemperature {
    fn temp_c_x100(&self) -> i16 {
        TEMP_UNAVAILABLE
    }
}

/// A frame source with no attached IMU collaborator; always empty.
pub struct NullFrameSource;

impl FrameSource for NullFrameSource {
    fn try_read_frame(&mut self) -> Option<Frame20> {
        None
    }
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::emulated::EmulatedFlash;
    use crate::storage::StorageEngine;
    use std::io::Cursor;

    struct ScriptedFrames(std::collections::VecDeque<Frame20>);

    impl FrameSource for ScriptedFrames {
        fn try_read_frame(&mut self) -> Option<Frame20> {
            self.0.pop_front()
        }
        fn reset(&mut self) {}
    }

    fn sample(seed: i16) -> Frame20 {
        Frame20 {
            q0: 1,
            q1: 2,
            q2: 3,
            q3: 4,
            ax: seed,
            ay: seed,
            az: seed,
            mx: seed,
            my: seed,
            mz: seed,
        }
    }

    fn harness(total_pages: u32) -> RecordingEngine<EmulatedFlash<Cursor<Vec<u8>>>> {
        let needed = total_pages as u64 * crate::flash::PAGE_SIZE as u64;
        let capacity = needed.next_power_of_two();
        let flash = EmulatedFlash::new(Cursor::new(vec![0xFFu8; capacity as usize]), capacity).unwrap();
        let storage = StorageEngine::new(flash).unwrap();
        RecordingEngine::boot(storage).unwrap()
    }

    #[test]
    fn it_should_flush_a_page_after_twelve_frames() {
        let mut engine = harness(4096 / crate::flash::PAGE_SIZE as u32 + 256);
        let mut source = ScriptedFrames(std::collections::VecDeque::new());
        engine.start_session(0, None, &mut source).unwrap();

        for i in 0..12 {
            engine.log_frame(sample(i), 1000 + i as u32, &NoTemperature).unwrap();
        }

        assert_eq!(engine.current_page(), 1);
        assert_eq!(engine.frame_counter(), 12);
    }

    #[test]
    fn stop_session_flushes_a_partial_page() {
        let mut engine = harness(4096 / crate::flash::PAGE_SIZE as u32 + 256);
        let mut source = ScriptedFrames(std::collections::VecDeque::new());
        engine.start_session(0, None, &mut source).unwrap();

        for i in 0..5 {
            engine.log_frame(sample(i), 1000, &NoTemperature).unwrap();
        }
        engine.stop_session().unwrap();

        assert_eq!(engine.current_page(), 1);
        assert_eq!(engine.mode(), Mode::Idle);
    }

    #[test]
    fn playback_streams_ascii_lines_for_a_flushed_page() {
        let mut engine = harness(4096 / crate::flash::PAGE_SIZE as u32 + 256);
        let mut source = ScriptedFrames(std::collections::VecDeque::new());
        engine.start_session(0, None, &mut source).unwrap();
        for i in 0..12 {
            engine.log_frame(sample(i), 1000, &NoTemperature).unwrap();
        }

        engine.start_playback(None).unwrap();
        let mut out = sink::BufferSink::default();
        engine.stream_playback_ascii(&mut out).unwrap();

        let text = out.as_str();
        assert!(text.starts_with("@PAGE 0 12 0 1000 0x"));
        assert!(text.contains(" OK\n"));
        assert_eq!(engine.mode(), Mode::Idle);
    }

    #[test]
    fn live_frame_probe_times_out_to_a_failure_frame() {
        let mut source = ScriptedFrames(std::collections::VecDeque::new());
        let last_known = sample(7);

        assert!(RecordingEngine::<EmulatedFlash<Cursor<Vec<u8>>>>::service_live_frame(
            &mut source, 0, 1000, last_known
        )
        .is_none());

        let result = RecordingEngine::<EmulatedFlash<Cursor<Vec<u8>>>>::service_live_frame(
            &mut source, 1000, 1000, last_known,
        )
        .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.frame.q0, 0);
        assert_eq!(result.frame.ax, last_known.ax);
    }
}
