//! Storage engine (C3): geometry, boot scan, page flush, and the
//! indexed tail-storage slots.

pub mod frame;

use thiserror::Error;

use crate::flash::{Flash, FlashError, PAGE_SIZE, PAGES_PER_SECTOR, SECTOR_SIZE};
use frame::{
    Frame20, PageFooter, SyncFrame, SyncPageFooter, FOOTER_SIZE, FRAMES_PER_PAGE, FRAME_SIZE,
    PAGE_MAGIC, SYNC_FRAMES_PER_PAGE, SYNC_FRAME_SIZE, SYNC_MAGIC,
};

/// Pages reserved at the tail of the chip for indexed slot storage.
pub const TAIL_STORAGE_PAGES: u32 = 256;
/// Offset within a page where the 16-byte footer begins.
pub const FOOTER_OFFSET: usize = PAGE_SIZE - FOOTER_SIZE;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("flash I/O error: {0}")]
    FlashIo(#[from] FlashError),

    #[error("geometry error: total_pages {0} is smaller than the {1}-page tail reservation")]
    Geometry(u32, u32),

    #[error("tail storage index {0} is out of range (must be 1..=255)")]
    InvalidSlot(u16),

    #[error("tail storage index 0 is read-only (virtual device serial slot)")]
    VirtualSlotWrite,
}

/// Flash geometry: the three contiguous regions described in §3.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Geometry {
    pub total_pages: u32,
    pub imu_pages: u32,
    pub sync_pages: u32,
    pub storage_base: u32,
}

impl Geometry {
    pub fn compute(total_pages: u32) -> Result<Self, StorageError> {
        if total_pages < TAIL_STORAGE_PAGES {
            return Err(StorageError::Geometry(total_pages, TAIL_STORAGE_PAGES));
        }

        let record_pages = total_pages - TAIL_STORAGE_PAGES;
        let sync_pages = if record_pages < 2 {
            0
        } else {
            (record_pages / 800).clamp(1, record_pages - 1)
        };
        let imu_pages = record_pages - sync_pages;

        Ok(Geometry {
            total_pages,
            imu_pages,
            sync_pages,
            storage_base: total_pages - TAIL_STORAGE_PAGES,
        })
    }

    pub fn sync_region_start(&self) -> u32 {
        self.imu_pages
    }
}

/// Outcome of a boot-time scan over a footer-tagged page region.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BootScanResult {
    pub pages_found: u32,
    pub valid_pages: u32,
    pub corrupt_pages: u32,
    pub frame_counter: u32,
}

/// Page-structured, CRC-protected, append-only storage engine.
pub struct StorageEngine<F: Flash> {
    flash: F,
    geometry: Geometry,
}

impl<F: Flash> StorageEngine<F> {
    pub fn new(flash: F) -> Result<Self, StorageError> {
        let total_pages = flash.total_pages();
        let geometry = Geometry::compute(total_pages)?;
        Ok(StorageEngine { flash, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    fn read_page(&mut self, page: u32) -> Result<[u8; PAGE_SIZE], StorageError> {
        let mut buf = [0u8; PAGE_SIZE];
        self.flash.read(page * PAGE_SIZE as u32, &mut buf)?;
        Ok(buf)
    }

    /// Boot-time scan over the IMU region (§4.2). Stops at the first page
    /// whose footer magic differs from `PAGE_MAGIC`.
    pub fn boot_scan_imu(&mut self) -> Result<BootScanResult, StorageError> {
        let mut result = BootScanResult::default();
        let mut last_footer: Option<PageFooter> = None;

        for p in 0..self.geometry.imu_pages {
            let page = self.read_page(p)?;
            let footer = PageFooter::from_bytes(
                page[FOOTER_OFFSET..FOOTER_OFFSET + FOOTER_SIZE]
                    .try_into()
                    .unwrap(),
            );

            if footer.magic != PAGE_MAGIC {
                break;
            }

            result.pages_found += 1;

            let frames_bytes = &page[0..FOOTER_OFFSET];
            let crc_ok = footer.valid_frames as usize <= FRAMES_PER_PAGE
                && footer.compute_crc(frames_bytes) == footer.crc16;

            if footer.valid_frames as usize <= FRAMES_PER_PAGE && crc_ok {
                result.valid_pages += 1;
            } else {
                result.corrupt_pages += 1;
            }

            last_footer = Some(footer);
        }

        result.frame_counter = last_footer
            .map(|f| f.first_frame_id + f.valid_frames as u32)
            .unwrap_or(0);

        Ok(result)
    }

    /// Boot-time scan over the sync region, mirroring `boot_scan_imu` to
    /// reconstruct the sync frame counter (not explicitly named by §8's
    /// scenarios, but required to satisfy the dense/strictly-increasing
    /// sync id invariant across reboots).
    pub fn boot_scan_sync(&mut self) -> Result<BootScanResult, StorageError> {
        let mut result = BootScanResult::default();
        let mut last_footer: Option<SyncPageFooter> = None;
        let base = self.geometry.sync_region_start();

        for i in 0..self.geometry.sync_pages {
            let page = self.read_page(base + i)?;
            let footer = SyncPageFooter::from_bytes(
                page[FOOTER_OFFSET..FOOTER_OFFSET + FOOTER_SIZE]
                    .try_into()
                    .unwrap(),
            );

            if footer.magic != SYNC_MAGIC {
                break;
            }

            result.pages_found += 1;

            let frames_bytes = &page[0..FOOTER_OFFSET];
            let crc_ok = footer.valid_frames as usize <= SYNC_FRAMES_PER_PAGE
                && footer.compute_crc(frames_bytes) == footer.crc16;

            if footer.valid_frames as usize <= SYNC_FRAMES_PER_PAGE && crc_ok {
                result.valid_pages += 1;
            } else {
                result.corrupt_pages += 1;
            }

            last_footer = Some(footer);
        }

        result.frame_counter = last_footer
            .map(|f| f.first_sync_id + f.valid_frames as u32 - 1)
            .unwrap_or(0);

        Ok(result)
    }

    /// Lays out an IMU page from `frames[0..valid_frames]`, computes the
    /// footer CRC, and programs it at `page_index` (§4.2 "Page flush").
    pub fn flush_imu_page(
        &mut self,
        page_index: u32,
        frames: &[Frame20],
        valid_frames: usize,
        first_frame_id: u32,
        page_start_ms: u32,
    ) -> Result<(), StorageError> {
        let mut buf = [0xFFu8; PAGE_SIZE];

        for (i, frame) in frames.iter().take(valid_frames).enumerate() {
            let off = i * FRAME_SIZE;
            buf[off..off + FRAME_SIZE].copy_from_slice(&frame.to_bytes());
        }

        let mut footer = PageFooter {
            magic: PAGE_MAGIC,
            valid_frames: valid_frames as u16,
            crc16: 0,
            first_frame_id,
            page_start_ms,
        };
        footer.crc16 = footer.compute_crc(&buf[0..FOOTER_OFFSET]);
        buf[FOOTER_OFFSET..].copy_from_slice(&footer.to_bytes());

        self.flash.program_page(page_index * PAGE_SIZE as u32, &buf)?;
        Ok(())
    }

    /// Lays out and programs a sync page, mirroring `flush_imu_page`.
    pub fn flush_sync_page(
        &mut self,
        page_index: u32,
        frames: &[SyncFrame],
        valid_frames: usize,
        first_sync_id: u32,
    ) -> Result<(), StorageError> {
        let mut buf = [0xFFu8; PAGE_SIZE];

        for (i, frame) in frames.iter().take(valid_frames).enumerate() {
            let off = i * SYNC_FRAME_SIZE;
            buf[off..off + SYNC_FRAME_SIZE].copy_from_slice(&frame.to_bytes());
        }

        let page_start_ms = frames.first().map(|f| f.local_ms).unwrap_or(0);

        let mut footer = SyncPageFooter {
            magic: SYNC_MAGIC,
            valid_frames: valid_frames as u16,
            crc16: 0,
            first_sync_id,
            page_start_ms,
        };
        footer.crc16 = footer.compute_crc(&buf[0..FOOTER_OFFSET]);
        buf[FOOTER_OFFSET..].copy_from_slice(&footer.to_bytes());

        self.flash.program_page(page_index * PAGE_SIZE as u32, &buf)?;
        Ok(())
    }

    /// Reads a 256-byte tail-storage slot. Index 0 is virtual and handled
    /// by the caller (the CLI binary formats the device serial); this
    /// reads the raw page for any other index.
    pub fn read_slot(&mut self, index: u16) -> Result<[u8; PAGE_SIZE], StorageError> {
        if index >= TAIL_STORAGE_PAGES as u16 {
            return Err(StorageError::InvalidSlot(index));
        }
        self.read_page(self.geometry.storage_base + index as u32)
    }

    /// Writes a tail-storage slot via read-modify-erase-rewrite of its
    /// containing 4 KB sector (§4.2).
    pub fn write_slot(&mut self, index: u16, payload: &[u8; PAGE_SIZE]) -> Result<(), StorageError> {
        if index == 0 {
            return Err(StorageError::VirtualSlotWrite);
        }
        if index >= TAIL_STORAGE_PAGES as u16 {
            return Err(StorageError::InvalidSlot(index));
        }

        let sector_local_index = (index as u32 / PAGES_PER_SECTOR as u32) * PAGES_PER_SECTOR as u32;
        let sector_base_page = self.geometry.storage_base + sector_local_index;
        let sector_addr = sector_base_page * PAGE_SIZE as u32;

        let mut scratch = [0u8; SECTOR_SIZE];
        self.flash.read(sector_addr, &mut scratch)?;

        let offset_in_sector = (index as u32 - sector_local_index) as usize * PAGE_SIZE;
        scratch[offset_in_sector..offset_in_sector + PAGE_SIZE].copy_from_slice(payload);

        self.flash.erase_sector(sector_addr)?;

        for page_in_sector in 0..PAGES_PER_SECTOR {
            let off = page_in_sector * PAGE_SIZE;
            self.flash.program_page(
                sector_addr + off as u32,
                &scratch[off..off + PAGE_SIZE],
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::emulated::EmulatedFlash;
    use std::io::Cursor;

    fn engine(total_pages: u32) -> StorageEngine<EmulatedFlash<Cursor<Vec<u8>>>> {
        let needed = total_pages as u64 * PAGE_SIZE as u64;
        let capacity = needed.next_power_of_two();
        let flash = EmulatedFlash::new(Cursor::new(vec![0xFFu8; capacity as usize]), capacity).unwrap();
        StorageEngine::new(flash).unwrap()
    }

    fn sample_frame(seed: i16) -> Frame20 {
        Frame20 {
            q0: 1,
            q1: 2,
            q2: 3,
            q3: 4,
            ax: 10 + seed,
            ay: 20 + seed,
            az: 30 + seed,
            mx: 40 + seed,
            my: 50 + seed,
            mz: 60 + seed,
        }
    }

    #[test]
    fn geometry_matches_spec_formula() {
        // total_pages large enough that record_pages / 800 >= 1.
        let geo = Geometry::compute(256 + 8000).unwrap();
        assert_eq!(geo.imu_pages + geo.sync_pages, 8000);
        assert_eq!(geo.sync_pages, (8000 / 800).clamp(1, 7999));
    }

    #[test]
    fn geometry_rejects_too_small_chips() {
        assert!(Geometry::compute(100).is_err());
    }

    #[test]
    fn geometry_does_not_panic_on_a_one_page_record_region() {
        let geo = Geometry::compute(TAIL_STORAGE_PAGES + 1).unwrap();
        assert_eq!(geo.sync_pages, 0);
        assert_eq!(geo.imu_pages, 1);
    }

    #[test]
    fn geometry_handles_an_exactly_tail_sized_chip() {
        let geo = Geometry::compute(TAIL_STORAGE_PAGES).unwrap();
        assert_eq!(geo.sync_pages, 0);
        assert_eq!(geo.imu_pages, 0);
    }

    #[test]
    fn s1_round_trip_a_single_page() {
        let mut engine = engine(4096 / PAGE_SIZE as u32 + 256);
        let frames: Vec<Frame20> = (0..12).map(sample_frame).collect();
        engine.flush_imu_page(0, &frames, 12, 0, 1000).unwrap();

        let scan = engine.boot_scan_imu().unwrap();
        assert_eq!(scan.pages_found, 1);
        assert_eq!(scan.valid_pages, 1);
        assert_eq!(scan.corrupt_pages, 0);
        assert_eq!(scan.frame_counter, 12);
    }

    #[test]
    fn s2_crc_corruption_is_detected_but_frontier_still_advances() {
        let mut engine = engine(4096 / PAGE_SIZE as u32 + 256);
        let frames: Vec<Frame20> = (0..12).map(sample_frame).collect();
        engine.flush_imu_page(0, &frames, 12, 0, 1000).unwrap();

        // Flip the low bit of byte 0.
        let mut page = engine.read_page(0).unwrap();
        page[0] ^= 0x01;
        engine.flash.program_page(0, &page).unwrap();

        let scan = engine.boot_scan_imu().unwrap();
        assert_eq!(scan.pages_found, 1);
        assert_eq!(scan.valid_pages, 0);
        assert_eq!(scan.corrupt_pages, 1);
        assert_eq!(scan.frame_counter, 12);
    }

    #[test]
    fn boot_scan_stops_at_first_bad_magic() {
        let mut engine = engine(4096 / PAGE_SIZE as u32 + 256);
        let frames: Vec<Frame20> = (0..12).map(sample_frame).collect();
        engine.flush_imu_page(0, &frames, 12, 0, 1000).unwrap();
        // Page 1 left blank (0xFF), so its magic won't match PAGE_MAGIC.
        let scan = engine.boot_scan_imu().unwrap();
        assert_eq!(scan.pages_found, 1);
    }

    #[test]
    fn tail_storage_write_modify_read_is_isolated_per_slot() {
        let mut engine = engine(4096 / PAGE_SIZE as u32 + 256);
        let a = [0xAAu8; PAGE_SIZE];
        let b = [0xBBu8; PAGE_SIZE];

        engine.write_slot(1, &a).unwrap();
        engine.write_slot(2, &b).unwrap();

        assert_eq!(engine.read_slot(1).unwrap(), a);
        assert_eq!(engine.read_slot(2).unwrap(), b);
    }

    #[test]
    fn tail_storage_rejects_virtual_slot_write_and_out_of_range() {
        let mut engine = engine(4096 / PAGE_SIZE as u32 + 256);
        let payload = [0u8; PAGE_SIZE];
        assert!(engine.write_slot(0, &payload).is_err());
        assert!(engine.write_slot(256, &payload).is_err());
        assert!(engine.read_slot(256).is_err());
    }
}
