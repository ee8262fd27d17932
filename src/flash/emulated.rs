//! Emulated flash backend over a writable partition window.
//!
//! Used when no external NOR chip is detected (§4.1): presents the same
//! [`Flash`] contract over a power-of-two capacity window carved out of a
//! larger partition, with a synthetic JEDEC-shaped id.

use std::io::{Read, Seek, SeekFrom, Write};

use super::{Flash, FlashError, FlashId, PAGE_SIZE, SECTOR_SIZE};

/// Synthetic manufacturer/device bytes for the emulated backend; never
/// collide with a real external NOR id since both bytes are non-absent
/// and chosen outside common JEDEC ranges.
const EMULATED_MANUFACTURER: u8 = 0xAA;
const EMULATED_DEVICE_TYPE: u8 = 0x55;

/// Flash emulated over any `Read + Write + Seek` partition, e.g. a backing
/// file or an in-memory `Cursor<Vec<u8>>` in tests.
pub struct EmulatedFlash<S: Read + Write + Seek> {
    partition: S,
    capacity: u64,
    capacity_log2: u8,
}

impl<S: Read + Write + Seek> EmulatedFlash<S> {
    /// Creates an emulation window of `capacity` bytes (must be a power of
    /// two) at the start of `partition`. `partition` must be at least
    /// `capacity` bytes.
    pub fn new(partition: S, capacity: u64) -> Result<Self, FlashError> {
        if !capacity.is_power_of_two() {
            return Err(FlashError::Io(format!(
                "emulated capacity {} is not a power of two",
                capacity
            )));
        }

        Ok(EmulatedFlash {
            partition,
            capacity,
            capacity_log2: capacity.trailing_zeros() as u8,
        })
    }
}

impl<S: Read + Write + Seek> Flash for EmulatedFlash<S> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.partition
            .seek(SeekFrom::Start(addr as u64))
            .map_err(|e| FlashError::Io(e.to_string()))?;
        self.partition
            .read_exact(buf)
            .map_err(|e| FlashError::Io(e.to_string()))
    }

    fn program_page(&mut self, addr: u32, buf: &[u8]) -> Result<(), FlashError> {
        super::assert_page_aligned_write(addr, buf.len())?;

        self.partition
            .seek(SeekFrom::Start(addr as u64))
            .map_err(|e| FlashError::Io(e.to_string()))?;
        self.partition
            .write_all(buf)
            .map_err(|e| FlashError::Io(e.to_string()))
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        let aligned = (addr as u64 / SECTOR_SIZE as u64) * SECTOR_SIZE as u64;
        self.partition
            .seek(SeekFrom::Start(aligned))
            .map_err(|e| FlashError::Io(e.to_string()))?;
        self.partition
            .write_all(&[0xFFu8; SECTOR_SIZE])
            .map_err(|e| FlashError::Io(e.to_string()))
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        self.partition
            .seek(SeekFrom::Start(0))
            .map_err(|e| FlashError::Io(e.to_string()))?;

        let blank = [0xFFu8; SECTOR_SIZE];
        let sectors = self.capacity / SECTOR_SIZE as u64;
        for _ in 0..sectors {
            self.partition
                .write_all(&blank)
                .map_err(|e| FlashError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn read_id(&mut self) -> Result<FlashId, FlashError> {
        Ok(FlashId {
            manufacturer: EMULATED_MANUFACTURER,
            device_type: EMULATED_DEVICE_TYPE,
            capacity: self.capacity_log2,
        })
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
