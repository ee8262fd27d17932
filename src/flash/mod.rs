//! Flash abstraction (C1): uniform page/sector access over either an
//! external NOR chip or an emulated partition-backed window.

pub mod emulated;
pub mod nor;

use std::time::Duration;
use thiserror::Error;

/// Single programmable unit.
pub const PAGE_SIZE: usize = 256;
/// Smallest erasable unit.
pub const SECTOR_SIZE: usize = 4096;
/// Pages per sector, used by the tail-storage read-modify-erase-rewrite path.
pub const PAGES_PER_SECTOR: usize = SECTOR_SIZE / PAGE_SIZE;

/// JEDEC command opcodes understood by the NOR backend.
pub mod jedec {
    pub const READ_ID: u8 = 0x9F;
    pub const READ: u8 = 0x03;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const READ_STATUS: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;

    /// Status register write-in-progress bit.
    pub const STATUS_WIP_BIT: u8 = 0x01;
}

/// Bounded polling timeouts for flash operations (§4.1).
pub mod timeout {
    use std::time::Duration;

    pub const PAGE_PROGRAM: Duration = Duration::from_millis(10);
    pub const SECTOR_ERASE: Duration = Duration::from_secs(2);
    pub const CHIP_ERASE: Duration = Duration::from_secs(100);
}

/// JEDEC manufacturer/type/capacity identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FlashId {
    pub manufacturer: u8,
    pub device_type: u8,
    pub capacity: u8,
}

impl FlashId {
    /// A JEDEC id is considered absent when either of the first two bytes
    /// reads as `0x00` or `0xFF`.
    pub fn is_absent(&self) -> bool {
        matches!(self.manufacturer, 0x00 | 0xFF) || matches!(self.device_type, 0x00 | 0xFF)
    }

    /// Capacity in bytes, decoded from the JEDEC capacity byte as `1 << c`.
    pub fn capacity_bytes(&self) -> u64 {
        1u64 << self.capacity
    }
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("flash I/O error: {0}")]
    Io(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("write would cross a page boundary")]
    PageBoundary,

    #[error("no flash backend available (neither JEDEC NOR nor an emulation partition)")]
    NoBackend,
}

/// Narrow, synchronous flash interface shared by both backends (§4.1).
///
/// Writes within one page never cross a 256-byte boundary; callers align.
pub trait Flash {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn program_page(&mut self, addr: u32, buf: &[u8]) -> Result<(), FlashError>;
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;
    fn erase_chip(&mut self) -> Result<(), FlashError>;
    fn read_id(&mut self) -> Result<FlashId, FlashError>;
    /// Total addressable capacity in bytes.
    fn capacity(&self) -> u64;

    /// Total number of 256-byte pages in the device.
    fn total_pages(&self) -> u32 {
        (self.capacity() / PAGE_SIZE as u64) as u32
    }
}

/// Checks that `addr..addr+len` does not cross a page boundary, matching
/// the contract every `Flash::program_page` caller must uphold.
pub fn assert_page_aligned_write(addr: u32, len: usize) -> Result<(), FlashError> {
    if len > PAGE_SIZE {
        return Err(FlashError::PageBoundary);
    }

    let page_start = addr as u64 / PAGE_SIZE as u64 * PAGE_SIZE as u64;
    let page_end = page_start + PAGE_SIZE as u64;

    if addr as u64 + len as u64 > page_end {
        return Err(FlashError::PageBoundary);
    }

    Ok(())
}

/// Detects a backend the way the firmware's init sequence does: probe
/// JEDEC first, and on an absent id fall back to the emulated partition
/// window if one is available (§4.1).
pub fn detect<T, C, S>(
    transport: T,
    clock: C,
    partition: Option<S>,
    emulated_capacity: u64,
) -> Result<Box<dyn Flash>, FlashError>
where
    T: nor::SpiTransport + 'static,
    C: crate::util::MonotonicClock + 'static,
    S: std::io::Read + std::io::Write + std::io::Seek + 'static,
{
    if let Some(nor) = nor::NorFlash::probe(transport, clock)? {
        return Ok(Box::new(nor));
    }

    match partition {
        Some(partition) => {
            let emulated = emulated::EmulatedFlash::new(partition, emulated_capacity)?;
            Ok(Box::new(emulated))
        }
        None => Err(FlashError::NoBackend),
    }
}
