//! External NOR flash backend over the JEDEC command set.
//!
//! The physical SPI bus is an out-of-scope collaborator (§1): this module
//! only ever speaks to it through [`SpiTransport`], a narrow trait any real
//! driver (or a test double) can implement.

use std::time::Duration;

use super::{jedec, timeout, Flash, FlashError, FlashId, PAGE_SIZE};
use crate::util::MonotonicClock;

/// A half-duplex SPI-like transport: write a command (and optional address
/// / payload bytes), then clock out `read_len` response bytes.
pub trait SpiTransport {
    fn transact(&mut self, write: &[u8], read_len: usize) -> Result<Vec<u8>, FlashError>;
}

/// External NOR flash over a [`SpiTransport`], polling WIP with the
/// bounded timeouts specified in §4.1.
pub struct NorFlash<T: SpiTransport, C: MonotonicClock> {
    transport: T,
    clock: C,
    capacity: u64,
}

impl<T: SpiTransport, C: MonotonicClock> NorFlash<T, C> {
    /// Probes the device, returning `Ok(None)` if the JEDEC id reads as
    /// absent so the caller can fall back to emulation.
    pub fn probe(mut transport: T, clock: C) -> Result<Option<Self>, FlashError> {
        let id = read_id(&mut transport)?;

        if id.is_absent() {
            return Ok(None);
        }

        Ok(Some(NorFlash {
            transport,
            clock,
            capacity: id.capacity_bytes(),
        }))
    }

    fn write_enable(&mut self) -> Result<(), FlashError> {
        self.transport.transact(&[jedec::WRITE_ENABLE], 0)?;
        Ok(())
    }

    fn poll_wip(&mut self, bound: Duration) -> Result<(), FlashError> {
        let start = self.clock.now_ms();

        loop {
            let status = self.transport.transact(&[jedec::READ_STATUS], 1)?;
            if status.first().copied().unwrap_or(0) & jedec::STATUS_WIP_BIT == 0 {
                return Ok(());
            }

            if self.clock.now_ms().wrapping_sub(start) as u128 > bound.as_millis() {
                return Err(FlashError::Timeout(bound));
            }
        }
    }

    fn addr_bytes(addr: u32) -> [u8; 3] {
        [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
    }
}

fn read_id<T: SpiTransport>(transport: &mut T) -> Result<FlashId, FlashError> {
    let resp = transport.transact(&[jedec::READ_ID], 3)?;
    Ok(FlashId {
        manufacturer: resp[0],
        device_type: resp[1],
        capacity: resp[2],
    })
}

impl<T: SpiTransport, C: MonotonicClock> Flash for NorFlash<T, C> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let mut cmd = Vec::with_capacity(4);
        cmd.push(jedec::READ);
        cmd.extend_from_slice(&Self::addr_bytes(addr));

        let data = self.transport.transact(&cmd, buf.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn program_page(&mut self, addr: u32, buf: &[u8]) -> Result<(), FlashError> {
        super::assert_page_aligned_write(addr, buf.len())?;

        self.write_enable()?;

        let mut cmd = Vec::with_capacity(4 + PAGE_SIZE);
        cmd.push(jedec::PAGE_PROGRAM);
        cmd.extend_from_slice(&Self::addr_bytes(addr));
        cmd.extend_from_slice(buf);

        self.transport.transact(&cmd, 0)?;
        self.poll_wip(timeout::PAGE_PROGRAM)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        self.write_enable()?;

        let mut cmd = Vec::with_capacity(4);
        cmd.push(jedec::SECTOR_ERASE);
        cmd.extend_from_slice(&Self::addr_bytes(addr));

        self.transport.transact(&cmd, 0)?;
        self.poll_wip(timeout::SECTOR_ERASE)
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        self.write_enable()?;
        self.transport.transact(&[jedec::CHIP_ERASE], 0)?;
        self.poll_wip(timeout::CHIP_ERASE)
    }

    fn read_id(&mut self) -> Result<FlashId, FlashError> {
        read_id(&mut self.transport)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
