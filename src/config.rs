//! Persistent beacon-master configuration record, backed by tail
//! storage slot 1 and tagged `RTTS` the way the rest of the log tags
//! its pages with a magic + version + size header.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::flash::{Flash, PAGE_SIZE};
use crate::storage::{StorageEngine, StorageError};

pub const CONFIG_MAGIC: u32 = 0x5254_5453; // "RTTS"
pub const CONFIG_VERSION: u8 = 1;
pub const CONFIG_SLOT: u16 = 1;
pub const KEY_LEN: usize = 32;
const RESERVED_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("bad magic 0x{0:08X}, expected 0x5254_5453")]
    BadMagic(u32),

    #[error("unsupported config version {0}")]
    BadVersion(u8),

    #[error("recorded size {0} does not match the on-disk record size")]
    BadSize(u16),
}

/// Beacon-master transmit configuration, persisted across reboots.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BeaconMasterConfig {
    pub beacon_period_ms: u32,
    pub burst_span_ms: u32,
    pub burst_len: u8,
    pub tx_power_dbm: i8,
    pub auth_mode: u8,
    pub key_len: u8,
    pub key: [u8; KEY_LEN],
    pub default_mode: u8,
}

impl BeaconMasterConfig {
    const RECORD_SIZE: u16 = 4 + 1 + 2 + 4 + 4 + 1 + 1 + 1 + 1 + KEY_LEN as u16 + 1 + RESERVED_LEN as u16;

    pub fn defaults() -> Self {
        BeaconMasterConfig {
            beacon_period_ms: 1_000,
            burst_span_ms: 100,
            burst_len: 3,
            tx_power_dbm: 0,
            auth_mode: 0,
            key_len: 0,
            key: [0u8; KEY_LEN],
            default_mode: 0,
        }
    }

    fn to_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0xFFu8; PAGE_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], CONFIG_MAGIC);
        buf[4] = CONFIG_VERSION;
        LittleEndian::write_u16(&mut buf[5..7], Self::RECORD_SIZE);
        LittleEndian::write_u32(&mut buf[7..11], self.beacon_period_ms);
        LittleEndian::write_u32(&mut buf[11..15], self.burst_span_ms);
        buf[15] = self.burst_len;
        buf[16] = self.tx_power_dbm as u8;
        buf[17] = self.auth_mode;
        buf[18] = self.key_len;
        buf[19..19 + KEY_LEN].copy_from_slice(&self.key);
        buf[19 + KEY_LEN] = self.default_mode;
        buf[20 + KEY_LEN..20 + KEY_LEN + RESERVED_LEN].fill(0);
        buf
    }

    fn from_bytes(buf: &[u8; PAGE_SIZE]) -> Result<Self, ConfigError> {
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != CONFIG_MAGIC {
            return Err(ConfigError::BadMagic(magic));
        }
        let version = buf[4];
        if version != CONFIG_VERSION {
            return Err(ConfigError::BadVersion(version));
        }
        let size = LittleEndian::read_u16(&buf[5..7]);
        if size != Self::RECORD_SIZE {
            return Err(ConfigError::BadSize(size));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[19..19 + KEY_LEN]);

        Ok(BeaconMasterConfig {
            beacon_period_ms: LittleEndian::read_u32(&buf[7..11]),
            burst_span_ms: LittleEndian::read_u32(&buf[11..15]),
            burst_len: buf[15],
            tx_power_dbm: buf[16] as i8,
            auth_mode: buf[17],
            key_len: buf[18],
            key,
            default_mode: buf[19 + KEY_LEN],
        })
    }

    /// Loads the config from its tail-storage slot, falling back to
    /// [`Self::defaults`] when the slot is unwritten or fails a header
    /// check (matches `FlashConfig::from_reader`'s tolerant load path).
    pub fn load<F: Flash>(storage: &mut StorageEngine<F>) -> Result<Self, ConfigError> {
        let raw = storage.read_slot(CONFIG_SLOT)?;
        match Self::from_bytes(&raw) {
            Ok(config) => Ok(config),
            Err(ConfigError::BadMagic(_)) => Ok(Self::defaults()),
            Err(other) => Err(other),
        }
    }

    pub fn save<F: Flash>(&self, storage: &mut StorageEngine<F>) -> Result<(), ConfigError> {
        storage.write_slot(CONFIG_SLOT, &self.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::emulated::EmulatedFlash;
    use std::io::Cursor;

    fn storage() -> StorageEngine<EmulatedFlash<Cursor<Vec<u8>>>> {
        let total_pages = 4096 / PAGE_SIZE as u32 + 256;
        let capacity = (total_pages as u64 * PAGE_SIZE as u64).next_power_of_two();
        let flash = EmulatedFlash::new(Cursor::new(vec![0xFFu8; capacity as usize]), capacity).unwrap();
        StorageEngine::new(flash).unwrap()
    }

    #[test]
    fn it_should_fall_back_to_defaults_on_a_blank_slot() {
        let mut storage = storage();
        let config = BeaconMasterConfig::load(&mut storage).unwrap();
        assert_eq!(config, BeaconMasterConfig::defaults());
    }

    #[test]
    fn it_should_round_trip_a_saved_config() {
        let mut storage = storage();
        let mut config = BeaconMasterConfig::defaults();
        config.beacon_period_ms = 2_500;
        config.key_len = 16;
        config.key[0] = 0xAB;
        config.save(&mut storage).unwrap();

        let loaded = BeaconMasterConfig::load(&mut storage).unwrap();
        assert_eq!(loaded.beacon_period_ms, 2_500);
        assert_eq!(loaded.key[0], 0xAB);
    }
}
