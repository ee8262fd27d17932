//! AES-128-CMAC (NIST SP 800-38B) over the beacon codec, truncated to
//! `MAC_LEN` bytes.

use aes::Aes128;
use cmac::{Cmac, Mac};

/// Truncated MAC length carried on the wire.
pub const MAC_LEN: usize = 8;
/// Underlying AES-128 key length.
pub const KEY_LEN: usize = 16;

/// Computes the truncated CMAC of `data` under `key`.
pub fn compute(key: &[u8; KEY_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Cmac::<Aes128>::new_from_slice(key).expect("key is exactly 16 bytes");
    mac.update(data);
    let full = mac.finalize().into_bytes();

    let mut truncated = [0u8; MAC_LEN];
    truncated.copy_from_slice(&full[0..MAC_LEN]);
    truncated
}

/// Constant-time comparison of two truncated MACs.
pub fn verify(key: &[u8; KEY_LEN], data: &[u8], tag: &[u8]) -> bool {
    if tag.len() != MAC_LEN {
        return false;
    }
    let expected = compute(key, data);

    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(tag.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_verify_a_mac_it_just_computed() {
        let key = [0x2bu8; KEY_LEN];
        let data = b"some beacon bytes";
        let tag = compute(&key, data);
        assert!(verify(&key, data, &tag));
    }

    #[test]
    fn it_should_reject_a_tampered_payload() {
        let key = [0x2bu8; KEY_LEN];
        let tag = compute(&key, b"some beacon bytes");
        assert!(!verify(&key, b"some beacon Bytes", &tag));
    }

    #[test]
    fn it_should_reject_a_short_tag() {
        let key = [0x2bu8; KEY_LEN];
        assert!(!verify(&key, b"data", &[0u8; 4]));
    }
}
