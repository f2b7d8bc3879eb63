//! Legacy parts-based nut source.
//!
//! The earliest published nut construction: pack the requester's IPv4
//! address, a unix timestamp, a counter and 31 bits of noise into a 16-byte
//! block, flag the high bit when the nut was issued for a QR code, and
//! encrypt the block with AES-128 under a server key. Unlike the other
//! sources this one is reversible, so a server can recover the parts from a
//! nut it issued.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{Nut, NutSource};
use crate::codec::{sqrl64_decode, sqrl64_encode};
use crate::error::{Result, SspError};

/// The decrypted contents of a parts nut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NutParts {
    /// Requester IPv4 address, packed little-endian. Zero when unknown.
    pub ip_address: u32,
    /// Unix timestamp at issue, truncated to 32 bits.
    pub time_unix: u32,
    /// Issue counter.
    pub counter: u32,
    /// 31 bits of random noise.
    pub noise: u32,
    /// Set when the nut was issued for a QR code rather than a same-device
    /// link.
    pub qr_source: bool,
}

/// Produces 16-byte nuts from [`NutParts`] blocks, AES-128 encrypted.
pub struct PartsNutSource {
    cipher: Aes128,
    counter: AtomicU32,
    noise_source: fn() -> Result<u32>,
    time_source: fn() -> u32,
}

impl PartsNutSource {
    /// `key` must be exactly 16 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        Self::with_sources(key, crypto_noise, unix_time)
    }

    /// Construct with injected noise and time sources. Deterministic
    /// sources make nut values reproducible in tests.
    pub fn with_sources(
        key: &[u8],
        noise_source: fn() -> Result<u32>,
        time_source: fn() -> u32,
    ) -> Result<Self> {
        let cipher = Aes128::new_from_slice(key).map_err(|_| SspError::NutGeneration {
            message: format!("aes key is {} bytes and must be exactly 16", key.len()),
        })?;
        Ok(Self {
            cipher,
            counter: AtomicU32::new(0),
            noise_source,
            time_source,
        })
    }

    /// Assemble a fresh parts block: current time, next counter value,
    /// fresh noise.
    pub fn next_parts(&self, qr_source: bool) -> Result<NutParts> {
        Ok(NutParts {
            ip_address: 0,
            time_unix: (self.time_source)(),
            counter: self.counter.fetch_add(1, Ordering::Relaxed) + 1,
            noise: (self.noise_source)()?,
            qr_source,
        })
    }

    /// Encrypt a parts block into a nut.
    pub fn nut_from_parts(&self, parts: &NutParts) -> Nut {
        let mut block = [0u8; 16];
        block[0..4].copy_from_slice(&parts.ip_address.to_le_bytes());
        block[4..8].copy_from_slice(&parts.time_unix.to_le_bytes());
        block[8..12].copy_from_slice(&parts.counter.to_le_bytes());
        block[12..16].copy_from_slice(&(parts.noise & 0x7fff_ffff).to_le_bytes());
        if parts.qr_source {
            block[15] |= 0x80;
        }
        let mut block = GenericArray::from(block);
        self.cipher.encrypt_block(&mut block);
        Nut::new(sqrl64_encode(&block))
    }

    /// Decrypt a nut back into its parts.
    pub fn parts_from_nut(&self, nut: &Nut) -> Result<NutParts> {
        let decoded = sqrl64_decode(nut.as_str())?;
        let block: [u8; 16] = decoded.try_into().map_err(|_| SspError::Malformed {
            message: "parts nut must decode to exactly 16 bytes".to_owned(),
        })?;
        let mut block = GenericArray::from(block);
        self.cipher.decrypt_block(&mut block);
        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&block[range]);
            u32::from_le_bytes(bytes)
        };
        Ok(NutParts {
            ip_address: word(0..4),
            time_unix: word(4..8),
            counter: word(8..12),
            noise: word(12..16) & 0x7fff_ffff,
            qr_source: block[15] & 0x80 != 0,
        })
    }
}

#[async_trait]
impl NutSource for PartsNutSource {
    async fn next(&self) -> Result<Nut> {
        let parts = self.next_parts(false)?;
        Ok(self.nut_from_parts(&parts))
    }
}

fn crypto_noise() -> Result<u32> {
    let mut bytes = [0u8; 4];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| SspError::NutGeneration {
        message: format!("entropy read failed: {e}"),
    })?;
    // Clear the MSB so the noise fits next to the source flag.
    Ok(u32::from_le_bytes(bytes) & 0x7fff_ffff)
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
