//! Counter-cipher nut source.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockEncrypt, KeyInit};
use blowfish::Blowfish;

use super::{Nut, NutSource};
use crate::codec::sqrl64_encode;
use crate::error::{Result, SspError};

/// Produces 8-byte nuts by running a monotonic 64-bit counter through a
/// Blowfish block under a server-held key.
///
/// The counter guarantees uniqueness until it wraps; the cipher makes the
/// sequence unguessable. Persist the counter across restarts and hand the
/// last value back in as `counter_init`, or nuts will repeat.
pub struct CounterNutSource {
    counter: AtomicU64,
    cipher: Blowfish,
}

impl CounterNutSource {
    /// `key` is a Blowfish key of 4 to 56 bytes; use 56 random bytes unless
    /// interoperability dictates otherwise.
    pub fn new(counter_init: u64, key: &[u8]) -> Result<Self> {
        let cipher = Blowfish::new_from_slice(key).map_err(|_| SspError::NutGeneration {
            message: format!("invalid blowfish key length {}", key.len()),
        })?;
        Ok(Self {
            counter: AtomicU64::new(counter_init),
            cipher,
        })
    }
}

#[async_trait]
impl NutSource for CounterNutSource {
    async fn next(&self) -> Result<Nut> {
        let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut block = GenericArray::clone_from_slice(&value.to_le_bytes());
        self.cipher.encrypt_block(&mut block);
        Ok(Nut::new(sqrl64_encode(&block)))
    }
}
