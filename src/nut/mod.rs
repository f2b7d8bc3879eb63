//! Nuts: the one-shot nonces the server issues.
//!
//! A nut is an opaque, unguessable string, the SQRL base64 of 8 to 20
//! bytes. Every login session gets a pair of them: the original nut that
//! threads through the `cli.sqrl` chain and the pag nut the browser polls.
//!
//! Three sources are provided. [`RandomNutSource`] reads a buffered
//! cryptographic RNG and is the usual choice. [`CounterNutSource`] encrypts
//! a monotonic counter with Blowfish, which keeps nuts unique until the
//! counter wraps. [`PartsNutSource`] is the legacy construction that packs
//! request metadata into an AES block and can decode a nut back into its
//! parts.

mod counter;
mod parts;
mod random;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use counter::CounterNutSource;
pub use parts::{NutParts, PartsNutSource};
pub use random::RandomNutSource;

use crate::error::Result;

/// An opaque one-shot nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nut(String);

impl Nut {
    /// Wrap a nut received on the wire.
    pub fn new(value: impl Into<String>) -> Self {
        Nut(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Nut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Nut {
    fn from(value: String) -> Self {
        Nut(value)
    }
}

impl From<&str> for Nut {
    fn from(value: &str) -> Self {
        Nut(value.to_owned())
    }
}

/// Produces nuts.
///
/// Implementations must never hand out a duplicate under normal operation
/// and must be safe to call from concurrent requests. `next` may fail, for
/// example when an entropy buffer runs dry; the engine reports that to the
/// client as a transient error.
#[async_trait]
pub trait NutSource: Send + Sync {
    async fn next(&self) -> Result<Nut>;
}
