//! The hoard: short-lived storage binding a nut to its login chain.
//!
//! Every hoard entry carries the whole server-side memory of one chain, so
//! the protocol engine itself stays stateless per request. The in-memory
//! [`MemoryHoard`] suits a single-process deployment; a horizontally scaled
//! deployment substitutes a shared networked store behind the same trait.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryHoard;

use crate::error::Result;
use crate::identity::SqrlIdentity;
use crate::nut::Nut;
use crate::request::CliRequest;

/// Where a login chain stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoardState {
    /// A fresh nut pair, handed to a browser, not yet touched by a client.
    Issued,
    /// A client has completed at least one verified `cli.sqrl` hop.
    Associated,
    /// Authentication succeeded; the entry under the pag nut carries the
    /// identity for the browser poll.
    Authenticated,
}

/// The transient context stored under a nut.
///
/// `original_nut` and `pag_nut` never change along a chain.
/// `last_response` holds the exact bytes of the previous reply; the next
/// request must echo them as its `server` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoardEntry {
    pub state: HoardState,
    /// IP that obtained the original nut.
    pub remote_ip: String,
    pub original_nut: Nut,
    pub pag_nut: Nut,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<CliRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<Vec<u8>>,
    /// Populated on the pag entry once the chain authenticates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<SqrlIdentity>,
}

/// Stores hoard entries under their nut, each with a wall-clock TTL.
///
/// All three operations are linearizable with respect to each other. For
/// any nut, at most one concurrent `get_and_delete` caller receives the
/// entry; everyone else sees `None`. Expired entries behave as missing
/// everywhere.
#[async_trait]
pub trait Hoard: Send + Sync {
    async fn get(&self, nut: &Nut) -> Result<Option<HoardEntry>>;

    /// Fetch and atomically remove in one step. An expired-but-present
    /// entry is removed and reported missing.
    async fn get_and_delete(&self, nut: &Nut) -> Result<Option<HoardEntry>>;

    /// Idempotent write. Rejects an empty nut.
    async fn save(&self, nut: &Nut, entry: HoardEntry, ttl: Duration) -> Result<()>;
}
