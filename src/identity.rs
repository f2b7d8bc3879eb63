//! Durable SQRL identity records and their store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Result;

/// Longest rekey chain `find_identity` will follow before giving up.
const MAX_REKEY_HOPS: usize = 16;

/// A SQRL identity as the server retains it.
///
/// `idk` is the primary key and never changes on a stored record. A rekey
/// does not rewrite the record; it creates a successor and points
/// `rekeyed` at it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqrlIdentity {
    /// Identity key: the client's per-site Ed25519 public key, SQRL base64.
    pub idk: String,
    /// Server unlock key, held opaquely on the client's behalf.
    pub suk: String,
    /// Verify unlock key; authenticates `urs` on enable and remove.
    pub vuk: String,
    /// Prior identity key, when the client enrolled through a rekey.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pidk: Option<String>,
    /// Client-asserted policy: only SQRL may authenticate this account.
    pub sqrlonly: bool,
    /// Client-asserted policy: no out-of-band account recovery.
    pub hardlock: bool,
    /// Set by `disable`, cleared by `enable`. Forbids `ident` success.
    pub disabled: bool,
    /// When superseded by a rekey, the idk of the successor record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rekeyed: Option<String>,
}

/// Durable mapping from identity key to identity record.
///
/// The application owns the real implementation; [`MemoryIdentityStore`]
/// covers tests and single-process demos.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up an identity. A superseded idk resolves to its successor
    /// through the recorded rekey link. `Ok(None)` means unknown, which is
    /// not an error.
    async fn find_identity(&self, idk: &str) -> Result<Option<SqrlIdentity>>;

    async fn save_identity(&self, identity: &SqrlIdentity) -> Result<()>;

    async fn delete_identity(&self, idk: &str) -> Result<()>;
}

/// Identity store backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<String, SqrlIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_identity(&self, idk: &str) -> Result<Option<SqrlIdentity>> {
        let identities = self.identities.read().await;
        let mut current = identities.get(idk);
        for _ in 0..MAX_REKEY_HOPS {
            match current {
                Some(identity) => match &identity.rekeyed {
                    Some(successor) => current = identities.get(successor),
                    None => return Ok(Some(identity.clone())),
                },
                None => return Ok(None),
            }
        }
        warn!(idk, "rekey chain exceeded {MAX_REKEY_HOPS} hops");
        Ok(None)
    }

    async fn save_identity(&self, identity: &SqrlIdentity) -> Result<()> {
        self.identities
            .write()
            .await
            .insert(identity.idk.clone(), identity.clone());
        Ok(())
    }

    async fn delete_identity(&self, idk: &str) -> Result<()> {
        self.identities.write().await.remove(idk);
        Ok(())
    }
}
