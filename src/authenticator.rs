//! Application-side hooks the protocol engine calls into.

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::SqrlIdentity;

/// User-management callbacks triggered by SQRL authentication events.
///
/// The engine never learns how identities map onto application accounts;
/// it hands each event to this trait and moves on.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// A SQRL identity authenticated, new users included. Returns the URL
    /// that finishes login in the browser, creating a session there. An
    /// implementation that hits trouble should return the URL of an error
    /// page rather than fail.
    async fn authenticate_identity(&self, identity: &SqrlIdentity) -> String;

    /// The client asked to swap a previous identity for a new one. The
    /// application should move its account linkage from `previous` to
    /// `next` before the store records the rekey.
    async fn swap_identities(&self, previous: &SqrlIdentity, next: &SqrlIdentity) -> Result<()>;

    /// Called before the identity record is deleted on `remove`.
    async fn remove_identity(&self, identity: &SqrlIdentity) -> Result<()>;

    /// Optional ask prompt for a recognized identity, echoed to the client
    /// verbatim in the `ask` field during `query`. Extension point; the
    /// default asks nothing.
    async fn ask_response(&self, _identity: &SqrlIdentity) -> Option<String> {
        None
    }
}
