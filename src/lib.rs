//! Server side of the SQRL (Secure Quick Reliable Login) protocol.
//!
//! SQRL is a challenge-response identity scheme: a client proves possession
//! of a per-site Ed25519 key by signing server-issued nonces ("nuts"). The
//! [`SspEngine`] implements the `cli.sqrl` protocol state machine together
//! with the nut lifecycle around it; [`server`] exposes the four HTTP
//! endpoints as thin axum adapters. The `cli.sqrl` endpoint is the only one
//! SQRL clients require, and it must be reachable over https.
//!
//! The engine works entirely through injected capabilities:
//!
//! - a [`NutSource`] producing one-shot nonces,
//! - a [`Hoard`] keeping the short-lived per-nut chain state,
//! - an [`IdentityStore`] holding durable identity records, and
//! - an [`Authenticator`], the application's callbacks for login, rekey
//!   and removal events.
//!
//! In-memory hoard and identity-store implementations are included for
//! tests and single-process deployments. TLS can be terminated directly,
//! but the expected shape is a reverse proxy in front; host and path for
//! outbound URLs then come from forwarding headers or, more reliably, from
//! [`SspConfig`].

pub mod authenticator;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod hoard;
pub mod identity;
pub mod nut;
pub mod request;
pub mod response;
pub mod server;

pub use authenticator::Authenticator;
pub use config::SspConfig;
pub use engine::{PagError, SspEngine, SQRL_SCHEME};
pub use error::SspError;
pub use hoard::{Hoard, HoardEntry, HoardState, MemoryHoard};
pub use identity::{IdentityStore, MemoryIdentityStore, SqrlIdentity};
pub use nut::{CounterNutSource, Nut, NutSource, PartsNutSource, RandomNutSource};
pub use request::{ClientBody, CliRequest, Command, OptFlags};
pub use response::{CliResponse, Tif};
