//! Error types for the SQRL server-side protocol.

use snafu::Snafu;

/// Errors from parsing, verifying and storing SQRL protocol state.
///
/// The protocol engine folds these into TIF bits; the variants are grouped
/// so that the mapping stays mechanical: malformed input and failed
/// signatures become CLIENT_FAILURE, storage and entropy trouble becomes
/// TRANSIENT_ERROR.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SspError {
    /// The client sent data the codec cannot make sense of: a bad form
    /// body, invalid base64, broken line framing.
    #[snafu(display("malformed client data: {message}"))]
    Malformed {
        /// What failed to parse.
        message: String,
    },

    /// A key field did not decode to a usable Ed25519 public key.
    #[snafu(display("{field} is not a valid Ed25519 public key"))]
    InvalidKey {
        /// The offending field (`idk`, `pidk` or `vuk`).
        field: &'static str,
    },

    /// An Ed25519 signature did not verify against its key.
    #[snafu(display("{field} signature verification failed"))]
    SignatureInvalid {
        /// The signature field that failed (`ids`, `pids` or `urs`).
        field: &'static str,
    },

    /// The client's version list does not include a version we speak.
    #[snafu(display("unsupported protocol versions {versions:?}"))]
    UnsupportedVersion {
        /// The versions the client offered.
        versions: Vec<u32>,
    },

    /// Nut generation failed or timed out waiting on the entropy buffer.
    #[snafu(display("nut generation failed: {message}"))]
    NutGeneration {
        /// Why no nut was produced.
        message: String,
    },

    /// Empty nuts cannot be hoarded.
    #[snafu(display("empty nuts are not allowed"))]
    EmptyNut,

    /// A hoard or identity-store backend failed.
    #[snafu(display("storage failure: {message}"))]
    Storage {
        /// The backend's report.
        message: String,
    },
}

/// Crate-wide result alias.
pub type Result<T, E = SspError> = std::result::Result<T, E>;
