//! The `cli.sqrl` protocol engine.
//!
//! The engine is stateless per request: the whole memory of a login chain
//! travels in the hoard entry consumed at the start of each hop and written
//! back at the end. It owns its collaborators (nut source, hoard, identity
//! store, authenticator); none of them point back at it. Scale-out only
//! needs a shared hoard.

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tracing::{debug, info, warn};

use crate::authenticator::Authenticator;
use crate::config::SspConfig;
use crate::error::SspError;
use crate::hoard::{Hoard, HoardEntry, HoardState};
use crate::identity::{IdentityStore, SqrlIdentity};
use crate::nut::{Nut, NutSource};
use crate::request::{CliRequest, Command};
use crate::response::{CliResponse, Tif};

/// URL scheme presented to SQRL clients.
pub const SQRL_SCHEME: &str = "sqrl";

/// Failures surfaced by the pag poll, mapped to HTTP statuses by the
/// adapter layer.
#[derive(Debug, Snafu)]
pub enum PagError {
    /// The pag nut is unknown or expired.
    #[snafu(display("unknown pag nut"))]
    UnknownNut,

    /// The pag nut exists but belongs to a different original nut.
    #[snafu(display("original nut does not match the pag entry"))]
    WrongOriginalNut,

    /// The entry carries no identity, which means it was never
    /// authenticated. A server-side logic error.
    #[snafu(display("no identity attached to the pag entry"))]
    MissingIdentity,

    /// The hoard failed.
    #[snafu(display("hoard lookup failed: {source}"))]
    Lookup {
        /// The underlying storage error.
        source: SspError,
    },
}

/// Dispatch aborted; the TIF bits already say why.
struct Halted;

/// The SQRL server-side protocol engine.
pub struct SspEngine {
    nut_source: Arc<dyn NutSource>,
    hoard: Arc<dyn Hoard>,
    identities: Arc<dyn IdentityStore>,
    authenticator: Arc<dyn Authenticator>,
    config: SspConfig,
}

impl SspEngine {
    pub fn new(
        nut_source: Arc<dyn NutSource>,
        hoard: Arc<dyn Hoard>,
        identities: Arc<dyn IdentityStore>,
        authenticator: Arc<dyn Authenticator>,
        config: SspConfig,
    ) -> Self {
        Self {
            nut_source,
            hoard,
            identities,
            authenticator,
            config,
        }
    }

    pub fn config(&self) -> &SspConfig {
        &self.config
    }

    fn nut_expiration(&self) -> Duration {
        self.config.nut_expiration()
    }

    /// Path the client POSTs its next hop to.
    fn qry(&self, nut: &Nut) -> String {
        format!("{}/cli.sqrl?nut={nut}", self.config.root_path)
    }

    /// The `sqrl://` URL a client scans or follows for `nut`.
    pub fn sqrl_url(&self, host: &str, nut: &Nut) -> String {
        format!("{SQRL_SCHEME}://{host}{}/cli.sqrl?nut={nut}", self.config.root_path)
    }

    /// Start a login session: generate an original/pag nut pair and hoard
    /// it under the original nut.
    pub async fn new_session(&self, remote_ip: &str) -> Result<HoardEntry, SspError> {
        let original_nut = self.nut_source.next().await?;
        let pag_nut = self.nut_source.next().await?;
        let entry = HoardEntry {
            state: HoardState::Issued,
            remote_ip: remote_ip.to_owned(),
            original_nut: original_nut.clone(),
            pag_nut,
            last_request: None,
            last_response: None,
            identity: None,
        };
        self.hoard
            .save(&original_nut, entry.clone(), self.nut_expiration())
            .await?;
        debug!(nut = %original_nut, remote_ip, "hoarded fresh nut pair");
        Ok(entry)
    }

    /// Resolve a browser pag poll into the success URL. One shot: the pag
    /// entry is consumed whether or not the checks pass.
    pub async fn resolve_pag(&self, original_nut: &Nut, pag_nut: &Nut) -> Result<String, PagError> {
        let entry = self
            .hoard
            .get_and_delete(pag_nut)
            .await
            .map_err(|source| PagError::Lookup { source })?
            .ok_or(PagError::UnknownNut)?;
        if &entry.original_nut != original_nut {
            return Err(PagError::WrongOriginalNut);
        }
        let identity = entry.identity.as_ref().ok_or(PagError::MissingIdentity)?;
        Ok(self.authenticator.authenticate_identity(identity).await)
    }

    /// Run one `cli.sqrl` hop. Always returns a well-formed encoded
    /// response; protocol failures speak through the TIF bits alone.
    pub async fn cli(&self, nut: Option<Nut>, body: &[u8], remote_ip: &str) -> Vec<u8> {
        let Some(nut) = nut.filter(|nut| !nut.is_empty()) else {
            let mut response = CliResponse::new(Nut::from(""), "");
            response.tif.set(Tif::CLIENT_FAILURE);
            return response.encode();
        };

        let mut response = CliResponse::new(nut.clone(), self.qry(&nut));

        let request = match CliRequest::from_form_body(body) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "rejecting unparseable or unsigned request");
                response.tif.set(Tif::CLIENT_FAILURE);
                return response.encode();
            }
        };
        // Signatures check out from here on.

        let prior = match self.hoard.get_and_delete(&nut).await {
            Ok(Some(prior)) => prior,
            Ok(None) => {
                debug!(%nut, "nut not found");
                response.tif.set(Tif::CLIENT_FAILURE);
                response.tif.set(Tif::COMMAND_FAILED);
                return response.encode();
            }
            Err(error) => {
                warn!(%error, "hoard lookup failed");
                response.tif.set(Tif::TRANSIENT_ERROR);
                response.tif.set(Tif::COMMAND_FAILED);
                return response.encode();
            }
        };

        // The incoming nut is consumed. Every outcome below writes the
        // chain entry back under whatever nut the response ends up
        // carrying, so the client can continue or retry against it.
        let _ = self.run_hop(&request, &prior, remote_ip, &mut response).await;
        self.seal(request, response, prior).await
    }

    async fn run_hop(
        &self,
        request: &CliRequest,
        prior: &HoardEntry,
        remote_ip: &str,
        response: &mut CliResponse,
    ) -> Result<(), Halted> {
        self.validate_chain(request, prior, remote_ip, response)?;

        match self.nut_source.next().await {
            Ok(next_nut) => {
                response.qry = self.qry(&next_nut);
                response.nut = next_nut;
            }
            Err(error) => {
                warn!(%error, "nut generation failed");
                response.tif.set(Tif::TRANSIENT_ERROR);
                return Err(Halted);
            }
        }

        let identity = match self.identities.find_identity(&request.client.idk).await {
            Ok(identity) => identity,
            Err(error) => {
                warn!(%error, "identity lookup failed");
                response.tif.set(Tif::TRANSIENT_ERROR);
                return Err(Halted);
            }
        };

        let previous = self.lookup_previous(request, response).await?;
        let identity = self.dispatch(request, identity, previous, response).await?;

        if request.client.opt.suk {
            if let Some(identity) = &identity {
                response.suk = non_empty(&identity.suk);
            } else if request.client.cmd == Command::Ident {
                response.suk = non_empty(&request.client.suk);
            }
        }

        if request.client.cmd == Command::Query {
            if let Some(identity) = &identity {
                response.ask = self.authenticator.ask_response(identity).await;
            }
        }

        self.finalize(request, identity.as_ref(), prior, response).await;
        Ok(())
    }

    /// Chain checks: anti-replay, IP binding, idk stability.
    fn validate_chain(
        &self,
        request: &CliRequest,
        prior: &HoardEntry,
        remote_ip: &str,
        response: &mut CliResponse,
    ) -> Result<(), Halted> {
        if let Some(last_response) = &prior.last_response {
            if !request.validate_last_response(last_response) {
                // Log after failing so nothing about the stored bytes can
                // reach the client.
                response.tif.set(Tif::COMMAND_FAILED);
                debug!("request does not echo the previous response");
                return Err(Halted);
            }
        }

        if prior.remote_ip == remote_ip {
            response.tif.set(Tif::IP_MATCHED);
        } else if !request.client.opt.noiptest {
            debug!(original = %prior.remote_ip, current = %remote_ip, "rejecting on ip mismatch");
            response.tif.set(Tif::COMMAND_FAILED);
            return Err(Halted);
        }

        if let Some(last_request) = &prior.last_request {
            if last_request.client.idk != request.client.idk {
                debug!("idk changed along the chain");
                response.tif.set(Tif::CLIENT_FAILURE);
                response.tif.set(Tif::COMMAND_FAILED);
                response.tif.set(Tif::BAD_ID_ASSOCIATION);
                return Err(Halted);
            }
        }
        Ok(())
    }

    async fn lookup_previous(
        &self,
        request: &CliRequest,
        response: &mut CliResponse,
    ) -> Result<Option<SqrlIdentity>, Halted> {
        if request.client.pidk.is_empty() {
            return Ok(None);
        }
        match self.identities.find_identity(&request.client.pidk).await {
            Ok(previous) => {
                if previous.is_some() {
                    response.tif.set(Tif::PREVIOUS_ID_MATCH);
                }
                Ok(previous)
            }
            Err(error) => {
                warn!(%error, "previous identity lookup failed");
                response.tif.set(Tif::TRANSIENT_ERROR);
                Err(Halted)
            }
        }
    }

    /// Command dispatch. Returns the identity the rest of the hop works
    /// with, which for a first-time `ident` is freshly materialized.
    async fn dispatch(
        &self,
        request: &CliRequest,
        identity: Option<SqrlIdentity>,
        previous: Option<SqrlIdentity>,
        response: &mut CliResponse,
    ) -> Result<Option<SqrlIdentity>, Halted> {
        if let Command::Other(name) = &request.client.cmd {
            debug!(cmd = %name, "unrecognized command");
            response.tif.set(Tif::FUNCTION_NOT_SUPPORTED);
            if identity.is_some() {
                response.tif.set(Tif::ID_MATCH);
            }
            return Ok(identity);
        }

        match identity {
            Some(mut identity) => {
                self.known_identity(request, &mut identity, response).await?;
                Ok(Some(identity))
            }
            None if request.client.cmd == Command::Ident => {
                let identity = request.identity();
                if let Some(previous) = previous {
                    self.swap_previous(&previous, &identity, response).await?;
                }
                response.tif.set(Tif::ID_MATCH);
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }

    async fn known_identity(
        &self,
        request: &CliRequest,
        identity: &mut SqrlIdentity,
        response: &mut CliResponse,
    ) -> Result<(), Halted> {
        response.tif.set(Tif::ID_MATCH);
        let mut changed = false;
        if request.is_auth_command() {
            changed = request.update_identity(identity);
        }

        match request.client.cmd {
            Command::Enable | Command::Remove => {
                if let Err(error) = request.verify_urs(&identity.vuk) {
                    debug!(%error, cmd = request.client.cmd.as_str(), "urs verification failed");
                    if identity.disabled {
                        response.tif.set(Tif::SQRL_DISABLED);
                    }
                    response.tif.set(Tif::CLIENT_FAILURE);
                    response.tif.set(Tif::COMMAND_FAILED);
                    return Err(Halted);
                }
                if request.client.cmd == Command::Enable {
                    info!(idk = %identity.idk, "re-enabled identity");
                    identity.disabled = false;
                    changed = true;
                } else {
                    self.remove_identity(identity, response).await?;
                }
            }
            Command::Disable => {
                info!(idk = %identity.idk, "disabled identity");
                identity.disabled = true;
                changed = true;
            }
            _ => {}
        }

        if identity.disabled {
            response.tif.set(Tif::SQRL_DISABLED);
        }
        if changed {
            if let Err(error) = self.identities.save_identity(identity).await {
                warn!(%error, idk = %identity.idk, "failed saving identity");
                response.tif.set(Tif::CLIENT_FAILURE);
                response.tif.set(Tif::COMMAND_FAILED);
                return Err(Halted);
            }
        }
        Ok(())
    }

    async fn remove_identity(
        &self,
        identity: &SqrlIdentity,
        response: &mut CliResponse,
    ) -> Result<(), Halted> {
        if let Err(error) = self.authenticator.remove_identity(identity).await {
            warn!(%error, idk = %identity.idk, "authenticator rejected identity removal");
            response.tif.set(Tif::CLIENT_FAILURE);
            response.tif.set(Tif::COMMAND_FAILED);
            return Err(Halted);
        }
        if let Err(error) = self.identities.delete_identity(&identity.idk).await {
            warn!(%error, idk = %identity.idk, "failed deleting identity");
            response.tif.set(Tif::CLIENT_FAILURE);
            response.tif.set(Tif::COMMAND_FAILED);
            return Err(Halted);
        }
        info!(idk = %identity.idk, "removed identity");
        Ok(())
    }

    /// Record a rekey: application swap first, then the store link from the
    /// superseded record to its successor.
    async fn swap_previous(
        &self,
        previous: &SqrlIdentity,
        next: &SqrlIdentity,
        response: &mut CliResponse,
    ) -> Result<(), Halted> {
        if let Err(error) = self.authenticator.swap_identities(previous, next).await {
            warn!(%error, "identity swap failed");
            response.tif.set(Tif::TRANSIENT_ERROR);
            response.tif.set(Tif::COMMAND_FAILED);
            return Err(Halted);
        }
        let mut superseded = previous.clone();
        superseded.rekeyed = Some(next.idk.clone());
        if let Err(error) = self.identities.save_identity(&superseded).await {
            warn!(%error, "failed recording rekey link");
            response.tif.set(Tif::TRANSIENT_ERROR);
            response.tif.set(Tif::COMMAND_FAILED);
            return Err(Halted);
        }
        info!(previous = %previous.idk, next = %next.idk, "swapped identities");
        response.tif.clear(Tif::PREVIOUS_ID_MATCH);
        Ok(())
    }

    /// Authentication wrap-up for `ident` and `enable`.
    async fn finalize(
        &self,
        request: &CliRequest,
        identity: Option<&SqrlIdentity>,
        prior: &HoardEntry,
        response: &mut CliResponse,
    ) {
        let disabled = identity.is_some_and(|identity| identity.disabled);

        if request.is_auth_command() && !disabled {
            let Some(identity) = identity else {
                // `enable` against an identity nobody knows.
                response.tif.set(Tif::COMMAND_FAILED);
                return;
            };
            if let Err(error) = self.identities.save_identity(identity).await {
                warn!(%error, idk = %identity.idk, "failed persisting authenticated identity");
                response.tif.set(Tif::TRANSIENT_ERROR);
                response.tif.set(Tif::COMMAND_FAILED);
                return;
            }
            let auth_url = self.authenticator.authenticate_identity(identity).await;
            info!(idk = %identity.idk, "authenticated identity");
            if request.client.opt.cps {
                response.url = Some(auth_url);
            } else {
                // Non-CPS: the browser learns the URL by polling the pag
                // nut, so rewrite that entry as authenticated.
                let entry = HoardEntry {
                    state: HoardState::Authenticated,
                    remote_ip: prior.remote_ip.clone(),
                    original_nut: prior.original_nut.clone(),
                    pag_nut: prior.pag_nut.clone(),
                    last_request: Some(request.clone()),
                    last_response: None,
                    identity: Some(identity.clone()),
                };
                if let Err(error) = self
                    .hoard
                    .save(&prior.pag_nut, entry, self.nut_expiration())
                    .await
                {
                    warn!(%error, pag = %prior.pag_nut, "failed hoarding pag entry");
                    response.tif.set(Tif::TRANSIENT_ERROR);
                } else {
                    debug!(pag = %prior.pag_nut, "hoarded authenticated pag entry");
                }
            }
        }

        if request.client.cmd == Command::Ident && disabled {
            response.tif.set(Tif::COMMAND_FAILED);
        }
    }

    /// Write the chain entry back and produce the final bytes. Render once,
    /// save, and only re-render if the save failed before anything was
    /// transmitted.
    async fn seal(&self, request: CliRequest, mut response: CliResponse, prior: HoardEntry) -> Vec<u8> {
        let encoded = response.encode();
        let entry = HoardEntry {
            state: HoardState::Associated,
            remote_ip: prior.remote_ip,
            original_nut: prior.original_nut,
            pag_nut: prior.pag_nut,
            last_request: Some(request),
            last_response: Some(encoded.clone()),
            identity: None,
        };
        match self.hoard.save(&response.nut, entry, self.nut_expiration()).await {
            Ok(()) => {
                debug!(nut = %response.nut, "hoarded chain entry");
                encoded
            }
            Err(error) => {
                warn!(%error, "failed hoarding chain entry");
                response.tif.set(Tif::TRANSIENT_ERROR);
                response.encode()
            }
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}
