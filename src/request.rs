//! Parsing and verification of signed client envelopes.
//!
//! The `/cli.sqrl` POST body is form-urlencoded with fields `client`,
//! `server`, `ids` and optionally `pids` and `urs`. `client` decodes to a
//! CRLF block describing the command; `server` echoes either the previous
//! response or, on the first hop, the `sqrl://` URL the client followed.
//! The signing string every signature covers is the concatenation of the
//! raw `client` and `server` values exactly as they crossed the wire.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use url::form_urlencoded;

use crate::codec::{parse_crlf_block, push_line, render_version_list, sqrl64_decode, sqrl64_encode};
use crate::error::{Result, SspError};
use crate::identity::SqrlIdentity;

/// Protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands a client may issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Query,
    Ident,
    Disable,
    Enable,
    Remove,
    /// Anything we do not recognize; answered with FUNCTION_NOT_SUPPORTED.
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Query => "query",
            Command::Ident => "ident",
            Command::Disable => "disable",
            Command::Enable => "enable",
            Command::Remove => "remove",
            Command::Other(name) => name,
        }
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        match value.as_str() {
            "query" => Command::Query,
            "ident" => Command::Ident,
            "disable" => Command::Disable,
            "enable" => Command::Enable,
            "remove" => Command::Remove,
            _ => Command::Other(value),
        }
    }
}

impl From<Command> for String {
    fn from(value: Command) -> Self {
        value.as_str().to_owned()
    }
}

/// The `opt` tokens the server acts on. Unrecognized tokens are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptFlags {
    /// Client wants the stored server unlock key echoed back.
    pub suk: bool,
    /// Client-provided session: the client itself performs the redirect.
    pub cps: bool,
    /// Only SQRL may authenticate this account.
    pub sqrlonly: bool,
    /// No out-of-band account recovery.
    pub hardlock: bool,
    /// Skip the IP binding check.
    pub noiptest: bool,
}

impl OptFlags {
    fn from_tokens(raw: &str) -> Self {
        let mut flags = OptFlags::default();
        for token in raw.split('~') {
            match token {
                "suk" => flags.suk = true,
                "cps" => flags.cps = true,
                "sqrlonly" => flags.sqrlonly = true,
                "hardlock" => flags.hardlock = true,
                "noiptest" => flags.noiptest = true,
                _ => {}
            }
        }
        flags
    }

    fn tokens(&self) -> Vec<&'static str> {
        let mut tokens = Vec::new();
        if self.suk {
            tokens.push("suk");
        }
        if self.cps {
            tokens.push("cps");
        }
        if self.sqrlonly {
            tokens.push("sqrlonly");
        }
        if self.hardlock {
            tokens.push("hardlock");
        }
        if self.noiptest {
            tokens.push("noiptest");
        }
        tokens
    }
}

/// The decoded `client` parameter.
///
/// Key fields hold SQRL base64 as received; an empty string means the
/// client did not send the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBody {
    pub ver: Vec<u32>,
    pub cmd: Command,
    pub opt: OptFlags,
    pub idk: String,
    #[serde(default)]
    pub pidk: String,
    #[serde(default)]
    pub suk: String,
    #[serde(default)]
    pub vuk: String,
    /// Ask button the user pressed, 0 through 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btn: Option<u8>,
}

impl ClientBody {
    /// Decode from the wire form of the `client` parameter.
    pub fn decode(encoded: &str) -> Result<Self> {
        let decoded = sqrl64_decode(encoded)?;
        let text = String::from_utf8(decoded).map_err(|_| SspError::Malformed {
            message: "client block is not UTF-8".to_owned(),
        })?;
        Self::from_params(&parse_crlf_block(&text)?)
    }

    fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let ver = crate::codec::parse_version_list(params.get("ver").map_or("", String::as_str))?;
        if !ver.contains(&PROTOCOL_VERSION) {
            return Err(SspError::UnsupportedVersion { versions: ver });
        }
        let btn = params
            .get("btn")
            .and_then(|raw| raw.parse::<u8>().ok())
            .filter(|&value| value <= 2);
        Ok(ClientBody {
            ver,
            cmd: Command::from(params.get("cmd").cloned().unwrap_or_default()),
            opt: OptFlags::from_tokens(params.get("opt").map_or("", String::as_str)),
            idk: params.get("idk").cloned().unwrap_or_default(),
            pidk: params.get("pidk").cloned().unwrap_or_default(),
            suk: params.get("suk").cloned().unwrap_or_default(),
            vuk: params.get("vuk").cloned().unwrap_or_default(),
            btn,
        })
    }

    /// Re-encode to the wire form.
    pub fn encode(&self) -> String {
        let mut block = String::new();
        push_line(&mut block, "ver", &render_version_list(&self.ver));
        push_line(&mut block, "cmd", self.cmd.as_str());
        let opts = self.opt.tokens();
        if !opts.is_empty() {
            push_line(&mut block, "opt", &opts.join("~"));
        }
        push_line(&mut block, "idk", &self.idk);
        if !self.suk.is_empty() {
            push_line(&mut block, "suk", &self.suk);
        }
        if !self.vuk.is_empty() {
            push_line(&mut block, "vuk", &self.vuk);
        }
        if !self.pidk.is_empty() {
            push_line(&mut block, "pidk", &self.pidk);
        }
        if let Some(btn) = self.btn {
            push_line(&mut block, "btn", &btn.to_string());
        }
        sqrl64_encode(block.as_bytes())
    }

    /// The `idk` as a verifying key.
    pub fn identity_key(&self) -> Result<VerifyingKey> {
        decode_key("idk", &self.idk)
    }

    /// The `pidk` as a verifying key.
    pub fn previous_identity_key(&self) -> Result<VerifyingKey> {
        decode_key("pidk", &self.pidk)
    }
}

fn decode_key(field: &'static str, encoded: &str) -> Result<VerifyingKey> {
    let bytes = sqrl64_decode(encoded).map_err(|_| SspError::InvalidKey { field })?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| SspError::InvalidKey { field })?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| SspError::InvalidKey { field })
}

fn decode_signature(field: &'static str, encoded: &str) -> Result<Signature> {
    let bytes = sqrl64_decode(encoded).map_err(|_| SspError::SignatureInvalid { field })?;
    Signature::from_slice(&bytes).map_err(|_| SspError::SignatureInvalid { field })
}

/// A parsed `/cli.sqrl` envelope.
///
/// [`CliRequest::from_form_body`] verifies `ids` (and `pids` whenever
/// either `pids` or `pidk` is present) before returning, so a value you
/// hold has passed signature checks. `urs` is deliberately not checked at
/// parse time; the commands that need it call [`CliRequest::verify_urs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliRequest {
    pub client: ClientBody,
    /// The raw `client` value as it appeared on the wire.
    pub client_encoded: String,
    /// The raw `server` value: the prior response echo, or the initial
    /// `sqrl://` URL on the first hop.
    pub server: String,
    pub ids: String,
    #[serde(default)]
    pub pids: String,
    #[serde(default)]
    pub urs: String,
}

impl CliRequest {
    /// Parse a form-urlencoded POST body and verify its signatures.
    pub fn from_form_body(body: &[u8]) -> Result<Self> {
        let mut fields: HashMap<String, String> = form_urlencoded::parse(body).into_owned().collect();
        let mut field = |name: &str| fields.remove(name).unwrap_or_default();

        let client_encoded = field("client");
        let request = CliRequest {
            client: ClientBody::decode(&client_encoded)?,
            client_encoded,
            server: field("server"),
            ids: field("ids"),
            pids: field("pids"),
            urs: field("urs"),
        };
        request.verify_signatures()?;
        Ok(request)
    }

    /// The string every signature on this envelope covers.
    pub fn signing_string(&self) -> Vec<u8> {
        let mut signed = Vec::with_capacity(self.client_encoded.len() + self.server.len());
        signed.extend_from_slice(self.client_encoded.as_bytes());
        signed.extend_from_slice(self.server.as_bytes());
        signed
    }

    fn verify_signatures(&self) -> Result<()> {
        let signed = self.signing_string();
        let key = self.client.identity_key()?;
        let ids = decode_signature("ids", &self.ids)?;
        key.verify(&signed, &ids)
            .map_err(|_| SspError::SignatureInvalid { field: "ids" })?;

        // If either half of the previous-identity pair is present, the
        // signature must check out against the previous key.
        if !self.pids.is_empty() || !self.client.pidk.is_empty() {
            let previous_key = self.client.previous_identity_key()?;
            let pids = decode_signature("pids", &self.pids)?;
            previous_key
                .verify(&signed, &pids)
                .map_err(|_| SspError::SignatureInvalid { field: "pids" })?;
        }
        Ok(())
    }

    /// Verify the unlock request signature against a stored `vuk`. Required
    /// by `enable` and `remove`; only call it when the command needs it.
    pub fn verify_urs(&self, vuk: &str) -> Result<()> {
        if vuk.is_empty() || self.urs.is_empty() {
            return Err(SspError::SignatureInvalid { field: "urs" });
        }
        let key = decode_key("vuk", vuk)?;
        let urs = decode_signature("urs", &self.urs)?;
        key.verify(&self.signing_string(), &urs)
            .map_err(|_| SspError::SignatureInvalid { field: "urs" })
    }

    /// Constant-time check that this request echoes the previous response.
    pub fn validate_last_response(&self, last_response: &[u8]) -> bool {
        self.server.as_bytes().ct_eq(last_response).into()
    }

    /// Commands that authenticate: `ident` and `enable`.
    pub fn is_auth_command(&self) -> bool {
        matches!(self.client.cmd, Command::Ident | Command::Enable)
    }

    /// Materialize a new identity from this request.
    pub fn identity(&self) -> SqrlIdentity {
        SqrlIdentity {
            idk: self.client.idk.clone(),
            suk: self.client.suk.clone(),
            vuk: self.client.vuk.clone(),
            pidk: (!self.client.pidk.is_empty()).then(|| self.client.pidk.clone()),
            sqrlonly: self.client.opt.sqrlonly,
            hardlock: self.client.opt.hardlock,
            disabled: false,
            rekeyed: None,
        }
    }

    /// Apply the client-asserted policy flags to an identity. Returns
    /// whether anything changed and so needs persisting.
    pub fn update_identity(&self, identity: &mut SqrlIdentity) -> bool {
        let changed = identity.sqrlonly != self.client.opt.sqrlonly
            || identity.hardlock != self.client.opt.hardlock;
        identity.sqrlonly = self.client.opt.sqrlonly;
        identity.hardlock = self.client.opt.hardlock;
        changed
    }

    /// Re-encode as a form body, the shape a client POSTs.
    pub fn encode(&self) -> String {
        let mut body = form_urlencoded::Serializer::new(String::new());
        if self.client_encoded.is_empty() {
            body.append_pair("client", &self.client.encode());
        } else {
            body.append_pair("client", &self.client_encoded);
        }
        body.append_pair("server", &self.server);
        body.append_pair("ids", &self.ids);
        if !self.pids.is_empty() {
            body.append_pair("pids", &self.pids);
        }
        if !self.urs.is_empty() {
            body.append_pair("urs", &self.urs);
        }
        body.finish()
    }
}
