//! Responses to the SQRL client and the TIF bitfield.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{parse_crlf_block, parse_version_list, push_line, render_version_list, sqrl64_decode, sqrl64_encode};
use crate::error::{Result, SspError};
use crate::nut::Nut;
use crate::request::PROTOCOL_VERSION;

/// Transaction Information Flags: the bitfield summarizing one `cli.sqrl`
/// hop. Rendered as lowercase hex without a `0x` prefix.
///
/// Setting a flag is additive and idempotent; flags are only ever cleared
/// explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tif(u32);

impl Tif {
    /// The identity is known to the server.
    pub const ID_MATCH: Tif = Tif(0x001);
    /// The previous identity is known to the server.
    pub const PREVIOUS_ID_MATCH: Tif = Tif(0x002);
    /// The request came from the IP that obtained the original nut.
    pub const IP_MATCHED: Tif = Tif(0x004);
    /// The identity has been disabled.
    pub const SQRL_DISABLED: Tif = Tif(0x008);
    /// The command is not recognized.
    pub const FUNCTION_NOT_SUPPORTED: Tif = Tif(0x010);
    /// A retriable server-side failure.
    pub const TRANSIENT_ERROR: Tif = Tif(0x020);
    /// The command did not complete.
    pub const COMMAND_FAILED: Tif = Tif(0x040);
    /// The client sent bad data or a signature failed.
    pub const CLIENT_FAILURE: Tif = Tif(0x080);
    /// The request's idk disagrees with the idk bound to the chain.
    pub const BAD_ID_ASSOCIATION: Tif = Tif(0x100);

    pub fn set(&mut self, flag: Tif) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: Tif) {
        self.0 &= !flag.0;
    }

    pub fn contains(self, flag: Tif) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Tif(bits)
    }
}

impl fmt::LowerHex for Tif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A reply to the SQRL client, rendered as a CRLF block in a fixed field
/// order and then SQRL base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliResponse {
    pub ver: Vec<u32>,
    /// The nut the client must use on its next hop.
    pub nut: Nut,
    pub tif: Tif,
    /// Path (with nut) the next hop POSTs to.
    pub qry: String,
    /// CPS success URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sin: Option<String>,
    /// Stored server unlock key, echoed when the client asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    /// Cancel URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can: Option<String>,
}

impl CliResponse {
    /// A minimal valid response.
    pub fn new(nut: Nut, qry: impl Into<String>) -> Self {
        CliResponse {
            ver: vec![PROTOCOL_VERSION],
            nut,
            tif: Tif::default(),
            qry: qry.into(),
            url: None,
            sin: None,
            suk: None,
            ask: None,
            can: None,
        }
    }

    /// Render the CRLF block and encode it. The returned bytes are what
    /// goes on the wire and what the next request must echo back.
    pub fn encode(&self) -> Vec<u8> {
        let mut block = String::new();
        push_line(&mut block, "ver", &render_version_list(&self.ver));
        push_line(&mut block, "nut", self.nut.as_str());
        push_line(&mut block, "tif", &format!("{:x}", self.tif));
        push_line(&mut block, "qry", &self.qry);
        let optional = [
            ("url", &self.url),
            ("sin", &self.sin),
            ("suk", &self.suk),
            ("ask", &self.ask),
            ("can", &self.can),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                push_line(&mut block, key, value);
            }
        }
        sqrl64_encode(block.as_bytes()).into_bytes()
    }

    /// Decode an encoded response. Mostly for clients and tests; the server
    /// side only ever renders.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let encoded = std::str::from_utf8(encoded).map_err(|_| SspError::Malformed {
            message: "response is not ASCII base64".to_owned(),
        })?;
        let block = String::from_utf8(sqrl64_decode(encoded)?).map_err(|_| SspError::Malformed {
            message: "response block is not UTF-8".to_owned(),
        })?;
        let params = parse_crlf_block(&block)?;
        let tif = u32::from_str_radix(params.get("tif").map_or("", String::as_str), 16)
            .map_err(|_| SspError::Malformed {
                message: "unparseable tif".to_owned(),
            })?;
        Ok(CliResponse {
            ver: parse_version_list(params.get("ver").map_or("", String::as_str))?,
            nut: Nut::new(params.get("nut").cloned().unwrap_or_default()),
            tif: Tif::from_bits(tif),
            qry: params.get("qry").cloned().unwrap_or_default(),
            url: params.get("url").cloned(),
            sin: params.get("sin").cloned(),
            suk: params.get("suk").cloned(),
            ask: params.get("ask").cloned(),
            can: params.get("can").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_idempotent_and_order_independent() {
        let mut a = Tif::default();
        a.set(Tif::ID_MATCH);
        a.set(Tif::IP_MATCHED);
        a.set(Tif::ID_MATCH);

        let mut b = Tif::default();
        b.set(Tif::IP_MATCHED);
        b.set(Tif::ID_MATCH);

        assert_eq!(a, b);
        assert_eq!(a.bits(), 0x5);
    }

    #[test]
    fn clearing_previous_id_match_touches_only_that_bit() {
        let mut tif = Tif::default();
        tif.set(Tif::ID_MATCH);
        tif.set(Tif::PREVIOUS_ID_MATCH);
        tif.set(Tif::COMMAND_FAILED);
        tif.clear(Tif::PREVIOUS_ID_MATCH);
        assert_eq!(tif.bits(), 0x41);
        // Clearing an unset flag is a no-op.
        tif.clear(Tif::PREVIOUS_ID_MATCH);
        assert_eq!(tif.bits(), 0x41);
    }

    #[test]
    fn tif_renders_as_bare_lowercase_hex() {
        let mut tif = Tif::default();
        tif.set(Tif::CLIENT_FAILURE);
        tif.set(Tif::BAD_ID_ASSOCIATION);
        assert_eq!(format!("{tif:x}"), "180");
    }

    #[test]
    fn encode_uses_the_fixed_field_order() {
        let mut response = CliResponse::new(Nut::from("abc"), "/cli.sqrl?nut=abc");
        response.tif.set(Tif::ID_MATCH);
        response.suk = Some("c3Vr".to_owned());
        response.can = Some("https://example.com/cancel".to_owned());

        let block = String::from_utf8(sqrl64_decode(
            std::str::from_utf8(&response.encode()).unwrap(),
        ).unwrap()).unwrap();
        assert_eq!(
            block,
            "ver=1\r\nnut=abc\r\ntif=1\r\nqry=/cli.sqrl?nut=abc\r\nsuk=c3Vr\r\ncan=https://example.com/cancel\r\n"
        );
    }

    #[test]
    fn responses_round_trip() {
        let mut response = CliResponse::new(Nut::from("xyz"), "/sqrl/cli.sqrl?nut=xyz");
        response.tif.set(Tif::ID_MATCH);
        response.tif.set(Tif::IP_MATCHED);
        response.url = Some("https://example.com/finish".to_owned());
        response.sin = Some("0".to_owned());
        response.suk = Some("c3Vr".to_owned());
        response.ask = Some("Proceed?".to_owned());
        response.can = Some("https://example.com/cancel".to_owned());
        assert_eq!(CliResponse::decode(&response.encode()).unwrap(), response);

        let minimal = CliResponse::new(Nut::from("n"), "/cli.sqrl?nut=n");
        assert_eq!(CliResponse::decode(&minimal.encode()).unwrap(), minimal);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(CliResponse::decode(b"!!!not-base64!!!").is_err());
        let no_tif = sqrl64_encode(b"ver=1\r\nnut=n\r\nqry=q\r\n");
        assert!(CliResponse::decode(no_tif.as_bytes()).is_err());
    }
}
