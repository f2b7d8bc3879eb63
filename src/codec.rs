//! The two encodings that compose everywhere on the SQRL wire.
//!
//! Binary blobs (keys, signatures, encoded bodies) travel as URL-safe
//! base64 **without** padding. Inside a decoded blob, content is a sequence
//! of `key=value` lines separated by `\r\n`. Version lists use `,` and the
//! `opt` set uses `~`; those separators belong to the callers, this module
//! only handles the base64 and the line framing.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use percent_encoding::percent_decode_str;

use crate::error::{Result, SspError};

/// Encode bytes as SQRL base64 (URL-safe alphabet, no padding).
pub fn sqrl64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode SQRL base64.
pub fn sqrl64_decode(data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(data).map_err(|e| SspError::Malformed {
        message: format!("invalid base64: {e}"),
    })
}

/// Parse a CRLF-framed `key=value` block into a map.
///
/// Splits on `\r\n` only (a bare `\n` is data, not a separator), skips blank
/// lines, URL-decodes keys and values, and lets later duplicates overwrite
/// earlier ones.
pub fn parse_crlf_block(block: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for line in block.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key, value),
            None => (line, ""),
        };
        params.insert(unescape(key)?, unescape(value)?);
    }
    Ok(params)
}

/// Append one `key=value\r\n` line to a block under construction.
pub fn push_line(block: &mut String, key: &str, value: &str) {
    block.push_str(key);
    block.push('=');
    block.push_str(value);
    block.push_str("\r\n");
}

/// Render a version list, `,`-separated.
pub fn render_version_list(versions: &[u32]) -> String {
    versions.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

/// Parse a `,`-separated version list.
pub fn parse_version_list(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(|part| {
            part.trim().parse::<u32>().map_err(|_| SspError::Malformed {
                message: format!("invalid version list entry {part:?}"),
            })
        })
        .collect()
}

fn unescape(raw: &str) -> Result<String> {
    // Form-style decoding: '+' is a space, then percent sequences.
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| SspError::Malformed {
            message: format!("invalid escape in {raw:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_is_url_safe_without_padding() {
        let encoded = sqrl64_encode(&[0xff, 0xfe, 0xfd, 0x01]);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(sqrl64_decode(&encoded).unwrap(), vec![0xff, 0xfe, 0xfd, 0x01]);
    }

    #[test]
    fn decode_rejects_standard_alphabet_padding() {
        assert!(sqrl64_decode("AA==").is_err());
    }

    #[test]
    fn parse_splits_on_crlf_only() {
        let params = parse_crlf_block("cmd=query\r\nidk=abc\ndef\r\n").unwrap();
        assert_eq!(params["cmd"], "query");
        // The bare \n stays inside the value.
        assert_eq!(params["idk"], "abc\ndef");
    }

    #[test]
    fn parse_skips_blank_lines_and_overwrites_duplicates() {
        let params = parse_crlf_block("\r\ncmd=query\r\n\r\ncmd=ident\r\n").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["cmd"], "ident");
    }

    #[test]
    fn parse_url_decodes_keys_and_values() {
        let params = parse_crlf_block("a%20b=c%3Dd\r\nplus=a+b\r\n").unwrap();
        assert_eq!(params["a b"], "c=d");
        assert_eq!(params["plus"], "a b");
    }

    #[test]
    fn parse_handles_valueless_lines() {
        let params = parse_crlf_block("flag\r\n").unwrap();
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn version_list_round_trip() {
        assert_eq!(render_version_list(&[1]), "1");
        assert_eq!(render_version_list(&[1, 2, 3]), "1,2,3");
        assert_eq!(parse_version_list("1,2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_version_list("1,x").is_err());
    }
}
