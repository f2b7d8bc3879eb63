//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the SQRL endpoints and the URLs they hand out.
///
/// Reconstructing host and path from forwarding headers works but can be
/// unreliable behind some proxies; set `host_override` and `root_path`
/// explicitly in anything resembling production.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SspConfig {
    /// Host used when building outbound URLs, port included if one is
    /// needed. Overrides forwarded-host detection.
    pub host_override: Option<String>,
    /// Path prefix the endpoints are mounted under. Empty for the root.
    pub root_path: String,
    /// Seconds a hoarded nut stays valid.
    pub nut_expiration_secs: u64,
}

impl Default for SspConfig {
    fn default() -> Self {
        Self {
            host_override: None,
            root_path: String::new(),
            nut_expiration_secs: 600,
        }
    }
}

impl SspConfig {
    pub fn nut_expiration(&self) -> Duration {
        Duration::from_secs(self.nut_expiration_secs)
    }

    /// Normalize the root path: a leading slash when non-empty, no
    /// trailing slash. Endpoint paths are appended verbatim.
    pub fn normalized(mut self) -> Self {
        if !self.root_path.is_empty() && self.root_path != "/" {
            if !self.root_path.starts_with('/') {
                self.root_path.insert(0, '/');
            }
            while self.root_path.ends_with('/') {
                self.root_path.pop();
            }
        } else {
            self.root_path.clear();
        }
        self
    }
}
