//! Demo SQRL server wiring the in-memory implementations together.
//!
//! Serves the four SQRL endpoints with a random nut source, a map-backed
//! hoard and identity store, and an authenticator that redirects to a
//! static success page. Real deployments replace the stores and the
//! authenticator and keep the engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sqrl_ssp::authenticator::Authenticator;
use sqrl_ssp::config::SspConfig;
use sqrl_ssp::engine::SspEngine;
use sqrl_ssp::error::Result as SspResult;
use sqrl_ssp::hoard::MemoryHoard;
use sqrl_ssp::identity::{IdentityStore, MemoryIdentityStore, SqrlIdentity};
use sqrl_ssp::nut::{CounterNutSource, NutSource, RandomNutSource};
use sqrl_ssp::server;

#[derive(Debug, Parser)]
#[command(name = "ssp-server", about = "Demo SQRL SSP server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// PEM certificate file for direct TLS termination.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key file for direct TLS termination.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Hostname used when building SQRL URLs, port included if needed.
    #[arg(long)]
    host: Option<String>,

    /// Path prefix the SQRL endpoints are mounted under.
    #[arg(long, default_value = "")]
    root_path: String,

    /// Seconds a nut stays valid.
    #[arg(long, default_value_t = 600)]
    nut_expiration: u64,

    /// Random bytes per nut.
    #[arg(long, default_value_t = 8)]
    nut_size: usize,

    /// Use the counter+Blowfish nut source with this key instead of the
    /// random source.
    #[arg(long)]
    counter_key: Option<String>,

    /// Initial counter value for the counter nut source; pass the last
    /// persisted value after a restart.
    #[arg(long, default_value_t = 0, requires = "counter_key")]
    counter_init: u64,
}

/// Authenticator that sends every authenticated identity to a static
/// success page.
struct DemoAuthenticator {
    host: String,
    root_path: String,
}

#[async_trait]
impl Authenticator for DemoAuthenticator {
    async fn authenticate_identity(&self, identity: &SqrlIdentity) -> String {
        format!(
            "https://{}{}/success.html?idk={}",
            self.host, self.root_path, identity.idk
        )
    }

    async fn swap_identities(&self, _previous: &SqrlIdentity, _next: &SqrlIdentity) -> SspResult<()> {
        // No application accounts to move in the demo.
        Ok(())
    }

    async fn remove_identity(&self, _identity: &SqrlIdentity) -> SspResult<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = SspConfig {
        host_override: args.host.clone(),
        root_path: args.root_path,
        nut_expiration_secs: args.nut_expiration,
    }
    .normalized();

    let nut_source: Arc<dyn NutSource> = match &args.counter_key {
        Some(key) => Arc::new(
            CounterNutSource::new(args.counter_init, key.as_bytes())
                .context("failed creating the counter nut source")?,
        ),
        None => Arc::new(
            RandomNutSource::new(args.nut_size).context("failed creating the nut source")?,
        ),
    };
    let identities = Arc::new(MemoryIdentityStore::new());

    // A pre-seeded identity so rekey flows can be exercised against the demo.
    identities
        .save_identity(&SqrlIdentity {
            idk: "-hBaX3BE36R0dkRNSmmur9vNFuMwZG4FCEgcmKkrunM".to_owned(),
            suk: "yVBzTI2Q4HGBmWSMAc2DuoSx3ZubZweAdIKplTia4mI".to_owned(),
            vuk: "GdEBlxqMeZeHhjmEnWInBQTs0zcO6wkqc23o2oATfiw".to_owned(),
            ..SqrlIdentity::default()
        })
        .await
        .context("failed seeding the demo identity")?;

    let authenticator = Arc::new(DemoAuthenticator {
        host: args.host.unwrap_or_else(|| args.listen.to_string()),
        root_path: config.root_path.clone(),
    });

    let engine = Arc::new(SspEngine::new(
        nut_source,
        Arc::new(MemoryHoard::new()),
        identities,
        authenticator,
        config,
    ));

    let router = server::router(engine);
    let tls = args.cert.zip(args.key);
    server::serve(router, args.listen, tls)
        .await
        .context("server failed")
}
