//! HTTP adapters for the SQRL endpoints.
//!
//! Thin axum handlers mapping requests onto the protocol engine:
//!
//! - `GET|POST {root}/nut.sqrl` — fresh nut pair for a login page
//! - `GET {root}/png.sqrl` — QR code PNG of the `sqrl://` URL
//! - `POST {root}/cli.sqrl` — the protocol engine entry point
//! - `GET {root}/pag.sqrl` — browser poll for the success URL
//!
//! `cli.sqrl` must reach SQRL clients over https on the same host. The
//! server either terminates TLS itself when given a cert/key pair or runs
//! plain HTTP behind a terminating proxy.

mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::engine::SspEngine;

/// Build the SQRL router, mounted under the engine's root path.
pub fn router(engine: Arc<SspEngine>) -> Router {
    let routes = Router::new()
        .route("/nut.sqrl", get(handlers::nut).post(handlers::nut))
        .route("/png.sqrl", get(handlers::png))
        .route("/cli.sqrl", post(handlers::cli))
        .route("/pag.sqrl", get(handlers::pag))
        .with_state(engine.clone());

    let root_path = engine.config().root_path.as_str();
    if root_path.is_empty() {
        routes
    } else {
        Router::new().nest(root_path, routes)
    }
}

/// Serve the router, terminating TLS when a PEM cert/key pair is supplied
/// and speaking plain HTTP otherwise.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
) -> std::io::Result<()> {
    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    match tls {
        Some((cert, key)) => {
            let config = RustlsConfig::from_pem_file(cert, key).await?;
            info!(%addr, "listening with TLS");
            axum_server::bind_rustls(addr, config).serve(service).await
        }
        None => {
            info!(%addr, "listening");
            axum_server::bind(addr).serve(service).await
        }
    }
}
