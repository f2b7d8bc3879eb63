//! Request and response adapters between HTTP and the protocol engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::{HeaderValue, ACCEPT, CONTENT_TYPE, REFERER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use url::form_urlencoded;

use crate::codec::sqrl64_encode;
use crate::engine::{PagError, SspEngine};
use crate::nut::Nut;

/// Host for outbound URLs, in order of preference: configured override,
/// `X-Forwarded-Host`, `X-Forwarded-Server`, the request `Host`.
fn host(engine: &SspEngine, headers: &HeaderMap) -> String {
    if let Some(host) = &engine.config().host_override {
        return host.clone();
    }
    for name in ["x-forwarded-host", "x-forwarded-server", "host"] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            if !value.is_empty() {
                return value.to_owned();
            }
        }
    }
    String::new()
}

/// Client IP: `X-Forwarded-For` when behind a proxy, else the socket peer.
fn remote_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers.get(ACCEPT).and_then(|value| value.to_str().ok()) == Some("application/json")
}

/// `nut.sqrl`: issue a fresh nut pair for a login page.
pub(super) async fn nut(
    State(engine): State<Arc<SspEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let entry = match engine.new_session(&remote_ip(&headers, peer)).await {
        Ok(entry) => entry,
        Err(error) => {
            warn!(%error, "failed creating a nut session");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let exp = engine.config().nut_expiration_secs;

    if wants_json(&headers) {
        return Json(json!({
            "nut": entry.original_nut,
            "pag": entry.pag_nut,
            "exp": exp,
        }))
        .into_response();
    }

    let mut body = form_urlencoded::Serializer::new(String::new());
    body.append_pair("nut", entry.original_nut.as_str());
    body.append_pair("pag", entry.pag_nut.as_str());
    body.append_pair("exp", &exp.to_string());
    if let Some(referer) = headers.get(REFERER).and_then(|value| value.to_str().ok()) {
        if !referer.is_empty() {
            // Cancel URL: back to wherever the login page lives.
            body.append_pair("can", &sqrl64_encode(referer.as_bytes()));
        }
    }
    (
        [(CONTENT_TYPE, "application/x-www-form-urlencoded")],
        body.finish(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub(super) struct PngQuery {
    nut: Option<String>,
}

/// `png.sqrl`: QR code of the `sqrl://` URL, generating a fresh nut pair
/// when none is supplied.
pub(super) async fn png(
    State(engine): State<Arc<SspEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<PngQuery>,
    headers: HeaderMap,
) -> Response {
    let mut created = None;
    let nut = match query.nut.filter(|nut| !nut.is_empty()) {
        Some(nut) => Nut::new(nut),
        None => match engine.new_session(&remote_ip(&headers, peer)).await {
            Ok(entry) => {
                let nut = entry.original_nut.clone();
                created = Some(entry);
                nut
            }
            Err(error) => {
                warn!(%error, "failed creating a nut session");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
    };

    let sqrl_url = engine.sqrl_url(&host(&engine, &headers), &nut);
    let png = match render_qr_png(&sqrl_url) {
        Ok(png) => png,
        Err(error) => {
            warn!(%error, "failed rendering the QR PNG");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to render PNG").into_response();
        }
    };

    let mut response = ([(CONTENT_TYPE, "image/png")], png).into_response();
    if let Some(entry) = created {
        let headers = response.headers_mut();
        for (name, value) in [
            ("Sqrl-Nut", entry.original_nut.as_str()),
            ("Sqrl-Pag", entry.pag_nut.as_str()),
            ("Sqrl-Exp", &engine.config().nut_expiration_secs.to_string()),
        ] {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
    }
    response
}

fn render_qr_png(data: &str) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    use image::{DynamicImage, ImageFormat, Luma};
    use qrcode::{EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L)?;
    let image = code.render::<Luma<u8>>().module_dimensions(4, 4).build();
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(image).write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

#[derive(Debug, Deserialize)]
pub(super) struct CliQuery {
    nut: Option<String>,
}

/// `cli.sqrl`: the protocol engine entry point.
pub(super) async fn cli(
    State(engine): State<Arc<SspEngine>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<CliQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let nut = query.nut.map(Nut::new);
    let encoded = engine.cli(nut, &body, &remote_ip(&headers, peer)).await;
    encoded.into_response()
}

#[derive(Debug, Deserialize)]
pub(super) struct PagQuery {
    nut: Option<String>,
    pag: Option<String>,
}

/// `pag.sqrl`: browser poll resolving a completed login into its URL.
pub(super) async fn pag(
    State(engine): State<Arc<SspEngine>>,
    Query(query): Query<PagQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(nut) = query.nut.filter(|nut| !nut.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing required nut parameter").into_response();
    };
    let Some(pag) = query.pag.filter(|pag| !pag.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing required pag parameter").into_response();
    };

    match engine.resolve_pag(&Nut::new(nut), &Nut::new(pag)).await {
        Ok(url) => {
            if wants_json(&headers) {
                Json(json!({ "url": url })).into_response()
            } else {
                url.into_response()
            }
        }
        Err(PagError::UnknownNut) => StatusCode::NOT_FOUND.into_response(),
        Err(PagError::WrongOriginalNut) => StatusCode::UNAUTHORIZED.into_response(),
        Err(error @ PagError::MissingIdentity) => {
            warn!(%error, "pag entry carries no identity");
            (StatusCode::INTERNAL_SERVER_ERROR, "missing identity").into_response()
        }
        Err(error) => {
            warn!(%error, "failed pag lookup");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed nut lookup").into_response()
        }
    }
}
