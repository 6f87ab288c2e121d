//! Endpoints of HTTP server.
//!
use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};

use crate::{
    detector::{Detector, ModelState},
    server::ServerConfig,
    session::run_session,
};

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Reports whether the model has been loaded.
pub async fn ready(Extension(detector): Extension<Arc<Detector>>) -> (StatusCode, String) {
    match detector.state() {
        ModelState::Ready(_) => (StatusCode::OK, "ready".into()),
        ModelState::Loading => (StatusCode::SERVICE_UNAVAILABLE, "loading".into()),
        ModelState::Failed(reason) => (StatusCode::SERVICE_UNAVAILABLE, format!("failed: {reason}")),
    }
}

/// Upgrade to the event channel.
pub async fn event_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(detector): Extension<Arc<Detector>>,
    Extension(config): Extension<Arc<ServerConfig>>,
) -> Response {
    if !origin_allowed(&headers, &config.allowed_origins) {
        log::warn!(
            "{}: Rejecting connection from origin {:?}",
            peer,
            headers.get(header::ORIGIN)
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let session_config = config.session.clone();
    ws.on_upgrade(move |socket| run_session(socket, peer, detector, session_config))
}

/// Whether a request may open the event channel.
///
/// Requests without an `Origin` header do not come from a browser and are let through.
pub fn origin_allowed(headers: &HeaderMap, allowed_origins: &[String]) -> bool {
    match headers.get(header::ORIGIN) {
        None => true,
        Some(origin) => origin.to_str().map_or(false, |origin| {
            allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
        }),
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use axum::http::HeaderValue;

    fn with_origin(origin: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static(origin));
        headers
    }

    #[test]
    fn test_origin_allowed() {
        let allowed = vec!["http://localhost:3006".to_owned()];

        assert!(origin_allowed(&HeaderMap::new(), &allowed));
        assert!(origin_allowed(&with_origin("http://localhost:3006"), &allowed));
        assert!(!origin_allowed(&with_origin("http://localhost:8080"), &allowed));
        assert!(!origin_allowed(&with_origin("http://localhost:3006"), &[]));
        assert!(origin_allowed(&with_origin("https://anywhere.example"), &["*".to_owned()]));
    }
}
