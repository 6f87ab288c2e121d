//! HTTP server wiring.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    http::{HeaderName, HeaderValue, Method},
    routing::get,
    Extension, Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer};

use crate::{
    detector::Detector,
    endpoints::{event_socket, healthcheck, ready},
    session::SessionConfig,
};

/// Extra request header browsers are allowed to send.
pub const CUSTOM_HEADER: &str = "my-custom-header";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Origins allowed to open the event channel, `*` allows any.
    pub allowed_origins: Vec<String>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3006".into()],
            session: SessionConfig::default(),
        }
    }
}

/// Build the router with all endpoints.
pub fn app(detector: Arc<Detector>, config: ServerConfig) -> Router {
    let cors = cors_layer(&config.allowed_origins);

    // Plain HTTP responses are compressed, the event channel upgrade is left alone
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/ready", get(ready))
        .layer(CompressionLayer::new())
        .route("/ws", get(event_socket))
        .layer(Extension(detector))
        .layer(Extension(Arc::new(config)))
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid origin {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static(CUSTOM_HEADER)])
        .allow_credentials(true)
}

/// Serve the router on an already bound listener.
pub async fn serve(listener: std::net::TcpListener, app: Router) -> Result<()> {
    listener.set_nonblocking(true)?;
    axum::Server::from_tcp(listener)?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}
