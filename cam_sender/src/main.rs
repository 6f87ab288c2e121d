use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use cam_sender::{
    capture::{quality_percent, CaptureConfig},
    client::{connect, run_session, ClientConfig},
    overlay::{load_font, Overlay},
    sensors::{CameraSource, FrameSource, StillImageSource},
    viewer::Viewer,
};
use clap::Parser;
use env_logger::TimestampPrecision;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Event channel of the detect server
    #[clap(long, env = "DETECT_SERVER_URL", default_value = "ws://localhost:5000/ws")]
    server_url: String,

    /// Origin announced to the server, empty to send none
    #[clap(long, default_value = "http://localhost:3006")]
    origin: String,

    /// Extra handshake header as `name:value`
    #[clap(long = "header", default_value = "my-custom-header:abcd")]
    headers: Vec<String>,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Stream a still image instead of the camera
    #[clap(long)]
    image: Option<PathBuf>,

    /// Milliseconds between two sampled frames
    #[clap(long, default_value_t = 300)]
    interval_ms: u64,

    /// JPEG quality factor between 0 and 1
    #[clap(long, default_value_t = 0.8)]
    quality: f32,

    /// TrueType font for the labels, boxes only if not given
    #[clap(long)]
    font: Option<PathBuf>,

    /// Address of the HTTP server showing video and overlay
    #[clap(long, default_value = "127.0.0.1:3000")]
    viewer_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let capture_config = CaptureConfig {
        interval: Duration::from_millis(args.interval_ms),
        jpeg_quality: quality_percent(args.quality),
        ..Default::default()
    };

    let client_config = ClientConfig {
        url: args.server_url.clone(),
        origin: Some(args.origin.clone()).filter(|origin| !origin.is_empty()),
        headers: args
            .headers
            .iter()
            .map(|header| parse_header(header))
            .collect::<Result<_>>()?,
    };

    let mut source: Box<dyn FrameSource> = match args.image.as_ref() {
        Some(path) => Box::new(StillImageSource::open(path).map_err(|e| anyhow!(e))?),
        None => Box::new(CameraSource::open(&args.device, None, None).map_err(|e| anyhow!(e))?),
    };

    let mut overlay = Overlay::new(capture_config.canvas_size);
    if let Some(path) = args.font.as_ref() {
        overlay = overlay.with_font(load_font(path).map_err(|e| anyhow!(e))?);
    }

    // Serve video and overlay for viewing
    let viewer = Arc::new(Viewer::new(capture_config.video_size));
    let viewer_addr: SocketAddr = args.viewer_address.parse()?;
    {
        let app = Arc::clone(&viewer).router();
        tokio::spawn(async move {
            if let Err(e) = axum::Server::bind(&viewer_addr)
                .serve(app.into_make_service())
                .await
            {
                log::error!("Viewer failed: {}", e);
            }
        });
    }
    log::info!("Overlay stream on http://{}/stream", viewer_addr);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            cancel.cancel();
        });
    }

    let socket = connect(&client_config).await?;
    let summary = run_session(
        socket,
        source.as_mut(),
        capture_config,
        &mut overlay,
        &viewer,
        cancel,
    )
    .await?;

    log::info!(
        "Session ended: {} frames sent, {} predictions applied, {} discarded",
        summary.frames_sent,
        summary.predictions_applied,
        summary.predictions_discarded
    );

    Ok(())
}

fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| anyhow!("header {header:?} is not of the form name:value"))?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}
