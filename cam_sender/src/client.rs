//! Event channel session between the camera and the detect server.
//!
use anyhow::{Context, Result};
use common::protocol::{ClientMsg, ServerMsg};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{CaptureConfig, Sampler},
    overlay::Overlay,
    sensors::FrameSource,
    viewer::Viewer,
};

pub type EventSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to connect to the detect server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    /// Origin announced to the server, which has to allow it.
    pub origin: Option<String>,
    /// Additional handshake headers.
    pub headers: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/ws".into(),
            origin: Some("http://localhost:3006".into()),
            headers: vec![("my-custom-header".into(), "abcd".into())],
        }
    }
}

/// Counters of one finished session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames_sent: u64,
    pub predictions_applied: u64,
    pub predictions_discarded: u64,
}

/// Open the event channel.
pub async fn connect(config: &ClientConfig) -> Result<EventSocket> {
    let mut request = config.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    if let Some(origin) = config.origin.as_ref() {
        headers.insert("Origin", HeaderValue::from_str(origin)?);
    }
    for (name, value) in config.headers.iter() {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }

    let (socket, _response) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {}", config.url))?;
    log::info!("Client connected to {}", config.url);

    Ok(socket)
}

/// Stream frames and render predictions until the connection ends or `cancel` fires.
///
/// Capturing and rendering interleave on this one task and never run at the same time. Frames
/// are sent without waiting for their predictions.
pub async fn run_session(
    socket: EventSocket,
    source: &mut dyn FrameSource,
    capture_config: CaptureConfig,
    overlay: &mut Overlay,
    viewer: &Viewer,
    cancel: CancellationToken,
) -> Result<SessionSummary> {
    let (mut sink, mut stream) = socket.split();
    let mut summary = SessionSummary::default();
    let mut sampler = Sampler::new(capture_config);

    // Start sampling once the video delivers its first frame
    let mut current_frame = loop {
        if let Some(frame) = source.capture() {
            break frame;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(summary),
            _ = sleep(sampler.config().interval) => (),
        }
    };
    log::info!(
        "Video playing at {}x{}, sampling every {:?}",
        current_frame.width(),
        current_frame.height(),
        sampler.config().interval
    );

    let mut ticker = interval(sampler.config().interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Stopping session");
                sink.close().await.ok();
                break;
            }

            _ = ticker.tick() => {
                if let Some(frame) = source.capture() {
                    current_frame = frame;
                }
                viewer.publish_video(&current_frame);

                let frame = match sampler.sample(&current_frame) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Failed to encode frame: {e:#}");
                        continue;
                    }
                };
                log::debug!("Sending frame {} ({} bytes)", frame.seq, frame.jpeg.len());
                if let Err(e) = sink.send(Message::Text(ClientMsg::image(&frame).to_json()?)).await {
                    log::warn!("Connection lost while sending: {}", e);
                    break;
                }
                summary.frames_sent += 1;
            }

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match ServerMsg::from_json(&text) {
                    Ok(ServerMsg::Predictions(predictions)) => {
                        let seq = predictions.seq;
                        if overlay.apply(predictions) {
                            log::debug!("Frame {}: {} detections", seq, overlay.detections().len());
                            viewer.publish_overlay(&overlay.render(&current_frame));
                            summary.predictions_applied += 1;
                        } else {
                            log::debug!("Discarding stale predictions of frame {}", seq);
                            summary.predictions_discarded += 1;
                        }
                    }
                    Err(e) => log::warn!("Ignoring malformed message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => (),
                Some(Err(e)) => {
                    log::warn!("Connection lost: {}", e);
                    break;
                }
            },
        }
    }

    Ok(summary)
}
