//! HTTP endpoints to watch the live video and the overlay.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{body::StreamBody, http::header, response::IntoResponse, routing::get, Extension, Router};
use bytes::Bytes;
use image::RgbImage;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

const PREVIEW_QUALITY: i32 = 90;

/// Publishes encoded images to any number of MJPEG streams.
pub struct Viewer {
    video_size: (u32, u32),
    video_tx: broadcast::Sender<Bytes>,
    overlay_tx: broadcast::Sender<Bytes>,
}

impl Viewer {
    pub fn new(video_size: (u32, u32)) -> Self {
        let (video_tx, _) = broadcast::channel(4);
        let (overlay_tx, _) = broadcast::channel(4);
        Self {
            video_size,
            video_tx,
            overlay_tx,
        }
    }

    /// Publish a raw video frame, scaled to the preview size.
    pub fn publish_video(&self, frame: &RgbImage) {
        if self.video_tx.receiver_count() == 0 {
            return;
        }
        let (width, height) = self.video_size;
        let preview =
            image::imageops::resize(frame, width, height, image::imageops::FilterType::Triangle);
        publish(&self.video_tx, &preview);
    }

    /// Publish a rendered overlay canvas.
    pub fn publish_overlay(&self, canvas: &RgbImage) {
        if self.overlay_tx.receiver_count() == 0 {
            return;
        }
        publish(&self.overlay_tx, canvas);
    }

    pub fn subscribe_overlay(&self) -> broadcast::Receiver<Bytes> {
        self.overlay_tx.subscribe()
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/healthcheck", get(healthcheck))
            .route("/video", get(video_stream))
            .route("/stream", get(overlay_stream))
            .layer(Extension(self))
    }
}

fn publish(tx: &broadcast::Sender<Bytes>, image: &RgbImage) {
    match turbojpeg::compress_image(image, PREVIEW_QUALITY, turbojpeg::Subsamp::Sub2x2) {
        Ok(buf) => {
            // Only fails without subscribers
            tx.send(as_jpeg_stream_item(&buf)).ok();
        }
        Err(e) => log::warn!("Failed to encode preview: {}", e),
    }
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

async fn video_stream(Extension(viewer): Extension<Arc<Viewer>>) -> impl IntoResponse {
    log::info!("Video stream requested");
    multipart_response(viewer.video_tx.subscribe())
}

async fn overlay_stream(Extension(viewer): Extension<Arc<Viewer>>) -> impl IntoResponse {
    log::info!("Overlay stream requested");
    multipart_response(viewer.overlay_tx.subscribe())
}

fn multipart_response(rx: broadcast::Receiver<Bytes>) -> impl IntoResponse {
    // Lagging viewers skip frames
    let stream = BroadcastStream::new(rx).filter_map(|item| item.ok().map(Ok::<_, Infallible>));

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

/// Wrap a JPEG image into one part of a multipart stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_as_jpeg_stream_item() {
        let item = as_jpeg_stream_item(&[0xff, 0xd8, 0xff, 0xd9]);

        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8"));
        assert!(item.ends_with(b"\xff\xd9\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_publish_overlay_reaches_subscribers() {
        let viewer = Viewer::new((420, 320));
        // Nobody listens, nothing to encode
        viewer.publish_overlay(&RgbImage::new(8, 8));

        let mut rx = viewer.subscribe_overlay();
        viewer.publish_overlay(&RgbImage::new(8, 8));

        let item = rx.recv().await.expect("no overlay published");
        assert!(item.starts_with(b"--frame\r\n"));
    }
}
