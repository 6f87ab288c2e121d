//! One event channel session per connected camera.
//!
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use axum::extract::ws::{Message, WebSocket};
use common::{
    detection::Detection,
    protocol::{ClientMsg, Frame, ServerMsg},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    detector::{DetectError, Detector},
    meter::METER,
};

/// How frames are scheduled when they arrive faster than the model answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InFlightPolicy {
    /// One frame in flight per session, newer frames replace the waiting one.
    #[default]
    Latest,
    /// Every frame is detected on its own task, results go out in completion order.
    Unbounded,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub policy: InFlightPolicy,
    /// Capacity of the queue of messages waiting to be written to the socket.
    pub outgoing_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: InFlightPolicy::default(),
            outgoing_capacity: 32,
        }
    }
}

/// Serve one connected client until it disconnects.
pub async fn run_session(
    socket: WebSocket,
    peer: SocketAddr,
    detector: Arc<Detector>,
    config: SessionConfig,
) {
    log::info!("{}: New client connected", peer);

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(config.outgoing_capacity);
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("{}: Failed to serialize message: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                log::debug!("{}: Failed to send, closing writer: {}", peer, e);
                break;
            }
        }
    });

    let dispatcher = Dispatcher::new(config.policy, detector, out_tx, cancel.clone());

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match ClientMsg::from_json(&text) {
                Ok(ClientMsg::Image(image)) => match image.decode() {
                    Ok(frame) => {
                        METER.tick_received();
                        log::debug!("{}: Frame {} ({} bytes)", peer, frame.seq, frame.jpeg.len());
                        dispatcher.submit(frame);
                    }
                    Err(e) => {
                        METER.tick_failed();
                        log::warn!("{}: Invalid base64 in image event: {}", peer, e);
                    }
                },
                Err(e) => log::warn!("{}: Ignoring malformed message: {}", peer, e),
            },
            Ok(Message::Binary(_)) => log::debug!("{}: Ignoring binary message", peer),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => (),
            Err(e) => {
                log::debug!("{}: Socket error: {}", peer, e);
                break;
            }
        }
    }

    // Abandon pending frames and in-flight detections of this session
    cancel.cancel();
    writer.abort();

    log::info!("{}: Client disconnected", peer);
}

/// Hands frames of one session to the detector according to the in-flight policy.
enum Dispatcher {
    Latest(Arc<Mailbox>),
    Unbounded {
        detector: Arc<Detector>,
        out_tx: mpsc::Sender<ServerMsg>,
        cancel: CancellationToken,
    },
}

impl Dispatcher {
    fn new(
        policy: InFlightPolicy,
        detector: Arc<Detector>,
        out_tx: mpsc::Sender<ServerMsg>,
        cancel: CancellationToken,
    ) -> Self {
        match policy {
            InFlightPolicy::Latest => {
                let mailbox = Arc::new(Mailbox::default());
                tokio::spawn(latest_frame_worker(
                    Arc::clone(&mailbox),
                    detector,
                    out_tx,
                    cancel,
                ));
                Dispatcher::Latest(mailbox)
            }
            InFlightPolicy::Unbounded => Dispatcher::Unbounded {
                detector,
                out_tx,
                cancel,
            },
        }
    }

    fn submit(&self, frame: Frame) {
        match self {
            Dispatcher::Latest(mailbox) => {
                if let Some(replaced) = mailbox.put(frame) {
                    METER.tick_dropped();
                    log::debug!("Frame {} replaced by a newer frame", replaced.seq);
                }
            }
            Dispatcher::Unbounded {
                detector,
                out_tx,
                cancel,
            } => {
                let detector = Arc::clone(detector);
                let out_tx = out_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => (),
                        res = detector.detect(frame.jpeg) => emit(res, frame.seq, &out_tx).await,
                    }
                });
            }
        }
    }
}

/// Single slot holding the newest frame which is not yet being detected.
#[derive(Default)]
struct Mailbox {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
}

impl Mailbox {
    /// Store a frame, returning the waiting frame it replaced.
    fn put(&self, frame: Frame) -> Option<Frame> {
        let replaced = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame);
        self.notify.notify_one();
        replaced
    }

    fn take(&self) -> Option<Frame> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn latest_frame_worker(
    mailbox: Arc<Mailbox>,
    detector: Arc<Detector>,
    out_tx: mpsc::Sender<ServerMsg>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = mailbox.notify.notified() => (),
        }

        let Some(frame) = mailbox.take() else {
            continue;
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Abandoning detection of frame {}", frame.seq);
                break;
            }
            res = detector.detect(frame.jpeg) => emit(res, frame.seq, &out_tx).await,
        }
    }
}

async fn emit(
    res: Result<Vec<Detection>, DetectError>,
    seq: u64,
    out_tx: &mpsc::Sender<ServerMsg>,
) {
    match res {
        Ok(detections) => {
            METER.tick_inferred();
            log::debug!("Frame {}: {} detections", seq, detections.len());
            if out_tx
                .send(ServerMsg::predictions(seq, detections))
                .await
                .is_err()
            {
                log::debug!("Session closed, discarding predictions of frame {}", seq);
            }
        }
        Err(DetectError::NotReady) => {
            METER.tick_dropped();
            log::debug!("Model not ready, dropping frame {}", seq);
        }
        Err(e) => {
            METER.tick_failed();
            log::warn!("Detection of frame {} failed: {}", seq, e);
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_mailbox_keeps_latest_frame() {
        let mailbox = Mailbox::default();

        assert_eq!(mailbox.put(Frame::new(1, vec![1])), None);
        let replaced = mailbox.put(Frame::new(2, vec![2]));

        assert_eq!(replaced.map(|f| f.seq), Some(1));
        assert_eq!(mailbox.take().map(|f| f.seq), Some(2));
        assert_eq!(mailbox.take(), None);
    }

    #[tokio::test]
    async fn test_mailbox_wakes_worker_put_before_wait() {
        let mailbox = Mailbox::default();
        mailbox.put(Frame::new(5, vec![5]));

        // The permit stored by `put` must not be lost
        tokio::time::timeout(std::time::Duration::from_secs(1), mailbox.notify.notified())
            .await
            .expect("notification lost");
        assert_eq!(mailbox.take().map(|f| f.seq), Some(5));
    }
}
