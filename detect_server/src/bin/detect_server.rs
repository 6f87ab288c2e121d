//! Detect server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    detector::{DetectConfig, Detector},
    meter::spawn_meter_logger,
    nn::{DetectModel, YoloModel},
    server::{app, serve, ServerConfig},
    session::{InFlightPolicy, SessionConfig},
    utils::resolve_model_path,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to listen on
    #[clap(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[clap(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Origins allowed to open the event channel, `*` allows any
    #[clap(long = "allowed-origin", default_value = "http://localhost:3006")]
    allowed_origins: Vec<String>,

    /// Path of the YOLO ONNX model
    #[clap(long, env = "DETECT_MODEL")]
    model: Option<PathBuf>,

    /// URL to download the model from if it is not available locally
    #[clap(long, env = "DETECT_MODEL_URL")]
    model_url: Option<String>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640)]
    input_size: u32,

    /// Maximum overlap of two boxes of the same class
    #[clap(long, default_value_t = 0.45)]
    max_iou: f32,

    /// Detections with a lower score are excluded
    #[clap(long, default_value_t = 0.5)]
    score_threshold: f32,

    /// Maximum number of detections per frame
    #[clap(long, default_value_t = 20)]
    max_detections: usize,

    /// Number of frames running through the model at the same time
    #[clap(long, default_value_t = 2)]
    max_concurrent: usize,

    /// Scheduling of frames arriving while a detection is running
    #[clap(long, value_enum, default_value_t = InFlightPolicy::Latest)]
    policy: InFlightPolicy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let detector = Arc::new(Detector::new(DetectConfig {
        score_threshold: args.score_threshold,
        max_detections: args.max_detections,
        max_concurrent: args.max_concurrent,
    }));

    // Load the model in the background, frames are rejected until it is ready
    {
        let (model, model_url) = (args.model.clone(), args.model_url.clone());
        let (input_size, max_iou) = (args.input_size, args.max_iou);
        detector.spawn_load(async move {
            let path = resolve_model_path(model.as_deref(), model_url.as_deref()).await?;
            log::info!("Using model {}", path.display());
            let model =
                tokio::task::spawn_blocking(move || YoloModel::load(path, input_size, max_iou))
                    .await??;
            Ok(Arc::new(model) as Arc<dyn DetectModel>)
        });
    }

    spawn_meter_logger();

    let config = ServerConfig {
        allowed_origins: args.allowed_origins,
        session: SessionConfig {
            policy: args.policy,
            ..Default::default()
        },
    };

    // Serve HTTP server
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = std::net::TcpListener::bind(addr)?;
    log::info!("Server is running on http://{}", listener.local_addr()?);
    serve(listener, app(detector, config)).await?;

    Ok(())
}
