//! Camera side of the detection demo: capture, transport and overlay.
pub mod capture;
pub mod client;
pub mod overlay;
pub mod sensors;
pub mod viewer;

/// Error type.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
