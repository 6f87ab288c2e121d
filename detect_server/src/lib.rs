pub mod detector;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod server;
pub mod session;
pub mod utils;
