//! `webrtc-rs` implementations of the media engine and capture capabilities.

pub mod capture;
pub mod engine;

pub use capture::IvfFileCapture;
pub use engine::{WebRtcEngine, WebRtcSession};
