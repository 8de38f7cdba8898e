//! Capture capability used to source a publisher's tracks.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::error::CaptureError;
use crate::types::{LocalTrack, SourceConfig};

#[async_trait]
pub trait MediaCapture: Send + Sync + 'static {
    async fn acquire_camera_tracks(&self) -> Result<Vec<LocalTrack>, CaptureError>;

    async fn acquire_file_tracks(&self, path: &Path) -> Result<Vec<LocalTrack>, CaptureError>;

    /// Stops producing media for `tracks`. Called once per acquisition.
    fn release(&self, tracks: &[LocalTrack]);
}

/// Acquires tracks for `source`; an empty acquisition is an error.
pub async fn acquire(
    capture: &dyn MediaCapture,
    source: &SourceConfig,
) -> Result<Vec<LocalTrack>, CaptureError> {
    let tracks = match source {
        SourceConfig::Camera => capture.acquire_camera_tracks().await?,
        SourceConfig::File(path) => capture.acquire_file_tracks(path).await?,
    };
    if tracks.is_empty() {
        return Err(CaptureError::NoTracks);
    }
    info!("Acquired {} local track(s) from {:?}", tracks.len(), source.kind());
    Ok(tracks)
}
