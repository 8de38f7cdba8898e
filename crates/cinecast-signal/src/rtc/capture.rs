use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::capture::MediaCapture;
use crate::error::CaptureError;
use crate::types::{LocalTrack, MediaKind};

const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);
const STREAM_ID: &str = "cinecast";

/// Publishes VP8 or VP9 IVF files as a looping video track.
///
/// There is no portable camera API to build on, so camera acquisition reports
/// [`CaptureError::Unavailable`].
#[derive(Default)]
pub struct IvfFileCapture {
    next_id: AtomicU64,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl IvfFileCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn pumps(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.pumps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl MediaCapture for IvfFileCapture {
    async fn acquire_camera_tracks(&self) -> Result<Vec<LocalTrack>, CaptureError> {
        Err(CaptureError::Unavailable(
            "camera capture is not supported; publish from a file instead".into(),
        ))
    }

    async fn acquire_file_tracks(&self, path: &Path) -> Result<Vec<LocalTrack>, CaptureError> {
        let (_, header) = open_ivf(path)?;
        let mime_type = match &header.four_cc {
            b"VP80" => MIME_TYPE_VP8,
            b"VP90" => MIME_TYPE_VP9,
            other => {
                return Err(CaptureError::File {
                    path: path.to_path_buf(),
                    reason: format!(
                        "unsupported codec {:?}, expected VP8 or VP9",
                        String::from_utf8_lossy(other)
                    ),
                });
            }
        };

        let frame_duration = frame_duration(&header);
        let id = format!("file-video-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            STREAM_ID.to_owned(),
        ));

        let pump = tokio::spawn(pump_ivf(
            path.to_path_buf(),
            track.clone(),
            frame_duration,
        ));
        self.pumps().insert(id.clone(), pump);
        info!(
            "Opened {} ({}x{}, {:?} per frame)",
            path.display(),
            header.width,
            header.height,
            frame_duration
        );

        Ok(vec![LocalTrack::new(id, MediaKind::Video, track)])
    }

    fn release(&self, tracks: &[LocalTrack]) {
        let mut pumps = self.pumps();
        for track in tracks {
            if let Some(pump) = pumps.remove(&track.id) {
                pump.abort();
                debug!("Stopped file pump for {}", track.id);
            }
        }
    }
}

impl Drop for IvfFileCapture {
    fn drop(&mut self) {
        for (_, pump) in self.pumps().drain() {
            pump.abort();
        }
    }
}

fn open_ivf(path: &Path) -> Result<(IVFReader<BufReader<File>>, IVFFileHeader), CaptureError> {
    let file_error = |reason: String| CaptureError::File {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| file_error(e.to_string()))?;
    IVFReader::new(BufReader::new(file)).map_err(|e| file_error(e.to_string()))
}

fn frame_duration(header: &IVFFileHeader) -> Duration {
    if header.timebase_numerator == 0 || header.timebase_denominator == 0 {
        return DEFAULT_FRAME_DURATION;
    }
    let millis =
        1000 * u64::from(header.timebase_numerator) / u64::from(header.timebase_denominator);
    if millis == 0 {
        DEFAULT_FRAME_DURATION
    } else {
        Duration::from_millis(millis)
    }
}

async fn pump_ivf(path: PathBuf, track: Arc<TrackLocalStaticSample>, frame_duration: Duration) {
    let mut ticker = tokio::time::interval(frame_duration);
    loop {
        let mut reader = match open_ivf(&path) {
            Ok((reader, _)) => reader,
            Err(e) => {
                warn!("Stopping file source: {}", e);
                return;
            }
        };

        let mut frames = 0u64;
        while let Ok((frame, _)) = reader.parse_next_frame() {
            ticker.tick().await;
            let data: Bytes = frame.freeze();
            if let Err(e) = track
                .write_sample(&Sample {
                    data,
                    duration: frame_duration,
                    ..Default::default()
                })
                .await
            {
                debug!("Dropped frame: {}", e);
            }
            frames += 1;
        }

        if frames == 0 {
            warn!("{} contains no frames", path.display());
            return;
        }
        debug!("Looping {} after {} frames", path.display(), frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture;
    use crate::types::SourceConfig;
    use std::io::Write;

    fn ivf_header(four_cc: &[u8; 4], num: u32, den: u32) -> Vec<u8> {
        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(b"DKIF");
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&32u16.to_le_bytes());
        header.extend_from_slice(four_cc);
        header.extend_from_slice(&640u16.to_le_bytes());
        header.extend_from_slice(&480u16.to_le_bytes());
        header.extend_from_slice(&den.to_le_bytes());
        header.extend_from_slice(&num.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header
    }

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("cinecast-{}-{}", std::process::id(), name));
        let mut file = File::create(&path).expect("create");
        file.write_all(bytes).expect("write");
        path
    }

    #[tokio::test]
    async fn test_camera_is_unavailable() {
        let capture = IvfFileCapture::new();
        let result = capture::acquire(&capture, &SourceConfig::Camera).await;
        assert!(matches!(result, Err(CaptureError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_reported() {
        let capture = IvfFileCapture::new();
        let result = capture
            .acquire_file_tracks(Path::new("/nonexistent/cinecast.ivf"))
            .await;
        assert!(matches!(result, Err(CaptureError::File { .. })));
    }

    #[tokio::test]
    async fn test_non_vp8_file_is_rejected() {
        let path = write_temp("h264.ivf", &ivf_header(b"H264", 1, 30));
        let capture = IvfFileCapture::new();
        let result = capture.acquire_file_tracks(&path).await;
        assert!(matches!(result, Err(CaptureError::File { .. })));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_vp8_file_yields_video_track_until_released() {
        let path = write_temp("vp8.ivf", &ivf_header(b"VP80", 1, 30));
        let capture = IvfFileCapture::new();
        let tracks = capture.acquire_file_tracks(&path).await.expect("tracks");

        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind, MediaKind::Video);
        assert!(tracks[0].handle.clone().downcast::<TrackLocalStaticSample>().is_ok());
        assert_eq!(capture.pumps().len(), 1);

        capture.release(&tracks);
        assert!(capture.pumps().is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_frame_duration_from_timebase() {
        let header = |num, den| IVFFileHeader {
            timebase_numerator: num,
            timebase_denominator: den,
            ..Default::default()
        };
        assert_eq!(frame_duration(&header(1, 30)), Duration::from_millis(33));
        assert_eq!(frame_duration(&header(1, 0)), DEFAULT_FRAME_DURATION);
        assert_eq!(frame_duration(&header(1, 90_000)), DEFAULT_FRAME_DURATION);
    }
}
