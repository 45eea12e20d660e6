//! Media probing used by the verifier and the master-manifest builder.
//!
//! The `ffprobe` back end shells out with
//! `-print_format json -show_format -show_streams` and reads duration and the
//! first video stream's resolution from the JSON.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status:?}: {stderr}")]
    Failed {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("unparseable probe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("probe output carries no duration")]
    MissingDuration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub duration_secs: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Probes a media URL (usually a signed playlist URL).
    async fn probe(&self, url: &str) -> Result<ProbeResult, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let tool = self.ffprobe_path.display().to_string();
        debug!(tool = %tool, "Probing media");

        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                tool,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_ffprobe_output(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

pub fn parse_ffprobe_output(stdout: &[u8]) -> Result<ProbeResult, ProbeError> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;

    let duration_secs = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| parsed.streams.iter().find_map(|s| s.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or(ProbeError::MissingDuration)?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    Ok(ProbeResult {
        duration_secs,
        width: video.and_then(|v| v.width),
        height: video.and_then(|v| v.height),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_duration_and_video_resolution() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio", "duration": "120.1"},
                {"codec_type": "video", "width": 1280, "height": 720}
            ],
            "format": {"duration": "120.400000"}
        }"#;
        let result = parse_ffprobe_output(json).unwrap();
        assert!((result.duration_secs - 120.4).abs() < f64::EPSILON);
        assert_eq!(result.width, Some(1280));
        assert_eq!(result.height, Some(720));
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = br#"{"streams": [{"codec_type": "video", "duration": "10.5"}]}"#;
        let result = parse_ffprobe_output(json).unwrap();
        assert_eq!(result.duration_secs, 10.5);
        assert_eq!(result.width, None);
    }

    #[test]
    fn missing_duration_is_an_error() {
        let json = br#"{"streams": [], "format": {}}"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::MissingDuration)
        ));
    }
}
