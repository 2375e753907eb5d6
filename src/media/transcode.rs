//! Voice-note transcoding to Ogg/Opus.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MediaConfig;

/// Errors from a transcoder.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// No usable transcoder binary.
    #[error("transcoder unavailable: {0}")]
    Unavailable(String),

    /// The conversion ran and failed.
    #[error("transcoding failed: {0}")]
    Failed(String),

    /// Filesystem or process I/O failed.
    #[error("transcoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External converter producing voice-note encoded audio.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input` and return the path of the converted file.
    async fn convert(&self, input: &Path) -> Result<PathBuf, TranscodeError>;
}

/// [`Transcoder`] backed by the `ffmpeg` binary with libopus.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
    output_dir: PathBuf,
    bitrate: String,
    sample_rate: u32,
}

impl FfmpegTranscoder {
    /// Transcoder using a known binary, writing into `output_dir`.
    pub fn new(binary: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, config: &MediaConfig) -> Self {
        Self {
            binary: binary.into(),
            output_dir: output_dir.into(),
            bitrate: config.voice_bitrate.clone(),
            sample_rate: config.voice_sample_rate,
        }
    }

    /// Locate ffmpeg (configured path first, then `PATH`).
    ///
    /// Returns `None` when no binary is found; voice notes then only accept
    /// input that is already Ogg/Opus.
    pub fn detect(config: &MediaConfig, output_dir: &Path) -> Option<Self> {
        let binary = match &config.ffmpeg_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if path.is_file() {
                    path
                } else {
                    which::which(&path).ok()?
                }
            }
            None => which::which("ffmpeg").ok()?,
        };
        info!(binary = %binary.display(), "ffmpeg transcoder available");
        Some(Self::new(binary, output_dir, config))
    }

    /// Path of the ffmpeg binary in use.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<std::ffi::OsString> {
        let sample_rate = self.sample_rate.to_string();
        let mut args: Vec<std::ffi::OsString> = vec!["-i".into(), input.into()];
        for arg in [
            "-c:a",
            "libopus",
            "-b:a",
            self.bitrate.as_str(),
            "-ar",
            sample_rate.as_str(),
            "-application",
            "voip",
            "-vbr",
            "on",
            "-compression_level",
            "10",
            "-frame_duration",
            "60",
            "-y",
        ] {
            args.push(arg.into());
        }
        args.push(output.into());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(&self, input: &Path) -> Result<PathBuf, TranscodeError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = self
            .output_dir
            .join(format!("{}.ogg", uuid::Uuid::new_v4()));

        debug!(input = %input.display(), output = %output.display(), "running ffmpeg");
        let result = Command::new(&self.binary)
            .args(self.args(input, &output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscodeError::Unavailable(self.binary.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !out.status.success() {
            // Best effort; a partial output is useless.
            let _ = tokio::fs::remove_file(&output).await;
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(TranscodeError::Failed(format!("{}: {tail}", out.status)));
        }
        Ok(output)
    }
}
