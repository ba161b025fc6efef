//! MPEG-DASH packaging through FFmpeg.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info};

use crate::command::{wait_cancelled, FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::fs_utils::reset_dir;

/// Manifest file written inside the output directory.
pub const DEFAULT_MANIFEST_NAME: &str = "output.mpd";

/// Histogram of FFmpeg wall time per conversion.
pub const FFMPEG_DURATION_SECONDS: &str = "vconv_ffmpeg_duration_seconds";

/// Converts a merged media file into a streaming package.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Package `input` into `output_dir` and return the manifest path.
    ///
    /// Implementations must stop early once `cancel` is raised.
    async fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf>;
}

/// DASH packaging settings.
#[derive(Debug, Clone)]
pub struct DashConfig {
    /// FFmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Manifest file name inside the output directory
    pub manifest_name: String,
    /// Video codec override (FFmpeg picks one when unset)
    pub video_codec: Option<String>,
    /// Audio codec override
    pub audio_codec: Option<String>,
    /// Target segment length in seconds
    pub segment_seconds: Option<u32>,
    /// Extra output arguments appended before the manifest path
    pub extra_args: Vec<String>,
    /// Hard limit for a single FFmpeg run
    pub timeout_secs: Option<u64>,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            video_codec: None,
            audio_codec: None,
            segment_seconds: None,
            extra_args: Vec::new(),
            timeout_secs: None,
        }
    }
}

impl DashConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        Self {
            ffmpeg_path: non_empty("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            manifest_name: non_empty("DASH_MANIFEST_NAME")
                .unwrap_or_else(|| DEFAULT_MANIFEST_NAME.to_string()),
            video_codec: non_empty("DASH_VIDEO_CODEC"),
            audio_codec: non_empty("DASH_AUDIO_CODEC"),
            segment_seconds: non_empty("DASH_SEGMENT_SECONDS").and_then(|s| s.parse().ok()),
            extra_args: non_empty("DASH_EXTRA_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            timeout_secs: non_empty("FFMPEG_TIMEOUT_SECS").and_then(|s| s.parse().ok()),
        }
    }
}

/// [`Transcoder`] that shells out to FFmpeg's `dash` muxer.
#[derive(Debug, Clone)]
pub struct FfmpegDashTranscoder {
    config: DashConfig,
    process_limit: Option<Arc<Semaphore>>,
}

impl FfmpegDashTranscoder {
    pub fn new(config: DashConfig) -> Self {
        Self {
            config,
            process_limit: None,
        }
    }

    /// Share a cap on concurrently running FFmpeg processes.
    pub fn with_process_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.process_limit = Some(limit);
        self
    }

    pub fn config(&self) -> &DashConfig {
        &self.config
    }

    /// Build the FFmpeg invocation writing `manifest`.
    pub fn build_command(&self, input: &Path, manifest: &Path) -> FfmpegCommand {
        let mut cmd = FfmpegCommand::new(input, manifest);

        if let Some(codec) = &self.config.video_codec {
            cmd = cmd.video_codec(codec.clone());
        }
        if let Some(codec) = &self.config.audio_codec {
            cmd = cmd.audio_codec(codec.clone());
        }
        if let Some(seconds) = self.config.segment_seconds {
            cmd = cmd.output_arg("-seg_duration").output_arg(seconds.to_string());
        }

        cmd.output_args(self.config.extra_args.iter().cloned()).format("dash")
    }
}

#[async_trait]
impl Transcoder for FfmpegDashTranscoder {
    async fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        reset_dir(output_dir).await?;

        let manifest = output_dir.join(&self.config.manifest_name);
        let cmd = self.build_command(input, &manifest);

        let _permit = match &self.process_limit {
            Some(limit) => {
                let acquire = Arc::clone(limit).acquire_owned();
                tokio::select! {
                    permit = acquire => Some(permit.map_err(|_| MediaError::Cancelled)?),
                    _ = wait_cancelled(Some(cancel.clone())) => return Err(MediaError::Cancelled),
                }
            }
            None => None,
        };

        let mut runner = FfmpegRunner::new()
            .with_program(&self.config.ffmpeg_path)
            .with_cancel(cancel);
        if let Some(secs) = self.config.timeout_secs {
            runner = runner.with_timeout(secs);
        }

        info!(
            input = %input.display(),
            output = %output_dir.display(),
            "Converting video to mpeg-dash"
        );

        let started = Instant::now();
        runner
            .run_with_progress(&cmd, |progress| {
                debug!(
                    frame = progress.frame,
                    out_time = %progress.out_time,
                    speed = progress.speed,
                    "Transcode progress"
                );
            })
            .await?;
        histogram!(FFMPEG_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            return Err(MediaError::ManifestMissing(manifest));
        }

        info!(manifest = %manifest.display(), "Video converted to mpeg-dash");
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_defaults() {
        let transcoder = FfmpegDashTranscoder::new(DashConfig::default());
        let args = transcoder
            .build_command(Path::new("/media/1/merged.mp4"), Path::new("/media/1/mpeg-dash/output.mpd"))
            .build_args();

        assert!(args.windows(2).any(|w| w == ["-i", "/media/1/merged.mp4"]));
        assert!(args.windows(2).any(|w| w == ["-f", "dash"]));
        assert!(!args.contains(&"-c:v".to_string()));
        assert_eq!(args.last().unwrap(), "/media/1/mpeg-dash/output.mpd");
    }

    #[test]
    fn test_build_command_with_overrides() {
        let transcoder = FfmpegDashTranscoder::new(DashConfig {
            video_codec: Some("libx264".to_string()),
            audio_codec: Some("aac".to_string()),
            segment_seconds: Some(4),
            extra_args: vec!["-use_template".to_string(), "1".to_string()],
            ..Default::default()
        });
        let args = transcoder
            .build_command(Path::new("in.mp4"), Path::new("out/output.mpd"))
            .build_args();

        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "aac"]));
        assert!(args.windows(2).any(|w| w == ["-seg_duration", "4"]));
        assert!(args.windows(2).any(|w| w == ["-use_template", "1"]));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn fake_ffmpeg(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn transcoder(ffmpeg_path: PathBuf) -> FfmpegDashTranscoder {
            FfmpegDashTranscoder::new(DashConfig {
                ffmpeg_path,
                ..Default::default()
            })
            .with_process_limit(Arc::new(Semaphore::new(1)))
        }

        #[tokio::test]
        async fn test_convert_returns_manifest() {
            let dir = TempDir::new().unwrap();
            // The manifest path is the last argument
            let script = fake_ffmpeg(&dir, "for last; do :; done\necho '<MPD/>' > \"$last\"");
            let output_dir = dir.path().join("mpeg-dash");
            std::fs::create_dir_all(&output_dir).unwrap();
            std::fs::write(output_dir.join("stale.m4s"), b"old").unwrap();
            let (_tx, rx) = watch::channel(false);

            let manifest = transcoder(script)
                .convert(&dir.path().join("merged.mp4"), &output_dir, rx)
                .await
                .unwrap();

            assert_eq!(manifest, output_dir.join("output.mpd"));
            assert!(manifest.exists());
            assert!(!output_dir.join("stale.m4s").exists());
        }

        #[tokio::test]
        async fn test_missing_manifest_is_failure() {
            let dir = TempDir::new().unwrap();
            let script = fake_ffmpeg(&dir, "exit 0");
            let (_tx, rx) = watch::channel(false);

            let err = transcoder(script)
                .convert(&dir.path().join("merged.mp4"), &dir.path().join("mpeg-dash"), rx)
                .await
                .unwrap_err();

            assert!(matches!(err, MediaError::ManifestMissing(_)));
        }

        #[tokio::test]
        async fn test_non_zero_exit_carries_output() {
            let dir = TempDir::new().unwrap();
            let script = fake_ffmpeg(&dir, "echo 'moov atom not found' >&2\nexit 1");
            let (_tx, rx) = watch::channel(false);

            let err = transcoder(script)
                .convert(&dir.path().join("merged.mp4"), &dir.path().join("mpeg-dash"), rx)
                .await
                .unwrap_err();

            assert_eq!(err.captured_output(), Some("moov atom not found"));
            assert!(dir.path().join("mpeg-dash").is_dir());
        }

        #[tokio::test]
        async fn test_non_utf8_output_does_not_break_conversion() {
            let dir = TempDir::new().unwrap();
            let script = fake_ffmpeg(
                &dir,
                "printf 'Input #0 from \\377\\376\\n' >&2\n\
                 i=0; while [ $i -lt 200 ]; do echo \"frame=$i\" >&2; i=$((i+1)); done\n\
                 for last; do :; done\necho '<MPD/>' > \"$last\"",
            );
            let (_tx, rx) = watch::channel(false);

            let manifest = transcoder(script)
                .convert(&dir.path().join("merged.mp4"), &dir.path().join("mpeg-dash"), rx)
                .await
                .unwrap();

            assert!(manifest.exists());
        }

        #[tokio::test]
        async fn test_output_after_non_utf8_line_is_captured() {
            let dir = TempDir::new().unwrap();
            let script = fake_ffmpeg(
                &dir,
                "printf 'Input #0 from \\377\\376\\n' >&2\necho 'Invalid data found' >&2\nexit 1",
            );
            let (_tx, rx) = watch::channel(false);

            let err = transcoder(script)
                .convert(&dir.path().join("merged.mp4"), &dir.path().join("mpeg-dash"), rx)
                .await
                .unwrap_err();

            let output = err.captured_output().unwrap();
            assert!(output.starts_with("Input #0 from"));
            assert!(output.ends_with("Invalid data found"));
        }
    }
}
