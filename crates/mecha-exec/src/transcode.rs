//! ffmpeg/ffprobe wrappers. Outputs are staged next to their destination
//! and renamed into place only after a zero exit code.

use crate::{ExecError, OutputSink, ProcessRunner};
use mecha_storage::{part_path, with_suffix};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const GIF_FILTER: &str =
    "[0:v] split [a][b];[a] palettegen=stats_mode=diff [p];[b][p] paletteuse=bayer_scale=1";

pub struct Transcoder {
    runner: Arc<dyn ProcessRunner>,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Transcoder {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Re-encodes `input` into `format`, writing `<output>.<format>` and then
    /// renaming it to `output`. Returns the tool's exit code.
    pub async fn convert_format(
        &self,
        input: &Path,
        output: &Path,
        format: &str,
        stdout: Option<&mut OutputSink>,
        stderr: Option<&mut OutputSink>,
    ) -> Result<i32, ExecError> {
        let staged = with_suffix(output, &format!(".{}", format));

        let code = if input == staged {
            debug!("{} is already {}, skipping ffmpeg", input.display(), format);
            0
        } else {
            let args = vec![
                OsString::from("-hide_banner"),
                OsString::from("-y"),
                OsString::from("-i"),
                input.as_os_str().to_owned(),
                staged.as_os_str().to_owned(),
            ];
            self.runner.run(&self.ffmpeg, &args, stdout, stderr).await?
        };

        if code == 0 {
            promote(&staged, output).await?;
        } else {
            discard(&staged).await;
        }
        Ok(code)
    }

    /// Codec name of the first video stream, e.g. `png` or `gif`.
    pub async fn detect_encoding(&self, path: &Path) -> Result<String, ExecError> {
        let args = vec![
            OsString::from("-v"),
            OsString::from("error"),
            OsString::from("-select_streams"),
            OsString::from("v:0"),
            OsString::from("-show_entries"),
            OsString::from("stream=codec_name"),
            OsString::from("-of"),
            OsString::from("default=nokey=1:noprint_wrappers=1"),
            path.as_os_str().to_owned(),
        ];

        let mut captured: Vec<u8> = Vec::new();
        let code = self
            .runner
            .run(&self.ffprobe, &args, Some(&mut captured), None)
            .await?;

        if code != 0 {
            return Err(ExecError::Probe {
                path: path.to_path_buf(),
                reason: format!("ffprobe exited with {}", code),
            });
        }

        let encoding = String::from_utf8_lossy(&captured).trim().to_string();
        if encoding.is_empty() {
            return Err(ExecError::Probe {
                path: path.to_path_buf(),
                reason: "no video stream".to_string(),
            });
        }
        Ok(encoding)
    }

    /// Palette-based GIF encode of a video in a single ffmpeg pass.
    pub async fn video_to_gif(
        &self,
        input: &Path,
        output: &Path,
        stdout: Option<&mut OutputSink>,
        stderr: Option<&mut OutputSink>,
    ) -> Result<i32, ExecError> {
        let staged = part_path(output);
        let args = vec![
            OsString::from("-hide_banner"),
            OsString::from("-y"),
            OsString::from("-i"),
            input.as_os_str().to_owned(),
            OsString::from("-filter_complex"),
            OsString::from(GIF_FILTER),
            OsString::from("-f"),
            OsString::from("gif"),
            staged.as_os_str().to_owned(),
        ];

        let code = self.runner.run(&self.ffmpeg, &args, stdout, stderr).await?;
        if code == 0 {
            promote(&staged, output).await?;
        } else {
            discard(&staged).await;
        }
        Ok(code)
    }
}

async fn promote(staged: &Path, output: &Path) -> Result<(), ExecError> {
    tokio::fs::rename(staged, output).await.map_err(|e| {
        ExecError::io(
            format!("failed to move {} to {}", staged.display(), output.display()),
            e,
        )
    })
}

async fn discard(staged: &Path) {
    match tokio::fs::remove_file(staged).await {
        Ok(()) => debug!("Removed staged output {}", staged.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", staged.display(), e),
    }
}
