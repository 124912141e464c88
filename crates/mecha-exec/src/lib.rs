//! Mechafoord Exec
//!
//! Single chokepoint for external tool invocations (ffmpeg, ffprobe).
//! Every run closes stdin and routes stdout/stderr into optional sinks,
//! usually per-run log files created by [`ToolLogs`].

pub mod transcode;

pub use transcode::Transcoder;

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

static NEXT_LOG_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Writable destination for a child's output stream.
pub type OutputSink = dyn AsyncWrite + Unpin + Send;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("could not detect encoding of {path}: {reason}")]
    Probe { path: PathBuf, reason: String },
}

impl ExecError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `program` to completion and returns its exit code. Streams
    /// without a sink are discarded.
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        stdout: Option<&mut OutputSink>,
        stderr: Option<&mut OutputSink>,
    ) -> Result<i32, ExecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        stdout: Option<&mut OutputSink>,
        stderr: Option<&mut OutputSink>,
    ) -> Result<i32, ExecError> {
        debug!(
            "Running {} {}",
            program.display(),
            join_for_display(args)
        );

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(piped_if(stdout.is_some()))
            .stderr(piped_if(stderr.is_some()))
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        let child_out = child.stdout.take();
        let child_err = child.stderr.take();

        let (out_res, err_res, status) = tokio::join!(
            pump(child_out, stdout),
            pump(child_err, stderr),
            child.wait()
        );

        let status = status.map_err(|e| ExecError::io("failed to wait for child", e))?;
        out_res.map_err(|e| ExecError::io("failed to copy stdout", e))?;
        err_res.map_err(|e| ExecError::io("failed to copy stderr", e))?;

        let code = status.code().unwrap_or(-1);
        debug!("{} exited with {}", program.display(), code);
        Ok(code)
    }
}

fn piped_if(wanted: bool) -> Stdio {
    if wanted {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

async fn pump<R>(source: Option<R>, sink: Option<&mut OutputSink>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if let (Some(mut source), Some(sink)) = (source, sink) {
        tokio::io::copy(&mut source, &mut *sink).await?;
        sink.flush().await?;
    }
    Ok(())
}

fn join_for_display(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-run stdout/stderr log files for one tool invocation.
pub struct ToolLogs {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    stdout: File,
    stderr: File,
}

impl ToolLogs {
    /// Creates `<timestamp>-<n>_<tool>_out.txt` and `_err.txt` in `dir`.
    pub async fn open(dir: &Path, tool: &str) -> Result<Self, ExecError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ExecError::io(format!("failed to create {}", dir.display()), e))?;

        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let n = NEXT_LOG_COUNTER.fetch_add(1, Ordering::Relaxed);
        let base = format!("{}-{}_{}", stamp, n, tool);

        let stdout_path = dir.join(format!("{}_out.txt", base));
        let stderr_path = dir.join(format!("{}_err.txt", base));
        let stdout = create_log(&stdout_path).await?;
        let stderr = create_log(&stderr_path).await?;

        Ok(Self {
            stdout_path,
            stderr_path,
            stdout,
            stderr,
        })
    }

    pub fn sinks(&mut self) -> (Option<&mut OutputSink>, Option<&mut OutputSink>) {
        (Some(&mut self.stdout), Some(&mut self.stderr))
    }
}

async fn create_log(path: &Path) -> Result<File, ExecError> {
    File::create(path)
        .await
        .map_err(|e| ExecError::io(format!("failed to create {}", path.display()), e))
}

/// Last `max_chars` characters of a log file, empty when unreadable.
pub async fn tail(path: &Path, max_chars: usize) -> String {
    let Ok(mut file) = File::open(path).await else {
        return String::new();
    };
    let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    // Four bytes per char covers any UTF-8 sequence.
    let window = (max_chars as u64).saturating_mul(4);
    if len > window && file.seek(std::io::SeekFrom::Start(len - window)).await.is_err() {
        return String::new();
    }

    let mut raw = Vec::new();
    if file.read_to_end(&mut raw).await.is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&raw);
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
