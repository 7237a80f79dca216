// Helper functions shared by the engine adapter and the service

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Duration as TokioDuration, Instant};
use tracing::debug;

use super::errors::{EngineFailure, EngineFailureKind};

/// Which pipe a line of child output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Run a command with a deadline, handing every output line to `on_line`
/// in arrival order.
///
/// The child is killed when the deadline passes or when the returned future
/// is dropped.
pub async fn run_streaming_with_timeout<F>(
    program: &str,
    args: &[String],
    timeout_secs: u64,
    mut on_line: F,
) -> Result<ExitStatus, EngineFailure>
where
    F: FnMut(Stream, String),
{
    debug!(program, ?args, "spawning");

    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineFailure::tool_not_found(program, &e))?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| EngineFailure::parse(format!("Failed to capture stdout from {}", program)))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| EngineFailure::parse(format!("Failed to capture stderr from {}", program)))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stdout_task = tokio::spawn(forward_lines(stdout_pipe, Stream::Stdout, tx.clone()));
    let stderr_task = tokio::spawn(forward_lines(stderr_pipe, Stream::Stderr, tx));

    let deadline = Instant::now() + TokioDuration::from_secs(timeout_secs);
    let interrupted = || {
        EngineFailure::new(
            EngineFailureKind::Interrupted,
            format!("Timed out after {}s", timeout_secs),
        )
    };

    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((stream, line))) => on_line(stream, line),
            // both pipes closed
            Ok(None) => break,
            Err(_) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(interrupted());
            }
        }
    }

    match timeout_at(deadline, child.wait()).await {
        Ok(status) => status.map_err(|e| {
            EngineFailure::new(
                EngineFailureKind::Other,
                format!("Failed to wait for {}: {}", program, e),
            )
        }),
        Err(_) => {
            let _ = child.kill().await;
            Err(interrupted())
        }
    }
}

async fn forward_lines<R>(pipe: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).is_err() {
            break;
        }
    }
}

/// MIME type for a served artifact, by extension
pub fn mime_type_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "opus" | "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "vtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
