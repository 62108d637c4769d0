//! Run a child process while streaming its combined output.
//!
//! stdout and stderr are pumped into one buffer in arrival order and handed
//! to a callback after every chunk. The process is killed on timeout or
//! cancellation.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    Exited(Option<i32>),
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub output: String,
    pub end: ProcessEnd,
}

fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Spawn `command` and wait for it, reporting output as it arrives.
///
/// `timeout` of `None` waits indefinitely (cancellation still applies).
pub async fn run_streaming(
    mut command: Command,
    timeout: Option<Duration>,
    abort: &CancellationToken,
    mut on_output: impl FnMut(&str),
) -> std::io::Result<ProcessOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(out) = child.stdout.take() {
        pump(out, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        pump(err, tx.clone());
    }
    drop(tx);

    let deadline = tokio::time::sleep(timeout.unwrap_or(Duration::from_secs(365 * 24 * 3600)));
    tokio::pin!(deadline);

    let mut bytes = Vec::new();
    let mut streams_open = true;
    let end = loop {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some(chunk) => {
                    bytes.extend_from_slice(&chunk);
                    on_output(&String::from_utf8_lossy(&bytes));
                }
                None => streams_open = false,
            },
            status = child.wait(), if !streams_open => {
                break ProcessEnd::Exited(status.ok().and_then(|s| s.code()));
            }
            _ = &mut deadline, if timeout.is_some() => break ProcessEnd::TimedOut,
            _ = abort.cancelled() => break ProcessEnd::Aborted,
        }
    };

    if !matches!(end, ProcessEnd::Exited(_)) {
        debug!(?end, "Killing child process");
        let _ = child.kill().await;
        while let Ok(chunk) = rx.try_recv() {
            bytes.extend_from_slice(&chunk);
        }
    }

    Ok(ProcessOutcome {
        output: String::from_utf8_lossy(&bytes).to_string(),
        end,
    })
}

/// A `sh -c` (or `cmd /C`) command for a command line.
pub fn shell_command(command_line: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command_line]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command_line]);
        cmd
    }
}
