//! Child-process transport.
//!
//! The backend is started with piped stdio. Commands are written to its
//! stdin as JSON lines, events are read from its stdout, and anything it
//! prints on stderr is forwarded to the log at debug level.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::Endpoint;
use crate::config::BackendConfig;
use crate::errors::TransportError;
use crate::protocol::{self, ClientMessage, ServerMessage};

/// Owns the backend child and its I/O tasks.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl ProcessHandle {
    /// Wait for the backend to exit and stop the I/O tasks.
    ///
    /// The backend sees end of input once the outbound queue has ended and
    /// the writer has flushed everything queued before that. A backend still
    /// running after the grace period is killed.
    #[instrument(skip(self), fields(pid = ?self.child.id()))]
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        let status = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(grace = ?self.grace, "backend still running, killing it");
                self.child.start_kill()?;
                self.child.wait().await?
            }
        };
        info!(%status, "backend process exited");
        for task in self.tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Start the backend described by `config`.
#[instrument(skip(config), fields(command = %config.command))]
pub fn spawn(config: &BackendConfig) -> Result<(Endpoint, ProcessHandle), TransportError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| TransportError::SpawnFailed {
        command: config.command.clone(),
        source,
    })?;
    info!(pid = ?child.id(), args = ?config.args, "spawned backend process");

    let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(TransportError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(TransportError::MissingPipe("stderr"))?;

    let (outbound, commands) = mpsc::unbounded_channel();
    let (events, inbound) = mpsc::unbounded_channel();

    let tasks = vec![
        tokio::spawn(write_commands(stdin, commands)),
        tokio::spawn(read_events(stdout, events)),
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "reposcope::backend", "{}", line);
            }
        }),
    ];

    let handle = ProcessHandle {
        child,
        tasks,
        grace: config.shutdown_grace(),
    };
    Ok((Endpoint { outbound, inbound }, handle))
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<ClientMessage>) {
    while let Some(message) = commands.recv().await {
        let mut line = match protocol::encode(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, ?message, "failed to encode command");
                continue;
            }
        };
        line.push('\n');
        trace!(%line, "writing command");
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "backend stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "failed to flush backend stdin");
            break;
        }
    }
    debug!("command writer finished");
}

async fn read_events(stdout: ChildStdout, events: mpsc::UnboundedSender<ServerMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match protocol::decode::<ServerMessage>(&line) {
                Ok(message) => {
                    if events.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, %line, "ignoring malformed backend line"),
            },
            Ok(None) => {
                debug!("backend closed stdout");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read backend stdout");
                break;
            }
        }
    }
}
