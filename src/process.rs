//! Supervision of worker processes spawned for remote runners.
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A running worker. Stdin and stdout belong to the protocol, stderr is
/// forwarded line by line into our own log.
#[derive(Debug)]
pub struct WorkerProcess {
    name: String,
    child: Child,
}

impl WorkerProcess {
    /// Spawn `entrypoint` (program followed by whitespace separated arguments).
    pub fn spawn(
        name: impl Into<String>,
        entrypoint: &str,
        directory: Option<&Path>,
    ) -> io::Result<(Self, ChildStdin, ChildStdout)> {
        let name = name.into();
        let mut parts = entrypoint.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty entrypoint"))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout unavailable"))?;

        if let Some(stderr) = child.stderr.take() {
            let worker = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "rdfc::worker", %worker, "{line}");
                }
            });
        }

        info!(worker = %name, pid = ?child.id(), program, "worker started");
        Ok((Self { name, child }, stdin, stdout))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait up to `grace` for the worker to exit on its own, then kill it.
    pub async fn terminate(mut self, grace: Duration) {
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(worker = %self.name, %status, "worker exited"),
            Ok(Err(e)) => warn!(worker = %self.name, "waiting for worker failed: {e}"),
            Err(_) => {
                warn!(worker = %self.name, ?grace, "worker did not exit, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(worker = %self.name, "kill failed: {e}");
                }
            }
        }
    }
}
