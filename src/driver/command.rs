//! Cancellable `VBoxManage` invocation.
//!
//! Output is drained on reader threads while the child is polled, so a
//! chatty command cannot block on a full pipe and a cancelled build does not
//! leave an orphaned process behind.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::DriverError;
use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stderr marker VBoxManage prints for failures, sometimes with exit code 0.
pub const ERROR_SIGNATURE: &str = "VBoxManage: error:";

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Handle on a resolved `VBoxManage` binary.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    path: PathBuf,
    cancel: CancelToken,
}

impl VBoxManage {
    pub fn new(path: PathBuf, cancel: CancelToken) -> Self {
        Self { path, cancel }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `VBoxManage` with `args` and wait for it to exit.
    ///
    /// A command started while the build is already cancelled is cleanup
    /// work and runs to completion. Otherwise cancellation kills the child.
    pub fn run(&self, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let command = format!("{} {}", self.path.display(), args.join(" "));
        let killable = !self.cancel.is_cancelled();
        log::debug!("Executing: {}", command);

        let mut child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if killable && self.cancel.is_cancelled() {
                log::info!("Cancellation requested, killing: {}", command);
                let _ = child.kill();
                let _ = child.wait();
                // Grandchildren may still hold the pipes; leave the readers detached.
                drop((stdout, stderr));
                return Err(DriverError::Cancelled { command });
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    let _ = child.kill();
                    return Err(DriverError::Spawn { command, source });
                }
            }
        };

        let output = CommandOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        log::trace!("stdout: {}", output.stdout.trim());
        log::trace!("stderr: {}", output.stderr.trim());

        if !status.success() || output.stderr.contains(ERROR_SIGNATURE) {
            return Err(DriverError::CommandFailed {
                command,
                status: status.to_string(),
                stdout: output.stdout.trim().to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
