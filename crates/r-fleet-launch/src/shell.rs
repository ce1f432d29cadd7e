//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Remote executor running the staged install script through a local shell."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, warn};

use crate::drivers::{DriverError, ExecOutcome, RemoteExecutor, RemoteInvocation};

pub const ENV_NODE_ADDRESS: &str = "FLEET_NODE_ADDRESS";
pub const ENV_SSH_USER: &str = "FLEET_SSH_USER";
pub const ENV_SSH_IDENTITY: &str = "FLEET_SSH_IDENTITY";

/// Runs the staged script with `<shell> -c` from inside the staging
/// directory, forwarding stdout line by line.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
        }
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn spawn(&self, invocation: &RemoteInvocation) -> Result<Child, DriverError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(invocation.script.as_os_str())
            .current_dir(&invocation.staging_dir)
            .env(ENV_NODE_ADDRESS, &invocation.address)
            .env(ENV_SSH_USER, &invocation.user)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(identity) = &invocation.identity {
            command.env(ENV_SSH_IDENTITY, identity);
        }
        Ok(command.spawn()?)
    }
}

impl RemoteExecutor for ShellExecutor {
    fn run(
        &self,
        invocation: &RemoteInvocation,
        output: &mut dyn FnMut(&str),
    ) -> Result<ExecOutcome, DriverError> {
        let mut child = self.spawn(invocation)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (sender, receiver) = channel::unbounded::<String>();
        let stdout_reader = thread::spawn(move || {
            let Some(stdout) = stdout else { return };
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "install stdout closed");
                        break;
                    }
                }
            }
        });
        let stderr_reader = thread::spawn(move || {
            let mut captured = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut captured);
            }
            captured
        });

        let deadline = Instant::now() + invocation.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining.min(Duration::from_millis(500))) {
                Ok(line) => output(&line),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        warn!(launch = %invocation.launch, timeout = ?invocation.timeout, "install run timed out, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(DriverError::Timeout(invocation.timeout));
                    }
                }
            }
        }

        let status = child.wait()?;
        let _ = stdout_reader.join();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok(ExecOutcome {
            exit_code: status.code().unwrap_or(-1),
            stderr,
        })
    }
}
