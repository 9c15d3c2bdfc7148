//! Child process control for command-line controllers
//!
//! Every child is started in its own process group so that stopping it takes
//! down anything it spawned as well.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A spawned child and the process group it leads
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    command: String,
    exit_status: Option<ExitStatus>,
}

/// Spawn `command` in `workingdir`.
///
/// With `shell` set the command line is handed to `sh -c`, otherwise it is split
/// with shell quoting rules and executed directly.
pub fn spawn(command: &str, workingdir: Option<&Path>, shell: bool) -> Result<ProcessHandle> {
    let mut cmd = if shell {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    } else {
        let parts = shlex::split(command)
            .with_context(|| format!("unable to split command line '{}'", command))?;
        let Some((program, args)) = parts.split_first() else {
            bail!("empty command line");
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    };

    if let Some(dir) = workingdir {
        if !dir.is_dir() {
            bail!("Working directory '{}' does not exist", dir.display());
        }
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null());
    // New process group so the whole tree can be signalled at once
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", command))?;
    info!("Spawned '{}' (pid {:?})", command, child.id());

    Ok(ProcessHandle {
        child,
        command: command.to_string(),
        exit_status: None,
    })
}

impl ProcessHandle {
    /// Process id while the child has not been reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking liveness check; reaps the child once it has exited.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("'{}' exited with {}", self.command, status);
                self.exit_status = Some(status);
                false
            }
            Err(e) => {
                warn!("Unable to poll '{}': {}", self.command, e);
                false
            }
        }
    }

    /// Send SIGTERM to the child's whole process group.
    ///
    /// A group that is already gone is not an error.
    pub fn kill(&mut self) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                info!("Sent SIGTERM to process group {} ('{}')", pid, self.command);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("Process group {} already gone", pid);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to signal process group {}", pid)),
        }
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }
}
