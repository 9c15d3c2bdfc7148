//! Command-line controller
//!
//! Runs an external program (for example the message broker) as a child
//! process. Options read from the section:
//!
//! - `command`: command line to run (required)
//! - `workingdir`: directory to run in, defaults to the current one
//! - `shell`: `yes` to run through `sh -c` (default), `no` to execute directly

use super::Controller;
use crate::config::{Flag, Section};
use crate::process::{self, ProcessHandle};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct CommandLineController {
    command: String,
    workingdir: Option<PathBuf>,
    shell: bool,
    process: Option<ProcessHandle>,
}

impl CommandLineController {
    pub fn new() -> Self {
        Self::default()
    }

    fn alive(&mut self) -> bool {
        self.process.as_mut().map(|p| p.is_alive()).unwrap_or(false)
    }

    /// Pid of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }
}

#[async_trait]
impl Controller for CommandLineController {
    async fn set_up(&mut self, config: &Section) -> Result<()> {
        let command = config.get("command").map(|c| c.trim()).unwrap_or_default();
        if command.is_empty() {
            bail!("no 'command' given to run");
        }
        self.command = command.to_string();

        self.workingdir = match config.get("workingdir").map(|d| d.trim()) {
            Some(dir) if !dir.is_empty() => {
                let dir = PathBuf::from(dir);
                if !dir.is_dir() {
                    bail!("The working directory '{}' does not exist", dir.display());
                }
                Some(dir)
            }
            _ => None,
        };

        self.shell = match config.get("shell") {
            Some(value) => Flag::parse(value)
                .ok_or_else(|| anyhow!("shell must be 'yes' or 'no', not '{}'", value))?
                .is_yes(),
            None => true,
        };

        debug!(
            "Command line set up: '{}' in {:?} (shell: {})",
            self.command, self.workingdir, self.shell
        );
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.command.is_empty() {
            bail!("start called before set_up");
        }
        if self.alive() {
            info!("'{}' already running, ignoring start", self.command);
            return Ok(());
        }
        self.process = Some(process::spawn(
            &self.command,
            self.workingdir.as_deref(),
            self.shell,
        )?);
        Ok(())
    }

    async fn is_started(&mut self) -> Result<bool> {
        Ok(self.alive())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.alive() {
            info!("'{}' is not running, ignoring stop", self.command);
            return Ok(());
        }
        if let Some(process) = self.process.as_mut() {
            process.kill()?;
        }
        Ok(())
    }

    async fn is_stopped(&mut self) -> Result<bool> {
        Ok(!self.alive())
    }

    async fn tear_down(&mut self) -> Result<()> {
        if self.alive() {
            if let Some(process) = self.process.as_mut() {
                process.kill()?;
            }
        }
        self.process = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn section(pairs: &[(&str, &str)]) -> Section {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn wait_until_stopped(controller: &mut CommandLineController) -> bool {
        for _ in 0..50 {
            if controller.is_stopped().await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_command_is_required() {
        let mut controller = CommandLineController::new();
        assert!(controller.set_up(&section(&[])).await.is_err());
        assert!(controller.start().await.is_err());
    }

    #[tokio::test]
    async fn test_bad_working_directory() {
        let mut controller = CommandLineController::new();
        let err = controller
            .set_up(&section(&[("command", "true"), ("workingdir", "/no/such/dir")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = CommandLineController::new();
        controller
            .set_up(&section(&[
                ("command", "sleep 30"),
                ("workingdir", dir.path().to_str().unwrap()),
                ("shell", "no"),
            ]))
            .await
            .unwrap();

        assert!(!controller.is_started().await.unwrap());
        controller.start().await.unwrap();
        assert!(controller.is_started().await.unwrap());
        let pid = controller.pid();

        // Second start while alive does not spawn another child
        controller.start().await.unwrap();
        assert_eq!(controller.pid(), pid);

        controller.stop().await.unwrap();
        assert!(wait_until_stopped(&mut controller).await);
        controller.stop().await.unwrap();
        controller.tear_down().await.unwrap();
    }

    #[tokio::test]
    async fn test_shell_flag_must_be_yes_or_no() {
        let mut controller = CommandLineController::new();
        assert!(controller
            .set_up(&section(&[("command", "true"), ("shell", "sometimes")]))
            .await
            .is_err());
    }
}
