//! Recording doubles for controllers and agents
//!
//! [`FakeAgent`] backs the `agency.testing.fake` module; both doubles write
//! every lifecycle call into a shared [`CallLog`]. Either can be made to fail
//! a phase with a `fail_on = setUp,start` style entry in its section, and
//! `setup_delay_ms` makes a controller's setUp slow.

use crate::agency::Agent;
use crate::config::Section;
use crate::controllers::Controller;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Ordered record of `(name, phase)` calls
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, phase: &str) {
        debug!("{} {}", name, phase);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), phase.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Phases called on `name`, in order
    pub fn calls_for(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, phase)| phase)
            .collect()
    }

    pub fn count(&self, name: &str, phase: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(n, p)| n == name && p == phase)
            .count()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn fail_on(config: &Section) -> HashSet<String> {
    config
        .get("fail_on")
        .map(|phases| {
            phases
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Agent that only records what it is asked to do
#[derive(Debug, Default)]
pub struct FakeAgent {
    name: String,
    log: CallLog,
    fail_on: HashSet<String>,
}

impl FakeAgent {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail_on: HashSet::new(),
        }
    }

    fn call(&self, phase: &str) -> Result<()> {
        self.log.record(&self.name, phase);
        if self.fail_on.contains(phase) {
            bail!("{} failing {} on request", self.name, phase);
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for FakeAgent {
    async fn set_up(&mut self, config: &Section) -> Result<()> {
        self.fail_on = fail_on(config);
        self.call("setUp")
    }

    async fn start(&mut self) -> Result<()> {
        self.call("start")
    }

    async fn stop(&mut self) -> Result<()> {
        self.call("stop")
    }

    async fn tear_down(&mut self) -> Result<()> {
        self.call("tearDown")
    }
}

/// Controller that tracks a started flag and records every call
#[derive(Debug, Default)]
pub struct RecordingController {
    name: String,
    log: CallLog,
    fail_on: HashSet<String>,
    started: bool,
}

impl RecordingController {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            ..Self::default()
        }
    }

    fn call(&self, phase: &str) -> Result<()> {
        self.log.record(&self.name, phase);
        if self.fail_on.contains(phase) {
            bail!("{} failing {} on request", self.name, phase);
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for RecordingController {
    async fn set_up(&mut self, config: &Section) -> Result<()> {
        if let Some(ms) = config.get("setup_delay_ms") {
            tokio::time::sleep(Duration::from_millis(ms.trim().parse()?)).await;
        }
        self.fail_on = fail_on(config);
        self.call("setUp")
    }

    async fn start(&mut self) -> Result<()> {
        self.call("start")?;
        self.started = true;
        Ok(())
    }

    async fn is_started(&mut self) -> Result<bool> {
        self.call("isStarted")?;
        Ok(self.started)
    }

    async fn stop(&mut self) -> Result<()> {
        self.call("stop")?;
        self.started = false;
        Ok(())
    }

    async fn is_stopped(&mut self) -> Result<bool> {
        self.call("isStopped")?;
        Ok(!self.started)
    }

    async fn tear_down(&mut self) -> Result<()> {
        self.call("tearDown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_agent_records_and_fails_on_request() {
        let log = CallLog::new();
        let mut agent = FakeAgent::new("a1", log.clone());
        let config: Section = [("fail_on".to_string(), "start".to_string())]
            .into_iter()
            .collect();
        agent.set_up(&config).await.unwrap();
        assert!(agent.start().await.is_err());
        agent.stop().await.unwrap();
        assert_eq!(log.calls_for("a1"), vec!["setUp", "start", "stop"]);
        assert_eq!(log.count("a1", "start"), 1);
    }

    #[tokio::test]
    async fn test_recording_controller_started_flag() {
        let log = CallLog::new();
        let mut controller = RecordingController::new("x", log.clone());
        controller.set_up(&Section::new()).await.unwrap();
        assert!(!controller.is_started().await.unwrap());
        controller.start().await.unwrap();
        assert!(controller.is_started().await.unwrap());
        controller.stop().await.unwrap();
        controller.stop().await.unwrap();
        assert!(controller.is_stopped().await.unwrap());
        log.clear();
        assert!(log.calls().is_empty());
    }
}
