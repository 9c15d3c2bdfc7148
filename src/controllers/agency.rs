//! Agency controller
//!
//! Hosts the [`AgentManager`]: agents are loaded and set up with the
//! controller, started and stopped with it, and shut down on tear down.
//! `eat_agent_exceptions = yes` keeps sweeps going past failing agents.

use super::Controller;
use crate::agency::AgentManager;
use crate::config::{Flag, Record, Section};
use crate::error::FailurePolicy;
use crate::loader::LoadContext;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct AgencyController {
    ctx: LoadContext,
    /// Agents of the agency record this controller was built for
    agents: Vec<Arc<Record>>,
    manager: Option<AgentManager>,
    running: bool,
}

impl AgencyController {
    pub fn new(ctx: LoadContext, agents: Vec<Arc<Record>>) -> Self {
        Self {
            ctx,
            agents,
            manager: None,
            running: false,
        }
    }

    pub fn manager(&self) -> Option<&AgentManager> {
        self.manager.as_ref()
    }

    fn manager_mut(&mut self) -> Result<&mut AgentManager> {
        self.manager
            .as_mut()
            .ok_or_else(|| anyhow!("the agency has not been set up"))
    }
}

#[async_trait]
impl Controller for AgencyController {
    async fn set_up(&mut self, config: &Section) -> Result<()> {
        let eat = match config.get("eat_agent_exceptions") {
            Some(value) => Flag::parse(value)
                .ok_or_else(|| anyhow!("eat_agent_exceptions must be 'yes' or 'no', not '{}'", value))?
                .is_yes(),
            None => false,
        };

        let mut manager = AgentManager::for_agents(
            self.ctx.clone(),
            FailurePolicy::from_keep_going(eat),
            self.agents.clone(),
        );
        manager.load()?;
        manager.set_up().await?;
        info!("Agency set up with {} agent(s)", manager.agent_count());
        self.manager = Some(manager);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.running {
            debug!("Agency already running");
            return Ok(());
        }
        self.manager_mut()?.start().await?;
        self.running = true;
        Ok(())
    }

    async fn is_started(&mut self) -> Result<bool> {
        Ok(self.running)
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            debug!("Agency is not running, ignoring stop");
            return Ok(());
        }
        self.running = false;
        self.manager_mut()?.stop().await?;
        Ok(())
    }

    async fn is_stopped(&mut self) -> Result<bool> {
        Ok(!self.running)
    }

    async fn tear_down(&mut self) -> Result<()> {
        self.running = false;
        if let Some(mut manager) = self.manager.take() {
            manager.shutdown().await?;
        }
        Ok(())
    }
}
