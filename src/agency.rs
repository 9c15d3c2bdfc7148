//! Agency: supervision of in-process agents
//!
//! Agents are lightweight endpoints (card swipes, printers, services, ...)
//! nested under the `[agency]` section. The [`AgentManager`] loads them once,
//! gives each a node id and an alias id, and drives them through
//! setUp/start/stop/tearDown sweeps in agency order.

use crate::config::{Record, Section};
use crate::error::{DirectorError, FailurePolicy, Phase, Result};
use crate::loader::{load_agent_modules, load_agents, LoadContext};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Categories an agent may belong to
pub const AGENT_CATEGORIES: &[&str] = &[
    "display",
    "cashdrawer",
    "printer",
    "sale",
    "swipe",
    "websale",
    "service",
    "general",
];

/// Lifecycle every agent implements
#[async_trait]
pub trait Agent: Send {
    async fn set_up(&mut self, config: &Section) -> anyhow::Result<()>;

    async fn start(&mut self) -> anyhow::Result<()>;

    async fn stop(&mut self) -> anyhow::Result<()>;

    async fn tear_down(&mut self) -> anyhow::Result<()>;
}

pub type SharedAgent = Arc<Mutex<Box<dyn Agent>>>;

pub fn shared_agent<A: Agent + 'static>(agent: A) -> SharedAgent {
    Arc::new(Mutex::new(Box::new(agent)))
}

fn check_category(cat: &str) -> Result<()> {
    if AGENT_CATEGORIES.contains(&cat) {
        Ok(())
    } else {
        Err(DirectorError::Manager(format!(
            "Unknown agent category '{}'. Is this a missing one?",
            cat
        )))
    }
}

/// Hands out node and alias ids per agent category.
///
/// Node ids look like `/agent/swipe/reader/1` and alias ids like
/// `/agent/swipe/1`. Automatic aliases count up from 1 per category and skip
/// aliases that were reserved explicitly.
#[derive(Debug, Default)]
pub struct NodeAllocator {
    counters: HashMap<String, usize>,
    next_alias: HashMap<String, i64>,
    reserved: HashMap<String, HashSet<i64>>,
}

impl NodeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `alias` away from automatic assignment in `cat`
    pub fn reserve(&mut self, cat: &str, alias: i64) -> Result<()> {
        check_category(cat)?;
        self.reserved.entry(cat.to_string()).or_default().insert(alias);
        Ok(())
    }

    /// Allocate `(node_id, alias_id)` for an agent section
    pub fn add(&mut self, cat: &str, name: &str, alias: Option<i64>) -> Result<(String, String)> {
        check_category(cat)?;

        let alias = match alias {
            Some(alias) => alias,
            None => {
                let reserved = self.reserved.get(cat);
                let next = self.next_alias.entry(cat.to_string()).or_insert(1);
                while reserved.is_some_and(|r| r.contains(&*next)) {
                    *next += 1;
                }
                let alias = *next;
                *next += 1;
                alias
            }
        };

        let count = self.counters.entry(cat.to_string()).or_insert(0);
        *count += 1;

        Ok((
            format!("/agent/{}/{}/{}", cat, name, count),
            format!("/agent/{}/{}", cat, alias),
        ))
    }

    /// Number of node ids handed out for `cat`
    pub fn count(&self, cat: &str) -> Result<usize> {
        check_category(cat)?;
        Ok(self.counters.get(cat).copied().unwrap_or(0))
    }
}

/// An agent record together with the ids it was given at load
#[derive(Debug, Clone)]
pub struct LoadedAgent {
    pub record: Arc<Record>,
    pub node_id: String,
    pub alias_id: String,
}

impl LoadedAgent {
    pub fn module(&self) -> Option<SharedAgent> {
        self.record.agent()
    }
}

/// Loads and supervises the agents of the agency
#[derive(Debug)]
pub struct AgentManager {
    ctx: LoadContext,
    policy: FailurePolicy,
    /// Agent records to load; `None` reads the agency from the store
    source: Option<Vec<Arc<Record>>>,
    loaded: bool,
    agents: Vec<LoadedAgent>,
    index: HashMap<String, usize>,
}

impl AgentManager {
    /// Manager for the agents of the agency in the current store
    pub fn new(ctx: LoadContext, policy: FailurePolicy) -> Self {
        Self {
            ctx,
            policy,
            source: None,
            loaded: false,
            agents: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Manager for a given list of agent records, in agency order
    pub fn for_agents(ctx: LoadContext, policy: FailurePolicy, agents: Vec<Arc<Record>>) -> Self {
        Self {
            source: Some(agents),
            ..Self::new(ctx, policy)
        }
    }

    /// True when agent failures are logged and the sweep continues
    pub fn keep_going_on_exceptions(&self) -> bool {
        self.policy.keep_going()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn agents(&self) -> &[LoadedAgent] {
        &self.agents
    }

    /// Load agent modules and allocate their ids.
    ///
    /// Fails if called again before [`AgentManager::shutdown`].
    pub fn load(&mut self) -> Result<Vec<Arc<Record>>> {
        if self.loaded {
            return Err(DirectorError::Manager(
                "Load has been called already! Please call shutdown first!".to_string(),
            ));
        }

        let records = match &self.source {
            Some(agents) => {
                load_agent_modules(agents, &self.ctx, self.policy)?;
                agents.clone()
            }
            None => {
                let store = self.ctx.config.get_cfg()?;
                let Some(agency) = store.agency() else {
                    warn!("No agency is present to load agents for.");
                    self.loaded = true;
                    return Ok(Vec::new());
                };
                load_agents(std::slice::from_ref(agency), &self.ctx, self.policy)?;
                agency.agents().to_vec()
            }
        };

        let mut allocator = NodeAllocator::new();
        let mut claimed: HashMap<(String, i64), String> = HashMap::new();
        for agent in &records {
            let Some(settings) = agent.agent_settings() else {
                continue;
            };
            check_category(&settings.cat)?;
            if let Some(alias) = settings.alias {
                let key = (settings.cat.clone(), alias);
                if let Some(first) = claimed.get(&key) {
                    return Err(DirectorError::Manager(format!(
                        "A duplicate config alias '{}' has been found for '{}' (already used by '{}')",
                        alias, agent.name, first
                    )));
                }
                claimed.insert(key, agent.name.clone());
                allocator.reserve(&settings.cat, alias)?;
            }
        }

        let mut agents = Vec::new();
        let mut index = HashMap::new();
        for agent in &records {
            let Some(settings) = agent.agent_settings() else {
                continue;
            };
            let (node_id, alias_id) = allocator.add(&settings.cat, &agent.name, settings.alias)?;
            index.insert(alias_id.clone(), agents.len());
            agents.push(LoadedAgent {
                record: agent.clone(),
                node_id,
                alias_id,
            });
        }

        self.agents = agents;
        self.index = index;
        self.loaded = true;
        info!("{} agent(s) present.", self.agents.len());

        Ok(records)
    }

    /// Look up an agent by alias, e.g. `swipe/1` or `/agent/swipe/1`
    pub fn agent(&self, alias: &str) -> Result<&LoadedAgent> {
        let full = if alias.starts_with("/agent/") {
            alias.to_string()
        } else {
            format!("/agent/{}", alias.trim_start_matches('/'))
        };
        self.index
            .get(&full)
            .and_then(|&i| self.agents.get(i))
            .ok_or_else(|| {
                DirectorError::Manager(format!("The agent node alias '{}' was not found!", full))
            })
    }

    async fn sweep(&self, phase: Phase) -> Result<()> {
        if self.agents.is_empty() {
            warn!("There are no agents to {}.", phase);
            return Ok(());
        }

        for loaded in &self.agents {
            let record = &loaded.record;
            if !record.is_enabled() {
                continue;
            }
            let Some(module) = record.agent() else {
                continue;
            };

            let mut agent = module.lock().await;
            let outcome = match phase {
                Phase::SetUp => agent.set_up(&record.config).await,
                Phase::Start => agent.start().await,
                Phase::Stop => agent.stop().await,
                Phase::TearDown => agent.tear_down().await,
                Phase::IsStarted | Phase::IsStopped => Ok(()),
            };

            if let Err(e) = outcome {
                let err = DirectorError::lifecycle(record.as_ref(), phase, e);
                error!("{}", err);
                if !self.keep_going_on_exceptions() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub async fn set_up(&self) -> Result<()> {
        self.sweep(Phase::SetUp).await
    }

    pub async fn start(&self) -> Result<()> {
        self.sweep(Phase::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.sweep(Phase::Stop).await
    }

    pub async fn tear_down(&self) -> Result<()> {
        self.sweep(Phase::TearDown).await
    }

    /// Tear everything down and forget the loaded agents so `load` can run again.
    pub async fn shutdown(&mut self) -> Result<()> {
        let outcome = match self.tear_down().await {
            Err(DirectorError::Manager(msg)) => {
                warn!("{}", msg);
                Ok(())
            }
            other => other,
        };

        for loaded in &self.agents {
            loaded.record.clear_module();
        }
        self.agents.clear();
        self.index.clear();
        self.loaded = false;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, SharedConfig};
    use crate::loader::{agent_fn, ModuleRegistry};
    use crate::testing::{CallLog, FakeAgent};

    const TWO_SWIPES: &str = "\
[director]
[agency]
[a1]
order = 1
cat = swipe
agent = test.fake
[a2]
order = 0
cat = swipe
agent = test.fake
";

    fn manager(raw: &str, log: &CallLog, policy: FailurePolicy) -> AgentManager {
        let registry = ModuleRegistry::new();
        let log = log.clone();
        registry.register_agent(
            "test.fake",
            agent_fn(move |_ctx, record| Box::new(FakeAgent::new(&record.name, log.clone()))),
        );
        let ctx = LoadContext::new(SharedConfig::from_raw(raw, "").unwrap(), registry);
        AgentManager::new(ctx, policy)
    }

    #[test]
    fn test_node_allocator_ids() {
        let mut nodes = NodeAllocator::new();
        assert_eq!(
            nodes.add("swipe", "testing", None).unwrap(),
            ("/agent/swipe/testing/1".to_string(), "/agent/swipe/1".to_string())
        );
        assert_eq!(
            nodes.add("swipe", "other", Some(7)).unwrap(),
            ("/agent/swipe/other/2".to_string(), "/agent/swipe/7".to_string())
        );
        assert_eq!(nodes.count("swipe").unwrap(), 2);
        assert_eq!(nodes.count("printer").unwrap(), 0);
        assert!(nodes.add("toaster", "x", None).is_err());
        assert!(nodes.count("toaster").is_err());
    }

    #[test]
    fn test_auto_alias_skips_reserved() {
        let mut nodes = NodeAllocator::new();
        nodes.reserve("printer", 1).unwrap();
        let (_, alias) = nodes.add("printer", "p", None).unwrap();
        assert_eq!(alias, "/agent/printer/2");
        let (_, alias) = nodes.add("display", "d", None).unwrap();
        assert_eq!(alias, "/agent/display/1");
    }

    #[tokio::test]
    async fn test_load_and_lookup() {
        let log = CallLog::default();
        let mut manager = manager(TWO_SWIPES, &log, FailurePolicy::Abort);
        let loaded = manager.load().unwrap();
        let names: Vec<&str> = loaded.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a2", "a1"]);

        let first = manager.agent("/agent/swipe/1").unwrap();
        assert_eq!(first.record.name, "a2");
        assert!(first.module().is_some());
        assert_eq!(manager.agent("swipe/2").unwrap().record.name, "a1");
        assert!(matches!(
            manager.agent("swipe/3"),
            Err(DirectorError::Manager(_))
        ));
    }

    #[tokio::test]
    async fn test_double_load_requires_shutdown() {
        let log = CallLog::default();
        let mut manager = manager(TWO_SWIPES, &log, FailurePolicy::Abort);
        manager.load().unwrap();
        assert!(matches!(manager.load(), Err(DirectorError::Manager(_))));
        manager.shutdown().await.unwrap();
        assert_eq!(manager.agent_count(), 0);
        manager.load().unwrap();
        assert_eq!(manager.agent_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let raw = "\
[director]
[agency]
[a1]
cat = swipe
alias = 3
agent = test.fake
[b1]
cat = swipe
alias = 3
agent = test.fake
";
        let log = CallLog::default();
        let mut manager = manager(raw, &log, FailurePolicy::Abort);
        let err = manager.load().unwrap_err();
        assert!(matches!(err, DirectorError::Manager(_)));
        assert!(err.to_string().contains("duplicate config alias '3'"));
    }

    #[tokio::test]
    async fn test_unknown_category_rejected() {
        let raw = "[director]\n[agency]\n[t]\ncat = toaster\nagent = test.fake\n";
        let log = CallLog::default();
        let mut manager = manager(raw, &log, FailurePolicy::Abort);
        assert!(matches!(manager.load(), Err(DirectorError::Manager(_))));
    }

    #[tokio::test]
    async fn test_sweeps_follow_agency_order() {
        let log = CallLog::default();
        let mut manager = manager(TWO_SWIPES, &log, FailurePolicy::Abort);
        manager.load().unwrap();
        manager.set_up().await.unwrap();
        manager.start().await.unwrap();
        manager.stop().await.unwrap();
        manager.shutdown().await.unwrap();

        assert_eq!(
            log.calls_for("a2"),
            vec!["setUp", "start", "stop", "tearDown"]
        );
        assert_eq!(log.calls()[0], ("a2".to_string(), "setUp".to_string()));
        assert_eq!(log.calls()[1], ("a1".to_string(), "setUp".to_string()));
    }

    #[tokio::test]
    async fn test_eat_agent_exceptions() {
        let raw = "\
[director]
[agency]
[bad]
cat = swipe
agent = test.fake
fail_on = setUp
[good]
cat = swipe
agent = test.fake
";
        let log = CallLog::default();
        let mut strict = manager(raw, &log, FailurePolicy::Abort);
        strict.load().unwrap();
        assert!(strict.set_up().await.is_err());
        assert!(log.calls_for("good").is_empty());

        let log = CallLog::default();
        let mut lenient = manager(raw, &log, FailurePolicy::KeepGoing);
        lenient.load().unwrap();
        lenient.set_up().await.unwrap();
        assert_eq!(log.calls_for("good"), vec!["setUp"]);
    }

    #[tokio::test]
    async fn test_load_given_agents_ignores_store() {
        let log = CallLog::default();
        let ctx = manager(TWO_SWIPES, &log, FailurePolicy::Abort).ctx;
        let store = ctx.config.get_cfg().unwrap();
        let stored = store.agency().unwrap().agents()[0].clone();
        let own = Arc::new(Record::build(Role::Agent, "mine", &stored.config, 0).unwrap());

        let mut manager = AgentManager::for_agents(ctx, FailurePolicy::Abort, vec![own.clone()]);
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(own.agent().is_some());
        assert!(stored.agent().is_none());
        assert_eq!(manager.agent("swipe/1").unwrap().record.name, "mine");

        manager.set_up().await.unwrap();
        assert_eq!(log.calls_for("mine"), vec!["setUp"]);
        assert!(log.calls_for("a2").is_empty());
    }

    #[tokio::test]
    async fn test_load_without_agency() {
        let log = CallLog::default();
        let mut manager = manager("[director]\n", &log, FailurePolicy::Abort);
        assert!(manager.load().unwrap().is_empty());
        manager.start().await.unwrap();
    }
}
