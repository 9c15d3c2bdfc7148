//! Module loading
//!
//! Configuration records name their implementation with a dotted path such as
//! `director.controllers.commandline`. Paths resolve through a
//! [`ModuleRegistry`] of factories registered at startup, each of which can
//! provide a controller, an agent, or both.

use crate::agency::{Agent, SharedAgent};
use crate::bus::MessageBus;
use crate::config::{Record, Role, SharedConfig};
use crate::controllers::{
    AgencyController, CommandLineController, Controller, SharedController, WebAdminController,
};
use crate::error::{DirectorError, FailurePolicy, Result};
use crate::testing::{CallLog, FakeAgent};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Builds a fresh controller instance for the given record
pub type ControllerFactory =
    Arc<dyn Fn(&LoadContext, &Record) -> Box<dyn Controller> + Send + Sync>;

/// Builds a fresh agent instance for the given record
pub type AgentFactory = Arc<dyn Fn(&LoadContext, &Record) -> Box<dyn Agent> + Send + Sync>;

pub const COMMANDLINE_MODULE: &str = "director.controllers.commandline";
pub const AGENCY_MODULE: &str = "director.controllers.agency";
pub const WEBADMIN_MODULE: &str = "director.controllers.webadmin";
pub const FAKE_AGENT_MODULE: &str = "agency.testing.fake";

/// A loaded implementation attached to a record
#[derive(Clone)]
pub enum Module {
    Controller(SharedController),
    Agent(SharedAgent),
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Controller(_) => f.write_str("Module::Controller"),
            Module::Agent(_) => f.write_str("Module::Agent"),
        }
    }
}

#[derive(Clone, Default)]
struct ModuleEntry {
    controller: Option<ControllerFactory>,
    agent: Option<AgentFactory>,
}

/// Lookup table from import path to factories
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    entries: Arc<RwLock<HashMap<String, ModuleEntry>>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}

impl ModuleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the controllers and agents shipped with the director
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_controller(
            COMMANDLINE_MODULE,
            controller_fn(|_ctx, _record| Box::new(CommandLineController::new())),
        );
        registry.register_controller(
            AGENCY_MODULE,
            controller_fn(|ctx, record| {
                Box::new(AgencyController::new(ctx.clone(), record.agents().to_vec()))
            }),
        );
        registry.register_controller(
            WEBADMIN_MODULE,
            controller_fn(|ctx, _record| Box::new(WebAdminController::new(ctx.clone()))),
        );
        registry.register_agent(
            FAKE_AGENT_MODULE,
            agent_fn(|_ctx, record| Box::new(FakeAgent::new(&record.name, CallLog::default()))),
        );
        registry
    }

    fn entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ModuleEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the controller factory for `path`
    pub fn register_controller(&self, path: &str, factory: ControllerFactory) {
        debug!("Registering controller '{}'", path);
        self.entries().entry(path.to_string()).or_default().controller = Some(factory);
    }

    /// Register (or replace) the agent factory for `path`
    pub fn register_agent(&self, path: &str, factory: AgentFactory) {
        debug!("Registering agent '{}'", path);
        self.entries().entry(path.to_string()).or_default().agent = Some(factory);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// Registered import paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    fn lookup(&self, path: &str) -> Option<ModuleEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

/// Everything a factory or loader pass needs
#[derive(Clone)]
pub struct LoadContext {
    pub config: SharedConfig,
    pub registry: ModuleRegistry,
    /// Bus used by modules that talk back to the director
    pub bus: Option<Arc<dyn MessageBus>>,
}

impl LoadContext {
    pub fn new(config: SharedConfig, registry: ModuleRegistry) -> Self {
        Self {
            config,
            registry,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("bus", &self.bus.is_some())
            .finish()
    }
}

/// Resolve and instantiate the implementation `record` names for `role`.
///
/// An unknown path is an import error. A known path that has no
/// implementation for the requested role yields `Ok(None)`; the caller decides
/// whether that matters.
pub fn import_module(role: Role, record: &Record, ctx: &LoadContext) -> Result<Option<Module>> {
    let path = record.import_path(role).unwrap_or_default();
    let import_error = |reason: &str| DirectorError::Import {
        role: role.to_string(),
        path: path.to_string(),
        record: record.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(import_error("No import path given."));
    }

    let entry = ctx.registry.lookup(path).ok_or_else(|| {
        error!("Error loading '{}', nothing is registered under that name.", path);
        import_error("Nothing is registered under that name.")
    })?;

    let module = match role {
        Role::Agent => entry
            .agent
            .map(|factory| Module::Agent(Arc::new(Mutex::new(factory(ctx, record))))),
        _ => entry
            .controller
            .map(|factory| Module::Controller(Arc::new(Mutex::new(factory(ctx, record))))),
    };

    if module.is_none() {
        warn!("'{}' does not provide a {} implementation", path, role);
    }
    Ok(module)
}

/// Load the agent module of every enabled agent under an enabled agency.
pub fn load_agents(records: &[Arc<Record>], ctx: &LoadContext, policy: FailurePolicy) -> Result<()> {
    for agency in records.iter().filter(|r| r.role() == Role::Agency) {
        if !agency.is_enabled() {
            info!("{} is disabled, not loading its agents", agency);
            continue;
        }
        load_agent_modules(agency.agents(), ctx, policy)?;
    }
    Ok(())
}

/// Load the agent module of every enabled record in `agents`
pub fn load_agent_modules(
    agents: &[Arc<Record>],
    ctx: &LoadContext,
    policy: FailurePolicy,
) -> Result<()> {
    for agent in agents.iter().filter(|a| a.is_enabled()) {
        match import_module(Role::Agent, agent, ctx) {
            Ok(Some(module)) => {
                agent.set_module(module);
            }
            Ok(None) => {}
            Err(e) => {
                error!("{}", e);
                if !policy.keep_going() {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

/// Load the controller module of every enabled, supervised record.
///
/// The director record already carries its placeholder and containers are
/// never loaded.
pub fn load_controllers(
    records: &[Arc<Record>],
    ctx: &LoadContext,
    policy: FailurePolicy,
) -> Result<()> {
    for record in records {
        if matches!(record.role(), Role::Director | Role::Container) {
            continue;
        }
        if !record.is_enabled() {
            info!("{} is disabled, not loading it", record);
            continue;
        }
        match import_module(Role::Controller, record, ctx) {
            Ok(Some(module)) => {
                debug!("Loaded {}", record);
                record.set_module(module);
            }
            Ok(None) => {}
            Err(e) => {
                error!("{}", e);
                if !policy.keep_going() {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

/// Wrap a closure as a controller factory
pub fn controller_fn<F>(factory: F) -> ControllerFactory
where
    F: Fn(&LoadContext, &Record) -> Box<dyn Controller> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Wrap a closure as an agent factory
pub fn agent_fn<F>(factory: F) -> AgentFactory
where
    F: Fn(&LoadContext, &Record) -> Box<dyn Agent> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Factory for a controller type with a `Default` constructor
pub fn controller_factory<C: Controller + Default + 'static>() -> ControllerFactory {
    controller_fn(|_ctx, _record| Box::new(C::default()))
}

/// Factory for an agent type with a `Default` constructor
pub fn agent_factory<A: Agent + Default + 'static>() -> AgentFactory {
    agent_fn(|_ctx, _record| Box::new(A::default()))
}
