//! Typed configuration records
//!
//! Each section of the director configuration becomes a [`Record`]. The record
//! keeps the raw key/value mapping it was built from, the typed settings for
//! its role, and (once loaded) the module instance that implements it.

use crate::agency::SharedAgent;
use crate::controllers::{shared_controller, DirectorPlaceholder, SharedController};
use crate::error::{DirectorError, Result};
use crate::loader::Module;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Raw key/value mapping of one configuration section, in file order
pub type Section = IndexMap<String, String>;

pub const DEFAULT_BROKER_CONTROLLER: &str = "director.controllers.commandline";
pub const DEFAULT_AGENCY_CONTROLLER: &str = "director.controllers.agency";
pub const DEFAULT_WEBADMIN_CONTROLLER: &str = "director.controllers.webadmin";

/// The string boolean used throughout the configuration and wire replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Yes,
    #[default]
    No,
}

impl Flag {
    /// Parse `yes`/`no`, `true`/`false` or `1`/`0`
    pub fn parse(value: &str) -> Option<Flag> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" => Some(Flag::Yes),
            "no" | "false" | "0" => Some(Flag::No),
            _ => None,
        }
    }

    pub fn is_yes(&self) -> bool {
        matches!(self, Flag::Yes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Yes => "yes",
            Flag::No => "no",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a record plays in the director
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Director,
    Broker,
    Agency,
    WebAdmin,
    Controller,
    Agent,
    Container,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Director => "director",
            Role::Broker => "broker",
            Role::Agency => "agency",
            Role::WebAdmin => "webadmin",
            Role::Controller => "controller",
            Role::Agent => "agent",
            Role::Container => "container",
        }
    }

    /// Reserved section names map straight onto a role
    pub fn from_reserved_section(name: &str) -> Option<Role> {
        match name {
            "director" => Some(Role::Director),
            "broker" => Some(Role::Broker),
            "agency" => Some(Role::Agency),
            "webadmin" => Some(Role::WebAdmin),
            _ => None,
        }
    }

    /// Order used when a reserved section gives none
    pub fn default_order(&self) -> Option<i64> {
        match self {
            Role::Director => Some(0),
            Role::Broker => Some(1),
            Role::Agency => Some(2),
            Role::WebAdmin => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings carried by the `[director]` section
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorSettings {
    /// Whether the remote-control protocol is served over the message bus
    pub messaging: Flag,
    /// Seconds between maintenance passes
    pub poll_time: f64,
    pub msg_host: String,
    pub msg_port: u16,
    pub msg_username: String,
    pub msg_password: String,
    pub msg_channel: String,
    pub msg_interface: String,
    pub internal_broker: Flag,
    pub disable_broker: Flag,
    pub noproxydispatch: Flag,
    pub proxy_dispatch_port: u16,
}

impl Default for DirectorSettings {
    fn default() -> Self {
        Self {
            messaging: Flag::Yes,
            poll_time: 1.0,
            msg_host: "127.0.0.1".to_string(),
            msg_port: 61613,
            msg_username: String::new(),
            msg_password: String::new(),
            msg_channel: "evasion".to_string(),
            msg_interface: "127.0.0.1".to_string(),
            internal_broker: Flag::Yes,
            disable_broker: Flag::No,
            noproxydispatch: Flag::No,
            proxy_dispatch_port: 1901,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub controller: String,
    pub command: String,
    pub workingdir: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            controller: DEFAULT_BROKER_CONTROLLER.to_string(),
            command: String::new(),
            workingdir: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgencySettings {
    pub controller: String,
    /// Agent records nested under the agency, sorted by their own order
    pub agents: Vec<Arc<Record>>,
}

impl Default for AgencySettings {
    fn default() -> Self {
        Self {
            controller: DEFAULT_AGENCY_CONTROLLER.to_string(),
            agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebAdminSettings {
    pub controller: String,
}

impl Default for WebAdminSettings {
    fn default() -> Self {
        Self {
            controller: DEFAULT_WEBADMIN_CONTROLLER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerSettings {
    pub controller: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSettings {
    /// Import path of the agent implementation
    pub agent: String,
    /// Agent category, see [`crate::agency::AGENT_CATEGORIES`]
    pub cat: String,
    pub alias: Option<i64>,
}

/// Role specific part of a record
#[derive(Debug, Clone)]
pub enum RecordKind {
    Director(DirectorSettings),
    Broker(BrokerSettings),
    Agency(AgencySettings),
    WebAdmin(WebAdminSettings),
    Controller(ControllerSettings),
    Agent(AgentSettings),
    Container,
}

impl RecordKind {
    fn for_role(role: Role) -> Self {
        match role {
            Role::Director => RecordKind::Director(DirectorSettings::default()),
            Role::Broker => RecordKind::Broker(BrokerSettings::default()),
            Role::Agency => RecordKind::Agency(AgencySettings::default()),
            Role::WebAdmin => RecordKind::WebAdmin(WebAdminSettings::default()),
            Role::Controller => RecordKind::Controller(ControllerSettings::default()),
            Role::Agent => RecordKind::Agent(AgentSettings::default()),
            Role::Container => RecordKind::Container,
        }
    }
}

/// One parsed configuration section
pub struct Record {
    /// Section name; unique, fixed for reserved sections
    pub name: String,
    /// Start order, lower runs first
    pub order: i64,
    pub disabled: Flag,
    /// Raw section mapping handed to the module's setUp
    pub config: Section,
    pub kind: RecordKind,
    module: RwLock<Option<Module>>,
    was_stopped: AtomicBool,
}

impl Record {
    /// Build a record of `role` from a raw section.
    ///
    /// Every recognised key is applied on top of the role defaults. Numeric
    /// fields that fail to parse are reported as configuration errors.
    pub fn build(role: Role, name: &str, section: &Section, order: i64) -> Result<Record> {
        let mut kind = RecordKind::for_role(role);
        let mut disabled = Flag::No;

        for (key, value) in section {
            if key == "disabled" {
                disabled = parse_flag(name, key, value)?;
                continue;
            }
            match &mut kind {
                RecordKind::Director(d) => match key.as_str() {
                    "messaging" => d.messaging = parse_flag(name, key, value)?,
                    "poll_time" => {
                        d.poll_time = value.trim().parse::<f64>().map_err(|_| {
                            DirectorError::Section(format!(
                                "'{}' poll_time must be a number of seconds, not '{}'.",
                                name, value
                            ))
                        })?
                    }
                    "msg_host" => d.msg_host = value.clone(),
                    "msg_port" => d.msg_port = parse_port(name, key, value)?,
                    "msg_username" => d.msg_username = value.clone(),
                    "msg_password" => d.msg_password = value.clone(),
                    "msg_channel" => d.msg_channel = value.clone(),
                    "msg_interface" => d.msg_interface = value.clone(),
                    "internal_broker" => d.internal_broker = parse_flag(name, key, value)?,
                    "disable_broker" => d.disable_broker = parse_flag(name, key, value)?,
                    "noproxydispatch" => d.noproxydispatch = parse_flag(name, key, value)?,
                    "proxy_dispatch_port" => d.proxy_dispatch_port = parse_port(name, key, value)?,
                    _ => {}
                },
                RecordKind::Broker(b) => match key.as_str() {
                    "controller" => b.controller = value.clone(),
                    "command" => b.command = value.clone(),
                    "workingdir" => b.workingdir = value.clone(),
                    _ => {}
                },
                RecordKind::Agency(a) => {
                    if key == "controller" {
                        a.controller = value.clone();
                    }
                }
                RecordKind::WebAdmin(w) => {
                    if key == "controller" {
                        w.controller = value.clone();
                    }
                }
                RecordKind::Controller(c) => {
                    if key == "controller" {
                        c.controller = value.clone();
                    }
                }
                RecordKind::Agent(a) => match key.as_str() {
                    "agent" => a.agent = value.clone(),
                    "cat" | "category" => a.cat = value.clone(),
                    "alias" => a.alias = Some(parse_integer(name, key, value)?),
                    _ => {}
                },
                RecordKind::Container => {}
            }
        }

        let record = Record {
            name: name.to_string(),
            order,
            disabled,
            config: section.clone(),
            kind,
            module: RwLock::new(None),
            was_stopped: AtomicBool::new(false),
        };

        if role == Role::Director {
            // The director stands in for a controller that is always running.
            record.set_module(Module::Controller(shared_controller(DirectorPlaceholder)));
        }

        Ok(record)
    }

    pub fn role(&self) -> Role {
        match &self.kind {
            RecordKind::Director(_) => Role::Director,
            RecordKind::Broker(_) => Role::Broker,
            RecordKind::Agency(_) => Role::Agency,
            RecordKind::WebAdmin(_) => Role::WebAdmin,
            RecordKind::Controller(_) => Role::Controller,
            RecordKind::Agent(_) => Role::Agent,
            RecordKind::Container => Role::Container,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled.is_yes()
    }

    /// Import path for the requested role, if this record names one
    pub fn import_path(&self, role: Role) -> Option<&str> {
        match (&self.kind, role) {
            (RecordKind::Agent(a), Role::Agent) => Some(a.agent.as_str()),
            (RecordKind::Broker(b), Role::Controller) => Some(b.controller.as_str()),
            (RecordKind::Agency(a), Role::Controller) => Some(a.controller.as_str()),
            (RecordKind::WebAdmin(w), Role::Controller) => Some(w.controller.as_str()),
            (RecordKind::Controller(c), Role::Controller) => Some(c.controller.as_str()),
            _ => None,
        }
    }

    pub fn director_settings(&self) -> Option<&DirectorSettings> {
        match &self.kind {
            RecordKind::Director(d) => Some(d),
            _ => None,
        }
    }

    pub fn agent_settings(&self) -> Option<&AgentSettings> {
        match &self.kind {
            RecordKind::Agent(a) => Some(a),
            _ => None,
        }
    }

    /// Agents nested under this record; empty unless this is the agency
    pub fn agents(&self) -> &[Arc<Record>] {
        match &self.kind {
            RecordKind::Agency(a) => &a.agents,
            _ => &[],
        }
    }

    pub(crate) fn set_agents(&mut self, agents: Vec<Arc<Record>>) {
        if let RecordKind::Agency(a) = &mut self.kind {
            a.agents = agents;
        }
    }

    /// Loaded module, if any
    pub fn module(&self) -> Option<Module> {
        self.module
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.module
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Attach the loaded module, returning the one it replaces
    pub fn set_module(&self, module: Module) -> Option<Module> {
        self.module
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(module)
    }

    /// Detach the module so the record can be loaded again
    pub fn clear_module(&self) -> Option<Module> {
        self.module
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn controller(&self) -> Option<SharedController> {
        match self.module() {
            Some(Module::Controller(c)) => Some(c),
            _ => None,
        }
    }

    pub fn agent(&self) -> Option<SharedAgent> {
        match self.module() {
            Some(Module::Agent(a)) => Some(a),
            _ => None,
        }
    }

    pub fn was_stopped(&self) -> bool {
        self.was_stopped.load(Ordering::SeqCst)
    }

    pub fn set_was_stopped(&self, stopped: bool) {
        self.was_stopped.store(stopped, Ordering::SeqCst);
    }

    /// Check that all required members are present
    pub fn validate(&self) -> Result<()> {
        let missing = |member: &str| {
            DirectorError::Section(format!(
                "'{}' The member '{}' must be provided in the configuration.",
                self, member
            ))
        };

        match &self.kind {
            RecordKind::Director(d) => {
                if !(d.poll_time > 0.0 && Duration::try_from_secs_f64(d.poll_time).is_ok()) {
                    return Err(DirectorError::Section(format!(
                        "'{}' poll_time must be a positive number of seconds, not '{}'.",
                        self, d.poll_time
                    )));
                }
            }
            RecordKind::Controller(c) => {
                if self.name.is_empty() {
                    return Err(missing("name"));
                }
                if c.controller.is_empty() {
                    return Err(missing("controller"));
                }
            }
            RecordKind::Agent(a) => {
                if self.name.is_empty() {
                    return Err(missing("name"));
                }
                if a.agent.is_empty() {
                    return Err(missing("agent"));
                }
                if a.cat.is_empty() {
                    return Err(missing("cat"));
                }
                if let Some(alias) = a.alias {
                    if alias < 1 {
                        return Err(DirectorError::Section(format!(
                            "'{}' The alias must be a positive integer not '{}'.",
                            self, alias
                        )));
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Plain data view of the record. The loaded module is never included.
    pub fn export(&self) -> Value {
        let mut out = json!({
            "type": self.role().as_str(),
            "name": self.name,
            "order": self.order,
            "disabled": self.disabled,
            "config": self.config,
        });

        let extra = match &self.kind {
            RecordKind::Director(d) => json!({
                "messaging": d.messaging,
                "poll_time": d.poll_time,
                "msg_host": d.msg_host,
                "msg_port": d.msg_port,
                "msg_username": d.msg_username,
                "msg_password": d.msg_password,
                "msg_channel": d.msg_channel,
                "msg_interface": d.msg_interface,
                "internal_broker": d.internal_broker,
                "disable_broker": d.disable_broker,
                "noproxydispatch": d.noproxydispatch,
                "proxy_dispatch_port": d.proxy_dispatch_port,
            }),
            RecordKind::Broker(b) => json!({
                "controller": b.controller,
                "command": b.command,
                "workingdir": b.workingdir,
            }),
            RecordKind::Agency(a) => json!({
                "controller": a.controller,
                "agents": a.agents.iter().map(|agent| agent.export()).collect::<Vec<_>>(),
            }),
            RecordKind::WebAdmin(w) => json!({ "controller": w.controller }),
            RecordKind::Controller(c) => json!({ "controller": c.controller }),
            RecordKind::Agent(a) => json!({
                "agent": a.agent,
                "cat": a.cat,
                "alias": a.alias,
            }),
            RecordKind::Container => json!({}),
        };

        if let (Value::Object(out), Value::Object(extra)) = (&mut out, extra) {
            out.extend(extra);
        }
        out
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RecordKind::Director(_) => write!(f, "<Director: order:{}>", self.order),
            RecordKind::Broker(_) => {
                write!(f, "<Broker: order:{} disabled:{}>", self.order, self.disabled)
            }
            RecordKind::Agency(_) => {
                write!(f, "<Agency: order:{} disabled:{}>", self.order, self.disabled)
            }
            RecordKind::WebAdmin(_) => {
                write!(f, "<WebAdmin: order:{} disabled:{}>", self.order, self.disabled)
            }
            RecordKind::Controller(_) => write!(
                f,
                "<Controller: order:{} name:{} disabled:{}>",
                self.order, self.name, self.disabled
            ),
            RecordKind::Agent(_) => write!(
                f,
                "<Agent: name:{} order:{} disabled:{}>",
                self.name, self.order, self.disabled
            ),
            RecordKind::Container => write!(f, "<{}: order {}>", self.name, self.order),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("disabled", &self.disabled)
            .field("kind", &self.kind)
            .field("loaded", &self.is_loaded())
            .field("was_stopped", &self.was_stopped())
            .finish()
    }
}

fn parse_flag(name: &str, key: &str, value: &str) -> Result<Flag> {
    Flag::parse(value).ok_or_else(|| {
        DirectorError::Section(format!(
            "'{}' {} must be 'yes' or 'no', not '{}'.",
            name, key, value
        ))
    })
}

fn parse_port(name: &str, key: &str, value: &str) -> Result<u16> {
    value.trim().parse::<u16>().map_err(|_| {
        DirectorError::Section(format!(
            "'{}' {} must be a port number, not '{}'.",
            name, key, value
        ))
    })
}

/// Integer coercion used for `order` and `alias`
pub fn parse_integer(name: &str, key: &str, value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|_| {
        DirectorError::Config(format!(
            "section '{}': {} must be an integer not '{}'",
            name, key, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(pairs: &[(&str, &str)]) -> Section {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_director_defaults() {
        let record = Record::build(Role::Director, "director", &Section::new(), 0).unwrap();
        let settings = record.director_settings().unwrap();
        assert_eq!(record.order, 0);
        assert_eq!(record.disabled, Flag::No);
        assert_eq!(settings.poll_time, 1.0);
        assert_eq!(settings.msg_port, 61613);
        assert_eq!(settings.proxy_dispatch_port, 1901);
        assert!(record.controller().is_some());
    }

    #[test]
    fn test_flag_parsing() {
        assert_eq!(Flag::parse("yes"), Some(Flag::Yes));
        assert_eq!(Flag::parse("No"), Some(Flag::No));
        assert_eq!(Flag::parse("TRUE"), Some(Flag::Yes));
        assert_eq!(Flag::parse("maybe"), None);
        assert_eq!(Flag::parse("0"), Some(Flag::No));
        assert_eq!(Flag::parse("on"), None);
        assert_eq!(Flag::parse("off"), None);
        assert_eq!(serde_json::to_value(Flag::Yes).unwrap(), json!("yes"));
    }

    #[test]
    fn test_poll_time_out_of_range() {
        for poll_time in ["0", "-1", "1e20"] {
            let record = Record::build(
                Role::Director,
                "director",
                &section(&[("poll_time", poll_time)]),
                0,
            )
            .unwrap();
            let err = record.validate().unwrap_err();
            assert!(
                matches!(err, DirectorError::Section(_)),
                "poll_time {} should be rejected",
                poll_time
            );
        }
    }

    #[test]
    fn test_invalid_disabled_value_is_a_section_error() {
        let err = Record::build(
            Role::Controller,
            "x",
            &section(&[("controller", "a.b"), ("disabled", "perhaps")]),
            4,
        )
        .unwrap_err();
        assert!(matches!(err, DirectorError::Section(_)));
    }

    #[test]
    fn test_controller_requires_import_path() {
        let record = Record::build(Role::Controller, "x", &section(&[]), 4).unwrap();
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("'controller' must be provided"));
    }

    #[test]
    fn test_agent_validation() {
        let record = Record::build(
            Role::Agent,
            "swipe1",
            &section(&[("agent", "pkg.fake")]),
            0,
        )
        .unwrap();
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("'cat'"));

        let record = Record::build(
            Role::Agent,
            "swipe1",
            &section(&[("agent", "pkg.fake"), ("cat", "swipe"), ("alias", "0")]),
            0,
        )
        .unwrap();
        assert!(record.validate().is_err());

        let err = Record::build(
            Role::Agent,
            "swipe1",
            &section(&[("agent", "pkg.fake"), ("cat", "swipe"), ("alias", "one")]),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, DirectorError::Config(_)));
    }

    #[test]
    fn test_category_key_alias() {
        let record = Record::build(
            Role::Agent,
            "printer1",
            &section(&[("agent", "pkg.fake"), ("category", "printer")]),
            0,
        )
        .unwrap();
        assert_eq!(record.agent_settings().unwrap().cat, "printer");
    }

    #[test]
    fn test_export_never_includes_module() {
        let record = Record::build(Role::Director, "director", &Section::new(), 0).unwrap();
        let exported = record.export();
        assert_eq!(exported["type"], "director");
        assert_eq!(exported["disabled"], "no");
        assert!(exported.get("mod").is_none());
        assert!(exported.get("module").is_none());
    }

    #[test]
    fn test_display_forms() {
        let record = Record::build(
            Role::Controller,
            "proc",
            &section(&[("controller", "a.b")]),
            5,
        )
        .unwrap();
        assert_eq!(record.to_string(), "<Controller: order:5 name:proc disabled:no>");
    }

    #[test]
    fn test_was_stopped_flag() {
        let record = Record::build(Role::Broker, "broker", &Section::new(), 1).unwrap();
        assert!(!record.was_stopped());
        record.set_was_stopped(true);
        assert!(record.was_stopped());
    }
}
