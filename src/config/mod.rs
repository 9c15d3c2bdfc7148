//! Director configuration
//!
//! Parsing of the ini-like configuration text into typed records, the shared
//! store those records live in, and single-controller reload.

mod parser;
mod records;
mod reload;
mod store;

pub use parser::{classify, parse, parse_document, recover, tokenize, AllocationState, ParsedConfig};
pub use records::{
    parse_integer, AgencySettings, AgentSettings, BrokerSettings, ControllerSettings,
    DirectorSettings, Flag, Record, RecordKind, Role, Section, WebAdminSettings,
    DEFAULT_AGENCY_CONTROLLER, DEFAULT_BROKER_CONTROLLER, DEFAULT_WEBADMIN_CONTROLLER,
};
pub use reload::reload_controller;
pub use store::{ConfigStore, SharedConfig};

use std::path::PathBuf;

/// File name looked for when no path is given
pub const CONFIG_FILE_NAME: &str = "director.cfg";

/// Candidate configuration paths in lookup order: an explicit path, the
/// working directory, `/etc/director` and the user's config directory.
pub fn config_search_paths(explicit: Option<PathBuf>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path];
    }
    let mut paths = vec![
        PathBuf::from(CONFIG_FILE_NAME),
        PathBuf::from("/etc/director").join(CONFIG_FILE_NAME),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("director").join(CONFIG_FILE_NAME));
    }
    paths
}

/// First existing configuration file, or the explicit path even if missing
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }
    config_search_paths(None).into_iter().find(|p| p.is_file())
}
