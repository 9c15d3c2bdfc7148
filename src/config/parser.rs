//! Configuration text parsing
//!
//! Turns the ini-like configuration text into an ordered collection of typed
//! [`Record`]s. Parsing is all-or-nothing: the first structural or validation
//! problem aborts with an error and nothing is returned.

use super::records::{parse_integer, Record, Role, Section};
use crate::error::{DirectorError, Result};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

/// Counters handing out default orders during one parse.
///
/// A fresh instance is created for every parse so nothing leaks between
/// configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationState {
    pub next_agent_order: i64,
    pub next_section_order: i64,
}

impl Default for AllocationState {
    fn default() -> Self {
        Self {
            next_agent_order: 0,
            next_section_order: 4,
        }
    }
}

impl AllocationState {
    pub fn agent_order(&mut self) -> i64 {
        let order = self.next_agent_order;
        self.next_agent_order += 1;
        order
    }

    pub fn section_order(&mut self) -> i64 {
        let order = self.next_section_order;
        self.next_section_order += 1;
        order
    }
}

/// Output of a full parse
#[derive(Debug, Clone, Default)]
pub struct ParsedConfig {
    /// Tokenized sections in file order
    pub sections: IndexMap<String, Section>,
    /// Supervised records (agents nested in the agency), sorted by order
    pub records: Vec<Arc<Record>>,
    /// Unrecognised sections kept for pass-through use only
    pub containers: Vec<Arc<Record>>,
}

/// Split configuration text into named sections.
pub fn tokenize(raw: &str) -> Result<IndexMap<String, Section>> {
    let mut sections: IndexMap<String, Section> = IndexMap::new();
    let mut current: Option<String> = None;

    for (index, line) in raw.lines().enumerate() {
        let lineno = index + 1;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            if line.starts_with("[[") {
                return Err(DirectorError::Config(format!(
                    "line {}: nested sections are not supported '{}'",
                    lineno, line
                )));
            }
            let name = line
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .map(str::trim)
                .ok_or_else(|| {
                    DirectorError::Config(format!("line {}: malformed section header '{}'", lineno, line))
                })?;
            if name.is_empty() {
                return Err(DirectorError::Config(format!(
                    "line {}: empty section name",
                    lineno
                )));
            }
            if sections.contains_key(name) {
                return Err(DirectorError::Config(format!(
                    "Duplicate section name '{}' (line {})",
                    name, lineno
                )));
            }
            sections.insert(name.to_string(), Section::new());
            current = Some(name.to_string());
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            DirectorError::Config(format!("line {}: expected 'key = value' not '{}'", lineno, line))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(DirectorError::Config(format!("line {}: empty key", lineno)));
        }

        let Some(section_name) = current.as_ref() else {
            debug!("Ignoring key '{}' outside of any section (line {})", key, lineno);
            continue;
        };

        let section = sections
            .get_mut(section_name)
            .ok_or_else(|| DirectorError::Config(format!("line {}: lost section '{}'", lineno, section_name)))?;
        if section.contains_key(key) {
            return Err(DirectorError::Config(format!(
                "Duplicate key '{}' in section '{}' (line {})",
                key, section_name, lineno
            )));
        }
        section.insert(key.to_string(), clean_value(value));
    }

    Ok(sections)
}

fn clean_value(value: &str) -> String {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Classify a section by its name and shape
pub fn classify(name: &str, section: &Section) -> Role {
    if let Some(role) = Role::from_reserved_section(name) {
        role
    } else if section.contains_key("agent") {
        Role::Agent
    } else if section.contains_key("controller") {
        Role::Controller
    } else {
        Role::Container
    }
}

/// Build typed records out of tokenized sections.
pub fn recover(
    sections: &IndexMap<String, Section>,
    state: &mut AllocationState,
) -> Result<ParsedConfig> {
    if !sections.contains_key("director") {
        return Err(DirectorError::Config(
            "The [director] section was not found!".to_string(),
        ));
    }

    let mut records: Vec<Record> = Vec::new();
    let mut agents: Vec<Record> = Vec::new();
    let mut containers: Vec<Arc<Record>> = Vec::new();

    for (name, section) in sections {
        let role = classify(name, section);
        let explicit = section
            .get("order")
            .map(|value| parse_integer(name, "order", value))
            .transpose()?;

        let order = match (explicit, role) {
            (Some(order), _) => order,
            (None, Role::Agent) => state.agent_order(),
            (None, role) => match role.default_order() {
                Some(order) => order,
                None => state.section_order(),
            },
        };

        let record = Record::build(role, name, section, order)?;
        match role {
            Role::Agent => agents.push(record),
            Role::Container => {
                debug!("Section '{}' is not supervised, keeping it as pass-through", name);
                containers.push(Arc::new(record));
            }
            _ => records.push(record),
        }
    }

    agents.sort_by_key(|agent| agent.order);
    match records.iter_mut().find(|r| r.role() == Role::Agency) {
        Some(agency) => agency.set_agents(agents.into_iter().map(Arc::new).collect()),
        None if !agents.is_empty() => {
            debug!("No [agency] section, dropping {} agent(s)", agents.len());
        }
        None => {}
    }

    records.sort_by_key(|record| record.order);
    for pair in records.windows(2) {
        if pair[0].order == pair[1].order {
            return Err(DirectorError::Config(format!(
                "'{}' and '{}' share order {}",
                pair[0].name, pair[1].name, pair[0].order
            )));
        }
    }

    for record in &records {
        record.validate()?;
        for agent in record.agents() {
            agent.validate()?;
        }
    }

    Ok(ParsedConfig {
        sections: sections.clone(),
        records: records.into_iter().map(Arc::new).collect(),
        containers,
    })
}

/// Tokenize and recover in one go with fresh allocation counters
pub fn parse_document(raw: &str) -> Result<ParsedConfig> {
    let sections = tokenize(raw)?;
    recover(&sections, &mut AllocationState::default())
}

/// Parse configuration text into the ordered list of supervised records.
pub fn parse(raw: &str) -> Result<Vec<Arc<Record>>> {
    Ok(parse_document(raw)?.records)
}
