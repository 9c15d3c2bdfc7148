//! Process-wide configuration store
//!
//! [`SharedConfig`] is the single handle threaded through the engine, the
//! loader and the remote-control receiver. It guards an optional
//! [`ConfigStore`]; every mutation swaps in a new store under the write lock so
//! readers always see a consistent snapshot.

use super::parser::parse_document;
use super::records::{Record, Role, Section};
use crate::error::{DirectorError, Result};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// One parsed configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    /// Text the store was parsed from
    pub raw: String,
    /// File the text was read from, empty when parsed from memory
    pub filename: String,
    /// Tokenized sections as they were parsed (updated on reload)
    pub sections: IndexMap<String, Section>,
    /// Supervised records sorted by order
    pub records: Vec<Arc<Record>>,
    /// Unsupervised pass-through sections
    pub containers: Vec<Arc<Record>>,
}

impl ConfigStore {
    pub fn parse(raw: &str, filename: &str) -> Result<Self> {
        let parsed = parse_document(raw)?;
        Ok(Self {
            raw: raw.to_string(),
            filename: filename.to_string(),
            sections: parsed.sections,
            records: parsed.records,
            containers: parsed.containers,
        })
    }

    fn by_role(&self, role: Role) -> Option<&Arc<Record>> {
        self.records.iter().find(|r| r.role() == role)
    }

    pub fn director(&self) -> Option<&Arc<Record>> {
        self.by_role(Role::Director)
    }

    pub fn broker(&self) -> Option<&Arc<Record>> {
        self.by_role(Role::Broker)
    }

    pub fn agency(&self) -> Option<&Arc<Record>> {
        self.by_role(Role::Agency)
    }

    pub fn webadmin(&self) -> Option<&Arc<Record>> {
        self.by_role(Role::WebAdmin)
    }

    /// Find a supervised record by section name
    pub fn find(&self, name: &str) -> Option<&Arc<Record>> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Fail if a record other than `name` already holds `order`
    pub fn check_order(&self, name: &str, order: i64) -> Result<()> {
        match self.records.iter().find(|r| r.name != name && r.order == order) {
            Some(clash) => Err(DirectorError::Config(format!(
                "'{}' and '{}' share order {}",
                clash.name, name, order
            ))),
            None => Ok(()),
        }
    }

    /// Pass-through section by name (e.g. logging settings)
    pub fn container(&self, name: &str) -> Option<&Arc<Record>> {
        self.containers.iter().find(|r| r.name == name)
    }

    /// Plain data snapshot: `{cfg, filename, director, agency, broker, webadmin}`
    pub fn export(&self) -> Value {
        let single = |record: Option<&Arc<Record>>| match record {
            Some(record) => record.export(),
            None => json!(""),
        };

        json!({
            "cfg": self.records.iter().map(|r| r.export()).collect::<Vec<_>>(),
            "filename": self.filename,
            "director": single(self.director()),
            "agency": single(self.agency()),
            "broker": single(self.broker()),
            "webadmin": single(self.webadmin()),
        })
    }
}

/// Shared, lock-guarded handle to the current configuration
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Option<Arc<ConfigStore>>>>,
}

impl SharedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a handle already holding `raw`
    pub fn from_raw(raw: &str, filename: &str) -> Result<Self> {
        let shared = Self::new();
        shared.set_cfg(raw, filename)?;
        Ok(shared)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Arc<ConfigStore>>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Arc<ConfigStore>>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current store, or `ConfigNotSetup`
    pub fn get_cfg(&self) -> Result<Arc<ConfigStore>> {
        self.try_get().ok_or(DirectorError::ConfigNotSetup)
    }

    pub fn try_get(&self) -> Option<Arc<ConfigStore>> {
        self.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.read().is_some()
    }

    /// Parse `raw` and replace the current store with it.
    ///
    /// On a parse error the previous store is left untouched.
    pub fn set_cfg(&self, raw: &str, filename: &str) -> Result<Arc<ConfigStore>> {
        let store = Arc::new(ConfigStore::parse(raw, filename)?);
        *self.write() = Some(store.clone());
        info!(
            "Configuration loaded ({} records) from {}",
            store.records.len(),
            if filename.is_empty() { "<memory>" } else { filename }
        );
        Ok(store)
    }

    /// Read and parse a configuration file
    pub fn load_file(&self, path: &Path) -> Result<Arc<ConfigStore>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DirectorError::Config(format!("unable to read '{}': {}", path.display(), e))
        })?;
        self.set_cfg(&raw, &path.display().to_string())
    }

    /// Swap only the record list, keeping raw text, filename and sections
    pub fn update_objs(&self, records: Vec<Arc<Record>>) -> Result<Arc<ConfigStore>> {
        let mut guard = self.write();
        let current = guard.as_ref().ok_or(DirectorError::ConfigNotSetup)?;
        let store = Arc::new(ConfigStore {
            records,
            ..ConfigStore::clone(current)
        });
        *guard = Some(store.clone());
        debug!("Configuration records updated");
        Ok(store)
    }

    /// Replace one record by name, re-sort and publish in a single write.
    ///
    /// The section mapping stored under the same name is replaced by `section`.
    pub(crate) fn replace_record(
        &self,
        record: Arc<Record>,
        section: Section,
    ) -> Result<Arc<ConfigStore>> {
        let mut guard = self.write();
        let current = guard.as_ref().ok_or(DirectorError::ConfigNotSetup)?;

        let mut records = current.records.clone();
        let slot = records
            .iter_mut()
            .find(|r| r.name == record.name)
            .ok_or_else(|| {
                DirectorError::ControllerReload(format!(
                    "The controller '{}' was not found to be reloaded!",
                    record.name
                ))
            })?;
        current.check_order(&record.name, record.order)?;
        *slot = record.clone();
        records.sort_by_key(|r| r.order);

        let mut sections = current.sections.clone();
        sections.insert(record.name.clone(), section);

        let store = Arc::new(ConfigStore {
            records,
            sections,
            ..ConfigStore::clone(current)
        });
        *guard = Some(store.clone());
        Ok(store)
    }

    /// Forget the current store
    pub fn clear(&self) {
        *self.write() = None;
    }

    /// Exported snapshot of the current store
    pub fn export_configuration(&self) -> Result<Value> {
        Ok(self.get_cfg()?.export())
    }

    /// Path of the file the configuration came from, if any
    pub fn filename(&self) -> Option<PathBuf> {
        self.try_get()
            .filter(|store| !store.filename.is_empty())
            .map(|store| PathBuf::from(&store.filename))
    }
}
