//! Reloading a single controller with new settings

use super::records::{parse_integer, Record, Role, Section};
use crate::controllers::{retire, run_phase};
use crate::error::{DirectorError, Phase, Result};
use crate::loader::{import_module, LoadContext};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Replace the controller called `name` with one built from `new_config`.
///
/// The replacement record keeps the same name and role; `order` comes from
/// `new_config` when given, otherwise from the old record. It is built,
/// validated, checked for an order clash and (unless disabled) imported
/// before the running module is touched, so those failures leave the old
/// controller running.
///
/// The old module is then stopped, torn down and detached, and the new one is
/// set up and published. If that setUp or the publish fails the new module is
/// torn down too, and the old record stays in the store marked stopped with
/// nothing loaded.
#[instrument(skip(ctx, new_config))]
pub async fn reload_controller(ctx: &LoadContext, name: &str, new_config: Section) -> Result<()> {
    let store = ctx.config.get_cfg()?;
    let old = store.find(name).cloned().ok_or_else(|| {
        DirectorError::ControllerReload(format!(
            "The controller '{}' was not found to be reloaded!",
            name
        ))
    })?;

    let role = old.role();
    if role == Role::Director {
        return Err(DirectorError::ControllerReload(
            "The director itself cannot be reloaded!".to_string(),
        ));
    }

    let order = match new_config.get("order") {
        Some(value) => parse_integer(name, "order", value)?,
        None => old.order,
    };

    let mut record = Record::build(role, name, &new_config, order)?;
    if role == Role::Agency {
        // Agent sections are not part of the reload mapping; rebuild them unloaded.
        let agents = old
            .agents()
            .iter()
            .map(|agent| {
                Record::build(Role::Agent, &agent.name, &agent.config, agent.order).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        record.set_agents(agents);
    }
    record.validate()?;
    store.check_order(name, order)?;

    if record.is_enabled() {
        if let Some(module) = import_module(Role::Controller, &record, ctx)? {
            record.set_module(module);
        }
    }

    retire(&old).await;

    if let Some(controller) = record.controller() {
        if let Err(e) = run_phase(&record, &controller, Phase::SetUp).await {
            warn!("{} failed to set up, tearing it down", record);
            retire(&record).await;
            return Err(e);
        }
    }

    let record = Arc::new(record);
    if let Err(e) = ctx.config.replace_record(record.clone(), new_config) {
        error!("{}", e);
        retire(&record).await;
        return Err(e);
    }
    info!("Reloaded {}", record);
    Ok(())
}
