//! Controller contract
//!
//! A controller is the implementation behind one supervised configuration
//! record. The engine drives it through `set_up`, then repeated
//! `is_started`/`start`/`stop` checks, and finally `tear_down`. Everything
//! except `set_up` and `tear_down` must tolerate being called repeatedly.

pub mod agency;
pub mod commandline;
pub mod webadmin;

use crate::config::{Record, Section};
use crate::error::{DirectorError, Phase, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

pub use agency::AgencyController;
pub use commandline::CommandLineController;
pub use webadmin::WebAdminController;

/// Lifecycle every loaded controller implements
#[async_trait]
pub trait Controller: Send {
    /// Receive the record's raw section before the first start
    async fn set_up(&mut self, config: &Section) -> anyhow::Result<()>;

    async fn start(&mut self) -> anyhow::Result<()>;

    async fn is_started(&mut self) -> anyhow::Result<bool>;

    async fn stop(&mut self) -> anyhow::Result<()>;

    async fn is_stopped(&mut self) -> anyhow::Result<bool>;

    async fn tear_down(&mut self) -> anyhow::Result<()>;
}

/// Controller instance shared between the engine and the control receiver
pub type SharedController = Arc<Mutex<Box<dyn Controller>>>;

pub fn shared_controller<C: Controller + 'static>(controller: C) -> SharedController {
    Arc::new(Mutex::new(Box::new(controller)))
}

/// Stand-in module for the director record; it is always running.
#[derive(Debug, Default)]
pub struct DirectorPlaceholder;

#[async_trait]
impl Controller for DirectorPlaceholder {
    async fn set_up(&mut self, _config: &Section) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_started(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_stopped(&mut self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn tear_down(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run one lifecycle phase against `record`'s controller.
///
/// Phases without a meaningful answer report `true`. Failures come back as
/// [`DirectorError::Lifecycle`] naming the record and phase.
pub async fn run_phase(record: &Record, controller: &SharedController, phase: Phase) -> Result<bool> {
    let mut guard = controller.lock().await;
    apply_phase(record, &mut guard, phase).await
}

/// [`run_phase`] for a caller already holding the controller's lock
pub(crate) async fn apply_phase(
    record: &Record,
    controller: &mut Box<dyn Controller>,
    phase: Phase,
) -> Result<bool> {
    let outcome = match phase {
        Phase::SetUp => controller.set_up(&record.config).await.map(|_| true),
        Phase::Start => controller.start().await.map(|_| true),
        Phase::IsStarted => controller.is_started().await,
        Phase::Stop => controller.stop().await.map(|_| true),
        Phase::IsStopped => controller.is_stopped().await,
        Phase::TearDown => controller.tear_down().await.map(|_| true),
    };
    outcome.map_err(|e| DirectorError::lifecycle(record, phase, e))
}

/// Stop `record`'s controller if it is running, tear it down and detach it.
///
/// The record is marked stopped and unloaded while the controller's lock is
/// held, so a maintenance pass waiting on the lock will not start it again.
/// Failures are logged; every step is attempted.
pub(crate) async fn retire(record: &Record) {
    record.set_was_stopped(true);
    let Some(controller) = record.controller() else {
        return;
    };
    let mut guard = controller.lock().await;
    record.clear_module();

    match apply_phase(record, &mut guard, Phase::IsStarted).await {
        Ok(true) => {
            if let Err(e) = apply_phase(record, &mut guard, Phase::Stop).await {
                error!("{}", e);
            }
        }
        Ok(false) => {}
        Err(e) => error!("{}", e),
    }
    if let Err(e) = apply_phase(record, &mut guard, Phase::TearDown).await {
        error!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, Section};
    use crate::loader::Module;
    use crate::testing::{CallLog, RecordingController};

    #[tokio::test]
    async fn test_retire_stops_and_detaches() {
        let log = CallLog::new();
        let record = Record::build(
            Role::Controller,
            "svc",
            &Section::from([("controller".to_string(), "test.rec".to_string())]),
            4,
        )
        .unwrap();
        record.set_module(Module::Controller(shared_controller(RecordingController::new(
            "svc",
            log.clone(),
        ))));
        let controller = record.controller().unwrap();
        run_phase(&record, &controller, Phase::Start).await.unwrap();

        retire(&record).await;
        assert!(record.was_stopped());
        assert!(record.controller().is_none());
        assert_eq!(
            log.calls_for("svc"),
            vec!["start", "isStarted", "stop", "tearDown"]
        );

        // Nothing left to retire
        retire(&record).await;
        assert_eq!(log.count("svc", "tearDown"), 1);
    }

    #[tokio::test]
    async fn test_director_placeholder_always_started() {
        let record = Record::build(Role::Director, "director", &Section::new(), 0).unwrap();
        let controller = record.controller().unwrap();
        assert!(run_phase(&record, &controller, Phase::IsStarted).await.unwrap());
        run_phase(&record, &controller, Phase::Stop).await.unwrap();
        assert!(run_phase(&record, &controller, Phase::IsStarted).await.unwrap());
        assert!(!run_phase(&record, &controller, Phase::IsStopped).await.unwrap());
    }
}
