//! Supervision engine
//!
//! The [`Manager`] loads every enabled controller, sets it up, and then polls:
//! each pass starts what should be running and stops what a remote caller
//! asked to stop. [`run_director`] wires the engine to a message bus and the
//! remote-control receiver and runs it until an exit is requested.

use crate::bus::{LocalBus, MessageBus};
use crate::config::{Record, Role, SharedConfig};
use crate::controllers::{apply_phase, run_phase, SharedController};
use crate::error::{DirectorError, FailurePolicy, Phase, Result};
use crate::loader::{load_controllers, LoadContext, ModuleRegistry};
use crate::protocol::ControlReceiver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Poll interval used when the director record is missing
pub const DEFAULT_POLL_TIME: Duration = Duration::from_secs(1);

/// Cloneable request to end the maintenance loop
#[derive(Debug, Clone)]
pub struct ExitHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ExitHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once an exit has been requested
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

#[derive(Debug)]
pub struct Manager {
    ctx: LoadContext,
    policy: FailurePolicy,
    exit: ExitHandle,
}

impl Manager {
    pub fn new(ctx: LoadContext, policy: FailurePolicy) -> Self {
        Self {
            ctx,
            policy,
            exit: ExitHandle::new(),
        }
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    pub fn keep_going_on_exceptions(&self) -> bool {
        self.policy.keep_going()
    }

    pub fn context(&self) -> &LoadContext {
        &self.ctx
    }

    /// Supervised records in order, director and containers excluded.
    ///
    /// Read from the store on every call so a reload is picked up on the next
    /// pass.
    fn supervised(&self) -> Result<Vec<Arc<Record>>> {
        let store = self.ctx.config.get_cfg()?;
        Ok(store
            .records
            .iter()
            .filter(|r| !matches!(r.role(), Role::Director | Role::Container))
            .cloned()
            .collect())
    }

    /// Loaded controller for the record called `name`
    pub fn controller(&self, name: &str) -> Option<SharedController> {
        let store = self.ctx.config.try_get()?;
        store.find(name)?.controller()
    }

    /// Load and set up every enabled controller.
    ///
    /// Import failures are logged and skipped. A `setUp` failure is fatal
    /// unless the policy keeps going. Returns the poll interval.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<Duration> {
        let store = self.ctx.config.get_cfg()?;
        let poll = store
            .director()
            .and_then(|d| d.director_settings())
            .and_then(|s| Duration::try_from_secs_f64(s.poll_time).ok())
            .unwrap_or(DEFAULT_POLL_TIME);

        load_controllers(&store.records, &self.ctx, FailurePolicy::KeepGoing)?;

        for record in self.supervised()? {
            if !record.is_enabled() {
                debug!("{} is disabled, skipping setUp", record);
                continue;
            }
            let Some(controller) = record.controller() else {
                warn!("{} module isn't loaded!", record);
                continue;
            };
            info!("Setting up {}", record);
            if let Err(e) = run_phase(&record, &controller, Phase::SetUp).await {
                error!("{}", e);
                if !self.keep_going_on_exceptions() {
                    return Err(e);
                }
            }
        }

        info!("Setup complete, polling every {:?}", poll);
        Ok(poll)
    }

    async fn step_record(&self, record: &Record, controller: &SharedController) -> Result<()> {
        if record.was_stopped() {
            if run_phase(record, controller, Phase::IsStarted).await? {
                info!("{} was stopped, making sure it is down", record);
                run_phase(record, controller, Phase::Stop).await?;
            }
        } else if record.is_enabled() && !run_phase(record, controller, Phase::IsStarted).await? {
            let mut guard = controller.lock().await;
            // Stopped or reloaded while we waited for the lock
            if record.was_stopped() || !record.is_loaded() {
                debug!("{} was retired, not starting it", record);
                return Ok(());
            }
            info!("{} is not running, starting it", record);
            apply_phase(record, &mut guard, Phase::Start).await?;
            let started = apply_phase(record, &mut guard, Phase::IsStarted).await?;
            debug!("{} started: {}", record, started);
        }
        Ok(())
    }

    /// One maintenance pass over the supervised controllers in order.
    ///
    /// A controller failure is logged. Unless the policy keeps going it also
    /// requests an exit and is returned.
    pub async fn step(&self) -> Result<()> {
        for record in self.supervised()? {
            let Some(controller) = record.controller() else {
                continue;
            };
            if let Err(e) = self.step_record(&record, &controller).await {
                error!("{}", e);
                if !self.keep_going_on_exceptions() {
                    error!("Shutting down now on exception in {}", record);
                    self.exit.request();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stop then tear down every loaded controller, in reverse order.
    ///
    /// Every controller is attempted regardless of earlier failures; the
    /// failures are returned.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Vec<DirectorError> {
        let mut failures = Vec::new();
        let records = match self.supervised() {
            Ok(records) => records,
            Err(e) => {
                warn!("Nothing to shut down: {}", e);
                return failures;
            }
        };
        let loaded: Vec<(Arc<Record>, SharedController)> = records
            .into_iter()
            .rev()
            .filter_map(|r| r.controller().map(|c| (r, c)))
            .collect();

        for phase in [Phase::Stop, Phase::TearDown] {
            for (record, controller) in &loaded {
                debug!("{} {}", phase, record);
                if let Err(e) = run_phase(record, controller, phase).await {
                    error!("{}", e);
                    failures.push(e);
                }
            }
        }
        info!("Shutdown complete");
        failures
    }

    /// Set up, poll until an exit is requested, then shut down.
    pub async fn run(&self) -> Result<()> {
        let poll = match self.setup().await {
            Ok(poll) => poll,
            Err(e) => {
                self.shutdown().await;
                return Err(e);
            }
        };

        let mut outcome = Ok(());
        while !self.exit.is_requested() {
            if let Err(e) = self.step().await {
                outcome = Err(e);
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.exit.wait() => {}
            }
        }

        info!("Exit requested, shutting down controllers");
        self.shutdown().await;
        outcome
    }
}

/// Run the director against the configuration already held by `config`.
///
/// With messaging enabled the remote-control receiver answers on an
/// in-process bus. Ctrl-C and `exitAll` both end the loop through the same
/// shutdown path.
pub async fn run_director(
    config: SharedConfig,
    registry: ModuleRegistry,
    policy: FailurePolicy,
) -> Result<()> {
    run_director_on(config, registry, policy, Arc::new(LocalBus::new())).await
}

/// [`run_director`] on a caller supplied bus. The bus is quit on return.
pub async fn run_director_on(
    config: SharedConfig,
    registry: ModuleRegistry,
    policy: FailurePolicy,
    bus: Arc<dyn MessageBus>,
) -> Result<()> {
    let store = config.get_cfg()?;
    let settings = store
        .director()
        .and_then(|d| d.director_settings())
        .cloned()
        .ok_or_else(|| DirectorError::Config("No director configuration found!".to_string()))?;

    let mut ctx = LoadContext::new(config, registry);
    if settings.messaging.is_yes() {
        ctx = ctx.with_bus(bus.clone());
    }

    let manager = Manager::new(ctx.clone(), policy);
    let exit = manager.exit_handle();

    let receiver_task = if settings.messaging.is_yes() {
        debug!(
            "Messaging on channel '{}' ({}:{})",
            settings.msg_channel, settings.msg_host, settings.msg_port
        );
        let receiver = ControlReceiver::new(ctx, exit.clone());
        Some(receiver.serve(bus.clone()).await?)
    } else {
        info!("Messaging is disabled, remote control is not available");
        None
    };

    let signal_exit = exit.clone();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, exiting.");
            signal_exit.request();
        }
    });

    let outcome = manager.run().await;

    signals.abort();
    bus.quit().await;
    if let Some(task) = receiver_task {
        let _ = task.await;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::controller_fn;
    use crate::testing::{CallLog, RecordingController};

    fn manager(raw: &str, log: &CallLog, policy: FailurePolicy) -> Manager {
        let registry = ModuleRegistry::new();
        let log = log.clone();
        registry.register_controller(
            "test.rec",
            controller_fn(move |_ctx, record| {
                Box::new(RecordingController::new(&record.name, log.clone()))
            }),
        );
        let config = SharedConfig::from_raw(raw, "").unwrap();
        Manager::new(LoadContext::new(config, registry), policy)
    }

    const RAW: &str = "\
[director]
poll_time = 0.01
[one]
controller = test.rec
[two]
controller = test.rec
[off]
controller = test.rec
disabled = yes
";

    #[tokio::test]
    async fn test_setup_returns_poll_time() {
        let log = CallLog::new();
        let m = manager(RAW, &log, FailurePolicy::Abort);
        let poll = m.setup().await.unwrap();
        assert_eq!(poll, Duration::from_millis(10));
        assert_eq!(log.calls_for("one"), vec!["setUp"]);
        assert!(log.calls_for("off").is_empty());
        assert!(m.controller("one").is_some());
        assert!(m.controller("off").is_none());
    }

    #[tokio::test]
    async fn test_step_starts_then_leaves_running() {
        let log = CallLog::new();
        let m = manager(RAW, &log, FailurePolicy::Abort);
        m.setup().await.unwrap();
        m.step().await.unwrap();
        assert_eq!(log.count("one", "start"), 1);
        assert_eq!(log.count("two", "start"), 1);
        m.step().await.unwrap();
        assert_eq!(log.count("one", "start"), 1);
    }

    #[tokio::test]
    async fn test_step_honours_was_stopped() {
        let log = CallLog::new();
        let m = manager(RAW, &log, FailurePolicy::Abort);
        m.setup().await.unwrap();
        m.step().await.unwrap();

        let store = m.context().config.get_cfg().unwrap();
        store.find("one").unwrap().set_was_stopped(true);
        m.step().await.unwrap();
        m.step().await.unwrap();
        assert_eq!(log.count("one", "stop"), 1);
        assert_eq!(log.count("one", "start"), 1);
    }

    #[tokio::test]
    async fn test_step_failure_requests_exit() {
        let raw = "\
[director]
[bad]
controller = test.rec
fail_on = start
[good]
controller = test.rec
";
        let log = CallLog::new();
        let m = manager(raw, &log, FailurePolicy::Abort);
        m.setup().await.unwrap();
        assert!(m.step().await.is_err());
        assert!(m.exit_handle().is_requested());
        assert_eq!(log.count("good", "start"), 0);

        let log = CallLog::new();
        let m = manager(raw, &log, FailurePolicy::KeepGoing);
        m.setup().await.unwrap();
        m.step().await.unwrap();
        assert!(!m.exit_handle().is_requested());
        assert_eq!(log.count("good", "start"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reverse_order_and_best_effort() {
        let raw = "\
[director]
[one]
controller = test.rec
fail_on = stop
[two]
controller = test.rec
";
        let log = CallLog::new();
        let m = manager(raw, &log, FailurePolicy::Abort);
        m.setup().await.unwrap();
        log.clear();
        let failures = m.shutdown().await;
        assert_eq!(failures.len(), 1);

        let phases: Vec<(String, String)> = log
            .calls()
            .into_iter()
            .filter(|(_, phase)| phase == "stop" || phase == "tearDown")
            .collect();
        assert_eq!(
            phases,
            vec![
                ("two".to_string(), "stop".to_string()),
                ("one".to_string(), "stop".to_string()),
                ("two".to_string(), "tearDown".to_string()),
                ("one".to_string(), "tearDown".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_setup_failure_is_fatal_unless_keep_going() {
        let raw = "\
[director]
[bad]
controller = test.rec
fail_on = setUp
";
        let log = CallLog::new();
        assert!(manager(raw, &log, FailurePolicy::Abort).setup().await.is_err());
        assert!(manager(raw, &log, FailurePolicy::KeepGoing).setup().await.is_ok());
    }

    #[tokio::test]
    async fn test_run_until_exit() {
        let log = CallLog::new();
        let m = Arc::new(manager(RAW, &log, FailurePolicy::Abort));
        let exit = m.exit_handle();
        let runner = m.clone();
        let task = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        exit.request();
        task.await.unwrap().unwrap();

        assert_eq!(log.count("one", "start"), 1);
        assert_eq!(log.count("one", "tearDown"), 1);
        assert_eq!(log.count("two", "tearDown"), 1);
    }

    #[tokio::test]
    async fn test_exit_handle() {
        let exit = ExitHandle::new();
        assert!(!exit.is_requested());
        let waiter = exit.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        exit.request();
        task.await.unwrap();
        assert!(exit.is_requested());
    }
}
