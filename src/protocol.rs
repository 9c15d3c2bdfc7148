//! Remote-control protocol
//!
//! [`ControlReceiver`] answers director commands arriving over a
//! [`MessageBus`]; [`ControlClient`] is the caller's side of the same
//! commands. Every answer is a [`Reply`] of the form
//! `{"result": "ok"|"error", "data": ...}` and handler failures never cross the
//! bus as anything else.

use crate::bus::{
    Envelope, MessageBus, DIRECTOR_EVENTS, EVT, EVT_DIRECTOR_CONFIGURATION,
    EVT_DIRECTOR_CTRLRELOAD, EVT_DIRECTOR_CTRLSTART, EVT_DIRECTOR_CTRLSTATE,
    EVT_DIRECTOR_CTRLSTOP, EVT_DIRECTOR_EXIT_ALL, EVT_DIRECTOR_PING,
};
use crate::config::{reload_controller, Flag, Role, Section, SharedConfig};
use crate::controllers::run_phase;
use crate::error::{DirectorError, Phase, Result};
use crate::loader::LoadContext;
use crate::manager::ExitHandle;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Caller-side timeout for most commands
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Caller-side timeout for `ping` and `exitAll`
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
}

/// Answer to a remote command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub result: Outcome,
    pub data: Value,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self {
            result: Outcome::Ok,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Outcome::Error,
            data: Value::String(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == Outcome::Ok
    }

    /// Data on success, [`DirectorError::Remote`] carrying the message otherwise
    pub fn into_result(self) -> Result<Value> {
        match self.result {
            Outcome::Ok => Ok(self.data),
            Outcome::Error => Err(DirectorError::Remote(match self.data {
                Value::String(message) => message,
                other => other.to_string(),
            })),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "result": self.result, "data": self.data })
    }
}

impl<T: Serialize> From<Result<T>> for Reply {
    fn from(outcome: Result<T>) -> Self {
        match outcome.and_then(|data| serde_json::to_value(data).map_err(|e| anyhow::Error::from(e).into())) {
            Ok(data) => Reply::ok(data),
            Err(e) => Reply::error(e.to_string()),
        }
    }
}

/// One row of the `controllerState` answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStateEntry {
    pub name: String,
    pub disabled: Flag,
    pub started: bool,
    pub config: Section,
}

/// State of every supervised record except the director
pub async fn controller_state(config: &SharedConfig) -> Result<Vec<ControllerStateEntry>> {
    let store = config.get_cfg()?;
    let mut state = Vec::with_capacity(store.records.len());
    for record in store.records.iter().filter(|r| r.role() != Role::Director) {
        let started = match record.controller() {
            Some(controller) => run_phase(record, &controller, Phase::IsStarted).await?,
            None => false,
        };
        state.push(ControllerStateEntry {
            name: record.name.clone(),
            disabled: record.disabled,
            started,
            config: record.config.clone(),
        });
    }
    Ok(state)
}

fn section_from_value(value: &Value) -> Result<Section> {
    let Value::Object(map) = value else {
        return Err(DirectorError::Remote(format!(
            "expected a mapping of settings, not '{}'",
            value
        )));
    };
    Ok(map
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect())
}

/// Director side of the protocol
#[derive(Debug, Clone)]
pub struct ControlReceiver {
    ctx: LoadContext,
    exit: ExitHandle,
}

impl ControlReceiver {
    pub fn new(ctx: LoadContext, exit: ExitHandle) -> Self {
        Self { ctx, exit }
    }

    /// Echo the caller's token
    pub async fn ping(&self, token: Value) -> Reply {
        debug!("Ping received, replying with token {}", token);
        Reply::ok(token)
    }

    pub async fn controller_state(&self) -> Reply {
        controller_state(&self.ctx.config).await.into()
    }

    pub async fn controller_start(&self, name: &str) -> Reply {
        let store = match self.ctx.config.get_cfg() {
            Ok(store) => store,
            Err(e) => return Reply::error(e.to_string()),
        };
        let Some(record) = store.find(name).cloned() else {
            return Reply::error(format!("The controller '{}' was not found", name));
        };
        if record.role() == Role::Director {
            return Reply::error("The director is not a controller that can be started");
        }
        if !record.is_enabled() {
            return Reply::error(format!(
                "The controller '{}' is disabled and cannot be started",
                name
            ));
        }

        // Let the maintenance loop restart it again if it exits.
        record.set_was_stopped(false);
        let Some(controller) = record.controller() else {
            return Reply::error(format!("The controller '{}' is not loaded", name));
        };
        match run_phase(&record, &controller, Phase::Start).await {
            Ok(_) => Reply::ok(json!(format!("Service '{}' start called.", name))),
            Err(e) => {
                error!("{}", e);
                Reply::error(e.to_string())
            }
        }
    }

    pub async fn controller_stop(&self, name: &str) -> Reply {
        let store = match self.ctx.config.get_cfg() {
            Ok(store) => store,
            Err(e) => return Reply::error(e.to_string()),
        };
        let Some(record) = store.find(name).cloned() else {
            return Reply::error(format!("The controller '{}' was not found", name));
        };
        if record.role() == Role::Director {
            return Reply::error("The director cannot be stopped, use exitAll instead");
        }
        if !record.is_enabled() {
            return Reply::error(format!(
                "The controller '{}' is disabled and cannot be stopped",
                name
            ));
        }

        // Keep the maintenance loop from starting it again.
        record.set_was_stopped(true);
        let Some(controller) = record.controller() else {
            return Reply::error(format!("The controller '{}' is not loaded", name));
        };
        match run_phase(&record, &controller, Phase::Stop).await {
            Ok(_) => Reply::ok(json!(format!("Service '{}' stop called.", name))),
            Err(e) => {
                error!("{}", e);
                Reply::error(e.to_string())
            }
        }
    }

    pub async fn controller_reload(&self, name: &str, new_config: Section) -> Reply {
        match reload_controller(&self.ctx, name, new_config).await {
            Ok(()) => Reply::ok(json!(true)),
            Err(e) => {
                error!("{}", e);
                Reply::error(e.to_string())
            }
        }
    }

    pub async fn configuration(&self) -> Reply {
        self.ctx.config.export_configuration().into()
    }

    /// Acknowledge and ask the engine to shut everything down
    pub async fn exit_all(&self) -> Reply {
        warn!("Exit all received, the director is shutting down.");
        self.exit.request();
        Reply::ok(json!("ok"))
    }

    /// Dispatch one request by event name
    pub async fn handle(&self, envelope: &Envelope) -> Reply {
        let payload = &envelope.payload;
        match envelope.event.name.as_str() {
            EVT_DIRECTOR_PING => self.ping(payload.clone()).await,
            EVT_DIRECTOR_CTRLSTATE => self.controller_state().await,
            EVT_DIRECTOR_CTRLSTART | EVT_DIRECTOR_CTRLSTOP => {
                let Some(name) = payload.as_str() else {
                    return Reply::error(format!("expected a controller name, not '{}'", payload));
                };
                if envelope.event.name == EVT_DIRECTOR_CTRLSTART {
                    self.controller_start(name).await
                } else {
                    self.controller_stop(name).await
                }
            }
            EVT_DIRECTOR_CTRLRELOAD => {
                let parsed = payload
                    .as_array()
                    .filter(|items| items.len() == 2)
                    .and_then(|items| items[0].as_str().map(|name| (name, &items[1])));
                let Some((name, config)) = parsed else {
                    return Reply::error(format!(
                        "expected [name, settings] for a reload, not '{}'",
                        payload
                    ));
                };
                match section_from_value(config) {
                    Ok(section) => self.controller_reload(name, section).await,
                    Err(e) => Reply::error(e.to_string()),
                }
            }
            EVT_DIRECTOR_CONFIGURATION => self.configuration().await,
            EVT_DIRECTOR_EXIT_ALL => self.exit_all().await,
            other => Reply::error(format!("Unknown director command '{}'", other)),
        }
    }

    /// Subscribe to every director event and answer requests as they arrive.
    ///
    /// Each request runs on its own task so a slow controller call does not
    /// hold up other commands. Panics inside a handler become error replies.
    pub async fn serve(self, bus: Arc<dyn MessageBus>) -> Result<JoinHandle<()>> {
        let mut streams = Vec::with_capacity(DIRECTOR_EVENTS.len());
        for name in DIRECTOR_EVENTS {
            streams.push(bus.subscribe(name).await?);
        }

        let handle = tokio::spawn(async move {
            let mut listeners = Vec::new();
            for mut stream in streams {
                let receiver = self.clone();
                let bus = bus.clone();
                listeners.push(tokio::spawn(async move {
                    while let Some(envelope) = stream.recv().await {
                        let receiver = receiver.clone();
                        let bus = bus.clone();
                        tokio::spawn(async move {
                            debug!("{} ({}) received", envelope.event.name, envelope.event.uid);
                            let reply = AssertUnwindSafe(receiver.handle(&envelope))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    error!("Handler for {} panicked", envelope.event.name);
                                    Reply::error(format!(
                                        "internal error handling {}",
                                        envelope.event.name
                                    ))
                                });
                            if let Err(e) = bus.reply(&envelope.event, reply.to_value()).await {
                                error!("Unable to reply to {}: {}", envelope.event.name, e);
                            }
                        });
                    }
                }));
            }
            for listener in listeners {
                let _ = listener.await;
            }
            debug!("Control receiver finished");
        });

        Ok(handle)
    }
}

/// Caller side of the protocol
#[derive(Clone)]
pub struct ControlClient {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ControlClient {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, name: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let event = EVT(name);
        debug!("{} (request {}) sent", name, event.uid);
        let raw = self.bus.send_await(event, payload, timeout).await?;
        let reply: Reply = serde_json::from_value(raw)
            .map_err(|e| DirectorError::Bus(format!("malformed reply to {}: {}", name, e)))?;
        reply.into_result()
    }

    /// Check the director is present and answering
    pub async fn ping(&self) -> Result<()> {
        let token = Uuid::new_v4().to_string();
        let timeout = self.timeout.min(PRESENCE_TIMEOUT);
        let answer = self.request(EVT_DIRECTOR_PING, json!(token), timeout).await?;
        if answer.as_str() != Some(token.as_str()) {
            warn!("Received ping token '{}' is different to '{}'", answer, token);
        } else {
            debug!("Received correct ping from director.");
        }
        Ok(())
    }

    /// Tell the director to stop every controller and exit
    pub async fn exit_all(&self) -> Result<Value> {
        let timeout = self.timeout.min(PRESENCE_TIMEOUT);
        self.request(EVT_DIRECTOR_EXIT_ALL, Value::Null, timeout).await
    }

    pub async fn controller_state(&self) -> Result<Vec<ControllerStateEntry>> {
        let data = self
            .request(EVT_DIRECTOR_CTRLSTATE, Value::Null, self.timeout)
            .await?;
        serde_json::from_value(data)
            .map_err(|e| DirectorError::Bus(format!("malformed controller state: {}", e)))
    }

    pub async fn controller_start(&self, name: &str) -> Result<Value> {
        self.request(EVT_DIRECTOR_CTRLSTART, json!(name), self.timeout)
            .await
    }

    pub async fn controller_stop(&self, name: &str) -> Result<Value> {
        self.request(EVT_DIRECTOR_CTRLSTOP, json!(name), self.timeout)
            .await
    }

    pub async fn controller_reload(&self, name: &str, new_config: &Section) -> Result<Value> {
        self.request(EVT_DIRECTOR_CTRLRELOAD, json!([name, new_config]), self.timeout)
            .await
    }

    /// Exported configuration snapshot
    pub async fn configuration(&self) -> Result<Value> {
        self.request(EVT_DIRECTOR_CONFIGURATION, Value::Null, self.timeout)
            .await
    }
}
