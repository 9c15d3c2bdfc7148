//! Message bus
//!
//! The remote-control protocol only needs publish, request/reply and quit.
//! [`MessageBus`] captures that surface; [`LocalBus`] implements it in-process
//! with tokio channels. Every [`Event`] carries a fresh uid so a reply can be
//! matched to the request that caused it.

use crate::error::{DirectorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

pub const EVT_DIRECTOR_PING: &str = "EVT_DIRECTOR_PING";
pub const EVT_DIRECTOR_EXIT_ALL: &str = "EVT_DIRECTOR_EXIT_ALL";
pub const EVT_DIRECTOR_CTRLSTATE: &str = "EVT_DIRECTOR_CTRLSTATE";
pub const EVT_DIRECTOR_CTRLSTART: &str = "EVT_DIRECTOR_CTRLSTART";
pub const EVT_DIRECTOR_CTRLSTOP: &str = "EVT_DIRECTOR_CTRLSTOP";
pub const EVT_DIRECTOR_CTRLRELOAD: &str = "EVT_DIRECTOR_CTRLRELOAD";
pub const EVT_DIRECTOR_CONFIGURATION: &str = "EVT_DIRECTOR_CONFIGURATION";

/// Every event the director answers
pub const DIRECTOR_EVENTS: &[&str] = &[
    EVT_DIRECTOR_PING,
    EVT_DIRECTOR_EXIT_ALL,
    EVT_DIRECTOR_CTRLSTATE,
    EVT_DIRECTOR_CTRLSTART,
    EVT_DIRECTOR_CTRLSTOP,
    EVT_DIRECTOR_CTRLRELOAD,
    EVT_DIRECTOR_CONFIGURATION,
];

/// A named, uniquely addressable event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub uid: Uuid,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uid: Uuid::new_v4(),
        }
    }
}

/// Shorthand for [`Event::new`]
#[allow(non_snake_case)]
pub fn EVT(name: &str) -> Event {
    Event::new(name)
}

/// What subscribers receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: Event,
    pub payload: Value,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish without waiting for an answer
    async fn send(&self, event: Event, payload: Value) -> Result<()>;

    /// Publish and wait up to `timeout` for the reply
    async fn send_await(&self, event: Event, payload: Value, timeout: Duration) -> Result<Value>;

    /// Answer a request received through a subscription
    async fn reply(&self, event: &Event, payload: Value) -> Result<()>;

    /// Receive every event published under `name`
    async fn subscribe(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Envelope>>;

    /// Ask everything running on the bus to finish
    async fn quit(&self);

    /// Watch channel that flips to `true` once [`MessageBus::quit`] was called
    fn quit_signal(&self) -> watch::Receiver<bool>;
}

/// Run `main` until it finishes or the bus quits.
///
/// Returns `None` when the bus quit first.
pub async fn run<F>(bus: &dyn MessageBus, main: F) -> Option<F::Output>
where
    F: Future,
{
    let mut quit = bus.quit_signal();
    if *quit.borrow() {
        return None;
    }
    tokio::select! {
        output = main => Some(output),
        _ = quit.wait_for(|quitting| *quitting) => None,
    }
}

#[derive(Debug)]
struct LocalBusInner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Value>>>,
    quit: watch::Sender<bool>,
}

/// In-process bus built on tokio channels
#[derive(Debug, Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            inner: Arc::new(LocalBusInner {
                subscribers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                quit,
            }),
        }
    }

    /// Deliver to live subscribers; returns how many received it
    fn publish(&self, envelope: Envelope) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = subscribers.get_mut(&envelope.event.name) else {
            return 0;
        };
        senders.retain(|tx| tx.send(envelope.clone()).is_ok());
        senders.len()
    }

    fn take_pending(&self, uid: &Uuid) -> Option<oneshot::Sender<Value>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
    }

    /// Number of requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn send(&self, event: Event, payload: Value) -> Result<()> {
        let name = event.name.clone();
        if self.publish(Envelope { event, payload }) == 0 {
            debug!("No subscribers for '{}'", name);
        }
        Ok(())
    }

    async fn send_await(&self, event: Event, payload: Value, timeout: Duration) -> Result<Value> {
        let uid = event.uid;
        let name = event.name.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid, tx);

        if self.publish(Envelope { event, payload }) == 0 {
            // Nobody will answer; wait out the timeout like a remote caller would.
            debug!("No subscribers for '{}' ({})", name, uid);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DirectorError::Bus(format!(
                "reply channel for '{}' closed",
                name
            ))),
            Err(_) => {
                self.take_pending(&uid);
                warn!("'{}' ({}) timed out after {:?}", name, uid, timeout);
                Err(DirectorError::SignalTimeout(timeout))
            }
        }
    }

    async fn reply(&self, event: &Event, payload: Value) -> Result<()> {
        match self.take_pending(&event.uid) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    debug!("Requester of '{}' ({}) went away", event.name, event.uid);
                }
            }
            None => debug!("Nobody is waiting on '{}' ({})", event.name, event.uid),
        }
        Ok(())
    }

    async fn subscribe(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        if *self.inner.quit.borrow() {
            return Err(DirectorError::Bus("the bus has quit".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn quit(&self) {
        debug!("Message bus quitting");
        self.inner.quit.send_replace(true);
        // Dropping the senders ends every subscription stream.
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn quit_signal(&self) -> watch::Receiver<bool> {
        self.inner.quit.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_are_unique() {
        let a = EVT(EVT_DIRECTOR_PING);
        let b = EVT(EVT_DIRECTOR_PING);
        assert_eq!(a.name, b.name);
        assert_ne!(a.uid, b.uid);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("echo").await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                responder.reply(&envelope.event, envelope.payload).await.unwrap();
            }
        });

        let reply = bus
            .send_await(EVT("echo"), json!("hello"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!("hello"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_await_times_out() {
        let bus = LocalBus::new();
        let err = bus
            .send_await(EVT("nobody"), json!(null), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectorError::SignalTimeout(_)));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_quit_ends_run_and_subscriptions() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("x").await.unwrap();
        let quitter = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            quitter.quit().await;
        });

        let outcome = run(&bus, std::future::pending::<()>()).await;
        assert!(outcome.is_none());
        assert!(rx.recv().await.is_none());
        assert!(bus.subscribe("x").await.is_err());
    }

    #[tokio::test]
    async fn test_run_returns_main_output() {
        let bus = LocalBus::new();
        assert_eq!(run(&bus, async { 7 }).await, Some(7));
    }
}
