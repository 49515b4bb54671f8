//! Per-session publish/subscribe event bus.
//!
//! One broadcast channel per session id for outbound [`AgendoEvent`]s, and
//! one mpsc channel per session id for inbound [`AgendoControl`] messages.
//! The bus owns no session state; it is a transport only — the session log
//! is the durable source of truth (see `session::log`).

use crate::session::types::{AgendoControl, AgendoEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::warn;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CONTROL_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<AgendoEvent>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn channel_for(&self, session_id: &str) -> broadcast::Sender<AgendoEvent> {
        if let Some(tx) = self.channels.read().await.get(session_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish an event. A send with no subscribers is not an error — the
    /// log file remains the source of truth for replay (`PublishFailure`
    /// is only logged, never surfaced to the session).
    pub async fn publish(&self, event: AgendoEvent) {
        let tx = self.channel_for(&event.session_id).await;
        if tx.send(event).is_err() {
            // No active subscribers right now; fine.
        }
    }

    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<AgendoEvent> {
        self.channel_for(session_id).await.subscribe()
    }

    /// Drop the channel once a session is fully torn down so the map
    /// doesn't grow unboundedly over a long-lived worker's lifetime.
    pub async fn remove(&self, session_id: &str) {
        self.channels.write().await.remove(session_id);
    }
}

/// Per-session inbound control channel. The supervisor owns the receiver
/// and processes one control message at a time (causal ordering within a
/// single subscription).
#[derive(Default)]
pub struct ControlBus {
    senders: RwLock<HashMap<String, mpsc::Sender<AgendoControl>>>,
}

impl ControlBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called once by the supervisor when it subscribes to its own
    /// session's control channel.
    pub async fn register(&self, session_id: &str) -> mpsc::Receiver<AgendoControl> {
        let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        self.senders.write().await.insert(session_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, session_id: &str) {
        self.senders.write().await.remove(session_id);
    }

    /// Send a control message to the session's supervisor, if one is
    /// registered. Returns `false` if no supervisor is currently attached
    /// (e.g. the session is idle) — callers log this as `ControlMalformed`-
    /// adjacent "dropped, no active supervisor" rather than erroring.
    pub async fn send(&self, session_id: &str, control: AgendoControl) -> bool {
        let sender = self.senders.read().await.get(session_id).cloned();
        match sender {
            Some(tx) => tx.send(control).await.is_ok(),
            None => {
                warn!(session_id, "control message dropped — no active supervisor");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::AgendoEventKind;

    #[tokio::test]
    async fn publish_reaches_a_subscriber_on_the_same_session() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1").await;
        bus.publish(AgendoEvent {
            id: 1,
            session_id: "s1".into(),
            ts: 0,
            kind: AgendoEventKind::AgentText { text: "hi".into() },
        })
        .await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.id, 1);
    }

    #[tokio::test]
    async fn sessions_do_not_cross_talk() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("a").await;
        let _rx_b = bus.subscribe("b").await;
        bus.publish(AgendoEvent {
            id: 1,
            session_id: "a".into(),
            ts: 0,
            kind: AgendoEventKind::AgentText { text: "hi".into() },
        })
        .await;
        let ev = rx_a.recv().await.unwrap();
        assert_eq!(ev.session_id, "a");
    }

    #[tokio::test]
    async fn control_send_without_registration_returns_false() {
        let bus = ControlBus::new();
        let delivered = bus.send("nope", AgendoControl::Cancel).await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn control_send_after_register_is_delivered() {
        let bus = ControlBus::new();
        let mut rx = bus.register("s1").await;
        let delivered = bus.send("s1", AgendoControl::Interrupt).await;
        assert!(delivered);
        assert!(matches!(rx.recv().await.unwrap(), AgendoControl::Interrupt));
    }
}
