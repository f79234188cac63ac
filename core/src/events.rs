//! Per-run progress events and the in-process event bus.
//!
//! Publish/subscribe keyed by run id on top of `tokio::sync::broadcast`.
//! Delivery is fire-and-forget: an event published while nobody listens
//! on that run is dropped, and a late subscriber only sees what is
//! published after it attached. There is no replay buffer.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Per-run channel depth before slow subscribers start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Finished,
}

/// One progress event of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Log {
        level: LogLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        message: String,
    },
    Step {
        step: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<serde_json::Value>,
    },
}

impl RunEvent {
    pub fn log(level: LogLevel, step: Option<&str>, message: impl Into<String>) -> Self {
        RunEvent::Log {
            level,
            step: step.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn started(step: &str) -> Self {
        RunEvent::Step {
            step: step.to_string(),
            status: StepStatus::Started,
            extra: None,
        }
    }

    pub fn finished(step: &str, extra: Option<serde_json::Value>) -> Self {
        RunEvent::Step {
            step: step.to_string(),
            status: StepStatus::Finished,
            extra,
        }
    }
}

/// Anything that accepts run events.
///
/// Implementations must not block and must not fail the caller; a
/// dropped event is acceptable.
pub trait EventSink: Send + Sync {
    fn publish(&self, run_id: &str, event: RunEvent);
}

/// In-process pub/sub keyed by run id.
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<RunEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Attach a subscriber to `run_id`. Only events published from now on
    /// are observed.
    pub fn subscribe(&self, run_id: &str) -> EventStream {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let rx = channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        EventStream {
            run_id: run_id.to_string(),
            rx,
        }
    }

    /// Publish to every current subscriber of `run_id`. Returns how many
    /// subscribers the event reached.
    pub fn send(&self, run_id: &str, event: RunEvent) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = channels.get(run_id) else {
            return 0;
        };
        match tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                // Every subscriber is gone; nothing to buffer for.
                channels.remove(run_id);
                0
            }
        }
    }

    /// Runs with a live channel.
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventSink for EventBus {
    fn publish(&self, run_id: &str, event: RunEvent) {
        self.send(run_id, event);
    }
}

/// Lazy, unbounded sequence of events for one run.
pub struct EventStream {
    run_id: String,
    rx: broadcast::Receiver<RunEvent>,
}

impl EventStream {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next event, in publish order. Returns `None` only once the bus
    /// itself is gone. A subscriber that falls behind skips what it missed.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %self.run_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;

    async fn next_within(stream: &mut EventStream, ms: u64) -> Option<RunEvent> {
        tokio::time::timeout(Duration::from_millis(ms), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn late_subscriber_never_sees_earlier_event() {
        let bus = EventBus::new();
        let mut early = bus.subscribe("run-1");

        bus.publish("run-1", RunEvent::started("clone_repo"));
        let mut late = bus.subscribe("run-1");
        bus.publish("run-1", RunEvent::finished("clone_repo", None));

        assert_eq!(
            next_within(&mut late, 200).await,
            Some(RunEvent::finished("clone_repo", None))
        );
        assert_eq!(next_within(&mut late, 50).await, None);

        assert_eq!(
            next_within(&mut early, 200).await,
            Some(RunEvent::started("clone_repo"))
        );
        assert_eq!(
            next_within(&mut early, 200).await,
            Some(RunEvent::finished("clone_repo", None))
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.send("run-1", RunEvent::started("triage")), 0);
        assert_eq!(bus.channel_count(), 0);

        let mut stream = bus.subscribe("run-1");
        assert_eq!(next_within(&mut stream, 50).await, None);
    }

    #[tokio::test]
    async fn subscribers_observe_publish_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe("run-1");
        let steps = ["clone_repo", "analyze_repo", "generate_tests_docs", "run_smoke"];
        for step in steps {
            bus.publish("run-1", RunEvent::started(step));
        }
        for step in steps {
            assert_eq!(
                next_within(&mut stream, 200).await,
                Some(RunEvent::started(step))
            );
        }
    }

    #[tokio::test]
    async fn runs_do_not_interleave() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("run-a");
        let mut b = bus.subscribe("run-b");

        bus.publish("run-b", RunEvent::log(LogLevel::Info, None, "for b"));
        assert_eq!(next_within(&mut a, 50).await, None);
        assert_eq!(
            next_within(&mut b, 200).await,
            Some(RunEvent::log(LogLevel::Info, None, "for b"))
        );
    }

    #[tokio::test]
    async fn dropped_subscribers_release_the_channel() {
        let bus = EventBus::new();
        let stream = bus.subscribe("run-1");
        assert_eq!(bus.channel_count(), 1);
        drop(stream);

        assert_eq!(bus.send("run-1", RunEvent::started("done")), 0);
        assert_eq!(bus.channel_count(), 0);
    }

    #[test]
    fn event_wire_shape() {
        let step = serde_json::to_value(RunEvent::finished(
            "run_smoke",
            Some(serde_json::json!({"ok": true, "exit_code": 0})),
        ))
        .unwrap_or_default();
        assert_eq!(
            step,
            serde_json::json!({
                "type": "step",
                "step": "run_smoke",
                "status": "finished",
                "extra": {"ok": true, "exit_code": 0}
            })
        );

        let log = serde_json::to_value(RunEvent::log(LogLevel::Error, Some("error"), "boom"))
            .unwrap_or_default();
        assert_eq!(
            log,
            serde_json::json!({"type": "log", "level": "error", "step": "error", "message": "boom"})
        );
    }
}
