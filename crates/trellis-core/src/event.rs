use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of events retained before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Event type tag. Well-known types have their own variant; nodes may emit
/// any other string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    NodeStart,
    NodeEnd,
    Retry,
    Checkpoint,
    BudgetExceeded,
    HealthMetrics,
    ToolCall,
    ToolResult,
    Error,
    Aborted,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NodeStart => "node_start",
            Self::NodeEnd => "node_end",
            Self::Retry => "retry",
            Self::Checkpoint => "checkpoint",
            Self::BudgetExceeded => "budget_exceeded",
            Self::HealthMetrics => "health_metrics",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Custom(s) => s,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "node_start" => Self::NodeStart,
            "node_end" => Self::NodeEnd,
            "retry" => Self::Retry,
            "checkpoint" => Self::Checkpoint,
            "budget_exceeded" => Self::BudgetExceeded,
            "health_metrics" => Self::HealthMetrics,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "error" => Self::Error,
            "aborted" => Self::Aborted,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Success,
    Failure,
    Warning,
    Info,
}

/// Append-only log record. Large payloads live in the stream's side table
/// under `payload_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub status: EventStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Optional fields for [`EventStream::emit`].
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub node_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl EmitOptions {
    pub fn node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Which events a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(EventType),
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => *kind == event.kind,
        }
    }
}

impl From<&str> for EventFilter {
    fn from(s: &str) -> Self {
        if s == "*" {
            Self::All
        } else {
            Self::Kind(EventType::from(s))
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(kind: EventType) -> Self {
        Self::Kind(kind)
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Serializable copy of the log and its payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLogSnapshot {
    pub events: Vec<Event>,
    #[serde(default)]
    pub payloads: HashMap<String, serde_json::Value>,
}

struct StreamInner {
    events: VecDeque<Event>,
    payloads: HashMap<String, serde_json::Value>,
    listeners: Vec<(u64, EventFilter, Listener)>,
    next_listener: u64,
    /// Total events ever appended, including evicted ones.
    cursor: u64,
}

/// Bounded, append-only event log shared by the runner and its nodes.
///
/// Listeners are invoked synchronously after the log lock is released, so a
/// listener may itself emit. Async consumers can use [`EventStream::subscribe`].
pub struct EventStream {
    inner: Arc<Mutex<StreamInner>>,
    capacity: usize,
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                events: VecDeque::new(),
                payloads: HashMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
                cursor: 0,
            })),
            capacity: capacity.max(1),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        // A panicking listener never holds this lock, so poisoning only
        // means another emitter panicked mid-append; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and notify listeners.
    pub fn emit(
        &self,
        kind: impl Into<EventType>,
        status: EventStatus,
        summary: impl Into<String>,
        options: EmitOptions,
    ) -> Event {
        let id = Uuid::new_v4().to_string();
        let payload_ref = options.payload.as_ref().map(|_| format!("payload-{}", id));
        let event = Event {
            id,
            timestamp: Utc::now(),
            kind: kind.into(),
            status,
            summary: summary.into(),
            node_id: options.node_id,
            payload_ref: payload_ref.clone(),
            metadata: options.metadata,
        };

        let listeners: Vec<Listener> = {
            let mut inner = self.lock();
            if let (Some(r), Some(payload)) = (payload_ref, options.payload) {
                inner.payloads.insert(r, payload);
            }
            inner.events.push_back(event.clone());
            inner.cursor += 1;
            self.evict(&mut inner);
            inner
                .listeners
                .iter()
                .filter(|(_, filter, _)| filter.matches(&event))
                .map(|(_, _, l)| Arc::clone(l))
                .collect()
        };

        for listener in listeners {
            listener(&event);
        }
        // Ignore error if no receivers
        let _ = self.tx.send(event.clone());
        event
    }

    fn evict(&self, inner: &mut StreamInner) {
        while inner.events.len() > self.capacity {
            if let Some(old) = inner.events.pop_front() {
                if let Some(r) = old.payload_ref {
                    inner.payloads.remove(&r);
                }
            }
        }
    }

    /// Register a listener for one event type, or `"*"` for all.
    pub fn on(
        &self,
        filter: impl Into<EventFilter>,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, filter.into(), Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.iter().cloned().collect()
    }

    /// Retained events whose absolute index is at least `index`.
    pub fn events_since(&self, index: u64) -> Vec<Event> {
        let inner = self.lock();
        let first = inner.cursor - inner.events.len() as u64;
        let skip = index.saturating_sub(first) as usize;
        inner.events.iter().skip(skip).cloned().collect()
    }

    pub fn events_of(&self, kind: &EventType) -> Vec<Event> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.kind == *kind)
            .cloned()
            .collect()
    }

    pub fn payload(&self, payload_ref: &str) -> Option<serde_json::Value> {
        self.lock().payloads.get(payload_ref).cloned()
    }

    /// Number of events ever appended. Used as the checkpoint event index.
    pub fn cursor(&self) -> u64 {
        self.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn export(&self) -> EventLogSnapshot {
        let inner = self.lock();
        EventLogSnapshot {
            events: inner.events.iter().cloned().collect(),
            payloads: inner.payloads.clone(),
        }
    }

    /// Append a previously exported log. Listeners are not replayed.
    pub fn import(&self, snapshot: EventLogSnapshot) {
        let mut inner = self.lock();
        let EventLogSnapshot { events, mut payloads } = snapshot;
        for event in events {
            if let Some(r) = &event.payload_ref {
                if let Some(payload) = payloads.remove(r) {
                    inner.payloads.insert(r.clone(), payload);
                }
            }
            inner.events.push_back(event);
            inner.cursor += 1;
        }
        self.evict(&mut inner);
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Handle returned by [`EventStream::on`]. The listener stays registered
/// until the handle is dropped or unsubscribed.
#[must_use = "dropping a Subscription removes its listener immediately"]
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<StreamInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.listeners.retain(|(id, _, _)| *id != self.id);
        }
    }
}
