//! In-process event bus.
//!
//! Subscribers are invoked synchronously from the emitter's execution
//! context, in registration order; anything slow must offload to its own
//! worker (the tracer fanout does exactly that). Events emitted by one
//! component reach each subscriber in emission order.

mod types;

pub use types::{
    AgentPayload, BrokerPayload, CachePayload, Component, ConnectionPayload,
    ContextEditEvaluation, ContextEditPayload, ConversationPayload, DebugPayload, Event,
    EventKind, EventMeta, FallbackPayload, FallbackPhase, GenerationPayload, MetricPayload,
    RoutingPayload, StreamingPayload, StructuredOutputPayload, SummarizationPayload,
    ToolCallPayload,
};

use chrono::Utc;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Identity of one agent session; threaded through every component so
/// events correlate across the hierarchy.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub session_id: String,
}

impl TraceContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_ids(trace_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

impl Event {
    /// Build an event with explicit correlation (start/end pairs share it).
    pub fn with_correlation(
        kind: EventKind,
        ctx: &TraceContext,
        hierarchy_level: u8,
        parent_id: Option<String>,
        correlation_id: String,
    ) -> Self {
        Self {
            meta: EventMeta {
                timestamp: Utc::now(),
                trace_id: ctx.trace_id.clone(),
                session_id: ctx.session_id.clone(),
                correlation_id,
                parent_id,
                hierarchy_level,
            },
            kind,
        }
    }

    /// Build a point event that does not pair with anything.
    pub fn point(
        kind: EventKind,
        ctx: &TraceContext,
        hierarchy_level: u8,
        parent_id: Option<String>,
    ) -> Self {
        Self::with_correlation(kind, ctx, hierarchy_level, parent_id, new_correlation_id())
    }
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Pub/sub hub. Cheap to clone via `Arc`; emitting with zero subscribers
/// is a no-op.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.push(subscriber);
    }

    pub fn emit(&self, event: Event) {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for sub in subs.iter() {
            sub.on_event(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
