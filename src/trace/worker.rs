//! Generic batching worker shared by all tracer backends.
//!
//! Each backend gets one worker: a bounded queue fed synchronously from the
//! event bus, a background task that flushes on a 2 s timer or when the
//! batch reaches 50 commands, and a periodic cleanup pass over the span
//! side tables so long-lived processes do not accumulate state.

use crate::events::{Event, EventKind, EventSubscriber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 1024;
const BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const SPAN_RETENTION: Duration = Duration::from_secs(3600);

/// Span categories backends may want to frame differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Agent,
    Conversation,
    Generation,
    ToolCall,
    Connection,
    Point,
}

/// A span opening. `span_id` is the event correlation id; start/end pairs
/// meet on it.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub span_id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub metadata: Value,
}

/// A span closing: end time plus output or error.
#[derive(Debug, Clone)]
pub struct SpanUpdate {
    pub span_id: String,
    pub trace_id: String,
    pub end_time: DateTime<Utc>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SpanCommand {
    Start(SpanRecord),
    End(SpanUpdate),
}

/// Backend-specific shipping: map span commands to the wire format and
/// POST them. Shipping failures are logged and dropped; tracing must never
/// stall the conversation.
#[async_trait]
pub trait TraceSink: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn ship(&self, batch: Vec<SpanCommand>) -> anyhow::Result<()>;
}

struct TableEntry {
    span_id: String,
    created: Instant,
}

/// Hierarchy side tables, one set per tracer. Children look their parents
/// up here; a missed start produces a point-in-time span instead.
#[derive(Default)]
struct SpanTables {
    agent_spans: HashMap<String, TableEntry>,
    conversation_spans: HashMap<String, TableEntry>,
    generation_spans: HashMap<String, TableEntry>,
    tool_call_spans: HashMap<String, TableEntry>,
    connection_spans: HashMap<String, TableEntry>,
}

impl SpanTables {
    fn cleanup(&mut self, retention: Duration) {
        let prune = |table: &mut HashMap<String, TableEntry>| {
            table.retain(|_, entry| entry.created.elapsed() < retention);
        };
        prune(&mut self.agent_spans);
        prune(&mut self.conversation_spans);
        prune(&mut self.generation_spans);
        prune(&mut self.tool_call_spans);
        prune(&mut self.connection_spans);
    }

    fn total(&self) -> usize {
        self.agent_spans.len()
            + self.conversation_spans.len()
            + self.generation_spans.len()
            + self.tool_call_spans.len()
            + self.connection_spans.len()
    }
}

enum QueueMessage {
    Event(Box<Event>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub struct TraceWorker {
    tx: mpsc::Sender<QueueMessage>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sink_name: String,
}

impl TraceWorker {
    pub fn spawn(sink: Arc<dyn TraceSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let sink_name = sink.name().to_string();
        let handle = tokio::spawn(run_worker(sink, rx));
        Arc::new(Self {
            tx,
            handle: Mutex::new(Some(handle)),
            sink_name,
        })
    }

    /// Wait for the queue to drain and the in-flight batch to complete.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(QueueMessage::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Flush, signal stop, and join the worker.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(QueueMessage::Shutdown).await;
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(sink = %self.sink_name, error = %e, "Tracer worker join failed");
        }
    }
}

impl EventSubscriber for TraceWorker {
    fn on_event(&self, event: &Event) {
        // Synchronous path from the bus: enqueue and return. A full queue
        // drops the event rather than blocking the emitter.
        if let Err(e) = self.tx.try_send(QueueMessage::Event(Box::new(event.clone()))) {
            warn!(sink = %self.sink_name, error = %e, "Tracer queue full; dropping event");
        }
    }
}

async fn run_worker(sink: Arc<dyn TraceSink>, mut rx: mpsc::Receiver<QueueMessage>) {
    let tables = RwLock::new(SpanTables::default());
    let mut batch: Vec<SpanCommand> = Vec::new();
    let mut flush_timer = tokio::time::interval(FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cleanup_timer = tokio::time::interval(CLEANUP_INTERVAL);
    cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(QueueMessage::Event(event)) => {
                        let commands = {
                            let mut tables = tables.write().unwrap_or_else(|e| e.into_inner());
                            translate(&event, &mut tables)
                        };
                        batch.extend(commands);
                        if batch.len() >= BATCH_SIZE {
                            ship_batch(&sink, &mut batch).await;
                        }
                    }
                    Some(QueueMessage::Flush(ack)) => {
                        // Drain whatever is already queued before acking.
                        while let Ok(message) = rx.try_recv() {
                            match message {
                                QueueMessage::Event(event) => {
                                    let mut tables =
                                        tables.write().unwrap_or_else(|e| e.into_inner());
                                    batch.extend(translate(&event, &mut tables));
                                }
                                QueueMessage::Flush(extra) => {
                                    let _ = extra.send(());
                                }
                                QueueMessage::Shutdown => {
                                    ship_batch(&sink, &mut batch).await;
                                    let _ = ack.send(());
                                    return;
                                }
                            }
                        }
                        ship_batch(&sink, &mut batch).await;
                        let _ = ack.send(());
                    }
                    Some(QueueMessage::Shutdown) | None => {
                        ship_batch(&sink, &mut batch).await;
                        return;
                    }
                }
            }
            _ = flush_timer.tick() => {
                if !batch.is_empty() {
                    ship_batch(&sink, &mut batch).await;
                }
            }
            _ = cleanup_timer.tick() => {
                let mut tables = tables.write().unwrap_or_else(|e| e.into_inner());
                tables.cleanup(SPAN_RETENTION);
                debug!(sink = sink.name(), spans = tables.total(), "Tracer table cleanup");
            }
        }
    }
}

async fn ship_batch(sink: &Arc<dyn TraceSink>, batch: &mut Vec<SpanCommand>) {
    if batch.is_empty() {
        return;
    }
    let outgoing = std::mem::take(batch);
    let count = outgoing.len();
    if let Err(e) = sink.ship(outgoing).await {
        warn!(sink = sink.name(), count, error = %e, "Tracer batch ship failed");
    }
}

fn start(event: &Event, kind: SpanKind, metadata: Value) -> SpanCommand {
    SpanCommand::Start(SpanRecord {
        span_id: event.correlation_id().to_string(),
        trace_id: event.trace_id().to_string(),
        parent_id: event.parent_id().map(str::to_string),
        name: event.event_type().to_string(),
        kind,
        start_time: event.timestamp(),
        metadata,
    })
}

fn end(event: &Event, output: Option<Value>, error: Option<String>) -> SpanCommand {
    SpanCommand::End(SpanUpdate {
        span_id: event.correlation_id().to_string(),
        trace_id: event.trace_id().to_string(),
        end_time: event.timestamp(),
        output,
        error,
    })
}

/// A point-in-time span: opened and closed at the event timestamp. Also
/// used when an end event arrives for a span whose start was missed.
fn point(event: &Event, kind: SpanKind, metadata: Value) -> Vec<SpanCommand> {
    vec![start(event, kind, metadata), end(event, None, None)]
}

fn record(table: &mut HashMap<String, TableEntry>, key: String, span_id: &str) {
    table.insert(
        key,
        TableEntry {
            span_id: span_id.to_string(),
            created: Instant::now(),
        },
    );
}

/// Close the span recorded under `key`, or synthesize a point span when
/// the start was missed.
fn close_tracked(
    table: &mut HashMap<String, TableEntry>,
    key: &str,
    event: &Event,
    kind: SpanKind,
    output: Option<Value>,
    error: Option<String>,
) -> Vec<SpanCommand> {
    match table.remove(key) {
        Some(entry) => vec![SpanCommand::End(SpanUpdate {
            span_id: entry.span_id,
            trace_id: event.trace_id().to_string(),
            end_time: event.timestamp(),
            output,
            error,
        })],
        None => {
            let mut commands = point(event, kind, json!({"missed_start": true}));
            if let Some(SpanCommand::End(update)) = commands.last_mut() {
                update.output = output;
                update.error = error;
            }
            commands
        }
    }
}

/// Translate one bus event into span commands, maintaining the hierarchy
/// side tables so children can find their parents.
fn translate(event: &Event, tables: &mut SpanTables) -> Vec<SpanCommand> {
    let trace = event.trace_id().to_string();
    let payload = serde_json::to_value(&event.kind).unwrap_or(Value::Null);

    match &event.kind {
        EventKind::AgentStart(_) => {
            record(&mut tables.agent_spans, trace, event.correlation_id());
            vec![start(event, SpanKind::Agent, payload)]
        }
        EventKind::AgentEnd(_) | EventKind::AgentError(_) => {
            let error = matches!(event.kind, EventKind::AgentError(_))
                .then(|| "agent error".to_string());
            close_tracked(
                &mut tables.agent_spans,
                &trace,
                event,
                SpanKind::Agent,
                Some(payload),
                error,
            )
        }
        EventKind::ConversationStart(_) => {
            record(&mut tables.conversation_spans, trace, event.correlation_id());
            vec![start(event, SpanKind::Conversation, payload)]
        }
        EventKind::ConversationEnd(p)
        | EventKind::ConversationError(p)
        | EventKind::ContextCancelled(p) => close_tracked(
            &mut tables.conversation_spans,
            &trace,
            event,
            SpanKind::Conversation,
            Some(payload.clone()),
            p.error.clone(),
        ),
        EventKind::LlmCallStart(_) => {
            record(&mut tables.generation_spans, trace, event.correlation_id());
            vec![start(event, SpanKind::Generation, payload)]
        }
        EventKind::LlmCallEnd(p) | EventKind::LlmCallError(p) => close_tracked(
            &mut tables.generation_spans,
            &trace,
            event,
            SpanKind::Generation,
            Some(payload.clone()),
            p.error.clone(),
        ),
        EventKind::ToolCallStart(_) => {
            // Keyed by correlation id, which is the provider tool-call id
            // when present and {trace}:{turn}:{tool} otherwise.
            record(
                &mut tables.tool_call_spans,
                event.correlation_id().to_string(),
                event.correlation_id(),
            );
            vec![start(event, SpanKind::ToolCall, payload)]
        }
        EventKind::ToolCallEnd(p) | EventKind::ToolCallError(p) => {
            let key = event.correlation_id().to_string();
            close_tracked(
                &mut tables.tool_call_spans,
                &key,
                event,
                SpanKind::ToolCall,
                Some(payload.clone()),
                p.error.clone(),
            )
        }
        EventKind::McpConnectStart(p) => {
            let key = format!("{}:{}", trace, p.server);
            record(&mut tables.connection_spans, key, event.correlation_id());
            vec![start(event, SpanKind::Connection, payload)]
        }
        EventKind::McpConnectEnd(p) | EventKind::McpConnectError(p) => {
            let key = format!("{}:{}", trace, p.server);
            close_tracked(
                &mut tables.connection_spans,
                &key,
                event,
                SpanKind::Connection,
                Some(payload.clone()),
                p.error.clone(),
            )
        }
        // High-frequency chunk events would swamp the backends.
        EventKind::StreamingChunk(_) => vec![],
        _ => point(event, SpanKind::Point, payload),
    }
}
