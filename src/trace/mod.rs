//! Tracer fanout: asynchronous, batched emission of bus events to remote
//! observability backends. Each configured backend runs one batch worker;
//! the bus subscription itself only enqueues.

mod langfuse;
mod langsmith;
pub mod worker;

pub use langfuse::LangfuseSink;
pub use langsmith::LangsmithSink;
pub use worker::{SpanCommand, SpanKind, SpanRecord, SpanUpdate, TraceSink, TraceWorker};

use crate::config::TracingSettings;
use crate::events::EventBus;
use std::sync::Arc;
use tracing::info;

/// All active tracer workers for this process.
pub struct TracerFanout {
    workers: Vec<Arc<TraceWorker>>,
}

impl TracerFanout {
    /// Spawn a worker per configured backend and subscribe each to the
    /// bus. No credentials means no workers; that is not an error.
    pub fn from_settings(settings: &TracingSettings, bus: &EventBus) -> Self {
        let mut workers = Vec::new();

        if let (Some(public_key), Some(secret_key)) = (
            settings.langfuse_public_key.clone(),
            settings.langfuse_secret_key.clone(),
        ) {
            let sink = Arc::new(LangfuseSink::new(
                public_key,
                secret_key,
                settings.langfuse_base_url.clone(),
            ));
            let worker = TraceWorker::spawn(sink);
            bus.subscribe(worker.clone());
            workers.push(worker);
            info!("Langfuse tracer enabled");
        }

        if let Some(api_key) = settings.langsmith_api_key.clone() {
            let sink = Arc::new(LangsmithSink::new(
                api_key,
                settings.langsmith_endpoint.clone(),
                settings.langsmith_project.clone(),
            ));
            let worker = TraceWorker::spawn(sink);
            bus.subscribe(worker.clone());
            workers.push(worker);
            info!("LangSmith tracer enabled");
        }

        Self { workers }
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait until every backend has drained its queue and shipped its
    /// in-flight batch.
    pub async fn flush(&self) {
        for worker in &self.workers {
            worker.flush().await;
        }
    }

    /// Flush and stop every worker.
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown().await;
        }
    }
}
