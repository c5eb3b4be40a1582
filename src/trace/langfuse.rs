//! Langfuse backend: events become a trace with nested observations,
//! shipped as create/update pairs through the ingestion API.

use crate::trace::worker::{SpanCommand, SpanKind, TraceSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "https://cloud.langfuse.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct LangfuseSink {
    client: Client,
    base_url: String,
    public_key: String,
    secret_key: String,
    /// Traces already created this process, so each `trace-create` is sent
    /// once.
    created_traces: Mutex<HashSet<String>>,
}

impl LangfuseSink {
    pub fn new(public_key: String, secret_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            public_key,
            secret_key,
            created_traces: Mutex::new(HashSet::new()),
        }
    }

    fn observation_type(kind: SpanKind) -> &'static str {
        match kind {
            SpanKind::Generation => "GENERATION",
            SpanKind::Point => "EVENT",
            _ => "SPAN",
        }
    }

    fn build_batch(&self, commands: &[SpanCommand]) -> Vec<Value> {
        let mut batch = Vec::new();
        for command in commands {
            match command {
                SpanCommand::Start(record) => {
                    let timestamp = record.start_time.to_rfc3339();
                    // The root agent span doubles as the trace itself.
                    let is_new_trace = {
                        let mut created =
                            self.created_traces.lock().unwrap_or_else(|e| e.into_inner());
                        created.insert(record.trace_id.clone())
                    };
                    if is_new_trace {
                        batch.push(json!({
                            "id": Uuid::new_v4().to_string(),
                            "type": "trace-create",
                            "timestamp": timestamp,
                            "body": {
                                "id": record.trace_id,
                                "name": record.name,
                                "timestamp": timestamp,
                            },
                        }));
                    }
                    batch.push(json!({
                        "id": Uuid::new_v4().to_string(),
                        "type": "observation-create",
                        "timestamp": timestamp,
                        "body": {
                            "id": record.span_id,
                            "traceId": record.trace_id,
                            "parentObservationId": record.parent_id,
                            "type": Self::observation_type(record.kind),
                            "name": record.name,
                            "startTime": timestamp,
                            "metadata": record.metadata,
                        },
                    }));
                }
                SpanCommand::End(update) => {
                    let timestamp = update.end_time.to_rfc3339();
                    let mut body = json!({
                        "id": update.span_id,
                        "traceId": update.trace_id,
                        "endTime": timestamp,
                    });
                    if let Some(output) = &update.output {
                        body["output"] = output.clone();
                    }
                    if let Some(error) = &update.error {
                        body["level"] = json!("ERROR");
                        body["statusMessage"] = json!(error);
                    }
                    batch.push(json!({
                        "id": Uuid::new_v4().to_string(),
                        "type": "observation-update",
                        "timestamp": timestamp,
                        "body": body,
                    }));
                }
            }
        }
        batch
    }
}

#[async_trait]
impl TraceSink for LangfuseSink {
    fn name(&self) -> &str {
        "langfuse"
    }

    async fn ship(&self, commands: Vec<SpanCommand>) -> Result<()> {
        let batch = self.build_batch(&commands);
        if batch.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/api/public/ingestion", self.base_url))
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&json!({"batch": batch}))
            .send()
            .await
            .context("Langfuse ingestion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Langfuse ingestion rejected ({}): {}", status, body);
        }
        Ok(())
    }
}
