//! LangSmith backend: events become runs, shipped as POST (create) and
//! PATCH (update) batches. Parent-chain position is expressed through the
//! dotted-order string.

use crate::trace::worker::{SpanCommand, SpanKind, TraceSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_ENDPOINT: &str = "https://api.smith.langchain.com";
const DEFAULT_PROJECT: &str = "mcpweave";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Per-span bookkeeping: LangSmith requires UUID run ids, so span ids are
/// mapped to generated run ids, and each run remembers its dotted order so
/// children can extend the chain.
struct RunInfo {
    run_id: String,
    dotted_order: String,
    trace_run_id: String,
}

pub struct LangsmithSink {
    client: Client,
    endpoint: String,
    api_key: String,
    project: String,
    runs: Mutex<HashMap<String, RunInfo>>,
}

impl LangsmithSink {
    pub fn new(api_key: String, endpoint: Option<String>, project: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            project: project.unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn run_type(kind: SpanKind) -> &'static str {
        match kind {
            SpanKind::Generation => "llm",
            SpanKind::ToolCall => "tool",
            _ => "chain",
        }
    }

    /// One dotted-order segment: start time in compact UTC followed by the
    /// run id. Chains are parent segments joined with dots.
    fn dotted_segment(time: DateTime<Utc>, run_id: &str) -> String {
        format!("{}{}", time.format("%Y%m%dT%H%M%S%6fZ"), run_id)
    }

    fn build_batches(&self, commands: &[SpanCommand]) -> (Vec<Value>, Vec<Value>) {
        let mut posts = Vec::new();
        let mut patches = Vec::new();
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());

        for command in commands {
            match command {
                SpanCommand::Start(record) => {
                    let run_id = Uuid::new_v4().to_string();
                    let segment = Self::dotted_segment(record.start_time, &run_id);

                    let parent = record
                        .parent_id
                        .as_ref()
                        .and_then(|parent_id| runs.get(parent_id));
                    let (dotted_order, parent_run_id, trace_run_id) = match parent {
                        Some(parent) => (
                            format!("{}.{}", parent.dotted_order, segment),
                            Some(parent.run_id.clone()),
                            parent.trace_run_id.clone(),
                        ),
                        None => (segment, None, run_id.clone()),
                    };

                    posts.push(json!({
                        "id": run_id,
                        "trace_id": trace_run_id,
                        "dotted_order": dotted_order,
                        "parent_run_id": parent_run_id,
                        "name": record.name,
                        "run_type": Self::run_type(record.kind),
                        "start_time": record.start_time.to_rfc3339(),
                        "inputs": {"metadata": record.metadata},
                        "session_name": self.project,
                    }));

                    runs.insert(
                        record.span_id.clone(),
                        RunInfo {
                            run_id,
                            dotted_order,
                            trace_run_id,
                        },
                    );
                }
                SpanCommand::End(update) => {
                    let Some(info) = runs.get(&update.span_id) else {
                        // Start never reached this sink; nothing to patch.
                        continue;
                    };
                    let mut patch = json!({
                        "id": info.run_id,
                        "trace_id": info.trace_run_id,
                        "dotted_order": info.dotted_order,
                        "end_time": update.end_time.to_rfc3339(),
                    });
                    if let Some(output) = &update.output {
                        patch["outputs"] = json!({"output": output});
                    }
                    if let Some(error) = &update.error {
                        patch["error"] = json!(error);
                    }
                    patches.push(patch);
                }
            }
        }

        (posts, patches)
    }
}

#[async_trait]
impl TraceSink for LangsmithSink {
    fn name(&self) -> &str {
        "langsmith"
    }

    async fn ship(&self, commands: Vec<SpanCommand>) -> Result<()> {
        let (posts, patches) = self.build_batches(&commands);
        if posts.is_empty() && patches.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/runs/batch", self.endpoint))
            .header("x-api-key", &self.api_key)
            .json(&json!({"post": posts, "patch": patches}))
            .send()
            .await
            .context("LangSmith batch request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LangSmith batch rejected ({}): {}", status, body);
        }
        Ok(())
    }
}
