mod common;

use common::{EventCollector, MockConnector, MockProvider, text_response};
use mcpweave::agent::Agent;
use mcpweave::cache::CapabilityCache;
use mcpweave::config::{AgentSettings, ContextSettings, FallbackSettings};
use mcpweave::errors::WeaveError;
use mcpweave::events::{EventBus, EventKind, FallbackPhase, TraceContext};
use mcpweave::federation::Federation;
use mcpweave::llm::invoker::{Invoker, ModelTarget};
use mcpweave::llm::ProviderError;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn settings() -> AgentSettings {
    AgentSettings {
        max_turns: 3,
        tool_timeout_secs: 5,
        llm_timeout_secs: 5,
        conversation_deadline_secs: 0,
        max_tokens: 512,
        temperature: 0.0,
        streaming: false,
        context: ContextSettings {
            editing_enabled: false,
            summarization_enabled: false,
            ..Default::default()
        },
    }
}

/// Primary throttles, the same-provider fallback throttles, the
/// cross-provider fallback fails with an unclassified error: three
/// `FallbackAttempt`s, one `AllFallbacksFailed`, and the conversation ends
/// with the last error.
#[tokio::test]
async fn fallback_exhaustion_ends_conversation() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let collector = EventCollector::new();
    bus.subscribe(collector.clone());

    let primary = MockProvider::with_responses(vec![Err(ProviderError::Throttled {
        retry_after: None,
    })]);
    let same = MockProvider::with_responses(vec![Err(ProviderError::Throttled {
        retry_after: None,
    })]);
    let cross = MockProvider::with_responses(vec![Err(ProviderError::Other(
        "model exploded".into(),
    ))]);

    let invoker = Arc::new(
        Invoker::new(
            ModelTarget::new(primary, "primary-model"),
            &FallbackSettings {
                max_retries: 0,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..Default::default()
            },
        )
        .with_same_provider(vec![ModelTarget::new(same, "fallback-model")])
        .with_cross_provider(vec![ModelTarget::new(cross, "cross-model")]),
    );

    let federation = Arc::new(Federation::new(
        HashMap::new(),
        MockConnector::new(vec![]),
        Some(Arc::new(CapabilityCache::new(tmp.path().to_path_buf(), 60))),
        bus.clone(),
    ));
    let mut agent = Agent::new(
        federation,
        &["none".to_string()],
        invoker,
        bus,
        settings(),
        TraceContext::new(),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let err = agent.ask("anything", &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        WeaveError::Llm(ProviderError::Other(ref m)) if m == "model exploded"
    ));

    assert_eq!(collector.count_of("fallback_attempt"), 3);
    assert_eq!(collector.count_of("all_fallbacks_failed"), 1);
    assert_eq!(collector.count_of("conversation_error"), 1);

    // Attempts walked the phases in order.
    let phases: Vec<FallbackPhase> = collector
        .snapshot()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::FallbackAttempt(payload) => Some(payload.phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            FallbackPhase::Primary,
            FallbackPhase::SameProvider,
            FallbackPhase::CrossProvider,
        ]
    );
}

/// A throttled primary with a healthy same-provider fallback answers
/// without surfacing any error to the caller.
#[tokio::test]
async fn same_provider_fallback_recovers() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let collector = EventCollector::new();
    bus.subscribe(collector.clone());

    let primary = MockProvider::with_responses(vec![Err(ProviderError::Throttled {
        retry_after: None,
    })]);
    let same = MockProvider::with_responses(vec![text_response("fallback answer")]);

    let invoker = Arc::new(
        Invoker::new(
            ModelTarget::new(primary, "primary-model"),
            &FallbackSettings {
                max_retries: 0,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..Default::default()
            },
        )
        .with_same_provider(vec![ModelTarget::new(same, "fallback-model")]),
    );

    let federation = Arc::new(Federation::new(
        HashMap::new(),
        MockConnector::new(vec![]),
        Some(Arc::new(CapabilityCache::new(tmp.path().to_path_buf(), 60))),
        bus.clone(),
    ));
    let mut agent = Agent::new(
        federation,
        &["none".to_string()],
        invoker,
        bus,
        settings(),
        TraceContext::new(),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let answer = agent.ask("hello", &cancel).await.unwrap();
    assert_eq!(answer, "fallback answer");
    assert_eq!(collector.count_of("all_fallbacks_failed"), 0);
    assert_eq!(collector.count_of("conversation_end"), 1);
}
