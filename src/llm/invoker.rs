//! Fallback-chain invocation.
//!
//! One logical LLM call fans out over: primary model → same-provider
//! fallbacks → cross-provider fallbacks. Throttling and empty content are
//! retried on the same model with exponential backoff; every other failure
//! class advances the chain. The last error is surfaced when the chain is
//! exhausted, so the conversation engine can still distinguish a context
//! overflow from a dead provider.

use crate::config::{FallbackSettings, ProviderSettings};
use crate::errors::{WeaveError, WeaveResult};
use crate::events::{
    Event, EventBus, EventKind, FallbackPayload, FallbackPhase, GenerationPayload, TraceContext,
    new_correlation_id,
};
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::{ChatMessage, ChatRequest, LlmProvider, LlmResponse, ProviderError, StreamCallback};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One (provider, model) pair in the chain.
#[derive(Clone)]
pub struct ModelTarget {
    pub provider: Arc<dyn LlmProvider>,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

pub struct Invoker {
    primary: ModelTarget,
    same_provider: Vec<ModelTarget>,
    cross_provider: Vec<ModelTarget>,
    max_retries: usize,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    llm_timeout: Duration,
}

/// Per-invocation context: where events go and how to stop early.
pub struct InvokeOptions<'a> {
    pub bus: &'a EventBus,
    pub trace: &'a TraceContext,
    /// Correlation id of the enclosing conversation span.
    pub parent_id: Option<String>,
    pub cancel: &'a CancellationToken,
    pub stream: Option<StreamCallback>,
}

impl Invoker {
    pub fn new(primary: ModelTarget, settings: &FallbackSettings) -> Self {
        Self {
            primary,
            same_provider: vec![],
            cross_provider: vec![],
            max_retries: settings.max_retries,
            initial_backoff_ms: settings.initial_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
            llm_timeout: Duration::from_secs(180),
        }
    }

    pub fn with_same_provider(mut self, targets: Vec<ModelTarget>) -> Self {
        self.same_provider = targets;
        self
    }

    pub fn with_cross_provider(mut self, targets: Vec<ModelTarget>) -> Self {
        self.cross_provider = targets;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// Build the full chain from configuration. Fails when the primary
    /// model references a provider with no credentials.
    pub fn from_config(
        fallback: &FallbackSettings,
        providers: &ProviderSettings,
    ) -> WeaveResult<Self> {
        let primary_ref = fallback
            .primary
            .as_ref()
            .ok_or_else(|| WeaveError::Config("no primary model configured".into()))?;
        let primary = build_target(&primary_ref.provider, &primary_ref.model, providers)?;

        let mut same = Vec::new();
        for model_ref in &fallback.same_provider {
            same.push(build_target(&model_ref.provider, &model_ref.model, providers)?);
        }
        let mut cross = Vec::new();
        for model_ref in &fallback.cross_provider {
            cross.push(build_target(&model_ref.provider, &model_ref.model, providers)?);
        }

        Ok(Self::new(primary, fallback)
            .with_same_provider(same)
            .with_cross_provider(cross))
    }

    pub fn primary_model(&self) -> &str {
        &self.primary.model
    }

    fn chain(&self) -> Vec<(FallbackPhase, &ModelTarget)> {
        let mut chain = vec![(FallbackPhase::Primary, &self.primary)];
        chain.extend(
            self.same_provider
                .iter()
                .map(|t| (FallbackPhase::SameProvider, t)),
        );
        chain.extend(
            self.cross_provider
                .iter()
                .map(|t| (FallbackPhase::CrossProvider, t)),
        );
        chain
    }

    /// Run one logical LLM call through the chain.
    pub async fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Value>>,
        max_tokens: u32,
        temperature: f32,
        opts: &InvokeOptions<'_>,
    ) -> WeaveResult<LlmResponse> {
        let generation_correlation = new_correlation_id();
        opts.bus.emit(Event::with_correlation(
            EventKind::LlmCallStart(GenerationPayload {
                model: self.primary.model.clone(),
                provider: self.primary.provider.name().to_string(),
                ..Default::default()
            }),
            opts.trace,
            2,
            opts.parent_id.clone(),
            generation_correlation.clone(),
        ));

        let mut last_error = ProviderError::Other("fallback chain is empty".into());
        let mut last_target: Option<(FallbackPhase, String, String)> = None;

        for (phase, target) in self.chain() {
            let provider_name = target.provider.name().to_string();
            last_target = Some((phase, provider_name.clone(), target.model.clone()));

            let mut attempt = 0usize;
            loop {
                if opts.cancel.is_cancelled() {
                    return Err(WeaveError::Cancelled);
                }

                opts.bus.emit(Event::point(
                    EventKind::FallbackAttempt(FallbackPayload {
                        phase,
                        provider: provider_name.clone(),
                        model: target.model.clone(),
                        attempt,
                        error: None,
                    }),
                    opts.trace,
                    2,
                    Some(generation_correlation.clone()),
                ));

                let error = match self.attempt(target, &messages, &tools, max_tokens, temperature, opts).await {
                    Ok(response) => {
                        let usage = response.token_usage().unwrap_or_default();
                        opts.bus.emit(Event::with_correlation(
                            EventKind::LlmCallEnd(GenerationPayload {
                                model: target.model.clone(),
                                provider: provider_name.clone(),
                                input_tokens: usage.input_tokens,
                                output_tokens: usage.output_tokens,
                                total_tokens: usage.total_tokens,
                                cache_read_tokens: usage.cache_read_tokens,
                                reasoning_tokens: usage.reasoning_tokens,
                                error: None,
                            }),
                            opts.trace,
                            2,
                            opts.parent_id.clone(),
                            generation_correlation.clone(),
                        ));
                        return Ok(response);
                    }
                    Err(e) => e,
                };

                warn!(
                    provider = %provider_name,
                    model = %target.model,
                    attempt,
                    error = %error,
                    "LLM attempt failed"
                );

                if error.retry_same_model() && attempt < self.max_retries {
                    let delay = self.backoff_delay(&error, attempt);
                    opts.bus.emit(Event::point(
                        EventKind::RetryAttempt(FallbackPayload {
                            phase,
                            provider: provider_name.clone(),
                            model: target.model.clone(),
                            attempt,
                            error: Some(error.to_string()),
                        }),
                        opts.trace,
                        2,
                        Some(generation_correlation.clone()),
                    ));
                    debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    tokio::select! {
                        _ = opts.cancel.cancelled() => return Err(WeaveError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    continue;
                }

                last_error = error;
                break;
            }
        }

        let (phase, provider, model) = last_target
            .unwrap_or((FallbackPhase::Primary, String::new(), String::new()));
        opts.bus.emit(Event::point(
            EventKind::AllFallbacksFailed(FallbackPayload {
                phase,
                provider: provider.clone(),
                model: model.clone(),
                attempt: self.max_retries,
                error: Some(last_error.to_string()),
            }),
            opts.trace,
            2,
            Some(generation_correlation.clone()),
        ));
        opts.bus.emit(Event::with_correlation(
            EventKind::LlmCallError(GenerationPayload {
                model,
                provider,
                error: Some(last_error.to_string()),
                ..Default::default()
            }),
            opts.trace,
            2,
            opts.parent_id.clone(),
            generation_correlation,
        ));

        Err(WeaveError::Llm(last_error))
    }

    /// One attempt against one target. Empty responses are an error class
    /// of their own so the retry policy can see them.
    async fn attempt(
        &self,
        target: &ModelTarget,
        messages: &[ChatMessage],
        tools: &Option<Vec<Value>>,
        max_tokens: u32,
        temperature: f32,
        opts: &InvokeOptions<'_>,
    ) -> Result<LlmResponse, ProviderError> {
        let request = ChatRequest {
            messages: messages.to_vec(),
            tools: tools.clone(),
            model: Some(&target.model),
            max_tokens,
            temperature,
        };

        let call = async {
            match &opts.stream {
                Some(callback) => target.provider.chat_stream(request, callback.clone()).await,
                None => target.provider.chat(request).await,
            }
        };

        let response = tokio::select! {
            _ = opts.cancel.cancelled() => {
                return Err(ProviderError::Other("cancelled".into()));
            }
            result = tokio::time::timeout(self.llm_timeout, call) => match result {
                Ok(inner) => inner?,
                Err(_) => {
                    return Err(ProviderError::Connection(format!(
                        "LLM call timed out after {}s",
                        self.llm_timeout.as_secs()
                    )));
                }
            },
        };

        if response.is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        Ok(response)
    }

    fn backoff_delay(&self, error: &ProviderError, attempt: usize) -> Duration {
        if let ProviderError::Throttled {
            retry_after: Some(seconds),
        } = error
        {
            return Duration::from_secs(*seconds);
        }
        let exp = (self.initial_backoff_ms as f64 * 2f64.powi(attempt as i32))
            .min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(exp)
    }
}

fn build_target(
    provider_name: &str,
    model: &str,
    providers: &ProviderSettings,
) -> WeaveResult<ModelTarget> {
    let missing_key = |name: &str| {
        WeaveError::Config(format!("no API key configured for provider '{}'", name))
    };
    let provider: Arc<dyn LlmProvider> = match provider_name {
        "anthropic" => {
            let key = providers
                .anthropic_api_key
                .clone()
                .ok_or_else(|| missing_key("anthropic"))?;
            Arc::new(AnthropicProvider::new(key, Some(model.to_string())))
        }
        "openai" => {
            let key = providers
                .openai_api_key
                .clone()
                .ok_or_else(|| missing_key("openai"))?;
            Arc::new(OpenAiProvider::openai(key, Some(model.to_string())))
        }
        "openrouter" => {
            let key = providers
                .openrouter_api_key
                .clone()
                .ok_or_else(|| missing_key("openrouter"))?;
            Arc::new(OpenAiProvider::openrouter(key, Some(model.to_string())))
        }
        other => {
            return Err(WeaveError::Config(format!("unknown provider '{}'", other)));
        }
    };
    Ok(ModelTarget::new(provider, model))
}
