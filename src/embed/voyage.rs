//! VoyageAI HTTP client.
//!
//! Blocking `reqwest` client with retry/backoff handling. Rate limiting is
//! the provider's own responsibility: a token bucket tracks request and
//! token quotas, and its state is surfaced through
//! [`EmbeddingProvider::throttle_state`] for progress reporting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EmbeddingSection;
use crate::error::{CidxError, Result};

use super::{EmbeddingProvider, ThrottleState};

/// Maximum wait honoured for a single retry, server-driven or computed
const MAX_RETRY_WAIT: Duration = Duration::from_secs(300);

/// Conservative token estimate: ~4 characters per token
const CHARS_PER_TOKEN: usize = 4;

/// Token ceiling for a single batch request, below every Voyage model limit
const BATCH_TOKEN_LIMIT: usize = 100_000;

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// Double token bucket over requests/min and tokens/min.
struct RateLimiter {
    request_tokens: f64,
    token_tokens: f64,
    requests_per_minute: f64,
    tokens_per_minute: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            request_tokens: requests_per_minute as f64,
            token_tokens: tokens_per_minute as f64,
            requests_per_minute: requests_per_minute as f64,
            tokens_per_minute: tokens_per_minute as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.request_tokens =
            (self.request_tokens + elapsed * self.requests_per_minute / 60.0).min(self.requests_per_minute);
        self.token_tokens =
            (self.token_tokens + elapsed * self.tokens_per_minute / 60.0).min(self.tokens_per_minute);
    }

    /// How long a request consuming `tokens` would need to wait right now.
    fn wait_time(&mut self, tokens: usize) -> Duration {
        self.refill();
        let mut wait = 0.0_f64;
        if self.request_tokens < 1.0 {
            wait = wait.max((1.0 - self.request_tokens) * 60.0 / self.requests_per_minute);
        }
        if self.token_tokens < tokens as f64 {
            wait = wait.max((tokens as f64 - self.token_tokens) * 60.0 / self.tokens_per_minute);
        }
        Duration::from_secs_f64(wait)
    }

    fn consume(&mut self, tokens: usize) {
        self.refill();
        self.request_tokens -= 1.0;
        self.token_tokens -= tokens as f64;
    }
}

/// Client for the VoyageAI embeddings API.
pub struct VoyageClient {
    config: EmbeddingSection,
    api_key: String,
    client: reqwest::blocking::Client,
    limiter: Mutex<RateLimiter>,
}

impl VoyageClient {
    /// Build a client from the embedding config section. The API key comes
    /// from `VOYAGE_API_KEY`.
    pub fn new(config: EmbeddingSection) -> Result<Self> {
        let api_key = std::env::var("VOYAGE_API_KEY").map_err(|_| {
            CidxError::config(
                "VOYAGE_API_KEY environment variable is required for the voyage-ai provider",
            )
        })?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        let limiter = Mutex::new(RateLimiter::new(
            config.requests_per_minute,
            config.tokens_per_minute,
        ));

        Ok(Self {
            config,
            api_key,
            client,
            limiter,
        })
    }

    fn estimate_tokens(text: &str) -> usize {
        text.len().div_ceil(CHARS_PER_TOKEN).max(1)
    }

    /// Split `texts` into sub-batches staying under the model token limit.
    fn sub_batches(texts: &[String]) -> Vec<&[String]> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut budget = 0usize;

        for (i, text) in texts.iter().enumerate() {
            let tokens = Self::estimate_tokens(text);
            if budget + tokens > BATCH_TOKEN_LIMIT && i > start {
                batches.push(&texts[start..i]);
                start = i;
                budget = 0;
            }
            budget += tokens;
        }
        if start < texts.len() {
            batches.push(&texts[start..]);
        }
        batches
    }

    fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let tokens: usize = texts.iter().map(|t| Self::estimate_tokens(t)).sum();

        {
            let mut limiter = self.limiter.lock().expect("rate limiter poisoned");
            let wait = limiter.wait_time(tokens);
            if !wait.is_zero() {
                debug!("rate limiter: waiting {:.1}s before request", wait.as_secs_f64());
                std::thread::sleep(wait.min(MAX_RETRY_WAIT));
            }
            limiter.consume(tokens);
        }

        let payload = serde_json::json!({
            "input": texts,
            "model": self.config.model,
        });

        let mut last_error: Option<CidxError> = None;

        for attempt in 0..=self.config.max_retries {
            let response = self
                .client
                .post(self.config.api_endpoint.as_str())
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: EmbeddingsResponse = resp.json()?;
                        return Ok(body.data.into_iter().map(|d| d.embedding).collect());
                    }

                    if status.as_u16() == 401 {
                        return Err(CidxError::config(
                            "invalid VoyageAI API key, check VOYAGE_API_KEY",
                        ));
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable {
                        return Err(CidxError::Network(format!(
                            "VoyageAI request failed with status {status}"
                        )));
                    }

                    // Honour Retry-After on 429, otherwise exponential backoff
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<f64>().ok())
                        .map(Duration::from_secs_f64)
                        .unwrap_or_else(|| self.backoff_delay(attempt));

                    last_error = Some(if status.as_u16() == 429 {
                        CidxError::ProviderRateLimited(format!(
                            "rate limit exceeded after {} attempts",
                            attempt + 1
                        ))
                    } else {
                        CidxError::Network(format!("server error {status}"))
                    });

                    if attempt < self.config.max_retries {
                        warn!(
                            "VoyageAI returned {status}, retrying in {:.1}s (attempt {}/{})",
                            wait.as_secs_f64(),
                            attempt + 1,
                            self.config.max_retries
                        );
                        std::thread::sleep(wait.min(MAX_RETRY_WAIT));
                    }
                }
                Err(e) => {
                    last_error = Some(CidxError::Network(e.to_string()));
                    if attempt < self.config.max_retries {
                        std::thread::sleep(self.backoff_delay(attempt).min(MAX_RETRY_WAIT));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CidxError::Network("request never attempted".into())))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.config.retry_delay_seconds * f64::from(1u32 << attempt.min(8)))
    }
}

impl EmbeddingProvider for VoyageClient {
    fn provider_name(&self) -> &str {
        "voyage-ai"
    }

    fn current_model(&self) -> String {
        self.config.model.clone()
    }

    fn dimensions(&self) -> usize {
        // voyage-code-3 and the voyage-3 family are 1024-dimensional;
        // older large models are 1536.
        match self.config.model.as_str() {
            "voyage-large-2" | "voyage-code-2" => 1536,
            _ => 1024,
        }
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn health_check(&self, test_api: bool) -> Result<bool> {
        if self.api_key.is_empty() || self.config.model.is_empty() {
            return Ok(false);
        }
        if test_api {
            return Ok(self.request(&["ping".to_string()]).is_ok());
        }
        Ok(true)
    }

    fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.request(std::slice::from_ref(&text.to_string()))?;
        batch
            .pop()
            .ok_or_else(|| CidxError::Network("empty embedding response".into()))
    }

    fn get_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(texts.len());
        for batch in Self::sub_batches(texts) {
            out.extend(self.request(batch)?);
        }
        Ok(out)
    }

    fn throttle_state(&self) -> ThrottleState {
        let mut limiter = self.limiter.lock().expect("rate limiter poisoned");
        ThrottleState {
            current_wait: limiter.wait_time(100),
            requests_remaining: Some(limiter.request_tokens.max(0.0) as u32),
        }
    }
}
