//! Remote embedding client.
//!
//! Talks to an OpenAI-compatible `/embeddings` endpoint with bearer
//! authentication. Carries the full resilience kit: input truncation at a
//! UTF-8 boundary, batched requests with a split-and-retry partial-failure
//! fallback, exponential backoff on transient statuses, a circuit breaker,
//! a dimension guard, and the three-tier cache in front of the wire.

use super::cache::EmbedCache;
use super::resilience::EmbedCircuitBreaker;
use super::Embedder;
use crate::config::EmbedConfig;
use crate::storage::Store;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Attempts per API call (1 initial + 2 retries).
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff before the first retry.
const BASE_BACKOFF_MS: u64 = 500;

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Batched, cached, retrying client for a remote embedding API.
pub struct RemoteEmbedder {
    base_url: String,
    model: String,
    dimensions: usize,
    max_embed_chars: usize,
    batch_size: usize,
    backoff_base_ms: u64,
    api_key: Option<SecretString>,
    client: reqwest::blocking::Client,
    breaker: Mutex<EmbedCircuitBreaker>,
    cache: EmbedCache,
}

impl RemoteEmbedder {
    /// Creates a client from the embed section of the configuration.
    #[must_use]
    pub fn new(config: &EmbedConfig, dimensions: usize) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions,
            max_embed_chars: config.max_embed_chars,
            batch_size: config.batch_size.max(1),
            backoff_base_ms: BASE_BACKOFF_MS,
            api_key: config.api_key.clone().map(SecretString::from),
            client,
            breaker: Mutex::new(EmbedCircuitBreaker::new()),
            cache: EmbedCache::new(config.cache_capacity, config.model.as_str(), dimensions),
        }
    }

    /// Overrides the retry backoff base (tests).
    #[must_use]
    pub const fn with_backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    /// Attaches the persistent cache tier.
    pub fn set_store(&self, store: Arc<Store>) {
        self.cache.set_store(store);
    }

    /// Whether the circuit breaker is currently open.
    #[must_use]
    pub fn circuit_open(&self) -> bool {
        self.breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_open()
    }

    /// Truncates input to the configured char budget at a UTF-8 boundary.
    fn truncate<'a>(&self, text: &'a str) -> &'a str {
        match text.char_indices().nth(self.max_embed_chars) {
            Some((byte_idx, _)) => &text[..byte_idx],
            None => text,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> u64 {
        let exponential = self
            .backoff_base_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(8));
        let jitter_max = (exponential / 2).max(1);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        exponential + u64::from(nanos) % jitter_max
    }

    /// One logical API call over a batch of inputs, with internal retries.
    fn call_api(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::EmbedFatal("embedding API key not configured".to_string()))?;

        let url = format!("{}/embeddings", self.base_url);
        let mut last_transient: Option<Error> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                std::thread::sleep(Duration::from_millis(self.backoff_delay(attempt)));
            }

            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key.expose_secret())
                .json(&EmbeddingsRequest {
                    model: &self.model,
                    input: inputs,
                })
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: EmbeddingsResponse =
                            resp.json().map_err(|e| Error::EmbedFatal(format!(
                                "malformed embeddings response: {e}"
                            )))?;
                        if body.data.len() != inputs.len() {
                            return Err(Error::EmbedFatal(format!(
                                "embeddings response cardinality mismatch: sent {}, got {}",
                                inputs.len(),
                                body.data.len()
                            )));
                        }
                        let mut vectors = Vec::with_capacity(body.data.len());
                        for row in body.data {
                            if row.embedding.len() != self.dimensions {
                                return Err(Error::EmbedDimMismatch {
                                    expected: self.dimensions,
                                    actual: row.embedding.len(),
                                });
                            }
                            vectors.push(row.embedding);
                        }
                        return Ok(vectors);
                    }

                    // 429 and 5xx are worth retrying; other 4xx are not.
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(
                            status = status.as_u16(),
                            attempt,
                            "Transient embedding API status, retrying"
                        );
                        last_transient = Some(Error::EmbedTransient(format!(
                            "embedding API returned {status}"
                        )));
                        continue;
                    }
                    return Err(Error::EmbedFatal(format!(
                        "embedding API returned {status}"
                    )));
                },
                Err(e) => {
                    tracing::debug!(error = %e, attempt, "Embedding API network error, retrying");
                    last_transient = Some(Error::EmbedTransient(e.to_string()));
                },
            }
        }

        Err(last_transient
            .unwrap_or_else(|| Error::EmbedTransient("exhausted embedding retries".to_string())))
    }

    /// Shared call wrapper: breaker gate, API call, breaker bookkeeping,
    /// cache write-through.
    fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut breaker = self
                .breaker
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !breaker.allow() {
                metrics::counter!("embed_requests_total", "status" => "circuit_open").increment(1);
                return Err(Error::EmbedCircuitOpen);
            }
        }

        match self.call_api(std::slice::from_ref(&text.to_string())) {
            Ok(mut vectors) => {
                self.breaker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .on_success();
                metrics::counter!("embed_requests_total", "status" => "success").increment(1);
                let vector = vectors.remove(0);
                self.cache.put(text, &vector);
                Ok(vector)
            },
            Err(e) => {
                self.breaker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .on_failure();
                metrics::counter!("embed_requests_total", "status" => "error").increment(1);
                Err(e)
            },
        }
    }
}

impl Embedder for RemoteEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = self.truncate(text);
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached);
        }
        self.embed_uncached(text)
    }

    fn embed_opportunistic(&self, text: &str) -> Option<Vec<f32>> {
        let text = self.truncate(text);
        if let Some(cached) = self.cache.get(text) {
            return Some(cached);
        }
        self.embed_uncached(text).ok()
    }

    fn embed_batch(&self, texts: &[&str]) -> Vec<Option<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<usize> = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            let truncated = self.truncate(text);
            if let Some(cached) = self.cache.get(truncated) {
                results[idx] = Some(cached);
            } else {
                pending.push(idx);
            }
        }

        for chunk in pending.chunks(self.batch_size) {
            let circuit_open = {
                let mut breaker = self
                    .breaker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                !breaker.allow()
            };
            if circuit_open {
                // Leave the remaining items vectorless; the backfill pass
                // will retry once the circuit closes.
                break;
            }

            let inputs: Vec<String> = chunk
                .iter()
                .map(|&idx| self.truncate(texts[idx]).to_string())
                .collect();

            match self.call_api(&inputs) {
                Ok(vectors) => {
                    self.breaker
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .on_success();
                    for (&idx, vector) in chunk.iter().zip(vectors) {
                        self.cache.put(self.truncate(texts[idx]), &vector);
                        results[idx] = Some(vector);
                    }
                },
                Err(e) => {
                    self.breaker
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .on_failure();
                    tracing::warn!(
                        error = %e,
                        batch = chunk.len(),
                        "Batch embed failed, splitting and retrying individually"
                    );
                    for &idx in chunk {
                        results[idx] = self.embed_opportunistic(texts[idx]);
                    }
                },
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unroutable_embedder() -> RemoteEmbedder {
        let config = EmbedConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            max_embed_chars: 32,
            batch_size: 2,
            cache_capacity: 8,
            timeout_ms: 200,
        };
        RemoteEmbedder::new(&config, 768).with_backoff_base_ms(1)
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let embedder = unroutable_embedder();
        let text = "çğıöşü".repeat(32);
        let truncated = embedder.truncate(&text);
        assert_eq!(truncated.chars().count(), 32);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn short_input_is_not_truncated() {
        let embedder = unroutable_embedder();
        assert_eq!(embedder.truncate("kısa"), "kısa");
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let config = EmbedConfig {
            api_key: None,
            ..EmbedConfig::default()
        };
        let embedder = RemoteEmbedder::new(&config, 768);
        let err = embedder.embed("text").unwrap_err();
        assert_eq!(err.kind(), "embed_fatal");
        assert!(!err.retryable());
    }

    #[test]
    fn network_failure_is_transient_and_trips_breaker() {
        let embedder = unroutable_embedder();

        let err = embedder.embed("first").unwrap_err();
        assert_eq!(err.kind(), "embed_transient");
        assert!(err.retryable());

        // Failures accumulate per call; the fifth opens the circuit.
        for i in 0..4 {
            assert!(embedder.embed_opportunistic(&format!("text {i}")).is_none());
        }
        assert!(embedder.circuit_open());

        // Open circuit: the blocking path fails fast with the right kind.
        let err = embedder.embed("after open").unwrap_err();
        assert_eq!(err.kind(), "embed_circuit_open");
        // And the ingest path short-circuits to None.
        assert!(embedder.embed_opportunistic("after open").is_none());
    }

    #[test]
    fn batch_leaves_failed_items_none() {
        let embedder = unroutable_embedder();
        let results = embedder.embed_batch(&["a", "b", "c"]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Option::is_none));
    }
}
