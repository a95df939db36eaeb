//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`OpenAiProvider`]** — `POST {base}/v1/embeddings`.
//! - **[`GeminiProvider`]** — `POST {base}/v1beta/models/{model}:batchEmbedContents`.
//! - **[`VoyageProvider`]** — `POST {base}/v1/embeddings`.
//! - **[`LocalProvider`]** — offline feature-hashing embedder; never
//!   touches the network, so it also backs tests and air-gapped setups.
//!
//! Errors are structured ([`ProviderError`]) so retryability and
//! fallback-worthiness are decided on kinds, not string matching. The
//! substring classifiers ([`retryable_message`], [`embedding_related`])
//! remain as a last resort for errors that crossed an `anyhow` boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{EmbeddingSettings, ProviderKind};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("bad request {status}: {body}")]
    BadRequest { status: u16, body: String },
    #[error("batch not available: {0}")]
    BatchUnavailable(String),
    #[error("embedding call timed out after {0}s")]
    Timeout(u64),
    #[error("network error: {0}")]
    Network(String),
    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Transient errors worth a backoff-and-retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Server { .. }
                | ProviderError::QuotaExhausted(_)
                | ProviderError::Network(_)
        )
    }
}

/// Last-resort retryability classifier for stringly-typed errors.
pub fn retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("resource has been exhausted")
        || lower.contains("cloudflare")
        || ["500", "502", "503", "504"]
            .iter()
            .any(|code| lower.contains(code))
}

/// Does a sync failure look embedding-related (and thus worth a provider
/// fallback)?
pub fn embedding_related(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("embedding") || lower.contains("embeddings") || lower.contains("batch")
}

/// One request in a remote batch job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub text: String,
}

/// Poll result for a remote batch job.
pub enum BatchPoll {
    Pending,
    Completed(HashMap<String, Vec<f32>>),
    Failed(String),
}

/// Async batch submission offered by some providers.
#[async_trait]
pub trait RemoteBatchApi: Send + Sync {
    /// Submit a job; returns the provider's job id.
    async fn submit(&self, requests: &[BatchRequest]) -> Result<String, ProviderError>;
    /// Check a job's state.
    async fn poll(&self, job_id: &str) -> Result<BatchPoll, ProviderError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> ProviderKind;
    fn model(&self) -> &str;
    fn dims(&self) -> usize;
    fn base_url(&self) -> &str;
    /// Local providers get the longer timeout budget and never batch
    /// remotely.
    fn is_local(&self) -> bool {
        false
    }
    /// Per-input token limit chunks are clipped to.
    fn max_input_tokens(&self) -> usize;
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
    /// The remote batch adapter, when this provider offers one.
    fn remote_batch(&self) -> Option<&dyn RemoteBatchApi> {
        None
    }
}

/// Stable, non-secret identity hash for a provider configuration:
/// family, base URL, and model. Never includes key material.
pub fn provider_key(provider: &dyn EmbeddingProvider) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}",
            provider.id().as_str(),
            provider.base_url(),
            provider.model()
        )
        .as_bytes(),
    );
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

/// Build a provider of the given family from settings.
///
/// `kind` is taken separately from `settings.provider` so fallback can
/// construct a different family; when the family differs from the
/// configured one, the family's default model is used instead of the
/// configured model.
pub fn create_provider(
    settings: &EmbeddingSettings,
    kind: ProviderKind,
) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let (model, dims) = if kind == settings.provider {
        (
            settings.model_name(),
            settings.dims.unwrap_or_else(|| {
                default_dims_for(kind, &settings.model_name())
            }),
        )
    } else {
        (
            kind.default_model().to_string(),
            kind.default_dims(),
        )
    };

    let max_input = settings.max_input_tokens;

    let provider: Arc<dyn EmbeddingProvider> = match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
            settings.base_url_for(kind),
            model,
            dims,
            max_input,
        )?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            settings.base_url_for(kind),
            model,
            dims,
            max_input,
        )?),
        ProviderKind::Voyage => Arc::new(VoyageProvider::new(
            settings.base_url_for(kind),
            model,
            dims,
            max_input,
        )?),
        ProviderKind::Local => Arc::new(LocalProvider::new(model, dims, max_input)),
    };
    Ok(provider)
}

fn default_dims_for(kind: ProviderKind, model: &str) -> usize {
    match (kind, model) {
        (ProviderKind::OpenAi, "text-embedding-3-large") => 3072,
        (ProviderKind::Voyage, "voyage-3") => 1024,
        _ => kind.default_dims(),
    }
}

impl EmbeddingSettings {
    /// Base URL for a family: the configured override applies only to the
    /// configured family; other families use their well-known endpoint.
    fn base_url_for(&self, kind: ProviderKind) -> String {
        if kind == self.provider {
            if let Some(url) = &self.base_url {
                return url.trim_end_matches('/').to_string();
            }
        }
        match kind {
            ProviderKind::OpenAi => "https://api.openai.com".to_string(),
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com".to_string(),
            ProviderKind::Voyage => "https://api.voyageai.com".to_string(),
            ProviderKind::Local => String::new(),
        }
    }
}

fn classify_response(status: u16, body: String) -> ProviderError {
    if status == 429 {
        return ProviderError::RateLimited(body);
    }
    if body.to_lowercase().contains("resource has been exhausted") {
        return ProviderError::QuotaExhausted(body);
    }
    if (500..600).contains(&status) {
        return ProviderError::Server { status, body };
    }
    ProviderError::BadRequest { status, body }
}

fn network_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(0)
    } else {
        ProviderError::Network(e.to_string())
    }
}

fn require_env(var: &'static str) -> Result<String, ProviderError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ProviderError::MissingApiKey(var))
}

// ============ OpenAI ============

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    max_input_tokens: usize,
    batch: OpenAiBatchApi,
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: String,
        model: String,
        dims: usize,
        max_input_tokens: usize,
    ) -> anyhow::Result<Self> {
        let api_key = require_env("OPENAI_API_KEY")?;
        let client = reqwest::Client::new();
        let batch = OpenAiBatchApi {
            client: client.clone(),
            api_key: api_key.clone(),
            base_url: base_url.clone(),
            model: model.clone(),
        };
        Ok(Self {
            client,
            api_key,
            base_url,
            model,
            dims,
            max_input_tokens,
            batch,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn id(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn base_url(&self) -> &str {
        &self.base_url
    }
    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Other("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&OpenAiEmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, body));
        }

        let parsed: OpenAiEmbeddingResponse =
            response.json().await.map_err(network_error)?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn remote_batch(&self) -> Option<&dyn RemoteBatchApi> {
        Some(&self.batch)
    }
}

/// Remote batch adapter over the OpenAI-style batch-job endpoints.
pub struct OpenAiBatchApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OpenAiBatchSubmit<'a> {
    model: &'a str,
    requests: &'a [BatchRequest],
}

#[derive(Deserialize)]
struct OpenAiBatchJob {
    id: String,
}

#[derive(Deserialize)]
struct OpenAiBatchStatus {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<OpenAiBatchResult>,
}

#[derive(Deserialize)]
struct OpenAiBatchResult {
    custom_id: String,
    embedding: Vec<f32>,
}

#[async_trait]
impl RemoteBatchApi for OpenAiBatchApi {
    async fn submit(&self, requests: &[BatchRequest]) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings/batches", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&OpenAiBatchSubmit {
                model: &self.model,
                requests,
            })
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        if status == 404 || status == 501 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::BatchUnavailable(body));
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, body));
        }

        let job: OpenAiBatchJob = response.json().await.map_err(network_error)?;
        Ok(job.id)
    }

    async fn poll(&self, job_id: &str) -> Result<BatchPoll, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/embeddings/batches/{job_id}",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, body));
        }

        let parsed: OpenAiBatchStatus = response.json().await.map_err(network_error)?;
        match parsed.status.as_str() {
            "completed" => {
                let map = parsed
                    .results
                    .into_iter()
                    .map(|r| (r.custom_id, r.embedding))
                    .collect();
                Ok(BatchPoll::Completed(map))
            }
            "failed" | "cancelled" | "expired" => Ok(BatchPoll::Failed(
                parsed.error.unwrap_or_else(|| parsed.status.clone()),
            )),
            _ => Ok(BatchPoll::Pending),
        }
    }
}

// ============ Gemini ============

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    max_input_tokens: usize,
}

#[derive(Serialize)]
struct GeminiBatchRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiContent,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl GeminiProvider {
    pub fn new(
        base_url: String,
        model: String,
        dims: usize,
        max_input_tokens: usize,
    ) -> anyhow::Result<Self> {
        let api_key = require_env("GEMINI_API_KEY")?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            dims,
            max_input_tokens,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn id(&self) -> ProviderKind {
        ProviderKind::Gemini
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn base_url(&self) -> &str {
        &self.base_url
    }
    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Other("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = GeminiBatchRequest {
            requests: texts
                .iter()
                .map(|text| GeminiEmbedRequest {
                    model: format!("models/{}", self.model),
                    content: GeminiContent {
                        parts: vec![GeminiPart { text: text.clone() }],
                    },
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:batchEmbedContents?key={}",
                self.base_url, self.model, self.api_key
            ))
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, body));
        }

        let parsed: GeminiBatchResponse = response.json().await.map_err(network_error)?;
        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }
}

// ============ Voyage ============

pub struct VoyageProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    max_input_tokens: usize,
}

#[derive(Serialize)]
struct VoyageRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct VoyageResponse {
    data: Vec<VoyageData>,
}

#[derive(Deserialize)]
struct VoyageData {
    embedding: Vec<f32>,
}

impl VoyageProvider {
    pub fn new(
        base_url: String,
        model: String,
        dims: usize,
        max_input_tokens: usize,
    ) -> anyhow::Result<Self> {
        let api_key = require_env("VOYAGE_API_KEY")?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            dims,
            max_input_tokens,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageProvider {
    fn id(&self) -> ProviderKind {
        ProviderKind::Voyage
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn base_url(&self) -> &str {
        &self.base_url
    }
    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Other("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&VoyageRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, body));
        }

        let parsed: VoyageResponse = response.json().await.map_err(network_error)?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ============ Local ============

/// Offline feature-hashing embedder.
///
/// Tokenizes on non-alphanumeric boundaries, hashes each lowercased token
/// into one of `dims` buckets (FNV-1a), accumulates counts, and
/// L2-normalizes. Deterministic across processes, needs no model files,
/// and gives usable lexical-overlap similarity for small corpora.
pub struct LocalProvider {
    model: String,
    dims: usize,
    max_input_tokens: usize,
}

impl LocalProvider {
    pub fn new(model: String, dims: usize, max_input_tokens: usize) -> Self {
        Self {
            model,
            dims: dims.max(16),
            max_input_tokens,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let mut any = false;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(token.to_lowercase().as_bytes()) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
            any = true;
        }
        if !any {
            return vec![0.0; self.dims];
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn id(&self) -> ProviderKind {
        ProviderKind::Local
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn base_url(&self) -> &str {
        ""
    }
    fn is_local(&self) -> bool {
        true
    }
    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_one(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ProviderError::RateLimited("slow down".into()).is_retryable());
        assert!(ProviderError::Server {
            status: 502,
            body: "bad gateway".into()
        }
        .is_retryable());
        assert!(ProviderError::QuotaExhausted("resource has been exhausted".into())
            .is_retryable());
        assert!(!ProviderError::BadRequest {
            status: 400,
            body: "bad input".into()
        }
        .is_retryable());
        assert!(!ProviderError::BatchUnavailable("no batches".into()).is_retryable());
    }

    #[test]
    fn message_classifier_fallback() {
        assert!(retryable_message("HTTP 429 Too Many Requests"));
        assert!(retryable_message("resource has been exhausted"));
        assert!(retryable_message("Cloudflare interstitial page"));
        assert!(retryable_message("upstream returned 503"));
        assert!(!retryable_message("invalid model name"));
    }

    #[test]
    fn embedding_related_matcher() {
        assert!(embedding_related("embedding request failed"));
        assert!(embedding_related("Batch job expired"));
        assert!(!embedding_related("disk full"));
    }

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(
            classify_response(429, "x".into()),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_response(500, "x".into()),
            ProviderError::Server { status: 500, .. }
        ));
        assert!(matches!(
            classify_response(400, "Resource has been exhausted".into()),
            ProviderError::QuotaExhausted(_)
        ));
        assert!(matches!(
            classify_response(400, "x".into()),
            ProviderError::BadRequest { .. }
        ));
    }

    #[tokio::test]
    async fn local_provider_is_deterministic_and_normalized() {
        let provider = LocalProvider::new("feature-hash-256".into(), 256, 8000);
        let a = provider.embed_query("the quick brown fox").await.unwrap();
        let b = provider.embed_query("the quick brown fox").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let zero = provider.embed_query("   ").await.unwrap();
        assert!(zero.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn local_provider_similarity_orders_sensibly() {
        let provider = LocalProvider::new("feature-hash-256".into(), 256, 8000);
        let query = provider.embed_query("rust async runtime").await.unwrap();
        let close = provider
            .embed_query("notes about the rust async runtime")
            .await
            .unwrap();
        let far = provider.embed_query("grocery list apples").await.unwrap();
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&query, &close) > dot(&query, &far));
    }

    #[test]
    fn provider_key_is_stable_and_non_secret() {
        let a = LocalProvider::new("feature-hash-256".into(), 256, 8000);
        let b = LocalProvider::new("feature-hash-256".into(), 256, 8000);
        assert_eq!(provider_key(&a), provider_key(&b));
        assert_eq!(provider_key(&a).len(), 16);

        let c = LocalProvider::new("feature-hash-512".into(), 512, 8000);
        assert_ne!(provider_key(&a), provider_key(&c));
    }
}
