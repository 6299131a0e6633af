//! Web-search research adapter.
//!
//! Drives the Parallel Search API: plans keyword queries from the operator
//! prompt, runs one agentic search, and folds the ranked excerpts into a
//! research summary with sources. Stateless across turns: no resume
//! tokens, nothing to interrupt beyond abandoning the stream.

use std::time::Instant;

use async_stream::stream;
use serde::{Deserialize, Serialize};

use crate::config::ResearchConfig;
use crate::error::BackendError;
use crate::gate::PermissionOutcome;
use crate::message::{ResearchPhase, ResearchSource};

use super::{BackendEvent, BackendStream, InvokeRequest, ResultEnvelope};

const PARALLEL_SEARCH_URL: &str = "https://api.parallel.ai/v1beta/search";
const PARALLEL_BETA_HEADER: &str = "search-extract-2025-10-10";
/// Keyword queries may not exceed this many characters.
const MAX_QUERY_CHARS: usize = 200;

/// Research agent backed by the Parallel Search API.
pub struct ResearchBackend {
    config: ResearchConfig,
    http: reqwest::Client,
    base_url: String,
}

impl ResearchBackend {
    pub fn new(config: ResearchConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            base_url: PARALLEL_SEARCH_URL.to_string(),
        }
    }

    /// Overrides the search endpoint (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn api_key(&self) -> Result<String, BackendError> {
        if let Some(key) = &self.config.api_key {
            let trimmed = key.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        match std::env::var("PARALLEL_API_KEY") {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(BackendError::config(
                "PARALLEL_API_KEY not set and no research api_key configured",
            )),
        }
    }

    /// Starts one research turn.
    ///
    /// # Errors
    /// Returns a configuration error when no API key is available.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<BackendStream, BackendError> {
        let api_key = self.api_key()?;
        let objective = request.prompt.trim().to_string();
        if objective.is_empty() {
            return Err(BackendError::api("Research objective cannot be empty"));
        }

        let http = self.http.clone();
        let url = self.base_url.clone();
        let max_results = self.config.max_results.clamp(1, 20);

        let stream = stream! {
            let started = Instant::now();
            yield Ok(BackendEvent::ResearchProgress {
                phase: ResearchPhase::Planning,
                search_count: 0,
            });

            let queries = derive_queries(&objective);
            let search_count = queries.len() as u32;
            yield Ok(BackendEvent::ResearchProgress {
                phase: ResearchPhase::Searching,
                search_count,
            });

            let search = SearchRequest {
                objective: objective.clone(),
                search_queries: (!queries.is_empty()).then_some(queries),
                max_results,
                mode: "agentic",
            };
            let response = match run_search(&http, &url, &api_key, &search).await {
                Ok(response) => response,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            yield Ok(BackendEvent::ResearchProgress {
                phase: ResearchPhase::Synthesizing,
                search_count,
            });

            let (text, sources) = summarize(&objective, &response.results);
            yield Ok(BackendEvent::ResearchResult { text, sources });
            yield Ok(BackendEvent::Completed(ResultEnvelope {
                session_id: None,
                cost_usd: None,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                num_turns: Some(1),
                is_error: false,
            }));
        };

        Ok(Box::pin(stream))
    }

    /// The research protocol has no gated tools; a decision arriving here
    /// means the stream already moved on.
    pub async fn respond_permission(
        &self,
        _conversation_id: &str,
        _request_id: &str,
        _outcome: &PermissionOutcome,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Stateless: abandoning the stream is the whole interrupt.
    pub async fn interrupt(&self, _conversation_id: &str) {}

    pub fn resume_token(&self, _conversation_id: &str) -> Option<String> {
        None
    }

    pub fn clear_session(&self, _conversation_id: &str) {}
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    objective: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_queries: Option<Vec<String>>,
    max_results: u32,
    mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[allow(dead_code)]
    search_id: String,
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    url: String,
    title: String,
    #[serde(default)]
    excerpts: Vec<String>,
}

async fn run_search(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
    request: &SearchRequest,
) -> Result<SearchResponse, BackendError> {
    let response = http
        .post(url)
        .header("Content-Type", "application/json")
        .header("x-api-key", api_key)
        .header("parallel-beta", PARALLEL_BETA_HEADER)
        .json(request)
        .send()
        .await
        .map_err(|err| BackendError::transport(format!("Search request failed: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::http_status(status.as_u16(), &body));
    }

    response
        .json()
        .await
        .map_err(|err| BackendError::parse(format!("Failed to parse search response: {err}")))
}

/// Derives keyword queries from the objective: the objective itself plus
/// its first sentence when that adds a shorter variant. Deterministic.
fn derive_queries(objective: &str) -> Vec<String> {
    let mut queries = Vec::new();
    let full: String = objective.chars().take(MAX_QUERY_CHARS).collect();
    let full = full.trim().to_string();
    if !full.is_empty() {
        queries.push(full.clone());
    }

    if let Some(first) = objective
        .split_terminator(['.', '?', '!', '\n'])
        .map(str::trim)
        .find(|s| !s.is_empty())
    {
        let first: String = first.chars().take(MAX_QUERY_CHARS).collect();
        if !first.is_empty() && first != full {
            queries.push(first);
        }
    }
    queries
}

/// Builds the result text and deduplicated source list.
fn summarize(objective: &str, results: &[SearchResult]) -> (String, Vec<ResearchSource>) {
    if results.is_empty() {
        return (
            format!("No sources found for: {objective}"),
            Vec::new(),
        );
    }

    let mut text = format!("Research findings for: {objective}\n");
    let mut sources: Vec<ResearchSource> = Vec::new();
    for result in results {
        if !sources.iter().any(|s| s.url == result.url) {
            sources.push(ResearchSource {
                url: result.url.clone(),
                title: result.title.clone(),
            });
        }
        text.push_str(&format!("\n## {}\n", result.title));
        if let Some(excerpt) = result.excerpts.first() {
            text.push_str(excerpt.trim());
            text.push('\n');
        }
        text.push_str(&format!("Source: {}\n", result.url));
    }
    (text, sources)
}
