use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_core::{
    ResilienceConfig, SearchConfig, SearchHealth, SearchHit, SemanticSearch, VigilError,
};

use crate::breaker::CircuitBreaker;

/// Result of an indexing request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexReport {
    #[serde(default)]
    pub files_indexed: u64,
    #[serde(default)]
    pub chunks_created: u64,
    #[serde(default)]
    pub duration_seconds: f64,
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
    #[serde(default)]
    indexed_repos: u64,
    #[serde(default)]
    total_chunks: u64,
}

#[derive(Serialize)]
struct SearchBody<'a> {
    query: &'a str,
    repo_path: &'a str,
    limit: usize,
    threshold: f64,
}

#[derive(Deserialize)]
struct SearchResults {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    file_path: String,
    chunk_text: String,
    #[serde(default)]
    score: f64,
}

#[derive(Serialize)]
struct RepoBody<'a> {
    repo_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    force: Option<bool>,
}

#[derive(Deserialize)]
struct IndexedBody {
    #[serde(default)]
    indexed: bool,
}

/// Every non-health response carries `success`, and `error` when it is false.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    error: Option<String>,
}

/// HTTP client for the semantic code search service.
///
/// # Examples
///
/// ```
/// use vigil_core::SearchConfig;
/// use vigil_remote::SearchClient;
///
/// let client = SearchClient::new(&SearchConfig::default()).unwrap();
/// assert_eq!(client.base_url(), "http://localhost:5000");
/// ```
pub struct SearchClient {
    client: reqwest::Client,
    base_url: String,
}

impl SearchClient {
    /// # Errors
    ///
    /// Returns [`VigilError::Search`] if the HTTP client cannot be built.
    pub fn new(config: &SearchConfig) -> Result<Self, VigilError> {
        Self::with_timeout(&config.base_url, config.timeout)
    }

    /// # Errors
    ///
    /// Returns [`VigilError::Search`] if the HTTP client cannot be built.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, VigilError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VigilError::Search(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the service to index `repo_path`, re-indexing when `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Search`] on transport failures or an error reply.
    pub async fn index(&self, repo_path: &str, force: bool) -> Result<IndexReport, VigilError> {
        self.post(
            "index",
            &RepoBody {
                repo_path,
                force: Some(force),
            },
        )
        .await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R, VigilError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| VigilError::Search(format!("{endpoint} request failed: {e}")))?;

        let status = response.status();
        let value: serde_json::Value = response.json().await.map_err(|e| {
            VigilError::Search(format!("{endpoint} returned {status} with unreadable body: {e}"))
        })?;

        let envelope: Envelope = serde_json::from_value(value.clone())?;
        if !status.is_success() || !envelope.success {
            let reason = envelope.error.unwrap_or_else(|| status.to_string());
            return Err(VigilError::Search(format!("{endpoint} failed: {reason}")));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl SemanticSearch for SearchClient {
    async fn health(&self) -> Result<SearchHealth, VigilError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VigilError::Search(format!("health request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(VigilError::Search(format!(
                "health returned {}",
                response.status()
            )));
        }
        let body: HealthBody = response
            .json()
            .await
            .map_err(|e| VigilError::Search(format!("unreadable health response: {e}")))?;
        Ok(SearchHealth {
            status: body.status,
            indexed_repo_count: body.indexed_repos,
            chunk_count: body.total_chunks,
        })
    }

    async fn search(
        &self,
        query: &str,
        repo_path: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SearchHit>, VigilError> {
        let body = SearchBody {
            query,
            repo_path,
            limit,
            threshold,
        };
        let results: SearchResults = self.post("search", &body).await?;
        debug!(query, hits = results.results.len(), "semantic search");
        Ok(results
            .results
            .into_iter()
            .map(|r| SearchHit {
                path: r.file_path,
                excerpt: r.chunk_text,
                score: r.score,
            })
            .collect())
    }

    async fn check_indexed(&self, repo_path: &str) -> Result<bool, VigilError> {
        let body: IndexedBody = self
            .post(
                "check-indexed",
                &RepoBody {
                    repo_path,
                    force: None,
                },
            )
            .await?;
        Ok(body.indexed)
    }
}

/// A [`SemanticSearch`] whose calls pass through a circuit breaker.
///
/// Once the service has failed enough times in a row, calls return
/// [`VigilError::CircuitOpen`] without touching the network until the
/// cool-down elapses.
pub struct GuardedSearch<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S: SemanticSearch> GuardedSearch<S> {
    pub fn new(inner: S, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// Guard `inner` with a breaker tuned by `[resilience]`.
    pub fn from_config(inner: S, config: &ResilienceConfig) -> Self {
        Self::new(inner, CircuitBreaker::from_config("semantic-search", config))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SemanticSearch> SemanticSearch for GuardedSearch<S> {
    async fn health(&self) -> Result<SearchHealth, VigilError> {
        self.breaker.call(move || self.inner.health()).await
    }

    async fn search(
        &self,
        query: &str,
        repo_path: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SearchHit>, VigilError> {
        self.breaker
            .call(move || self.inner.search(query, repo_path, limit, threshold))
            .await
    }

    async fn check_indexed(&self, repo_path: &str) -> Result<bool, VigilError> {
        self.breaker
            .call(move || self.inner.check_indexed(repo_path))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::clock::ManualClock;

    fn client(server: &MockServer) -> SearchClient {
        SearchClient::with_timeout(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn health_maps_service_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "service": "cocoindex",
                "database": "connected",
                "flow": "loaded",
                "indexed_repos": 4,
                "total_chunks": 1200
            })))
            .mount(&server)
            .await;

        let health = client(&server).health().await.unwrap();
        assert!(health.is_ok());
        assert_eq!(health.indexed_repo_count, 4);
        assert_eq!(health.chunk_count, 1200);
    }

    #[tokio::test]
    async fn search_sends_wire_format_and_maps_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_json(serde_json::json!({
                "query": "session token validation",
                "repo_path": "/repos/shop",
                "limit": 10,
                "threshold": 0.7
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "results": [{
                    "file_path": "src/session.ts",
                    "chunk_text": "export function validate(token) {}",
                    "chunk_type": "function",
                    "start_line": 10,
                    "end_line": 12,
                    "language": "typescript",
                    "score": 0.91,
                    "description": null
                }],
                "count": 1,
                "duration_ms": 12.5
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hits = client(&server)
            .search("session token validation", "/repos/shop", 10, 0.7)
            .await
            .unwrap();
        assert_eq!(
            hits,
            vec![SearchHit {
                path: "src/session.ts".into(),
                excerpt: "export function validate(token) {}".into(),
                score: 0.91,
            }]
        );
    }

    #[tokio::test]
    async fn error_envelope_becomes_search_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check-indexed"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "success": false,
                "error": "Service not initialized"
            })))
            .mount(&server)
            .await;

        let err = client(&server).check_indexed("/repos/shop").await.unwrap_err();
        match err {
            VigilError::Search(msg) => assert!(msg.contains("Service not initialized")),
            other => panic!("expected search error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_indexed_and_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check-indexed"))
            .and(body_json(serde_json::json!({ "repo_path": "/repos/shop" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true, "indexed": true, "repo_path": "/repos/shop"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/index"))
            .and(body_json(serde_json::json!({ "repo_path": "/repos/shop", "force": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true, "files_indexed": 31, "chunks_created": 402, "duration_seconds": 3.2
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.check_indexed("/repos/shop").await.unwrap());
        let report = client.index("/repos/shop", true).await.unwrap();
        assert_eq!(report.files_indexed, 31);
        assert_eq!(report.chunks_created, 402);
    }

    #[tokio::test]
    async fn guarded_search_stops_calling_a_dead_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new());
        let guarded = GuardedSearch::new(
            client(&server),
            CircuitBreaker::with_clock("semantic-search", 3, Duration::from_secs(60), clock),
        );

        for _ in 0..3 {
            assert!(matches!(guarded.health().await, Err(VigilError::Search(_))));
        }
        let err = guarded.health().await.unwrap_err();
        assert!(matches!(err, VigilError::CircuitOpen { .. }));
        assert!(err.is_unavailable());
    }
}
