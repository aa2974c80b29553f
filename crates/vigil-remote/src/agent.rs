use std::fmt::Write as _;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vigil_core::{
    AgentConfig, AgentRequest, FileContext, Finding, ReasoningAgent, Severity, VigilError,
};

/// Instructions appended to every review request describing the reply shape.
pub const RESPONSE_FORMAT: &str = r#"Respond with a JSON object of the form:
{"findings": [{"file": "<path>", "line": <line in the new file>, "severity": "HIGH" | "MEDIUM" | "LOW", "category": "<short category>", "message": "<explanation>"}]}
Return {"findings": []} when there is nothing to report."#;

/// A message in a chat conversation with the agent.
///
/// # Examples
///
/// ```
/// use vigil_remote::agent::{ChatMessage, Role};
///
/// let msg = ChatMessage {
///     role: Role::User,
///     content: "Review this code".into(),
/// };
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

/// Role in the chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// OpenAI-compatible chat completions client for the reasoning agent.
///
/// HTTP failures are classified so the retry layer can tell transient
/// signals from permanent ones:
///
/// | Response | Error |
/// |---|---|
/// | 429 | [`VigilError::RateLimited`] (with `Retry-After`) |
/// | 503, 529 | [`VigilError::Overloaded`] |
/// | other 4xx | [`VigilError::AgentRejected`] |
/// | anything else | [`VigilError::Agent`] |
///
/// # Examples
///
/// ```
/// use vigil_core::AgentConfig;
/// use vigil_remote::AgentClient;
///
/// let config = AgentConfig {
///     api_key: Some("test-key".into()),
///     ..AgentConfig::default()
/// };
/// let client = AgentClient::new(&config).unwrap();
/// assert_eq!(client.model(), "gpt-4o");
/// ```
pub struct AgentClient {
    client: reqwest::Client,
    config: AgentConfig,
}

impl AgentClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Agent`] if the HTTP client cannot be built.
    pub fn new(config: &AgentConfig) -> Result<Self, VigilError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| VigilError::Agent(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Model name from the configuration.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a chat completion request and return the text of the first choice.
    ///
    /// # Errors
    ///
    /// Returns a classified [`VigilError`] for non-success statuses, and
    /// [`VigilError::Agent`] for transport or parsing failures.
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        max_output_tokens: u32,
        json_response: bool,
    ) -> Result<String, VigilError> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/');
        let url = format!("{base_url}/v1/chat/completions");

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.1,
            "max_tokens": max_output_tokens,
        });
        if json_response {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let mut request = self.client.post(&url);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        debug!(model = %self.config.model, messages = messages_len(&body), "calling reasoning agent");
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| VigilError::Agent(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after_secs, body_text));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VigilError::Agent(format!("failed to parse response: {e}")))?;

        let content = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                VigilError::Agent(format!("unexpected response structure: {response_body}"))
            })?;

        Ok(content.to_string())
    }
}

fn messages_len(body: &serde_json::Value) -> usize {
    body["messages"].as_array().map_or(0, Vec::len)
}

/// Map a non-success HTTP status to the error the retry layer understands.
pub fn classify_status(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: String,
) -> VigilError {
    match status.as_u16() {
        429 => VigilError::RateLimited { retry_after_secs },
        503 | 529 => VigilError::Overloaded(format!("{status}: {body}")),
        code @ 400..=499 => VigilError::AgentRejected {
            status: code,
            message: body,
        },
        _ => VigilError::Agent(format!("agent API error {status}: {body}")),
    }
}

#[async_trait]
impl ReasoningAgent for AgentClient {
    async fn review(&self, request: &AgentRequest) -> Result<Vec<Finding>, VigilError> {
        let system = if request.system_instructions.is_empty() {
            RESPONSE_FORMAT.to_string()
        } else {
            format!("{}\n\n{RESPONSE_FORMAT}", request.system_instructions)
        };
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: system,
            },
            ChatMessage {
                role: Role::User,
                content: render_files(&request.files),
            },
        ];
        let response = self
            .chat(messages, request.max_output_tokens, true)
            .await?;
        Ok(parse_findings(&response))
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_output_tokens: u32,
    ) -> Result<String, VigilError> {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: system.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: prompt.to_string(),
            },
        ];
        self.chat(messages, max_output_tokens, false).await
    }
}

/// Render file contexts as the user message of a review request.
///
/// # Examples
///
/// ```
/// use vigil_core::{ChangedFile, FileContext, FileStatus};
/// use vigil_remote::agent::render_files;
///
/// let ctx = FileContext::full_file(
///     ChangedFile::new("src/auth.ts", FileStatus::Modified, "+check()"),
///     "check();\n".into(),
/// );
/// let text = render_files(&[ctx]);
/// assert!(text.contains("## File: src/auth.ts"));
/// assert!(text.contains("+check()"));
/// ```
pub fn render_files(files: &[FileContext]) -> String {
    let mut out = String::new();
    for ctx in files {
        let file = &ctx.file;
        let _ = writeln!(
            out,
            "## File: {} ({}, +{}/-{})",
            file.path, file.status, file.additions, file.deletions
        );
        if let Some(previous) = &file.previous_path {
            let _ = writeln!(out, "Renamed from: {previous}");
        }
        let _ = writeln!(out, "\n### Diff\n```diff\n{}\n```", file.patch.trim_end());
        if let Some(content) = &ctx.full_content {
            let _ = writeln!(out, "\n### Full file\n```\n{}\n```", content.trim_end());
        }
        for related in &ctx.related_files {
            let relationship = match related.relationship {
                vigil_core::Relationship::Dependent => "dependent",
                vigil_core::Relationship::Test => "test",
                vigil_core::Relationship::Semantic => "related snippet",
            };
            let _ = writeln!(
                out,
                "\n### {relationship}: {}\n```\n{}\n```",
                related.path,
                related.excerpt.trim_end()
            );
        }
        out.push('\n');
    }
    out
}

#[derive(Deserialize)]
struct AgentResponse {
    #[serde(default)]
    findings: Vec<RawFinding>,
}

#[derive(Deserialize)]
struct RawFinding {
    file: Option<String>,
    line: Option<serde_json::Value>,
    severity: Option<String>,
    category: Option<String>,
    message: Option<String>,
}

/// Parse the agent's JSON reply into findings.
///
/// Tolerates code fences around the JSON. Entries without a file, a positive
/// line, a known severity or a message are skipped; an unparseable reply
/// yields no findings.
///
/// # Examples
///
/// ```
/// use vigil_core::Severity;
/// use vigil_remote::agent::parse_findings;
///
/// let reply = r#"{"findings": [{"file": "a.rs", "line": 3, "severity": "HIGH",
///     "category": "security", "message": "token logged"}]}"#;
/// let findings = parse_findings(reply);
/// assert_eq!(findings.len(), 1);
/// assert_eq!(findings[0].severity, Severity::High);
/// ```
pub fn parse_findings(response: &str) -> Vec<Finding> {
    let cleaned = strip_code_fences(response);

    let parsed: AgentResponse = match serde_json::from_str(cleaned) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to parse agent response");
            return Vec::new();
        }
    };

    let mut findings = Vec::new();
    for raw in parsed.findings {
        let line = match &raw.line {
            Some(serde_json::Value::Number(n)) => match n.as_u64() {
                Some(l) if l > 0 => l as u32,
                _ => continue,
            },
            Some(serde_json::Value::String(s)) => match s.trim().parse::<u32>() {
                Ok(l) if l > 0 => l,
                _ => continue,
            },
            _ => continue,
        };
        let Some(severity) = raw.severity.as_deref().and_then(|s| s.parse::<Severity>().ok())
        else {
            continue;
        };
        let (Some(file), Some(message)) = (raw.file, raw.message) else {
            continue;
        };
        if file.is_empty() || message.is_empty() {
            continue;
        }

        findings.push(Finding {
            file,
            line,
            severity,
            category: raw.category.unwrap_or_else(|| "general".into()),
            message,
        });
    }

    findings
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{ChangedFile, FileStatus, RelatedFile, Relationship};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AgentClient {
        let config = AgentConfig {
            api_key: Some("sk-test".into()),
            base_url: Some(server.uri()),
            ..AgentConfig::default()
        };
        AgentClient::new(&config).unwrap()
    }

    fn request() -> AgentRequest {
        AgentRequest {
            system_instructions: "Review carefully.".into(),
            files: vec![FileContext::diff_only(ChangedFile::new(
                "src/auth.ts",
                FileStatus::Modified,
                "+console.log(token)",
            ))],
            max_output_tokens: 512,
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    #[tokio::test]
    async fn review_parses_findings() {
        let server = MockServer::start().await;
        let reply = "```json\n{\"findings\": [{\"file\": \"src/auth.ts\", \"line\": 1, \"severity\": \"HIGH\", \"category\": \"security\", \"message\": \"token logged\"}]}\n```";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o",
                "max_tokens": 512,
                "response_format": { "type": "json_object" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(reply)))
            .expect(1)
            .mount(&server)
            .await;

        let findings = client_for(&server).review(&request()).await.unwrap();
        assert_eq!(
            findings,
            vec![Finding {
                file: "src/auth.ts".into(),
                line: 1,
                severity: Severity::High,
                category: "security".into(),
                message: "token logged".into(),
            }]
        );
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client_for(&server).review(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            VigilError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn overload_statuses_are_retryable() {
        for status in [503u16, 529] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("busy"))
                .mount(&server)
                .await;

            let err = client_for(&server).complete("s", "p", 10).await.unwrap_err();
            assert!(matches!(err, VigilError::Overloaded(_)), "status {status}");
        }
    }

    #[tokio::test]
    async fn client_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let err = client_for(&server).review(&request()).await.unwrap_err();
        match err {
            VigilError::AgentRejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid api key");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server).review(&request()).await.unwrap_err();
        assert!(matches!(err, VigilError::Agent(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn complete_returns_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("summary")))
            .mount(&server)
            .await;

        let text = client_for(&server)
            .complete("analyze", "guidelines", 256)
            .await
            .unwrap();
        assert_eq!(text, "summary");
    }

    #[test]
    fn parse_skips_invalid_entries() {
        let reply = r#"{"findings": [
            {"file": "a.rs", "line": 0, "severity": "HIGH", "message": "zero line"},
            {"file": "a.rs", "line": 4, "severity": "urgent", "message": "bad severity"},
            {"line": 4, "severity": "LOW", "message": "no file"},
            {"file": "b.rs", "line": "12", "severity": "medium", "message": "ok"}
        ]}"#;
        let findings = parse_findings(reply);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, "b.rs");
        assert_eq!(findings[0].line, 12);
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[0].category, "general");
    }

    #[test]
    fn parse_malformed_returns_empty() {
        assert!(parse_findings("not json at all").is_empty());
        assert!(parse_findings("{\"findings\": []}").is_empty());
    }

    #[test]
    fn render_includes_related_files() {
        let mut ctx = FileContext::full_file(
            ChangedFile::new("src/price.ts", FileStatus::Modified, "+x"),
            "export const x = 1;".into(),
        );
        ctx.related_files.push(RelatedFile {
            path: "src/price.test.ts".into(),
            relationship: Relationship::Test,
            excerpt: "test('x')".into(),
            score: None,
        });
        let text = render_files(&[ctx]);
        assert!(text.contains("### Full file"));
        assert!(text.contains("### test: src/price.test.ts"));
        assert!(text.contains("test('x')"));
    }
}
