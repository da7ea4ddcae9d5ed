//! LLM review of transactions the keyword heuristic could not classify.
//!
//! The adapter sends the ambiguous subset, reduced to a compact JSON shape,
//! and expects a single JSON object back: `{"transactions": [{"id",
//! "is_revenue", "reason"}]}`. Responses are parsed tolerantly (legacy key
//! spellings included) and degrade to an empty decision list rather than
//! failing the call. The orchestrator owns the handling of undecided items.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use revlens_core::error::{AppError, AppResult};

/// Default wall-clock budget for one review call (20 minutes)
pub const DEFAULT_REVIEW_TIMEOUT_MS: u64 = 1_200_000;

const SYSTEM_PROMPT: &str = "\
You classify incoming bank transactions of a small business as revenue or \
not. Revenue means proceeds from selling goods or services. Loans, refunds, \
owner top-ups, transfers between own accounts, deposits, dividends, salary \
returns, tax refunds and cash self-deposits are not revenue. Respond with a \
single JSON object {\"transactions\": [{\"id\": string, \"is_revenue\": \
boolean, \"reason\": string}]} covering every transaction you were given. \
No prose outside the JSON object.";

/// One ambiguous transaction, reduced for review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub date: Option<String>,
    pub amount: String,
    pub purpose: String,
    pub sender: String,
    pub correspondent: String,
    pub bin: Option<String>,
    pub comment: Option<String>,
}

/// A single decision returned by the reviewer
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewDecision {
    pub id: String,
    pub is_revenue: bool,
    pub reason: String,
}

/// Result of one review call
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub decisions: Vec<ReviewDecision>,
    /// Provider-issued response id, when the provider exposes one
    pub response_id: Option<String>,
    /// The prompt that went out, persisted as the user message
    pub user_prompt: Value,
    /// The raw assistant reply, persisted as the assistant message
    pub assistant_text: String,
}

/// Terminal/non-terminal states the provider reports for a response id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    InProgress,
    Completed,
    Failed,
}

/// Seam for the review step; the orchestrator never sees the transport.
#[async_trait]
pub trait ReviewClassifier: Send + Sync {
    /// Review a batch of ambiguous transactions. Transport failures error;
    /// semantically incomplete answers return the decisions that did arrive.
    async fn review(&self, items: &[ReviewItem]) -> AppResult<ReviewOutcome>;

    /// Best-effort status of a previously issued response
    async fn fetch_status(&self, response_id: &str) -> AppResult<Option<ProviderStatus>>;
}

// ── Tolerant decision parsing ─────────────────────────────────────────────────

fn decision_from_value(value: &Value) -> Option<ReviewDecision> {
    let obj = value.as_object()?;

    let id = match obj.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return None,
    };

    // legacy spellings: is_revenue | isRevenue | revenue | label == "revenue"
    let is_revenue = ["is_revenue", "isRevenue", "revenue"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_bool))
        .or_else(|| {
            obj.get("label")
                .and_then(Value::as_str)
                .map(|label| label.eq_ignore_ascii_case("revenue"))
        })?;

    let reason = obj
        .get("reason")
        .or_else(|| obj.get("comment"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    Some(ReviewDecision {
        id,
        is_revenue,
        reason,
    })
}

/// Parse the assistant reply into decisions. Markdown fences and surrounding
/// prose are tolerated; anything unparseable yields an empty list.
pub fn parse_decisions(assistant_text: &str) -> Vec<ReviewDecision> {
    let trimmed = assistant_text.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let parsed: Option<Value> = serde_json::from_str(candidate)
        .ok()
        .or_else(|| crate::services::extractor::recover_json_block(candidate));

    let Some(parsed) = parsed else {
        return Vec::new();
    };

    let list = match &parsed {
        Value::Object(obj) => match obj.get("transactions") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Vec::new(),
        },
        Value::Array(items) => items.as_slice(),
        _ => return Vec::new(),
    };

    list.iter().filter_map(decision_from_value).collect()
}

/// Build the user message carrying the ambiguous subset
pub fn build_user_prompt(items: &[ReviewItem]) -> Value {
    json!({ "transactions_for_review": items })
}

// ── OpenAI-style implementation ───────────────────────────────────────────────

/// Reviewer speaking the OpenAI Responses API dialect.
pub struct OpenAiClassifier {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiClassifier {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_millis(DEFAULT_REVIEW_TIMEOUT_MS),
            max_retries: 2,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn send_review(&self, user_prompt: &Value) -> AppResult<Value> {
        let url = format!("{}/v1/responses", self.base_url);
        let payload = json!({
            "model": self.model,
            "instructions": SYSTEM_PROMPT,
            "input": user_prompt.to_string(),
        });

        let mut last_error: Option<AppError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::warn!(attempt, "Retrying LLM review call");
            }

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    last_error = Some(AppError::UpstreamUnavailable(format!(
                        "LLM provider unreachable: {}",
                        e
                    )));
                    continue;
                }
                Err(e) => {
                    return Err(AppError::UpstreamUnavailable(format!(
                        "LLM request failed: {}",
                        e
                    )));
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < self.max_retries {
                        last_error = Some(AppError::ExternalApiError(format!(
                            "LLM provider returned {}",
                            status
                        )));
                        continue;
                    }
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(AppError::ExternalApiError(format!(
                            "LLM provider returned {}: {}",
                            status,
                            body.chars().take(500).collect::<String>()
                        )));
                    }
                    return Ok(response.json().await?);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::ExternalApiError("LLM review failed".to_string())))
    }
}

/// Pull the assistant text out of a Responses API body, with a
/// chat-completions fallback for older gateways.
fn assistant_text_from_body(body: &Value) -> Option<String> {
    if let Some(items) = body.get("output").and_then(Value::as_array) {
        for item in items {
            if item.get("type").and_then(Value::as_str) == Some("message") {
                if let Some(parts) = item.get("content").and_then(Value::as_array) {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            return Some(text.to_string());
                        }
                    }
                }
            }
        }
    }
    if let Some(text) = body.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    body.get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[async_trait]
impl ReviewClassifier for OpenAiClassifier {
    async fn review(&self, items: &[ReviewItem]) -> AppResult<ReviewOutcome> {
        let user_prompt = build_user_prompt(items);
        let body = self.send_review(&user_prompt).await?;

        let response_id = body
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let assistant_text = assistant_text_from_body(&body).unwrap_or_default();
        let decisions = parse_decisions(&assistant_text);

        tracing::info!(
            reviewed = items.len(),
            decided = decisions.len(),
            "LLM review completed"
        );

        Ok(ReviewOutcome {
            decisions,
            response_id,
            user_prompt,
            assistant_text,
        })
    }

    async fn fetch_status(&self, response_id: &str) -> AppResult<Option<ProviderStatus>> {
        let url = format!("{}/v1/responses/{}", self.base_url, response_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| {
                AppError::UpstreamUnavailable(format!("LLM status fetch failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let body: Value = response.json().await?;
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .map(|status| match status {
                "completed" => ProviderStatus::Completed,
                "failed" | "cancelled" | "incomplete" | "expired" => ProviderStatus::Failed,
                _ => ProviderStatus::InProgress,
            });

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> ReviewItem {
        ReviewItem {
            id: id.to_string(),
            date: Some("2024-05-10".to_string()),
            amount: "300000".to_string(),
            purpose: "Пополнение счета от ИП Ахметов".to_string(),
            sender: "ИП Ахметов".to_string(),
            correspondent: String::new(),
            bin: None,
            comment: None,
        }
    }

    #[test]
    fn test_parse_decisions_strict_shape() {
        let text = r#"{"transactions": [{"id": "s_1", "is_revenue": true, "reason": "оплата от клиента"}]}"#;
        let decisions = parse_decisions(text);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].id, "s_1");
        assert!(decisions[0].is_revenue);
        assert_eq!(decisions[0].reason, "оплата от клиента");
    }

    #[test]
    fn test_parse_decisions_legacy_key_spellings() {
        let text = r#"{"transactions": [
            {"id": "a", "isRevenue": false, "reason": "r1"},
            {"id": "b", "revenue": true, "reason": "r2"},
            {"id": "c", "label": "revenue", "reason": "r3"},
            {"id": "d", "label": "non-revenue", "reason": "r4"}
        ]}"#;
        let decisions = parse_decisions(text);
        assert_eq!(decisions.len(), 4);
        assert!(!decisions[0].is_revenue);
        assert!(decisions[1].is_revenue);
        assert!(decisions[2].is_revenue);
        assert!(!decisions[3].is_revenue);
    }

    #[test]
    fn test_parse_decisions_numeric_ids_and_markdown_fences() {
        let text = "```json\n{\"transactions\": [{\"id\": 7, \"is_revenue\": true, \"reason\": \"x\"}]}\n```";
        let decisions = parse_decisions(text);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].id, "7");
    }

    #[test]
    fn test_parse_decisions_surrounding_prose() {
        let text = "Here is the classification:\n{\"transactions\": [{\"id\": \"s_1\", \"is_revenue\": false, \"reason\": \"займ\"}]}\nThanks!";
        let decisions = parse_decisions(text);
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn test_parse_decisions_degrades_to_empty() {
        assert!(parse_decisions("").is_empty());
        assert!(parse_decisions("not json at all").is_empty());
        assert!(parse_decisions(r#"{"something": "else"}"#).is_empty());
        // decision without a usable verdict is skipped
        let partial = r#"{"transactions": [{"id": "s_1"}, {"id": "s_2", "is_revenue": true, "reason": ""}]}"#;
        let decisions = parse_decisions(partial);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].id, "s_2");
    }

    #[test]
    fn test_build_user_prompt_shape() {
        let prompt = build_user_prompt(&[item("s_1")]);
        let listed = prompt["transactions_for_review"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], "s_1");
        assert_eq!(listed[0]["purpose"], "Пополнение счета от ИП Ахметов");
    }

    #[tokio::test]
    async fn test_review_against_mock_provider() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "id": "resp_123",
            "status": "completed",
            "output": [{
                "type": "message",
                "content": [{
                    "type": "output_text",
                    "text": "{\"transactions\": [{\"id\": \"s_1\", \"is_revenue\": true, \"reason\": \"оплата от клиента\"}]}"
                }]
            }]
        });
        let mock = server
            .mock("POST", "/v1/responses")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let classifier = OpenAiClassifier::new(reqwest::Client::new(), "test-key".to_string())
            .with_base_url(server.url());
        let outcome = classifier.review(&[item("s_1")]).await.expect("review");

        mock.assert_async().await;
        assert_eq!(outcome.response_id.as_deref(), Some("resp_123"));
        assert_eq!(outcome.decisions.len(), 1);
        assert!(outcome.decisions[0].is_revenue);
        assert!(outcome.assistant_text.contains("transactions"));
    }

    #[tokio::test]
    async fn test_review_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/responses")
            .with_status(401)
            .with_body("{\"error\": \"bad key\"}")
            .expect(1)
            .create_async()
            .await;

        let classifier = OpenAiClassifier::new(reqwest::Client::new(), "bad-key".to_string())
            .with_base_url(server.url());
        let result = classifier.review(&[item("s_1")]).await;

        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_review_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/v1/responses")
            .with_status(503)
            .with_body("overloaded")
            .expect(3)
            .create_async()
            .await;

        let classifier = OpenAiClassifier::new(reqwest::Client::new(), "test-key".to_string())
            .with_base_url(server.url())
            .with_max_retries(2);
        let result = classifier.review(&[item("s_1")]).await;

        failing.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_status_maps_terminal_states() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/responses/resp_1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{\"id\": \"resp_1\", \"status\": \"completed\"}")
            .create_async()
            .await;

        let classifier = OpenAiClassifier::new(reqwest::Client::new(), "test-key".to_string())
            .with_base_url(server.url());
        let status = classifier.fetch_status("resp_1").await.expect("status");
        assert_eq!(status, Some(ProviderStatus::Completed));
    }

    #[tokio::test]
    async fn test_fetch_status_unknown_response_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/responses/resp_404")
            .with_status(404)
            .create_async()
            .await;

        let classifier = OpenAiClassifier::new(reqwest::Client::new(), "test-key".to_string())
            .with_base_url(server.url());
        let status = classifier.fetch_status("resp_404").await.expect("status");
        assert_eq!(status, None);
    }
}
