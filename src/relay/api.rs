//! Direct API transport for responders with configured credentials.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::models::responder::{HistoryMessage, Responder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCredential {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Maps responders to direct-API credentials. Backed by the settings store
/// in the host application.
pub trait CredentialStore: Send + Sync {
    fn credential_for(&self, responder: &Responder) -> Option<ApiCredential>;
}

/// In-memory credentials keyed by responder kind.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_kind: HashMap<String, ApiCredential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, credential: ApiCredential) -> Self {
        self.by_kind.insert(kind.into(), credential);
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn credential_for(&self, responder: &Responder) -> Option<ApiCredential> {
        self.by_kind.get(&responder.kind).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub content: String,
    pub reasoning: Option<String>,
}

impl ApiReply {
    /// Final text, with the reasoning block first when the API returned one.
    pub fn into_text(self) -> String {
        match self.reasoning {
            Some(reasoning) if !reasoning.trim().is_empty() => {
                format!("<think>\n{}\n</think>\n\n{}", reasoning.trim(), self.content)
            }
            _ => self.content,
        }
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn complete(
        &self,
        credential: &ApiCredential,
        history: &[&HistoryMessage],
        prompt: &str,
    ) -> AppResult<ApiReply>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Api(format!("HTTP client error: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ChatApi for OpenAiCompatClient {
    async fn complete(
        &self,
        credential: &ApiCredential,
        history: &[&HistoryMessage],
        prompt: &str,
    ) -> AppResult<ApiReply> {
        let mut messages: Vec<serde_json::Value> = history
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        messages.push(json!({"role": "user", "content": prompt}));

        let url = format!("{}/chat/completions", credential.base_url.trim_end_matches('/'));
        log::debug!("POST {} (model={}, {} messages)", url, credential.model, messages.len());

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&credential.api_key)
            .json(&json!({
                "model": credential.model,
                "messages": messages,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| AppError::Api(format!("HTTP request error: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AppError::Api(format!("Read body error: {e}")))?;
        if !status.is_success() {
            return Err(AppError::Api(format!("HTTP {status}: {}", truncate(&body, 300))));
        }

        parse_completion(&body)
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

pub fn parse_completion(body: &str) -> AppResult<ApiReply> {
    let parsed: CompletionResponse = serde_json::from_str(body)?;
    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| AppError::Api("Completion response has no choices".into()))?;

    let content = message.content.unwrap_or_default();
    if content.trim().is_empty() {
        return Err(AppError::Api("Completion response has empty content".into()));
    }
    Ok(ApiReply {
        content,
        reasoning: message.reasoning_content,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_with_reasoning() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"42","reasoning_content":"thinking hard"}}]}"#;
        let reply = parse_completion(body).expect("should parse");
        assert_eq!(reply.content, "42");
        assert_eq!(reply.into_text(), "<think>\nthinking hard\n</think>\n\n42");
    }

    #[test]
    fn test_parse_completion_plain() {
        let body = r#"{"choices":[{"message":{"content":"hello"}}]}"#;
        assert_eq!(parse_completion(body).expect("should parse").into_text(), "hello");
    }

    #[test]
    fn test_parse_completion_rejects_empty() {
        assert!(matches!(parse_completion(r#"{"choices":[]}"#), Err(AppError::Api(_))));
        assert!(matches!(
            parse_completion(r#"{"choices":[{"message":{"content":"  "}}]}"#),
            Err(AppError::Api(_))
        ));
        assert!(matches!(parse_completion("not json"), Err(AppError::Serde(_))));
    }

    #[test]
    fn test_static_credentials_match_by_kind() {
        let store = StaticCredentials::new().with(
            "deepseek",
            ApiCredential {
                base_url: "https://api.example.com/v1".into(),
                api_key: "sk-test".into(),
                model: "deepseek-chat".into(),
            },
        );
        assert!(store.credential_for(&Responder::new("slot-1", "deepseek")).is_some());
        assert!(store.credential_for(&Responder::new("slot-2", "claude")).is_none());
    }
}
