use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

use crate::agent::{extract_json, AgentError, Decision, Grounder, Location, Reasoner, Screenshot};
use crate::memory::{ConversationMemory, Role};

const ACTION_FORMAT: &str = r#"Reply with exactly one JSON object and nothing else:
{"thought": "<short reasoning>", "action": <action>}
where <action> is one of
  {"kind": "click", "target": "<element description>" | {"x": <int>, "y": <int>}}
  {"kind": "type", "text": "<text>", "target": <optional target>}
  {"kind": "key", "combo": "<combo, e.g. ctrl+alt+t or Return>", "target": <optional target>}
  {"kind": "command", "command": "<shell command>", "background": <bool>}
  {"kind": "wait", "ms": <int>}
  {"kind": "done", "summary": "<what was achieved>"}
Take a single next action, or use done if the objective is complete."#;

const GROUNDING_FORMAT: &str = r#"Locate the described UI element in the screenshot.
Reply with exactly one JSON object and nothing else:
{"x": <0..1 fraction of width>, "y": <0..1 fraction of height>, "confidence": <0..1>}
or {"found": false} if the element is not visible."#;

#[derive(Clone)]
pub struct ModelConfig {
    pub api_base: String,        // e.g. "https://api.openai.com/v1"
    pub api_key: String,         // env OPENAI_API_KEY
    pub action_model: String,    // e.g. "gpt-4o-mini"
    pub grounding_model: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let action_model = env::var("AGENT_ACTION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        Self {
            api_base: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            grounding_model: env::var("AGENT_GROUNDING_MODEL")
                .unwrap_or_else(|_| action_model.clone()),
            action_model,
            max_tokens: 1024,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Chat-completions client serving as both the reasoning and the grounding
/// model.
#[derive(Clone)]
pub struct ModelClient {
    http: Client,
    cfg: ModelConfig,
}

impl ModelClient {
    pub fn new(cfg: ModelConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, cfg })
    }

    async fn complete(&self, model: &str, messages: Vec<Value>) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let req = json!({
            "model": model,
            "max_tokens": self.cfg.max_tokens,
            "temperature": 0,
            "messages": messages,
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model endpoint error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse completion JSON")?;
        Self::content_of(&v)
    }

    fn content_of(v: &Value) -> Result<String> {
        let content = v
            .pointer("/choices/0/message/content")
            .context("completion has no message content")?;
        // Some servers return content as a list of typed parts.
        match content {
            Value::String(s) => Ok(s.clone()),
            Value::Array(parts) => Ok(parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")),
            other => bail!("unexpected content shape: {}", other),
        }
    }

    fn image_part(screenshot: &Screenshot) -> Value {
        json!({ "type": "image_url", "image_url": { "url": screenshot.data_url() } })
    }

    fn context_messages(memory: &ConversationMemory, screenshot: &Screenshot) -> Vec<Value> {
        let mut messages: Vec<Value> = memory
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": turn.render() })
            })
            .collect();
        messages.push(json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "Current screen:" },
                Self::image_part(screenshot),
                { "type": "text", "text": ACTION_FORMAT },
            ]
        }));
        messages
    }
}

/// Parses a grounding reply. `{"found": false}` and `{"not_found": true}` mean
/// no match; a reply without coordinates and confidence is an error.
pub fn parse_location(raw: &str) -> Result<Option<Location>, AgentError> {
    let json = extract_json(raw)
        .ok_or_else(|| AgentError::GroundingFailed(format!("no JSON in grounding reply: {raw}")))?;
    let v: Value = serde_json::from_str(json)
        .map_err(|e| AgentError::GroundingFailed(format!("malformed grounding reply: {e}")))?;
    let missing = v.get("found").and_then(Value::as_bool) == Some(false)
        || v.get("not_found").and_then(Value::as_bool) == Some(true);
    if missing {
        return Ok(None);
    }
    serde_json::from_value::<Location>(v)
        .map(Some)
        .map_err(|e| AgentError::GroundingFailed(format!("grounding reply lacks coordinates: {e}")))
}

#[async_trait]
impl Reasoner for ModelClient {
    async fn next(
        &self,
        context: &ConversationMemory,
        screenshot: &Screenshot,
    ) -> Result<Decision, AgentError> {
        let messages = Self::context_messages(context, screenshot);
        let raw = self
            .complete(&self.cfg.action_model, messages)
            .await
            .map_err(|e| AgentError::ReasoningModel(e.to_string()))?;
        Decision::parse(&raw)
    }
}

#[async_trait]
impl Grounder for ModelClient {
    async fn locate(
        &self,
        screenshot: &Screenshot,
        description: &str,
    ) -> Result<Option<Location>, AgentError> {
        let messages = vec![json!({
            "role": "user",
            "content": [
                Self::image_part(screenshot),
                { "type": "text", "text": format!("Element: {description}\n\n{GROUNDING_FORMAT}") },
            ]
        })];
        let raw = self
            .complete(&self.cfg.grounding_model, messages)
            .await
            .map_err(|e| AgentError::GroundingFailed(e.to_string()))?;
        parse_location(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationTurn;

    #[test]
    fn reads_string_and_part_content() {
        let v = json!({"choices": [{"message": {"content": "{\"kind\":\"done\"}"}}]});
        assert_eq!(ModelClient::content_of(&v).unwrap(), "{\"kind\":\"done\"}");

        let parts = json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        let v = json!({"choices": [{"message": {"content": parts}}]});
        assert_eq!(ModelClient::content_of(&v).unwrap(), "ab");

        assert!(ModelClient::content_of(&json!({"choices": []})).is_err());
    }

    #[test]
    fn grounding_replies() {
        let loc = parse_location(r#"{"x": 0.25, "y": 0.5, "confidence": 0.9}"#).unwrap().unwrap();
        assert_eq!(loc, Location { x: 0.25, y: 0.5, confidence: 0.9 });
        assert_eq!(parse_location(r#"{"found": false}"#).unwrap(), None);
        assert_eq!(parse_location("```json\n{\"not_found\": true}\n```").unwrap(), None);
        assert!(matches!(parse_location(r#"{"x": 0.1}"#), Err(AgentError::GroundingFailed(_))));
        assert!(parse_location("cannot see it").is_err());
    }

    #[test]
    fn context_keeps_turn_order_and_appends_screen_last() {
        let mut mem = ConversationMemory::new(Some("sys".into()), 8);
        mem.append(ConversationTurn::user("OBJECTIVE: open terminal"));
        let shot = Screenshot::new(1, b"png");
        let msgs = ModelClient::context_messages(&mem, &shot);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["content"], "OBJECTIVE: open terminal");
        assert_eq!(msgs[2]["content"][1]["image_url"]["url"], shot.data_url());
    }

    #[test]
    fn new_requires_api_key() {
        let cfg = ModelConfig { api_key: String::new(), ..ModelConfig::default() };
        assert!(ModelClient::new(cfg).is_err());
    }
}
