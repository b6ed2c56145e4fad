//! Request adapter: chat request to job payload, decoder events to response frames.

use serde::Serialize;
use serde_json::{json, Value};

use tabrelay_core::{BridgeConfig, ModelRegistry};
use tabrelay_dispatch::Job;

use crate::types::*;

/// Prefix of the inline error delta appended to a failed stream.
pub const ERROR_PREFIX: &str = "\n\n[Bridge Error]: ";

/// Message-shaping switches, taken from the config on every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterOptions {
    /// Merge all system messages into one leading system message.
    pub tavern_mode: bool,
    /// Append a synthetic `{"user", " "}` turn.
    pub bypass: bool,
    /// Append an empty assistant turn for the worker to fill.
    pub assistant_placeholder: bool,
}

impl From<&BridgeConfig> for AdapterOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            tavern_mode: config.tavern_mode_enabled,
            bypass: config.bypass_enabled,
            assistant_placeholder: config.assistant_placeholder_enabled,
        }
    }
}

/// `{role, content}` entry of the worker payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
}

impl MessageTemplate {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestAdapter {
    options: AdapterOptions,
}

impl RequestAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }

    /// Flatten content, apply tavern merge, bypass turn and assistant placeholder.
    pub fn normalize(&self, messages: &[ChatMessage]) -> Vec<MessageTemplate> {
        let mut templates: Vec<MessageTemplate> = messages
            .iter()
            .map(|m| {
                let content = m.content.as_ref().map(|c| c.flatten()).unwrap_or_default();
                if m.role == "user" && content.is_empty() {
                    MessageTemplate::new(&m.role, " ")
                } else {
                    MessageTemplate::new(&m.role, content)
                }
            })
            .collect();

        if self.options.tavern_mode {
            let (system, rest): (Vec<_>, Vec<_>) =
                templates.into_iter().partition(|t| t.role == "system");
            let merged = system
                .into_iter()
                .map(|t| t.content)
                .collect::<Vec<_>>()
                .join("\n\n");
            templates = Vec::with_capacity(rest.len() + 1);
            if !merged.is_empty() {
                templates.push(MessageTemplate::new("system", merged));
            }
            templates.extend(rest);
        }

        if self.options.bypass {
            templates.push(MessageTemplate::new("user", " "));
        }
        if self.options.assistant_placeholder {
            templates.push(MessageTemplate::new("assistant", ""));
        }
        templates
    }

    /// Opaque payload delivered to the worker.
    pub fn build_payload(&self, request: &ChatCompletionRequest, models: &ModelRegistry) -> Value {
        json!({
            "message_templates": self.normalize(&request.messages),
            "target_model_id": models.resolve(request.model.as_deref()),
        })
    }

    pub fn build_job(
        &self,
        task_id: &str,
        request: &ChatCompletionRequest,
        models: &ModelRegistry,
    ) -> Job {
        Job::new(task_id, self.build_payload(request, models))
    }
}

/// OpenAI spelling of a backend finish reason.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "content-filter" => "content_filter".into(),
        other => other.into(),
    }
}

/// Builds the outgoing frames of one response, sharing id, model and timestamp.
#[derive(Debug, Clone)]
pub struct ResponseFrames {
    id: String,
    model: String,
    created: i64,
}

impl ResponseFrames {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn delta(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: Some("assistant".into()),
                content: Some(text.to_string()),
            },
            None,
        )
    }

    /// Content without a role, used for warnings.
    pub fn notice(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: None,
                content: Some(text.to_string()),
            },
            None,
        )
    }

    pub fn error(&self, message: &str) -> ChatCompletionChunk {
        self.notice(&format!("{}{}", ERROR_PREFIX, message))
    }

    pub fn finish(&self, reason: &str) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(map_finish_reason(reason)))
    }

    pub fn completion(&self, content: String, finish_reason: &str) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".into(),
                    content,
                },
                finish_reason: map_finish_reason(finish_reason),
            }],
            usage: Usage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
        }
    }

    fn roles(templates: &[MessageTemplate]) -> Vec<&str> {
        templates.iter().map(|t| t.role.as_str()).collect()
    }

    #[test]
    fn test_empty_user_becomes_space() {
        let adapter = RequestAdapter::new(AdapterOptions::default());
        let out = adapter.normalize(&[msg("user", ""), msg("assistant", "")]);
        assert_eq!(out[0].content, " ");
        assert_eq!(out[1].content, "");
    }

    #[test]
    fn test_tavern_merge() {
        let adapter = RequestAdapter::new(AdapterOptions {
            tavern_mode: true,
            ..Default::default()
        });
        let out = adapter.normalize(&[
            msg("user", "hi"),
            msg("system", "one"),
            msg("assistant", "yo"),
            msg("system", "two"),
        ]);
        assert_eq!(roles(&out), vec!["system", "user", "assistant"]);
        assert_eq!(out[0].content, "one\n\ntwo");
    }

    #[test]
    fn test_tavern_without_system() {
        let adapter = RequestAdapter::new(AdapterOptions {
            tavern_mode: true,
            ..Default::default()
        });
        let out = adapter.normalize(&[msg("user", "hi")]);
        assert_eq!(roles(&out), vec!["user"]);
    }

    #[test]
    fn test_bypass_and_placeholder() {
        let adapter = RequestAdapter::new(AdapterOptions {
            tavern_mode: false,
            bypass: true,
            assistant_placeholder: true,
        });
        let out = adapter.normalize(&[msg("user", "hi")]);
        assert_eq!(roles(&out), vec!["user", "user", "assistant"]);
        assert_eq!(out[1].content, " ");
        assert_eq!(out[2].content, "");
    }

    #[test]
    fn test_payload_resolves_model() {
        let mut table = BTreeMap::new();
        table.insert("gpt-4o".to_string(), "id-4o".to_string());
        let models = ModelRegistry::from_map(table, "fallback");
        let adapter = RequestAdapter::default();

        let mut request = ChatCompletionRequest {
            model: Some("gpt-4o".into()),
            messages: vec![msg("user", "hi")],
            stream: false,
        };
        let payload = adapter.build_payload(&request, &models);
        assert_eq!(payload["target_model_id"], "id-4o");
        assert_eq!(payload["message_templates"][0]["content"], "hi");

        request.model = Some("unknown".into());
        let job = adapter.build_job("t1", &request, &models);
        assert_eq!(job.task_id, "t1");
        assert_eq!(job.payload["target_model_id"], "fallback");
    }

    #[test]
    fn test_frames() {
        let frames = ResponseFrames::new("gpt-4o");
        let delta = serde_json::to_value(frames.delta("Hi")).unwrap();
        assert_eq!(delta["object"], "chat.completion.chunk");
        assert_eq!(delta["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(delta["choices"][0]["delta"]["role"], "assistant");
        assert!(delta["choices"][0]["finish_reason"].is_null());

        let finish = serde_json::to_value(frames.finish("content-filter")).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "content_filter");
        assert_eq!(finish["id"], delta["id"]);

        let error = serde_json::to_value(frames.error("boom")).unwrap();
        assert_eq!(error["choices"][0]["delta"]["content"], "\n\n[Bridge Error]: boom");

        let done = serde_json::to_value(frames.completion("All".into(), "stop")).unwrap();
        assert_eq!(done["choices"][0]["message"]["content"], "All");
        assert_eq!(done["usage"]["total_tokens"], 0);
    }
}
