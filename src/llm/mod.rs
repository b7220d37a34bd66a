//! Provider-agnostic streaming LLM client.
//!
//! `stream_turn` yields a channel of [`StreamChunk`]s — text deltas, tool-use
//! framing, usage, and a stop marker — with provider differences hidden
//! behind that shape. Two families are implemented (Anthropic Messages,
//! OpenAI Chat Completions); `MockLlm` drives tests with scripted turns.

mod anthropic;
mod keypool;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::errors::LlmError;
use crate::tools::ToolSpec;

pub use anthropic::AnthropicClient;
pub use keypool::KeyPool;
pub use openai::OpenAiClient;

/// Conversation roles as the providers see them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MsgRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MsgRole,
    pub content: String,
    /// Set on `Tool` rows (the result) and on assistant rows that requested
    /// the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Raw JSON input of the tool call, kept for provider replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MsgRole::User,
            content: content.into(),
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MsgRole::Assistant,
            content: content.into(),
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MsgRole::Tool,
            content: content.into(),
            tool_use_id: Some(tool_use_id.into()),
            tool_name: None,
            tool_input: None,
        }
    }
}

/// One streamed fragment of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text { delta: String },
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta { id: String, json: String },
    ToolUseStop { id: String },
    Usage { input_tokens: u64, output_tokens: u64 },
    Stop { reason: String },
}

/// Everything a provider needs for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub model: String,
    pub max_tokens: u32,
}

pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, LlmError>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Stream one conversation turn. The receiver yields chunks until a
    /// `Stop` (or an error) and then closes.
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkReceiver, LlmError>;
}

/// Per-role model selection.
#[derive(Debug, Clone)]
pub struct ModelRoles {
    pub builder: String,
    pub planner: String,
    pub auditor: String,
}

/// A fully-collected turn, for consumers that do not interleave tool calls
/// (auditor, planner).
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: Option<String>,
}

/// Drain a stream into a [`TurnOutput`]. Tool chunks are ignored; callers
/// that need tools consume the channel directly.
pub async fn collect_turn(mut rx: ChunkReceiver) -> Result<TurnOutput, LlmError> {
    let mut out = TurnOutput::default();
    while let Some(chunk) = rx.recv().await {
        match chunk? {
            StreamChunk::Text { delta } => out.text.push_str(&delta),
            StreamChunk::Usage {
                input_tokens,
                output_tokens,
            } => {
                out.input_tokens += input_tokens;
                out.output_tokens += output_tokens;
            }
            StreamChunk::Stop { reason } => {
                out.stop_reason = Some(reason);
            }
            _ => {}
        }
    }
    if out.stop_reason.is_none() {
        return Err(LlmError::TruncatedStream);
    }
    Ok(out)
}

/// Extract the first balanced JSON object from model text, tolerating prose
/// and markdown fences around it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Scripted client for tests: each `stream_turn` call plays the next
/// scripted chunk sequence and records the request it was given.
pub struct MockLlm {
    scripts: Mutex<std::collections::VecDeque<Vec<StreamChunk>>>,
    requests: Arc<Mutex<Vec<TurnRequest>>>,
}

impl MockLlm {
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A turn that emits text, usage, then a clean stop.
    pub fn text_turn(text: &str, input_tokens: u64, output_tokens: u64) -> Vec<StreamChunk> {
        vec![
            StreamChunk::Text {
                delta: text.to_string(),
            },
            StreamChunk::Usage {
                input_tokens,
                output_tokens,
            },
            StreamChunk::Stop {
                reason: "end_turn".to_string(),
            },
        ]
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkReceiver, LlmError> {
        self.requests.lock().await.push(request);
        let script = self.scripts.lock().await.pop_front().unwrap_or_else(|| {
            MockLlm::text_turn("=== PHASE SIGN-OFF: PASS ===", 10, 10)
        });
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for chunk in script {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_turn_accumulates_text_and_usage() {
        let mock = MockLlm::new(vec![vec![
            StreamChunk::Text { delta: "Hello ".into() },
            StreamChunk::Text { delta: "world".into() },
            StreamChunk::Usage {
                input_tokens: 100,
                output_tokens: 20,
            },
            StreamChunk::Stop {
                reason: "end_turn".into(),
            },
        ]]);
        let rx = mock
            .stream_turn(TurnRequest {
                system: "s".into(),
                messages: vec![ChatMessage::user("hi")],
                tools: vec![],
                model: "m".into(),
                max_tokens: 100,
            })
            .await
            .unwrap();
        let out = collect_turn(rx).await.unwrap();
        assert_eq!(out.text, "Hello world");
        assert_eq!(out.input_tokens, 100);
        assert_eq!(out.output_tokens, 20);
        assert_eq!(out.stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn collect_turn_flags_truncated_stream() {
        let mock = MockLlm::new(vec![vec![StreamChunk::Text { delta: "cut of".into() }]]);
        let rx = mock
            .stream_turn(TurnRequest {
                system: String::new(),
                messages: vec![],
                tools: vec![],
                model: "m".into(),
                max_tokens: 10,
            })
            .await
            .unwrap();
        assert!(matches!(
            collect_turn(rx).await,
            Err(LlmError::TruncatedStream)
        ));
    }

    #[tokio::test]
    async fn mock_records_requests_in_order() {
        let mock = MockLlm::new(vec![
            MockLlm::text_turn("one", 1, 1),
            MockLlm::text_turn("two", 1, 1),
        ]);
        for content in ["first", "second"] {
            let rx = mock
                .stream_turn(TurnRequest {
                    system: String::new(),
                    messages: vec![ChatMessage::user(content)],
                    tools: vec![],
                    model: "m".into(),
                    max_tokens: 10,
                })
                .await
                .unwrap();
            collect_turn(rx).await.unwrap();
        }
        assert_eq!(mock.call_count().await, 2);
        let reqs = mock.requests().await;
        assert_eq!(reqs[0].messages[0].content, "first");
        assert_eq!(reqs[1].messages[0].content, "second");
    }

    #[test]
    fn extract_json_object_handles_prose_and_nesting() {
        let text = "Sure, here is the verdict:\n```json\n{\"verdict\": \"PASS\", \"findings\": [{\"kind\": \"style\"}]}\n```\nDone.";
        let json = extract_json_object(text).unwrap();
        let parsed: Value = serde_json::from_str(json).unwrap();
        assert_eq!(parsed["verdict"], "PASS");
    }

    #[test]
    fn extract_json_object_handles_braces_in_strings() {
        let text = r#"{"msg": "look at {this}", "n": 1} trailing"#;
        let json = extract_json_object(text).unwrap();
        assert!(serde_json::from_str::<Value>(json).is_ok());
    }

    #[test]
    fn extract_json_object_none_without_object() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{unclosed").is_none());
    }

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::user("x").role, MsgRole::User);
        assert_eq!(ChatMessage::assistant("x").role, MsgRole::Assistant);
        let t = ChatMessage::tool_result("id1", "out");
        assert_eq!(t.role, MsgRole::Tool);
        assert_eq!(t.tool_use_id.as_deref(), Some("id1"));
    }
}
