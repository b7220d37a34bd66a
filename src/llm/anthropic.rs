//! Anthropic Messages API streaming client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{ChunkReceiver, KeyPool, LlmClient, MsgRole, StreamChunk, TurnRequest};
use crate::errors::LlmError;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: reqwest::Client,
    pool: Arc<KeyPool>,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, pool: Arc<KeyPool>) -> Self {
        Self {
            http,
            pool,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(request: &TurnRequest) -> Value {
        // The Messages API wants strictly alternating roles; adjacent
        // same-role turns are merged into one block list.
        let mut messages: Vec<(&str, Vec<Value>)> = Vec::new();
        let mut push_blocks = |role: &'static str, blocks: Vec<Value>| {
            match messages.last_mut() {
                Some((last_role, existing)) if *last_role == role => existing.extend(blocks),
                _ => messages.push((role, blocks)),
            }
        };
        for msg in &request.messages {
            match msg.role {
                MsgRole::User => {
                    push_blocks("user", vec![json!({ "type": "text", "text": msg.content })]);
                }
                MsgRole::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": msg.content }));
                    }
                    if let (Some(id), Some(name)) = (&msg.tool_use_id, &msg.tool_name) {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": msg.tool_input.clone().unwrap_or_else(|| json!({})),
                        }));
                    }
                    push_blocks("assistant", blocks);
                }
                MsgRole::Tool => {
                    push_blocks(
                        "user",
                        vec![json!({
                            "type": "tool_result",
                            "tool_use_id": msg.tool_use_id.clone().unwrap_or_default(),
                            "content": msg.content,
                        })],
                    );
                }
            }
        }
        let messages: Vec<Value> = messages
            .into_iter()
            .map(|(role, blocks)| json!({ "role": role, "content": blocks }))
            .collect();

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

/// Incremental parser for the Anthropic SSE event stream. Feed each `data:`
/// payload; chunks come out in provider order.
#[derive(Debug, Default)]
pub(crate) struct AnthropicSse {
    block_ids: HashMap<u64, String>,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<String>,
}

impl AnthropicSse {
    pub(crate) fn on_data(&mut self, data: &str) -> Result<Vec<StreamChunk>, LlmError> {
        let event: Value = serde_json::from_str(data)
            .map_err(|e| LlmError::MalformedEvent(format!("{}: {}", e, data)))?;
        let mut out = Vec::new();
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if event.pointer("/content_block/type").and_then(|t| t.as_str())
                    == Some("tool_use")
                {
                    let id = event
                        .pointer("/content_block/id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = event
                        .pointer("/content_block/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.block_ids.insert(index, id.clone());
                    out.push(StreamChunk::ToolUseStart { id, name });
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                match event.pointer("/delta/type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = event.pointer("/delta/text").and_then(|v| v.as_str()) {
                            out.push(StreamChunk::Text {
                                delta: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(id) = self.block_ids.get(&index) {
                            let partial = event
                                .pointer("/delta/partial_json")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            out.push(StreamChunk::ToolUseInputDelta {
                                id: id.clone(),
                                json: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(id) = self.block_ids.remove(&index) {
                    out.push(StreamChunk::ToolUseStop { id });
                }
            }
            Some("message_delta") => {
                if let Some(tokens) = event
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.output_tokens = tokens;
                }
                if let Some(reason) = event
                    .pointer("/delta/stop_reason")
                    .and_then(|v| v.as_str())
                {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            Some("message_stop") => {
                out.push(StreamChunk::Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                });
                out.push(StreamChunk::Stop {
                    reason: self
                        .stop_reason
                        .clone()
                        .unwrap_or_else(|| "end_turn".to_string()),
                });
            }
            Some("error") => {
                let message = event
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown stream error");
                return Err(LlmError::Api {
                    status: 500,
                    message: message.to_string(),
                });
            }
            // ping and future event types are ignorable
            _ => {}
        }
        Ok(out)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkReceiver, LlmError> {
        let (key_idx, key) = self.pool.checkout()?;
        let body = Self::request_body(&request);

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let err = match status.as_u16() {
                401 | 403 => LlmError::Auth,
                429 => LlmError::Quota,
                code => LlmError::Api {
                    status: code,
                    message,
                },
            };
            if err.rotates_key() {
                self.pool.report_failure(key_idx);
            }
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut parser = AnthropicSse::default();
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Transport(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    match parser.on_data(data) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            break 'outer;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use crate::tools::tool_specs;

    #[test]
    fn request_body_maps_roles_and_tools() {
        let req = TurnRequest {
            system: "be terse".into(),
            messages: vec![
                ChatMessage::user("build it"),
                ChatMessage {
                    role: MsgRole::Assistant,
                    content: "on it".into(),
                    tool_use_id: Some("tu_1".into()),
                    tool_name: Some("write_file".into()),
                    tool_input: Some(json!({"path": "a.txt", "content": "x"})),
                },
                ChatMessage::tool_result("tu_1", "{\"bytes_written\": 1}"),
            ],
            tools: tool_specs(),
            model: "claude-sonnet-4-5".into(),
            max_tokens: 4096,
        };
        let body = AnthropicClient::request_body(&req);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["content"][1]["type"], "tool_use");
        assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(body["messages"][2]["content"][0]["tool_use_id"], "tu_1");
        assert_eq!(body["tools"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn request_body_merges_adjacent_user_turns() {
        let req = TurnRequest {
            system: String::new(),
            messages: vec![
                ChatMessage::user("phase instruction"),
                ChatMessage::user("[User interjection] go faster"),
            ],
            tools: vec![],
            model: "claude-sonnet-4-5".into(),
            max_tokens: 100,
        };
        let body = AnthropicClient::request_body(&req);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn sse_text_stream() {
        let mut p = AnthropicSse::default();
        let mut chunks = Vec::new();
        for data in [
            r#"{"type":"message_start","message":{"usage":{"input_tokens":25}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            r#"{"type":"message_stop"}"#,
        ] {
            chunks.extend(p.on_data(data).unwrap());
        }
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text { delta: "Hel".into() },
                StreamChunk::Text { delta: "lo".into() },
                StreamChunk::Usage {
                    input_tokens: 25,
                    output_tokens: 7
                },
                StreamChunk::Stop {
                    reason: "end_turn".into()
                },
            ]
        );
    }

    #[test]
    fn sse_tool_use_stream() {
        let mut p = AnthropicSse::default();
        let mut chunks = Vec::new();
        for data in [
            r#"{"type":"message_start","message":{"usage":{"input_tokens":10}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_9","name":"write_file"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"a.txt\"}"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}"#,
            r#"{"type":"message_stop"}"#,
        ] {
            chunks.extend(p.on_data(data).unwrap());
        }
        assert_eq!(
            chunks[0],
            StreamChunk::ToolUseStart {
                id: "tu_9".into(),
                name: "write_file".into()
            }
        );
        assert!(matches!(&chunks[1], StreamChunk::ToolUseInputDelta { id, .. } if id == "tu_9"));
        assert_eq!(chunks[3], StreamChunk::ToolUseStop { id: "tu_9".into() });
        assert_eq!(
            chunks.last().unwrap(),
            &StreamChunk::Stop {
                reason: "tool_use".into()
            }
        );
    }

    #[test]
    fn sse_error_event_surfaces() {
        let mut p = AnthropicSse::default();
        let err = p
            .on_data(r#"{"type":"error","error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn sse_ping_ignored() {
        let mut p = AnthropicSse::default();
        assert!(p.on_data(r#"{"type":"ping"}"#).unwrap().is_empty());
    }

    #[test]
    fn sse_garbage_is_malformed() {
        let mut p = AnthropicSse::default();
        assert!(matches!(
            p.on_data("not json"),
            Err(LlmError::MalformedEvent(_))
        ));
    }
}
