//! OpenAI Chat Completions streaming client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{ChunkReceiver, KeyPool, LlmClient, MsgRole, StreamChunk, TurnRequest};
use crate::errors::LlmError;

pub struct OpenAiClient {
    http: reqwest::Client,
    pool: Arc<KeyPool>,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, pool: Arc<KeyPool>) -> Self {
        Self {
            http,
            pool,
            base_url: "https://api.openai.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(request: &TurnRequest) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        for msg in &request.messages {
            match msg.role {
                MsgRole::User => messages.push(json!({ "role": "user", "content": msg.content })),
                MsgRole::Assistant => {
                    let mut m = json!({ "role": "assistant", "content": msg.content });
                    if let (Some(id), Some(name)) = (&msg.tool_use_id, &msg.tool_name) {
                        m["tool_calls"] = json!([{
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": msg
                                    .tool_input
                                    .as_ref()
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            },
                        }]);
                    }
                    messages.push(m);
                }
                MsgRole::Tool => messages.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_use_id.clone().unwrap_or_default(),
                    "content": msg.content,
                })),
            }
        }

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

/// Incremental parser for the OpenAI SSE stream. Tool-call deltas are keyed
/// by index; ids are surfaced on the first delta that carries one.
#[derive(Debug, Default)]
pub(crate) struct OpenAiSse {
    tool_ids: HashMap<u64, String>,
    open_tools: Vec<String>,
    usage: Option<(u64, u64)>,
    finish_reason: Option<String>,
    done: bool,
}

impl OpenAiSse {
    pub(crate) fn on_data(&mut self, data: &str) -> Result<Vec<StreamChunk>, LlmError> {
        if data.trim() == "[DONE]" {
            let mut out = Vec::new();
            // Close any tool calls the finish chunk left open.
            for id in self.open_tools.drain(..) {
                out.push(StreamChunk::ToolUseStop { id });
            }
            let (input, output) = self.usage.unwrap_or((0, 0));
            out.push(StreamChunk::Usage {
                input_tokens: input,
                output_tokens: output,
            });
            out.push(StreamChunk::Stop {
                reason: self
                    .finish_reason
                    .clone()
                    .unwrap_or_else(|| "stop".to_string()),
            });
            self.done = true;
            return Ok(out);
        }

        let event: Value = serde_json::from_str(data)
            .map_err(|e| LlmError::MalformedEvent(format!("{}: {}", e, data)))?;

        if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
            let input = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.usage = Some((input, output));
        }

        let mut out = Vec::new();
        let Some(choice) = event.pointer("/choices/0") else {
            return Ok(out);
        };

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(match reason {
                "tool_calls" => "tool_use".to_string(),
                "length" => "max_tokens".to_string(),
                other => other.to_string(),
            });
        }

        let Some(delta) = choice.get("delta") else {
            return Ok(out);
        };

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                out.push(StreamChunk::Text {
                    delta: text.to_string(),
                });
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                    let name = call
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    self.tool_ids.insert(index, id.to_string());
                    self.open_tools.push(id.to_string());
                    out.push(StreamChunk::ToolUseStart {
                        id: id.to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(|v| v.as_str()) {
                    if !args.is_empty() {
                        if let Some(id) = self.tool_ids.get(&index) {
                            out.push(StreamChunk::ToolUseInputDelta {
                                id: id.clone(),
                                json: args.to_string(),
                            });
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkReceiver, LlmError> {
        let (key_idx, key) = self.pool.checkout()?;
        let body = Self::request_body(&request);

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(key)
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
            let mut parser = OpenAiSse::default();
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
                            if parser.done {
                                break 'outer;
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
