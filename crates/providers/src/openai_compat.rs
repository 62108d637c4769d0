//! OpenAI-compatible language model.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, Together AI, Fireworks AI
//! and any endpoint exposing a streaming `/chat/completions`.
//!
//! One call to [`LanguageModel::stream`] is one model step. The SSE body is
//! decoded by [`SseDecoder`] into start/delta/end events for text and
//! reasoning, tool-input-start and tool-call for function calls, and a final
//! finish event with usage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use corvid_core::error::ProviderError;
use corvid_core::provider::{
    AssistantContent, FinishReason, LanguageModel, ModelEvent, ModelMessage, ModelRequest, ModelStream,
    ToolDefinition, Usage, UserContent,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub struct OpenAiCompatModel {
    provider_id: String,
    model_id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Default endpoint for well-known provider ids.
    pub fn default_base_url(provider_id: &str) -> Option<&'static str> {
        match provider_id {
            "openai" => Some("https://api.openai.com/v1"),
            "openrouter" => Some("https://openrouter.ai/api/v1"),
            "ollama" => Some("http://localhost:11434/v1"),
            _ => None,
        }
    }

    fn body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model_id,
            "messages": to_api_messages(&request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(max) = request.max_output_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        for (k, v) in &request.options {
            body[k] = v.clone();
        }
        body
    }
}

/// Map a non-success response to a classified provider error.
pub fn classify_status(
    provider_id: &str,
    status: u16,
    headers: BTreeMap<String, String>,
    body: &str,
) -> ProviderError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string());
    match status {
        401 | 403 => ProviderError::AuthenticationFailed {
            provider_id: provider_id.to_string(),
            message,
        },
        _ => ProviderError::api(status, message, headers),
    }
}

fn lowercase_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_lowercase(), v.to_str().ok()?.to_string())))
        .collect()
}

#[async_trait]
impl LanguageModel for OpenAiCompatModel {
    fn id(&self) -> &str {
        &self.model_id
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.provider_id, model = %self.model_id, "Sending streaming request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&self.body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let headers = lowercase_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %self.provider_id, status, "Provider returned error");
            return Err(classify_status(&self.provider_id, status, headers, &body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_id = self.provider_id.clone();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut decoder = SseDecoder::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(end) = buffer.find('\n') {
                    let line: String = buffer.drain(..=end).collect();
                    let line = line.trim_end_matches(['\r', '\n']);
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data == "[DONE]" {
                        for item in decoder.finish() {
                            let _ = tx.send(item).await;
                        }
                        return;
                    }
                    match serde_json::from_str::<StreamResponse>(data) {
                        Ok(parsed) => {
                            for event in decoder.push(parsed) {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            trace!(provider = %provider_id, error = %e, "Ignoring unparseable SSE chunk");
                        }
                    }
                }
            }

            for item in decoder.finish() {
                let _ = tx.send(item).await;
            }
        });

        Ok(rx)
    }
}

// --- Request shaping ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: &'static str,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: &'static str,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_api_messages(messages: &[ModelMessage]) -> Vec<ApiMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            ModelMessage::System { content } => out.push(ApiMessage {
                role: "system",
                content: Some(serde_json::json!(content)),
                tool_calls: None,
                tool_call_id: None,
            }),
            ModelMessage::User { content } => {
                let blocks: Vec<serde_json::Value> = content
                    .iter()
                    .map(|c| match c {
                        UserContent::Text { text } => serde_json::json!({"type": "text", "text": text}),
                        UserContent::File { url, .. } => {
                            serde_json::json!({"type": "image_url", "image_url": {"url": url}})
                        }
                    })
                    .collect();
                out.push(ApiMessage {
                    role: "user",
                    content: Some(serde_json::Value::Array(blocks)),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            ModelMessage::Assistant { content } => {
                let text: String = content
                    .iter()
                    .filter_map(|c| match c {
                        AssistantContent::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                let calls: Vec<ApiToolCall> = content
                    .iter()
                    .filter_map(|c| match c {
                        AssistantContent::ToolCall {
                            call_id,
                            tool_name,
                            input,
                        } => Some(ApiToolCall {
                            id: call_id.clone(),
                            r#type: "function",
                            function: ApiFunction {
                                name: tool_name.clone(),
                                arguments: input.to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                out.push(ApiMessage {
                    role: "assistant",
                    content: (!text.is_empty()).then(|| serde_json::json!(text)),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_call_id: None,
                });
            }
            ModelMessage::Tool { content } => {
                for result in content {
                    out.push(ApiMessage {
                        role: "tool",
                        content: Some(serde_json::json!(result.output)),
                        tool_calls: None,
                        tool_call_id: Some(result.call_id.clone()),
                    });
                }
            }
        }
    }
    out
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function",
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokenDetails>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokenDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokenDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionTokenDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
    announced: bool,
}

/// Turns parsed SSE chunks into model events.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    text_open: bool,
    reasoning_open: bool,
    tools: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<String>,
    usage: Usage,
    finished: bool,
}

const TEXT_ID: &str = "text-0";
const REASONING_ID: &str = "reasoning-0";

impl SseDecoder {
    fn close_reasoning(&mut self, out: &mut Vec<ModelEvent>) {
        if self.reasoning_open {
            self.reasoning_open = false;
            out.push(ModelEvent::ReasoningEnd { id: REASONING_ID.into() });
        }
    }

    fn close_text(&mut self, out: &mut Vec<ModelEvent>) {
        if self.text_open {
            self.text_open = false;
            out.push(ModelEvent::TextEnd { id: TEXT_ID.into() });
        }
    }

    fn push(&mut self, chunk: StreamResponse) -> Vec<ModelEvent> {
        let mut out = Vec::new();

        if let Some(usage) = chunk.usage {
            let cached = usage.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0);
            self.usage = Usage {
                input_tokens: usage.prompt_tokens.saturating_sub(cached),
                output_tokens: usage.completion_tokens,
                reasoning_tokens: usage.completion_tokens_details.map(|d| d.reasoning_tokens).unwrap_or(0),
                cached_input_tokens: cached,
                cache_write_tokens: 0,
            };
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                if !self.reasoning_open {
                    self.reasoning_open = true;
                    out.push(ModelEvent::ReasoningStart { id: REASONING_ID.into() });
                }
                out.push(ModelEvent::ReasoningDelta {
                    id: REASONING_ID.into(),
                    text: reasoning,
                });
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                self.close_reasoning(&mut out);
                if !self.text_open {
                    self.text_open = true;
                    out.push(ModelEvent::TextStart { id: TEXT_ID.into() });
                }
                out.push(ModelEvent::TextDelta {
                    id: TEXT_ID.into(),
                    text: content,
                });
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let acc = self.tools.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    acc.id = id;
                }
                if let Some(func) = tc.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                        if acc.announced && !args.is_empty() {
                            out.push(ModelEvent::ToolInputDelta {
                                id: acc.id.clone(),
                                delta: args,
                            });
                        }
                    }
                }
                if !acc.announced && !acc.id.is_empty() && !acc.name.is_empty() {
                    acc.announced = true;
                    out.push(ModelEvent::ToolInputStart {
                        id: acc.id.clone(),
                        tool_name: acc.name.clone(),
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        out
    }

    /// Close open blocks, emit completed tool calls and the finish event.
    fn finish(&mut self) -> Vec<Result<ModelEvent, ProviderError>> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        self.close_reasoning(&mut events);
        self.close_text(&mut events);
        for acc in std::mem::take(&mut self.tools).into_values() {
            if !acc.announced {
                events.push(ModelEvent::ToolInputStart {
                    id: acc.id.clone(),
                    tool_name: acc.name.clone(),
                });
            }
            let input = if acc.arguments.trim().is_empty() { "{}".to_string() } else { acc.arguments };
            events.push(ModelEvent::ToolCall {
                id: acc.id,
                tool_name: acc.name,
                input,
            });
        }

        let reason = match self.finish_reason.as_deref() {
            Some("stop") | None => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(_) => FinishReason::Other,
        };
        let mut out: Vec<Result<ModelEvent, ProviderError>> = events.into_iter().map(Ok).collect();
        if reason == FinishReason::Length {
            out.push(Err(ProviderError::OutputLength));
        } else {
            out.push(Ok(ModelEvent::Finish {
                reason,
                usage: self.usage,
            }));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::provider::ToolResultContent;

    fn feed(decoder: &mut SseDecoder, data: &str) -> Vec<ModelEvent> {
        decoder.push(serde_json::from_str(data).unwrap())
    }

    #[test]
    fn well_known_base_urls() {
        assert!(OpenAiCompatModel::default_base_url("openrouter").unwrap().contains("openrouter.ai"));
        assert!(OpenAiCompatModel::default_base_url("custom").is_none());
    }

    #[test]
    fn text_deltas_open_and_close_a_block() {
        let mut d = SseDecoder::default();
        let first = feed(&mut d, r#"{"choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(
            first,
            vec![
                ModelEvent::TextStart { id: TEXT_ID.into() },
                ModelEvent::TextDelta { id: TEXT_ID.into(), text: "Hi".into() }
            ]
        );
        feed(&mut d, r#"{"choices":[{"delta":{"content":" there"},"finish_reason":"stop"}]}"#);
        feed(
            &mut d,
            r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":7,"prompt_tokens_details":{"cached_tokens":100}}}"#,
        );
        let tail: Vec<ModelEvent> = d.finish().into_iter().map(Result::unwrap).collect();
        assert_eq!(tail[0], ModelEvent::TextEnd { id: TEXT_ID.into() });
        match &tail[1] {
            ModelEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                assert_eq!(usage.input_tokens, 20);
                assert_eq!(usage.cached_input_tokens, 100);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("Expected finish, got {other:?}"),
        }
        assert!(d.finish().is_empty());
    }

    #[test]
    fn reasoning_closes_before_text() {
        let mut d = SseDecoder::default();
        let events = feed(&mut d, r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#);
        assert_eq!(events[0], ModelEvent::ReasoningStart { id: REASONING_ID.into() });
        let events = feed(&mut d, r#"{"choices":[{"delta":{"content":"ok"}}]}"#);
        assert_eq!(events[0], ModelEvent::ReasoningEnd { id: REASONING_ID.into() });
        assert_eq!(events[1], ModelEvent::TextStart { id: TEXT_ID.into() });
    }

    #[test]
    fn tool_call_deltas_assemble() {
        let mut d = SseDecoder::default();
        let start = feed(
            &mut d,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"bash","arguments":""}}]}}]}"#,
        );
        assert_eq!(
            start,
            vec![ModelEvent::ToolInputStart { id: "call_a".into(), tool_name: "bash".into() }]
        );
        feed(
            &mut d,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\":"}}]}}]}"#,
        );
        feed(
            &mut d,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"ls\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        );
        let tail: Vec<ModelEvent> = d.finish().into_iter().map(Result::unwrap).collect();
        assert_eq!(
            tail[0],
            ModelEvent::ToolCall {
                id: "call_a".into(),
                tool_name: "bash".into(),
                input: r#"{"command":"ls"}"#.into()
            }
        );
        assert!(matches!(tail[1], ModelEvent::Finish { reason: FinishReason::ToolCalls, .. }));
    }

    #[test]
    fn length_finish_becomes_output_length_error() {
        let mut d = SseDecoder::default();
        feed(&mut d, r#"{"choices":[{"delta":{"content":"cut"},"finish_reason":"length"}]}"#);
        let tail = d.finish();
        assert!(matches!(tail.last(), Some(Err(ProviderError::OutputLength))));
    }

    #[test]
    fn status_classification() {
        let auth = classify_status("openai", 401, BTreeMap::new(), r#"{"error":{"message":"bad key"}}"#);
        match auth {
            ProviderError::AuthenticationFailed { provider_id, message } => {
                assert_eq!(provider_id, "openai");
                assert_eq!(message, "bad key");
            }
            other => panic!("Expected auth error, got {other}"),
        }

        let headers = BTreeMap::from([("retry-after".to_string(), "3".to_string())]);
        let limited = classify_status("openai", 429, headers, "slow down");
        assert!(limited.is_retryable());
        assert_eq!(limited.headers().unwrap()["retry-after"], "3");

        assert!(!classify_status("openai", 400, BTreeMap::new(), "bad").is_retryable());
    }

    #[test]
    fn messages_convert_to_api_shape() {
        let messages = vec![
            ModelMessage::system("be brief"),
            ModelMessage::user_text("list files"),
            ModelMessage::Assistant {
                content: vec![
                    AssistantContent::Reasoning { text: "thinking".into() },
                    AssistantContent::ToolCall {
                        call_id: "call_1".into(),
                        tool_name: "bash".into(),
                        input: serde_json::json!({"command": "ls"}),
                    },
                ],
            },
            ModelMessage::Tool {
                content: vec![ToolResultContent {
                    call_id: "call_1".into(),
                    tool_name: "bash".into(),
                    output: "a.txt".into(),
                    is_error: false,
                }],
            },
        ];
        let api = to_api_messages(&messages);
        assert_eq!(api.len(), 4);
        assert_eq!(api[1].content.as_ref().unwrap()[0]["text"], "list files");
        assert!(api[2].content.is_none());
        assert_eq!(api[2].tool_calls.as_ref().unwrap()[0].function.arguments, r#"{"command":"ls"}"#);
        assert_eq!(api[3].role, "tool");
        assert_eq!(api[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn request_body_carries_options() {
        let model = OpenAiCompatModel::new("openai", "gpt-4o", "https://api.openai.com/v1/", None).unwrap();
        assert_eq!(model.base_url, "https://api.openai.com/v1");
        let mut request = ModelRequest {
            temperature: Some(0.2),
            max_output_tokens: Some(1024),
            ..Default::default()
        };
        request.options.insert("reasoning_effort".into(), serde_json::json!("high"));
        let body = model.body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["reasoning_effort"], "high");
        assert!(body.get("tools").is_none());
    }
}
