//! The multi-step generation loop.
//!
//! A [`Generation`] drives a model through as many steps as the conversation
//! needs: it opens a step's stream (retrying transient failures), forwards
//! the model's events, runs tool calls concurrently as they arrive, records
//! the step into the request history, and starts the next step while the
//! model keeps calling tools. Everything it observes comes out of
//! [`EventSource::next_event`] as a [`GenerationEvent`], in order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use corvid_core::agent::AgentInfo;
use corvid_core::error::{ProviderError, ToolError};
use corvid_core::provider::{
    AssistantContent, FinishReason, ModelEvent, ModelMessage, ModelRequest, ModelStream, ResolvedModel,
    ToolResultContent, Usage,
};
use corvid_core::tool::{MetadataUpdate, SubagentRunner, ToolContext, ToolOutput};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::ResolvedTools;
use crate::retry::RetryPolicy;
use crate::stream_event::GenerationEvent;

/// Where the stream processor pulls events from.
#[async_trait]
pub trait EventSource: Send {
    /// The next event, or `None` once the generation is over.
    async fn next_event(&mut self) -> Option<GenerationEvent>;

    /// Attribute tool calls from now on to `message_id` and append `messages`
    /// to the history before the next step is sent.
    fn rotate(&mut self, message_id: &str, messages: Vec<ModelMessage>);

    /// Start no further steps.
    fn stop(&mut self);
}

/// Everything one generation needs.
pub struct GenerationRequest {
    pub session_id: String,
    /// The assistant message tool calls are attributed to.
    pub message_id: String,
    pub model: ResolvedModel,
    pub agent: AgentInfo,
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: ResolvedTools,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub options: serde_json::Map<String, serde_json::Value>,
    pub max_steps: usize,
    pub retry: RetryPolicy,
    pub subagents: Option<Arc<dyn SubagentRunner>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    BeforeStep,
    OpenStep,
    Streaming,
    Done,
}

enum ToolEvent {
    Metadata {
        call_id: String,
        update: MetadataUpdate,
    },
    Done {
        call_id: String,
        tool: String,
        result: Result<ToolOutput, ToolError>,
    },
}

enum Next {
    Aborted,
    Tool(ToolEvent),
    Model(Option<Result<ModelEvent, ProviderError>>),
}

/// What one step said, for the history of the next.
#[derive(Default)]
struct StepRecord {
    text: String,
    calls: Vec<(String, String, serde_json::Value)>,
    results: HashMap<String, ToolResultContent>,
    started_inputs: HashSet<String>,
    finish: Option<(Usage, FinishReason)>,
    stream_done: bool,
}

pub struct Generation {
    request: GenerationRequest,
    abort: CancellationToken,
    pending: VecDeque<GenerationEvent>,
    phase: Phase,
    step: usize,
    stopped: bool,
    stream: Option<ModelStream>,
    record: StepRecord,
    tool_tx: mpsc::UnboundedSender<ToolEvent>,
    tool_rx: mpsc::UnboundedReceiver<ToolEvent>,
    tasks: JoinSet<()>,
    outstanding: usize,
}

impl Generation {
    pub fn new(request: GenerationRequest, abort: CancellationToken) -> Self {
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        Self {
            request,
            abort,
            pending: VecDeque::new(),
            phase: Phase::NotStarted,
            step: 0,
            stopped: false,
            stream: None,
            record: StepRecord::default(),
            tool_tx,
            tool_rx,
            tasks: JoinSet::new(),
            outstanding: 0,
        }
    }

    /// The conversation as it stands, without system messages.
    pub fn history(&self) -> &[ModelMessage] {
        &self.request.messages
    }

    fn model_request(&self) -> ModelRequest {
        let mut messages: Vec<ModelMessage> = self.request.system.iter().map(ModelMessage::system).collect();
        messages.extend(self.request.messages.iter().cloned());
        // The last allowed step gets no tools so the model has to answer.
        let tools = if self.step < self.request.max_steps {
            self.request.tools.definitions()
        } else {
            Vec::new()
        };
        ModelRequest {
            model: self.request.model.info.id.clone(),
            messages,
            tools,
            temperature: self.request.temperature,
            top_p: self.request.top_p,
            max_output_tokens: (self.request.model.info.limit.output > 0)
                .then_some(self.request.model.info.limit.output.min(crate::compaction::OUTPUT_TOKEN_MAX)),
            options: self.request.options.clone(),
        }
    }

    /// Open the step's stream, waiting out retryable failures.
    async fn open(&mut self) -> Result<ModelStream, ProviderError> {
        let started = Utc::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = self.model_request();
            let language = self.request.model.language.clone();
            let result = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(ProviderError::Aborted),
                result = language.stream(request) => result,
            };
            let error = match result {
                Ok(stream) => return Ok(stream),
                Err(error) => error,
            };
            if !error.is_retryable() || !self.request.retry.allows(attempt) {
                return Err(error);
            }
            let Some(delay) = self.request.retry.bounded_delay(&error, attempt, started, Utc::now()) else {
                warn!(session_id = %self.request.session_id, attempt, error = %error, "Retry budget exhausted");
                return Err(error);
            };
            warn!(
                session_id = %self.request.session_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Model request failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(ProviderError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish_with_error(&mut self, error: ProviderError) {
        self.tasks.abort_all();
        self.stream = None;
        self.pending.push_back(GenerationEvent::Error(error));
        self.phase = Phase::Done;
    }

    fn spawn_tool(&mut self, call_id: String, tool: String, input: serde_json::Value) {
        let metadata_tx = self.tool_tx.clone();
        let metadata_call = call_id.clone();
        let mut ctx = ToolContext::new(
            &self.request.session_id,
            &self.request.message_id,
            &call_id,
            &self.request.agent.name,
            self.abort.child_token(),
        )
        .with_permissions(self.request.agent.permission.clone())
        .with_metadata_sink(Arc::new(move |update| {
            let _ = metadata_tx.send(ToolEvent::Metadata {
                call_id: metadata_call.clone(),
                update,
            });
        }));
        if let Some(runner) = &self.request.subagents {
            ctx = ctx.with_subagents(runner.clone());
        }

        let tools = self.request.tools.clone();
        let done_tx = self.tool_tx.clone();
        self.outstanding += 1;
        self.tasks.spawn(async move {
            let result = tools.invoke(&tool, input, &ctx).await;
            let _ = done_tx.send(ToolEvent::Done { call_id, tool, result });
        });
    }

    fn on_model_event(&mut self, event: ModelEvent) {
        let out = match event {
            ModelEvent::TextStart { id } => GenerationEvent::TextStart { id },
            ModelEvent::TextDelta { id, text } => {
                self.record.text.push_str(&text);
                GenerationEvent::TextDelta { id, text }
            }
            ModelEvent::TextEnd { id } => GenerationEvent::TextEnd { id },
            ModelEvent::ReasoningStart { id } => GenerationEvent::ReasoningStart { id },
            ModelEvent::ReasoningDelta { id, text } => GenerationEvent::ReasoningDelta { id, text },
            ModelEvent::ReasoningEnd { id } => GenerationEvent::ReasoningEnd { id },
            ModelEvent::ToolInputStart { id, tool_name } => {
                self.record.started_inputs.insert(id.clone());
                GenerationEvent::ToolInputStart {
                    call_id: id,
                    tool: tool_name,
                }
            }
            ModelEvent::ToolInputDelta { .. } => return,
            ModelEvent::ToolCall { id, tool_name, input } => {
                if self.record.started_inputs.insert(id.clone()) {
                    self.pending.push_back(GenerationEvent::ToolInputStart {
                        call_id: id.clone(),
                        tool: tool_name.clone(),
                    });
                }
                let (tool, input) = self.request.tools.repair(&tool_name, &input);
                debug!(call_id = %id, tool = %tool, "Tool call");
                self.record.calls.push((id.clone(), tool.clone(), input.clone()));
                self.pending.push_back(GenerationEvent::ToolCall {
                    call_id: id.clone(),
                    tool: tool.clone(),
                    input: input.clone(),
                });
                self.spawn_tool(id, tool, input);
                return;
            }
            ModelEvent::Finish { reason, usage } => {
                self.record.finish = Some((usage, reason));
                self.record.stream_done = true;
                self.stream = None;
                return;
            }
        };
        self.pending.push_back(out);
    }

    fn on_tool_event(&mut self, event: ToolEvent) {
        match event {
            ToolEvent::Metadata { call_id, update } => self.pending.push_back(GenerationEvent::ToolMetadata {
                call_id,
                title: update.title,
                metadata: update.metadata,
            }),
            ToolEvent::Done { call_id, tool, result } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                match result {
                    Ok(output) => {
                        self.record.results.insert(
                            call_id.clone(),
                            ToolResultContent {
                                call_id: call_id.clone(),
                                tool_name: tool,
                                output: output.output.clone(),
                                is_error: false,
                            },
                        );
                        self.pending.push_back(GenerationEvent::ToolResult { call_id, output });
                    }
                    Err(error) => {
                        warn!(call_id = %call_id, tool = %tool, error = %error, "Tool failed");
                        let metadata = match &error {
                            ToolError::PermissionRejected { metadata, .. } => Some(metadata.clone()),
                            _ => None,
                        };
                        self.record.results.insert(
                            call_id.clone(),
                            ToolResultContent {
                                call_id: call_id.clone(),
                                tool_name: tool,
                                output: error.to_string(),
                                is_error: true,
                            },
                        );
                        self.pending.push_back(GenerationEvent::ToolError {
                            call_id,
                            error: error.to_string(),
                            rejected: error.is_rejection(),
                            metadata,
                        });
                    }
                }
            }
        }
    }

    /// Close the step: append it to the history and decide whether to loop.
    fn end_step(&mut self) {
        let record = std::mem::take(&mut self.record);
        let (usage, finish_reason) = record.finish.unwrap_or((Usage::default(), FinishReason::Other));
        let had_calls = !record.calls.is_empty();

        let mut content = Vec::new();
        if !record.text.is_empty() {
            content.push(AssistantContent::Text { text: record.text });
        }
        let mut results = Vec::new();
        let mut results_by_id = record.results;
        for (call_id, tool_name, input) in record.calls {
            if let Some(result) = results_by_id.remove(&call_id) {
                results.push(result);
            }
            content.push(AssistantContent::ToolCall {
                call_id,
                tool_name,
                input,
            });
        }
        if !content.is_empty() {
            self.request.messages.push(ModelMessage::Assistant { content });
        }
        if !results.is_empty() {
            self.request.messages.push(ModelMessage::Tool { content: results });
        }

        info!(
            session_id = %self.request.session_id,
            step = self.step,
            finish = finish_reason.as_str(),
            "Step finished"
        );
        self.pending.push_back(GenerationEvent::FinishStep { usage, finish_reason });
        if had_calls && !self.stopped && self.step < self.request.max_steps {
            self.phase = Phase::BeforeStep;
        } else {
            self.pending.push_back(GenerationEvent::Finish);
            self.phase = Phase::Done;
        }
    }

    async fn pump(&mut self) {
        if self.record.stream_done && self.outstanding == 0 {
            self.end_step();
            return;
        }
        let stream = self.stream.as_mut();
        let stream_live = stream.is_some() && !self.record.stream_done;
        let next = tokio::select! {
            biased;
            _ = self.abort.cancelled() => Next::Aborted,
            Some(event) = self.tool_rx.recv(), if self.outstanding > 0 => Next::Tool(event),
            item = async {
                match stream {
                    Some(stream) => stream.recv().await,
                    None => std::future::pending().await,
                }
            }, if stream_live => Next::Model(item),
        };
        match next {
            Next::Aborted => {
                info!(session_id = %self.request.session_id, "Generation aborted");
                self.finish_with_error(ProviderError::Aborted);
            }
            Next::Tool(event) => self.on_tool_event(event),
            Next::Model(Some(Ok(event))) => self.on_model_event(event),
            Next::Model(Some(Err(error))) => self.finish_with_error(error),
            Next::Model(None) => {
                self.finish_with_error(ProviderError::StreamInterrupted("stream closed before the step finished".into()))
            }
        }
    }
}

#[async_trait]
impl EventSource for Generation {
    async fn next_event(&mut self) -> Option<GenerationEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.phase {
                Phase::NotStarted => {
                    self.pending.push_back(GenerationEvent::Start);
                    self.phase = Phase::BeforeStep;
                }
                Phase::BeforeStep => {
                    self.step += 1;
                    if self.step > 1 {
                        self.pending.push_back(GenerationEvent::PrepareStep { step: self.step });
                    }
                    self.phase = Phase::OpenStep;
                }
                Phase::OpenStep => {
                    if self.stopped {
                        self.pending.push_back(GenerationEvent::Finish);
                        self.phase = Phase::Done;
                        continue;
                    }
                    match self.open().await {
                        Ok(stream) => {
                            debug!(session_id = %self.request.session_id, step = self.step, "Step opened");
                            self.stream = Some(stream);
                            self.pending.push_back(GenerationEvent::StartStep);
                            self.phase = Phase::Streaming;
                        }
                        Err(error) => self.finish_with_error(error),
                    }
                }
                Phase::Streaming => self.pump().await,
                Phase::Done => return None,
            }
        }
    }

    fn rotate(&mut self, message_id: &str, messages: Vec<ModelMessage>) {
        self.request.message_id = message_id.to_string();
        self.request.messages.extend(messages);
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}
