//! Turns generation events into persisted message and part records.
//!
//! The processor owns exactly one assistant message at a time. Every event
//! that changes visible state is written through the store immediately, so
//! observers see partial text, running tools and step boundaries as they
//! happen. Whatever way the event stream ends, [`StreamProcessor::process`]
//! returns a finished message whose tool parts are all terminal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use corvid_core::error::{Error, ProviderError, ToolError};
use corvid_core::event::BusEvent;
use corvid_core::message::{
    AssistantMessage, MessageError, MessageInfo, Part, PartKind, PartTime, PatchPart, ReasoningPart, StepFinishPart,
    StepStartPart, TextPart, ToolPart, ToolState, ToolTime, WithParts,
};
use corvid_core::provider::{FinishReason, ModelCost, Usage};
use corvid_core::snapshot::Snapshot;
use corvid_core::tool::ToolOutput;
use tracing::{debug, info, warn};

use crate::generation::EventSource;
use crate::lock::PendingTurns;
use crate::replay;
use crate::store::SessionStore;
use crate::stream_event::GenerationEvent;
use crate::usage::{step_cost, step_tokens};

const ABORTED_TOOL: &str = "Tool execution aborted";

/// Map a provider failure onto the error recorded on the message.
pub fn classify(error: &ProviderError) -> MessageError {
    match error {
        ProviderError::Aborted => MessageError::Aborted {
            message: "The operation was aborted".into(),
        },
        ProviderError::OutputLength => MessageError::OutputLength,
        ProviderError::AuthenticationFailed { provider_id, message } => MessageError::Auth {
            provider_id: provider_id.clone(),
            message: message.clone(),
        },
        ProviderError::ApiError {
            status_code,
            message,
            retryable,
            ..
        } => MessageError::Api {
            message: message.clone(),
            status_code: *status_code,
            retryable: *retryable,
        },
        ProviderError::StreamInterrupted(_) | ProviderError::Timeout(_) | ProviderError::Network(_) => {
            MessageError::Api {
                message: error.to_string(),
                status_code: None,
                retryable: true,
            }
        }
        ProviderError::ModelNotFound { .. } | ProviderError::NotConfigured(_) => MessageError::Unknown {
            message: error.to_string(),
        },
    }
}

/// Like [`classify`] for any engine error surfacing from the loop.
pub fn classify_error(error: &Error) -> MessageError {
    match error {
        Error::Provider(e) => classify(e),
        Error::Tool(ToolError::Aborted) => classify(&ProviderError::Aborted),
        other => MessageError::Unknown {
            message: other.to_string(),
        },
    }
}

pub struct StreamProcessor {
    store: SessionStore,
    snapshot: Arc<dyn Snapshot>,
    cost: ModelCost,
    message: AssistantMessage,
    text: Option<Part>,
    reasoning: HashMap<String, Part>,
    tools: HashMap<String, Part>,
    should_stop: bool,
    snapshot_hash: Option<String>,
    error_published: bool,
}

impl StreamProcessor {
    /// `message` must already be persisted.
    pub fn new(store: SessionStore, snapshot: Arc<dyn Snapshot>, cost: ModelCost, message: AssistantMessage) -> Self {
        Self {
            store,
            snapshot,
            cost,
            message,
            text: None,
            reasoning: HashMap::new(),
            tools: HashMap::new(),
            should_stop: false,
            snapshot_hash: None,
            error_published: false,
        }
    }

    pub fn message(&self) -> &AssistantMessage {
        &self.message
    }

    /// Consume `source` to the end and return the finished message.
    ///
    /// `pending` supplies user turns queued while this generation runs; they
    /// are spliced in before the next step.
    pub async fn process(
        mut self,
        source: &mut dyn EventSource,
        pending: Option<&dyn PendingTurns>,
    ) -> Result<WithParts, Error> {
        if let Err(error) = self.consume(source, pending).await {
            warn!(session_id = %self.message.session_id, error = %error, "Generation failed");
            self.fail(classify_error(&error));
        }
        self.finalize().await
    }

    async fn consume(&mut self, source: &mut dyn EventSource, pending: Option<&dyn PendingTurns>) -> Result<(), Error> {
        while let Some(event) = source.next_event().await {
            debug!(session_id = %self.message.session_id, event = event.kind(), "Generation event");
            match event {
                GenerationEvent::Start => {}
                GenerationEvent::PrepareStep { step } => {
                    if self.should_stop {
                        info!(session_id = %self.message.session_id, step, "Stopping after rejected tool call");
                        source.stop();
                        continue;
                    }
                    let queued = pending.map(|p| p.take()).unwrap_or_default();
                    if !queued.is_empty() {
                        self.splice(source, queued).await?;
                    }
                }
                GenerationEvent::StartStep => {
                    self.snapshot_hash = self.snapshot.track().await;
                    let part = self.part(PartKind::StepStart(StepStartPart {
                        snapshot: self.snapshot_hash.clone(),
                    }));
                    self.store.update_part(&part, None).await?;
                }

                GenerationEvent::ReasoningStart { id } => {
                    let part = self.part(PartKind::Reasoning(ReasoningPart {
                        text: String::new(),
                        time: PartTime::started(),
                        metadata: None,
                    }));
                    self.store.update_part(&part, None).await?;
                    self.reasoning.insert(id, part);
                }
                GenerationEvent::ReasoningDelta { id, text } => {
                    if let Some(part) = self.reasoning.get_mut(&id)
                        && let PartKind::Reasoning(reasoning) = &mut part.kind
                    {
                        reasoning.text.push_str(&text);
                        self.store.update_part(part, Some(text)).await?;
                    }
                }
                GenerationEvent::ReasoningEnd { id } => {
                    if let Some(mut part) = self.reasoning.remove(&id) {
                        if let PartKind::Reasoning(reasoning) = &mut part.kind {
                            reasoning.text = reasoning.text.trim_end().to_string();
                            reasoning.time.end = Some(Utc::now());
                        }
                        self.store.update_part(&part, None).await?;
                    }
                }

                GenerationEvent::TextStart { .. } => {
                    if let Some(mut open) = self.text.take() {
                        if let PartKind::Text(TextPart { time: Some(time), .. }) = &mut open.kind {
                            time.end = Some(Utc::now());
                        }
                        self.store.update_part(&open, None).await?;
                    }
                    let part = self.part(PartKind::Text(TextPart {
                        text: String::new(),
                        synthetic: false,
                        time: Some(PartTime::started()),
                    }));
                    self.store.update_part(&part, None).await?;
                    self.text = Some(part);
                }
                GenerationEvent::TextDelta { text, .. } => {
                    if self.text.is_none() {
                        self.text = Some(self.part(PartKind::Text(TextPart {
                            text: String::new(),
                            synthetic: false,
                            time: Some(PartTime::started()),
                        })));
                    }
                    if let Some(part) = self.text.as_mut()
                        && let PartKind::Text(current) = &mut part.kind
                    {
                        current.text.push_str(&text);
                        self.store.update_part(part, Some(text)).await?;
                    }
                }
                GenerationEvent::TextEnd { .. } => {
                    if let Some(mut part) = self.text.take() {
                        if let PartKind::Text(text) = &mut part.kind {
                            text.text = text.text.trim_end().to_string();
                            if let Some(time) = text.time.as_mut() {
                                time.end = Some(Utc::now());
                            }
                        }
                        self.store.update_part(&part, None).await?;
                    }
                }

                GenerationEvent::ToolInputStart { call_id, tool } => {
                    if self.tools.contains_key(&call_id) {
                        continue;
                    }
                    let part = self.part(PartKind::Tool(ToolPart {
                        call_id: call_id.clone(),
                        tool,
                        state: ToolState::Pending {
                            input: serde_json::json!({}),
                            raw: String::new(),
                        },
                    }));
                    self.store.update_part(&part, None).await?;
                    self.tools.insert(call_id, part);
                }
                GenerationEvent::ToolCall { call_id, tool, input } => {
                    let Some(part) = self.tools.get_mut(&call_id) else {
                        debug!(call_id = %call_id, "Tool call for unknown part");
                        continue;
                    };
                    if let PartKind::Tool(tool_part) = &mut part.kind
                        && matches!(tool_part.state, ToolState::Pending { .. })
                    {
                        tool_part.tool = tool;
                        tool_part.state = ToolState::Running {
                            input,
                            title: None,
                            metadata: None,
                            time: ToolTime {
                                start: Utc::now(),
                                end: None,
                                compacted: None,
                            },
                        };
                        self.store.update_part(part, None).await?;
                    }
                }
                GenerationEvent::ToolMetadata {
                    call_id,
                    title: new_title,
                    metadata: new_metadata,
                } => {
                    if let Some(part) = self.tools.get_mut(&call_id)
                        && let PartKind::Tool(ToolPart {
                            state: ToolState::Running { title, metadata, .. },
                            ..
                        }) = &mut part.kind
                    {
                        if new_title.is_some() {
                            *title = new_title;
                        }
                        *metadata = Some(new_metadata);
                        self.store.update_part(part, None).await?;
                    }
                }
                GenerationEvent::ToolResult { call_id, output } => {
                    self.complete_tool(&call_id, output).await?;
                }
                GenerationEvent::ToolError {
                    call_id,
                    error,
                    rejected,
                    metadata,
                } => {
                    if self.fail_tool(&call_id, error, metadata).await? && rejected {
                        self.should_stop = true;
                    }
                }

                GenerationEvent::FinishStep { usage, finish_reason } => {
                    self.finish_step(usage, finish_reason).await?;
                }
                GenerationEvent::Finish => {
                    self.message.time.completed = Some(Utc::now());
                    self.store.update_message(&MessageInfo::Assistant(self.message.clone())).await?;
                }
                GenerationEvent::Error(error) => {
                    warn!(session_id = %self.message.session_id, error = %error, "Model stream failed");
                    self.fail(classify(&error));
                    self.store.update_message(&MessageInfo::Assistant(self.message.clone())).await?;
                }
            }
        }
        Ok(())
    }

    fn part(&self, kind: PartKind) -> Part {
        Part::new(&self.message.session_id, &self.message.id, kind)
    }

    /// Record `error` on the message and publish it, once.
    fn fail(&mut self, error: MessageError) {
        self.message.error = Some(error.clone());
        if !self.error_published {
            self.error_published = true;
            self.store.bus().publish(BusEvent::SessionError {
                session_id: Some(self.message.session_id.clone()),
                error,
            });
        }
    }

    /// Move a running tool part to `completed`. Anything else is left alone.
    async fn complete_tool(&mut self, call_id: &str, output: ToolOutput) -> Result<bool, Error> {
        let Some(part) = self.tools.get_mut(call_id) else {
            return Ok(false);
        };
        let PartKind::Tool(tool_part) = &mut part.kind else {
            return Ok(false);
        };
        let ToolState::Running { input, time, .. } = &tool_part.state else {
            return Ok(false);
        };
        tool_part.state = ToolState::Completed {
            input: input.clone(),
            output: output.output,
            title: output.title,
            metadata: output.metadata,
            time: ToolTime {
                start: time.start,
                end: Some(Utc::now()),
                compacted: None,
            },
        };
        self.store.update_part(part, None).await?;
        Ok(true)
    }

    /// Move a running tool part to `error`. Returns whether it moved.
    async fn fail_tool(
        &mut self,
        call_id: &str,
        error: String,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool, Error> {
        let Some(part) = self.tools.get_mut(call_id) else {
            return Ok(false);
        };
        let PartKind::Tool(tool_part) = &mut part.kind else {
            return Ok(false);
        };
        let ToolState::Running { input, time, .. } = &tool_part.state else {
            return Ok(false);
        };
        tool_part.state = ToolState::Error {
            input: input.clone(),
            error,
            metadata,
            time: ToolTime {
                start: time.start,
                end: Some(Utc::now()),
                compacted: None,
            },
        };
        self.store.update_part(part, None).await?;
        Ok(true)
    }

    async fn finish_step(&mut self, usage: Usage, finish_reason: FinishReason) -> Result<(), Error> {
        let tokens = step_tokens(&usage);
        let cost = step_cost(&tokens, &self.cost);
        self.message.tokens.absorb(&tokens);
        self.message.cost += cost;
        self.message.finish = Some(finish_reason.as_str().to_string());
        self.store.update_message(&MessageInfo::Assistant(self.message.clone())).await?;

        let part = self.part(PartKind::StepFinish(StepFinishPart {
            tokens,
            cost,
            snapshot: self.snapshot.track().await,
        }));
        self.store.update_part(&part, None).await?;

        if let Some(hash) = self.snapshot_hash.take() {
            let files = self.snapshot.patch(&hash).await;
            if !files.is_empty() {
                let patch = self.part(PartKind::Patch(PatchPart { hash, files }));
                self.store.update_part(&patch, None).await?;
            }
        }
        Ok(())
    }

    /// Close the current message and continue the generation in a new one
    /// answering the newest of `queued`.
    async fn splice(&mut self, source: &mut dyn EventSource, queued: Vec<WithParts>) -> Result<(), Error> {
        self.close_open_parts().await?;
        let closing = self.message.id.clone();
        self.abort_dangling_tools(&closing).await?;
        self.message.time.completed = Some(Utc::now());
        self.store.update_message(&MessageInfo::Assistant(self.message.clone())).await?;

        let parent = queued.last().map(|m| m.info.id().to_string());
        let mut next = self.message.clone();
        next.id = corvid_core::id::ascending(corvid_core::id::IdKind::Message);
        next.time = corvid_core::message::MessageTime::now();
        next.parent_id = parent;
        next.cost = 0.0;
        next.tokens = Default::default();
        next.error = None;
        next.finish = None;
        self.store.update_message(&MessageInfo::Assistant(next.clone())).await?;
        info!(
            session_id = %next.session_id,
            queued = queued.len(),
            message_id = %next.id,
            "Spliced queued prompts into running generation"
        );

        source.rotate(&next.id, replay::to_model_messages(&queued));
        self.message = next;
        self.tools.clear();
        Ok(())
    }

    async fn close_open_parts(&mut self) -> Result<(), Error> {
        if let Some(mut part) = self.text.take() {
            if let PartKind::Text(TextPart { time: Some(time), .. }) = &mut part.kind {
                time.end = Some(Utc::now());
            }
            self.store.update_part(&part, None).await?;
        }
        for (_, mut part) in self.reasoning.drain() {
            if let PartKind::Reasoning(reasoning) = &mut part.kind {
                reasoning.time.end = Some(Utc::now());
            }
            self.store.update_part(&part, None).await?;
        }
        Ok(())
    }

    /// Force every tool part of `message_id` still pending or running to `error`.
    async fn abort_dangling_tools(&self, message_id: &str) -> Result<(), Error> {
        for mut part in self.store.parts(message_id).await? {
            let PartKind::Tool(tool_part) = &mut part.kind else {
                continue;
            };
            if tool_part.state.is_terminal() {
                continue;
            }
            let start = match &tool_part.state {
                ToolState::Running { time, .. } => time.start,
                _ => Utc::now(),
            };
            debug!(call_id = %tool_part.call_id, status = tool_part.state.status(), "Forcing tool part to error");
            tool_part.state = ToolState::Error {
                input: tool_part.state.input().clone(),
                error: ABORTED_TOOL.into(),
                metadata: None,
                time: ToolTime {
                    start,
                    end: Some(Utc::now()),
                    compacted: None,
                },
            };
            self.store.update_part(&part, None).await?;
        }
        Ok(())
    }

    /// Force every tool part still pending or running to `error`, close open
    /// text, stamp completion and return the stored message.
    async fn finalize(mut self) -> Result<WithParts, Error> {
        self.close_open_parts().await?;

        let message_id = self.message.id.clone();
        self.abort_dangling_tools(&message_id).await?;

        if self.message.time.completed.is_none() {
            self.message.time.completed = Some(Utc::now());
        }
        self.store.update_message(&MessageInfo::Assistant(self.message.clone())).await?;
        self.store.message(&self.message.session_id, &self.message.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corvid_core::event::EventBus;
    use corvid_core::provider::{ModelMessage, ModelRef};
    use corvid_core::snapshot::NoSnapshot;
    use corvid_storage::InMemoryStorage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of events.
    struct Scripted {
        events: VecDeque<GenerationEvent>,
        stopped: bool,
        rotated: Vec<(String, Vec<ModelMessage>)>,
    }

    impl Scripted {
        fn new(events: Vec<GenerationEvent>) -> Self {
            Self {
                events: events.into(),
                stopped: false,
                rotated: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl EventSource for Scripted {
        async fn next_event(&mut self) -> Option<GenerationEvent> {
            self.events.pop_front()
        }
        fn rotate(&mut self, message_id: &str, messages: Vec<ModelMessage>) {
            self.rotated.push((message_id.to_string(), messages));
        }
        fn stop(&mut self) {
            self.stopped = true;
            self.events.clear();
        }
    }

    struct FakeSnapshot;

    #[async_trait]
    impl Snapshot for FakeSnapshot {
        async fn track(&self) -> Option<String> {
            Some("abc123".into())
        }
        async fn patch(&self, _hash: &str) -> Vec<String> {
            vec!["src/lib.rs".into()]
        }
    }

    async fn processor(snapshot: Arc<dyn Snapshot>) -> (SessionStore, StreamProcessor) {
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), EventBus::default(), "/work");
        let session = store.create(None, None).await.unwrap();
        let message = AssistantMessage::new(&session.id, "build", &ModelRef::new("p", "m"));
        store.update_message(&MessageInfo::Assistant(message.clone())).await.unwrap();
        let cost = ModelCost {
            input: 1.0,
            output: 2.0,
            ..Default::default()
        };
        (store.clone(), StreamProcessor::new(store, snapshot, cost, message))
    }

    fn tool_states(message: &WithParts) -> Vec<&ToolState> {
        message.parts.iter().filter_map(Part::as_tool).map(|t| &t.state).collect()
    }

    #[tokio::test]
    async fn text_deltas_build_one_part() {
        let (_, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut source = Scripted::new(vec![
            GenerationEvent::Start,
            GenerationEvent::TextStart { id: "t".into() },
            GenerationEvent::TextDelta {
                id: "t".into(),
                text: "Hi".into(),
            },
            GenerationEvent::TextDelta {
                id: "t".into(),
                text: " there".into(),
            },
            GenerationEvent::TextEnd { id: "t".into() },
            GenerationEvent::Finish,
        ]);
        let result = processor.process(&mut source, None).await.unwrap();
        let texts: Vec<&TextPart> = result.parts.iter().filter_map(Part::as_text).collect();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].text, "Hi there");
        assert!(texts[0].time.as_ref().unwrap().end.is_some());
        assert!(result.info.as_assistant().unwrap().time.completed.is_some());
    }

    #[tokio::test]
    async fn deltas_are_written_through() {
        let (store, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut rx = store.bus().subscribe();
        let mut source = Scripted::new(vec![
            GenerationEvent::TextStart { id: "t".into() },
            GenerationEvent::TextDelta {
                id: "t".into(),
                text: "partial".into(),
            },
        ]);
        processor.process(&mut source, None).await.unwrap();
        let mut deltas = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::PartUpdated { delta: Some(delta), .. } = event.as_ref() {
                deltas.push(delta.clone());
            }
        }
        assert_eq!(deltas, vec!["partial"]);
    }

    #[tokio::test]
    async fn terminal_tool_state_is_never_overwritten() {
        let (_, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut source = Scripted::new(vec![
            GenerationEvent::ToolInputStart {
                call_id: "c1".into(),
                tool: "bash".into(),
            },
            GenerationEvent::ToolCall {
                call_id: "c1".into(),
                tool: "bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
            GenerationEvent::ToolResult {
                call_id: "c1".into(),
                output: ToolOutput::new("ls", "file.txt"),
            },
            GenerationEvent::ToolError {
                call_id: "c1".into(),
                error: "late".into(),
                rejected: false,
                metadata: None,
            },
            GenerationEvent::ToolCall {
                call_id: "c1".into(),
                tool: "bash".into(),
                input: serde_json::json!({}),
            },
            GenerationEvent::ToolCall {
                call_id: "unknown".into(),
                tool: "bash".into(),
                input: serde_json::json!({}),
            },
            GenerationEvent::Finish,
        ]);
        let result = processor.process(&mut source, None).await.unwrap();
        let states = tool_states(&result);
        assert_eq!(states.len(), 1);
        match states[0] {
            ToolState::Completed { output, input, .. } => {
                assert_eq!(output, "file.txt");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("Expected completed, got {}", other.status()),
        }
    }

    #[tokio::test]
    async fn unfinished_tools_are_forced_to_error() {
        let (_, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut source = Scripted::new(vec![
            GenerationEvent::ToolInputStart {
                call_id: "c1".into(),
                tool: "bash".into(),
            },
            GenerationEvent::ToolInputStart {
                call_id: "c2".into(),
                tool: "read".into(),
            },
            GenerationEvent::ToolCall {
                call_id: "c2".into(),
                tool: "read".into(),
                input: serde_json::json!({"filePath": "a"}),
            },
            GenerationEvent::Error(ProviderError::Aborted),
        ]);
        let result = processor.process(&mut source, None).await.unwrap();
        for state in tool_states(&result) {
            match state {
                ToolState::Error { error, .. } => assert_eq!(error, ABORTED_TOOL),
                other => panic!("Expected error, got {}", other.status()),
            }
        }
        let info = result.info.as_assistant().unwrap();
        assert!(info.error.as_ref().unwrap().is_aborted());
        assert!(info.time.completed.is_some());
    }

    #[tokio::test]
    async fn errors_publish_once() {
        let (store, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut rx = store.bus().subscribe();
        let mut source = Scripted::new(vec![
            GenerationEvent::Error(ProviderError::api(500, "boom", Default::default())),
            GenerationEvent::Error(ProviderError::api(500, "again", Default::default())),
        ]);
        let result = processor.process(&mut source, None).await.unwrap();
        let mut published = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.as_ref(), BusEvent::SessionError { .. }) {
                published += 1;
            }
        }
        assert_eq!(published, 1);
        assert!(matches!(
            result.info.as_assistant().unwrap().error,
            Some(MessageError::Api { retryable: true, .. })
        ));
    }

    #[tokio::test]
    async fn rejection_stops_before_next_step() {
        let (_, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut source = Scripted::new(vec![
            GenerationEvent::ToolInputStart {
                call_id: "c1".into(),
                tool: "bash".into(),
            },
            GenerationEvent::ToolCall {
                call_id: "c1".into(),
                tool: "bash".into(),
                input: serde_json::json!({"command": "rm -rf /"}),
            },
            GenerationEvent::ToolError {
                call_id: "c1".into(),
                error: "rejected".into(),
                rejected: true,
                metadata: None,
            },
            GenerationEvent::FinishStep {
                usage: Usage::default(),
                finish_reason: FinishReason::ToolCalls,
            },
            GenerationEvent::PrepareStep { step: 2 },
            GenerationEvent::StartStep,
        ]);
        processor.process(&mut source, None).await.unwrap();
        assert!(source.stopped);
    }

    #[tokio::test]
    async fn step_finish_accumulates_usage_and_records_patches() {
        let (_, processor) = processor(Arc::new(FakeSnapshot)).await;
        let step = |input, output| GenerationEvent::FinishStep {
            usage: Usage {
                input_tokens: input,
                output_tokens: output,
                ..Default::default()
            },
            finish_reason: FinishReason::Stop,
        };
        let mut source = Scripted::new(vec![
            GenerationEvent::StartStep,
            step(1_000_000, 100),
            GenerationEvent::StartStep,
            step(500_000, 1_000_000),
            GenerationEvent::Finish,
        ]);
        let result = processor.process(&mut source, None).await.unwrap();
        let info = result.info.as_assistant().unwrap();
        assert_eq!(info.tokens.input, 1_000_000);
        assert_eq!(info.tokens.output, 1_000_000);
        assert!((info.cost - (1.0 + 0.0002 + 0.5 + 2.0)).abs() < 1e-9);
        assert_eq!(info.finish.as_deref(), Some("stop"));

        let patches = result
            .parts
            .iter()
            .filter(|p| matches!(&p.kind, PartKind::Patch(patch) if patch.files == vec!["src/lib.rs"]))
            .count();
        assert_eq!(patches, 2);
    }

    struct Queue(Mutex<Vec<WithParts>>);

    impl PendingTurns for Queue {
        fn take(&self) -> Vec<WithParts> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn queued_turns_rotate_the_message() {
        let (store, processor) = processor(Arc::new(NoSnapshot)).await;
        let first_id = processor.message().id.clone();
        let session_id = processor.message().session_id.clone();
        let user = corvid_core::message::WithParts {
            info: MessageInfo::User(corvid_core::message::UserMessage {
                id: "msg_user2".into(),
                session_id: session_id.clone(),
                time: corvid_core::message::MessageTime::now(),
                agent: "build".into(),
                model: ModelRef::new("p", "m"),
            }),
            parts: vec![Part::text(&session_id, "msg_user2", "also this")],
        };
        let queue = Queue(Mutex::new(vec![user]));
        let mut source = Scripted::new(vec![
            GenerationEvent::TextStart { id: "t".into() },
            GenerationEvent::TextDelta {
                id: "t".into(),
                text: "first".into(),
            },
            GenerationEvent::PrepareStep { step: 2 },
            GenerationEvent::TextStart { id: "t".into() },
            GenerationEvent::TextDelta {
                id: "t".into(),
                text: "second".into(),
            },
            GenerationEvent::TextEnd { id: "t".into() },
            GenerationEvent::Finish,
        ]);
        let result = processor.process(&mut source, Some(&queue)).await.unwrap();

        assert_ne!(result.info.id(), first_id);
        assert_eq!(result.info.as_assistant().unwrap().parent_id.as_deref(), Some("msg_user2"));
        assert_eq!(result.text(), "second");
        assert_eq!(source.rotated.len(), 1);
        assert_eq!(source.rotated[0].0, result.info.id());

        let first = store.message(&session_id, &first_id).await.unwrap();
        assert_eq!(first.text(), "first");
        assert!(first.info.as_assistant().unwrap().time.completed.is_some());
    }

    #[tokio::test]
    async fn splice_closes_dangling_tools_of_the_previous_message() {
        let (store, processor) = processor(Arc::new(NoSnapshot)).await;
        let first_id = processor.message().id.clone();
        let session_id = processor.message().session_id.clone();
        let user = corvid_core::message::WithParts {
            info: MessageInfo::User(corvid_core::message::UserMessage {
                id: "msg_user2".into(),
                session_id: session_id.clone(),
                time: corvid_core::message::MessageTime::now(),
                agent: "build".into(),
                model: ModelRef::new("p", "m"),
            }),
            parts: vec![Part::text(&session_id, "msg_user2", "next")],
        };
        let queue = Queue(Mutex::new(vec![user]));
        let mut source = Scripted::new(vec![
            GenerationEvent::ToolInputStart {
                call_id: "c1".into(),
                tool: "bash".into(),
            },
            GenerationEvent::ToolInputStart {
                call_id: "c2".into(),
                tool: "read".into(),
            },
            GenerationEvent::ToolCall {
                call_id: "c2".into(),
                tool: "read".into(),
                input: serde_json::json!({"filePath": "a"}),
            },
            GenerationEvent::ToolResult {
                call_id: "c2".into(),
                output: ToolOutput::new("a", "contents"),
            },
            GenerationEvent::FinishStep {
                usage: Usage::default(),
                finish_reason: FinishReason::ToolCalls,
            },
            GenerationEvent::PrepareStep { step: 2 },
            GenerationEvent::TextStart { id: "t".into() },
            GenerationEvent::TextDelta {
                id: "t".into(),
                text: "done".into(),
            },
            GenerationEvent::TextEnd { id: "t".into() },
            GenerationEvent::Finish,
        ]);
        let result = processor.process(&mut source, Some(&queue)).await.unwrap();
        assert_ne!(result.info.id(), first_id);

        let first = store.message(&session_id, &first_id).await.unwrap();
        let statuses: Vec<&str> = tool_states(&first).iter().map(|s| s.status()).collect();
        assert_eq!(statuses, vec!["error", "completed"]);
        match tool_states(&first)[0] {
            ToolState::Error { error, time, .. } => {
                assert_eq!(error, ABORTED_TOOL);
                assert!(time.end.is_some());
            }
            other => panic!("Expected error, got {}", other.status()),
        }
    }

    #[tokio::test]
    async fn new_text_block_closes_the_open_one() {
        let (_, processor) = processor(Arc::new(NoSnapshot)).await;
        let mut source = Scripted::new(vec![
            GenerationEvent::TextStart { id: "a".into() },
            GenerationEvent::TextDelta {
                id: "a".into(),
                text: "one".into(),
            },
            GenerationEvent::TextStart { id: "b".into() },
            GenerationEvent::TextDelta {
                id: "b".into(),
                text: "two".into(),
            },
            GenerationEvent::TextEnd { id: "b".into() },
            GenerationEvent::Finish,
        ]);
        let result = processor.process(&mut source, None).await.unwrap();
        let texts: Vec<&TextPart> = result.parts.iter().filter_map(Part::as_text).collect();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0].text, "one");
        assert!(texts.iter().all(|t| t.time.as_ref().unwrap().end.is_some()));
    }
}
