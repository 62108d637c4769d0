//! Context-window management: overflow detection, summarization and pruning.

use std::sync::Arc;

use chrono::Utc;
use corvid_core::agent::AgentInfo;
use corvid_core::error::Error;
use corvid_core::event::BusEvent;
use corvid_core::id::{self, IdKind};
use corvid_core::message::{
    AssistantMessage, CompactionPart, MessageInfo, MessagePath, MessageTime, Part, PartKind, ToolState, Tokens,
    UserMessage, WithParts,
};
use corvid_core::provider::{ModelInfo, ModelMessage, ResolvedModel};
use corvid_core::snapshot::Snapshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::generation::{Generation, GenerationRequest};
use crate::pipeline::ResolvedTools;
use crate::processor::StreamProcessor;
use crate::replay;
use crate::retry::RetryPolicy;
use crate::store::SessionStore;
use crate::system::SUMMARIZE_INSTRUCTION;

/// Output reservation cap when sizing the usable context.
pub const OUTPUT_TOKEN_MAX: u64 = 32_000;
/// Recent tool output, in estimated tokens, that pruning never touches.
pub const PRUNE_PROTECT: u64 = 40_000;
/// Pruning is only committed once it would free at least this much.
pub const PRUNE_MINIMUM: u64 = 20_000;

const PRUNE_SKIP_TURNS: usize = 3;
const CONTINUE_TEXT: &str = "Continue if you have next steps";

/// Whether `tokens` no longer fit the model's usable context.
pub fn is_overflow(tokens: &Tokens, model: &ModelInfo, disabled: bool) -> bool {
    let context = model.limit.context;
    if disabled || context == 0 {
        return false;
    }
    let output = match model.limit.output.min(OUTPUT_TOKEN_MAX) {
        0 => OUTPUT_TOKEN_MAX,
        n => n,
    };
    tokens.context_total() > context.saturating_sub(output)
}

/// Rough token count of `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Mark old completed tool output as compacted so replay clears it.
///
/// Scans newest to oldest, skipping the latest turns. Returns the number of
/// parts marked.
pub async fn prune(store: &SessionStore, session_id: &str) -> Result<usize, Error> {
    let messages = store.messages(session_id).await?;
    let mut total = 0u64;
    let mut pruned = 0u64;
    let mut marked: Vec<Part> = Vec::new();
    let mut turns = 0usize;

    'scan: for message in messages.iter().rev() {
        if matches!(message.info, MessageInfo::User(_)) {
            turns += 1;
        }
        if turns < PRUNE_SKIP_TURNS {
            continue;
        }
        if message.info.is_summary() {
            break;
        }
        for part in message.parts.iter().rev() {
            let Some(tool) = part.as_tool() else { continue };
            let ToolState::Completed { output, time, .. } = &tool.state else {
                continue;
            };
            if time.compacted.is_some() {
                break 'scan;
            }
            let estimate = estimate_tokens(output);
            total += estimate;
            if total > PRUNE_PROTECT {
                pruned += estimate;
                marked.push(part.clone());
            }
        }
    }

    debug!(session_id, total, pruned, candidates = marked.len(), "Prune scan");
    if pruned <= PRUNE_MINIMUM {
        return Ok(0);
    }

    let now = Utc::now();
    for part in &mut marked {
        if let PartKind::Tool(tool) = &mut part.kind
            && let ToolState::Completed { time, .. } = &mut tool.state
        {
            time.compacted = Some(now);
        }
        store.update_part(part, None).await?;
    }
    info!(session_id, parts = marked.len(), tokens = pruned, "Pruned tool output");
    Ok(marked.len())
}

/// One summarization run over a session's history.
pub struct Summarizer {
    pub store: SessionStore,
    pub snapshot: Arc<dyn Snapshot>,
    pub model: ResolvedModel,
    pub system: Vec<String>,
    pub retry: RetryPolicy,
    pub agent: AgentInfo,
}

impl Summarizer {
    /// Summarize everything since the previous summary.
    ///
    /// `auto` marks a compaction triggered by overflow; a successful one is
    /// followed by a synthetic user turn that lets the agent carry on.
    pub async fn run(&self, session_id: &str, auto: bool, abort: CancellationToken) -> Result<WithParts, Error> {
        self.store
            .update(session_id, |s| s.time.compacting = Some(Utc::now()))
            .await?;
        let result = self.summarize(session_id, auto, abort).await;
        self.store.update(session_id, |s| s.time.compacting = None).await?;
        let summary = result?;

        let succeeded = summary.info.as_assistant().is_some_and(|a| a.error.is_none());
        if auto && succeeded {
            let user = self.user_message(session_id);
            self.store.update_message(&MessageInfo::User(user.clone())).await?;
            self.store
                .update_part(&Part::synthetic(session_id, &user.id, CONTINUE_TEXT), None)
                .await?;
        }
        info!(session_id, auto, succeeded, "Session compacted");
        self.store.bus().publish(BusEvent::SessionCompacted {
            session_id: session_id.to_string(),
        });
        Ok(summary)
    }

    fn user_message(&self, session_id: &str) -> UserMessage {
        UserMessage {
            id: id::ascending(IdKind::Message),
            session_id: session_id.to_string(),
            time: MessageTime::now(),
            agent: self.agent.name.clone(),
            model: self.model.info.model_ref(),
        }
    }

    async fn summarize(&self, session_id: &str, auto: bool, abort: CancellationToken) -> Result<WithParts, Error> {
        let history = self.store.messages(session_id).await?;
        let mut messages = replay::to_model_messages(replay::since_last_summary(&history));
        messages.push(ModelMessage::user_text(SUMMARIZE_INSTRUCTION));

        let request = self.user_message(session_id);
        self.store.update_message(&MessageInfo::User(request.clone())).await?;
        self.store
            .update_part(
                &Part::new(session_id, &request.id, PartKind::Compaction(CompactionPart { auto })),
                None,
            )
            .await?;

        let mut assistant = AssistantMessage::new(session_id, &self.agent.name, &self.model.info.model_ref());
        assistant.parent_id = Some(request.id.clone());
        assistant.summary = true;
        assistant.system = self.system.clone();
        assistant.path = MessagePath {
            cwd: self.store.directory().to_string(),
            root: self.store.directory().to_string(),
        };
        self.store
            .update_message(&MessageInfo::Assistant(assistant.clone()))
            .await?;

        let mut generation = Generation::new(
            GenerationRequest {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                model: self.model.clone(),
                agent: self.agent.clone(),
                system: self.system.clone(),
                messages,
                tools: ResolvedTools::none(),
                temperature: None,
                top_p: None,
                options: Default::default(),
                max_steps: 1,
                retry: self.retry.clone(),
                subagents: None,
            },
            abort,
        );
        let processor = StreamProcessor::new(
            self.store.clone(),
            self.snapshot.clone(),
            self.model.info.cost,
            assistant,
        );
        processor.process(&mut generation, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::event::EventBus;
    use corvid_core::message::{ToolPart, ToolTime};
    use corvid_core::provider::{ModelCost, ModelLimit, ModelRef};
    use corvid_core::snapshot::NoSnapshot;
    use corvid_providers::scripted::{ScriptStep, ScriptedModel};
    use corvid_storage::InMemoryStorage;

    fn model(context: u64, output: u64) -> ModelInfo {
        ModelInfo {
            id: "m".into(),
            provider_id: "p".into(),
            limit: ModelLimit { context, output },
            cost: ModelCost::default(),
            tool_call: true,
            reasoning: false,
            temperature: true,
        }
    }

    fn tokens(input: u64, cache_read: u64, output: u64) -> Tokens {
        let mut t = Tokens {
            input,
            output,
            ..Default::default()
        };
        t.cache.read = cache_read;
        t
    }

    #[test]
    fn overflow_uses_clamped_output_reservation() {
        let info = model(100_000, 40_000);
        assert!(is_overflow(&tokens(50_000, 20_000, 10_000), &info, false));
        assert!(!is_overflow(&tokens(40_000, 20_000, 8_000), &info, false));
        assert!(!is_overflow(&tokens(50_000, 20_000, 10_000), &info, true));
        assert!(!is_overflow(&tokens(u64::MAX / 4, 0, 0), &model(0, 0), false));
        // An unknown output limit reserves the full cap.
        assert!(is_overflow(&tokens(70_000, 0, 0), &model(100_000, 0), false));
    }

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryStorage::new()), EventBus::default(), "/work")
    }

    async fn user(store: &SessionStore, sid: &str) {
        let info = UserMessage {
            id: id::ascending(IdKind::Message),
            session_id: sid.into(),
            time: MessageTime::now(),
            agent: "build".into(),
            model: ModelRef::new("p", "m"),
        };
        store.update_message(&MessageInfo::User(info.clone())).await.unwrap();
        store.update_part(&Part::text(sid, &info.id, "go"), None).await.unwrap();
    }

    async fn assistant_with_output(store: &SessionStore, sid: &str, chars: usize) {
        let info = AssistantMessage::new(sid, "build", &ModelRef::new("p", "m"));
        store.update_message(&MessageInfo::Assistant(info.clone())).await.unwrap();
        let part = Part::new(
            sid,
            &info.id,
            PartKind::Tool(ToolPart {
                call_id: id::ascending(IdKind::Call),
                tool: "read".into(),
                state: ToolState::Completed {
                    input: serde_json::json!({}),
                    output: "x".repeat(chars),
                    title: String::new(),
                    metadata: serde_json::json!({}),
                    time: ToolTime {
                        start: Utc::now(),
                        end: Some(Utc::now()),
                        compacted: None,
                    },
                },
            }),
        );
        store.update_part(&part, None).await.unwrap();
    }

    fn compacted(messages: &[WithParts]) -> Vec<bool> {
        messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| p.as_tool())
            .map(|t| matches!(&t.state, ToolState::Completed { time, .. } if time.compacted.is_some()))
            .collect()
    }

    #[tokio::test]
    async fn prune_marks_old_output_past_the_protect_window() {
        let store = store();
        let sid = store.create(None, None).await.unwrap().id;
        // Five turns of 25k estimated tokens each.
        for _ in 0..5 {
            user(&store, &sid).await;
            assistant_with_output(&store, &sid, 100_000).await;
        }

        assert_eq!(prune(&store, &sid).await.unwrap(), 1);
        let messages = store.messages(&sid).await.unwrap();
        // Output of the three newest turns is skipped, the next 40k protected.
        assert_eq!(compacted(&messages), vec![true, false, false, false, false]);

        // The compacted part stops the next scan; nothing new to prune.
        assert_eq!(prune(&store, &sid).await.unwrap(), 0);
        let again = store.messages(&sid).await.unwrap();
        assert_eq!(compacted(&again), vec![true, false, false, false, false]);
    }

    #[tokio::test]
    async fn prune_is_a_noop_below_the_minimum() {
        let store = store();
        let sid = store.create(None, None).await.unwrap().id;
        for _ in 0..4 {
            user(&store, &sid).await;
            assistant_with_output(&store, &sid, 60_000).await;
        }
        assert_eq!(prune(&store, &sid).await.unwrap(), 0);
        assert!(compacted(&store.messages(&sid).await.unwrap()).iter().all(|c| !c));
    }

    #[tokio::test]
    async fn auto_summary_adds_continue_turn_and_clears_flag() {
        let store = store();
        let sid = store.create(None, None).await.unwrap().id;
        user(&store, &sid).await;
        let scripted = Arc::new(ScriptedModel::new(vec![ScriptStep::text("We read the config.")]));
        let mut rx = store.bus().subscribe();

        let summarizer = Summarizer {
            store: store.clone(),
            snapshot: Arc::new(NoSnapshot),
            model: scripted.clone().into_resolved("p", "m"),
            system: vec!["Summarize.".into()],
            retry: RetryPolicy::default(),
            agent: AgentInfo::new("build"),
        };
        let summary = summarizer.run(&sid, true, CancellationToken::new()).await.unwrap();
        assert!(summary.info.is_summary());
        assert_eq!(summary.text(), "We read the config.");

        let request = &scripted.requests()[0];
        assert!(request.tools.is_empty());
        assert_eq!(
            request.messages.last(),
            Some(&ModelMessage::user_text(SUMMARIZE_INSTRUCTION))
        );

        let messages = store.messages(&sid).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[1].parts[0].kind, PartKind::Compaction(CompactionPart { auto: true })));
        assert_eq!(messages[3].parts[0].as_text().map(|t| t.text.as_str()), Some(CONTINUE_TEXT));
        assert!(store.get(&sid).await.unwrap().time.compacting.is_none());

        let mut compacted = false;
        while let Ok(event) = rx.try_recv() {
            compacted |= matches!(event.as_ref(), BusEvent::SessionCompacted { .. });
        }
        assert!(compacted);
    }

    #[tokio::test]
    async fn manual_summary_has_no_continue_turn() {
        let store = store();
        let sid = store.create(None, None).await.unwrap().id;
        user(&store, &sid).await;
        let scripted = Arc::new(ScriptedModel::new(vec![ScriptStep::text("Summary.")]));
        let summarizer = Summarizer {
            store: store.clone(),
            snapshot: Arc::new(NoSnapshot),
            model: scripted.into_resolved("p", "m"),
            system: Vec::new(),
            retry: RetryPolicy::default(),
            agent: AgentInfo::new("build"),
        };
        summarizer.run(&sid, false, CancellationToken::new()).await.unwrap();
        assert_eq!(store.messages(&sid).await.unwrap().len(), 3);
    }
}
