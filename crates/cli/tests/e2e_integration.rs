//! End-to-end integration tests for the Corvid session engine.
//!
//! These tests wire the engine the way the `corvid` binary does: file
//! storage, the permission gate, the built-in tools and a scripted model
//! registered through the provider registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use corvid_config::{AppConfig, CommandConfig};
use corvid_core::event::{BusEvent, EventBus};
use corvid_core::id::{self, IdKind};
use corvid_core::message::{
    AssistantMessage, MessageInfo, MessageTime, Part, PartKind, ToolPart, ToolState, ToolTime, UserMessage,
};
use corvid_core::provider::{ModelRef, Usage};
use corvid_providers::{ConfigRegistry, ScriptStep, ScriptedModel};
use corvid_security::{AutoReply, PathPolicy, PermissionGate};
use corvid_session::{CommandInput, PromptInput, SessionPrompt, SessionStore, ShellInput, ToolPipeline};
use corvid_storage::FileStorage;
use corvid_tools::ToolEnv;
use serde_json::json;

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    prompt: SessionPrompt,
    model: Arc<ScriptedModel>,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model = "scripted/model".into();
    config.session.auto_title = false;
    config
}

fn harness(dir: &Path, steps: Vec<ScriptStep>, config: AppConfig, reply: AutoReply) -> Harness {
    let model = Arc::new(ScriptedModel::new(steps));
    let store = SessionStore::new(
        Arc::new(FileStorage::new(dir.join(".storage"))),
        EventBus::default(),
        dir.display().to_string(),
    );
    let gate = PermissionGate::new(store.bus().clone()).with_auto_reply(reply);
    let env = Arc::new(ToolEnv::new(dir, PathPolicy::default(), Arc::new(gate)));
    let pipeline = ToolPipeline::new(corvid_tools::default_registry(env, &config.agents())).with_global(config.tools.clone());
    let providers = ConfigRegistry::from_config(&config)
        .with_model(model.clone().into_resolved("scripted", "model"))
        .with_default(ModelRef::new("scripted", "model"));
    let prompt = SessionPrompt::new(store, Arc::new(providers), pipeline, Arc::new(config), dir);
    Harness { prompt, model }
}

// ── Plain turns ──────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_text_turn_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let session_id = {
        let h = harness(dir.path(), vec![ScriptStep::text("Hi, how can I help?")], config(), AutoReply::Approve);
        let session = h.prompt.store().create(None, None).await.unwrap();
        let answer = h.prompt.prompt(PromptInput::text(&session.id, "hello")).await.unwrap();
        assert_eq!(answer.text(), "Hi, how can I help?");
        session.id
    };

    // A fresh engine over the same directory sees the whole exchange.
    let h = harness(dir.path(), vec![], config(), AutoReply::Approve);
    let messages = h.prompt.store().messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "hello");
    assert_eq!(messages[1].text(), "Hi, how can I help?");
    let assistant = messages[1].info.as_assistant().unwrap();
    assert_eq!(assistant.provider_id, "scripted");
    assert_eq!(assistant.parent_id.as_deref(), Some(messages[0].info.id()));
}

#[tokio::test]
async fn e2e_followup_turn_replays_history() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        dir.path(),
        vec![ScriptStep::text("First."), ScriptStep::text("Second.")],
        config(),
        AutoReply::Approve,
    );
    let session = h.prompt.store().create(None, None).await.unwrap();
    h.prompt.prompt(PromptInput::text(&session.id, "one")).await.unwrap();
    h.prompt.prompt(PromptInput::text(&session.id, "two")).await.unwrap();

    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].messages.len() > requests[0].messages.len());
}

// ── Tools ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_write_tool_creates_file_then_answers() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("hello.txt");
    let h = harness(
        dir.path(),
        vec![
            ScriptStep::tool_call(
                "call_w",
                "write",
                json!({"filePath": target.display().to_string(), "content": "written by the agent\n"}),
            ),
            ScriptStep::text("Done writing."),
        ],
        config(),
        AutoReply::Approve,
    );
    let session = h.prompt.store().create(None, None).await.unwrap();

    let answer = h.prompt.prompt(PromptInput::text(&session.id, "write a file")).await.unwrap();
    assert_eq!(answer.text(), "Done writing.");
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "written by the agent\n");
    let tool = answer.parts.iter().find_map(|p| p.as_tool()).unwrap();
    assert_eq!(tool.tool, "write");
    assert_eq!(tool.state.status(), "completed");
}

#[tokio::test]
async fn e2e_rejected_permission_stops_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        dir.path(),
        vec![
            ScriptStep::tool_call("call_b", "bash", json!({"command": "echo should-not-run"})),
            ScriptStep::text("never reached"),
        ],
        config(),
        AutoReply::Reject,
    );
    let session = h.prompt.store().create(None, None).await.unwrap();

    let input = PromptInput::text(&session.id, "run something").with_agent("plan");
    let answer = h.prompt.prompt(input).await.unwrap();
    let tool = answer.parts.iter().find_map(|p| p.as_tool()).unwrap();
    assert!(matches!(tool.state, ToolState::Error { .. }));
    assert_eq!(h.model.requests().len(), 1);
    assert_eq!(h.model.remaining(), 1);
}

// ── Concurrency ──────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_prompts_on_a_busy_session_are_queued() {
    let dir = tempfile::tempdir().unwrap();
    let mut slow = ScriptStep::text("slow answer");
    slow.delay_ms = 200;
    let h = harness(
        dir.path(),
        vec![slow, ScriptStep::text("queued answer")],
        config(),
        AutoReply::Approve,
    );
    let session = h.prompt.store().create(None, None).await.unwrap();

    let first = tokio::spawn({
        let prompt = h.prompt.clone();
        let sid = session.id.clone();
        async move { prompt.prompt(PromptInput::text(&sid, "first")).await }
    });
    while !h.prompt.is_busy(&session.id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let second = h.prompt.prompt(PromptInput::text(&session.id, "second")).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.text(), "slow answer");
    assert_eq!(second.text(), "queued answer");
    assert!(!h.prompt.is_busy(&session.id));
    let messages = h.prompt.store().messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 4);
}

#[tokio::test]
async fn e2e_abort_ends_a_hanging_generation() {
    let dir = tempfile::tempdir().unwrap();
    let mut hang = ScriptStep::text("partial");
    hang.events.truncate(2);
    hang.hang = true;
    let h = harness(dir.path(), vec![hang], config(), AutoReply::Approve);
    let session = h.prompt.store().create(None, None).await.unwrap();
    let mut rx = h.prompt.store().bus().subscribe();

    let turn = tokio::spawn({
        let prompt = h.prompt.clone();
        let sid = session.id.clone();
        async move { prompt.prompt(PromptInput::text(&sid, "go")).await }
    });
    while !h.prompt.is_busy(&session.id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.prompt.abort(&session.id));

    let answer = tokio::time::timeout(Duration::from_secs(5), turn).await.unwrap().unwrap().unwrap();
    let assistant = answer.info.as_assistant().unwrap();
    assert!(assistant.error.as_ref().is_some_and(|e| e.is_aborted()));
    assert!(assistant.time.completed.is_some());

    let mut idle = false;
    while let Ok(event) = rx.try_recv() {
        idle |= matches!(event.as_ref(), BusEvent::SessionIdle { session_id } if *session_id == session.id);
    }
    assert!(idle);
}

// ── Compaction ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_context_overflow_summarizes_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let heavy = ScriptStep::text("Long answer.").with_usage(Usage {
        input_tokens: 125_000,
        output_tokens: 1_000,
        ..Default::default()
    });
    let h = harness(
        dir.path(),
        vec![
            heavy,
            ScriptStep::text("We discussed one long answer."),
            ScriptStep::text("Continuing from the summary."),
        ],
        config(),
        AutoReply::Approve,
    );
    let session = h.prompt.store().create(None, None).await.unwrap();
    let mut rx = h.prompt.store().bus().subscribe();

    h.prompt.prompt(PromptInput::text(&session.id, "start")).await.unwrap();
    let answer = h.prompt.prompt(PromptInput::text(&session.id, "next")).await.unwrap();
    assert_eq!(answer.text(), "Continuing from the summary.");

    let messages = h.prompt.store().messages(&session.id).await.unwrap();
    let summary = messages.iter().find(|m| m.info.is_summary()).unwrap();
    assert_eq!(summary.text(), "We discussed one long answer.");
    let mut compacted = false;
    while let Ok(event) = rx.try_recv() {
        compacted |= matches!(event.as_ref(), BusEvent::SessionCompacted { .. });
    }
    assert!(compacted);
    assert!(h.prompt.store().get(&session.id).await.unwrap().time.compacting.is_none());
}

#[tokio::test]
async fn e2e_manual_summarize_adds_no_continue_turn() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        dir.path(),
        vec![ScriptStep::text("Answer."), ScriptStep::text("Summary.")],
        config(),
        AutoReply::Approve,
    );
    let session = h.prompt.store().create(None, None).await.unwrap();
    h.prompt.prompt(PromptInput::text(&session.id, "question")).await.unwrap();

    let summary = h.prompt.summarize(&session.id, None).await.unwrap();
    assert!(summary.info.is_summary());
    let messages = h.prompt.store().messages(&session.id).await.unwrap();
    assert!(messages.last().unwrap().info.is_summary());
    assert_eq!(h.model.remaining(), 0);
}

/// One finished turn whose only tool call produced `chars` characters.
async fn seed_turn(store: &SessionStore, sid: &str, chars: usize) {
    let user = UserMessage {
        id: id::ascending(IdKind::Message),
        session_id: sid.into(),
        time: MessageTime::now(),
        agent: "build".into(),
        model: ModelRef::new("scripted", "model"),
    };
    store.update_message(&MessageInfo::User(user.clone())).await.unwrap();
    store.update_part(&Part::text(sid, &user.id, "look"), None).await.unwrap();

    let mut assistant = AssistantMessage::new(sid, "build", &ModelRef::new("scripted", "model"));
    assistant.parent_id = Some(user.id.clone());
    store.update_message(&MessageInfo::Assistant(assistant.clone())).await.unwrap();
    let now = chrono::Utc::now();
    let part = Part::new(
        sid,
        &assistant.id,
        PartKind::Tool(ToolPart {
            call_id: id::ascending(IdKind::Call),
            tool: "read".into(),
            state: ToolState::Completed {
                input: json!({}),
                output: "x".repeat(chars),
                title: "big.txt".into(),
                metadata: json!({}),
                time: ToolTime {
                    start: now,
                    end: Some(now),
                    compacted: None,
                },
            },
        }),
    );
    store.update_part(&part, None).await.unwrap();
}

#[tokio::test]
async fn e2e_old_tool_output_is_pruned_after_a_turn() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![ScriptStep::text("Noted.")], config(), AutoReply::Approve);
    let session = h.prompt.store().create(None, None).await.unwrap();
    for _ in 0..4 {
        seed_turn(h.prompt.store(), &session.id, 100_000).await;
    }

    h.prompt.prompt(PromptInput::text(&session.id, "anything else?")).await.unwrap();

    let compacted: Vec<bool> = h
        .prompt
        .store()
        .messages(&session.id)
        .await
        .unwrap()
        .iter()
        .flat_map(|m| m.parts.iter().filter_map(|p| p.as_tool()))
        .map(|tool| matches!(&tool.state, ToolState::Completed { time, .. } if time.compacted.is_some()))
        .collect();
    // The two newest seeded turns fall inside the skipped window, the next one is protected.
    assert_eq!(compacted, vec![true, false, false, false]);
}

// ── Commands and shell ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_command_template_expands_arguments_and_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
    let mut cfg = config();
    cfg.commands.insert(
        "review".into(),
        CommandConfig {
            template: "Review $1 with focus on $2. See @notes.txt".into(),
            description: "Review a component".into(),
            agent: None,
            model: None,
        },
    );
    let h = harness(dir.path(), vec![ScriptStep::text("Reviewed.")], cfg, AutoReply::Approve);
    let session = h.prompt.store().create(None, None).await.unwrap();

    let answer = h
        .prompt
        .command(CommandInput {
            session_id: session.id.clone(),
            command: "review".into(),
            arguments: "parser \"error handling\"".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(answer.text(), "Reviewed.");

    let messages = h.prompt.store().messages(&session.id).await.unwrap();
    let user = &messages[0];
    assert!(user.text().contains("Review parser with focus on error handling."));
    let attached = user.parts.iter().any(|p| match &p.kind {
        PartKind::Text(text) => text.synthetic && text.text.contains("beta"),
        _ => false,
    });
    assert!(attached);
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_shell_command_is_recorded_in_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), vec![], config(), AutoReply::Approve);
    let session = h.prompt.store().create(None, None).await.unwrap();

    let result = h.prompt.shell(ShellInput::new(&session.id, "echo from-the-shell")).await.unwrap();
    let tool = result.parts[0].as_tool().unwrap();
    match &tool.state {
        ToolState::Completed { output, .. } => assert!(output.contains("from-the-shell")),
        other => panic!("Expected completed, got {}", other.status()),
    }
    assert_eq!(h.prompt.store().messages(&session.id).await.unwrap().len(), 2);
    assert_eq!(h.model.requests().len(), 0);
}
