//! User-initiated shell commands recorded into a session.

use std::path::{Path, PathBuf};

use chrono::Utc;
use corvid_core::error::Error;
use corvid_core::id::{self, IdKind};
use corvid_core::message::{
    AssistantMessage, MessageError, MessageInfo, MessageTime, Part, PartKind, ToolPart, ToolState, ToolTime,
    UserMessage, WithParts,
};
use corvid_core::provider::ModelRef;
use corvid_tools::process::{ProcessEnd, run_streaming};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::SessionStore;

const EXECUTED_BY_USER: &str = "The following tool was executed by the user";
const ABORTED: &str = "Tool execution aborted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellInput {
    pub session_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

impl ShellInput {
    pub fn new(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            agent: None,
            model: None,
        }
    }
}

/// The user's shell, from `$SHELL`, falling back to `bash`.
pub fn user_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bash"))
}

/// Arguments that make `shell` run `command` as a login shell with the
/// user's rc files loaded.
pub fn shell_invocation(shell: &Path, command: &str) -> Vec<String> {
    let name = shell.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    match name {
        "nu" | "fish" => vec!["-c".into(), command.into()],
        "zsh" => vec![
            "-c".into(),
            "-l".into(),
            format!(
                "[[ -f ~/.zshenv ]] && source ~/.zshenv >/dev/null 2>&1 || true\n\
                 [[ -f \"${{ZDOTDIR:-$HOME}}/.zshrc\" ]] && source \"${{ZDOTDIR:-$HOME}}/.zshrc\" >/dev/null 2>&1 || true\n\
                 {command}"
            ),
        ],
        "bash" => vec![
            "-c".into(),
            "-l".into(),
            format!("[[ -f ~/.bashrc ]] && source ~/.bashrc >/dev/null 2>&1 || true\n{command}"),
        ],
        _ => vec!["-c".into(), "-l".into(), command.into()],
    }
}

fn running(input: &serde_json::Value, output: &str, start: chrono::DateTime<Utc>) -> ToolState {
    ToolState::Running {
        input: input.clone(),
        title: None,
        metadata: Some(json!({ "output": output, "description": "" })),
        time: ToolTime {
            start,
            end: None,
            compacted: None,
        },
    }
}

/// Run `input.command` in `cwd` and record it as a `bash` tool call.
///
/// The caller holds the session lock; `abort` is its token.
pub async fn run(
    store: &SessionStore,
    input: &ShellInput,
    agent: &str,
    model: &ModelRef,
    cwd: &Path,
    abort: &CancellationToken,
) -> Result<WithParts, Error> {
    let session_id = input.session_id.as_str();
    let user = UserMessage {
        id: id::ascending(IdKind::Message),
        session_id: session_id.to_string(),
        time: MessageTime::now(),
        agent: agent.to_string(),
        model: model.clone(),
    };
    store.update_message(&MessageInfo::User(user.clone())).await?;
    store
        .update_part(&Part::synthetic(session_id, &user.id, EXECUTED_BY_USER), None)
        .await?;

    let mut assistant = AssistantMessage::new(session_id, agent, &ModelRef::new(&model.provider_id, ""));
    assistant.parent_id = Some(user.id.clone());
    assistant.path.cwd = cwd.display().to_string();
    assistant.path.root = store.directory().to_string();
    store.update_message(&MessageInfo::Assistant(assistant.clone())).await?;

    let tool_input = json!({ "command": input.command });
    let start = Utc::now();
    let mut part = Part::new(
        session_id,
        &assistant.id,
        PartKind::Tool(ToolPart {
            call_id: id::ascending(IdKind::Call),
            tool: "bash".into(),
            state: running(&tool_input, "", start),
        }),
    );
    store.update_part(&part, None).await?;

    let shell = user_shell();
    info!(session_id, shell = %shell.display(), "Running user shell command");
    let mut command = Command::new(&shell);
    command
        .args(shell_invocation(&shell, &input.command))
        .current_dir(cwd)
        .env("TERM", "dumb");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let execute = run_streaming(command, None, abort, move |output| {
        let _ = tx.send(output.to_string());
    });
    let stream = async {
        while let Some(output) = rx.recv().await {
            if let PartKind::Tool(tool) = &mut part.kind {
                tool.state = running(&tool_input, &output, start);
            }
            if let Err(error) = store.update_part(&part, None).await {
                debug!(error = %error, "Dropping shell output update");
            }
        }
    };
    let (outcome, ()) = tokio::join!(execute, stream);

    let end = ToolTime {
        start,
        end: Some(Utc::now()),
        compacted: None,
    };
    let state = match outcome {
        Ok(outcome) if outcome.end == ProcessEnd::Aborted => {
            assistant.error = Some(MessageError::Aborted { message: ABORTED.into() });
            ToolState::Error {
                input: tool_input.clone(),
                error: ABORTED.into(),
                metadata: Some(json!({ "output": outcome.output, "description": "" })),
                time: end,
            }
        }
        Ok(outcome) => ToolState::Completed {
            input: tool_input.clone(),
            output: outcome.output.clone(),
            title: String::new(),
            metadata: json!({ "output": outcome.output, "description": "" }),
            time: end,
        },
        Err(error) => {
            warn!(session_id, error = %error, "Shell command failed to start");
            ToolState::Error {
                input: tool_input.clone(),
                error: error.to_string(),
                metadata: None,
                time: end,
            }
        }
    };
    if let PartKind::Tool(tool) = &mut part.kind {
        tool.state = state;
    }
    store.update_part(&part, None).await?;

    assistant.time.completed = Some(Utc::now());
    store.update_message(&MessageInfo::Assistant(assistant.clone())).await?;
    store.message(session_id, &assistant.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::event::{BusEvent, EventBus};
    use corvid_storage::InMemoryStorage;
    use std::sync::Arc;

    #[test]
    fn invocation_depends_on_shell() {
        let fish = shell_invocation(Path::new("/usr/bin/fish"), "ls");
        assert_eq!(fish, vec!["-c", "ls"]);
        let bash = shell_invocation(Path::new("/bin/bash"), "ls");
        assert_eq!(bash[..2], ["-c", "-l"]);
        assert!(bash[2].contains("source ~/.bashrc"));
        assert!(bash[2].ends_with("\nls"));
        let zsh = shell_invocation(Path::new("zsh"), "ls");
        assert!(zsh[2].contains("ZDOTDIR"));
        assert_eq!(shell_invocation(Path::new("/bin/dash"), "ls"), vec!["-c", "-l", "ls"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn records_output_as_completed_bash_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), EventBus::default(), "/work");
        let session = store.create(None, None).await.unwrap();
        let mut rx = store.bus().subscribe();

        let result = run(
            &store,
            &ShellInput::new(&session.id, "echo shell-ok"),
            "build",
            &ModelRef::new("p", "m"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let assistant = result.info.as_assistant().unwrap();
        assert_eq!(assistant.model_id, "");
        assert!(assistant.time.completed.is_some());
        let tool = result.parts[0].as_tool().unwrap();
        assert_eq!(tool.tool, "bash");
        match &tool.state {
            ToolState::Completed { output, title, .. } => {
                assert!(output.contains("shell-ok"));
                assert!(title.is_empty());
            }
            other => panic!("Expected completed, got {}", other.status()),
        }

        let messages = store.messages(&session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].parts[0].as_text().is_some_and(|t| t.synthetic));

        let mut saw_running = false;
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::PartUpdated { part, .. } = event.as_ref() {
                saw_running |= part.as_tool().is_some_and(|t| t.state.is_running());
            }
        }
        assert!(saw_running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), EventBus::default(), "/work");
        let session = store.create(None, None).await.unwrap();
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = run(
            &store,
            &ShellInput::new(&session.id, "sleep 30"),
            "build",
            &ModelRef::new("p", "m"),
            dir.path(),
            &abort,
        )
        .await
        .unwrap();
        match &result.parts[0].as_tool().unwrap().state {
            ToolState::Error { error, .. } => assert_eq!(error, ABORTED),
            other => panic!("Expected error, got {}", other.status()),
        }
        assert!(result.info.as_assistant().unwrap().error.as_ref().is_some_and(|e| e.is_aborted()));
    }
}
