//! `corvid run`, `corvid command` and `corvid shell`.

use std::future::Future;
use std::path::PathBuf;

use corvid_core::event::BusEvent;
use corvid_core::message::{PartKind, ToolState, WithParts};
use corvid_core::provider::ModelRef;
use corvid_core::session::Session;
use corvid_session::{CommandInput, PromptInput, SessionPrompt, ShellInput};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::engine::{self, Options};
use crate::render;

pub struct RunArgs {
    pub message: String,
    pub session: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub files: Vec<PathBuf>,
}

pub(crate) fn parse_model(model: Option<String>) -> anyhow::Result<Option<ModelRef>> {
    model
        .map(|m| ModelRef::parse(&m).ok_or_else(|| anyhow::anyhow!("Model must be provider/model, got {m}")))
        .transpose()
}

async fn open_session(prompt: &SessionPrompt, id: Option<String>) -> anyhow::Result<Session> {
    let session = match id {
        Some(id) => prompt.store().get(&id).await?,
        None => prompt.store().create(None, None).await?,
    };
    eprintln!("session {}", session.id);
    Ok(session)
}

/// Print finished tool calls to stderr while the turn runs.
fn spawn_progress(prompt: &SessionPrompt, session_id: String) -> tokio::task::JoinHandle<()> {
    let mut rx = prompt.store().bus().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let BusEvent::PartUpdated { part, .. } = event.as_ref()
                        && part.session_id == session_id
                        && let PartKind::Tool(tool) = &part.kind
                        && !matches!(tool.state, ToolState::Pending { .. } | ToolState::Running { .. })
                    {
                        eprintln!("[{}] {}", tool.tool, tool.state.status());
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Progress display fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Drive one turn to completion, aborting it on Ctrl-C.
async fn drive<F>(prompt: &SessionPrompt, session_id: &str, turn: F, show: fn(&WithParts) -> String) -> anyhow::Result<()>
where
    F: Future<Output = Result<WithParts, corvid_core::error::Error>>,
{
    let progress = spawn_progress(prompt, session_id.to_string());
    let result = tokio::select! {
        result = turn => result,
        _ = tokio::signal::ctrl_c() => {
            info!(session_id, "Interrupted, aborting");
            prompt.abort(session_id);
            progress.abort();
            anyhow::bail!("Interrupted");
        }
    };
    progress.abort();

    let message = result?;
    let body = show(&message);
    if !body.is_empty() {
        println!("{body}");
    }
    if let Some(error) = render::error(&message) {
        anyhow::bail!("{error}");
    }
    Ok(())
}

pub async fn run(options: &Options, args: RunArgs) -> anyhow::Result<()> {
    let prompt = engine::build(options)?;
    let session = open_session(&prompt, args.session).await?;

    let mut input = PromptInput::text(&session.id, args.message);
    input.agent = args.agent;
    input.model = parse_model(args.model)?;
    for file in &args.files {
        let path = if file.is_absolute() { file.clone() } else { prompt.cwd().join(file) };
        if !path.exists() {
            anyhow::bail!("No such file: {}", file.display());
        }
        input = input.with_file(&path);
    }

    drive(&prompt, &session.id, prompt.prompt(input), render::message).await
}

pub async fn command(options: &Options, name: String, arguments: String, session: Option<String>) -> anyhow::Result<()> {
    let prompt = engine::build(options)?;
    let session = open_session(&prompt, session).await?;
    let input = CommandInput {
        session_id: session.id.clone(),
        command: name,
        arguments,
        ..Default::default()
    };
    drive(&prompt, &session.id, prompt.command(input), render::message).await
}

pub async fn shell(options: &Options, command: String, session: Option<String>) -> anyhow::Result<()> {
    let prompt = engine::build(options)?;
    let session = open_session(&prompt, session).await?;
    let input = ShellInput::new(&session.id, command);
    drive(&prompt, &session.id, prompt.shell(input), render::tool_output).await
}
