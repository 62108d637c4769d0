//! System prompt assembly and the fixed prompts of side generations.

use std::path::{Path, PathBuf};

use chrono::Local;
use corvid_core::agent::AgentInfo;
use corvid_core::provider::ModelInfo;
use tracing::debug;

const HEADER: &str = "You are corvid, an interactive agent that helps users with software engineering tasks \
in their workspace. Use the tools available to you to inspect and change code.";

const DEFAULT_PROMPT: &str = "\
Be concise and direct. Answer in plain text; your output is shown in a terminal.

- Read files before you change them and keep changes minimal and in the style of the surrounding code.
- Prefer the dedicated file tools over shell commands for reading, writing and searching.
- Run the project's own tests or checks after a change when they exist.
- Never commit, push or delete data unless the user asks you to.
- When a task has several independent parts, call the tools for them in the same step.";

const COMPACT_PROMPT: &str = "\
Be extremely concise. Skip preamble. Use tools whenever they help, calling several at once when the calls are independent.
Keep working until the request is fully handled, then stop.";

pub const SUMMARIZE_PROMPT: &str = "\
You are a helpful AI assistant tasked with summarizing conversations.

When asked to summarize, provide a detailed but concise summary of the conversation. Focus on information \
that would be helpful for continuing the conversation, including:
- What was done
- What is currently being worked on
- Which files are being modified
- What needs to be done next

Your summary should be comprehensive enough to provide context but concise enough to be quickly understood.";

pub const SUMMARIZE_INSTRUCTION: &str = "Provide a detailed but concise summary of our conversation above. \
Focus on information that would be helpful for continuing the conversation, including what we did, what we're \
doing, which files we're working on, and what we're going to do next.";

pub const TITLE_PROMPT: &str = "\
You are a title generator. You output ONLY a thread title. Nothing else.

Generate a brief title that would help the user find this conversation later.
- A single line of at most 50 characters
- The same language as the user message
- No explanations, quotes or trailing punctuation
- Focus on the main topic or question, keeping technical terms and file names exact";

/// The provider-flavoured default prompt for `model`.
pub fn default_prompt(model: &ModelInfo) -> &'static str {
    let id = model.id.to_ascii_lowercase();
    if id.starts_with("gpt-") || id.starts_with("o1") || id.starts_with("o3") || id.starts_with("o4") {
        COMPACT_PROMPT
    } else {
        DEFAULT_PROMPT
    }
}

fn is_git_repo(cwd: &Path) -> bool {
    cwd.ancestors().any(|dir| dir.join(".git").exists())
}

/// The `<env>` block describing where the agent runs.
pub fn environment(cwd: &Path) -> String {
    format!(
        "Here is some useful information about the environment you are running in:\n\
         <env>\n  \
         Working directory: {}\n  \
         Is directory a git repo: {}\n  \
         Platform: {}\n  \
         Today's date: {}\n\
         </env>",
        cwd.display(),
        if is_git_repo(cwd) { "yes" } else { "no" },
        std::env::consts::OS,
        Local::now().format("%a %b %d %Y"),
    )
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// `AGENTS.md` in the working directory plus configured instruction files.
pub async fn custom_instructions(cwd: &Path, instructions: &[String]) -> Vec<String> {
    let mut paths = vec![cwd.join("AGENTS.md")];
    for entry in instructions {
        let path = expand_home(entry);
        paths.push(if path.is_absolute() { path } else { cwd.join(path) });
    }

    let mut found = Vec::new();
    for path in paths {
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            debug!(path = %path.display(), "Loaded instructions");
            found.push(format!("Instructions from: {}\n{content}", path.display()));
        }
    }
    found
}

/// Build the system messages for one turn, at most two of them.
///
/// The first holds the header so providers that cache prompt prefixes see a
/// stable start; everything else is folded into the second.
pub async fn assemble(
    override_prompt: Option<&str>,
    agent: &AgentInfo,
    model: &ModelInfo,
    cwd: &Path,
    instructions: &[String],
) -> Vec<String> {
    let main = override_prompt
        .or(agent.prompt.as_deref())
        .unwrap_or_else(|| default_prompt(model));
    let mut body = vec![main.to_string(), environment(cwd)];
    body.extend(custom_instructions(cwd, instructions).await);
    vec![HEADER.to_string(), body.join("\n\n")]
}

/// System messages for a summarization run.
pub async fn summarize(cwd: &Path, instructions: &[String]) -> Vec<String> {
    let mut body = vec![environment(cwd)];
    body.extend(custom_instructions(cwd, instructions).await);
    vec![SUMMARIZE_PROMPT.to_string(), body.join("\n\n")]
}
