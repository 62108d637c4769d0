//! Named command templates expanded into prompts.
//!
//! A template may use `$1..$n` for positional arguments, `$ARGUMENTS` for
//! the whole argument string, `` !`cmd` `` for shell output and `@path` to
//! attach files, directories or agents.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use corvid_config::CommandConfig;
use corvid_core::agent::AgentInfo;
use corvid_core::provider::ModelRef;
use corvid_tools::process::{run_streaming, shell_command};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::input::{PartInput, PromptInput};

const SHELL_TIMEOUT: Duration = Duration::from_secs(60);

static ARGUMENT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r#"(?:[^\s"']+|"[^"]*"|'[^']*')+"#).ok());
static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\$(\d+)").ok());
static SHELL_SUBST: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"!`([^`]+)`").ok());
static FILE_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w`])@(\.?[^\s`,.]*(?:\.[^\s`,.]+)*)").ok());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandInput {
    pub session_id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

/// Split an argument string on whitespace, keeping quoted runs together.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let Some(re) = ARGUMENT.as_ref() else {
        return arguments.split_whitespace().map(String::from).collect();
    };
    re.find_iter(arguments)
        .map(|m| m.as_str().replace(['"', '\''], ""))
        .collect()
}

/// Substitute `$N` placeholders and `$ARGUMENTS`.
///
/// The highest-numbered placeholder takes every remaining argument.
pub fn expand_placeholders(template: &str, arguments: &str) -> String {
    let args = split_arguments(arguments);
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.replace("$ARGUMENTS", arguments);
    };
    let last = re
        .captures_iter(template)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .max()
        .unwrap_or(0);

    let expanded = re.replace_all(template, |caps: &regex_lite::Captures<'_>| {
        let n: usize = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let index = n.saturating_sub(1);
        if n == 0 || index >= args.len() {
            String::new()
        } else if n == last {
            args[index..].join(" ")
        } else {
            args[index].clone()
        }
    });
    expanded.replace("$ARGUMENTS", arguments)
}

/// Replace every `` !`cmd` `` with the command's output, run in `cwd`.
pub async fn substitute_shell(text: &str, cwd: &Path, abort: &CancellationToken) -> String {
    let Some(re) = SHELL_SUBST.as_ref() else {
        return text.to_string();
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(cmd)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        let mut command = shell_command(cmd.as_str());
        command.current_dir(cwd);
        match run_streaming(command, Some(SHELL_TIMEOUT), abort, |_| {}).await {
            Ok(outcome) => out.push_str(&outcome.output),
            Err(error) => {
                warn!(command = cmd.as_str(), error = %error, "Template shell substitution failed");
                out.push_str(&format!("Error executing command: {error}"));
            }
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    out
}

fn resolve_ref(reference: &str, cwd: &Path) -> PathBuf {
    match (reference.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => cwd.join(reference),
    }
}

/// Parts for the `@` references in `text`: files, directories or agents.
pub fn references(text: &str, cwd: &Path, agents: &[AgentInfo]) -> Vec<PartInput> {
    let Some(re) = FILE_REF.as_ref() else {
        return Vec::new();
    };
    let mut parts: Vec<PartInput> = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(name) = caps.get(1).map(|m| m.as_str()).filter(|n| !n.is_empty()) else {
            continue;
        };
        let path = resolve_ref(name, cwd);
        let part = if path.exists() {
            PromptInput::default().with_file(&path).parts.pop()
        } else if agents.iter().any(|a| a.name == name) {
            Some(PartInput::Agent { name: name.to_string() })
        } else {
            debug!(reference = name, "Unresolved @ reference");
            None
        };
        if let Some(part) = part
            && !parts.contains(&part)
        {
            parts.push(part);
        }
    }
    parts
}

/// Expand `config` with `input` into a prompt.
///
/// The input's agent and model win over the command's own.
pub async fn expand(
    config: &CommandConfig,
    input: &CommandInput,
    cwd: &Path,
    agents: &[AgentInfo],
    abort: &CancellationToken,
) -> PromptInput {
    let text = expand_placeholders(&config.template, &input.arguments);
    let text = substitute_shell(&text, cwd, abort).await;
    let text = text.trim().to_string();

    let mut prompt = PromptInput::text(&input.session_id, &text);
    prompt.message_id = input.message_id.clone();
    prompt.agent = input.agent.clone().or_else(|| config.agent.clone());
    prompt.model = input
        .model
        .clone()
        .or_else(|| config.model.as_deref().and_then(ModelRef::parse));
    prompt.parts.extend(references(&text, cwd, agents));
    debug!(command = %input.command, parts = prompt.parts.len(), "Expanded command");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{DIRECTORY_MIME, TEXT_MIME};

    #[test]
    fn arguments_respect_quotes() {
        assert_eq!(
            split_arguments(r#"one "two words" 'three more' four"#),
            vec!["one", "two words", "three more", "four"]
        );
        assert!(split_arguments("   ").is_empty());
    }

    #[test]
    fn last_placeholder_swallows_the_rest() {
        assert_eq!(
            expand_placeholders("Fix $1 in $2", "bug src/a.rs src/b.rs"),
            "Fix bug in src/a.rs src/b.rs"
        );
        assert_eq!(expand_placeholders("Need $1 and $3", "a"), "Need a and ");
        assert_eq!(expand_placeholders("All: $ARGUMENTS", "x  y"), "All: x  y");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_output_is_spliced_in() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let text = substitute_shell("Files: !`ls` end", dir.path(), &CancellationToken::new()).await;
        assert_eq!(text, "Files: marker.txt\n end");
    }

    #[test]
    fn references_resolve_files_directories_and_agents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let agents = vec![AgentInfo::new("general")];

        let parts = references(
            "Read @notes.md and @src, ask @general, skip @missing and a@b.c",
            dir.path(),
            &agents,
        );
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], PartInput::File { mime, .. } if mime == TEXT_MIME));
        assert!(matches!(&parts[1], PartInput::File { mime, .. } if mime == DIRECTORY_MIME));
        assert_eq!(parts[2], PartInput::Agent { name: "general".into() });
    }

    #[tokio::test]
    async fn input_overrides_command_agent_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = CommandConfig {
            template: "Review $ARGUMENTS".into(),
            description: String::new(),
            agent: Some("plan".into()),
            model: Some("p/cheap".into()),
        };
        let input = CommandInput {
            session_id: "ses_1".into(),
            command: "review".into(),
            arguments: "the diff".into(),
            agent: Some("build".into()),
            ..Default::default()
        };
        let prompt = expand(&config, &input, dir.path(), &[], &CancellationToken::new()).await;
        assert_eq!(prompt.agent.as_deref(), Some("build"));
        assert_eq!(prompt.model, Some(ModelRef::new("p", "cheap")));
        assert_eq!(
            prompt.parts[0],
            PartInput::Text {
                text: "Review the diff".into(),
                synthetic: false
            }
        );
    }
}
