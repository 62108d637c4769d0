//! Plain-text rendering of messages for the terminal.

use corvid_core::message::{MessageInfo, PartKind, ToolState, WithParts};
use corvid_core::session::Session;

/// One line per tool call: `[tool] title (status)`.
fn tool_line(tool: &str, state: &ToolState) -> String {
    let title = match state {
        ToolState::Completed { title, .. } if !title.is_empty() => title.clone(),
        ToolState::Running { title: Some(title), .. } => title.clone(),
        ToolState::Error { error, .. } => error.clone(),
        _ => String::new(),
    };
    if title.is_empty() {
        format!("[{tool}] ({})", state.status())
    } else {
        format!("[{tool}] {title} ({})", state.status())
    }
}

/// Render a message's visible content. Synthetic text is left out.
pub fn message(message: &WithParts) -> String {
    let mut out = Vec::new();
    for part in &message.parts {
        match &part.kind {
            PartKind::Text(text) if !text.synthetic && !text.text.trim().is_empty() => {
                out.push(text.text.trim_end().to_string())
            }
            PartKind::Tool(tool) => out.push(tool_line(&tool.tool, &tool.state)),
            PartKind::File(file) => out.push(format!(
                "[file] {}",
                file.filename.as_deref().unwrap_or(file.url.as_str())
            )),
            PartKind::Agent(agent) => out.push(format!("[agent] @{}", agent.name)),
            _ => {}
        }
    }
    out.join("\n")
}

/// The raw output of every tool call in the message.
pub fn tool_output(message: &WithParts) -> String {
    message
        .parts
        .iter()
        .filter_map(|p| p.as_tool())
        .filter_map(|tool| match &tool.state {
            ToolState::Completed { output, .. } => Some(output.trim_end().to_string()),
            ToolState::Error { metadata: Some(metadata), .. } => metadata
                .get("output")
                .and_then(|o| o.as_str())
                .map(|o| o.trim_end().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Header line for `messages`: role, agent and model.
pub fn header(message: &WithParts) -> String {
    match &message.info {
        MessageInfo::User(user) => format!("── user ({}) ──", user.agent),
        MessageInfo::Assistant(assistant) => {
            let model = if assistant.model_id.is_empty() {
                assistant.provider_id.clone()
            } else {
                format!("{}/{}", assistant.provider_id, assistant.model_id)
            };
            let kind = if assistant.summary { "summary" } else { "assistant" };
            format!("── {kind} ({}, {model}) ──", assistant.mode)
        }
    }
}

/// The error an assistant message ended with, if any.
pub fn error(message: &WithParts) -> Option<String> {
    message
        .info
        .as_assistant()
        .and_then(|a| a.error.as_ref())
        .map(|e| e.to_string())
}

pub fn session_line(session: &Session) -> String {
    format!(
        "{}  {}  {}",
        session.id,
        session.time.updated.format("%Y-%m-%d %H:%M"),
        session.title
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::message::{Part, ToolPart, ToolTime};
    use serde_json::json;

    #[test]
    fn renders_tool_calls_with_status() {
        let state = ToolState::Completed {
            input: json!({}),
            output: "ok".into(),
            title: "src/main.rs".into(),
            metadata: json!({}),
            time: ToolTime {
                start: chrono::Utc::now(),
                end: None,
                compacted: None,
            },
        };
        assert_eq!(tool_line("read", &state), "[read] src/main.rs (completed)");
        let pending = ToolState::Pending {
            input: json!({}),
            raw: String::new(),
        };
        assert_eq!(tool_line("bash", &pending), "[bash] (pending)");
    }

    #[test]
    fn hides_synthetic_text() {
        let msg = WithParts {
            info: MessageInfo::User(corvid_core::message::UserMessage {
                id: "m".into(),
                session_id: "s".into(),
                time: corvid_core::message::MessageTime::now(),
                agent: "build".into(),
                model: corvid_core::provider::ModelRef::new("p", "m"),
            }),
            parts: vec![
                Part::text("s", "m", "hello"),
                Part::synthetic("s", "m", "hidden"),
                Part::new(
                    "s",
                    "m",
                    PartKind::Tool(ToolPart {
                        call_id: "c".into(),
                        tool: "list".into(),
                        state: ToolState::Pending {
                            input: json!({}),
                            raw: String::new(),
                        },
                    }),
                ),
            ],
        };
        assert_eq!(message(&msg), "hello\n[list] (pending)");
        assert_eq!(header(&msg), "── user (build) ──");
    }
}
