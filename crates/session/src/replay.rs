//! Stored messages back into model-ready conversation.

use corvid_core::message::{MessageInfo, Part, PartKind, ToolState, WithParts};
use corvid_core::provider::{AssistantContent, ModelMessage, ToolResultContent, UserContent};

use crate::input::{DIRECTORY_MIME, TEXT_MIME};

pub const COMPACTION_QUESTION: &str = "What did we do so far?";
pub const CLEARED_OUTPUT: &str = "[Old tool result content cleared]";

/// The suffix of `messages` the model still needs to see.
///
/// Everything before the newest completed summary is dropped; the history
/// then starts at the user turn that asked for that summary.
pub fn since_last_summary(messages: &[WithParts]) -> &[WithParts] {
    let boundary = messages.iter().rposition(|m| {
        m.info
            .as_assistant()
            .is_some_and(|a| a.summary && a.error.is_none() && a.time.completed.is_some())
    });
    let Some(boundary) = boundary else {
        return messages;
    };
    let parent = messages[boundary].info.as_assistant().and_then(|a| a.parent_id.as_deref());
    let start = parent
        .and_then(|parent| messages[..boundary].iter().rposition(|m| m.info.id() == parent))
        .unwrap_or(boundary);
    &messages[start..]
}

/// Convert stored messages to model messages, in order.
pub fn to_model_messages(messages: &[WithParts]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for message in messages {
        match &message.info {
            MessageInfo::User(_) => {
                let content = user_content(&message.parts);
                if !content.is_empty() {
                    out.push(ModelMessage::User { content });
                }
            }
            MessageInfo::Assistant(info) => {
                if let Some(error) = &info.error {
                    let salvageable = error.is_aborted()
                        && message
                            .parts
                            .iter()
                            .any(|p| !matches!(p.kind, PartKind::StepStart(_) | PartKind::Reasoning(_)));
                    if !salvageable {
                        continue;
                    }
                }
                assistant_steps(&message.parts, &mut out);
            }
        }
    }
    out
}

fn user_content(parts: &[Part]) -> Vec<UserContent> {
    let mut content = Vec::new();
    for part in parts {
        match &part.kind {
            PartKind::Text(text) if !text.text.is_empty() => content.push(UserContent::Text {
                text: text.text.clone(),
            }),
            PartKind::File(file) if file.mime != TEXT_MIME && file.mime != DIRECTORY_MIME => {
                content.push(UserContent::File {
                    mime: file.mime.clone(),
                    url: file.url.clone(),
                    filename: file.filename.clone(),
                })
            }
            PartKind::Compaction(_) => content.push(UserContent::Text {
                text: COMPACTION_QUESTION.into(),
            }),
            _ => {}
        }
    }
    content
}

/// One assistant message per step, each followed by its tool results.
fn assistant_steps(parts: &[Part], out: &mut Vec<ModelMessage>) {
    let mut content = Vec::new();
    let mut results = Vec::new();
    let mut flush = |content: &mut Vec<AssistantContent>, results: &mut Vec<ToolResultContent>| {
        if !content.is_empty() {
            out.push(ModelMessage::Assistant {
                content: std::mem::take(content),
            });
        }
        if !results.is_empty() {
            out.push(ModelMessage::Tool {
                content: std::mem::take(results),
            });
        }
    };

    for part in parts {
        match &part.kind {
            PartKind::StepStart(_) => flush(&mut content, &mut results),
            PartKind::Text(text) if !text.text.is_empty() => content.push(AssistantContent::Text {
                text: text.text.clone(),
            }),
            PartKind::Reasoning(reasoning) if !reasoning.text.is_empty() => content.push(AssistantContent::Reasoning {
                text: reasoning.text.clone(),
            }),
            PartKind::Tool(tool) => {
                content.push(AssistantContent::ToolCall {
                    call_id: tool.call_id.clone(),
                    tool_name: tool.tool.clone(),
                    input: tool.state.input().clone(),
                });
                let (output, is_error) = match &tool.state {
                    ToolState::Completed { output, time, .. } => {
                        if time.compacted.is_some() {
                            (CLEARED_OUTPUT.to_string(), false)
                        } else {
                            (output.clone(), false)
                        }
                    }
                    ToolState::Error { error, .. } => (error.clone(), true),
                    ToolState::Pending { .. } | ToolState::Running { .. } => ("Tool execution aborted".into(), true),
                };
                results.push(ToolResultContent {
                    call_id: tool.call_id.clone(),
                    tool_name: tool.tool.clone(),
                    output,
                    is_error,
                });
            }
            _ => {}
        }
    }
    flush(&mut content, &mut results);
}
