//! Prompt input and its materialization into a user message.
//!
//! Attached files are resolved up front: plain-text files and directories are
//! read through the built-in `read` and `list` tools so the model sees their
//! content as if it had called those tools itself, and other local files are
//! inlined as `data:` URLs.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use corvid_core::error::Error;
use corvid_core::hooks::Hooks;
use corvid_core::id::{IdKind, ascending};
use corvid_core::message::{AgentPart, FilePart, MessageInfo, MessageTime, Part, PartKind, UserMessage, WithParts};
use corvid_core::provider::ModelRef;
use corvid_core::tool::{ToolContext, ToolRegistry};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DIRECTORY_MIME: &str = "application/x-directory";
pub const TEXT_MIME: &str = "text/plain";

/// One part of a prompt as the caller supplies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartInput {
    Text {
        text: String,
        #[serde(default)]
        synthetic: bool,
    },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Agent {
        name: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptInput {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Replaces the agent's prompt in the system message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Per-prompt tool overrides, id or glob to enabled.
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,
    pub parts: Vec<PartInput>,
}

impl PromptInput {
    pub fn text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            parts: vec![PartInput::Text {
                text: text.into(),
                synthetic: false,
            }],
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: ModelRef) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_part(mut self, part: PartInput) -> Self {
        self.parts.push(part);
        self
    }

    /// Attach a local file or directory by path.
    pub fn with_file(self, path: &std::path::Path) -> Self {
        let mime = if path.is_dir() { DIRECTORY_MIME } else { mime_for(path) };
        self.with_part(PartInput::File {
            mime: mime.to_string(),
            url: format!("file://{}", path.display()),
            filename: path.file_name().map(|n| n.to_string_lossy().to_string()),
        })
    }
}

/// A best guess at a local file's mime type from its extension.
pub fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        _ => TEXT_MIME,
    }
}

/// A `file://` URL split into its path and optional `start`/`end` line range.
#[derive(Debug, PartialEq)]
struct FileUrl {
    path: String,
    start: Option<usize>,
    end: Option<usize>,
}

fn parse_file_url(url: &str) -> Option<FileUrl> {
    let rest = url.strip_prefix("file://")?;
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    let mut parsed = FileUrl {
        path: path.replace("%20", " "),
        start: None,
        end: None,
    };
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("start", v)) => parsed.start = v.parse().ok(),
            Some(("end", v)) => parsed.end = v.parse().ok(),
            _ => {}
        }
    }
    Some(parsed)
}

/// Turns a [`PromptInput`] into the user message that will be persisted.
pub struct Materializer<'a> {
    pub tools: &'a ToolRegistry,
    pub hooks: &'a Hooks,
}

impl Materializer<'_> {
    pub async fn materialize(&self, input: &PromptInput, agent: &str, model: &ModelRef) -> Result<WithParts, Error> {
        let message_id = input
            .message_id
            .clone()
            .unwrap_or_else(|| ascending(IdKind::Message));
        let sid = input.session_id.as_str();
        let mut parts = Vec::new();

        for part in &input.parts {
            match part {
                PartInput::Text { text, synthetic } => {
                    parts.push(if *synthetic {
                        Part::synthetic(sid, &message_id, text.clone())
                    } else {
                        Part::text(sid, &message_id, text.clone())
                    });
                }
                PartInput::Agent { name } => {
                    parts.push(Part::new(sid, &message_id, PartKind::Agent(AgentPart { name: name.clone() })));
                    parts.push(Part::synthetic(
                        sid,
                        &message_id,
                        format!(
                            "Use the above message and context to generate a prompt and call the task tool with subagent: {name}"
                        ),
                    ));
                }
                PartInput::File { mime, url, filename } => {
                    let file = FilePart {
                        mime: mime.clone(),
                        filename: filename.clone(),
                        url: url.clone(),
                    };
                    parts.extend(self.file(sid, &message_id, agent, file).await?);
                }
            }
        }

        let mut message = WithParts {
            info: MessageInfo::User(UserMessage {
                id: message_id,
                session_id: input.session_id.clone(),
                time: MessageTime::now(),
                agent: agent.to_string(),
                model: model.clone(),
            }),
            parts,
        };
        self.hooks.chat_message(sid, &mut message);
        debug!(session_id = sid, parts = message.parts.len(), "Materialized user message");
        Ok(message)
    }

    async fn file(&self, sid: &str, message_id: &str, agent: &str, file: FilePart) -> Result<Vec<Part>, Error> {
        let Some(url) = parse_file_url(&file.url) else {
            return Ok(vec![Part::new(sid, message_id, PartKind::File(file))]);
        };

        if file.mime == TEXT_MIME || file.mime == DIRECTORY_MIME {
            let (tool, args) = if file.mime == DIRECTORY_MIME {
                ("list", serde_json::json!({ "path": url.path }))
            } else {
                let mut args = serde_json::json!({ "filePath": url.path });
                if let Some(start) = url.start {
                    let offset = start.saturating_sub(1);
                    args["offset"] = offset.into();
                    if let Some(end) = url.end {
                        args["limit"] = end.saturating_sub(offset).into();
                    }
                }
                ("read", args)
            };
            return Ok(self.call_tool(sid, message_id, agent, tool, args, file).await);
        }

        match tokio::fs::read(&url.path).await {
            Ok(bytes) => {
                let inlined = FilePart {
                    url: format!("data:{};base64,{}", file.mime, STANDARD.encode(bytes)),
                    ..file
                };
                Ok(vec![Part::new(sid, message_id, PartKind::File(inlined))])
            }
            Err(e) => {
                warn!(path = %url.path, error = %e, "Failed to inline attachment");
                Ok(vec![Part::synthetic(
                    sid,
                    message_id,
                    format!("Failed to read {}: {e}", url.path),
                )])
            }
        }
    }

    async fn call_tool(
        &self,
        sid: &str,
        message_id: &str,
        agent: &str,
        tool_id: &str,
        args: serde_json::Value,
        file: FilePart,
    ) -> Vec<Part> {
        let tool_name = if tool_id == "read" { "Read" } else { "List" };
        let mut parts = vec![Part::synthetic(
            sid,
            message_id,
            format!("Called the {tool_name} tool with the following input: {args}"),
        )];

        let Some(tool) = self.tools.get(tool_id) else {
            warn!(tool = tool_id, "Attachment tool is not registered");
            return parts;
        };
        let ctx = ToolContext::new(sid, message_id, ascending(IdKind::Call), agent, CancellationToken::new());
        match tool.execute(args, &ctx).await {
            Ok(output) => {
                parts.push(Part::synthetic(sid, message_id, output.output));
                parts.push(Part::new(sid, message_id, PartKind::File(file)));
            }
            Err(e) => {
                warn!(tool = tool_id, error = %e, "Attachment could not be read");
                parts.push(Part::synthetic(
                    sid,
                    message_id,
                    format!("{tool_name} tool failed with the following error: {e}"),
                ));
            }
        }
        parts
    }
}
