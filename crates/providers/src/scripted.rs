//! Scripted model: replays a fixed sequence of steps.
//!
//! Each call to `stream` consumes the next [`ScriptStep`]. Used by tests and
//! by the CLI's `--scripted` flag for offline runs. Once the script is
//! exhausted every further step finishes immediately with no output.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corvid_core::error::ProviderError;
use corvid_core::provider::{
    FinishReason, LanguageModel, ModelEvent, ModelInfo, ModelLimit, ModelRequest, ModelStream, ResolvedModel, Usage,
};
use serde::{Deserialize, Serialize};

/// A failure to inject in place of (or partway through) a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptError {
    pub status: u16,
    pub message: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Deliver `events` first, then fail on the channel instead of at open.
    #[serde(default)]
    pub mid_stream: bool,
}

impl ScriptError {
    fn to_provider_error(&self) -> ProviderError {
        match self.status {
            401 | 403 => ProviderError::AuthenticationFailed {
                provider_id: "scripted".into(),
                message: self.message.clone(),
            },
            status => ProviderError::api(status, self.message.clone(), self.headers.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub events: Vec<ModelEvent>,
    #[serde(default)]
    pub error: Option<ScriptError>,
    /// Pause before each event.
    #[serde(default)]
    pub delay_ms: u64,
    /// Keep the stream open after the events until the receiver goes away.
    #[serde(default)]
    pub hang: bool,
}

impl ScriptStep {
    /// A step that answers with `text` and stops.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            events: vec![
                ModelEvent::TextStart { id: "t".into() },
                ModelEvent::TextDelta {
                    id: "t".into(),
                    text: text.into(),
                },
                ModelEvent::TextEnd { id: "t".into() },
                finish(FinishReason::Stop),
            ],
            ..Default::default()
        }
    }

    /// A step that calls one tool and finishes with `tool-calls`.
    pub fn tool_call(call_id: &str, tool: &str, input: serde_json::Value) -> Self {
        Self {
            events: vec![
                ModelEvent::ToolInputStart {
                    id: call_id.into(),
                    tool_name: tool.into(),
                },
                ModelEvent::ToolCall {
                    id: call_id.into(),
                    tool_name: tool.into(),
                    input: input.to_string(),
                },
                finish(FinishReason::ToolCalls),
            ],
            ..Default::default()
        }
    }

    /// A step that fails to open with `status`.
    pub fn failure(status: u16, message: &str) -> Self {
        Self {
            error: Some(ScriptError {
                status,
                message: message.into(),
                headers: BTreeMap::new(),
                mid_stream: false,
            }),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        for event in &mut self.events {
            if let ModelEvent::Finish { usage: u, .. } = event {
                *u = usage;
            }
        }
        self
    }
}

fn finish(reason: FinishReason) -> ModelEvent {
    ModelEvent::Finish {
        reason,
        usage: Usage::default(),
    }
}

#[derive(Default)]
pub struct ScriptedModel {
    steps: Mutex<std::collections::VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load a JSON array of steps.
    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::NotConfigured(format!("{}: {e}", path.display())))?;
        let steps: Vec<ScriptStep> = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::NotConfigured(format!("{}: {e}", path.display())))?;
        Ok(Self::new(steps))
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Wrap in a [`ResolvedModel`] under `provider_id/model_id`.
    pub fn resolved(self, provider_id: &str, model_id: &str) -> ResolvedModel {
        Arc::new(self).into_resolved(provider_id, model_id)
    }

    /// Like [`ScriptedModel::resolved`] but keeps a handle for inspection.
    pub fn into_resolved(self: Arc<Self>, provider_id: &str, model_id: &str) -> ResolvedModel {
        ResolvedModel {
            info: ModelInfo {
                id: model_id.into(),
                provider_id: provider_id.into(),
                limit: ModelLimit {
                    context: 128_000,
                    output: 8_192,
                },
                cost: Default::default(),
                tool_call: true,
                reasoning: false,
                temperature: true,
            },
            language: self,
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ProviderError> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push(request);
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptStep {
                events: vec![finish(FinishReason::Stop)],
                ..Default::default()
            });

        if let Some(error) = &step.error
            && !error.mid_stream
        {
            return Err(error.to_provider_error());
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            for event in step.events {
                if step.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
                }
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            if let Some(error) = &step.error {
                let _ = tx.send(Err(error.to_provider_error())).await;
                return;
            }
            if step.hang {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}
