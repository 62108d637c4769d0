//! Extension hooks.
//!
//! Hooks are synchronous middleware invoked in registration order at named
//! points of a turn. They may rewrite the value they are handed; tool hooks
//! may also veto the call. A [`Hooks`] list is passed explicitly to whatever
//! runs the extension point.

use std::sync::Arc;

use crate::error::ToolError;
use crate::message::WithParts;
use crate::provider::ModelInfo;
use crate::tool::ToolOutput;

/// Sampling parameters a hook may rewrite before a model call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatContext<'a> {
    pub session_id: &'a str,
    pub agent: &'a str,
    pub model: &'a ModelInfo,
}

#[derive(Debug, Clone)]
pub struct ToolHookContext {
    pub tool: String,
    pub session_id: String,
    pub call_id: String,
}

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// `chat.params`
    fn chat_params(&self, _ctx: &ChatContext<'_>, _params: &mut ChatParams) {}

    /// `chat.message`: runs over a freshly materialized user message.
    fn chat_message(&self, _session_id: &str, _message: &mut WithParts) {}

    /// `tool.execute.before`. Returning `Err(reason)` vetoes the call.
    fn tool_before(&self, _ctx: &ToolHookContext, _args: &mut serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    /// `tool.execute.after`
    fn tool_after(&self, _ctx: &ToolHookContext, _output: &mut ToolOutput) {}
}

/// An ordered list of hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn Hook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn chat_params(&self, ctx: &ChatContext<'_>, params: &mut ChatParams) {
        for hook in &self.hooks {
            hook.chat_params(ctx, params);
        }
    }

    pub fn chat_message(&self, session_id: &str, message: &mut WithParts) {
        for hook in &self.hooks {
            hook.chat_message(session_id, message);
        }
    }

    /// Stops at the first veto.
    pub fn tool_before(&self, ctx: &ToolHookContext, args: &mut serde_json::Value) -> Result<(), ToolError> {
        for hook in &self.hooks {
            hook.tool_before(ctx, args).map_err(|reason| ToolError::Vetoed {
                hook: hook.name().to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    pub fn tool_after(&self, ctx: &ToolHookContext, output: &mut ToolOutput) {
        for hook in &self.hooks {
            hook.tool_after(ctx, output);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|h| h.name()).collect();
        f.debug_struct("Hooks").field("hooks", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag(&'static str);

    impl Hook for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn tool_before(&self, _ctx: &ToolHookContext, args: &mut serde_json::Value) -> Result<(), String> {
            if args.get("forbidden").is_some() {
                return Err("forbidden argument".into());
            }
            let trail = args["trail"].as_str().unwrap_or("").to_string();
            args["trail"] = serde_json::json!(format!("{trail}{}", self.0));
            Ok(())
        }

        fn tool_after(&self, _ctx: &ToolHookContext, output: &mut ToolOutput) {
            output.output.push_str(self.0);
        }
    }

    fn ctx() -> ToolHookContext {
        ToolHookContext {
            tool: "bash".into(),
            session_id: "ses_1".into(),
            call_id: "call_1".into(),
        }
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let mut hooks = Hooks::new();
        hooks.register(Arc::new(Tag("a")));
        hooks.register(Arc::new(Tag("b")));

        let mut args = serde_json::json!({});
        hooks.tool_before(&ctx(), &mut args).unwrap();
        assert_eq!(args["trail"], "ab");

        let mut out = ToolOutput::new("t", "");
        hooks.tool_after(&ctx(), &mut out);
        assert_eq!(out.output, "ab");
    }

    #[test]
    fn veto_names_the_hook() {
        let mut hooks = Hooks::new();
        hooks.register(Arc::new(Tag("guard")));
        let mut args = serde_json::json!({"forbidden": true});
        let err = hooks.tool_before(&ctx(), &mut args).unwrap_err();
        match err {
            ToolError::Vetoed { hook, reason } => {
                assert_eq!(hook, "guard");
                assert_eq!(reason, "forbidden argument");
            }
            other => panic!("Expected Vetoed, got: {other}"),
        }
    }
}
