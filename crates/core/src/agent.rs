//! Agent definitions: which prompt, model, tools and permissions a turn runs with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::provider::ModelRef;

/// What to do when a tool wants to perform a guarded action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Allow,
    Ask,
    Deny,
}

/// Per-agent permission table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPermission {
    #[serde(default)]
    pub edit: Permission,
    /// Command pattern → permission. Matched with the wildcard rules.
    #[serde(default = "default_bash")]
    pub bash: BTreeMap<String, Permission>,
    #[serde(default)]
    pub webfetch: Permission,
}

fn default_bash() -> BTreeMap<String, Permission> {
    BTreeMap::from([("*".to_string(), Permission::Allow)])
}

impl Default for AgentPermission {
    fn default() -> Self {
        Self {
            edit: Permission::Allow,
            bash: default_bash(),
            webfetch: Permission::Allow,
        }
    }
}

impl AgentPermission {
    /// True when the only bash rule is `"*": deny`.
    pub fn denies_all_bash(&self) -> bool {
        self.bash.len() == 1 && self.bash.get("*") == Some(&Permission::Deny)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Primary,
    Subagent,
    All,
}

/// A named agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Tool id or glob → enabled.
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,
    #[serde(default)]
    pub permission: AgentPermission,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            mode: AgentMode::Primary,
            prompt: None,
            model: None,
            temperature: None,
            top_p: None,
            tools: BTreeMap::new(),
            permission: AgentPermission::default(),
            options: serde_json::Map::new(),
        }
    }
}

/// The agents every installation has before configuration is applied.
pub fn builtin_agents() -> Vec<AgentInfo> {
    let build = AgentInfo {
        description: "Default agent with full tool access".into(),
        ..AgentInfo::new("build")
    };

    let plan = AgentInfo {
        description: "Read-only planning agent; edits are denied and commands need approval".into(),
        permission: AgentPermission {
            edit: Permission::Deny,
            bash: BTreeMap::from([("*".to_string(), Permission::Ask)]),
            webfetch: Permission::Allow,
        },
        ..AgentInfo::new("plan")
    };

    let general = AgentInfo {
        description: "General-purpose sub-agent for multi-step research and execution".into(),
        mode: AgentMode::Subagent,
        tools: BTreeMap::from([("task".to_string(), false)]),
        ..AgentInfo::new("general")
    };

    vec![build, plan, general]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_permission_allows_everything() {
        let p = AgentPermission::default();
        assert_eq!(p.edit, Permission::Allow);
        assert!(!p.denies_all_bash());
    }

    #[test]
    fn deny_all_bash_requires_single_star_rule() {
        let mut p = AgentPermission {
            bash: BTreeMap::from([("*".to_string(), Permission::Deny)]),
            ..Default::default()
        };
        assert!(p.denies_all_bash());
        p.bash.insert("git status".into(), Permission::Allow);
        assert!(!p.denies_all_bash());
    }

    #[test]
    fn builtin_agents_present() {
        let agents = builtin_agents();
        let names: Vec<_> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["build", "plan", "general"]);
        assert_eq!(agents[1].permission.edit, Permission::Deny);
        assert_eq!(agents[2].tools.get("task"), Some(&false));
    }
}
