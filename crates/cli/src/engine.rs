//! Wiring of the session engine from configuration and CLI flags.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use corvid_config::AppConfig;
use corvid_core::event::EventBus;
use corvid_core::provider::{ModelRef, ProviderRegistry};
use corvid_core::storage::Storage;
use corvid_providers::{ConfigRegistry, ScriptedModel};
use corvid_security::{AuditLogger, AutoReply, PathPolicy, PermissionGate};
use corvid_session::{SessionPrompt, SessionStore, ToolPipeline};
use corvid_storage::{FileStorage, InMemoryStorage};
use corvid_tools::ToolEnv;
use tracing::{debug, info};

/// Global flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub yes: bool,
    pub scripted: Option<PathBuf>,
}

impl Options {
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load_from(path),
            None => AppConfig::load(),
        }
        .context("Failed to load config")?;
        if self.scripted.is_some() {
            // A title request would consume a scripted step.
            config.session.auto_title = false;
        }
        Ok(config)
    }
}

fn storage(config: &AppConfig) -> Arc<dyn Storage> {
    match config.storage.backend.as_str() {
        "memory" => Arc::new(InMemoryStorage::new()),
        _ => {
            let root = config.storage.path.clone().unwrap_or_else(FileStorage::default_path);
            debug!(root = %root.display(), "Using file storage");
            Arc::new(FileStorage::new(root))
        }
    }
}

fn providers(config: &AppConfig, scripted: Option<&PathBuf>) -> anyhow::Result<Arc<dyn ProviderRegistry>> {
    let registry = ConfigRegistry::from_config(config);
    let Some(path) = scripted else {
        return Ok(Arc::new(registry));
    };
    let model = ScriptedModel::from_file(path).with_context(|| format!("Failed to load script {}", path.display()))?;
    let target = config
        .default_model()
        .unwrap_or_else(|| ModelRef::new("scripted", "model"));
    info!(model = %target, script = %path.display(), "Serving the default model from a script");
    Ok(Arc::new(
        registry
            .with_model(model.resolved(&target.provider_id, &target.model_id))
            .with_default(target),
    ))
}

/// Build a [`SessionPrompt`] rooted at the current directory.
pub fn build(options: &Options) -> anyhow::Result<SessionPrompt> {
    let config = options.load_config()?;
    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let store = SessionStore::new(storage(&config), EventBus::default(), cwd.display().to_string());

    let audit = Arc::new(AuditLogger::traced());
    let gate = PermissionGate::new(store.bus().clone())
        .with_auto_reply(if options.yes { AutoReply::Approve } else { AutoReply::Reject })
        .with_audit(audit.clone());
    let env = Arc::new(
        ToolEnv::new(
            &cwd,
            PathPolicy::new(
                config.security.allowed_roots.clone(),
                config.security.forbidden_paths.clone(),
            ),
            Arc::new(gate),
        )
        .with_audit(audit),
    );
    let pipeline =
        ToolPipeline::new(corvid_tools::default_registry(env, &config.agents())).with_global(config.tools.clone());
    let providers = providers(&config, options.scripted.as_ref())?;

    Ok(SessionPrompt::new(store, providers, pipeline, Arc::new(config), cwd))
}
