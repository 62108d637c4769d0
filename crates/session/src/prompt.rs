//! The session prompt loop.
//!
//! [`SessionPrompt`] is the entry point of the engine. It admits prompts
//! through the per-session lock, persists user turns, keeps the context
//! within budget and drives a [`Generation`] through a [`StreamProcessor`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use corvid_config::AppConfig;
use corvid_core::agent::AgentInfo;
use corvid_core::error::{Error, ProviderError, SessionError};
use corvid_core::event::BusEvent;
use corvid_core::hooks::{ChatContext, ChatParams};
use corvid_core::message::{AssistantMessage, MessageInfo, MessagePath, UserMessage, WithParts};
use corvid_core::provider::{ModelRef, ProviderRegistry, ResolvedModel};
use corvid_core::session::is_default_title;
use corvid_core::snapshot::{NoSnapshot, Snapshot};
use corvid_core::tool::{SubagentOutput, SubagentRequest, SubagentRunner};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{self, CommandInput};
use crate::compaction::{self, Summarizer};
use crate::generation::{Generation, GenerationRequest};
use crate::input::{Materializer, PromptInput};
use crate::lock::{Admission, Drain, LockGuard, LockRegistry};
use crate::pipeline::ToolPipeline;
use crate::processor::{StreamProcessor, classify};
use crate::replay;
use crate::retry::RetryPolicy;
use crate::shell::{self, ShellInput};
use crate::store::SessionStore;
use crate::system;
use crate::title;

const DEFAULT_AGENT: &str = "build";

struct Inner {
    store: SessionStore,
    providers: Arc<dyn ProviderRegistry>,
    pipeline: ToolPipeline,
    snapshot: Arc<dyn Snapshot>,
    config: Arc<AppConfig>,
    agents: Vec<AgentInfo>,
    locks: Arc<LockRegistry>,
    retry: RetryPolicy,
    cwd: PathBuf,
}

/// Session prompt orchestration. Cheap to clone.
#[derive(Clone)]
pub struct SessionPrompt {
    inner: Arc<Inner>,
}

impl SessionPrompt {
    pub fn new(
        store: SessionStore,
        providers: Arc<dyn ProviderRegistry>,
        pipeline: ToolPipeline,
        config: Arc<AppConfig>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self::with_tracking(store, providers, pipeline, config, cwd, Arc::new(NoSnapshot))
    }

    /// Like [`SessionPrompt::new`], recording workspace changes through `snapshot`.
    pub fn with_tracking(
        store: SessionStore,
        providers: Arc<dyn ProviderRegistry>,
        pipeline: ToolPipeline,
        config: Arc<AppConfig>,
        cwd: impl Into<PathBuf>,
        snapshot: Arc<dyn Snapshot>,
    ) -> Self {
        let locks = LockRegistry::new(store.bus().clone());
        Self {
            inner: Arc::new(Inner {
                agents: config.agents(),
                retry: RetryPolicy::from_config(&config.retry),
                store,
                providers,
                pipeline,
                snapshot,
                config,
                locks,
                cwd: cwd.into(),
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn agents(&self) -> &[AgentInfo] {
        &self.inner.agents
    }

    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.inner.locks.is_busy(session_id)
    }

    /// Input agent, then the configured default, then `build`.
    pub fn agent(&self, name: Option<&str>) -> Result<AgentInfo, Error> {
        let name = name
            .or(self.inner.config.default_agent.as_deref())
            .unwrap_or(DEFAULT_AGENT);
        self.inner
            .agents
            .iter()
            .find(|a| a.name == name)
            .cloned()
            .ok_or_else(|| SessionError::AgentNotFound(name.to_string()).into())
    }

    /// Input model, then the agent's, then the configured default.
    fn model_ref(&self, requested: Option<&ModelRef>, agent: &AgentInfo) -> Result<ModelRef, Error> {
        requested
            .cloned()
            .or_else(|| agent.model.clone())
            .or_else(|| self.inner.config.default_model())
            .or_else(|| self.inner.providers.default_model())
            .ok_or_else(|| ProviderError::NotConfigured("no model configured".into()).into())
    }

    /// Run `input` and return the assistant message that answers it.
    ///
    /// If the session is busy the prompt waits its turn; it may be answered
    /// by a generation it was spliced into.
    pub async fn prompt(&self, input: PromptInput) -> Result<WithParts, Error> {
        let inner = &self.inner;
        let session = inner.store.get(&input.session_id).await?;
        let agent = self.agent(input.agent.as_deref())?;
        let model = self.model_ref(input.model.as_ref(), &agent)?;

        let materializer = Materializer {
            tools: inner.pipeline.builtins(),
            hooks: inner.pipeline.hooks(),
        };
        let user = materializer.materialize(&input, &agent.name, &model).await?;
        inner.store.update_message(&user.info).await?;
        for part in &user.parts {
            inner.store.update_part(part, None).await?;
        }

        if inner.config.session.auto_title && session.is_top_level() && is_default_title(&session.title) {
            self.maybe_title(&input.session_id, &model, &user).await?;
        }

        match inner
            .locks
            .acquire_or_enqueue(&input.session_id, session.is_top_level(), input.clone(), user.clone())
        {
            Admission::Queued(rx) => rx
                .await
                .map_err(|_| SessionError::QueueDropped(input.session_id.clone()).into()),
            Admission::Acquired(guard) => self.drain(guard, input, user).await,
        }
    }

    async fn maybe_title(&self, session_id: &str, model: &ModelRef, user: &WithParts) -> Result<(), Error> {
        let text = user.text();
        if text.is_empty() {
            return Ok(());
        }
        let typed_turns = self
            .inner
            .store
            .messages(session_id)
            .await?
            .iter()
            .filter(|m| m.info.as_user().is_some() && !m.text().is_empty())
            .count();
        if typed_turns != 1 {
            return Ok(());
        }
        match self.inner.providers.model(model).await {
            Ok(main) => {
                title::spawn(
                    self.inner.store.clone(),
                    self.inner.providers.clone(),
                    main,
                    session_id.to_string(),
                    text,
                );
            }
            Err(error) => debug!(session_id, error = %error, "Skipping title generation"),
        }
        Ok(())
    }

    /// Run the first turn, then whatever queued up behind it, under one lock.
    async fn drain(&self, guard: LockGuard, input: PromptInput, user: WithParts) -> Result<WithParts, Error> {
        let first = self.run(&guard, &input, &user).await?;
        let mut next = guard.complete(&first);
        while let Drain::Next(entry) = next {
            if guard.token().is_cancelled() {
                break;
            }
            debug!(session_id = %guard.session_id(), message_id = %entry.user.info.id(), "Running queued prompt");
            match self.run(&guard, &entry.input, &entry.user).await {
                Ok(result) => {
                    next = guard.complete(&result);
                    entry.resolve(result);
                }
                Err(error) => {
                    warn!(session_id = %guard.session_id(), error = %error, "Queued prompt failed");
                    break;
                }
            }
        }
        Ok(first)
    }

    /// One full generation for an already persisted user turn.
    async fn run(&self, guard: &LockGuard, input: &PromptInput, user: &WithParts) -> Result<WithParts, Error> {
        let inner = &self.inner;
        let session_id = input.session_id.as_str();
        let user_info = user
            .info
            .as_user()
            .ok_or_else(|| Error::Internal("prompt turn is not a user message".into()))?;
        let agent = self.agent(Some(&user_info.agent))?;
        let model = match inner.providers.model(&user_info.model).await {
            Ok(model) => model,
            Err(error) => return self.fail_unresolved(user_info, &agent, error).await,
        };

        let mut history = inner.store.messages(session_id).await?;
        let last = history.iter().rev().find_map(|m| m.info.as_assistant());
        if let Some(last) = last
            && !last.summary
            && last.time.completed.is_some()
            && compaction::is_overflow(&last.tokens, &model.info, inner.config.compaction.disabled)
        {
            info!(session_id, tokens = last.tokens.context_total(), "Context overflow, compacting");
            self.summarizer(model.clone(), agent.clone())
                .await
                .run(session_id, true, guard.token())
                .await?;
            history = inner.store.messages(session_id).await?;
        }
        let messages = replay::to_model_messages(replay::since_last_summary(&history));

        let system = system::assemble(
            input.system.as_deref(),
            &agent,
            &model.info,
            &inner.cwd,
            &inner.config.instructions,
        )
        .await;
        let tools = inner.pipeline.resolve(&agent, &model.info, &input.tools).await;

        let mut params = ChatParams {
            temperature: if model.info.temperature { agent.temperature } else { None },
            top_p: agent.top_p,
            options: agent.options.clone(),
        };
        inner.pipeline.hooks().chat_params(
            &ChatContext {
                session_id,
                agent: &agent.name,
                model: &model.info,
            },
            &mut params,
        );

        let mut assistant = AssistantMessage::new(session_id, &agent.name, &model.info.model_ref());
        assistant.parent_id = Some(user_info.id.clone());
        assistant.system = system.clone();
        assistant.path = self.message_path();
        inner
            .store
            .update_message(&MessageInfo::Assistant(assistant.clone()))
            .await?;
        info!(session_id, message_id = %assistant.id, agent = %agent.name, model = %model.info.id, "Generating");

        let mut generation = Generation::new(
            GenerationRequest {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                model: model.clone(),
                agent,
                system,
                messages,
                tools,
                temperature: params.temperature,
                top_p: params.top_p,
                options: params.options,
                max_steps: inner.config.session.max_steps,
                retry: inner.retry.clone(),
                subagents: Some(Arc::new(self.clone())),
            },
            guard.token(),
        );
        let processor = StreamProcessor::new(inner.store.clone(), inner.snapshot.clone(), model.info.cost, assistant);
        let result = processor.process(&mut generation, Some(guard)).await?;

        if inner.config.compaction.prune
            && let Err(error) = compaction::prune(&inner.store, session_id).await
        {
            warn!(session_id, error = %error, "Pruning failed");
        }
        Ok(result)
    }

    /// Record a turn whose model could not be resolved.
    async fn fail_unresolved(
        &self,
        user: &UserMessage,
        agent: &AgentInfo,
        error: ProviderError,
    ) -> Result<WithParts, Error> {
        warn!(session_id = %user.session_id, model = %user.model, error = %error, "Model unavailable");
        let mut assistant = AssistantMessage::new(&user.session_id, &agent.name, &user.model);
        assistant.parent_id = Some(user.id.clone());
        assistant.path = self.message_path();
        let classified = classify(&error);
        assistant.error = Some(classified.clone());
        assistant.time.completed = Some(Utc::now());
        self.inner
            .store
            .update_message(&MessageInfo::Assistant(assistant.clone()))
            .await?;
        self.inner.store.bus().publish(BusEvent::SessionError {
            session_id: Some(user.session_id.clone()),
            error: classified,
        });
        self.inner.store.message(&user.session_id, &assistant.id).await
    }

    fn message_path(&self) -> MessagePath {
        MessagePath {
            cwd: self.inner.cwd.display().to_string(),
            root: self.inner.store.directory().to_string(),
        }
    }

    async fn summarizer(&self, model: ResolvedModel, agent: AgentInfo) -> Summarizer {
        Summarizer {
            store: self.inner.store.clone(),
            snapshot: self.inner.snapshot.clone(),
            model,
            system: system::summarize(&self.inner.cwd, &self.inner.config.instructions).await,
            retry: self.inner.retry.clone(),
            agent,
        }
    }

    /// Cancel the session's generation. Returns `false` if it was idle.
    pub fn abort(&self, session_id: &str) -> bool {
        self.inner.locks.abort(session_id)
    }

    /// Summarize the session on request, without a continue turn.
    pub async fn summarize(&self, session_id: &str, model: Option<ModelRef>) -> Result<WithParts, Error> {
        let session = self.inner.store.get(session_id).await?;
        let guard = self
            .inner
            .locks
            .try_acquire(session_id, session.is_top_level())
            .ok_or_else(|| SessionError::Busy(session_id.to_string()))?;
        let agent = self.agent(None)?;
        let model = self.model_ref(model.as_ref(), &agent)?;
        let model = self.inner.providers.model(&model).await?;
        self.summarizer(model, agent)
            .await
            .run(session_id, false, guard.token())
            .await
    }

    /// Run a user shell command in the session.
    pub async fn shell(&self, input: ShellInput) -> Result<WithParts, Error> {
        let session = self.inner.store.get(&input.session_id).await?;
        let guard = self
            .inner
            .locks
            .try_acquire(&input.session_id, session.is_top_level())
            .ok_or_else(|| SessionError::Busy(input.session_id.clone()))?;
        let agent = self.agent(input.agent.as_deref())?;
        let model = self.model_ref(input.model.as_ref(), &agent)?;
        shell::run(
            &self.inner.store,
            &input,
            &agent.name,
            &model,
            &self.inner.cwd,
            &guard.token(),
        )
        .await
    }

    /// Expand a configured command template and prompt with it.
    pub async fn command(&self, input: CommandInput) -> Result<WithParts, Error> {
        let config = self
            .inner
            .config
            .commands
            .get(&input.command)
            .ok_or_else(|| SessionError::CommandNotFound(input.command.clone()))?;
        let prompt = command::expand(
            config,
            &input,
            &self.inner.cwd,
            &self.inner.agents,
            &CancellationToken::new(),
        )
        .await;
        self.prompt(prompt).await
    }
}

#[async_trait]
impl SubagentRunner for SessionPrompt {
    async fn create_child(&self, parent_session_id: &str, description: &str) -> Result<String, Error> {
        let child = self
            .inner
            .store
            .create(Some(parent_session_id.to_string()), Some(format!("{description} (subagent)")))
            .await?;
        Ok(child.id)
    }

    async fn run_subagent(&self, session_id: &str, request: SubagentRequest) -> Result<SubagentOutput, Error> {
        let input = PromptInput::text(session_id, &request.prompt).with_agent(&request.agent);

        // The parent's cancellation reaches the child through its own lock.
        let watcher = {
            let prompt = self.clone();
            let child = session_id.to_string();
            let abort = request.abort.clone();
            tokio::spawn(async move {
                abort.cancelled().await;
                prompt.abort(&child);
            })
        };
        let result = self.prompt(input).await;
        watcher.abort();

        let result = result?;
        let error = result
            .info
            .as_assistant()
            .and_then(|a| a.error.as_ref())
            .map(ToString::to_string);
        Ok(SubagentOutput {
            session_id: session_id.to_string(),
            text: result.text(),
            error,
        })
    }
}
