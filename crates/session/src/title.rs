//! Background title generation for new sessions.

use std::sync::{Arc, LazyLock};

use corvid_core::error::{Error, ProviderError};
use corvid_core::provider::{ModelEvent, ModelMessage, ModelRequest, ProviderRegistry, ResolvedModel};
use regex_lite::Regex;
use tracing::{debug, warn};

use crate::store::SessionStore;
use crate::system::TITLE_PROMPT;

const MAX_TITLE_CHARS: usize = 100;
const TRUNCATED_CHARS: usize = 97;

static THINK_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>\s*").ok());

/// Reduce raw model output to a one-line title.
pub fn clean_title(raw: &str) -> Option<String> {
    let stripped = match THINK_BLOCK.as_ref() {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.to_string(),
    };
    let line = stripped.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() > MAX_TITLE_CHARS {
        let head: String = line.chars().take(TRUNCATED_CHARS).collect();
        Some(format!("{head}..."))
    } else {
        Some(line.to_string())
    }
}

async fn ask(model: &ResolvedModel, text: &str) -> Result<String, ProviderError> {
    let request = ModelRequest {
        model: model.info.id.clone(),
        messages: vec![
            ModelMessage::system(TITLE_PROMPT),
            ModelMessage::user_text(format!("Generate a title for this conversation:\n{text}")),
        ],
        max_output_tokens: Some(if model.info.reasoning { 1500 } else { 20 }),
        ..Default::default()
    };
    let mut stream = model.language.stream(request).await?;
    let mut out = String::new();
    while let Some(event) = stream.recv().await {
        match event? {
            ModelEvent::TextDelta { text, .. } => out.push_str(&text),
            ModelEvent::Finish { .. } => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Generate and store a title for `session_id` from the first user `text`.
///
/// Prefers the provider's small model. Returns the new title, if any.
pub async fn generate(
    store: &SessionStore,
    providers: &Arc<dyn ProviderRegistry>,
    main: &ResolvedModel,
    session_id: &str,
    text: &str,
) -> Result<Option<String>, Error> {
    let model = match providers.small_model(&main.info.provider_id).await {
        Some(small) => small,
        None => main.clone(),
    };
    debug!(session_id, model = %model.info.id, "Generating title");
    let raw = ask(&model, text).await?;
    let Some(title) = clean_title(&raw) else {
        return Ok(None);
    };
    store.update(session_id, |s| s.title = title.clone()).await?;
    Ok(Some(title))
}

/// Run [`generate`] in the background, logging failures.
pub fn spawn(
    store: SessionStore,
    providers: Arc<dyn ProviderRegistry>,
    main: ResolvedModel,
    session_id: String,
    text: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = generate(&store, &providers, &main, &session_id, &text).await {
            warn!(session_id = %session_id, error = %error, "Title generation failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corvid_core::event::EventBus;
    use corvid_core::provider::ModelRef;
    use corvid_providers::scripted::{ScriptStep, ScriptedModel};
    use corvid_storage::InMemoryStorage;

    #[test]
    fn strips_thinking_and_truncates() {
        assert_eq!(
            clean_title("<think>\nhmm, a title\n</think>\n\n  Fix the parser  \nextra").as_deref(),
            Some("Fix the parser")
        );
        let long = "a".repeat(120);
        let cleaned = clean_title(&long).unwrap();
        assert_eq!(cleaned.chars().count(), 100);
        assert!(cleaned.ends_with("..."));
        assert_eq!(clean_title("<think>only thoughts</think>"), None);
    }

    struct SmallOnly(ResolvedModel);

    #[async_trait]
    impl ProviderRegistry for SmallOnly {
        async fn model(&self, model: &ModelRef) -> Result<ResolvedModel, ProviderError> {
            Err(ProviderError::ModelNotFound {
                provider_id: model.provider_id.clone(),
                model_id: model.model_id.clone(),
            })
        }
        async fn small_model(&self, _provider_id: &str) -> Option<ResolvedModel> {
            Some(self.0.clone())
        }
        fn default_model(&self) -> Option<ModelRef> {
            None
        }
    }

    #[tokio::test]
    async fn prefers_small_model_and_updates_session() {
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()), EventBus::default(), "/work");
        let session = store.create(None, None).await.unwrap();
        let small = Arc::new(ScriptedModel::new(vec![ScriptStep::text("Parser bug hunt")]));
        let main = Arc::new(ScriptedModel::new(vec![]));
        let providers: Arc<dyn ProviderRegistry> = Arc::new(SmallOnly(small.clone().into_resolved("p", "small")));

        let title = generate(&store, &providers, &main.clone().into_resolved("p", "m"), &session.id, "fix it")
            .await
            .unwrap();
        assert_eq!(title.as_deref(), Some("Parser bug hunt"));
        assert_eq!(store.get(&session.id).await.unwrap().title, "Parser bug hunt");
        assert!(main.requests().is_empty());
        assert_eq!(small.requests()[0].max_output_tokens, Some(20));
    }
}
