//! `corvid sessions`, `corvid messages` and `corvid compact`.

use crate::engine::{self, Options};
use crate::render;

pub async fn list(options: &Options) -> anyhow::Result<()> {
    let prompt = engine::build(options)?;
    let sessions = prompt.store().list().await?;
    if sessions.is_empty() {
        println!("No sessions yet, start one with `corvid run <message>`");
        return Ok(());
    }
    for session in sessions.iter().filter(|s| s.is_top_level()) {
        println!("{}", render::session_line(session));
        for child in sessions.iter().filter(|c| c.parent_id.as_deref() == Some(session.id.as_str())) {
            println!("  └ {}", render::session_line(child));
        }
    }
    Ok(())
}

pub async fn messages(options: &Options, session_id: &str) -> anyhow::Result<()> {
    let prompt = engine::build(options)?;
    let session = prompt.store().get(session_id).await?;
    println!("{}\n", session.title);
    for message in prompt.store().messages(session_id).await? {
        println!("{}", render::header(&message));
        let body = render::message(&message);
        if !body.is_empty() {
            println!("{body}");
        }
        if let Some(error) = render::error(&message) {
            println!("error: {error}");
        }
        println!();
    }
    Ok(())
}

pub async fn compact(options: &Options, session_id: &str, model: Option<String>) -> anyhow::Result<()> {
    let model = super::run::parse_model(model)?;
    let prompt = engine::build(options)?;
    let summary = prompt.summarize(session_id, model).await?;
    if let Some(error) = render::error(&summary) {
        anyhow::bail!("Summarization failed: {error}");
    }
    println!("{}", render::message(&summary));
    Ok(())
}
