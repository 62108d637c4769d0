//! Session, message and part persistence.
//!
//! Records live under three key spaces:
//!
//! - `["session", session_id]`
//! - `["message", session_id, message_id]`
//! - `["part", message_id, part_id]`
//!
//! Every write replaces the whole record and publishes the new value on the
//! bus, so observers can follow a generation without touching storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use corvid_core::error::{Error, SessionError, StorageError};
use corvid_core::event::{BusEvent, EventBus};
use corvid_core::message::{MessageInfo, Part, WithParts};
use corvid_core::session::Session;
use corvid_core::storage::{Storage, StorageExt};
use tracing::debug;

#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    bus: EventBus,
    directory: String,
    /// Serializes read-modify-write of each session record.
    writers: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, bus: EventBus, directory: impl Into<String>) -> Self {
        Self {
            storage,
            bus,
            directory: directory.into(),
            writers: Arc::default(),
        }
    }

    fn writer(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|p| p.into_inner());
        writers.entry(session_id.to_string()).or_default().clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    // --- Sessions ---

    pub async fn create(&self, parent_id: Option<String>, title: Option<String>) -> Result<Session, Error> {
        let mut session = Session::new(parent_id, &self.directory);
        if let Some(title) = title {
            session.title = title;
        }
        self.storage.write_as(&["session", &session.id], &session).await?;
        debug!(session_id = %session.id, "Created session");
        self.bus.publish(BusEvent::SessionUpdated { info: session.clone() });
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, Error> {
        match self.storage.read_as(&["session", session_id]).await {
            Err(StorageError::NotFound(_)) => Err(SessionError::NotFound(session_id.to_string()).into()),
            other => Ok(other?),
        }
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<Session>, Error> {
        let mut sessions = Vec::new();
        for key in self.storage.list(&["session"]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            sessions.push(self.storage.read_as::<Session>(&key).await?);
        }
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
        Ok(sessions)
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<Session>, Error> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Apply `edit` to a session and refresh its `updated` time.
    pub async fn update<F>(&self, session_id: &str, edit: F) -> Result<Session, Error>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let writer = self.writer(session_id);
        let _held = writer.lock().await;
        let mut session = self.get(session_id).await?;
        edit(&mut session);
        session.time.updated = Utc::now();
        self.storage.write_as(&["session", session_id], &session).await?;
        self.bus.publish(BusEvent::SessionUpdated { info: session.clone() });
        Ok(session)
    }

    /// Remove a session, its children, and every message and part they hold.
    pub async fn remove(&self, session_id: &str) -> Result<(), Error> {
        let mut pending = vec![self.get(session_id).await?];
        while let Some(session) = pending.pop() {
            pending.extend(self.children(&session.id).await?);
            for message in self.messages(&session.id).await? {
                self.remove_message(&session.id, message.info.id()).await?;
            }
            self.storage.remove(&["session", &session.id]).await?;
            self.writers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&session.id);
            debug!(session_id = %session.id, "Removed session");
            self.bus.publish(BusEvent::SessionDeleted { info: session });
        }
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> Result<(), Error> {
        match self.update(session_id, |_| {}).await {
            Err(Error::Session(SessionError::NotFound(_))) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    // --- Messages ---

    /// Messages of a session in id order, each with its parts in id order.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<WithParts>, Error> {
        let mut out = Vec::new();
        for key in self.storage.list(&["message", session_id]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            let info: MessageInfo = self.storage.read_as(&key).await?;
            let parts = self.parts(info.id()).await?;
            out.push(WithParts { info, parts });
        }
        out.sort_by(|a, b| a.info.id().cmp(b.info.id()));
        Ok(out)
    }

    pub async fn message(&self, session_id: &str, message_id: &str) -> Result<WithParts, Error> {
        let info: MessageInfo = self.storage.read_as(&["message", session_id, message_id]).await?;
        let parts = self.parts(message_id).await?;
        Ok(WithParts { info, parts })
    }

    pub async fn parts(&self, message_id: &str) -> Result<Vec<Part>, Error> {
        let mut parts = Vec::new();
        for key in self.storage.list(&["part", message_id]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            parts.push(self.storage.read_as::<Part>(&key).await?);
        }
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(parts)
    }

    pub async fn update_message(&self, info: &MessageInfo) -> Result<(), Error> {
        self.storage
            .write_as(&["message", info.session_id(), info.id()], info)
            .await?;
        self.bus.publish(BusEvent::MessageUpdated { info: info.clone() });
        self.touch(info.session_id()).await
    }

    /// Persist a part. `delta` is the text appended since the last write, if any.
    pub async fn update_part(&self, part: &Part, delta: Option<String>) -> Result<(), Error> {
        self.storage
            .write_as(&["part", &part.message_id, &part.id], part)
            .await?;
        self.bus.publish(BusEvent::PartUpdated {
            part: part.clone(),
            delta,
        });
        self.touch(&part.session_id).await
    }

    pub async fn remove_message(&self, session_id: &str, message_id: &str) -> Result<(), Error> {
        for key in self.storage.list(&["part", message_id]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            self.storage.remove(&key).await?;
        }
        self.storage.remove(&["message", session_id, message_id]).await?;
        self.bus.publish(BusEvent::MessageRemoved {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::message::{AssistantMessage, PartKind, TextPart};
    use corvid_core::provider::ModelRef;
    use corvid_storage::InMemoryStorage;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryStorage::new()), EventBus::default(), "/work")
    }

    #[tokio::test]
    async fn create_get_and_list() {
        let store = store();
        let a = store.create(None, None).await.unwrap();
        let b = store.create(None, Some("Second".into())).await.unwrap();
        assert_eq!(store.get(&a.id).await.unwrap().directory, "/work");

        store.update(&a.id, |s| s.title = "Touched".into()).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].title, b.title);

        assert!(matches!(
            store.get("ses_missing").await,
            Err(Error::Session(SessionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn messages_and_parts_come_back_in_id_order() {
        let store = store();
        let session = store.create(None, None).await.unwrap();
        let msg = AssistantMessage::new(&session.id, "build", &ModelRef::new("p", "m"));
        let info = MessageInfo::Assistant(msg.clone());
        store.update_message(&info).await.unwrap();

        let first = Part::text(&session.id, &msg.id, "one");
        let second = Part::text(&session.id, &msg.id, "two");
        store.update_part(&second, None).await.unwrap();
        store.update_part(&first, None).await.unwrap();

        let messages = store.messages(&session.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        let texts: Vec<&str> = messages[0].parts.iter().filter_map(|p| p.as_text()).map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn part_writes_publish_deltas() {
        let store = store();
        let mut rx = store.bus().subscribe();
        let part = Part::new(
            "ses_1",
            "msg_1",
            PartKind::Text(TextPart {
                text: "Hi".into(),
                synthetic: false,
                time: None,
            }),
        );
        store.update_part(&part, Some("Hi".into())).await.unwrap();
        match rx.recv().await.unwrap().as_ref() {
            BusEvent::PartUpdated { delta, .. } => assert_eq!(delta.as_deref(), Some("Hi")),
            other => panic!("Expected part update, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn remove_is_recursive() {
        let store = store();
        let parent = store.create(None, None).await.unwrap();
        let child = store.create(Some(parent.id.clone()), None).await.unwrap();
        let msg = AssistantMessage::new(&child.id, "general", &ModelRef::new("p", "m"));
        store.update_message(&MessageInfo::Assistant(msg.clone())).await.unwrap();
        store.update_part(&Part::text(&child.id, &msg.id, "x"), None).await.unwrap();

        assert_eq!(store.children(&parent.id).await.unwrap().len(), 1);
        store.remove(&parent.id).await.unwrap();
        assert!(store.get(&child.id).await.is_err());
        assert!(store.parts(&msg.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn part_writes_refresh_the_session() {
        let store = store();
        let session = store.create(None, None).await.unwrap();
        let before = session.time.updated;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        store.update_part(&Part::text(&session.id, "msg_1", "x"), None).await.unwrap();
        assert!(store.get(&session.id).await.unwrap().time.updated > before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_keep_every_edit() {
        for round in 0..200 {
            let store = store();
            let session = store.create(None, None).await.unwrap();
            let title = format!("Round {round}");

            let writer = {
                let store = store.clone();
                let session_id = session.id.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let msg = AssistantMessage::new(&session_id, "build", &ModelRef::new("p", "m"));
                        store.update_message(&MessageInfo::Assistant(msg)).await.unwrap();
                    }
                })
            };
            let titler = {
                let store = store.clone();
                let session_id = session.id.clone();
                let title = title.clone();
                tokio::spawn(async move {
                    store.update(&session_id, |s| s.title = title).await.unwrap();
                })
            };
            writer.await.unwrap();
            titler.await.unwrap();

            assert_eq!(store.get(&session.id).await.unwrap().title, title);
        }
    }
}
