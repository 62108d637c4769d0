//! Per-session locking and prompt queueing.
//!
//! A session is busy while the registry holds a cancellation token for it.
//! Prompts that arrive while it is busy wait in a FIFO queue. The holder
//! either splices them into its live generation (marking them processed) or
//! runs them one by one after its own generation ends.
//!
//! All state sits behind one mutex; no lock is held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use corvid_core::event::{BusEvent, EventBus};
use corvid_core::message::WithParts;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::input::PromptInput;

/// A prompt waiting for a busy session.
pub struct QueueEntry {
    pub input: PromptInput,
    /// The user message, already persisted.
    pub user: WithParts,
    pub processed: bool,
    reply: oneshot::Sender<WithParts>,
}

impl QueueEntry {
    pub fn new(input: PromptInput, user: WithParts) -> (Self, oneshot::Receiver<WithParts>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                input,
                user,
                processed: false,
                reply,
            },
            rx,
        )
    }

    /// Resolve the waiting caller.
    pub fn resolve(self, result: WithParts) {
        let _ = self.reply.send(result);
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("message_id", &self.user.info.id())
            .field("processed", &self.processed)
            .finish()
    }
}

struct Held {
    id: u64,
    token: CancellationToken,
    top_level: bool,
}

#[derive(Default)]
struct Slot {
    held: Option<Held>,
    queue: VecDeque<QueueEntry>,
}

/// Outcome of [`LockRegistry::acquire_or_enqueue`].
pub enum Admission {
    Acquired(LockGuard),
    Queued(oneshot::Receiver<WithParts>),
}

/// What the lock holder should do after a generation ends.
#[derive(Debug)]
pub enum Drain {
    /// Run this queued prompt next, still under the lock.
    Next(QueueEntry),
    /// Nothing left; drop the guard.
    Done,
}

pub struct LockRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    next_id: AtomicU64,
    bus: EventBus,
}

impl LockRegistry {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            bus,
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.slots().get(session_id).is_some_and(|s| s.held.is_some())
    }

    /// Take the lock if the session is idle.
    pub fn try_acquire(self: &Arc<Self>, session_id: &str, top_level: bool) -> Option<LockGuard> {
        let mut slots = self.slots();
        let slot = slots.entry(session_id.to_string()).or_default();
        if slot.held.is_some() {
            return None;
        }
        Some(self.hold(slot, session_id, top_level))
    }

    /// Take the lock, or queue `entry` behind the current holder.
    pub fn acquire_or_enqueue(
        self: &Arc<Self>,
        session_id: &str,
        top_level: bool,
        input: PromptInput,
        user: WithParts,
    ) -> Admission {
        let mut slots = self.slots();
        let slot = slots.entry(session_id.to_string()).or_default();
        if slot.held.is_none() {
            return Admission::Acquired(self.hold(slot, session_id, top_level));
        }
        let (entry, rx) = QueueEntry::new(input, user);
        slot.queue.push_back(entry);
        debug!(session_id, queued = slot.queue.len(), "Session busy, prompt queued");
        Admission::Queued(rx)
    }

    fn hold(self: &Arc<Self>, slot: &mut Slot, session_id: &str, top_level: bool) -> LockGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        slot.held = Some(Held {
            id,
            token: token.clone(),
            top_level,
        });
        info!(session_id, "Session locked");
        LockGuard {
            registry: self.clone(),
            session_id: session_id.to_string(),
            id,
            token,
        }
    }

    /// Cancel the session's generation and release its lock.
    ///
    /// Queued prompts are dropped. Returns `false` if the session was idle.
    pub fn abort(&self, session_id: &str) -> bool {
        let removed = {
            let mut slots = self.slots();
            match slots.get(session_id) {
                Some(slot) if slot.held.is_some() => slots.remove(session_id),
                _ => None,
            }
        };
        let Some(held) = removed.and_then(|slot| slot.held) else {
            return false;
        };
        info!(session_id, "Session aborted");
        held.token.cancel();
        if held.top_level {
            self.bus.publish(BusEvent::SessionIdle {
                session_id: session_id.to_string(),
            });
        }
        true
    }

    fn with_own_slot<T>(&self, guard: &LockGuard, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        let mut slots = self.slots();
        let slot = slots.get_mut(&guard.session_id)?;
        if slot.held.as_ref().map(|h| h.id) != Some(guard.id) {
            return None;
        }
        Some(f(slot))
    }

    fn release(&self, guard: &LockGuard) {
        let released = {
            let mut slots = self.slots();
            match slots.get(&guard.session_id) {
                Some(slot) if slot.held.as_ref().map(|h| h.id) == Some(guard.id) => slots.remove(&guard.session_id),
                _ => None,
            }
        };
        if let Some(slot) = released {
            info!(session_id = %guard.session_id, dropped = slot.queue.len(), "Session unlocked");
            if slot.held.is_some_and(|h| h.top_level) {
                self.bus.publish(BusEvent::SessionIdle {
                    session_id: guard.session_id.clone(),
                });
            }
        }
    }
}

/// Holding this means owning the session. Dropping it releases the lock.
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    session_id: String,
    id: u64,
    token: CancellationToken,
}

impl LockGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Mark every unprocessed queued prompt as processed and return their user messages.
    pub fn take_unprocessed(&self) -> Vec<WithParts> {
        self.registry
            .with_own_slot(self, |slot| {
                slot.queue
                    .iter_mut()
                    .filter(|e| !e.processed)
                    .map(|e| {
                        e.processed = true;
                        e.user.clone()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Settle the queue after a generation produced `result`.
    ///
    /// Processed entries resolve with `result`. The oldest unprocessed entry,
    /// if any, is handed back to run next while the lock stays held.
    pub fn complete(&self, result: &WithParts) -> Drain {
        let (settled, next) = self
            .registry
            .with_own_slot(self, |slot| {
                let mut settled = Vec::new();
                let mut rest = VecDeque::new();
                for entry in slot.queue.drain(..) {
                    if entry.processed {
                        settled.push(entry);
                    } else {
                        rest.push_back(entry);
                    }
                }
                let next = rest.pop_front();
                slot.queue = rest;
                (settled, next)
            })
            .unwrap_or_default();

        for entry in settled {
            entry.resolve(result.clone());
        }
        match next {
            Some(entry) => Drain::Next(entry),
            None => Drain::Done,
        }
    }
}

impl PendingTurns for LockGuard {
    fn take(&self) -> Vec<WithParts> {
        self.take_unprocessed()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.release(self);
    }
}

/// Source of user turns that arrived while a generation was running.
pub trait PendingTurns: Send + Sync {
    fn take(&self) -> Vec<WithParts>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::message::{MessageInfo, MessageTime, Part, UserMessage};
    use corvid_core::provider::ModelRef;

    fn user(text: &str) -> WithParts {
        let id = corvid_core::id::ascending(corvid_core::id::IdKind::Message);
        WithParts {
            parts: vec![Part::text("ses_1", &id, text)],
            info: MessageInfo::User(UserMessage {
                id,
                session_id: "ses_1".into(),
                time: MessageTime::now(),
                agent: "build".into(),
                model: ModelRef::new("p", "m"),
            }),
        }
    }

    fn input() -> PromptInput {
        PromptInput::text("ses_1", "x")
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let registry = LockRegistry::new(EventBus::default());
        let guard = registry.try_acquire("ses_1", true).unwrap();
        assert!(registry.is_busy("ses_1"));
        assert!(registry.try_acquire("ses_1", true).is_none());
        drop(guard);
        assert!(!registry.is_busy("ses_1"));
        assert!(registry.try_acquire("ses_1", true).is_some());
    }

    #[tokio::test]
    async fn release_publishes_idle_for_top_level_only() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let registry = LockRegistry::new(bus);
        drop(registry.try_acquire("ses_child", false).unwrap());
        drop(registry.try_acquire("ses_top", true).unwrap());
        match rx.recv().await.unwrap().as_ref() {
            BusEvent::SessionIdle { session_id } => assert_eq!(session_id, "ses_top"),
            other => panic!("Expected idle, got {}", other.name()),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn complete_resolves_processed_and_hands_back_next() {
        let registry = LockRegistry::new(EventBus::default());
        let guard = registry.try_acquire("ses_1", true).unwrap();

        let Admission::Queued(first_rx) = registry.acquire_or_enqueue("ses_1", true, input(), user("a")) else {
            panic!("expected queue");
        };
        let spliced = guard.take_unprocessed();
        assert_eq!(spliced.len(), 1);
        assert!(guard.take_unprocessed().is_empty());

        let Admission::Queued(_second_rx) = registry.acquire_or_enqueue("ses_1", true, input(), user("b")) else {
            panic!("expected queue");
        };
        let result = user("result");
        match guard.complete(&result) {
            Drain::Next(entry) => assert_eq!(entry.user.parts[0].as_text().unwrap().text, "b"),
            Drain::Done => panic!("expected the unprocessed entry"),
        }
        assert_eq!(first_rx.await.unwrap(), result);
        assert!(matches!(guard.complete(&result), Drain::Done));
    }

    #[tokio::test]
    async fn abort_cancels_and_drops_queue() {
        let registry = LockRegistry::new(EventBus::default());
        assert!(!registry.abort("ses_1"));

        let guard = registry.try_acquire("ses_1", true).unwrap();
        let token = guard.token();
        let Admission::Queued(rx) = registry.acquire_or_enqueue("ses_1", true, input(), user("a")) else {
            panic!("expected queue");
        };
        assert!(registry.abort("ses_1"));
        assert!(token.is_cancelled());
        assert!(rx.await.is_err());
        assert!(!registry.is_busy("ses_1"));

        // A new holder is not disturbed by the stale guard going away
        let fresh = registry.try_acquire("ses_1", true).unwrap();
        drop(guard);
        assert!(registry.is_busy("ses_1"));
        drop(fresh);
    }
}
