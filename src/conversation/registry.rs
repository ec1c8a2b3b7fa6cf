//! Conversation registry and lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::provider::{HandleProvider, ProviderError, StoreHandle};

/// Errors surfaced by conversation lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// A continue was requested for a conversation that existed and has
    /// since been recycled.
    #[error("conversation timed out")]
    TimedOut,

    /// Failure from the underlying handle provider.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// One registry record: a web-session identifier, the store handle it owns,
/// and the last-activity timestamp the recycling sweep reads.
#[derive(Debug, Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

#[derive(Debug)]
struct ConversationInner {
    id: String,
    handle: RwLock<Arc<dyn StoreHandle>>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl Conversation {
    fn new(id: String, handle: Arc<dyn StoreHandle>) -> Self {
        Self {
            inner: Arc::new(ConversationInner {
                id,
                handle: RwLock::new(handle),
                last_activity: RwLock::new(Utc::now()),
            }),
        }
    }

    /// The web-session identifier this conversation belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The store handle currently owned by this conversation.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn StoreHandle> {
        Arc::clone(&self.inner.handle.read().unwrap())
    }

    /// Swap in a fresh handle, preserving the conversation identity.
    fn replace_handle(&self, handle: Arc<dyn StoreHandle>) {
        *self.inner.handle.write().unwrap() = handle;
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.inner.last_activity.read().unwrap()
    }

    fn touch(&self) {
        *self.inner.last_activity.write().unwrap() = Utc::now();
    }

    fn is_idle_longer_than(&self, timeout: Duration) -> bool {
        let now = Utc::now();
        if let Ok(idle) = (now - self.last_activity()).to_std() {
            idle > timeout
        } else {
            // A last-activity in the future means clock skew; not idle.
            false
        }
    }
}

/// Registry of active conversations, one per web session.
///
/// Lifecycle operations and the periodic recycling sweep share the map; the
/// lock only guards the O(1) map operations themselves, handle I/O always
/// runs outside it. Entries removed for teardown are exclusively owned by
/// the remover, so no task can observe a half-closed conversation.
#[derive(Debug, Clone)]
pub struct ConversationRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    provider: Arc<dyn HandleProvider>,
    conversations: RwLock<HashMap<String, Conversation>>,
    /// Identifiers of recycled conversations, kept so a stale client gets a
    /// "timed out" signal instead of a silent no-op.
    recycled: RwLock<HashSet<String>>,
    timeout: Duration,
    sweep_interval: Duration,
}

impl ConversationRegistry {
    #[must_use]
    pub fn new(
        provider: Arc<dyn HandleProvider>,
        timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                conversations: RwLock::new(HashMap::new()),
                recycled: RwLock::new(HashSet::new()),
                timeout,
                sweep_interval,
            }),
        }
    }

    /// Whether a conversation is active for the given web session. Pure
    /// lookup, no side effect.
    #[must_use]
    pub fn has_conversation(&self, id: &str) -> bool {
        self.inner.conversations.read().unwrap().contains_key(id)
    }

    /// Look up the active conversation without refreshing it.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.inner.conversations.read().unwrap().get(id).cloned()
    }

    /// Start a conversation for the given web session, ending any existing
    /// one for the same session first.
    pub async fn begin(&self, id: &str) -> Result<Conversation, ConversationError> {
        self.end(id).await?;

        debug!(session = %id, "beginning conversation");
        let handle = self.inner.provider.open(true).await?;
        let conversation = Conversation::new(id.to_string(), handle);

        self.inner.recycled.write().unwrap().remove(id);
        let displaced = self
            .inner
            .conversations
            .write()
            .unwrap()
            .insert(id.to_string(), conversation.clone());
        // Two begins racing for the same session: the map insert decides the
        // winner, and the loser's record gets closed here. Exactly one
        // handle stays open either way.
        if let Some(previous) = displaced {
            self.close_conversation(&previous).await?;
        }

        Ok(conversation)
    }

    /// Continue the conversation for the given web session.
    ///
    /// Returns `Ok(None)` when the session never had a conversation, and
    /// [`ConversationError::TimedOut`] when it had one that has since been
    /// recycled. An active conversation gets its timestamp refreshed and,
    /// when its handle was closed mid-conversation, a fresh handle swapped
    /// in place.
    pub async fn continue_conversation(
        &self,
        id: &str,
    ) -> Result<Option<Conversation>, ConversationError> {
        let Some(conversation) = self.get(id) else {
            if self.has_been_recycled(id) {
                debug!(session = %id, "continue requested for a recycled conversation");
                return Err(ConversationError::TimedOut);
            }
            return Ok(None);
        };

        debug!(session = %id, last_activity = %conversation.last_activity(), "continuing conversation");
        conversation.touch();

        if !conversation.handle().is_open() {
            debug!(session = %id, "store handle was closed mid-conversation, reopening");
            let fresh = self.inner.provider.open(true).await?;
            conversation.replace_handle(Arc::clone(&fresh));
            if !self.has_conversation(id) {
                // The sweep or an explicit end won the race while we were
                // reopening; release the fresh handle instead of leaking it.
                self.inner.provider.release(fresh.as_ref()).await?;
                return if self.has_been_recycled(id) {
                    Err(ConversationError::TimedOut)
                } else {
                    Ok(None)
                };
            }
        }

        Ok(Some(conversation))
    }

    /// Release the transport connection of the session's handle so pooled
    /// connections are not starved between requests. The conversation stays
    /// registered and keeps its pending state. No-op when absent.
    pub async fn disconnect(&self, id: &str) -> Result<(), ConversationError> {
        if let Some(conversation) = self.get(id) {
            debug!(session = %id, "disconnecting store handle transport");
            conversation.handle().disconnect().await?;
        }
        Ok(())
    }

    /// End the conversation for the given web session. Idempotent.
    pub async fn end(&self, id: &str) -> Result<(), ConversationError> {
        let removed = self.inner.conversations.write().unwrap().remove(id);
        if let Some(conversation) = removed {
            debug!(session = %id, last_activity = %conversation.last_activity(), "ending conversation");
            self.close_conversation(&conversation).await?;
        }
        Ok(())
    }

    /// Clear pending state and release the handle. The conversation must
    /// already be out of the map.
    async fn close_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), ConversationError> {
        let handle = conversation.handle();
        handle.clear_pending();
        self.inner.provider.release(handle.as_ref()).await?;
        Ok(())
    }

    fn has_been_recycled(&self, id: &str) -> bool {
        self.inner.recycled.read().unwrap().contains(id)
    }

    /// Evict every conversation idle longer than the timeout, recording the
    /// evicted identifiers. Returns how many were evicted.
    pub async fn sweep_once(&self) -> usize {
        debug!("recycling idle conversations");
        let stale: Vec<Conversation> = self
            .inner
            .conversations
            .read()
            .unwrap()
            .values()
            .filter(|conversation| conversation.is_idle_longer_than(self.inner.timeout))
            .cloned()
            .collect();

        let mut evicted = 0;
        for conversation in stale {
            // Re-check under the write lock: a begin may have replaced the
            // entry, or a continue may have refreshed it, since the
            // snapshot. Removal and tombstoning happen under the same lock,
            // so a racing begin either sees the entry still live or finds
            // the tombstone already in place to clear.
            let removed = {
                let mut conversations = self.inner.conversations.write().unwrap();
                match conversations.get(conversation.id()) {
                    Some(current)
                        if Arc::ptr_eq(&current.inner, &conversation.inner)
                            && current.is_idle_longer_than(self.inner.timeout) =>
                    {
                        let removed = conversations.remove(conversation.id());
                        self.inner
                            .recycled
                            .write()
                            .unwrap()
                            .insert(conversation.id().to_string());
                        removed
                    }
                    _ => None,
                }
            };
            let Some(conversation) = removed else {
                continue;
            };

            debug!(
                session = %conversation.id(),
                last_activity = %conversation.last_activity(),
                "recycling idle conversation"
            );
            if let Err(error) = self.close_conversation(&conversation).await {
                warn!(session = %conversation.id(), %error, "failed to release handle of recycled conversation");
            }
            evicted += 1;
        }
        evicted
    }

    /// Spawn the periodic recycling sweep. The task stops when `shutdown`
    /// changes; join the returned handle before draining the registry.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.inner.sweep_interval);
            // The first tick of an interval completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.sweep_once().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Close every remaining conversation. Called once at process shutdown,
    /// after the sweeper has stopped.
    pub async fn drain(&self) {
        let remaining: Vec<Conversation> = {
            let mut conversations = self.inner.conversations.write().unwrap();
            conversations.drain().map(|(_, c)| c).collect()
        };
        for conversation in remaining {
            if let Err(error) = self.close_conversation(&conversation).await {
                warn!(session = %conversation.id(), %error, "failed to release handle during drain");
            }
        }
    }
}
