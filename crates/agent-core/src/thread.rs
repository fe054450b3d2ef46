//! Conversation Threads
//!
//! Persistence capability consumed by the agent loop. The core only defines
//! the boundary ([`ThreadStore`]) plus an in-memory store; real backends
//! belong to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::message::{Message, Role};

/// Unique thread identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,

    /// Full history, system message first if present
    pub messages: Vec<Message>,

    /// Optional user-set title
    #[serde(default)]
    pub title: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            title: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_system_prompt(id: ThreadId, system_prompt: impl Into<String>) -> Self {
        let mut thread = Self::new(id);
        thread.messages.push(Message::system(system_prompt));
        thread
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Title, or a preview of the first user message
    pub fn title(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| {
                    let preview: String = m.text().chars().take(50).collect();
                    if m.text().chars().count() > 50 {
                        format!("{preview}...")
                    } else {
                        preview
                    }
                })
                .unwrap_or_else(|| format!("Thread {}", self.id))
        })
    }
}

/// Thread store trait for persistence
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Load a thread by ID
    async fn load(&self, id: &ThreadId) -> Result<Option<Thread>>;

    /// Insert or replace a thread
    async fn save(&self, thread: &Thread) -> Result<()>;
}

/// In-memory thread store (for development/testing)
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: RwLock<HashMap<ThreadId, Thread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.threads.read().await.is_empty()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn load(&self, id: &ThreadId) -> Result<Option<Thread>> {
        Ok(self.threads.read().await.get(id).cloned())
    }

    async fn save(&self, thread: &Thread) -> Result<()> {
        self.threads
            .write()
            .await
            .insert(thread.id.clone(), thread.clone());
        Ok(())
    }
}

/// Named mutexes keyed by a caller-chosen idempotency key
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, creating it on first use
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Load `id`, creating and saving it first if absent
///
/// Concurrent callers with the same id observe exactly one creation.
pub async fn get_or_create(
    store: &dyn ThreadStore,
    locks: &KeyedLocks,
    id: &ThreadId,
    system_prompt: Option<&str>,
) -> Result<Thread> {
    let _guard = locks.lock(id.as_str()).await;

    if let Some(thread) = store.load(id).await? {
        return Ok(thread);
    }

    let thread = match system_prompt {
        Some(prompt) => Thread::with_system_prompt(id.clone(), prompt),
        None => Thread::new(id.clone()),
    };
    store.save(&thread).await?;
    tracing::info!(thread_id = %id, "created thread");

    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts saves and widens the load/save race window
    struct SlowStore {
        inner: MemoryThreadStore,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ThreadStore for SlowStore {
        async fn load(&self, id: &ThreadId) -> Result<Option<Thread>> {
            let found = self.inner.load(id).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            found
        }

        async fn save(&self, thread: &Thread) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(thread).await
        }
    }

    #[test]
    fn test_thread_title_preview() {
        let mut thread = Thread::new(ThreadId::from_string("t-1"));
        assert_eq!(thread.title(), "Thread t-1");
        thread.messages.push(Message::user("How many orders shipped last week?"));
        assert_eq!(thread.title(), "How many orders shipped last week?");
        thread.title = Some("Orders".into());
        assert_eq!(thread.title(), "Orders");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryThreadStore::new();
        let thread = Thread::with_system_prompt(ThreadId::new(), "You are terse.");
        let id = thread.id.clone();

        store.save(&thread).await.unwrap();

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.messages[0].role, Role::System);
        assert!(store.load(&ThreadId::new()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_create_is_single_flight() {
        let store = Arc::new(SlowStore {
            inner: MemoryThreadStore::new(),
            saves: AtomicUsize::new(0),
        });
        let locks = Arc::new(KeyedLocks::new());
        let id = ThreadId::from_string("same-key");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let locks = Arc::clone(&locks);
                let id = id.clone();
                tokio::spawn(async move {
                    get_or_create(store.as_ref(), &locks, &id, Some("sys")).await
                })
            })
            .collect();

        for task in tasks {
            let thread = task.await.unwrap().unwrap();
            assert_eq!(thread.id, id);
        }
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.len().await, 1);
    }
}
