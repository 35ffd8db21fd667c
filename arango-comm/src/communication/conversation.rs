//! Host affinity: pins every request made by one unit of work to a single host.
//!
//! A unit of work is the tokio task that required the conversation, or the OS thread when not running inside a task.

use crate::error::CommunicationError;
use crate::host::HostDescription;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationLevel {
    /// Requests fail with [`CommunicationError::HostNotAvailable`] rather than go to another host.
    Required,
    /// Requests go to another host when the pinned host is not usable.
    Preferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    host: HostDescription,
    level: ConversationLevel,
}

impl Conversation {
    pub fn new(host: HostDescription, level: ConversationLevel) -> Self {
        Conversation { host, level }
    }

    pub fn host(&self) -> &HostDescription {
        &self.host
    }

    pub fn level(&self) -> ConversationLevel {
        self.level
    }

    pub fn is_required(&self) -> bool {
        self.level == ConversationLevel::Required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOfWork {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl UnitOfWork {
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => UnitOfWork::Task(id),
            None => UnitOfWork::Thread(std::thread::current().id()),
        }
    }
}

#[derive(Default)]
pub struct ConversationManager {
    bindings: Mutex<HashMap<UnitOfWork, Conversation>>,
}

impl ConversationManager {
    pub fn new() -> Arc<Self> {
        Arc::new(ConversationManager::default())
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<UnitOfWork, Conversation>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `conversation` to the calling unit of work until the returned guard is released or dropped.
    pub fn bind(
        self: &Arc<Self>,
        conversation: Conversation,
    ) -> Result<ConversationGuard, CommunicationError> {
        let owner = UnitOfWork::current();
        let mut bindings = self.bindings();
        if bindings.contains_key(&owner) {
            return Err(CommunicationError::ConversationAlreadyBound);
        }
        bindings.insert(owner, conversation.clone());
        tracing::debug!("bound conversation with {} to {owner:?}", conversation.host());
        Ok(ConversationGuard {
            manager: self.clone(),
            owner,
            conversation,
            released: AtomicBool::new(false),
        })
    }

    /// The conversation bound to the calling unit of work.
    pub fn current(&self) -> Option<Conversation> {
        self.bindings().get(&UnitOfWork::current()).cloned()
    }

    pub fn len(&self) -> usize {
        self.bindings().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unbind(&self, owner: UnitOfWork) {
        self.bindings().remove(&owner);
    }
}

/// Keeps a conversation bound to the unit of work that required it.
#[must_use = "the conversation is released as soon as the guard is dropped"]
pub struct ConversationGuard {
    manager: Arc<ConversationManager>,
    owner: UnitOfWork,
    conversation: Conversation,
    released: AtomicBool,
}

impl ConversationGuard {
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Unbinds the conversation. Must be called from the unit of work that required it.
    /// Releasing an already released conversation does nothing.
    pub fn release(&self) -> Result<(), CommunicationError> {
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        if UnitOfWork::current() != self.owner {
            return Err(CommunicationError::ConversationOwnership);
        }
        if !self.released.swap(true, Ordering::AcqRel) {
            self.manager.unbind(self.owner);
            tracing::debug!(
                "released conversation with {}",
                self.conversation.host()
            );
        }
        Ok(())
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "conversation with {} was never released, releasing it now",
                self.conversation.host()
            );
            self.manager.unbind(self.owner);
        }
    }
}

impl std::fmt::Debug for ConversationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationGuard")
            .field("owner", &self.owner)
            .field("conversation", &self.conversation)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
