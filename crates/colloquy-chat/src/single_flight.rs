//! Per-conversation single-flight leases.
//!
//! A conversation may have at most one send-message session in progress.
//! Leases are released when their guard drops, so every exit path of the
//! owning task (including cancellation and panics) frees the conversation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// Process-wide set of conversations with a session in progress.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `conversation_id`, or `None` if it is already held.
    pub fn try_acquire(&self, conversation_id: Uuid) -> Option<InFlightGuard> {
        if self.lock().insert(conversation_id) {
            Some(InFlightGuard {
                conversation_id,
                active: Arc::clone(&self.active),
            })
        } else {
            None
        }
    }

    pub fn is_active(&self, conversation_id: Uuid) -> bool {
        self.lock().contains(&conversation_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    // The set stays consistent even if a holder panicked, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held lease on one conversation. Dropping it releases the conversation.
#[derive(Debug)]
pub struct InFlightGuard {
    conversation_id: Uuid,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlightGuard {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.conversation_id);
    }
}
