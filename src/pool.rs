//! Free list of decoded messages.
//!
//! A [`PooledMessage`] is the only handle to a pooled [`Message`]: it is
//! checked out with [`MessagePool::checkout`] and goes back to the pool when
//! dropped, so a message is returned exactly once and cannot be touched
//! afterwards. Checked-out messages may still hold data from a previous use;
//! callers fill them with [`Message::decode_into`] before reading.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::dns::Message;

/// Maximum number of idle messages kept for reuse.
const DEFAULT_MAX_IDLE: usize = 256;

struct Shared {
    idle: Mutex<Vec<Message>>,
    max_idle: usize,
}

/// A shared pool of reusable [`Message`] values.
#[derive(Clone)]
pub struct MessagePool {
    shared: Arc<Shared>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
            }),
        }
    }

    /// Take a message out of the pool, allocating one if none is idle.
    pub fn checkout(&self) -> PooledMessage {
        let message = self
            .shared
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_default();

        PooledMessage {
            message: Some(message),
            pool: self.clone(),
        }
    }

    /// Number of idle messages waiting for reuse.
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn put(&self, message: Message) {
        if let Ok(mut idle) = self.shared.idle.lock() {
            if idle.len() < self.shared.max_idle {
                idle.push(message);
            }
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A message checked out of a [`MessagePool`]; returned on drop.
pub struct PooledMessage {
    message: Option<Message>,
    pool: MessagePool,
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        // Only `None` once `drop` has run.
        self.message.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        self.message.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.pool.put(message);
        }
    }
}

impl std::fmt::Debug for PooledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledMessage").field(&**self).finish()
    }
}
