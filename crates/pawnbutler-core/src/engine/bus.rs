// Pawnbutler Core — Message Bus
// In-process mailbox fabric for inter-agent messages. One handler per
// recipient, FIFO delivery, bounded history with oldest-first eviction.
// Strictly single-process: there is no network transport here.

use std::collections::{HashMap, VecDeque};

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::atoms::constants::BUS_HISTORY_CAPACITY;
use crate::atoms::error::EngineResult;
use crate::atoms::types::AgentMessage;

/// The single handler registered per recipient. Delivery is synchronous;
/// handlers that need to do real work should enqueue into their own task
/// (the engine's agent loops do exactly that).
pub type MessageHandler = Box<dyn Fn(AgentMessage) + Send + Sync>;

pub struct MessageBus {
    handlers: RwLock<HashMap<String, MessageHandler>>,
    history: Mutex<VecDeque<AgentMessage>>,
    capacity: usize,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MessageBus {
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Register the handler for a recipient. Re-registration replaces the
    /// previous handler (an agent restarting re-claims its mailbox).
    pub fn register(&self, agent_id: &str, handler: MessageHandler) {
        self.handlers.write().insert(agent_id.to_string(), handler);
    }

    /// Remove a recipient's handler.
    pub fn unregister(&self, agent_id: &str) {
        self.handlers.write().remove(agent_id);
    }

    pub fn recipients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deliver one message. Appends to history (evicting the oldest past
    /// capacity) and invokes the recipient's handler in the caller's
    /// context, which preserves per-recipient FIFO order.
    pub fn send(&self, message: AgentMessage) -> EngineResult<()> {
        self.record(&message);
        let handlers = self.handlers.read();
        match handlers.get(&message.to) {
            Some(handler) => {
                handler(message);
                Ok(())
            }
            None => {
                warn!("[bus] No handler registered for '{}'", message.to);
                Err(format!("No handler registered for agent '{}'", message.to).into())
            }
        }
    }

    /// Deliver to every registered recipient except the sender.
    pub fn broadcast(&self, message: AgentMessage) {
        self.record(&message);
        let handlers = self.handlers.read();
        for (agent_id, handler) in handlers.iter() {
            if *agent_id == message.from {
                continue;
            }
            let mut copy = message.clone();
            copy.to = agent_id.clone();
            handler(copy);
        }
    }

    /// The most recent messages, optionally filtered to those an agent
    /// participated in (as sender or recipient). Returns at most `limit`.
    pub fn history(&self, agent_id: Option<&str>, limit: Option<usize>) -> Vec<AgentMessage> {
        let history = self.history.lock();
        let filtered: Vec<AgentMessage> = history
            .iter()
            .filter(|m| match agent_id {
                Some(id) => m.from == id || m.to == id,
                None => true,
            })
            .cloned()
            .collect();
        match limit {
            Some(n) => {
                let skip = filtered.len().saturating_sub(n);
                filtered.into_iter().skip(skip).collect()
            }
            None => filtered,
        }
    }

    fn record(&self, message: &AgentMessage) {
        let mut history = self.history.lock();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(message.clone());
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
