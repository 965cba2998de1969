//! Offline message queue
//!
//! Messages produced while the mesh has no internet are held in a bounded
//! queue with four priorities. When the queue is full, an enqueue may
//! evict the oldest message of a class no higher than its own — so
//! Critical can displace anything below it, and a queue holding only
//! Critical rejects even new Critical. Flushing drains priority-first,
//! FIFO within a priority.

use serde_json::Value;
use tracing::{debug, warn};

use canopy_core::QueueError;

/// Default queue capacity
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50;

/// Priority levels for queued messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Low priority - can be delayed
    Low,
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority - deliver ASAP
    High,
    /// Critical - never drop
    Critical,
}

impl Priority {
    const ALL_ASCENDING: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];
}

/// One queued message
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Target URL for the eventual internet delivery
    pub url: String,
    pub payload: Value,
    pub priority: Priority,
    pub queued_at_us: u64,
    seq: u64,
}

/// What an enqueue did
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Stored without displacing anything
    Queued,
    /// Stored after evicting the returned message
    Evicted(QueuedMessage),
}

/// Bounded four-priority store-and-flush queue
#[derive(Debug)]
pub struct OfflineQueue {
    entries: Vec<QueuedMessage>,
    max_size: usize,
    next_seq: u64,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size: max_size.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Count of messages at one priority
    pub fn count(&self, priority: Priority) -> usize {
        self.entries.iter().filter(|m| m.priority == priority).count()
    }

    /// Store a message, never blocking
    ///
    /// On a full queue the oldest message of the lowest evictable class is
    /// dropped to make room. Critical evicts up to High; everything else
    /// evicts only classes at or below its own. [`QueueError::Full`] means
    /// nothing was evictable and the caller should fire its queue-full
    /// notification.
    pub fn enqueue(
        &mut self,
        url: String,
        payload: Value,
        priority: Priority,
        now_us: u64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let evicted = if self.entries.len() >= self.max_size {
            match self.evict_for(priority) {
                Some(victim) => Some(victim),
                None => {
                    warn!(?priority, len = self.entries.len(), "offline queue full");
                    return Err(QueueError::Full);
                }
            }
        } else {
            None
        };

        self.next_seq += 1;
        self.entries.push(QueuedMessage {
            url,
            payload,
            priority,
            queued_at_us: now_us,
            seq: self.next_seq,
        });
        debug!(?priority, len = self.entries.len(), "message queued");

        Ok(match evicted {
            Some(m) => EnqueueOutcome::Evicted(m),
            None => EnqueueOutcome::Queued,
        })
    }

    /// Evict the oldest message of the lowest class at or below
    /// `incoming`, never touching Critical
    fn evict_for(&mut self, incoming: Priority) -> Option<QueuedMessage> {
        for class in Priority::ALL_ASCENDING {
            if class > incoming || class == Priority::Critical {
                break;
            }
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, m)| m.priority == class)
                .min_by_key(|(_, m)| m.seq)
                .map(|(i, _)| i);
            if let Some(idx) = oldest {
                let victim = self.entries.remove(idx);
                debug!(?victim.priority, "evicted queued message");
                return Some(victim);
            }
        }
        None
    }

    /// Pop the next message in flush order: highest priority first, FIFO
    /// within a priority
    pub fn pop_next(&mut self) -> Option<QueuedMessage> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, m)| (m.priority, std::cmp::Reverse(m.seq)))
            .map(|(i, _)| i)?;
        Some(self.entries.remove(idx))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
