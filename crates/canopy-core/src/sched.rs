//! Cooperative task scheduler
//!
//! Delayed one-shot and periodic tasks, driven by an explicit tick: the
//! owner calls [`Scheduler::poll_due`] once per tick and executes the
//! returned batch. Tasks added while a batch is being serviced are never
//! part of that batch, so a one-shot with zero delay still waits for the
//! next tick instead of running inline.
//!
//! The payload type is chosen by the owner (the node uses an enum of task
//! kinds), which keeps the scheduler free of callbacks into mesh state.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle to a scheduled task, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// How often a task fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Fire once and forget
    Once,
    /// Fire the given number of times
    Times(u32),
    /// Fire until cancelled
    Forever,
}

/// A task popped from the scheduler
///
/// After executing the payload, hand the entry back to
/// [`Scheduler::requeue`] so periodic tasks re-arm from their scheduled
/// deadline (not from dispatch time).
#[derive(Debug)]
pub struct TaskEntry<T> {
    pub handle: TaskHandle,
    pub payload: T,
    fire_at_us: u64,
    period_us: u64,
    repeat: Repeat,
}

impl<T> TaskEntry<T> {
    /// The deadline this entry fired at
    pub fn fire_at_us(&self) -> u64 {
        self.fire_at_us
    }
}

struct Slot<T> {
    fire_at_us: u64,
    seq: u64,
    entry: TaskEntry<T>,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_us == other.fire_at_us && self.seq == other.seq
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    // Reversed so the BinaryHeap pops the earliest deadline first;
    // insertion order breaks ties.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at_us
            .cmp(&self.fire_at_us)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Deadline-ordered task queue
pub struct Scheduler<T> {
    heap: BinaryHeap<Slot<T>>,
    live: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_handle: u64,
    next_seq: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            next_handle: 1,
            next_seq: 0,
        }
    }

    /// Schedule a one-shot task `delay` from `now_us`
    pub fn add_once(&mut self, now_us: u64, delay: Duration, payload: T) -> TaskHandle {
        self.add(now_us, delay, delay, Repeat::Once, payload)
    }

    /// Schedule a task firing every `period` until cancelled
    ///
    /// The first firing is one full period from `now_us`.
    pub fn add_periodic(&mut self, now_us: u64, period: Duration, payload: T) -> TaskHandle {
        self.add(now_us, period, period, Repeat::Forever, payload)
    }

    /// Full-control scheduling: first fire after `delay`, then every
    /// `period` according to `repeat`
    pub fn add(
        &mut self,
        now_us: u64,
        delay: Duration,
        period: Duration,
        repeat: Repeat,
        payload: T,
    ) -> TaskHandle {
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        let fire_at_us = now_us.saturating_add(delay.as_micros() as u64);
        self.push(TaskEntry {
            handle,
            payload,
            fire_at_us,
            period_us: period.as_micros() as u64,
            repeat,
        });
        handle
    }

    fn push(&mut self, entry: TaskEntry<T>) {
        self.live.insert(entry.handle.0);
        let slot = Slot {
            fire_at_us: entry.fire_at_us,
            seq: self.next_seq,
            entry,
        };
        self.next_seq += 1;
        self.heap.push(slot);
    }

    /// Cancel a task; a no-op if it already ran or was never scheduled
    pub fn cancel(&mut self, handle: TaskHandle) {
        if self.live.remove(&handle.0) {
            self.cancelled.insert(handle.0);
        }
    }

    /// Drop every outstanding task
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.cancelled.clear();
    }

    /// Number of live (not cancelled) tasks
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Pop every task due at or before `now_us`
    ///
    /// Call once per tick. Anything scheduled while the returned batch is
    /// being serviced lands in a later tick by construction.
    pub fn poll_due(&mut self, now_us: u64) -> Vec<TaskEntry<T>> {
        let mut due = Vec::new();
        while let Some(slot) = self.heap.peek() {
            if slot.fire_at_us > now_us {
                break;
            }
            let slot = match self.heap.pop() {
                Some(s) => s,
                None => break,
            };
            if self.cancelled.remove(&slot.entry.handle.0) {
                continue;
            }
            self.live.remove(&slot.entry.handle.0);
            due.push(slot.entry);
        }
        due
    }

    /// Re-arm a periodic entry from its scheduled deadline
    ///
    /// Returns `true` if the task was re-armed, `false` if it is done.
    pub fn requeue(&mut self, mut entry: TaskEntry<T>) -> bool {
        let again = match entry.repeat {
            Repeat::Once => false,
            Repeat::Forever => true,
            Repeat::Times(n) => {
                if n > 1 {
                    entry.repeat = Repeat::Times(n - 1);
                    true
                } else {
                    false
                }
            }
        };
        if again {
            entry.fire_at_us = entry.fire_at_us.saturating_add(entry.period_us.max(1));
            self.push(entry);
        }
        again
    }
}
