//! Deferred work for the next flush.
//!
//! Ingestion applies its direct effects synchronously; consequences such as
//! orphan checks and live-set refreshes are queued here and run in FIFO
//! order when the owner calls `flush`.

use std::collections::VecDeque;

use indexmap::IndexSet;
use recordcache_core::ids::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Decide whether an unloaded resource's island can be destroyed.
    DestroyCheck(ResourceKey),
    /// Apply batched live-set membership changes.
    FlushLiveSets,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    queue: VecDeque<Task>,
    scheduled_destroys: IndexSet<ResourceKey>,
    live_flush_queued: bool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_destroy(&mut self, key: ResourceKey) {
        if self.scheduled_destroys.insert(key) {
            self.queue.push_back(Task::DestroyCheck(key));
        }
    }

    /// Withdraw a pending destroy check. Calling this for a key that was
    /// never scheduled, or already destroyed, does nothing.
    pub fn cancel_destroy(&mut self, key: ResourceKey) -> bool {
        if !self.scheduled_destroys.shift_remove(&key) {
            return false;
        }
        self.queue.retain(|task| *task != Task::DestroyCheck(key));
        true
    }

    pub fn is_destroy_scheduled(&self, key: ResourceKey) -> bool {
        self.scheduled_destroys.contains(&key)
    }

    /// Only one live-set refresh is ever queued at a time.
    pub fn schedule_live_flush(&mut self) {
        if !self.live_flush_queued {
            self.live_flush_queued = true;
            self.queue.push_back(Task::FlushLiveSets);
        }
    }

    pub fn pop(&mut self) -> Option<Task> {
        let task = self.queue.pop_front()?;
        match task {
            Task::DestroyCheck(key) => {
                self.scheduled_destroys.shift_remove(&key);
            }
            Task::FlushLiveSets => self.live_flush_queued = false,
        }
        Some(task)
    }

    /// Replace `loser` with `survivor` in queued destroy checks.
    pub fn rekey(&mut self, loser: ResourceKey, survivor: ResourceKey) {
        if !self.scheduled_destroys.shift_remove(&loser) {
            return;
        }
        self.queue.retain(|task| *task != Task::DestroyCheck(loser));
        self.schedule_destroy(survivor);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
