//! Time-ordered wake-ups for the queue
//!
//! Future-scheduled tasks and retry wake-ups share one min-heap keyed by
//! fire time. The queue loop drains due entries on every tick, so there is
//! no timer per task and [`ScheduleHeap::next_fire_time`] is always known.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::types::PublishTask;

#[derive(Debug, Clone, PartialEq)]
pub enum Wakeup {
    /// A task held back until its scheduled time
    Scheduled(PublishTask),
    /// Retry wake-up for a task still sitting in the queue
    Retry(String),
}

impl Wakeup {
    pub fn task_id(&self) -> &str {
        match self {
            Wakeup::Scheduled(task) => &task.id,
            Wakeup::Retry(id) => id,
        }
    }
}

#[derive(Debug)]
struct Entry {
    fire_at: DateTime<Utc>,
    // Insertion order, keeps equal fire times FIFO
    seq: u64,
    wakeup: Wakeup,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl Entry {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.fire_at, self.seq)
    }
}

#[derive(Debug, Default)]
pub struct ScheduleHeap {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl ScheduleHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fire_at: DateTime<Utc>, wakeup: Wakeup) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            fire_at,
            seq,
            wakeup,
        }));
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Wakeup> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.fire_at <= now)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.wakeup);
            }
        }
        due
    }

    /// Remove a scheduled task, returning it if it was held here
    pub fn remove_scheduled(&mut self, task_id: &str) -> Option<PublishTask> {
        let mut removed = None;
        self.heap.retain(|Reverse(entry)| match &entry.wakeup {
            Wakeup::Scheduled(task) if task.id == task_id && removed.is_none() => {
                removed = Some(task.clone());
                false
            }
            _ => true,
        });
        removed
    }

    /// Drop any retry wake-up for a task
    pub fn remove_retry(&mut self, task_id: &str) {
        self.heap
            .retain(|Reverse(entry)| !matches!(&entry.wakeup, Wakeup::Retry(id) if id == task_id));
    }

    pub fn get_scheduled(&self, task_id: &str) -> Option<&PublishTask> {
        self.heap.iter().find_map(|Reverse(entry)| match &entry.wakeup {
            Wakeup::Scheduled(task) if task.id == task_id => Some(task),
            _ => None,
        })
    }

    pub fn scheduled_tasks(&self) -> impl Iterator<Item = &PublishTask> {
        self.heap.iter().filter_map(|Reverse(entry)| match &entry.wakeup {
            Wakeup::Scheduled(task) => Some(task),
            Wakeup::Retry(_) => None,
        })
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled_tasks().count()
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(entry)| entry.fire_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
