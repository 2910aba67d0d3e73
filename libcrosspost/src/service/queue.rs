//! Priority publish queue with scheduling and retries
//!
//! Tasks wait in a single priority-ordered vector. A polling loop ticks on a
//! fixed interval; each tick releases due wake-ups from the
//! [`ScheduleHeap`] and then dispatches at most one pending task, as long as
//! the queue is not paused and fewer than `max_concurrent` tasks are in
//! flight. A dispatched task delivers to its platforms one after another.
//!
//! Tasks that fail on some or all platforms are retried on the failed
//! platforms only, after `retry_base_delay × retry_count`. While waiting
//! they stay in the queue with their `partial`/`failed` status.
//!
//! Finished tasks (completed, exhausted, cancelled) move to a bounded
//! archive so their final state can still be looked up.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::schedule::{ScheduleHeap, Wakeup};
use super::tracker::PublishTrackerService;
use crate::config::{QueueConfig, MAX_RETRY_DELAY};
use crate::error::{CrosspostError, PlatformError, QueueError, Result};
use crate::platforms::manager::PlatformManager;
use crate::types::{
    Attempt, Content, PlatformResult, Priority, PublishOptions, PublishTask, TaskStatus,
};

/// Answer to a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: String,
    pub status: TaskStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Filters for [`PublishQueueService::get_queue_list`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub platform: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queued plus scheduled tasks
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub scheduled: usize,
    pub awaiting_retry: usize,
    pub in_flight: usize,
    pub paused: bool,
    pub by_platform: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    /// Priority order, dispatch from the front
    queue: Vec<PublishTask>,
    schedule: ScheduleHeap,
    in_flight: usize,
    /// Newest first
    finished: VecDeque<PublishTask>,
}

impl QueueState {
    /// Insert before the first task that would run later than `task`
    fn insert_by_priority(&mut self, task: PublishTask) {
        let rank = task.priority.rank();
        match self.queue.iter().position(|t| t.priority.rank() > rank) {
            Some(index) => self.queue.insert(index, task),
            None => self.queue.push(task),
        }
    }

    fn position(&self, task_id: &str) -> Option<usize> {
        self.queue.iter().position(|t| t.id == task_id)
    }
}

struct QueueInner {
    manager: Arc<PlatformManager>,
    tracker: PublishTrackerService,
    config: QueueConfig,
    state: Mutex<QueueState>,
    paused: AtomicBool,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Work left to do once the state lock is released
enum Followup {
    Retry {
        task_id: String,
        platforms: Vec<String>,
        retry_count: u32,
    },
    Finished {
        task_id: String,
        status: TaskStatus,
    },
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn archive(&self, state: &mut QueueState, task: PublishTask) {
        state.finished.push_front(task);
        state.finished.truncate(self.config.finished_capacity);
    }

    fn tick(self: &Arc<Self>) -> Option<String> {
        let now = Utc::now();
        let mut state = self.state();

        for wakeup in state.schedule.pop_due(now) {
            match wakeup {
                Wakeup::Scheduled(mut task) => {
                    info!(task_id = %task.id, "Scheduled task is due");
                    task.status = TaskStatus::Pending;
                    state.insert_by_priority(task);
                }
                Wakeup::Retry(task_id) => {
                    match state.queue.iter_mut().find(|t| t.id == task_id) {
                        Some(task) if task.awaiting_retry() => {
                            debug!(task_id = %task_id, retry = task.retry_count, "Retry is due");
                            task.status = TaskStatus::Pending;
                            task.next_attempt_at = None;
                        }
                        _ => debug!(task_id = %task_id, "Dropping stale retry wake-up"),
                    }
                }
            }
        }

        if self.paused.load(Ordering::SeqCst) || state.in_flight >= self.config.max_concurrent {
            return None;
        }

        let task = state
            .queue
            .iter_mut()
            .find(|t| t.status == TaskStatus::Pending)?;
        task.status = TaskStatus::Processing;
        task.attempts.push(Attempt {
            number: task.retry_count + 1,
            platforms: task.platforms.clone(),
            results: BTreeMap::new(),
            started_at: now,
            finished_at: None,
            outcome: None,
        });
        let snapshot = task.clone();
        state.in_flight += 1;
        drop(state);

        info!(
            task_id = %snapshot.id,
            attempt = snapshot.retry_count + 1,
            platforms = ?snapshot.platforms,
            "Dispatching task"
        );
        let task_id = snapshot.id.clone();
        self.spawn_execution(snapshot);
        Some(task_id)
    }

    fn spawn_execution(self: &Arc<Self>, task: PublishTask) {
        let job = tokio::spawn(deliver(
            Arc::clone(&self.manager),
            self.tracker.clone(),
            task.clone(),
        ));

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let results = match job.await {
                Ok(results) => results,
                Err(e) => {
                    error!(task_id = %task.id, "Task execution aborted: {}", e);
                    let reason = format!("Execution aborted: {}", e);
                    task.platforms
                        .iter()
                        .map(|platform| {
                            inner.tracker.track_failure(&task.id, platform, &reason);
                            PlatformResult::failed(platform.as_str(), reason.clone())
                        })
                        .collect()
                }
            };
            inner.complete(task, results);
        });
    }

    /// Fold the results of one attempt back into the queue
    fn complete(&self, snapshot: PublishTask, results: Vec<PlatformResult>) {
        let now = Utc::now();
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);

        let followup = match state.position(&snapshot.id) {
            None => {
                // Cleared while in flight: record the outcome, never retry
                let mut task = snapshot;
                apply_results(&mut task, &results, now);
                task.status = overall_status(&task);
                task.completed_at = Some(now);
                info!(task_id = %task.id, status = %task.status, "Task finished after being cleared");
                let followup = Followup::Finished {
                    task_id: task.id.clone(),
                    status: task.status,
                };
                self.archive(&mut state, task);
                followup
            }
            Some(index) => {
                let task = &mut state.queue[index];
                apply_results(task, &results, now);
                task.status = overall_status(task);

                let failed = task.failed_platforms();
                if task.status != TaskStatus::Completed
                    && task.retry_count < self.config.retry_limit
                    && !failed.is_empty()
                {
                    task.retry_count += 1;
                    task.platforms = failed.clone();
                    let delay = retry_delay(self.config.retry_base_delay, task.retry_count);
                    let next = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    task.next_attempt_at = Some(next);

                    warn!(
                        task_id = %task.id,
                        status = %task.status,
                        retry = task.retry_count,
                        failed = ?failed,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling retry"
                    );
                    let followup = Followup::Retry {
                        task_id: task.id.clone(),
                        platforms: failed,
                        retry_count: task.retry_count,
                    };
                    state.schedule.push(next, Wakeup::Retry(snapshot.id));
                    followup
                } else {
                    let mut task = state.queue.remove(index);
                    task.completed_at = Some(now);
                    task.next_attempt_at = None;
                    if task.status == TaskStatus::Completed {
                        info!(task_id = %task.id, "Task completed");
                    } else {
                        error!(
                            task_id = %task.id,
                            status = %task.status,
                            retries = task.retry_count,
                            "Task finished with failures"
                        );
                    }
                    let followup = Followup::Finished {
                        task_id: task.id.clone(),
                        status: task.status,
                    };
                    self.archive(&mut state, task);
                    followup
                }
            }
        };
        drop(state);

        match followup {
            Followup::Retry {
                task_id,
                platforms,
                retry_count,
            } => {
                for platform in &platforms {
                    self.tracker.track_retry(&task_id, platform, retry_count);
                }
            }
            Followup::Finished { task_id, status } => {
                self.tracker.track_finished(&task_id, status);
            }
        }
    }
}

/// Wait before retry `n`: `base × n`, capped at [`MAX_RETRY_DELAY`]
fn retry_delay(base: Duration, retry: u32) -> Duration {
    base.checked_mul(retry)
        .map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
}

/// Deliver one attempt, platform by platform
async fn deliver(
    manager: Arc<PlatformManager>,
    tracker: PublishTrackerService,
    task: PublishTask,
) -> Vec<PlatformResult> {
    let mut results = Vec::with_capacity(task.platforms.len());
    for platform in &task.platforms {
        tracker.track_start(&task.id, platform, &task.content);

        // Unregistered since submission: record it like any other failure
        let result = manager
            .publish(platform, &task.content, &task.options)
            .await
            .unwrap_or_else(|e| PlatformResult::failed(platform.as_str(), e.to_string()));

        if result.success {
            tracker.track_success(
                &task.id,
                platform,
                result.data.clone().unwrap_or(Value::Null),
            );
        } else {
            tracker.track_failure(
                &task.id,
                platform,
                result.error.as_deref().unwrap_or("unknown error"),
            );
        }
        results.push(result);
    }
    results
}

fn apply_results(task: &mut PublishTask, results: &[PlatformResult], now: DateTime<Utc>) {
    let succeeded = results.iter().filter(|r| r.success).count();
    if let Some(attempt) = task.attempts.last_mut() {
        attempt.results = results
            .iter()
            .map(|r| (r.platform.clone(), r.clone()))
            .collect();
        attempt.finished_at = Some(now);
        attempt.outcome = Some(TaskStatus::from_outcome(succeeded, results.len()));
    }
    for result in results {
        task.results.insert(result.platform.clone(), result.clone());
    }
}

/// Status over every target, using each platform's latest result
fn overall_status(task: &PublishTask) -> TaskStatus {
    let succeeded = task
        .targets
        .iter()
        .filter(|p| task.results.get(*p).is_some_and(|r| r.success))
        .count();
    TaskStatus::from_outcome(succeeded, task.targets.len())
}

/// Queue of publish tasks driven by a polling loop
#[derive(Clone)]
pub struct PublishQueueService {
    inner: Arc<QueueInner>,
}

impl PublishQueueService {
    pub fn new(
        manager: Arc<PlatformManager>,
        tracker: PublishTrackerService,
        config: QueueConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                manager,
                tracker,
                config,
                state: Mutex::new(QueueState::default()),
                paused: AtomicBool::new(false),
                shutdown,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Submit content for delivery
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty platform list, `NotRegistered` for an
    /// unknown platform.
    pub fn add_to_queue(
        &self,
        content: Content,
        platforms: Vec<String>,
        options: PublishOptions,
    ) -> Result<Submission> {
        let mut unique: Vec<String> = Vec::with_capacity(platforms.len());
        for platform in platforms {
            if !unique.contains(&platform) {
                unique.push(platform);
            }
        }
        if unique.is_empty() {
            return Err(CrosspostError::InvalidInput(
                "At least one platform is required".to_string(),
            ));
        }
        if let Some(unknown) = unique.iter().find(|p| !self.inner.manager.is_registered(p)) {
            return Err(PlatformError::NotRegistered(unknown.clone()).into());
        }

        let mut task = PublishTask::new(content, unique, options);
        let submission = Submission {
            task_id: task.id.clone(),
            status: TaskStatus::Pending,
            scheduled_at: task.scheduled_at,
        };

        let mut state = self.inner.state();
        match task.scheduled_at {
            Some(at) if at > Utc::now() => {
                task.status = TaskStatus::Scheduled;
                info!(
                    task_id = %task.id,
                    title = task.content.display_title(),
                    scheduled_at = %at,
                    "Task scheduled"
                );
                state.schedule.push(at, Wakeup::Scheduled(task));
                Ok(Submission {
                    status: TaskStatus::Scheduled,
                    ..submission
                })
            }
            _ => {
                info!(
                    task_id = %task.id,
                    title = task.content.display_title(),
                    priority = %task.priority,
                    platforms = ?task.platforms,
                    "Task queued"
                );
                state.insert_by_priority(task);
                Ok(submission)
            }
        }
    }

    /// Run one iteration of the loop by hand
    ///
    /// Returns the id of the task dispatched, if any.
    pub fn tick(&self) -> Option<String> {
        self.inner.tick()
    }

    /// Start the polling loop; a second call while running is ignored
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Queue loop already running");
            return;
        }

        self.inner.shutdown.send_replace(false);
        let mut shutdown = self.inner.shutdown.subscribe();
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval;

        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(tick_ms = period.as_millis() as u64, "Queue loop started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Queue loop stopped");
        }));
    }

    /// Stop the polling loop; in-flight tasks run to completion
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Queue loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel a task that is not currently being delivered
    ///
    /// # Errors
    ///
    /// `QueueError::InProgress` while the task is processing,
    /// `QueueError::NotFound` if it is neither queued nor scheduled.
    pub fn cancel_task(&self, task_id: &str) -> Result<PublishTask> {
        let mut state = self.inner.state();

        let mut task = if let Some(task) = state.schedule.remove_scheduled(task_id) {
            task
        } else {
            let index = state
                .position(task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
            if state.queue[index].status == TaskStatus::Processing {
                return Err(QueueError::InProgress(task_id.to_string()).into());
            }
            state.schedule.remove_retry(task_id);
            state.queue.remove(index)
        };

        task.status = TaskStatus::Cancelled;
        task.next_attempt_at = None;
        task.completed_at = Some(Utc::now());
        self.inner.archive(&mut state, task.clone());
        drop(state);

        info!(task_id, "Task cancelled");
        self.inner
            .tracker
            .track_finished(task_id, TaskStatus::Cancelled);
        Ok(task)
    }

    pub fn pause_queue(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("Queue paused");
    }

    pub fn resume_queue(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        info!("Queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Drop every queued and scheduled task
    ///
    /// Tasks being delivered finish their current attempt but are not
    /// retried. Returns the number of tasks dropped.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.inner.state();
        let queued = std::mem::take(&mut state.queue);
        let scheduled: Vec<PublishTask> = state.schedule.scheduled_tasks().cloned().collect();
        state.schedule.clear();

        let now = Utc::now();
        let mut dropped = Vec::new();
        for mut task in queued.into_iter().chain(scheduled) {
            if task.status == TaskStatus::Processing {
                continue;
            }
            task.status = TaskStatus::Cancelled;
            task.next_attempt_at = None;
            task.completed_at = Some(now);
            dropped.push(task.id.clone());
            self.inner.archive(&mut state, task);
        }
        drop(state);

        for task_id in &dropped {
            self.inner
                .tracker
                .track_finished(task_id, TaskStatus::Cancelled);
        }
        info!(dropped = dropped.len(), "Queue cleared");
        dropped.len()
    }

    /// A task wherever it currently is: queued, scheduled or archived
    pub fn get_task_status(&self, task_id: &str) -> Option<PublishTask> {
        let state = self.inner.state();
        state
            .queue
            .iter()
            .find(|t| t.id == task_id)
            .or_else(|| state.schedule.get_scheduled(task_id))
            .or_else(|| state.finished.iter().find(|t| t.id == task_id))
            .cloned()
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        let state = self.inner.state();

        let mut stats = QueueStats {
            total: state.queue.len() + state.schedule.scheduled_count(),
            pending: 0,
            processing: 0,
            scheduled: state.schedule.scheduled_count(),
            awaiting_retry: 0,
            in_flight: state.in_flight,
            paused: self.is_paused(),
            by_platform: BTreeMap::new(),
            by_priority: Priority::all()
                .iter()
                .map(|p| (p.to_string(), 0))
                .collect(),
            next_fire_at: state.schedule.next_fire_time(),
        };

        for task in state.queue.iter().chain(state.schedule.scheduled_tasks()) {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                _ if task.awaiting_retry() => stats.awaiting_retry += 1,
                _ => {}
            }
            for platform in &task.platforms {
                *stats.by_platform.entry(platform.clone()).or_default() += 1;
            }
            *stats
                .by_priority
                .entry(task.priority.to_string())
                .or_default() += 1;
        }

        stats
    }

    /// Queued tasks matching `filter`, newest first
    ///
    /// Scheduled tasks are not listed until they are due.
    pub fn get_queue_list(&self, filter: &QueueFilter) -> Vec<PublishTask> {
        let state = self.inner.state();
        let mut tasks: Vec<PublishTask> = state
            .queue
            .iter()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.priority.map_or(true, |p| t.priority == p))
            .filter(|t| {
                filter
                    .platform
                    .as_deref()
                    .map_or(true, |p| t.targets_platform(p))
            })
            .cloned()
            .collect();
        drop(state);

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Ids of queued tasks in dispatch order
    pub fn queue_order(&self) -> Vec<String> {
        self.inner.state().queue.iter().map(|t| t.id.clone()).collect()
    }

    /// When the earliest scheduled task or retry is due
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.inner.state().schedule.next_fire_time()
    }

    /// Nothing queued, scheduled or in flight
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state();
        state.queue.is_empty() && state.schedule.is_empty() && state.in_flight == 0
    }

    pub fn tracker(&self) -> &PublishTrackerService {
        &self.inner.tracker
    }
}
