//! Publish tracking: lifecycle history, statistics and subscriptions
//!
//! The tracker keeps a bounded, newest-first history of per-platform
//! delivery records and a set of per-platform counters. Counters for a
//! platform are always updated together under one lock, so
//! `total == success + failed` holds whenever they can be observed.
//!
//! Statistics reads are served from a short-lived cache that every write
//! clears, so a read right after a write always sees that write.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::events::{EventBus, EventReceiver, TrackEvent};
use crate::config::TrackerConfig;
use crate::types::{Content, TaskStatus};

/// Relative change in hourly successes needed to call a trend
const TREND_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Processing,
    Success,
    Failed,
    Retrying,
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackStatus::Processing => "processing",
            TrackStatus::Success => "success",
            TrackStatus::Failed => "failed",
            TrackStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

impl FromStr for TrackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processing" => Ok(TrackStatus::Processing),
            "success" => Ok(TrackStatus::Success),
            "failed" => Ok(TrackStatus::Failed),
            "retrying" => Ok(TrackStatus::Retrying),
            _ => Err(format!("Invalid track status: '{}'", s)),
        }
    }
}

/// One delivery of one task to one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRecord {
    pub task_id: String,
    pub platform: String,
    pub content_title: String,
    pub status: TrackStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end
    pub duration: Option<u64>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub retry_count: Option<u32>,
}

/// Counters and timings for one platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Deliveries started but not yet finished
    pub in_flight: u64,
    pub last_publish: Option<DateTime<Utc>>,
    pub avg_processing_ms: u64,
    #[serde(skip)]
    recent_durations: VecDeque<u64>,
}

impl PlatformStats {
    fn record(&mut self, success: bool, duration_ms: u64, window: usize, at: DateTime<Utc>) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_publish = Some(at);

        self.recent_durations.push_back(duration_ms);
        while self.recent_durations.len() > window {
            self.recent_durations.pop_front();
        }
        let sum: u64 = self.recent_durations.iter().sum();
        self.avg_processing_ms =
            (sum as f64 / self.recent_durations.len() as f64).round() as u64;
    }

    /// Durations currently in the rolling window, oldest first
    pub fn recent_durations(&self) -> impl Iterator<Item = u64> + '_ {
        self.recent_durations.iter().copied()
    }

    pub fn success_rate(&self) -> u32 {
        percent(self.success, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSummary {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    /// Classify by comparing successes in two consecutive windows
    pub fn classify(current: usize, previous: usize) -> Self {
        let current = current as f64;
        let previous = previous as f64;
        if current > previous * (1.0 + TREND_THRESHOLD) {
            Trend::Increasing
        } else if current < previous * (1.0 - TREND_THRESHOLD) {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCount {
    pub total: usize,
    pub success: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTrend {
    pub last_hour: WindowCount,
    pub previous_hour: WindowCount,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub success_rate: u32,
    pub avg_processing_ms: u64,
    pub by_platform: BTreeMap<String, PlatformSummary>,
    pub recent_trend: RecentTrend,
}

/// Answer of [`PublishTrackerService::get_stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsReport {
    Platform(PlatformStats),
    Global(GlobalStats),
}

/// Filters for [`PublishTrackerService::get_history`]
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub platform: Option<String>,
    pub status: Option<TrackStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub task_id: String,
    pub platform: String,
    pub content_title: String,
    pub error: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessRate {
    pub rate: u32,
    pub total: usize,
    pub success: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(format!(
                "Invalid export format: '{}'. Valid options: json, csv",
                s
            )),
        }
    }
}

/// Receiver side of a per-task subscription
///
/// Dropping the subscription unsubscribes it. The stream ends (`recv`
/// returns `None`) once the task finishes.
pub struct Subscription {
    id: u64,
    task_id: String,
    receiver: mpsc::UnboundedReceiver<TrackEvent>,
    tracker: Weak<TrackerInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the next event, `None` once the task has finished
    pub async fn recv(&mut self) -> Option<TrackEvent> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, if any
    pub fn try_recv(&mut self) -> Option<TrackEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.tracker.upgrade() {
            inner.remove_subscriber(&self.task_id, self.id);
        }
    }
}

struct CachedReport {
    computed_at: Instant,
    report: StatsReport,
}

#[derive(Default)]
struct TrackerState {
    /// Newest first
    history: VecDeque<TrackRecord>,
    platforms: BTreeMap<String, PlatformStats>,
    cache: HashMap<String, CachedReport>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<TrackEvent>)>>,
}

struct TrackerInner {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    bus: EventBus,
    next_subscription: AtomicU64,
}

impl TrackerInner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_subscriber(&self, task_id: &str, id: u64) {
        let mut state = self.state();
        if let Some(list) = state.subscribers.get_mut(task_id) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                state.subscribers.remove(task_id);
            }
        }
    }
}

/// Drop the oldest closed records until `history` fits in `capacity`
///
/// Open records are never dropped, so a slow delivery is still counted when
/// it finishes.
fn trim_history(history: &mut VecDeque<TrackRecord>, capacity: usize) {
    while history.len() > capacity {
        match history
            .iter()
            .rposition(|r| r.status != TrackStatus::Processing)
        {
            Some(index) => {
                history.remove(index);
            }
            None => break,
        }
    }
}

/// Records publish lifecycle events and derives statistics from them
#[derive(Clone)]
pub struct PublishTrackerService {
    inner: Arc<TrackerInner>,
}

impl PublishTrackerService {
    pub fn new(config: TrackerConfig) -> Self {
        let bus = EventBus::new(config.event_capacity.max(1));
        Self {
            inner: Arc::new(TrackerInner {
                config,
                state: Mutex::new(TrackerState::default()),
                bus,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Seed zeroed stats so a platform shows up before its first publish
    pub fn register_platform(&self, platform: &str) {
        let mut state = self.inner.state();
        state.platforms.entry(platform.to_string()).or_default();
        state.cache.clear();
    }

    /// Open a record for a delivery that is starting now
    pub fn track_start(&self, task_id: &str, platform: &str, content: &Content) -> TrackRecord {
        let record = TrackRecord {
            task_id: task_id.to_string(),
            platform: platform.to_string(),
            content_title: content.display_title().to_string(),
            status: TrackStatus::Processing,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            error: None,
            result: None,
            retry_count: None,
        };

        {
            let mut state = self.inner.state();
            state.history.push_front(record.clone());
            trim_history(&mut state.history, self.inner.config.history_capacity);
            state
                .platforms
                .entry(platform.to_string())
                .or_default()
                .in_flight += 1;
            state.cache.clear();

            self.notify(
                &mut state,
                TrackEvent::Started {
                    task_id: task_id.to_string(),
                    platform: platform.to_string(),
                    title: record.content_title.clone(),
                },
            );
        }

        info!(task_id, platform, "Tracking started");
        record
    }

    /// Close the open record for `(task_id, platform)` as a success
    ///
    /// Returns `None` (and changes nothing) if no open record exists.
    pub fn track_success(&self, task_id: &str, platform: &str, result: Value) -> Option<TrackRecord> {
        let record = self.finish(task_id, platform, Ok(result))?;
        info!(
            task_id,
            platform,
            duration_ms = record.duration.unwrap_or_default(),
            "Publish tracked as success"
        );
        Some(record)
    }

    /// Close the open record for `(task_id, platform)` as a failure
    pub fn track_failure(&self, task_id: &str, platform: &str, error: &str) -> Option<TrackRecord> {
        let record = self.finish(task_id, platform, Err(error.to_string()))?;
        error!(task_id, platform, error, "Publish tracked as failure");
        Some(record)
    }

    fn finish(
        &self,
        task_id: &str,
        platform: &str,
        outcome: Result<Value, String>,
    ) -> Option<TrackRecord> {
        let mut state = self.inner.state();

        let Some(record) = state.history.iter_mut().find(|r| {
            r.task_id == task_id && r.platform == platform && r.status == TrackStatus::Processing
        }) else {
            debug!(task_id, platform, "No open record to close");
            return None;
        };

        let now = Utc::now();
        let duration = (now - record.start_time).num_milliseconds().max(0) as u64;
        record.end_time = Some(now);
        record.duration = Some(duration);

        let success = outcome.is_ok();
        let event = match outcome {
            Ok(result) => {
                record.status = TrackStatus::Success;
                record.result = Some(result.clone());
                TrackEvent::Succeeded {
                    task_id: task_id.to_string(),
                    platform: platform.to_string(),
                    duration_ms: duration,
                    result,
                }
            }
            Err(error) => {
                record.status = TrackStatus::Failed;
                record.error = Some(error.clone());
                TrackEvent::Failed {
                    task_id: task_id.to_string(),
                    platform: platform.to_string(),
                    duration_ms: duration,
                    error,
                }
            }
        };
        let closed = record.clone();

        let window = self.inner.config.duration_window;
        state
            .platforms
            .entry(platform.to_string())
            .or_default()
            .record(success, duration, window, now);
        trim_history(&mut state.history, self.inner.config.history_capacity);
        state.cache.clear();

        self.notify(&mut state, event);
        Some(closed)
    }

    /// Mark the latest record for `(task_id, platform)` as awaiting a retry
    pub fn track_retry(&self, task_id: &str, platform: &str, retry_count: u32) -> Option<TrackRecord> {
        let mut state = self.inner.state();
        let record = state
            .history
            .iter_mut()
            .find(|r| r.task_id == task_id && r.platform == platform)?;
        record.status = TrackStatus::Retrying;
        record.retry_count = Some(retry_count);
        let updated = record.clone();
        state.cache.clear();

        self.notify(
            &mut state,
            TrackEvent::Retrying {
                task_id: task_id.to_string(),
                platform: platform.to_string(),
                retry_count,
            },
        );
        drop(state);

        info!(task_id, platform, retry_count, "Retry tracked");
        Some(updated)
    }

    /// Announce a task's terminal status and close its subscriptions
    pub fn track_finished(&self, task_id: &str, status: TaskStatus) {
        let mut state = self.inner.state();
        self.notify(
            &mut state,
            TrackEvent::Finished {
                task_id: task_id.to_string(),
                status,
            },
        );
        // Dropping the senders ends every receiver's stream
        state.subscribers.remove(task_id);
    }

    fn notify(&self, state: &mut TrackerState, event: TrackEvent) {
        let task_id = event.task_id().to_string();
        if let Some(list) = state.subscribers.get_mut(&task_id) {
            list.retain(|(id, sender)| match sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    warn!(task_id = %task_id, subscription = id, "Subscriber went away, removing it");
                    false
                }
            });
            if list.is_empty() {
                state.subscribers.remove(&task_id);
            }
        }
        self.inner.bus.emit(event);
    }

    /// Subscribe to the events of one task
    pub fn subscribe(&self, task_id: &str) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .state()
            .subscribers
            .entry(task_id.to_string())
            .or_default()
            .push((id, sender));

        Subscription {
            id,
            task_id: task_id.to_string(),
            receiver,
            tracker: Arc::downgrade(&self.inner),
        }
    }

    /// Explicitly end a subscription (equivalent to dropping it)
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.inner
            .state()
            .subscribers
            .get(task_id)
            .map_or(0, Vec::len)
    }

    /// Receive every event of every task
    pub fn subscribe_all(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }

    /// Records matching `query`, newest first
    pub fn get_history(&self, query: &HistoryQuery) -> Vec<TrackRecord> {
        let state = self.inner.state();
        state
            .history
            .iter()
            .filter(|r| query.platform.as_deref().map_or(true, |p| r.platform == p))
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| query.since.map_or(true, |t| r.start_time >= t))
            .filter(|r| query.until.map_or(true, |t| r.start_time <= t))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner.state().history.len()
    }

    /// Statistics for one platform, or the global aggregate for `None`
    ///
    /// Served from cache while younger than the configured TTL.
    pub fn get_stats(&self, platform: Option<&str>) -> StatsReport {
        let key = platform.unwrap_or("*").to_string();
        let ttl = self.inner.config.stats_ttl;

        let mut state = self.inner.state();
        if let Some(cached) = state.cache.get(&key) {
            if cached.computed_at.elapsed() < ttl {
                return cached.report.clone();
            }
        }

        let report = compute_stats(&state, platform, Utc::now());
        state.cache.insert(
            key,
            CachedReport {
                computed_at: Instant::now(),
                report: report.clone(),
            },
        );
        report
    }

    /// Statistics recomputed from scratch, bypassing the cache
    pub fn fresh_stats(&self, platform: Option<&str>) -> StatsReport {
        let state = self.inner.state();
        compute_stats(&state, platform, Utc::now())
    }

    /// The latest failed records, newest first
    pub fn get_recent_errors(&self, limit: usize) -> Vec<ErrorSummary> {
        let state = self.inner.state();
        state
            .history
            .iter()
            .filter(|r| r.status == TrackStatus::Failed)
            .take(limit)
            .map(|r| ErrorSummary {
                task_id: r.task_id.clone(),
                platform: r.platform.clone(),
                content_title: r.content_title.clone(),
                error: r.error.clone(),
                time: r.end_time,
            })
            .collect()
    }

    /// Success rate of records started within `[start, end]`
    pub fn get_success_rate_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SuccessRate {
        let state = self.inner.state();
        let (total, success) = state
            .history
            .iter()
            .filter(|r| r.start_time >= start && r.start_time <= end)
            .fold((0, 0), |(total, success), r| {
                (total + 1, success + usize::from(r.status == TrackStatus::Success))
            });

        SuccessRate {
            rate: percent(success as u64, total as u64),
            total,
            success,
        }
    }

    /// Serialize the whole history, newest first
    pub fn export_history(&self, format: ExportFormat) -> String {
        let state = self.inner.state();
        match format {
            ExportFormat::Json => {
                let records: Vec<&TrackRecord> = state.history.iter().collect();
                serde_json::to_string_pretty(&records).unwrap_or_else(|e| {
                    error!("Failed to serialize history: {}", e);
                    "[]".to_string()
                })
            }
            ExportFormat::Csv => {
                let mut lines = Vec::with_capacity(state.history.len() + 1);
                lines.push(
                    "taskId,platform,contentTitle,status,startTime,endTime,duration,error"
                        .to_string(),
                );
                for r in &state.history {
                    let fields = [
                        csv_field(&r.task_id),
                        csv_field(&r.platform),
                        quote(&r.content_title),
                        r.status.to_string(),
                        timestamp(&r.start_time),
                        r.end_time.as_ref().map(timestamp).unwrap_or_default(),
                        r.duration.map(|d| d.to_string()).unwrap_or_default(),
                        r.error.as_deref().map(csv_field).unwrap_or_default(),
                    ];
                    lines.push(fields.join(","));
                }
                lines.join("\n")
            }
        }
    }
}

fn compute_stats(state: &TrackerState, platform: Option<&str>, now: DateTime<Utc>) -> StatsReport {
    match platform {
        Some(platform) => {
            StatsReport::Platform(state.platforms.get(platform).cloned().unwrap_or_default())
        }
        None => StatsReport::Global(aggregate(state, now)),
    }
}

fn aggregate(state: &TrackerState, now: DateTime<Utc>) -> GlobalStats {
    let mut stats = GlobalStats {
        total: 0,
        success: 0,
        failed: 0,
        in_flight: 0,
        success_rate: 0,
        avg_processing_ms: 0,
        by_platform: BTreeMap::new(),
        recent_trend: recent_trend(&state.history, now),
    };

    let mut duration_sum: u64 = 0;
    let mut duration_count: u64 = 0;
    for (platform, p) in &state.platforms {
        stats.total += p.total;
        stats.success += p.success;
        stats.failed += p.failed;
        stats.in_flight += p.in_flight;
        stats.by_platform.insert(
            platform.clone(),
            PlatformSummary {
                total: p.total,
                success: p.success,
                failed: p.failed,
                success_rate: p.success_rate(),
            },
        );
        duration_sum += p.recent_durations().sum::<u64>();
        duration_count += p.recent_durations.len() as u64;
    }

    stats.success_rate = percent(stats.success, stats.total);
    if duration_count > 0 {
        stats.avg_processing_ms = (duration_sum as f64 / duration_count as f64).round() as u64;
    }
    stats
}

fn recent_trend(history: &VecDeque<TrackRecord>, now: DateTime<Utc>) -> RecentTrend {
    let one_hour_ago = now - ChronoDuration::hours(1);
    let two_hours_ago = now - ChronoDuration::hours(2);

    let mut last_hour = WindowCount::default();
    let mut previous_hour = WindowCount::default();
    for r in history {
        let window = if r.start_time >= one_hour_ago {
            &mut last_hour
        } else if r.start_time >= two_hours_ago {
            &mut previous_hour
        } else {
            continue;
        };
        window.total += 1;
        if r.status == TrackStatus::Success {
            window.success += 1;
        }
    }

    RecentTrend {
        trend: Trend::classify(last_hour.success, previous_hour.success),
        last_hour,
        previous_hour,
    }
}

fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        0
    } else {
        ((part as f64 / whole as f64) * 100.0).round() as u32
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Always quoted, embedded quotes doubled
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Quoted only when the value would otherwise break the row
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        quote(value)
    } else {
        value.to_string()
    }
}
