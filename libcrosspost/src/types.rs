//! Core types for Crosspost

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Title shown in logs and history when the content carries none
pub const UNTITLED: &str = "Untitled";

/// Opaque content payload
///
/// Forwarded to adapters unmodified. Only the `title` field is ever read,
/// for display in logs and the tracker history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(pub Value);

impl Content {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The `title` field, if present and a string
    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(Value::as_str)
    }

    /// Title for display purposes
    pub fn display_title(&self) -> &str {
        match self.title() {
            Some(title) if !title.trim().is_empty() => title,
            _ => UNTITLED,
        }
    }

    /// A string field of the payload
    pub fn field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Dispatch rank: lower runs first
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn all() -> [Priority; 3] {
        [Priority::High, Priority::Normal, Priority::Low]
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(format!(
                "Invalid priority: '{}'. Valid options: high, normal, low",
                s
            )),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Outcome of an attempt from the number of platforms that succeeded
    pub fn from_outcome(succeeded: usize, attempted: usize) -> Self {
        if attempted > 0 && succeeded == attempted {
            TaskStatus::Completed
        } else if succeeded > 0 {
            TaskStatus::Partial
        } else {
            TaskStatus::Failed
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "partial" => Ok(TaskStatus::Partial),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: '{}'", s)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Delivery options for a submission
///
/// `extra` is handed to every adapter call as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

impl PublishOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Result of publishing to a single platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub success: bool,
    pub platform: String,
    /// Provider response (if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlatformResult {
    pub fn ok(platform: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            platform: platform.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(platform: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            platform: platform.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

/// One pass over a subset of a task's platforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub platforms: Vec<String>,
    pub results: BTreeMap<String, PlatformResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskStatus>,
}

/// A unit of publish work targeting one or more platforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTask {
    pub id: String,
    pub content: Content,
    /// Platforms originally requested; never narrowed
    pub targets: Vec<String>,
    /// Platforms of the current (or next) attempt
    pub platforms: Vec<String>,
    pub options: PublishOptions,
    pub priority: Priority,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Latest result per attempted platform
    pub results: BTreeMap<String, PlatformResult>,
    pub attempts: Vec<Attempt>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PublishTask {
    pub fn new(content: Content, platforms: Vec<String>, options: PublishOptions) -> Self {
        Self {
            id: format!("pub_{}", Uuid::new_v4().simple()),
            content,
            targets: platforms.clone(),
            platforms,
            priority: options.priority,
            scheduled_at: options.scheduled_at,
            options,
            status: TaskStatus::Pending,
            retry_count: 0,
            results: BTreeMap::new(),
            attempts: Vec::new(),
            created_at: Utc::now(),
            next_attempt_at: None,
            completed_at: None,
        }
    }

    /// Platforms whose latest result is a failure, in target order
    pub fn failed_platforms(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|p| self.results.get(*p).is_some_and(|r| !r.success))
            .cloned()
            .collect()
    }

    /// True while the task waits for a retry wake-up
    pub fn awaiting_retry(&self) -> bool {
        matches!(self.status, TaskStatus::Partial | TaskStatus::Failed)
            && self.next_attempt_at.is_some()
    }

    pub fn targets_platform(&self, platform: &str) -> bool {
        self.targets.iter().any(|p| p == platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_rank_order() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serde_lowercase() {
        let options: PublishOptions = serde_json::from_value(json!({"priority": "high"})).unwrap();
        assert_eq!(options.priority, Priority::High);
        assert_eq!(serde_json::to_value(Priority::Low).unwrap(), json!("low"));
    }

    #[test]
    fn test_content_display_title() {
        assert_eq!(Content::new(json!({"title": "Hello"})).display_title(), "Hello");
        assert_eq!(Content::new(json!({"title": "  "})).display_title(), UNTITLED);
        assert_eq!(Content::new(json!({"body": "x"})).display_title(), UNTITLED);
        assert_eq!(Content::new(json!("plain")).display_title(), UNTITLED);
    }

    #[test]
    fn test_status_from_outcome() {
        assert_eq!(TaskStatus::from_outcome(2, 2), TaskStatus::Completed);
        assert_eq!(TaskStatus::from_outcome(1, 2), TaskStatus::Partial);
        assert_eq!(TaskStatus::from_outcome(0, 2), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_outcome(0, 0), TaskStatus::Failed);
    }

    #[test]
    fn test_new_task_keeps_targets() {
        let task = PublishTask::new(
            Content::new(json!({"title": "A"})),
            vec!["p1".to_string(), "p2".to_string()],
            PublishOptions::with_priority(Priority::High),
        );
        assert!(task.id.starts_with("pub_"));
        assert_eq!(task.targets, task.platforms);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.results.is_empty());
    }

    #[test]
    fn test_failed_platforms_follow_target_order() {
        let mut task = PublishTask::new(
            Content::new(json!({})),
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            PublishOptions::default(),
        );
        task.results.insert("c".to_string(), PlatformResult::failed("c", "x"));
        task.results.insert("a".to_string(), PlatformResult::failed("a", "y"));
        task.results.insert("b".to_string(), PlatformResult::ok("b", json!({})));
        assert_eq!(task.failed_platforms(), vec!["a", "c"]);
    }

    #[test]
    fn test_task_status_display_roundtrip() {
        for status in [
            TaskStatus::Scheduled,
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Partial,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
    }
}
