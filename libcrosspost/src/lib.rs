//! Crosspost - publish content to many platforms from one queue
//!
//! This library provides the platform adapter registry, a priority publish
//! queue with scheduling and retries, and a tracker that records every
//! delivery and derives statistics from it.

pub mod config;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod scheduling;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{CrosspostError, Result};
pub use platforms::manager::PlatformManager;
pub use platforms::PlatformAdapter;
pub use service::queue::{PublishQueueService, QueueFilter, Submission};
pub use service::tracker::{PublishTrackerService, StatsReport};
pub use service::PublishService;
pub use types::{Content, Priority, PublishOptions, PublishTask, TaskStatus};
