//! Service layer for Crosspost
//!
//! # Architecture
//!
//! The service layer follows a facade pattern with `PublishService` as the
//! main entry point, wiring together:
//!
//! - `PlatformManager`: registry of platform adapters
//! - `PublishQueueService`: priority queue, scheduling, retries
//! - `PublishTrackerService`: history, statistics, subscriptions
//! - `EventBus`: every tracker event, for streaming progress
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use libcrosspost::service::PublishService;
//! use libcrosspost::types::{Content, PublishOptions};
//!
//! # async fn example() -> libcrosspost::Result<()> {
//! let service = PublishService::new()?;
//! service.start();
//!
//! let submission = service.queue().add_to_queue(
//!     Content::new(json!({"title": "Hello", "body": "World"})),
//!     vec!["toutiao".to_string()],
//!     PublishOptions::default(),
//! )?;
//!
//! let mut progress = service.tracker().subscribe(&submission.task_id);
//! while let Some(event) = progress.recv().await {
//!     println!("{:?}", event);
//! }
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod queue;
pub mod schedule;
pub mod tracker;

use std::sync::Arc;

use tracing::info;

use self::events::EventReceiver;
use self::queue::PublishQueueService;
use self::tracker::PublishTrackerService;
use crate::platforms::command::CommandAdapter;
use crate::platforms::manager::PlatformManager;
use crate::{Config, Result};

/// Main service facade
///
/// Owns one manager, one queue and one tracker. The queue reports every
/// delivery to the tracker, so tracker statistics cover all work done
/// through this facade.
pub struct PublishService {
    manager: Arc<PlatformManager>,
    queue: PublishQueueService,
    tracker: PublishTrackerService,
}

impl PublishService {
    /// Create a service from the default configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or is invalid.
    pub fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config)
    }

    /// Create a service and register a command adapter per `[[platforms]]`
    /// entry of `config`
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let manager = Arc::new(PlatformManager::new());
        for platform in &config.platforms {
            let adapter = Arc::new(CommandAdapter::new(platform.clone()));
            match platform.timeout {
                Some(timeout) => manager.register_with_timeout(&platform.id, adapter, timeout),
                None => manager.register(&platform.id, adapter),
            }
        }

        let service = Self::with_manager(config, manager);
        info!(platforms = ?service.manager.list(), "Publish service ready");
        Ok(service)
    }

    /// Create a service around an already populated manager
    pub fn with_manager(config: Config, manager: Arc<PlatformManager>) -> Self {
        let tracker = PublishTrackerService::new(config.tracker.clone());
        for id in manager.list() {
            tracker.register_platform(&id);
        }
        let queue = PublishQueueService::new(Arc::clone(&manager), tracker.clone(), config.queue);

        Self {
            manager,
            queue,
            tracker,
        }
    }

    /// Start the queue's polling loop
    pub fn start(&self) {
        self.queue.start();
    }

    /// Stop the polling loop; in-flight deliveries still finish
    pub async fn stop(&self) {
        self.queue.stop().await;
    }

    pub fn manager(&self) -> &PlatformManager {
        &self.manager
    }

    pub fn queue(&self) -> &PublishQueueService {
        &self.queue
    }

    pub fn tracker(&self) -> &PublishTrackerService {
        &self.tracker
    }

    /// Subscribe to the events of every task
    pub fn subscribe_all(&self) -> EventReceiver {
        self.tracker.subscribe_all()
    }
}
