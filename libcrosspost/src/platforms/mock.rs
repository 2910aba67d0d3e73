//! Mock adapter for testing
//!
//! A configurable adapter that can succeed, fail, fail a fixed number of times
//! before succeeding, or stall. Call counters and timestamps are shared
//! through [`MockCalls`] so tests can keep observing the adapter after it
//! has been moved into a `PlatformManager`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::{ContentRules, LoginOptions, LoginOutcome, LoginStatus, PlatformAdapter};
use crate::error::{PlatformError, Result};
use crate::types::{Content, PublishOptions};

/// Shared record of calls made to a mock adapter
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    publish_times: Arc<Mutex<Vec<Instant>>>,
    published: Arc<Mutex<Vec<Content>>>,
    login_calls: Arc<Mutex<usize>>,
}

impl MockCalls {
    pub fn publish_calls(&self) -> usize {
        self.publish_times.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// When each publish call started, in order
    pub fn publish_times(&self) -> Vec<Instant> {
        self.publish_times.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Content of every successful publish
    pub fn published(&self) -> Vec<Content> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn login_calls(&self) -> usize {
        *self.login_calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Configuration for mock adapter behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Platform id (e.g. "mock-toutiao")
    pub name: String,

    /// Whether publishing should succeed
    pub publish_succeeds: bool,

    /// Error to return on publish failure
    pub publish_error: Option<String>,

    /// Fail this many publish calls before following `publish_succeeds`
    pub fail_times: usize,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    /// Content rules checked before publishing
    pub rules: ContentRules,

    /// Whether login/check_login are implemented
    pub supports_login: bool,

    pub calls: MockCalls,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            publish_succeeds: true,
            publish_error: None,
            fail_times: 0,
            delay: Duration::from_millis(0),
            rules: ContentRules::default(),
            supports_login: false,
            calls: MockCalls::default(),
        }
    }
}

pub struct MockAdapter {
    config: MockConfig,
    logged_in: AtomicBool,
}

impl MockAdapter {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            logged_in: AtomicBool::new(false),
        }
    }

    /// Create a mock adapter that always succeeds
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Create a mock adapter whose publish always fails
    pub fn publish_failure(name: &str, error: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            publish_succeeds: false,
            publish_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// Create a mock adapter that fails `times` calls, then succeeds
    pub fn flaky(name: &str, times: usize) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            fail_times: times,
            ..Default::default()
        })
    }

    /// Create a mock adapter with a delay
    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            delay,
            ..Default::default()
        })
    }

    /// Create a mock adapter enforcing content rules
    pub fn with_rules(name: &str, rules: ContentRules) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            rules,
            ..Default::default()
        })
    }

    /// Handle for observing calls after the adapter is registered
    pub fn call_counter(&self) -> MockCalls {
        self.config.calls.clone()
    }

    fn unsupported(&self, operation: &str) -> crate::error::CrosspostError {
        PlatformError::Unsupported {
            platform: self.config.name.clone(),
            operation: operation.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.config.name
    }

    fn features(&self) -> Vec<String> {
        vec!["article".to_string()]
    }

    async fn login(&self, _options: &LoginOptions) -> Result<LoginOutcome> {
        if !self.config.supports_login {
            return Err(self.unsupported("login"));
        }
        *self.config.calls.login_calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(LoginOutcome {
            success: true,
            data: Some(json!({"method": "mock"})),
            error: None,
        })
    }

    async fn check_login(&self) -> Result<LoginStatus> {
        if !self.config.supports_login {
            return Err(self.unsupported("check_login"));
        }
        let is_logged_in = self.logged_in.load(Ordering::SeqCst);
        Ok(LoginStatus {
            is_logged_in,
            message: if is_logged_in { "Logged in" } else { "Not logged in" }.to_string(),
        })
    }

    async fn publish(&self, content: &Content, _options: &PublishOptions) -> Result<Value> {
        let call_number = {
            let mut times = self.config.calls.publish_times.lock().unwrap_or_else(|e| e.into_inner());
            times.push(Instant::now());
            times.len()
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        self.config.rules.validate(content)?;

        let failing = call_number <= self.config.fail_times || !self.config.publish_succeeds;
        if failing {
            let error_msg = self
                .config
                .publish_error
                .clone()
                .unwrap_or_else(|| "Mock publishing failed".to_string());
            return Err(PlatformError::Publish(error_msg).into());
        }

        self.config.calls.published.lock().unwrap_or_else(|e| e.into_inner()).push(content.clone());
        Ok(json!({
            "id": format!("{}:mock-{}", self.config.name, uuid::Uuid::new_v4()),
            "platform": self.config.name,
            "title": content.display_title(),
        }))
    }
}
