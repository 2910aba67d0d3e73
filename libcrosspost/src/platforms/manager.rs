//! Platform registry and uniform invocation layer

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{info, warn};

use super::{LoginOptions, LoginOutcome, LoginStatus, PlatformAdapter, PlatformInfo};
use crate::error::{CrosspostError, PlatformError, Result};
use crate::types::{Content, PlatformResult, PublishOptions};

struct Registered {
    adapter: Arc<dyn PlatformAdapter>,
    timeout: Option<Duration>,
}

/// Registry mapping platform id to adapter
///
/// `publish` never returns an adapter failure as `Err`: errors, panics,
/// timeouts and falsy responses all come back as a failed
/// [`PlatformResult`]. The only `Err` is [`PlatformError::NotRegistered`].
#[derive(Default)]
pub struct PlatformManager {
    platforms: RwLock<HashMap<String, Registered>>,
}

impl PlatformManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id
    pub fn register(&self, id: impl Into<String>, adapter: Arc<dyn PlatformAdapter>) {
        self.insert(id.into(), adapter, None);
    }

    /// Register an adapter whose publish calls are abandoned after `timeout`
    pub fn register_with_timeout(
        &self,
        id: impl Into<String>,
        adapter: Arc<dyn PlatformAdapter>,
        timeout: Duration,
    ) {
        self.insert(id.into(), adapter, Some(timeout));
    }

    fn insert(&self, id: String, adapter: Arc<dyn PlatformAdapter>, timeout: Option<Duration>) {
        let mut platforms = self.platforms.write().unwrap_or_else(|e| e.into_inner());
        if platforms.contains_key(&id) {
            warn!("Platform {} is already registered, replacing it", id);
        }
        info!("Registered platform: {}", id);
        platforms.insert(id, Registered { adapter, timeout });
    }

    /// Look up an adapter
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::NotRegistered` if no adapter has this id.
    pub fn get(&self, id: &str) -> Result<Arc<dyn PlatformAdapter>> {
        self.entry(id).map(|(adapter, _)| adapter)
    }

    fn entry(&self, id: &str) -> Result<(Arc<dyn PlatformAdapter>, Option<Duration>)> {
        let platforms = self.platforms.read().unwrap_or_else(|e| e.into_inner());
        platforms
            .get(id)
            .map(|r| (Arc::clone(&r.adapter), r.timeout))
            .ok_or_else(|| PlatformError::NotRegistered(id.to_string()).into())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        let platforms = self.platforms.read().unwrap_or_else(|e| e.into_inner());
        platforms.contains_key(id)
    }

    /// Registered platform ids, sorted
    pub fn list(&self) -> Vec<String> {
        let platforms = self.platforms.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = platforms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn info(&self, id: &str) -> Result<PlatformInfo> {
        let adapter = self.get(id)?;
        Ok(PlatformInfo {
            id: id.to_string(),
            name: adapter.name().to_string(),
            features: adapter.features(),
            login_required: adapter.login_required(),
        })
    }

    /// Run the adapter's login flow
    ///
    /// # Errors
    ///
    /// `NotRegistered` for unknown ids, `Unsupported` if the adapter has no
    /// login capability, or whatever the adapter reports.
    pub async fn login(&self, id: &str, options: &LoginOptions) -> Result<LoginOutcome> {
        let adapter = self.get(id)?;
        adapter.login(options).await
    }

    /// Query the adapter's login state
    ///
    /// # Errors
    ///
    /// Same as [`PlatformManager::login`].
    pub async fn check_login(&self, id: &str) -> Result<LoginStatus> {
        let adapter = self.get(id)?;
        adapter.check_login().await
    }

    /// Publish to one platform
    ///
    /// # Errors
    ///
    /// Only `PlatformError::NotRegistered`. Every adapter failure is reported
    /// through the returned result.
    pub async fn publish(
        &self,
        id: &str,
        content: &Content,
        options: &PublishOptions,
    ) -> Result<PlatformResult> {
        let (adapter, timeout) = self.entry(id)?;

        info!(platform = id, title = content.display_title(), "Publishing");

        let call = AssertUnwindSafe(adapter.publish(content, options)).catch_unwind();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(PlatformError::Timeout(limit).into())),
            },
            None => call.await,
        };

        let result = match outcome {
            Ok(Ok(value)) => match falsy_reason(&value) {
                None => PlatformResult::ok(id, value),
                Some(reason) => PlatformResult::failed(id, reason),
            },
            Ok(Err(e)) => PlatformResult::failed(id, adapter_error_message(&e)),
            Err(panic) => PlatformResult::failed(id, panic_message(panic.as_ref())),
        };

        if result.success {
            info!(platform = id, "Publish succeeded");
        } else {
            warn!(
                platform = id,
                error = result.error.as_deref().unwrap_or_default(),
                "Publish failed"
            );
        }

        Ok(result)
    }

    /// Publish to several platforms, one after another
    ///
    /// Failures, including unregistered ids, are collected rather than
    /// stopping the run. Results are in the order of `ids`.
    pub async fn publish_to_many(
        &self,
        ids: &[String],
        content: &Content,
        options: &PublishOptions,
    ) -> Vec<PlatformResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = match self.publish(id, content, options).await {
                Ok(result) => result,
                Err(e) => PlatformResult::failed(id.as_str(), adapter_error_message(&e)),
            };
            results.push(result);
        }
        results
    }
}

/// Why a successful adapter call still counts as a failure, if it does
fn falsy_reason(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("Adapter returned no result".to_string()),
        Value::Bool(false) => Some("Adapter reported failure".to_string()),
        Value::Object(map) if map.get("success") == Some(&Value::Bool(false)) => Some(
            map.get("error")
                .and_then(Value::as_str)
                .unwrap_or("Adapter reported failure")
                .to_string(),
        ),
        _ => None,
    }
}

/// Error text without the outer "Platform error:" prefix
fn adapter_error_message(error: &CrosspostError) -> String {
    match error {
        CrosspostError::Platform(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Adapter panicked: {}", detail)
}
