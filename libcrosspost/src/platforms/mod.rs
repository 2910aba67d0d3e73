//! Platform abstraction
//!
//! Every publishing target is reached through a [`PlatformAdapter`]. Adapters
//! own their platform-specific rules (required fields, length limits) and
//! report failures as [`PlatformError`]s; the [`manager::PlatformManager`]
//! turns those failures into structured results so nothing above it has to
//! handle adapter errors.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcrosspost::platforms::{manager::PlatformManager, mock::MockAdapter};
//! use libcrosspost::types::{Content, PublishOptions};
//!
//! # async fn example() -> libcrosspost::error::Result<()> {
//! let manager = PlatformManager::new();
//! manager.register("toutiao", Arc::new(MockAdapter::success("toutiao")));
//!
//! let content = Content::new(serde_json::json!({"title": "Hello", "body": "World"}));
//! let result = manager.publish("toutiao", &content, &PublishOptions::default()).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PlatformError, Result};
use crate::types::{Content, PublishOptions};

pub mod command;
pub mod manager;

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Options passed through to an adapter's login flow
pub type LoginOptions = serde_json::Map<String, Value>;

/// Outcome of a login attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Current login state reported by an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginStatus {
    pub is_logged_in: bool,
    #[serde(default)]
    pub message: String,
}

/// Static description of a registered platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub id: String,
    pub name: String,
    pub features: Vec<String>,
    pub login_required: bool,
}

/// Adapter contract for a publishing platform
///
/// Only `publish` is mandatory. `login` and `check_login` default to
/// [`PlatformError::Unsupported`], which is how an adapter declares that it
/// lacks the capability.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Lowercase identifier (e.g. "toutiao", "wechat")
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str {
        self.id()
    }

    /// Content kinds the platform accepts (e.g. "article", "video")
    fn features(&self) -> Vec<String> {
        Vec::new()
    }

    fn login_required(&self) -> bool {
        true
    }

    /// Start the platform's login flow
    async fn login(&self, _options: &LoginOptions) -> Result<LoginOutcome> {
        Err(PlatformError::Unsupported {
            platform: self.id().to_string(),
            operation: "login".to_string(),
        }
        .into())
    }

    /// Report whether the adapter currently holds a valid session
    async fn check_login(&self) -> Result<LoginStatus> {
        Err(PlatformError::Unsupported {
            platform: self.id().to_string(),
            operation: "check_login".to_string(),
        }
        .into())
    }

    /// Publish content, returning the provider's response
    ///
    /// A `null` or `false` response, or an object with `"success": false`,
    /// counts as a failed publish.
    ///
    /// # Errors
    ///
    /// - `PlatformError::Validation` when the content breaks platform rules
    /// - `PlatformError::Authentication` when no valid session exists
    /// - `PlatformError::Publish` / `PlatformError::Network` on delivery failure
    async fn publish(&self, content: &Content, options: &PublishOptions) -> Result<Value>;
}

/// Field requirements enforced by an adapter before it publishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentRules {
    pub require_title: bool,
    pub require_body: bool,
    pub max_title_chars: Option<usize>,
    pub max_body_chars: Option<usize>,
    /// Payload field holding the body text
    pub body_field: Option<String>,
}

impl ContentRules {
    const DEFAULT_BODY_FIELD: &'static str = "body";

    /// Check content against these rules
    ///
    /// Lengths are counted in characters, not bytes.
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Validation` describing the first violated rule.
    pub fn validate(&self, content: &Content) -> std::result::Result<(), PlatformError> {
        let title = content.title().map(str::trim).unwrap_or("");
        if self.require_title && title.is_empty() {
            return Err(PlatformError::Validation("Title cannot be empty".to_string()));
        }
        if let Some(limit) = self.max_title_chars {
            let count = title.chars().count();
            if count > limit {
                return Err(PlatformError::Validation(format!(
                    "Title exceeds {} character limit (got {} characters)",
                    limit, count
                )));
            }
        }

        let body_field = self
            .body_field
            .as_deref()
            .unwrap_or(Self::DEFAULT_BODY_FIELD);
        let body = content.field(body_field).map(str::trim).unwrap_or("");
        if self.require_body && body.is_empty() {
            return Err(PlatformError::Validation(format!(
                "Field '{}' cannot be empty",
                body_field
            )));
        }
        if let Some(limit) = self.max_body_chars {
            let count = body.chars().count();
            if count > limit {
                return Err(PlatformError::Validation(format!(
                    "Field '{}' exceeds {} character limit (got {} characters)",
                    body_field, limit, count
                )));
            }
        }

        Ok(())
    }
}
