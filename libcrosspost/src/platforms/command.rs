//! External command adapter
//!
//! Each call runs the configured program once. The operation name goes in
//! `CROSSPOST_OPERATION` (`publish`, `login` or `check-login`) and the
//! request JSON on stdin. Exit status 0 is success and stdout is the
//! response (JSON, or a plain string if it does not parse); any other status
//! is a failure described by stderr.
//!
//! ```toml
//! [[platforms]]
//! id = "toutiao"
//! command = "~/bin/toutiao-publish"
//! timeout = "2m"
//! [platforms.rules]
//! require_title = true
//! max_title_chars = 30
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{LoginOptions, LoginOutcome, LoginStatus, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::types::{Content, PublishOptions};

pub const OPERATION_ENV: &str = "CROSSPOST_OPERATION";

pub struct CommandAdapter {
    config: PlatformConfig,
}

impl CommandAdapter {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }

    /// Run the command for one operation and return its parsed stdout
    async fn run(&self, operation: &str, request: &Value) -> std::result::Result<Value, PlatformError> {
        debug!(platform = %self.config.id, operation, command = %self.config.command, "Spawning adapter command");

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env(OPERATION_ENV, operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Abandoned calls (manager timeout) must not leave processes behind
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PlatformError::Publish(format!(
                    "Failed to start '{}': {}",
                    self.config.command, e
                ))
            })?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| PlatformError::Publish(format!("Failed to encode request: {}", e)))?;
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may close it early; that is not an error
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(platform = %self.config.id, "Adapter command closed stdin: {}", e);
                }
            }
        };

        // Drain output while feeding stdin so neither side can fill a pipe and stall
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| PlatformError::Publish(format!("Failed to wait for command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("command exited with {}", output.status)
            } else {
                stderr
            };
            return Err(classify_failure(detail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}

/// Map stderr conventions onto error kinds
///
/// Commands may prefix their message with `auth:`, `validation:` or
/// `network:`; anything else is a publish failure.
fn classify_failure(detail: String) -> PlatformError {
    if let Some(rest) = strip_prefix(&detail, "auth:") {
        PlatformError::Authentication(rest)
    } else if let Some(rest) = strip_prefix(&detail, "validation:") {
        PlatformError::Validation(rest)
    } else if let Some(rest) = strip_prefix(&detail, "network:") {
        PlatformError::Network(rest)
    } else {
        PlatformError::Publish(detail)
    }
}

/// Case-insensitive ASCII prefix match on a char boundary
fn strip_prefix(detail: &str, prefix: &str) -> Option<String> {
    let head = detail.get(..prefix.len())?;
    let rest = detail.get(prefix.len()..)?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| rest.trim().to_string())
}

#[async_trait]
impl PlatformAdapter for CommandAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(&self.config.id)
    }

    fn features(&self) -> Vec<String> {
        self.config.features.clone()
    }

    fn login_required(&self) -> bool {
        self.config.supports_login
    }

    async fn login(&self, options: &LoginOptions) -> Result<LoginOutcome> {
        if !self.config.supports_login {
            return Err(PlatformError::Unsupported {
                platform: self.config.id.clone(),
                operation: "login".to_string(),
            }
            .into());
        }

        match self.run("login", &json!({ "options": options })).await {
            Ok(value) => Ok(serde_json::from_value(value.clone()).unwrap_or(LoginOutcome {
                success: true,
                data: Some(value),
                error: None,
            })),
            Err(e) => Ok(LoginOutcome {
                success: false,
                data: None,
                error: Some(e.to_string()),
            }),
        }
    }

    async fn check_login(&self) -> Result<LoginStatus> {
        if !self.config.supports_login {
            return Err(PlatformError::Unsupported {
                platform: self.config.id.clone(),
                operation: "check_login".to_string(),
            }
            .into());
        }

        match self.run("check-login", &json!({})).await {
            Ok(value) => serde_json::from_value(value).map_err(|e| {
                PlatformError::Authentication(format!("Unreadable login status: {}", e)).into()
            }),
            Err(e) => Ok(LoginStatus {
                is_logged_in: false,
                message: e.to_string(),
            }),
        }
    }

    async fn publish(&self, content: &Content, options: &PublishOptions) -> Result<Value> {
        self.config.rules.validate(content)?;

        let request = json!({ "content": content, "options": options });
        Ok(self.run("publish", &request).await?)
    }
}

#[cfg(test)]
mod classify_tests {
    use super::*;

    #[test]
    fn test_prefix_is_case_insensitive() {
        assert_eq!(
            classify_failure("NETWORK: reset by peer".to_string()),
            PlatformError::Network("reset by peer".to_string())
        );
        assert_eq!(
            classify_failure("Validation:title too long".to_string()),
            PlatformError::Validation("title too long".to_string())
        );
    }

    #[test]
    fn test_non_ascii_lookalike_is_not_a_prefix() {
        // KELVIN SIGN lowercases to 'k' but is three bytes wide
        let detail = "networ\u{212A}: down".to_string();
        assert_eq!(classify_failure(detail.clone()), PlatformError::Publish(detail));

        let short = "\u{e9}".to_string();
        assert_eq!(classify_failure(short.clone()), PlatformError::Publish(short));
    }
}
