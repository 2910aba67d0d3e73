//! JSON-lines request protocol
//!
//! One request object per line, tagged by `op`:
//!
//! ```text
//! {"op":"submit","content":{"title":"Hi"},"platforms":["toutiao"],"priority":"high","schedule":"10m"}
//! {"op":"cancel","task_id":"pub_..."}
//! {"op":"status","task_id":"pub_..."}
//! {"op":"list","status":"pending","limit":10}
//! {"op":"stats","platform":"toutiao"}
//! {"op":"queue_stats"}
//! {"op":"pause"} / {"op":"resume"} / {"op":"clear"}
//! {"op":"export","format":"csv"}
//! {"op":"errors","limit":5}
//! ```
//!
//! Every request gets exactly one response line, `{"ok":true,"op":...,"result":...}`
//! or `{"ok":false,"error":"..."}`.

use libcrosspost::error::QueueError;
use libcrosspost::scheduling::parse_schedule;
use libcrosspost::service::tracker::ExportFormat;
use libcrosspost::{
    Content, CrosspostError, Priority, PublishOptions, PublishService, QueueFilter, Result,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit {
        content: Value,
        platforms: Vec<String>,
        priority: Option<String>,
        schedule: Option<String>,
        #[serde(default)]
        options: Map<String, Value>,
    },
    Cancel {
        task_id: String,
    },
    Status {
        task_id: String,
    },
    List(QueueFilter),
    Stats {
        platform: Option<String>,
    },
    QueueStats,
    Pause,
    Resume,
    Clear,
    Export {
        format: String,
    },
    Errors {
        limit: Option<usize>,
    },
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Request::Submit { .. } => "submit",
            Request::Cancel { .. } => "cancel",
            Request::Status { .. } => "status",
            Request::List(_) => "list",
            Request::Stats { .. } => "stats",
            Request::QueueStats => "queue_stats",
            Request::Pause => "pause",
            Request::Resume => "resume",
            Request::Clear => "clear",
            Request::Export { .. } => "export",
            Request::Errors { .. } => "errors",
        }
    }
}

const DEFAULT_ERROR_LIMIT: usize = 10;

/// Handle one request line and build its response
pub fn respond(service: &PublishService, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return failure(&format!("Invalid request: {}", e)),
    };
    debug!(op = request.op(), "Handling request");

    let op = request.op();
    match handle(service, request) {
        Ok(result) => json!({ "ok": true, "op": op, "result": result }),
        Err(e) => failure(&e.to_string()),
    }
}

fn failure(error: &str) -> Value {
    json!({ "ok": false, "error": error })
}

fn handle(service: &PublishService, request: Request) -> Result<Value> {
    let queue = service.queue();
    let tracker = service.tracker();

    let result = match request {
        Request::Submit {
            content,
            platforms,
            priority,
            schedule,
            options,
        } => {
            let priority = priority
                .map(|p| p.parse::<Priority>())
                .transpose()
                .map_err(CrosspostError::InvalidInput)?
                .unwrap_or_default();
            let scheduled_at = schedule.as_deref().map(parse_schedule).transpose()?;

            let options = PublishOptions {
                priority,
                scheduled_at,
                extra: options,
            };
            to_value(queue.add_to_queue(Content::new(content), platforms, options)?)
        }
        Request::Cancel { task_id } => to_value(queue.cancel_task(&task_id)?),
        Request::Status { task_id } => {
            let task = queue
                .get_task_status(&task_id)
                .ok_or(QueueError::NotFound(task_id))?;
            to_value(task)
        }
        Request::List(filter) => to_value(queue.get_queue_list(&filter)),
        Request::Stats { platform } => to_value(tracker.get_stats(platform.as_deref())),
        Request::QueueStats => to_value(queue.get_queue_stats()),
        Request::Pause => {
            queue.pause_queue();
            json!({ "paused": true })
        }
        Request::Resume => {
            queue.resume_queue();
            json!({ "paused": false })
        }
        Request::Clear => json!({ "dropped": queue.clear_queue() }),
        Request::Export { format } => {
            let parsed: ExportFormat = format.parse().map_err(CrosspostError::InvalidInput)?;
            json!({ "format": format.to_lowercase(), "data": tracker.export_history(parsed) })
        }
        Request::Errors { limit } => {
            to_value(tracker.get_recent_errors(limit.unwrap_or(DEFAULT_ERROR_LIMIT)))
        }
    };

    Ok(result)
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    // Every response type is plain data with string keys
    serde_json::to_value(value).unwrap_or(Value::Null)
}
