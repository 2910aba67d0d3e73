//! crosspost-send - Publish daemon
//!
//! Reads JSON-lines requests on stdin, drives the publish queue, and writes
//! one response line per request plus a line per tracker event on stdout.

mod protocol;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use libcrosspost::logging::{LogFormat, LoggingConfig};
use libcrosspost::{Config, PublishService, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How long in-flight deliveries may take to finish after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "crosspost-send")]
#[command(version)]
#[command(about = "Publish daemon: JSON-lines requests in, results and events out")]
#[command(long_about = "\
crosspost-send - Publish daemon

DESCRIPTION:
    crosspost-send runs the publish queue. Each line on stdin is one JSON
    request; each request gets exactly one JSON response line on stdout.
    Progress events for every task are written to stdout as they happen,
    wrapped as {\"event\": {...}}. Logs go to stderr.

REQUESTS:
    {\"op\":\"submit\",\"content\":{...},\"platforms\":[\"toutiao\"],
     \"priority\":\"high\",\"schedule\":\"30m\",\"options\":{...}}
    {\"op\":\"cancel\",\"task_id\":\"pub_...\"}
    {\"op\":\"status\",\"task_id\":\"pub_...\"}
    {\"op\":\"list\",\"status\":\"pending\",\"priority\":\"low\",\"platform\":\"x\",\"limit\":10}
    {\"op\":\"stats\",\"platform\":\"toutiao\"}     (omit platform for global stats)
    {\"op\":\"queue_stats\"}
    {\"op\":\"pause\"}  {\"op\":\"resume\"}  {\"op\":\"clear\"}
    {\"op\":\"export\",\"format\":\"csv\"}          (json or csv)
    {\"op\":\"errors\",\"limit\":10}

SCHEDULES:
    RFC 3339 timestamps, durations (\"30m\", \"2h\") or natural language
    (\"tomorrow 9am\"). Past timestamps run immediately.

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight deliveries finish)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml
    (override with --config or CROSSPOST_CONFIG)

    [queue]
    tick_interval = \"5s\"
    max_concurrent = 3
    retry_limit = 3
    retry_base_delay = \"60s\"

    [[platforms]]
    id = \"toutiao\"
    command = \"~/bin/toutiao-publish\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Invalid input
")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "CROSSPOST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Queue polling interval, e.g. "5s" or "500ms" (overrides config)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    tick_interval: Option<Duration>,

    /// Maximum tasks delivered at once (overrides config)
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log format: text, json or pretty (overrides config)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Exit once stdin is closed and the queue has nothing left to do
    #[arg(long)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(interval) = cli.tick_interval {
        config.queue.tick_interval = interval;
    }
    if let Some(max) = cli.max_concurrent {
        config.queue.max_concurrent = max;
    }

    let mut logging = LoggingConfig::from_config(&config.logging, cli.verbose);
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    logging.init();

    let service = PublishService::from_config(config)?;
    let shutdown = shutdown_signal()?;

    info!("crosspost-send daemon starting");
    if atty::is(atty::Stream::Stdin) {
        info!("Reading requests from the terminal, one JSON object per line");
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(write_lines(out_rx));
    let forwarder = tokio::spawn(forward_events(service.subscribe_all(), out_tx.clone()));

    service.start();
    serve(&service, &out_tx, shutdown, cli.exit_when_idle).await;

    // Graceful shutdown: no new dispatch, let deliveries in flight finish
    service.stop().await;
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while service.queue().get_queue_stats().in_flight > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!("Deliveries still in flight at shutdown, abandoning them");
            break;
        }
        tokio::time::sleep(IDLE_POLL).await;
    }

    // The event stream ends once the last handle on the tracker is gone
    drop(service);
    let abort = forwarder.abort_handle();
    if tokio::time::timeout(Duration::from_secs(5), forwarder).await.is_err() {
        warn!("Timed out flushing events");
        abort.abort();
    }
    drop(out_tx);
    if let Err(e) = writer.await {
        error!("Output writer failed: {}", e);
    }

    info!("crosspost-send daemon stopped");
    Ok(())
}

/// Answer requests until a shutdown signal, or until idle with
/// `exit_when_idle` once stdin is closed
async fn serve(
    service: &PublishService,
    out: &mpsc::UnboundedSender<Value>,
    shutdown: impl Future<Output = ()>,
    exit_when_idle: bool,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut idle_check = tokio::time::interval(IDLE_POLL);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if out.send(protocol::respond(service, &line)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed, no more requests");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = idle_check.tick(), if exit_when_idle && !stdin_open => {
                if service.queue().is_idle() {
                    info!("Queue idle, exiting");
                    break;
                }
            }
        }
    }
}

async fn forward_events(
    mut events: libcrosspost::service::events::EventReceiver,
    out: mpsc::UnboundedSender<Value>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if out.send(json!({ "event": event })).is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream lagging, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Single writer so responses and events never interleave mid-line
async fn write_lines(mut lines: mpsc::UnboundedReceiver<Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = lines.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!("Failed to write to stdout: {}", e);
            break;
        }
        if let Err(e) = stdout.flush().await {
            error!("Failed to flush stdout: {}", e);
            break;
        }
    }
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    Ok(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "Received shutdown signal, stopping gracefully...");
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
        }
    })
}
