//! Integration tests for the publish queue
//!
//! Drives the full stack (manager, queue loop, tracker) with mock adapters
//! and small real-time intervals.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libcrosspost::config::{QueueConfig, TrackerConfig};
use libcrosspost::platforms::mock::MockAdapter;
use libcrosspost::service::events::TrackEvent;
use libcrosspost::service::tracker::HistoryQuery;
use libcrosspost::{
    Config, Content, PlatformManager, Priority, PublishOptions, PublishService, QueueFilter,
    StatsReport, TaskStatus,
};
use serde_json::json;

fn service(adapters: Vec<MockAdapter>, queue: QueueConfig) -> PublishService {
    let manager = Arc::new(PlatformManager::new());
    for adapter in adapters {
        let id = libcrosspost::PlatformAdapter::id(&adapter).to_string();
        manager.register(id, Arc::new(adapter));
    }
    let config = Config {
        queue,
        tracker: TrackerConfig::default(),
        ..Default::default()
    };
    PublishService::with_manager(config, manager)
}

fn fast_queue() -> QueueConfig {
    QueueConfig {
        tick_interval: Duration::from_millis(5),
        retry_base_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

fn article(title: &str) -> Content {
    Content::new(json!({ "title": title, "body": "Lorem ipsum" }))
}

fn ids(platforms: &[&str]) -> Vec<String> {
    platforms.iter().map(|p| p.to_string()).collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_all_failing_task_backs_off_then_fails() {
    let failing = MockAdapter::publish_failure("weibo", "503 Service Unavailable");
    let calls = failing.call_counter();
    let service = service(vec![failing], fast_queue());

    let submission = service
        .queue()
        .add_to_queue(article("Outage"), ids(&["weibo"]), PublishOptions::default())
        .unwrap();
    service.start();

    wait_until(|| {
        service
            .queue()
            .get_task_status(&submission.task_id)
            .is_some_and(|t| t.completed_at.is_some())
    })
    .await;
    service.stop().await;

    let task = service.queue().get_task_status(&submission.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert_eq!(calls.publish_calls(), 4);

    // Each wait is at least base × retry number, so gaps strictly increase
    let times = calls.publish_times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (i, gap) in gaps.iter().enumerate() {
        assert!(*gap >= Duration::from_millis(50 * (i as u64 + 1)), "gap {} too short: {:?}", i, gap);
    }
    assert!(gaps.windows(2).all(|w| w[1] > w[0]), "gaps not increasing: {:?}", gaps);
}

#[tokio::test]
async fn test_partial_success_retries_only_failed_platform() {
    let ok = MockAdapter::success("toutiao");
    let ok_calls = ok.call_counter();
    let flaky = MockAdapter::flaky("douyin", 1);
    let flaky_calls = flaky.call_counter();
    let service = service(vec![ok, flaky], fast_queue());

    let submission = service
        .queue()
        .add_to_queue(article("Launch"), ids(&["toutiao", "douyin"]), PublishOptions::default())
        .unwrap();
    service.start();

    wait_until(|| {
        service
            .queue()
            .get_task_status(&submission.task_id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
    service.stop().await;

    assert_eq!(ok_calls.publish_calls(), 1);
    assert_eq!(flaky_calls.publish_calls(), 2);

    let task = service.queue().get_task_status(&submission.task_id).unwrap();
    assert_eq!(task.targets, ids(&["toutiao", "douyin"]));
    assert_eq!(task.attempts.len(), 2);
    assert_eq!(task.attempts[0].outcome, Some(TaskStatus::Partial));
    assert_eq!(task.attempts[1].platforms, ids(&["douyin"]));
    assert!(task.results.values().all(|r| r.success));

    let history = service.tracker().get_history(&HistoryQuery {
        platform: Some("douyin".to_string()),
        ..Default::default()
    });
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_scheduled_task_released_within_one_tick() {
    let service = service(vec![MockAdapter::success("toutiao")], fast_queue());
    let at = Utc::now() + chrono::Duration::milliseconds(100);

    let submission = service
        .queue()
        .add_to_queue(
            article("Morning post"),
            ids(&["toutiao"]),
            PublishOptions::default().scheduled(at),
        )
        .unwrap();
    assert_eq!(submission.status, TaskStatus::Scheduled);
    assert!(service.queue().get_queue_list(&QueueFilter::default()).is_empty());

    let mut progress = service.tracker().subscribe(&submission.task_id);
    service.start();

    let first = progress.recv().await.unwrap();
    assert!(matches!(first, TrackEvent::Started { .. }));
    assert!(Utc::now() >= at);

    while let Some(event) = progress.recv().await {
        if let TrackEvent::Finished { status, .. } = event {
            assert_eq!(status, TaskStatus::Completed);
        }
    }
    service.stop().await;
}

#[tokio::test]
async fn test_priorities_dispatch_in_order() {
    let adapter = MockAdapter::success("toutiao");
    let calls = adapter.call_counter();
    let service = service(
        vec![adapter],
        QueueConfig {
            max_concurrent: 1,
            ..fast_queue()
        },
    );

    for (title, priority) in [("low", Priority::Low), ("normal", Priority::Normal), ("high", Priority::High)] {
        service
            .queue()
            .add_to_queue(article(title), ids(&["toutiao"]), PublishOptions::with_priority(priority))
            .unwrap();
    }
    service.start();
    wait_until(|| service.queue().is_idle()).await;
    service.stop().await;

    let titles: Vec<String> = calls
        .published()
        .iter()
        .map(|c| c.display_title().to_string())
        .collect();
    assert_eq!(titles, vec!["high", "normal", "low"]);
}

#[tokio::test]
async fn test_tracker_invariant_holds_under_concurrency() {
    let service = service(
        vec![
            MockAdapter::with_delay("slow", Duration::from_millis(10)),
            MockAdapter::publish_failure("broken", "nope"),
        ],
        QueueConfig {
            retry_limit: 0,
            ..fast_queue()
        },
    );

    for i in 0..6 {
        service
            .queue()
            .add_to_queue(article(&format!("post {}", i)), ids(&["slow", "broken"]), PublishOptions::default())
            .unwrap();
    }
    service.start();
    wait_until(|| service.queue().is_idle()).await;
    service.stop().await;

    let StatsReport::Global(stats) = service.tracker().get_stats(None) else {
        panic!("expected global stats");
    };
    assert_eq!(stats.total, 12);
    assert_eq!(stats.total, stats.success + stats.failed);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.success_rate, 50);
    assert_eq!(service.tracker().get_recent_errors(10).len(), 6);
}
