//! Live following: creation, appends, overlapping filters, catch-up

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use logdrift_core::domain::FollowerKey;

use crate::common::*;

/// A file created after start is discovered and every line reaches the
/// handler in order, newline stripped; the persisted offset equals the
/// file's byte length.
#[tokio::test]
async fn test_single_file_single_filter() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "paco*", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("paco123");
    write_lines(&path, 100);

    assert!(
        wait_until(|| handler.count() == 100).await,
        "expected 100 records, got {}",
        handler.count()
    );
    assert_eq!(handler.lines(), expected_lines(100));

    let file_len = std::fs::metadata(&path).unwrap().len();
    let snapshot = fx.state_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, FollowerKey::new("c", &path));
    assert_eq!(snapshot[0].1, file_len);

    // The on-disk image round-trips the same map.
    fx.filters().flush_states().unwrap();
    let image: serde_json::Value =
        serde_json::from_slice(&std::fs::read(fx.dir.path().join("state.json")).unwrap()).unwrap();
    assert_eq!(image["version"], 1);
    assert_eq!(image["entries"].as_array().unwrap().len(), 1);
    assert_eq!(image["entries"][0]["offset"], file_len);

    fx.watch.close().await.unwrap();
}

/// One file matched by several filters: every handler observes every line
/// exactly once, and the store carries one entry per config.
#[tokio::test]
async fn test_overlapping_filters_all_see_every_line() {
    let fx = Fixture::new(0);
    let handlers: Vec<Arc<CollectingHandler>> =
        (0..4).map(|_| CollectingHandler::new()).collect();

    // paco1*, paco11*, paco111*, paco1111* all match "paco1111".
    for (i, handler) in handlers.iter().enumerate() {
        let pattern = format!("paco{}*", "1".repeat(i + 1));
        fx.add_filter(&format!("c{i}"), &pattern, Arc::clone(handler))
            .await;
    }
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("paco1111");
    write_lines(&path, 25);

    for handler in &handlers {
        assert!(
            wait_until(|| handler.count() == 25).await,
            "a filter missed records: got {}",
            handler.count()
        );
        assert_eq!(handler.lines(), expected_lines(25));
    }
    assert_eq!(fx.follower_count().await, 4);
    assert_eq!(fx.state_snapshot().len(), 4);

    fx.watch.close().await.unwrap();
}

/// Files present before start are enumerated and followed.
#[tokio::test]
async fn test_preexisting_files_loaded_at_start() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();

    write_lines(&fx.logs.join("before.log"), 5);
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    assert!(wait_until(|| handler.count() == 5).await);
    assert_eq!(fx.follower_count().await, 1);

    fx.watch.close().await.unwrap();
}

/// Catch-up drains the backlog synchronously without live followers, and
/// the subsequent start resumes at the drained offset (no duplicates).
#[tokio::test]
async fn test_catchup_then_live_no_duplicates() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;

    let path = fx.logs.join("app.log");
    write_lines(&path, 10);

    fx.watch.catchup(&CancellationToken::new()).await.unwrap();
    assert_eq!(handler.count(), 10);
    assert_eq!(fx.follower_count().await, 0);

    fx.watch.start().await.unwrap();
    append_line(&path, "post-start");

    assert!(wait_until(|| handler.count() == 11).await);
    let lines = handler.lines();
    assert_eq!(lines[..10], expected_lines(10)[..]);
    assert_eq!(lines[10], "post-start");

    fx.watch.close().await.unwrap();
}

/// Appends keep flowing to the handler after the initial drain.
#[tokio::test]
async fn test_appends_are_streamed() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("grow.log");
    write_lines(&path, 1);
    assert!(wait_until(|| handler.count() == 1).await);

    for i in 0..5 {
        append_line(&path, &format!("append {i}"));
    }
    assert!(
        wait_until(|| handler.count() == 6).await,
        "appends missing: {:?}",
        handler.lines()
    );

    fx.watch.close().await.unwrap();
}

/// A directory that appears after start is picked up by the recreate poll.
/// (This is the directory-recreation path; the 10 s tick bounds the wait.)
#[tokio::test]
async fn test_missing_directory_appears_later() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();

    let late_dir = fx.dir.path().join("late");
    let spec = logdrift_core::domain::FilterSpec::new(
        "late",
        &late_dir,
        "*.log",
        false,
        logdrift_core::domain::EngineParams::line(),
        Arc::clone(&handler) as Arc<dyn logdrift_core::ports::Handler>,
    )
    .unwrap();
    fx.watch.add(spec).await.unwrap();
    fx.watch.start().await.unwrap();

    std::fs::create_dir_all(&late_dir).unwrap();
    write_lines(&late_dir.join("app.log"), 3);

    // Bounded by the recreate tick plus event delivery.
    assert!(
        wait_until(|| handler.count() == 3).await,
        "recreated directory was not picked up"
    );

    fx.watch.close().await.unwrap();
}
