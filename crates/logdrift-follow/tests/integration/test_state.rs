//! Durability: restart resume and the live-follower cap

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::common::*;

/// A restart resumes from the persisted offset: lines shipped before the
/// restart are not re-delivered, lines appended while down are.
#[tokio::test]
async fn test_restart_resumes_without_duplicates() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("app.log");
    write_lines(&path, 10);
    assert!(wait_until(|| handler.count() == 10).await);

    // Shut down; the close path flushes offsets.
    fx.watch.close().await.unwrap();
    let dir = fx.dir;

    // Lines land while the process is "down".
    append_line(&dir.path().join("logs").join("app.log"), "while down 1");
    append_line(&dir.path().join("logs").join("app.log"), "while down 2");

    // Restart over the same state file.
    let fx = Fixture::reopen(dir, 0);
    let handler2 = CollectingHandler::new();
    fx.add_filter("c", "*.log", Arc::clone(&handler2)).await;

    fx.watch.catchup(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        handler2.lines(),
        vec!["while down 1".to_string(), "while down 2".to_string()],
        "restart re-delivered or lost lines"
    );

    fx.watch.close().await.unwrap();
}

/// The cap bounds LIVE followers only: evicted followers keep their state
/// entries, and nothing crashes when more files match than the cap allows.
#[tokio::test]
async fn test_capacity_cap_with_retained_state() {
    let fx = Fixture::new(3);
    let handler = CollectingHandler::new();

    // Files exist before the watch is installed, so startup enumeration is
    // the only discovery path.
    for i in 0..6 {
        write_lines(&fx.logs.join(format!("file{i}.log")), 2);
    }
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    // All six files were drained despite the cap...
    assert!(
        wait_until(|| handler.count() == 12).await,
        "expected 12 records, got {}",
        handler.count()
    );
    // ...the cap held for live followers...
    assert!(fx.follower_count().await <= 3);
    // ...and state survives for the evicted ones.
    assert_eq!(fx.state_snapshot().len(), 6);

    fx.watch.close().await.unwrap();
}

/// An evicted follower's file picks back up from its retained offset when
/// it grows again.
#[tokio::test]
async fn test_evicted_follower_resumes_on_write() {
    let fx = Fixture::new(1);
    let handler = CollectingHandler::new();

    let first = fx.logs.join("aaa.log");
    let second = fx.logs.join("bbb.log");
    write_lines(&first, 2);
    write_lines(&second, 2);
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    assert!(wait_until(|| handler.count() == 4).await);
    assert_eq!(fx.follower_count().await, 1);

    // Writing to whichever file lost its follower revives it at the stored
    // offset, so only the new line arrives.
    append_line(&first, "revive a");
    append_line(&second, "revive b");
    assert!(
        wait_until(|| handler.count() == 6).await,
        "revived followers missed appends: {:?}",
        handler.lines()
    );

    fx.watch.close().await.unwrap();
}
