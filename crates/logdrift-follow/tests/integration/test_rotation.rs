//! Rotation lifecycle: delete, rename away, rename within, truncation

use std::sync::Arc;

use logdrift_core::domain::FollowerKey;

use crate::common::*;

/// Deleting a followed file drops the follower and purges its state entry.
#[tokio::test]
async fn test_delete_during_follow() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "paco*", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("paco123");
    write_lines(&path, 10);
    assert!(wait_until(|| handler.count() == 10).await);
    assert_eq!(fx.follower_count().await, 1);

    std::fs::remove_file(&path).unwrap();

    let filters = Arc::clone(fx.filters());
    assert!(
        wait_until_async(|| {
            let filters = Arc::clone(&filters);
            async move { filters.follower_count().await == 0 }
        })
        .await,
        "follower survived deletion"
    );
    assert!(fx.state_snapshot().is_empty(), "state entry not purged");

    fx.watch.close().await.unwrap();
}

/// Renaming to a name outside the pattern set closes the follower, purges
/// its state and starts nothing new.
#[tokio::test]
async fn test_rename_to_non_matching_name() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "paco*", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("paco123");
    write_lines(&path, 10);
    assert!(wait_until(|| handler.count() == 10).await);

    std::fs::rename(&path, fx.logs.join("chico123")).unwrap();

    let filters = Arc::clone(fx.filters());
    assert!(
        wait_until_async(|| {
            let filters = Arc::clone(&filters);
            async move { filters.follower_count().await == 0 }
        })
        .await,
        "follower survived rename out of the filter"
    );
    assert!(fx.state_snapshot().is_empty());

    fx.watch.close().await.unwrap();
}

/// Renaming to a still-matching name keeps the follower alive: the state
/// entry is re-keyed with the offset preserved, and appends to the new name
/// continue from exactly the byte after the last pre-rename line.
#[tokio::test]
async fn test_rename_to_matching_name_preserves_offset() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "paco*", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let old = fx.logs.join("paco123");
    write_lines(&old, 10);
    assert!(wait_until(|| handler.count() == 10).await);
    let pre_rename_len = std::fs::metadata(&old).unwrap().len();

    let new = fx.logs.join("paco456");
    std::fs::rename(&old, &new).unwrap();

    // The state entry moves to the new key with the offset intact.
    let expected_key = FollowerKey::new("c", &new);
    assert!(
        wait_until(|| {
            let snapshot = fx.state_snapshot();
            snapshot.len() == 1 && snapshot[0].0 == expected_key
        })
        .await,
        "state was not re-keyed: {:?}",
        fx.state_snapshot()
    );
    assert_eq!(fx.state_snapshot()[0].1, pre_rename_len);
    assert_eq!(fx.follower_count().await, 1);

    // Appends under the new name flow on, without re-reading old bytes.
    append_line(&new, "after rename");
    assert!(wait_until(|| handler.count() == 11).await);
    assert_eq!(handler.lines()[10], "after rename");
    assert_eq!(handler.count(), 11, "pre-rename bytes were re-read");

    fx.watch.close().await.unwrap();
}

/// Truncating a followed file resets the offset to zero and the rewritten
/// content is delivered.
#[tokio::test]
async fn test_truncation_resets_offset() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("app.log");
    write_lines(&path, 10);
    assert!(wait_until(|| handler.count() == 10).await);

    // Rewrite with less content than the stored offset.
    std::fs::write(&path, b"fresh\n").unwrap();

    assert!(
        wait_until(|| handler.lines().last().map(String::as_str) == Some("fresh")).await,
        "rewritten content not delivered: {:?}",
        handler.lines()
    );
    let snapshot = fx.state_snapshot();
    assert_eq!(snapshot[0].1, 6);

    fx.watch.close().await.unwrap();
}

/// A recreated file (delete then create with the same name) is read from
/// offset zero even though the old entry carried a larger offset.
#[tokio::test]
async fn test_recreation_starts_from_zero() {
    let fx = Fixture::new(0);
    let handler = CollectingHandler::new();
    fx.add_filter("c", "*.log", Arc::clone(&handler)).await;
    fx.watch.start().await.unwrap();

    let path = fx.logs.join("cycle.log");
    write_lines(&path, 10);
    assert!(wait_until(|| handler.count() == 10).await);

    std::fs::remove_file(&path).unwrap();
    let filters = Arc::clone(fx.filters());
    assert!(
        wait_until_async(|| {
            let filters = Arc::clone(&filters);
            async move { filters.follower_count().await == 0 }
        })
        .await
    );

    write_lines(&path, 3);
    assert!(
        wait_until(|| handler.count() == 13).await,
        "recreated file content missing: {:?}",
        handler.lines()
    );
    assert_eq!(handler.lines()[10..], expected_lines(3)[..]);

    fx.watch.close().await.unwrap();
}
