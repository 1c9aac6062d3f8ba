// Bidirectional sync driver tests.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use unisync::fs::Backend;
use unisync::{BisyncEngine, BisyncOptions, ConflictStrategy, MemoryBackend, SyncOptions};

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

fn engine(a: &Arc<MemoryBackend>, b: &Arc<MemoryBackend>, opts: BisyncOptions) -> BisyncEngine {
    BisyncEngine::new(
        Arc::clone(a) as Arc<dyn Backend>,
        Arc::clone(b) as Arc<dyn Backend>,
        opts,
    )
}

fn hours_ago(h: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() - chrono::Duration::hours(h)
}

#[tokio::test]
async fn test_conflict_free_symmetry() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert("only-a", b"from a");
    b.insert("only-b", b"from b");
    a.insert_with_modtime("common", b"same", hours_ago(1));
    b.insert_with_modtime("common", b"same", hours_ago(1));

    let report = engine(&a, &b, BisyncOptions::default())
        .sync("", "", &cancel())
        .await
        .unwrap();

    assert!(report.success());
    assert!(report.conflicts.is_empty());
    assert_eq!(report.to_b.copied, 1);
    assert_eq!(report.to_a.copied, 1);
    assert_eq!(report.skipped, 1);

    // Both sides end identical.
    let token = cancel();
    let mut a_list = a.list("", &token).await.unwrap();
    let mut b_list = b.list("", &token).await.unwrap();
    a_list.sort();
    b_list.sort();
    assert_eq!(a_list, b_list);
    for path in &a_list {
        assert_eq!(a.get(path), b.get(path), "{path} differs");
    }
}

#[tokio::test]
async fn test_newer_wins_conflict() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("shared", b"old", hours_ago(2));
    b.insert_with_modtime("shared", b"newer content", hours_ago(0));

    let report = engine(&a, &b, BisyncOptions::default())
        .sync("", "", &cancel())
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.path, "shared");
    assert_eq!(conflict.resolution.as_deref(), Some("newer-wins:b"));
    assert_eq!(a.get("shared").unwrap(), b"newer content");
    assert_eq!(b.get("shared").unwrap(), b"newer content");
    assert_eq!(report.to_a.updated, 1);
    assert_eq!(report.to_b.updated, 0);
}

#[tokio::test]
async fn test_source_wins_propagates_to_b() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("x", b"src", hours_ago(2));
    b.insert_with_modtime("x", b"dst", hours_ago(0));

    let opts = BisyncOptions {
        conflict_strategy: ConflictStrategy::SourceWins,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(
        report.conflicts[0].resolution.as_deref(),
        Some("source-wins")
    );
    assert_eq!(b.get("x").unwrap(), b"src");
    assert_eq!(a.get("x").unwrap(), b"src");
    assert_eq!(report.to_b.updated, 1);
}

#[tokio::test]
async fn test_dest_wins_propagates_to_a() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("x", b"mine", hours_ago(0));
    b.insert_with_modtime("x", b"theirs", hours_ago(2));

    let opts = BisyncOptions {
        conflict_strategy: ConflictStrategy::DestWins,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert_eq!(a.get("x").unwrap(), b"theirs");
    assert_eq!(report.to_a.updated, 1);
}

#[tokio::test]
async fn test_larger_wins_conflict() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("x", b"much larger payload", hours_ago(2));
    b.insert_with_modtime("x", b"tiny", hours_ago(0));

    let opts = BisyncOptions {
        conflict_strategy: ConflictStrategy::LargerWins,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert_eq!(
        report.conflicts[0].resolution.as_deref(),
        Some("larger-wins:a")
    );
    assert_eq!(b.get("x").unwrap(), b"much larger payload");
}

#[tokio::test]
async fn test_keep_both_leaves_suffixed_loser_everywhere() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("doc", b"loser version", hours_ago(3));
    b.insert_with_modtime("doc", b"winner version!", hours_ago(0));

    let opts = BisyncOptions {
        conflict_strategy: ConflictStrategy::KeepBoth,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert!(report.success(), "errors: {:?}", report.errors);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution.as_deref(), Some("keep-both"));

    for side in [&a, &b] {
        assert_eq!(side.get("doc").unwrap(), b"winner version!");
        assert_eq!(side.get("doc.conflict").unwrap(), b"loser version");
    }
}

#[tokio::test]
async fn test_skip_strategy_mutates_nothing() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("x", b"aaa", hours_ago(2));
    b.insert_with_modtime("x", b"bbbbb", hours_ago(0));

    let opts = BisyncOptions {
        conflict_strategy: ConflictStrategy::Skip,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert!(report.success());
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution.as_deref(), Some("skip"));
    assert_eq!(a.get("x").unwrap(), b"aaa");
    assert_eq!(b.get("x").unwrap(), b"bbbbb");
}

#[tokio::test]
async fn test_error_strategy_records_failure() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert_with_modtime("x", b"aaa", hours_ago(2));
    b.insert_with_modtime("x", b"bbbbb", hours_ago(0));

    let opts = BisyncOptions {
        conflict_strategy: ConflictStrategy::Error,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert!(!report.success());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].op, "conflict");
    assert_eq!(a.get("x").unwrap(), b"aaa");
    assert_eq!(b.get("x").unwrap(), b"bbbbb");
}

#[tokio::test]
async fn test_dry_run_plans_without_mutation() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert("only-a", b"1");
    a.insert_with_modtime("both", b"aaa", hours_ago(2));
    b.insert_with_modtime("both", b"bbbbb", hours_ago(0));

    let opts = BisyncOptions {
        base: SyncOptions {
            dry_run: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.to_b.copied, 1);
    assert_eq!(report.to_a.updated, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.bytes_transferred(), 0);
    assert!(b.get("only-a").is_none());
    assert_eq!(a.get("both").unwrap(), b"aaa");
}

#[tokio::test]
async fn test_delete_missing_is_inert() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert("kept", b"x");

    let opts = BisyncOptions {
        delete_missing: true,
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    // The path missing from B is copied, never deleted from A.
    assert!(report.success());
    assert_eq!(report.to_b.copied, 1);
    assert!(a.get("kept").is_some());
    assert!(b.get("kept").is_some());
}

#[tokio::test]
async fn test_bisync_under_base_paths() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert("left/tree/f", b"payload");

    let report = engine(&a, &b, BisyncOptions::default())
        .sync("left/tree", "right/tree", &cancel())
        .await
        .unwrap();

    assert_eq!(report.to_b.copied, 1);
    assert_eq!(b.get("right/tree/f").unwrap(), b"payload");
}

#[tokio::test]
async fn test_filter_applies_to_both_sides() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert("keep-a", b"1");
    a.insert("skip.tmp", b"x");
    b.insert("keep-b", b"2");
    b.insert("other.tmp", b"y");

    let mut filter = unisync::Filter::new();
    filter.add_exclude("*.tmp").unwrap();
    let opts = BisyncOptions {
        base: SyncOptions {
            filter: Some(filter),
            ..Default::default()
        },
        ..Default::default()
    };
    let report = engine(&a, &b, opts).sync("", "", &cancel()).await.unwrap();

    assert!(report.success());
    assert!(b.get("keep-a").is_some());
    assert!(a.get("keep-b").is_some());
    assert!(b.get("skip.tmp").is_none());
    assert!(a.get("other.tmp").is_none());
}

#[tokio::test]
async fn test_bytes_accounted_per_direction() {
    let a = Arc::new(MemoryBackend::new());
    let b = Arc::new(MemoryBackend::new());
    a.insert("to-b", b"12345");
    b.insert("to-a", b"123");

    let report = engine(&a, &b, BisyncOptions::default())
        .sync("", "", &cancel())
        .await
        .unwrap();

    assert_eq!(report.to_b.bytes, 5);
    assert_eq!(report.to_a.bytes, 3);
    assert_eq!(report.bytes_transferred(), 8);
}
