mod common;

use assert_fs::prelude::*;
use assert_matches::assert_matches;
use common::{mtime_of, Fault, FaultyTransfer, MirrorFixture};
use predicates::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use treemirror::{ReconcileOutcome, TransferPolicy};

#[tokio::test]
async fn test_full_run_mirrors_content_and_mtime() {
    let fixture = MirrorFixture::new();
    fixture.source_file("a/b.txt", "hello", 1_600_000_000);

    let outcome = fixture.reconciler().run(false).await.unwrap();

    let summary = assert_matches!(outcome, ReconcileOutcome::Completed(summary) => summary);
    assert_eq!(summary.processed_files, 1);
    assert_eq!(summary.total_files, 1);
    assert_eq!(summary.copied_files, 1);

    let mirrored = fixture.temp_dir.child("dest/a/b.txt");
    mirrored.assert("hello");
    assert_eq!(mtime_of(mirrored.path()), 1_600_000_000);
}

#[tokio::test]
async fn test_build_directories_are_never_mirrored() {
    let fixture = MirrorFixture::new();
    fixture.source_file("src/main.c", "int main;", 1_000);
    fixture.source_file("src/build/output.o", "obj", 1_000);
    fixture.source_file("build/top.o", "obj", 1_000);
    fixture.source_file("docs/building.md", "not ignored", 1_000);

    let outcome = fixture.reconciler().run(false).await.unwrap();
    let summary = assert_matches!(outcome, ReconcileOutcome::Completed(summary) => summary);

    assert_eq!(summary.total_files, 2);
    fixture.temp_dir.child("dest/src/main.c").assert(predicate::path::exists());
    fixture.temp_dir.child("dest/docs/building.md").assert(predicate::path::exists());
    fixture.temp_dir.child("dest/src/build").assert(predicate::path::missing());
    fixture.temp_dir.child("dest/build").assert(predicate::path::missing());

    let copied = fixture.transfer.copied_from();
    assert!(copied.iter().all(|p| !p.components().any(|c| c.as_os_str() == "build")));
}

#[tokio::test]
async fn test_only_stale_files_are_copied() {
    let fixture = MirrorFixture::new();
    fixture.source_file("same.txt", "same", 1_000);
    fixture.source_file("newer.txt", "new", 3_000);
    fixture.source_file("older.txt", "old source", 1_000);
    fixture.dest_file("same.txt", "same", 1_000);
    fixture.dest_file("newer.txt", "stale", 2_000);
    fixture.dest_file("older.txt", "newer dest", 5_000);

    let outcome = fixture.reconciler().run(false).await.unwrap();
    let summary = assert_matches!(outcome, ReconcileOutcome::Completed(summary) => summary);

    assert_eq!(summary.copied_files, 1);
    assert_eq!(summary.up_to_date_files, 2);
    assert_eq!(summary.processed_files, 3);
    fixture.temp_dir.child("dest/newer.txt").assert("new");
    fixture.temp_dir.child("dest/older.txt").assert("newer dest");

    // A second pass finds nothing to do
    let outcome = fixture.reconciler().run(false).await.unwrap();
    let summary = assert_matches!(outcome, ReconcileOutcome::Completed(summary) => summary);
    assert_eq!(summary.copied_files, 0);
    assert_eq!(fixture.transfer.copies(), 1);
}

#[tokio::test]
async fn test_populated_destination_can_be_skipped() {
    let fixture = MirrorFixture::new();
    fixture.source_file("a.txt", "a", 1_000);
    fixture.dest_file("existing.txt", "x", 1_000);

    let outcome = fixture.reconciler().run(true).await.unwrap();

    assert_matches!(outcome, ReconcileOutcome::Skipped);
    assert_eq!(fixture.transfer.copies(), 0);
    fixture.temp_dir.child("dest/a.txt").assert(predicate::path::missing());
}

#[tokio::test]
async fn test_empty_destination_is_not_skipped() {
    let fixture = MirrorFixture::new();
    fixture.source_file("a.txt", "a", 1_000);
    std::fs::create_dir_all(fixture.dest()).unwrap();

    let outcome = fixture.reconciler().run(true).await.unwrap();

    assert_matches!(outcome, ReconcileOutcome::Completed(_));
    fixture.temp_dir.child("dest/a.txt").assert("a");
}

#[tokio::test]
async fn test_unreachable_source_copies_nothing() {
    let fixture = MirrorFixture::new();
    fixture.source_file("a.txt", "a", 1_000);
    fixture.probe.set(false);

    let outcome = fixture.reconciler().run(false).await.unwrap();

    assert_matches!(outcome, ReconcileOutcome::SourceUnreachable);
    assert_eq!(fixture.transfer.copies(), 0);
}

#[tokio::test]
async fn test_mirror_subtree_only_touches_that_directory() {
    let fixture = MirrorFixture::new();
    fixture.source_file("moved/one.txt", "1", 1_000);
    fixture.source_file("moved/nested/two.txt", "2", 1_000);
    fixture.source_file("moved/build/skip.o", "o", 1_000);
    fixture.source_file("elsewhere.txt", "e", 1_000);

    let summary = fixture.reconciler().mirror_subtree(Path::new("moved")).await;

    assert_eq!(summary.total_files, 2);
    assert_eq!(summary.copied_files, 2);
    fixture.temp_dir.child("dest/moved/nested/two.txt").assert("2");
    fixture.temp_dir.child("dest/elsewhere.txt").assert(predicate::path::missing());
    fixture.temp_dir.child("dest/moved/build").assert(predicate::path::missing());
}

#[tokio::test]
async fn test_failing_file_does_not_abort_the_walk() {
    let fixture = MirrorFixture::new();
    fixture.source_file("a/first.txt", "1", 1_000);
    fixture.source_file("a/broken.txt", "x", 1_000);
    fixture.source_file("b/last.txt", "3", 1_000);
    fixture.source_file("top.txt", "t", 1_000);

    let transfer = Arc::new(FaultyTransfer::new("broken.txt", Fault::Fail));
    let outcome = fixture
        .reconciler_with(transfer.clone(), MirrorFixture::policy())
        .run(false)
        .await
        .unwrap();
    let summary = assert_matches!(outcome, ReconcileOutcome::Completed(summary) => summary);

    assert_eq!(summary.total_files, 4);
    assert_eq!(summary.processed_files, summary.total_files);
    assert_eq!(summary.copied_files, 3);
    assert_eq!(summary.failed_files, 1);
    assert_eq!(summary.indeterminate_files, 0);
    assert_eq!(transfer.faulted(), 3);

    fixture.temp_dir.child("dest/a/first.txt").assert("1");
    fixture.temp_dir.child("dest/b/last.txt").assert("3");
    fixture.temp_dir.child("dest/top.txt").assert("t");
    fixture.temp_dir.child("dest/a/broken.txt").assert(predicate::path::missing());
}

#[tokio::test]
async fn test_stalled_copy_is_indeterminate() {
    let fixture = MirrorFixture::new();
    fixture.source_file("one.txt", "1", 1_000);
    fixture.source_file("slow.txt", "s", 1_000);
    fixture.source_file("two.txt", "2", 1_000);

    let transfer = Arc::new(FaultyTransfer::new(
        "slow.txt",
        Fault::Stall(Duration::from_millis(800)),
    ));
    let policy = TransferPolicy {
        timeout: Duration::from_millis(200),
        ..MirrorFixture::policy()
    };
    let outcome = fixture
        .reconciler_with(transfer.clone(), policy)
        .run(false)
        .await
        .unwrap();
    let summary = assert_matches!(outcome, ReconcileOutcome::Completed(summary) => summary);

    assert_eq!(summary.total_files, 3);
    assert_eq!(summary.processed_files, summary.total_files);
    assert_eq!(summary.copied_files, 2);
    assert_eq!(summary.indeterminate_files, 1);
    assert_eq!(summary.failed_files, 0);
    // A timed-out attempt is not retried
    assert_eq!(transfer.faulted(), 1);

    fixture.temp_dir.child("dest/one.txt").assert("1");
    fixture.temp_dir.child("dest/two.txt").assert("2");
}
