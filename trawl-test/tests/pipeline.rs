// End-to-end extraction tests: fixture tracker → run controller →
// SQLite store.

use chrono::Utc;
use serde_json::json;

use trawl_core::run::stories_checkpoint;
use trawl_core::store::TrackerStore;
use trawl_core::types::RunOutcome;
use trawl_test::{FixtureTracker, Harness, story_payload};

// ── Full extraction ────────────────────────────────────────────────

#[tokio::test]
#[allow(clippy::too_many_lines)]
async fn single_project_full_walk() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);
    let summary = harness.run().await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Success);
    assert_eq!(summary.workspaces, 1);
    assert!(!summary.interrupted);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].name, "Deep Sea Survey");

    let totals = summary.totals();
    assert_eq!(totals.members, 2);
    assert_eq!(totals.labels, 1, "only the standalone label counts as a label fetch");
    assert_eq!(totals.iterations, 1);
    assert_eq!(totals.epics, 1);
    assert_eq!(totals.stories, 3);
    assert_eq!(totals.tasks, 1);
    assert_eq!(totals.blockers, 1);
    assert_eq!(totals.comments, 2, "one story comment plus one epic comment");
    assert_eq!(totals.attachments_downloaded, 1);
    assert_eq!(totals.skipped, 0);
    assert_eq!(totals.expired, 0);

    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.table("project"), 1);
    assert_eq!(stats.table("workspace"), 1);
    assert_eq!(stats.table("account"), 1);
    assert_eq!(stats.table("member"), 2);
    assert_eq!(stats.table("member_contact"), 2);
    assert_eq!(stats.table("label"), 2, "standalone label plus the epic's embedded one");
    assert_eq!(stats.table("iteration"), 1);
    assert_eq!(stats.table("epic"), 1);
    assert_eq!(stats.table("story"), 3);
    assert_eq!(stats.table("task"), 1);
    assert_eq!(stats.table("blocker"), 1);
    assert_eq!(stats.table("story_comment"), 1);
    assert_eq!(stats.table("epic_comment"), 1);
    assert_eq!(stats.table("story_type"), 1);
    assert_eq!(stats.table("story_state_type"), 3);
    assert_eq!(stats.table("priority_scale"), 1);
    assert_eq!(stats.table("priority"), 1);
    assert_eq!(stats.table("effort_scale"), 1);
    assert_eq!(stats.table("scale_value"), 4);
    assert_eq!(
        stats.table("story_comment_has_mention"),
        1,
        "@grace resolves to her membership"
    );
    assert_eq!(stats.expired_rows, 0);

    let story = harness.store.get_story(500).await.unwrap().unwrap();
    assert!(!story.icebox);
    assert_eq!(story.estimate, Some(2.0));
    assert!(story.priority_id.is_some());
    assert!(story.requested_by_id.is_some(), "requester resolves to a member row");
    assert!(story.iteration_id.is_some(), "story 500 is scheduled into iteration 7");

    let icebox = harness.store.get_story(501).await.unwrap().unwrap();
    assert!(icebox.icebox, "unscheduled stories sit in the icebox");
    assert!(icebox.iteration_id.is_none());

    let file = harness
        .attachments_dir()
        .join("99")
        .join("500")
        .join("9001_depth-chart.png");
    let bytes = std::fs::read(&file).unwrap();
    assert_eq!(bytes, b"depth chart");
}

// ── Reruns ─────────────────────────────────────────────────────────

#[tokio::test]
async fn rerun_with_no_upstream_changes_is_idempotent() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);
    harness.run().await.unwrap();
    let before = harness.store.stats().await.unwrap();

    let summary = harness.run().await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Success);
    let after = harness.store.stats().await.unwrap();
    assert_eq!(before.rows_by_table, after.rows_by_table, "reruns must not duplicate rows");
    assert_eq!(after.expired_rows, 0);
}

#[tokio::test]
async fn clear_then_rerun_rebuilds_identical_rows() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);
    harness.run().await.unwrap();
    let fresh = harness.store.stats().await.unwrap();

    // What `run --clear` does before extracting: drop the project's rows
    // and its checkpoints.
    harness.store.purge_project(99).await.unwrap();
    harness.store.clear_project_checkpoints(99).await.unwrap();
    assert!(harness.store.get_story(500).await.unwrap().is_none());

    let summary = harness.run().await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Success);
    let rebuilt = harness.store.stats().await.unwrap();
    assert_eq!(
        fresh.rows_by_table, rebuilt.rows_by_table,
        "a cleared project re-extracts to the same rows as a first run"
    );
    assert_eq!(rebuilt.expired_rows, 0);
}

#[tokio::test]
async fn attachments_download_once_then_skip() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);

    let first = harness.run().await.unwrap();
    assert_eq!(first.totals().attachments_downloaded, 1);
    assert_eq!(first.totals().attachments_skipped, 0);

    let second = harness.run().await.unwrap();
    assert_eq!(second.totals().attachments_downloaded, 0);
    assert_eq!(
        second.totals().attachments_skipped,
        1,
        "a file on disk with the expected size is kept"
    );
    assert_eq!(
        harness.tracker.downloads_served().len(),
        1,
        "the body is fetched exactly once"
    );
}

#[tokio::test]
async fn resumed_pass_does_not_expire_unseen_rows() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);
    harness.run().await.unwrap();

    // A prior interrupted pass left a checkpoint: the next pass starts
    // at offset 2 and must not treat the unseen stories as vanished.
    harness
        .store
        .set_checkpoint(&stories_checkpoint(99), "2")
        .await
        .unwrap();
    let summary = harness.run().await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Success);
    assert_eq!(summary.totals().expired, 0, "a partial story pass never expires rows");
    let unseen = harness.store.get_story(500).await.unwrap().unwrap();
    assert!(unseen.expired.is_none());
}

// ── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn deleted_story_expires_and_revives_when_it_returns() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);
    harness.run().await.unwrap();

    let cutoff = Utc::now();
    harness.tracker.remove_story(99, 502);
    let second = harness.run().await.unwrap();

    assert_eq!(
        second.outcome(),
        RunOutcome::Success,
        "404s from a vanished story's child endpoints are not errors"
    );
    assert_eq!(second.totals().expired, 1);

    let gone = harness.store.get_story(502).await.unwrap().unwrap();
    let expired = gone.expired.expect("story 502 expires once it is missing upstream");
    assert!(expired >= cutoff && expired <= Utc::now());

    let alive = harness.store.get_story(500).await.unwrap().unwrap();
    assert!(alive.expired.is_none());

    harness.tracker.add_story(99, story_payload(502, "Review the readings", "accepted"));
    harness.run().await.unwrap();

    let back = harness.store.get_story(502).await.unwrap().unwrap();
    assert!(back.expired.is_none(), "a story that returns upstream is revived");
}

// ── Failure isolation ──────────────────────────────────────────────

#[tokio::test]
async fn malformed_story_skips_without_blocking_neighbors() {
    let tracker = FixtureTracker::single_project();
    tracker.add_story(99, json!({"id": 503, "story_type": "bug", "current_state": "started"}));
    let mut harness = Harness::new(tracker);
    harness.select(&[99]);

    let summary = harness.run().await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Partial);
    assert_eq!(summary.totals().stories, 3, "the three well-formed stories still land");
    assert_eq!(summary.totals().skipped, 1);
    assert!(!summary.reports[0].failed);
    assert!(summary.reports[0].errors.is_empty(), "a skip is not a stage error");
    assert!(harness.store.get_story(503).await.unwrap().is_none());
}

#[tokio::test]
async fn revoked_credential_halts_the_run() {
    let mut harness = Harness::new(FixtureTracker::single_project());
    harness.select(&[99]);
    harness.run().await.unwrap();

    harness.tracker.revoke_token();
    let err = harness.run().await.unwrap_err();
    assert!(err.halts_run(), "credential rejection must stop the whole run");
}

// ── Multiple projects ──────────────────────────────────────────────

#[tokio::test]
async fn selected_projects_share_lookup_rows() {
    let mut harness = Harness::new(FixtureTracker::two_projects());
    harness.select(&[99, 100]);
    let summary = harness.run().await.unwrap();

    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.outcome(), RunOutcome::Success);

    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.table("project"), 2);
    assert_eq!(stats.table("account"), 1, "both projects hang off the same account");
    assert_eq!(stats.table("effort_scale"), 1);
    assert_eq!(stats.table("story_type"), 1, "both projects reuse the feature row");
    assert_eq!(stats.table("project_has_story_type"), 2);
    assert_eq!(stats.table("label"), 2, "labels stay project-scoped");
}

#[tokio::test]
async fn unselected_run_extracts_the_whole_listing() {
    let harness = Harness::new(FixtureTracker::two_projects());
    let summary = harness.run().await.unwrap();

    assert_eq!(summary.reports.len(), 2);
    assert!(harness.store.get_project(99).await.unwrap().is_some());
    assert!(harness.store.get_project(100).await.unwrap().is_some());
}

#[tokio::test]
async fn purging_one_project_leaves_the_other_intact() {
    let mut harness = Harness::new(FixtureTracker::two_projects());
    harness.select(&[99, 100]);
    harness.run().await.unwrap();

    let deleted = harness.store.purge_project(99).await.unwrap();
    assert!(deleted > 0, "purge reports the rows it removed");

    assert!(harness.store.get_project(99).await.unwrap().is_none());
    assert!(harness.store.get_story(500).await.unwrap().is_none());
    assert!(harness.store.get_project(100).await.unwrap().is_some());
    assert!(harness.store.get_story(900).await.unwrap().is_some());

    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.table("story_type"), 1, "shared lookups survive a purge");
}
