use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(AccountId);
typed_id!(WorkspaceId);
typed_id!(ProjectId);
typed_id!(MemberId);
typed_id!(LabelId);
typed_id!(IterationId);
typed_id!(EpicId);
typed_id!(StoryId);
typed_id!(TaskId);
typed_id!(BlockerId);
typed_id!(CommentId);
typed_id!(StoryTypeId);
typed_id!(StateTypeId);
typed_id!(PriorityScaleId);
typed_id!(PriorityId);
typed_id!(ScaleId);

// ── Entity rows ────────────────────────────────────────────────────
//
// One struct per contract table. On upsert the store matches by the
// entity's natural key and manages `id`, `created`, and `expired`
// itself; callers pass `id: ...Id(0)` and placeholder timestamps.
// Reads return fully populated values.

/// A workspace row, keyed by source workspace id.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub code: i64,
    pub name: String,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A project row, keyed by source project id.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub code: i64,
    pub account_id: Option<AccountId>,
    pub effort_scale_id: Option<ScaleId>,
    pub name: String,
    pub description: Option<String>,
    pub public: Option<bool>,
    pub week_start_day: Option<String>,
    /// Olson time zone name (flattened from the source's zone object).
    pub time_zone: Option<String>,
    pub start_date: Option<String>,
    pub initial_velocity: Option<i64>,
    pub current_velocity: Option<i64>,
    pub velocity_averaged_over: Option<i64>,
    pub current_iteration_number: Option<i64>,
    pub source_created_at: Option<String>,
    pub source_updated_at: Option<String>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A project membership row, keyed by `(project, person_code)`.
///
/// `code` is the source membership id; it is `None` for people known
/// only through story references (owner, requester, comment author).
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub code: Option<i64>,
    pub project_id: ProjectId,
    pub person_code: i64,
    pub name: Option<String>,
    pub initials: Option<String>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A label row, keyed by `(project, name)`.
#[derive(Debug, Clone)]
pub struct Label {
    pub id: LabelId,
    pub code: Option<i64>,
    pub project_id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// An iteration row, keyed by `(project, number)`.
#[derive(Debug, Clone)]
pub struct Iteration {
    pub id: IterationId,
    pub project_id: ProjectId,
    pub number: i64,
    pub kind: Option<String>,
    pub start: Option<String>,
    pub finish: Option<String>,
    pub length: Option<i64>,
    pub velocity: Option<f64>,
    pub team_strength: Option<f64>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// An epic row, keyed by source epic id.
#[derive(Debug, Clone)]
pub struct Epic {
    pub id: EpicId,
    pub code: i64,
    pub project_id: ProjectId,
    pub label_id: Option<LabelId>,
    pub name: String,
    pub description: Option<String>,
    pub source_created_at: Option<String>,
    pub source_updated_at: Option<String>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A story row, keyed by source story id.
#[derive(Debug, Clone)]
pub struct Story {
    pub id: StoryId,
    pub code: i64,
    pub project_id: ProjectId,
    pub story_type_id: StoryTypeId,
    pub story_state_type_id: StateTypeId,
    pub priority_id: Option<PriorityId>,
    pub iteration_id: Option<IterationId>,
    pub requested_by_id: Option<MemberId>,
    pub name: String,
    pub description: Option<String>,
    pub estimate: Option<f64>,
    /// Set when the story sits in the icebox (unscheduled state).
    pub icebox: bool,
    pub accepted_at: Option<String>,
    pub source_created_at: Option<String>,
    pub source_updated_at: Option<String>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A story task row, keyed by source task id.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub code: i64,
    pub story_id: StoryId,
    pub description: String,
    pub complete: bool,
    pub position: Option<i64>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A story blocker row, keyed by source blocker id.
#[derive(Debug, Clone)]
pub struct Blocker {
    pub id: BlockerId,
    pub code: i64,
    pub story_id: StoryId,
    /// Member who raised the blocker, when known.
    pub member_id: Option<MemberId>,
    pub description: String,
    pub resolved: bool,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

/// A comment row (story or epic scoped), keyed by source comment id.
/// The parent id is passed to the store call, not carried here.
#[derive(Debug, Clone)]
pub struct Comment {
    pub id: CommentId,
    pub code: i64,
    /// Comment author, when resolvable to a project member.
    pub member_id: Option<MemberId>,
    pub text: Option<String>,
    pub source_created_at: Option<String>,
    pub source_updated_at: Option<String>,
    pub created: DateTime<Utc>,
    pub expired: Option<DateTime<Utc>>,
}

// ── Run accounting ─────────────────────────────────────────────────

/// Row-level tallies for one project extraction.
///
/// Counts are incremented as rows are written; `skipped` counts source
/// entities dropped by the mapper, `expired` counts rows soft-expired
/// because they disappeared upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounts {
    pub workspaces: u64,
    pub members: u64,
    pub labels: u64,
    pub iterations: u64,
    pub epics: u64,
    pub stories: u64,
    pub tasks: u64,
    pub blockers: u64,
    pub comments: u64,
    pub attachments_downloaded: u64,
    pub attachments_skipped: u64,
    pub attachments_failed: u64,
    pub skipped: u64,
    pub expired: u64,
}

impl EntityCounts {
    /// Total entity rows written (not counting attachments or skips).
    pub fn extracted(&self) -> u64 {
        self.workspaces
            + self.members
            + self.labels
            + self.iterations
            + self.epics
            + self.stories
            + self.tasks
            + self.blockers
            + self.comments
    }

    pub fn merge(&mut self, other: &EntityCounts) {
        self.workspaces += other.workspaces;
        self.members += other.members;
        self.labels += other.labels;
        self.iterations += other.iterations;
        self.epics += other.epics;
        self.stories += other.stories;
        self.tasks += other.tasks;
        self.blockers += other.blockers;
        self.comments += other.comments;
        self.attachments_downloaded += other.attachments_downloaded;
        self.attachments_skipped += other.attachments_skipped;
        self.attachments_failed += other.attachments_failed;
        self.skipped += other.skipped;
        self.expired += other.expired;
    }
}

/// Result of extracting one project — individual entity failures don't
/// abort the project, and a failed project doesn't abort the run.
#[derive(Debug)]
pub struct ProjectReport {
    /// Source project id.
    pub project: i64,
    /// Project name as reported by the tracker (empty until fetched).
    pub name: String,
    pub counts: EntityCounts,
    /// Errors recorded against this project, labeled by the stage that
    /// hit them.
    pub errors: Vec<(String, crate::error::TrawlError)>,
    /// Whether the project aborted before completing all phases.
    pub failed: bool,
    pub duration: Duration,
}

impl ProjectReport {
    pub fn new(project: i64) -> Self {
        Self {
            project,
            name: String::new(),
            counts: EntityCounts::default(),
            errors: Vec::new(),
            failed: false,
            duration: Duration::ZERO,
        }
    }

    /// Whether this project finished clean: no abort, no stage errors,
    /// no skips, no failed attachments.
    pub fn clean(&self) -> bool {
        !self.failed
            && self.errors.is_empty()
            && self.counts.skipped == 0
            && self.counts.attachments_failed == 0
    }
}

/// Overall verdict of a run that did not hit a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every selected project extracted without skips or failures.
    Success,
    /// The run finished, but at least one project failed, entity was
    /// skipped, or attachment download failed.
    Partial,
}

/// Summary of a whole run, one report per selected project.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<ProjectReport>,
    /// Workspace rows written by the account-level pass.
    pub workspaces: u64,
    /// Whether the workspace pass failed (non-fatally).
    pub workspaces_failed: bool,
    /// Whether the stop flag ended the run before all work was done.
    pub interrupted: bool,
    pub duration: Duration,
}

impl RunSummary {
    pub fn outcome(&self) -> RunOutcome {
        if self.interrupted || self.workspaces_failed || self.reports.iter().any(|r| !r.clean()) {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        }
    }

    pub fn totals(&self) -> EntityCounts {
        let mut totals = EntityCounts::default();
        for report in &self.reports {
            totals.merge(&report.counts);
        }
        totals
    }

    pub fn failed_projects(&self) -> usize {
        self.reports.iter().filter(|r| r.failed).count()
    }
}

// ── Store statistics ───────────────────────────────────────────────

/// Per-table row counts for the status command and tests.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// `(table name, live row count)` in schema order.
    pub rows_by_table: Vec<(String, u64)>,
    /// Rows carrying a non-NULL `expired` timestamp, across all tables.
    pub expired_rows: u64,
    /// Database file size in bytes (0 for in-memory databases).
    pub db_size_bytes: u64,
}

impl StoreStats {
    /// Live row count for one table, 0 if the table is unknown.
    pub fn table(&self, name: &str) -> u64 {
        self.rows_by_table
            .iter()
            .find(|(t, _)| t == name)
            .map_or(0, |(_, n)| *n)
    }

    pub fn total_rows(&self) -> u64 {
        self.rows_by_table.iter().map(|(_, n)| n).sum()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttachmentError, TrawlError};

    #[test]
    fn typed_id_display() {
        assert_eq!(ProjectId(42).to_string(), "42");
        assert_eq!(StoryId(7).to_string(), "7");
    }

    #[test]
    fn entity_counts_merge() {
        let mut a = EntityCounts {
            stories: 3,
            labels: 2,
            skipped: 1,
            ..EntityCounts::default()
        };
        let b = EntityCounts {
            stories: 2,
            tasks: 4,
            ..EntityCounts::default()
        };
        a.merge(&b);
        assert_eq!(a.stories, 5);
        assert_eq!(a.labels, 2);
        assert_eq!(a.tasks, 4);
        assert_eq!(a.skipped, 1);
        assert_eq!(a.extracted(), 11);
    }

    #[test]
    fn clean_run_is_success() {
        let mut summary = RunSummary::default();
        let mut report = ProjectReport::new(99);
        report.counts.stories = 10;
        summary.reports.push(report);
        assert_eq!(summary.outcome(), RunOutcome::Success);
    }

    #[test]
    fn skips_make_the_run_partial() {
        let mut summary = RunSummary::default();
        let mut report = ProjectReport::new(99);
        report.counts.stories = 9;
        report.counts.skipped = 1;
        summary.reports.push(report);
        assert_eq!(summary.outcome(), RunOutcome::Partial);
        assert_eq!(summary.failed_projects(), 0);
    }

    #[test]
    fn recorded_errors_make_the_run_partial() {
        let mut summary = RunSummary::default();
        let mut report = ProjectReport::new(99);
        report.counts.stories = 9;
        report.errors.push((
            "attachments".to_string(),
            TrawlError::Attachment(AttachmentError::Download {
                filename: "notes.pdf".to_string(),
                message: "connection reset".to_string(),
            }),
        ));
        summary.reports.push(report);
        assert_eq!(summary.outcome(), RunOutcome::Partial);
        assert_eq!(summary.failed_projects(), 0);
    }

    #[test]
    fn failed_project_makes_the_run_partial() {
        let mut summary = RunSummary::default();
        let mut report = ProjectReport::new(99);
        report.failed = true;
        summary.reports.push(report);
        summary.reports.push(ProjectReport::new(100));
        assert_eq!(summary.outcome(), RunOutcome::Partial);
        assert_eq!(summary.failed_projects(), 1);
    }

    #[test]
    fn interrupted_run_is_partial() {
        let summary = RunSummary {
            interrupted: true,
            ..RunSummary::default()
        };
        assert_eq!(summary.outcome(), RunOutcome::Partial);
    }

    #[test]
    fn store_stats_lookup() {
        let stats = StoreStats {
            rows_by_table: vec![("story".to_string(), 12), ("label".to_string(), 3)],
            expired_rows: 1,
            db_size_bytes: 0,
        };
        assert_eq!(stats.table("story"), 12);
        assert_eq!(stats.table("nonexistent"), 0);
        assert_eq!(stats.total_rows(), 15);
    }
}
