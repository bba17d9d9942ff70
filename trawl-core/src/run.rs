//! The run controller: walks the source one project at a time and drives
//! mapping, checkpoints, expiry, and attachment downloads.
//!
//! A run is: one account-level workspace pass, then per selected project
//! the phases project row → memberships/labels → iterations/epics →
//! stories (checkpointed) → story children → epic comments → attachments
//! → expiry. Entity-level failures are skipped and tallied, a stage
//! failure fails its project and the run moves on to the next one, and
//! only credential or configuration errors end the run itself.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::api::{Resource, TrackerApi};
use crate::attach::{AttachmentFetcher, AttachmentJob};
use crate::config::TrawlConfig;
use crate::error::{FetchError, TrawlError};
use crate::map::{self, Mapper, validate};
use crate::progress::ProgressReporter;
use crate::store::TrackerStore;
use crate::types::{EntityCounts, ProjectId, ProjectReport, RunSummary};

/// Checkpoint key for a project's story pagination offset.
pub fn stories_checkpoint(project_code: i64) -> String {
    format!("project:{project_code}:stories_offset")
}

/// How the story pass went, which gates expiry and checkpoint clearing.
#[derive(Debug, Default)]
struct StoryPass {
    /// Started at offset 0 rather than resuming a checkpoint.
    full: bool,
    /// Reached the final page.
    completed: bool,
}

/// Source keys seen upstream this run. The expiry phase marks rows whose
/// key is missing here. Keys of malformed-but-present entities are kept
/// so a skip never expires a row that still exists upstream.
#[derive(Debug, Default)]
struct LiveSets {
    member_person_codes: Vec<i64>,
    label_names: Vec<String>,
    iteration_numbers: Vec<i64>,
    epic_codes: Vec<i64>,
    story_codes: Vec<i64>,
}

/// Drives a whole extraction run against one store and one source.
#[derive(Clone)]
pub struct RunController {
    store: Arc<dyn TrackerStore>,
    api: Arc<dyn TrackerApi>,
    config: TrawlConfig,
    progress: Arc<dyn ProgressReporter>,
    attachments: AttachmentFetcher,
    stop: Arc<AtomicBool>,
    /// Serializes store writes across project workers. All workers share
    /// one connection, so a transaction must never absorb another
    /// worker's statements.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("projects", &self.config.run.projects)
            .finish_non_exhaustive()
    }
}

impl RunController {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        api: Arc<dyn TrackerApi>,
        config: TrawlConfig,
        progress: Arc<dyn ProgressReporter>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let attachments = AttachmentFetcher::new(config.storage.attachments_dir.clone());
        Self {
            store,
            api,
            config,
            progress,
            attachments,
            stop,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run `work` as one transaction batch, rolling back when it fails.
    /// Fetches stay concurrent across projects; only the writes inside
    /// the batch hold the lock.
    async fn in_batch<T>(
        &self,
        work: impl Future<Output = crate::error::Result<T>>,
    ) -> crate::error::Result<T> {
        let _writing = self.write_lock.lock().await;
        self.store.begin_transaction().await?;
        match work.await {
            Ok(value) => {
                self.store.commit_transaction().await?;
                Ok(value)
            }
            Err(e) => {
                self.store.rollback_transaction().await?;
                Err(e)
            }
        }
    }

    /// Execute the full run. Returns `Err` only for errors that end the
    /// run (bad credentials, configuration); everything else lands in
    /// the summary.
    #[instrument(skip_all)]
    pub async fn run(&self) -> crate::error::Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        match self.extract_workspaces(&mut summary.workspaces).await {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to extract workspaces");
                summary.workspaces_failed = true;
            }
        }

        let codes = self.select_projects().await?;
        info!(count = codes.len(), "Selected projects");

        let parallel = self.config.run.parallel_projects.max(1);
        if parallel == 1 {
            for code in codes {
                if self.stopped() {
                    break;
                }
                let report = self.extract_project(code).await?;
                summary.reports.push(report);
            }
        } else {
            self.extract_parallel(codes, parallel, &mut summary).await?;
        }

        if self.stopped() {
            summary.interrupted = true;
            info!("Stop requested; run ended early");
        }

        summary.duration = start.elapsed();
        let totals = summary.totals();
        info!(
            projects = summary.reports.len(),
            failed = summary.failed_projects(),
            rows = totals.extracted(),
            skipped = totals.skipped,
            expired = totals.expired,
            duration = ?summary.duration,
            "Extraction complete"
        );
        Ok(summary)
    }

    async fn extract_parallel(
        &self,
        codes: Vec<i64>,
        parallel: usize,
        summary: &mut RunSummary,
    ) -> crate::error::Result<()> {
        let mut queue = codes.into_iter();
        let mut tasks: JoinSet<crate::error::Result<ProjectReport>> = JoinSet::new();
        loop {
            while tasks.len() < parallel && !self.stopped() {
                let Some(code) = queue.next() else { break };
                let controller = self.clone();
                tasks.spawn(async move { controller.extract_project(code).await });
            }
            match tasks.join_next().await {
                Some(Ok(Ok(report))) => summary.reports.push(report),
                Some(Ok(Err(e))) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Project task did not finish");
                    summary.interrupted = true;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// The account-level workspace pass; runs once per run.
    async fn extract_workspaces(&self, count: &mut u64) -> crate::error::Result<()> {
        let values = self.api.fetch_all(&Resource::Workspaces).await?;
        for value in &values {
            match validate::parse_workspace(value) {
                Ok(workspace) => {
                    map::persist_workspace(self.store.as_ref(), &workspace).await?;
                    *count += 1;
                }
                Err(e) => warn!(error = %e, "Skipping malformed workspace"),
            }
        }
        Ok(())
    }

    /// Projects named in the config, or every project the token can see.
    async fn select_projects(&self) -> crate::error::Result<Vec<i64>> {
        if !self.config.run.projects.is_empty() {
            return Ok(self.config.run.projects.clone());
        }
        let values = self.api.fetch_all(&Resource::Projects).await?;
        let mut codes = Vec::new();
        for value in &values {
            match value.get("id").and_then(Value::as_i64) {
                Some(id) => codes.push(id),
                None => warn!("Project listing entry without an id"),
            }
        }
        Ok(codes)
    }

    /// Extract one project into a report. Returns `Err` only for errors
    /// that end the whole run.
    #[instrument(skip_all, fields(project = code))]
    async fn extract_project(&self, code: i64) -> crate::error::Result<ProjectReport> {
        let started = Instant::now();
        let mut report = ProjectReport::new(code);
        let mut counts = EntityCounts::default();
        let outcome = self
            .extract_project_inner(code, &mut report, &mut counts)
            .await;
        report.counts = counts;
        report.duration = started.elapsed();
        match outcome {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Project extraction aborted");
                report.errors.push(("project".to_string(), e));
                report.failed = true;
            }
        }
        Ok(report)
    }

    async fn extract_project_inner(
        &self,
        code: i64,
        report: &mut ProjectReport,
        counts: &mut EntityCounts,
    ) -> crate::error::Result<()> {
        let value = self.api.fetch_one(&Resource::Project(code)).await?;
        let source = validate::parse_project(&value)?;
        report.name.clone_from(&source.name);
        info!(project = code, name = %source.name, "Project extraction starting");

        let project = self
            .in_batch(map::persist_project(self.store.as_ref(), &source))
            .await?;
        let mut mapper = Mapper::new(self.store.as_ref(), project, code);
        let mut live = LiveSets::default();

        self.extract_lookups(&mut mapper, counts, &mut live, report, code)
            .await?;
        if report.failed || self.stopped() {
            return Ok(());
        }

        let mut pass = StoryPass::default();
        match self
            .fetch_stories(&mut mapper, counts, &mut live, &mut pass, code)
            .await
        {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract stories");
                report.errors.push(("stories".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }
        if self.stopped() {
            return Ok(());
        }

        let mut jobs: Vec<AttachmentJob> = Vec::new();
        match self
            .extract_story_children(&mut mapper, counts, &mut jobs, project, code)
            .await
        {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract story children");
                report.errors.push(("story details".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }

        match self
            .extract_epic_comments(&mut mapper, counts, project, code)
            .await
        {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract epic comments");
                report.errors.push(("epic comments".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }
        if self.stopped() {
            return Ok(());
        }

        self.download_attachments(&jobs, counts, report, code).await?;

        // Labels and members also enter through epic and story payloads,
        // not just their listings; rows the mapper ensured this pass are
        // as live as listed ones.
        live.label_names.extend(mapper.seen_label_names());
        live.member_person_codes.extend(mapper.seen_person_codes());

        // Expiry only after a full, completed story pass; a partial view
        // must not expire rows it did not see.
        if pass.full && pass.completed && !self.stopped() {
            self.expire_missing(project, &live, counts).await?;
        }

        if pass.completed && !self.stopped() {
            self.in_batch(self.store.clear_project_checkpoints(code)).await?;
        }

        info!(
            project = code,
            rows = counts.extracted(),
            skipped = counts.skipped,
            expired = counts.expired,
            "Project extraction complete"
        );
        Ok(())
    }

    /// Memberships, labels, iterations, and epics — the rows stories
    /// reference. The first stage to exhaust its retries fails the
    /// project; rows from earlier stages stay committed.
    async fn extract_lookups(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        live: &mut LiveSets,
        report: &mut ProjectReport,
        code: i64,
    ) -> crate::error::Result<()> {
        match self.fetch_memberships(mapper, counts, live, code).await {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract memberships");
                report.errors.push(("memberships".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }
        match self.fetch_labels(mapper, counts, live, code).await {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract labels");
                report.errors.push(("labels".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }
        match self.fetch_iterations(mapper, counts, live, code).await {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract iterations");
                report.errors.push(("iterations".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }
        match self.fetch_epics(mapper, counts, live, code).await {
            Ok(()) => {}
            Err(e) if e.halts_run() => return Err(e),
            Err(e) => {
                warn!(project = code, error = %e, "Failed to extract epics");
                report.errors.push(("epics".to_string(), e));
                report.failed = true;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn fetch_memberships(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        live: &mut LiveSets,
        code: i64,
    ) -> crate::error::Result<()> {
        let values = self.api.fetch_all(&Resource::Memberships(code)).await?;
        self.in_batch(async {
            for value in &values {
                match validate::parse_membership(value) {
                    Ok(membership) => {
                        live.member_person_codes.push(membership.person.id);
                        mapper.membership(&membership).await?;
                        counts.members += 1;
                    }
                    Err(e) => {
                        warn!(project = code, error = %e, "Skipping malformed membership");
                        if let Some(person) = value.pointer("/person/id").and_then(Value::as_i64) {
                            live.member_person_codes.push(person);
                        }
                        counts.skipped += 1;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn fetch_labels(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        live: &mut LiveSets,
        code: i64,
    ) -> crate::error::Result<()> {
        let values = self.api.fetch_all(&Resource::Labels(code)).await?;
        self.in_batch(async {
            for value in &values {
                match validate::parse_label(value) {
                    Ok(label) => {
                        live.label_names.push(label.name.clone());
                        mapper.label(&label).await?;
                        counts.labels += 1;
                    }
                    Err(e) => {
                        warn!(project = code, error = %e, "Skipping malformed label");
                        if let Some(name) = value.get("name").and_then(Value::as_str) {
                            live.label_names.push(name.to_string());
                        }
                        counts.skipped += 1;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn fetch_iterations(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        live: &mut LiveSets,
        code: i64,
    ) -> crate::error::Result<()> {
        let values = self.api.fetch_all(&Resource::Iterations(code)).await?;
        self.in_batch(async {
            for value in &values {
                match validate::parse_iteration(value) {
                    Ok(iteration) => {
                        live.iteration_numbers.push(iteration.number);
                        mapper.iteration(&iteration).await?;
                        counts.iterations += 1;
                    }
                    Err(e) => {
                        warn!(project = code, error = %e, "Skipping malformed iteration");
                        if let Some(number) = value.get("number").and_then(Value::as_i64) {
                            live.iteration_numbers.push(number);
                        }
                        counts.skipped += 1;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn fetch_epics(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        live: &mut LiveSets,
        code: i64,
    ) -> crate::error::Result<()> {
        let values = self.api.fetch_all(&Resource::Epics(code)).await?;
        self.in_batch(async {
            for value in &values {
                match validate::parse_epic(value) {
                    Ok(epic) => {
                        live.epic_codes.push(epic.id);
                        mapper.epic(&epic).await?;
                        counts.epics += 1;
                    }
                    Err(e) => {
                        warn!(project = code, error = %e, "Skipping malformed epic");
                        if let Some(id) = value.get("id").and_then(Value::as_i64) {
                            live.epic_codes.push(id);
                        }
                        counts.skipped += 1;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// The checkpointed story walk. Each page commits as one batch with
    /// its checkpoint, so an interrupted run resumes at the last page
    /// that fully landed.
    async fn fetch_stories(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        live: &mut LiveSets,
        pass: &mut StoryPass,
        code: i64,
    ) -> crate::error::Result<()> {
        let key = stories_checkpoint(code);
        let start_offset = self
            .store
            .get_checkpoint(&key)
            .await?
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        pass.full = start_offset == 0;
        if !pass.full {
            info!(project = code, offset = start_offset, "Resuming stories from checkpoint");
        }

        self.progress.start(&format!("project {code}: stories"), None);
        let mut offset = start_offset;
        loop {
            if self.stopped() {
                self.progress.finish();
                return Ok(());
            }
            let page = self.api.fetch_page(&Resource::Stories(code), offset).await?;
            let next = page.next;
            self.in_batch(async {
                for value in &page.items {
                    match validate::parse_story(value) {
                        Ok(story) => {
                            live.story_codes.push(story.id);
                            mapper.story(&story).await?;
                            counts.stories += 1;
                        }
                        Err(e) => {
                            warn!(project = code, error = %e, "Skipping malformed story");
                            if let Some(id) = value.get("id").and_then(Value::as_i64) {
                                live.story_codes.push(id);
                            }
                            counts.skipped += 1;
                        }
                    }
                }
                if let Some(next) = next {
                    self.store.set_checkpoint(&key, &next.to_string()).await?;
                }
                Ok(())
            })
            .await?;
            self.progress.advance(page.items.len() as u64);
            match next {
                Some(n) => offset = n,
                None => break,
            }
        }
        self.progress.finish();
        pass.completed = true;
        Ok(())
    }

    /// Fetch a child collection, treating HTTP 404 as the parent having
    /// vanished upstream since it was listed. Returns `None` in that case
    /// so the caller skips the parent; the expiry phase retires its row.
    async fn fetch_children(
        &self,
        resource: &Resource,
    ) -> crate::error::Result<Option<Vec<Value>>> {
        match self.api.fetch_all(resource).await {
            Ok(values) => Ok(Some(values)),
            Err(TrawlError::Fetch(FetchError::Status { status: 404, .. })) => {
                warn!(resource = %resource, "Parent gone upstream, skipping its children");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Tasks, blockers, and comments for every live story. A story that
    /// vanished upstream is skipped; any other failure aborts the pass.
    async fn extract_story_children(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        jobs: &mut Vec<AttachmentJob>,
        project: ProjectId,
        code: i64,
    ) -> crate::error::Result<()> {
        let stories = self.store.story_codes(project).await?;
        self.progress.start(
            &format!("project {code}: story details"),
            Some(stories.len() as u64),
        );
        for story_code in stories {
            if self.stopped() {
                break;
            }
            if let Err(e) = self
                .one_story_children(mapper, counts, jobs, code, story_code)
                .await
            {
                self.progress.finish();
                return Err(e);
            }
            self.progress.advance(1);
        }
        self.progress.finish();
        Ok(())
    }

    async fn one_story_children(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        jobs: &mut Vec<AttachmentJob>,
        code: i64,
        story_code: i64,
    ) -> crate::error::Result<()> {
        let Some(story) = self.store.get_story(story_code).await? else {
            return Ok(());
        };
        let Some(tasks) = self
            .fetch_children(&Resource::StoryTasks { project: code, story: story_code })
            .await?
        else {
            return Ok(());
        };
        let Some(blockers) = self
            .fetch_children(&Resource::StoryBlockers { project: code, story: story_code })
            .await?
        else {
            return Ok(());
        };
        let Some(comments) = self
            .fetch_children(&Resource::StoryComments { project: code, story: story_code })
            .await?
        else {
            return Ok(());
        };

        self.in_batch(async {
            for value in &tasks {
                match validate::parse_task(value) {
                    Ok(task) => {
                        mapper.task(story.id, &task).await?;
                        counts.tasks += 1;
                    }
                    Err(e) => {
                        warn!(story = story_code, error = %e, "Skipping malformed task");
                        counts.skipped += 1;
                    }
                }
            }
            for value in &blockers {
                match validate::parse_blocker(value) {
                    Ok(blocker) => {
                        mapper.blocker(story.id, &blocker).await?;
                        counts.blockers += 1;
                    }
                    Err(e) => {
                        warn!(story = story_code, error = %e, "Skipping malformed blocker");
                        counts.skipped += 1;
                    }
                }
            }
            for value in &comments {
                match validate::parse_comment(value) {
                    Ok(comment) => {
                        for attachment in &comment.file_attachments {
                            jobs.push(AttachmentJob::from_source(code, story_code, attachment));
                        }
                        mapper.story_comment(story.id, &comment).await?;
                        counts.comments += 1;
                    }
                    Err(e) => {
                        warn!(story = story_code, error = %e, "Skipping malformed comment");
                        counts.skipped += 1;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn extract_epic_comments(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        project: ProjectId,
        code: i64,
    ) -> crate::error::Result<()> {
        let epics = self.store.epic_codes(project).await?;
        for epic_code in epics {
            if self.stopped() {
                break;
            }
            self.one_epic_comments(mapper, counts, code, epic_code).await?;
        }
        Ok(())
    }

    async fn one_epic_comments(
        &self,
        mapper: &mut Mapper<'_>,
        counts: &mut EntityCounts,
        code: i64,
        epic_code: i64,
    ) -> crate::error::Result<()> {
        let Some(epic) = self.store.get_epic(epic_code).await? else {
            return Ok(());
        };
        let Some(comments) = self
            .fetch_children(&Resource::EpicComments { project: code, epic: epic_code })
            .await?
        else {
            return Ok(());
        };
        self.in_batch(async {
            for value in &comments {
                match validate::parse_comment(value) {
                    Ok(comment) => {
                        mapper.epic_comment(epic.id, &comment).await?;
                        counts.comments += 1;
                    }
                    Err(e) => {
                        warn!(epic = epic_code, error = %e, "Skipping malformed comment");
                        counts.skipped += 1;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn download_attachments(
        &self,
        jobs: &[AttachmentJob],
        counts: &mut EntityCounts,
        report: &mut ProjectReport,
        code: i64,
    ) -> crate::error::Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        self.progress.start(
            &format!("project {code}: attachments"),
            Some(jobs.len() as u64),
        );
        match self
            .attachments
            .fetch_all(self.api.as_ref(), jobs, self.progress.as_ref())
            .await
        {
            Ok(stats) => {
                counts.attachments_downloaded += stats.downloaded;
                counts.attachments_skipped += stats.skipped;
                counts.attachments_failed += stats.failed;
            }
            Err(e) if e.halts_run() => {
                self.progress.finish();
                return Err(e);
            }
            Err(e) => {
                warn!(project = code, error = %e, "Attachment batch failed");
                report.errors.push(("attachments".to_string(), e));
            }
        }
        self.progress.finish();
        Ok(())
    }

    /// Soft-expire rows whose source key was not seen this run.
    async fn expire_missing(
        &self,
        project: ProjectId,
        live: &LiveSets,
        counts: &mut EntityCounts,
    ) -> crate::error::Result<()> {
        let expired = self
            .in_batch(async {
                let mut expired = 0;
                expired += self
                    .store
                    .expire_members_absent(project, &live.member_person_codes)
                    .await?;
                expired += self
                    .store
                    .expire_labels_absent(project, &live.label_names)
                    .await?;
                expired += self
                    .store
                    .expire_iterations_absent(project, &live.iteration_numbers)
                    .await?;
                expired += self.store.expire_epics_absent(project, &live.epic_codes).await?;
                expired += self
                    .store
                    .expire_stories_absent(project, &live.story_codes)
                    .await?;
                Ok(expired)
            })
            .await?;
        counts.expired += expired;
        if expired > 0 {
            info!(project = %project, expired, "Expired rows missing upstream");
        }
        Ok(())
    }
}
