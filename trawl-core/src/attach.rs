//! Attachment download jobs and the on-disk layout.
//!
//! Attachment bytes live outside the database, under
//! `<attachments_dir>/<project>/<story>/<attachment>_<filename>`. A file
//! already present with the expected size is not fetched again, which
//! keeps re-runs cheap.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::api::TrackerApi;
use crate::map::validate::SourceFileAttachment;
use crate::progress::ProgressReporter;

/// One pending download, collected while walking story comments.
#[derive(Debug, Clone)]
pub struct AttachmentJob {
    pub project_code: i64,
    pub story_code: i64,
    pub attachment_code: i64,
    pub filename: String,
    pub download_url: String,
    /// Size reported by the source, when it reports one.
    pub size: Option<u64>,
}

impl AttachmentJob {
    pub fn from_source(
        project_code: i64,
        story_code: i64,
        source: &SourceFileAttachment,
    ) -> Self {
        Self {
            project_code,
            story_code,
            attachment_code: source.id,
            filename: source.filename.clone(),
            download_url: source.download_url.clone(),
            size: source.size,
        }
    }

    /// Path of this attachment below the attachments root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(self.project_code.to_string());
        path.push(self.story_code.to_string());
        path.push(format!(
            "{}_{}",
            self.attachment_code,
            sanitize(&self.filename)
        ));
        path
    }
}

/// Remote filenames must not escape the attachment directory.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect()
}

/// What happened to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Bytes written to disk.
    Downloaded(u64),
    /// File was already present with the expected size.
    Skipped,
}

/// Tallies for a batch of jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentStats {
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Downloads attachments below a fixed root directory.
#[derive(Debug, Clone)]
pub struct AttachmentFetcher {
    root: PathBuf,
}

impl AttachmentFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch one attachment, skipping files that already exist with the
    /// expected size. A present file with a different size is fetched
    /// again; the source re-reports sizes on every run.
    pub async fn fetch(
        &self,
        api: &dyn TrackerApi,
        job: &AttachmentJob,
    ) -> crate::error::Result<FetchOutcome> {
        let dest = self.root.join(job.relative_path());

        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            let matches = job.size.is_none_or(|expected| meta.len() == expected);
            if meta.is_file() && matches {
                return Ok(FetchOutcome::Skipped);
            }
        }

        let bytes = api.download(&job.download_url, &dest).await?;
        Ok(FetchOutcome::Downloaded(bytes))
    }

    /// Fetch a batch, advancing `progress` once per job. Per-file
    /// failures are logged and tallied rather than propagated; only
    /// errors that end the whole run bubble up.
    pub async fn fetch_all(
        &self,
        api: &dyn TrackerApi,
        jobs: &[AttachmentJob],
        progress: &dyn ProgressReporter,
    ) -> crate::error::Result<AttachmentStats> {
        let mut stats = AttachmentStats::default();
        for job in jobs {
            match self.fetch(api, job).await {
                Ok(FetchOutcome::Downloaded(bytes)) => {
                    debug!(
                        file = %job.filename,
                        story = job.story_code,
                        bytes,
                        "Downloaded attachment"
                    );
                    stats.downloaded += 1;
                }
                Ok(FetchOutcome::Skipped) => stats.skipped += 1,
                Err(e) if e.halts_run() => return Err(e),
                Err(e) => {
                    warn!(
                        file = %job.filename,
                        story = job.story_code,
                        error = %e,
                        "Failed to download attachment"
                    );
                    stats.failed += 1;
                }
            }
            progress.advance(1);
        }
        Ok(stats)
    }
}
