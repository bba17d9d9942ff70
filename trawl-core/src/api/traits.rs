use std::path::Path;

use serde_json::Value;

/// Addressable tracker API resources.
///
/// Collections page with `limit`/`offset` query parameters; the only
/// non-collection variant is [`Project`](Self::Project), which returns a
/// single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Projects,
    Project(i64),
    Workspaces,
    Stories(i64),
    Epics(i64),
    Iterations(i64),
    Labels(i64),
    Memberships(i64),
    StoryComments { project: i64, story: i64 },
    StoryTasks { project: i64, story: i64 },
    StoryBlockers { project: i64, story: i64 },
    EpicComments { project: i64, epic: i64 },
}

impl Resource {
    /// URL path below the API root.
    pub fn path(&self) -> String {
        match self {
            Self::Projects => "/projects".to_string(),
            Self::Project(code) => format!("/projects/{code}"),
            Self::Workspaces => "/my/workspaces".to_string(),
            Self::Stories(project) => format!("/projects/{project}/stories"),
            Self::Epics(project) => format!("/projects/{project}/epics"),
            Self::Iterations(project) => format!("/projects/{project}/iterations"),
            Self::Labels(project) => format!("/projects/{project}/labels"),
            Self::Memberships(project) => format!("/projects/{project}/memberships"),
            Self::StoryComments { project, story } => {
                format!("/projects/{project}/stories/{story}/comments")
            }
            Self::StoryTasks { project, story } => {
                format!("/projects/{project}/stories/{story}/tasks")
            }
            Self::StoryBlockers { project, story } => {
                format!("/projects/{project}/stories/{story}/blockers")
            }
            Self::EpicComments { project, epic } => {
                format!("/projects/{project}/epics/{epic}/comments")
            }
        }
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Project(_) => "project",
            Self::Workspaces => "workspaces",
            Self::Stories(_) => "stories",
            Self::Epics(_) => "epics",
            Self::Iterations(_) => "iterations",
            Self::Labels(_) => "labels",
            Self::Memberships(_) => "memberships",
            Self::StoryComments { .. } => "story comments",
            Self::StoryTasks { .. } => "story tasks",
            Self::StoryBlockers { .. } => "story blockers",
            Self::EpicComments { .. } => "epic comments",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// One page of a collection endpoint.
#[derive(Debug, Clone)]
pub struct Page {
    /// Raw items of this page.
    pub items: Vec<Value>,
    /// Offset of the next page; `None` when this page was the last.
    pub next: Option<u64>,
}

/// Read access to the tracker API.
///
/// `fetch_page` is the unit the run controller checkpoints on; `fetch_all`
/// drains a collection when partial progress is not worth persisting.
#[async_trait::async_trait]
pub trait TrackerApi: Send + Sync {
    /// Fetch one page of a collection starting at `offset`.
    async fn fetch_page(&self, resource: &Resource, offset: u64) -> crate::error::Result<Page>;

    /// Fetch a single (non-collection) resource.
    async fn fetch_one(&self, resource: &Resource) -> crate::error::Result<Value>;

    /// Download a file at `url_path` (absolute, or relative to the server
    /// root) into `dest`. Returns bytes written.
    async fn download(&self, url_path: &str, dest: &Path) -> crate::error::Result<u64>;

    /// Drain a collection from the start. A batch shorter than the page
    /// size ends the loop, so an empty collection costs one request.
    async fn fetch_all(&self, resource: &Resource) -> crate::error::Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.fetch_page(resource, offset).await?;
            items.extend(page.items);
            match page.next {
                Some(next) => offset = next,
                None => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_embed_parent_codes() {
        assert_eq!(Resource::Projects.path(), "/projects");
        assert_eq!(Resource::Project(42).path(), "/projects/42");
        assert_eq!(Resource::Stories(42).path(), "/projects/42/stories");
        assert_eq!(
            Resource::StoryComments {
                project: 42,
                story: 7
            }
            .path(),
            "/projects/42/stories/7/comments"
        );
        assert_eq!(
            Resource::EpicComments {
                project: 42,
                epic: 9
            }
            .path(),
            "/projects/42/epics/9/comments"
        );
    }

    #[test]
    fn workspaces_live_under_my() {
        assert_eq!(Resource::Workspaces.path(), "/my/workspaces");
    }
}
