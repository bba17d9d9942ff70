// Integration test utilities and canned tracker fixtures for Trawl.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use trawl_core::api::{Page, Resource, TrackerApi};
use trawl_core::config::TrawlConfig;
use trawl_core::error::{AttachmentError, FetchError, TrawlError};
use trawl_core::progress::NoopReporter;
use trawl_core::run::RunController;
use trawl_core::store::sqlite::SqliteStore;
use trawl_core::types::RunSummary;

/// An in-memory tracker serving canned payloads through [`TrackerApi`].
///
/// Collections are keyed by resource path and served in pages of two,
/// so any fixture with three or more stories exercises pagination and
/// per-page checkpoints. Unknown collections and objects answer 404,
/// like the real service. All mutators take `&self`: tests hold the
/// same `Arc` the run controller holds and reshape the source between
/// passes.
#[derive(Debug)]
pub struct FixtureTracker {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    objects: Mutex<HashMap<String, Value>>,
    downloads: Mutex<HashMap<String, Vec<u8>>>,
    served: Mutex<Vec<String>>,
    token_revoked: AtomicBool,
    page_size: usize,
}

impl FixtureTracker {
    /// An empty tracker: no projects, an empty workspace listing.
    pub fn new() -> Self {
        let tracker = Self {
            collections: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            served: Mutex::new(Vec::new()),
            token_revoked: AtomicBool::new(false),
            page_size: 2,
        };
        tracker.set(&Resource::Projects, Vec::new());
        tracker.set(&Resource::Workspaces, Vec::new());
        tracker
    }

    /// One project with the full entity spread: two memberships, a
    /// label, a current iteration scheduling story 500, an epic with a
    /// comment, three stories, a task, a blocker, and a story comment
    /// carrying an attachment.
    pub fn single_project() -> Self {
        let tracker = Self::new();
        tracker.add_workspace(5, "Research Group");
        tracker.add_project(project_payload(99, "Deep Sea Survey"));

        tracker.push(&Resource::Memberships(99), membership_payload(11, 70, "ada"));
        tracker.push(&Resource::Memberships(99), membership_payload(12, 71, "grace"));
        tracker.push(&Resource::Labels(99), json!({"id": 301, "name": "research"}));
        tracker.push(
            &Resource::Iterations(99),
            json!({
                "number": 7,
                "kind": "current",
                "start": "2025-06-02",
                "finish": "2025-06-09",
                "length": 1,
                "velocity": 10.0,
                "team_strength": 1.0,
                "stories": [{"id": 500}]
            }),
        );

        tracker.add_epic(
            99,
            json!({
                "id": 41,
                "name": "Mapping",
                "label": {"id": 302, "name": "mapping"},
                "follower_ids": [70]
            }),
        );
        tracker.push(
            &Resource::EpicComments {
                project: 99,
                epic: 41,
            },
            comment_payload(802, "Kickoff notes", 70),
        );

        tracker.add_story(99, story_payload(500, "Chart the trench", "started"));
        tracker.add_story(99, story_payload(501, "Calibrate the sonar", "unscheduled"));
        tracker.add_story(99, story_payload(502, "Review the readings", "accepted"));

        tracker.push(
            &Resource::StoryTasks {
                project: 99,
                story: 500,
            },
            json!({"id": 601, "description": "Collect samples", "complete": false, "position": 1}),
        );
        tracker.push(
            &Resource::StoryBlockers {
                project: 99,
                story: 500,
            },
            json!({
                "id": 611, "description": "Awaiting permits", "resolved": false, "person_id": 71
            }),
        );

        let mut comment = comment_payload(801, "@grace can you verify the depth?", 70);
        comment["file_attachments"] = json!([{
            "id": 9001,
            "filename": "depth-chart.png",
            "download_url": "/file_attachments/9001/download",
            "content_type": "image/png",
            "size": 11,
            "uploader_id": 70
        }]);
        tracker.push(
            &Resource::StoryComments {
                project: 99,
                story: 500,
            },
            comment,
        );
        tracker.put_download("/file_attachments/9001/download", b"depth chart");

        tracker
    }

    /// Two projects sharing story type and state names, one story each,
    /// for checks against the shared lookup tables.
    pub fn two_projects() -> Self {
        let tracker = Self::new();
        tracker.add_project(project_payload(99, "Deep Sea Survey"));
        tracker.add_project(project_payload(100, "Harbor Refit"));
        tracker.add_story(99, story_payload(500, "Chart the trench", "started"));
        tracker.add_story(100, story_payload(900, "Patch the hull", "started"));
        tracker
    }

    // ── Source mutators ────────────────────────────────────────────

    /// Register a project object, list it, and seed empty collections
    /// for each of its child resources.
    pub fn add_project(&self, payload: Value) {
        let code = payload["id"].as_i64().expect("project payload needs an id");
        let stub = json!({"id": code, "name": payload["name"]});
        {
            let mut collections = self.collections.lock().unwrap();
            collections
                .entry(Resource::Projects.path())
                .or_default()
                .push(stub);
            for resource in [
                Resource::Stories(code),
                Resource::Epics(code),
                Resource::Iterations(code),
                Resource::Labels(code),
                Resource::Memberships(code),
            ] {
                collections.entry(resource.path()).or_default();
            }
        }
        self.objects
            .lock()
            .unwrap()
            .insert(Resource::Project(code).path(), payload);
    }

    pub fn add_workspace(&self, code: i64, name: &str) {
        self.push(&Resource::Workspaces, json!({"id": code, "name": name}));
    }

    /// Add a story and seed its task, blocker, and comment collections
    /// so child fetches see the story as present.
    pub fn add_story(&self, project: i64, payload: Value) {
        let story = payload["id"].as_i64().expect("story payload needs an id");
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(Resource::Stories(project).path())
            .or_default()
            .push(payload);
        for resource in [
            Resource::StoryTasks { project, story },
            Resource::StoryBlockers { project, story },
            Resource::StoryComments { project, story },
        ] {
            collections.entry(resource.path()).or_default();
        }
    }

    /// Add an epic and seed its comment collection.
    pub fn add_epic(&self, project: i64, payload: Value) {
        let epic = payload["id"].as_i64().expect("epic payload needs an id");
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(Resource::Epics(project).path())
            .or_default()
            .push(payload);
        collections
            .entry(Resource::EpicComments { project, epic }.path())
            .or_default();
    }

    /// Delete a story upstream: it leaves the listing and its child
    /// endpoints start answering 404, like the real service.
    pub fn remove_story(&self, project: i64, story: i64) {
        let mut collections = self.collections.lock().unwrap();
        if let Some(items) = collections.get_mut(&Resource::Stories(project).path()) {
            items.retain(|item| item["id"].as_i64() != Some(story));
        }
        for resource in [
            Resource::StoryTasks { project, story },
            Resource::StoryBlockers { project, story },
            Resource::StoryComments { project, story },
        ] {
            collections.remove(&resource.path());
        }
    }

    /// Append an item to a collection, creating the collection if
    /// this is its first item.
    pub fn push(&self, resource: &Resource, payload: Value) {
        self.collections
            .lock()
            .unwrap()
            .entry(resource.path())
            .or_default()
            .push(payload);
    }

    /// Replace a collection wholesale.
    pub fn set(&self, resource: &Resource, items: Vec<Value>) {
        self.collections.lock().unwrap().insert(resource.path(), items);
    }

    /// Serve `body` for an attachment download URL.
    pub fn put_download(&self, url_path: &str, body: &[u8]) {
        self.downloads
            .lock()
            .unwrap()
            .insert(url_path.to_string(), body.to_vec());
    }

    /// Download URLs served so far, in order.
    pub fn downloads_served(&self) -> Vec<String> {
        self.served.lock().unwrap().clone()
    }

    /// Answer every request from now on with HTTP 401.
    pub fn revoke_token(&self) {
        self.token_revoked.store(true, Ordering::SeqCst);
    }

    fn check_token(&self, resource: &str) -> trawl_core::error::Result<()> {
        if self.token_revoked.load(Ordering::SeqCst) {
            return Err(TrawlError::Fetch(FetchError::Auth {
                status: 401,
                resource: resource.to_string(),
            }));
        }
        Ok(())
    }
}

impl Default for FixtureTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TrackerApi for FixtureTracker {
    async fn fetch_page(
        &self,
        resource: &Resource,
        offset: u64,
    ) -> trawl_core::error::Result<Page> {
        self.check_token(&resource.path())?;
        let collections = self.collections.lock().unwrap();
        let Some(items) = collections.get(&resource.path()) else {
            return Err(TrawlError::Fetch(FetchError::Status {
                status: 404,
                resource: resource.path(),
            }));
        };
        let start = usize::try_from(offset).expect("offset fits in usize");
        let page: Vec<Value> = items
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = if page.len() < self.page_size {
            None
        } else {
            Some(offset + page.len() as u64)
        };
        Ok(Page { items: page, next })
    }

    async fn fetch_one(&self, resource: &Resource) -> trawl_core::error::Result<Value> {
        self.check_token(&resource.path())?;
        let objects = self.objects.lock().unwrap();
        objects.get(&resource.path()).cloned().ok_or_else(|| {
            TrawlError::Fetch(FetchError::Status {
                status: 404,
                resource: resource.path(),
            })
        })
    }

    async fn download(&self, url_path: &str, dest: &Path) -> trawl_core::error::Result<u64> {
        self.check_token(url_path)?;
        let body = {
            let downloads = self.downloads.lock().unwrap();
            downloads.get(url_path).cloned().ok_or_else(|| {
                TrawlError::Fetch(FetchError::Status {
                    status: 404,
                    resource: url_path.to_string(),
                })
            })?
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(AttachmentError::from)?;
        }
        tokio::fs::write(dest, &body)
            .await
            .map_err(AttachmentError::from)?;
        self.served.lock().unwrap().push(url_path.to_string());
        Ok(body.len() as u64)
    }
}

// ── Canned payloads ────────────────────────────────────────────────

/// A project payload with an account, effort scale, and time zone.
pub fn project_payload(code: i64, name: &str) -> Value {
    json!({
        "id": code,
        "name": name,
        "public": false,
        "week_start_day": "Monday",
        "point_scale": "0,1,2,3",
        "point_scale_is_custom": false,
        "start_date": "2025-05-05",
        "velocity_averaged_over": 3,
        "current_iteration_number": 7,
        "account_id": 12,
        "time_zone": {"olson_name": "America/Chicago"},
        "created_at": "2025-05-05T09:00:00Z",
        "updated_at": "2025-08-01T09:00:00Z"
    })
}

/// A feature story requested and owned by person 70, followed by 71,
/// with the `research` label.
pub fn story_payload(code: i64, name: &str, state: &str) -> Value {
    json!({
        "id": code,
        "name": name,
        "story_type": "feature",
        "current_state": state,
        "estimate": 2.0,
        "story_priority": "p2",
        "requested_by_id": 70,
        "owner_ids": [70],
        "follower_ids": [71],
        "labels": [{"id": 301, "name": "research"}],
        "created_at": "2025-06-02T10:00:00Z",
        "updated_at": "2025-08-02T10:00:00Z"
    })
}

pub fn membership_payload(code: i64, person: i64, username: &str) -> Value {
    json!({
        "id": code,
        "role": "member",
        "person": {
            "id": person,
            "name": username,
            "email": format!("{username}@deepsea.test"),
            "initials": username[..1].to_uppercase(),
            "username": username
        }
    })
}

pub fn comment_payload(code: i64, text: &str, person: i64) -> Value {
    json!({
        "id": code,
        "text": text,
        "person_id": person,
        "created_at": "2025-08-03T08:00:00Z",
        "file_attachments": []
    })
}

// ── Run harness ────────────────────────────────────────────────────

/// A fixture tracker wired through [`RunController`] into an in-memory
/// store, with attachments landing under a temp directory.
#[derive(Debug)]
pub struct Harness {
    pub tracker: Arc<FixtureTracker>,
    pub store: Arc<SqliteStore>,
    pub config: TrawlConfig,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(tracker: FixtureTracker) -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let mut config = TrawlConfig::default();
        config.storage.attachments_dir = dir.path().join("attachments");
        Self {
            tracker: Arc::new(tracker),
            store: Arc::new(SqliteStore::in_memory().expect("open in-memory store")),
            config,
            dir,
        }
    }

    /// Restrict the run to the given projects instead of the listing.
    pub fn select(&mut self, projects: &[i64]) {
        self.config.run.projects = projects.to_vec();
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.config.storage.attachments_dir.clone()
    }

    /// One full extraction pass with a fresh controller.
    pub async fn run(&self) -> trawl_core::error::Result<RunSummary> {
        let controller = RunController::new(
            self.store.clone(),
            self.tracker.clone(),
            self.config.clone(),
            Arc::new(NoopReporter),
            Arc::new(AtomicBool::new(false)),
        );
        controller.run().await
    }
}
