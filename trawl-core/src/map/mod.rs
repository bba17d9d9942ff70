//! Maps validated source payloads into store rows.
//!
//! [`Mapper`] is scoped to one project extraction and writes in dependency
//! order: lookups and members first, then iterations and epics, then
//! stories, then child rows. Lookup ids are cached so repeated values hit
//! the store once; the underlying ensure calls are idempotent, so rows are
//! never duplicated even across concurrent projects.

use std::collections::HashMap;

use chrono::Utc;

use crate::store::TrackerStore;
use crate::types::{
    Blocker, BlockerId, Comment, CommentId, Epic, EpicId, Iteration, IterationId, Label, LabelId,
    Member, MemberId, PriorityId, PriorityScaleId, Project, ProjectId, StateTypeId, Story,
    StoryId, StoryTypeId, Task, TaskId, Workspace, WorkspaceId,
};

pub mod validate;

use validate::{
    SourceBlocker, SourceComment, SourceEpic, SourceIteration, SourceLabel, SourceMembership,
    SourceProject, SourceStory, SourceTask, SourceTimeZone, SourceWorkspace,
};

/// Source state meaning the story sits in the icebox.
const ICEBOX_STATE: &str = "unscheduled";

/// Name of the singleton scale holding `p1`..`p3` story priorities.
const PRIORITY_SCALE_NAME: &str = "story_priority";

/// Split `"0,1,2,3"` into ordered estimate values. Non-numeric parts
/// (seen in custom scales) are dropped.
fn scale_values(scale: &str) -> Vec<f64> {
    scale
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Rank of a priority name: the number in `p1`..`p3`.
fn priority_rank(name: &str) -> i64 {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

/// Write the project row together with its account and effort scale,
/// returning the local project id.
pub async fn persist_project(
    store: &dyn TrackerStore,
    source: &SourceProject,
) -> crate::error::Result<ProjectId> {
    let account_id = match source.account_id {
        Some(code) => Some(store.upsert_account(code, None).await?),
        None => None,
    };

    let effort_scale_id = match &source.point_scale {
        Some(scale) => Some(
            store
                .ensure_effort_scale(
                    scale,
                    source.point_scale_is_custom.unwrap_or(false),
                    &scale_values(scale),
                )
                .await?,
        ),
        None => None,
    };

    store
        .upsert_project(&Project {
            id: ProjectId(0),
            code: source.id,
            account_id,
            effort_scale_id,
            name: source.name.clone(),
            description: source.description.clone(),
            public: source.public,
            week_start_day: source.week_start_day.clone(),
            time_zone: source.time_zone.as_ref().and_then(SourceTimeZone::olson),
            start_date: source.start_date.clone(),
            initial_velocity: source.initial_velocity,
            current_velocity: source.current_velocity,
            velocity_averaged_over: source.velocity_averaged_over,
            current_iteration_number: source.current_iteration_number,
            source_created_at: source.created_at.clone(),
            source_updated_at: source.updated_at.clone(),
            created: Utc::now(),
            expired: None,
        })
        .await
}

pub async fn persist_workspace(
    store: &dyn TrackerStore,
    source: &SourceWorkspace,
) -> crate::error::Result<WorkspaceId> {
    store
        .upsert_workspace(&Workspace {
            id: WorkspaceId(0),
            code: source.id,
            name: source.name.clone(),
            created: Utc::now(),
            expired: None,
        })
        .await
}

/// Per-project mapping state: the target project row, lookup id caches,
/// and the story scheduling index built from iteration payloads.
pub struct Mapper<'a> {
    store: &'a dyn TrackerStore,
    project: ProjectId,
    project_code: i64,
    story_types: HashMap<String, StoryTypeId>,
    state_types: HashMap<String, StateTypeId>,
    priorities: HashMap<String, PriorityId>,
    priority_scale: Option<PriorityScaleId>,
    labels: HashMap<String, LabelId>,
    /// person code → member row, covering full memberships and skeletons.
    members: HashMap<i64, MemberId>,
    iterations: HashMap<i64, IterationId>,
    /// story code → iteration number, from iteration story stubs.
    schedule: HashMap<i64, i64>,
    /// lowercase username → member, loaded lazily for mention resolution.
    usernames: Option<HashMap<String, MemberId>>,
}

impl std::fmt::Debug for Mapper<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("project", &self.project)
            .field("project_code", &self.project_code)
            .finish_non_exhaustive()
    }
}

impl<'a> Mapper<'a> {
    pub fn new(store: &'a dyn TrackerStore, project: ProjectId, project_code: i64) -> Self {
        Self {
            store,
            project,
            project_code,
            story_types: HashMap::new(),
            state_types: HashMap::new(),
            priorities: HashMap::new(),
            priority_scale: None,
            labels: HashMap::new(),
            members: HashMap::new(),
            iterations: HashMap::new(),
            schedule: HashMap::new(),
            usernames: None,
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.project
    }

    // ── Lookups ────────────────────────────────────────────────────

    async fn story_type(&mut self, name: &str) -> crate::error::Result<StoryTypeId> {
        if let Some(id) = self.story_types.get(name) {
            return Ok(*id);
        }
        let id = self.store.ensure_story_type(name).await?;
        self.store.link_project_story_type(self.project, id).await?;
        self.story_types.insert(name.to_string(), id);
        Ok(id)
    }

    async fn state_type(&mut self, name: &str) -> crate::error::Result<StateTypeId> {
        if let Some(id) = self.state_types.get(name) {
            return Ok(*id);
        }
        let id = self.store.ensure_state_type(name).await?;
        self.store.link_project_state_type(self.project, id).await?;
        self.state_types.insert(name.to_string(), id);
        Ok(id)
    }

    async fn priority(&mut self, name: &str) -> crate::error::Result<PriorityId> {
        if let Some(id) = self.priorities.get(name) {
            return Ok(*id);
        }
        let scale = match self.priority_scale {
            Some(scale) => scale,
            None => {
                let scale = self.store.ensure_priority_scale(PRIORITY_SCALE_NAME).await?;
                self.priority_scale = Some(scale);
                scale
            }
        };
        let id = self
            .store
            .ensure_priority(scale, name, priority_rank(name))
            .await?;
        self.priorities.insert(name.to_string(), id);
        Ok(id)
    }

    pub async fn label(&mut self, source: &SourceLabel) -> crate::error::Result<LabelId> {
        if let Some(id) = self.labels.get(&source.name) {
            return Ok(*id);
        }
        let id = self
            .store
            .upsert_label(&Label {
                id: LabelId(0),
                code: source.id,
                project_id: self.project,
                name: source.name.clone(),
                description: source.description.clone(),
                created: Utc::now(),
                expired: None,
            })
            .await?;
        self.labels.insert(source.name.clone(), id);
        Ok(id)
    }

    /// Every label name this mapper has written or resolved this pass,
    /// whether it came from the label listing or rode in on an epic or
    /// story payload.
    pub fn seen_label_names(&self) -> Vec<String> {
        self.labels.keys().cloned().collect()
    }

    // ── Members ────────────────────────────────────────────────────

    /// Write a full membership row and remember its person mapping.
    pub async fn membership(
        &mut self,
        source: &SourceMembership,
    ) -> crate::error::Result<MemberId> {
        let id = self
            .store
            .upsert_member(&Member {
                id: MemberId(0),
                code: source.id,
                project_id: self.project,
                person_code: source.person.id,
                name: source.person.name.clone(),
                initials: source.person.initials.clone(),
                username: source.person.username.clone(),
                role: source.role.clone(),
                created: Utc::now(),
                expired: None,
            })
            .await?;
        if let Some(email) = &source.person.email {
            self.store.ensure_member_contact(id, "email", email).await?;
        }
        self.members.insert(source.person.id, id);
        Ok(id)
    }

    /// Resolve a bare person reference (owner, requester, comment author)
    /// to a member row, creating a skeleton row when the person never
    /// appeared in the membership list.
    pub async fn member_ref(&mut self, person_code: i64) -> crate::error::Result<MemberId> {
        if let Some(id) = self.members.get(&person_code) {
            return Ok(*id);
        }
        let id = self
            .store
            .upsert_member(&Member {
                id: MemberId(0),
                code: None,
                project_id: self.project,
                person_code,
                name: None,
                initials: None,
                username: None,
                role: None,
                created: Utc::now(),
                expired: None,
            })
            .await?;
        self.members.insert(person_code, id);
        Ok(id)
    }

    /// Every person code this mapper holds a member row for, skeleton
    /// rows included.
    pub fn seen_person_codes(&self) -> Vec<i64> {
        self.members.keys().copied().collect()
    }

    // ── Iterations and epics ───────────────────────────────────────

    pub async fn iteration(
        &mut self,
        source: &SourceIteration,
    ) -> crate::error::Result<IterationId> {
        let id = self
            .store
            .upsert_iteration(&Iteration {
                id: IterationId(0),
                project_id: self.project,
                number: source.number,
                kind: source.kind.clone(),
                start: source.start.clone(),
                finish: source.finish.clone(),
                length: source.length,
                velocity: source.velocity,
                team_strength: source.team_strength,
                created: Utc::now(),
                expired: None,
            })
            .await?;
        self.iterations.insert(source.number, id);
        for stub in &source.stories {
            self.schedule.insert(stub.id, source.number);
        }
        Ok(id)
    }

    pub async fn epic(&mut self, source: &SourceEpic) -> crate::error::Result<EpicId> {
        let label_id = match &source.label {
            Some(label) => Some(self.label(label).await?),
            None => None,
        };
        let id = self
            .store
            .upsert_epic(&Epic {
                id: EpicId(0),
                code: source.id,
                project_id: self.project,
                label_id,
                name: source.name.clone(),
                description: source.description.clone(),
                source_created_at: source.created_at.clone(),
                source_updated_at: source.updated_at.clone(),
                created: Utc::now(),
                expired: None,
            })
            .await?;

        let mut followers = Vec::new();
        for person in &source.follower_ids {
            followers.push(self.member_ref(*person).await?);
        }
        self.store.replace_epic_followers(id, &followers).await?;
        Ok(id)
    }

    // ── Stories and children ───────────────────────────────────────

    pub async fn story(&mut self, source: &SourceStory) -> crate::error::Result<StoryId> {
        let story_type_id = self.story_type(&source.story_type).await?;
        let story_state_type_id = self.state_type(&source.current_state).await?;
        let priority_id = match &source.story_priority {
            Some(name) => Some(self.priority(name).await?),
            None => None,
        };
        let iteration_id = match self.schedule.get(&source.id).copied() {
            Some(number) => self.iteration_by_number(number).await?,
            None => None,
        };
        let requested_by_id = match source.requested_by_id {
            Some(person) => Some(self.member_ref(person).await?),
            None => None,
        };

        let id = self
            .store
            .upsert_story(&Story {
                id: StoryId(0),
                code: source.id,
                project_id: self.project,
                story_type_id,
                story_state_type_id,
                priority_id,
                iteration_id,
                requested_by_id,
                name: source.name.clone(),
                description: source.description.clone(),
                estimate: source.estimate,
                icebox: source.current_state == ICEBOX_STATE,
                accepted_at: source.accepted_at.clone(),
                source_created_at: source.created_at.clone(),
                source_updated_at: source.updated_at.clone(),
                created: Utc::now(),
                expired: None,
            })
            .await?;

        let mut labels = Vec::new();
        for label in &source.labels {
            labels.push(self.label(label).await?);
        }
        self.store.replace_story_labels(id, &labels).await?;

        let mut owners = Vec::new();
        for person in &source.owner_ids {
            owners.push(self.member_ref(*person).await?);
        }
        self.store.replace_story_owners(id, &owners).await?;

        let mut followers = Vec::new();
        for person in &source.follower_ids {
            followers.push(self.member_ref(*person).await?);
        }
        self.store.replace_story_followers(id, &followers).await?;

        Ok(id)
    }

    async fn iteration_by_number(
        &mut self,
        number: i64,
    ) -> crate::error::Result<Option<IterationId>> {
        if let Some(id) = self.iterations.get(&number) {
            return Ok(Some(*id));
        }
        if let Some(iteration) = self.store.get_iteration(self.project, number).await? {
            self.iterations.insert(number, iteration.id);
            return Ok(Some(iteration.id));
        }
        Ok(None)
    }

    pub async fn task(
        &mut self,
        story: StoryId,
        source: &SourceTask,
    ) -> crate::error::Result<TaskId> {
        self.store
            .upsert_task(&Task {
                id: TaskId(0),
                code: source.id,
                story_id: story,
                description: source.description.clone(),
                complete: source.complete,
                position: source.position,
                created: Utc::now(),
                expired: None,
            })
            .await
    }

    pub async fn blocker(
        &mut self,
        story: StoryId,
        source: &SourceBlocker,
    ) -> crate::error::Result<BlockerId> {
        let member_id = match source.person_id {
            Some(person) => Some(self.member_ref(person).await?),
            None => None,
        };
        self.store
            .upsert_blocker(&Blocker {
                id: BlockerId(0),
                code: source.id,
                story_id: story,
                member_id,
                description: source.description.clone(),
                resolved: source.resolved,
                created: Utc::now(),
                expired: None,
            })
            .await
    }

    pub async fn story_comment(
        &mut self,
        story: StoryId,
        source: &SourceComment,
    ) -> crate::error::Result<CommentId> {
        let comment = self.build_comment(source).await?;
        let id = self.store.upsert_story_comment(story, &comment).await?;
        let mentions = self
            .resolve_mentions(source.text.as_deref().unwrap_or_default())
            .await?;
        self.store.replace_story_comment_mentions(id, &mentions).await?;
        Ok(id)
    }

    pub async fn epic_comment(
        &mut self,
        epic: EpicId,
        source: &SourceComment,
    ) -> crate::error::Result<CommentId> {
        let comment = self.build_comment(source).await?;
        let id = self.store.upsert_epic_comment(epic, &comment).await?;
        let mentions = self
            .resolve_mentions(source.text.as_deref().unwrap_or_default())
            .await?;
        self.store.replace_epic_comment_mentions(id, &mentions).await?;
        Ok(id)
    }

    async fn build_comment(&mut self, source: &SourceComment) -> crate::error::Result<Comment> {
        let member_id = match source.person_id {
            Some(person) => Some(self.member_ref(person).await?),
            None => None,
        };
        Ok(Comment {
            id: CommentId(0),
            code: source.id,
            member_id,
            text: source.text.clone(),
            source_created_at: source.created_at.clone(),
            source_updated_at: source.updated_at.clone(),
            created: Utc::now(),
            expired: None,
        })
    }

    /// Resolve `@username` tokens against project members with a known
    /// username. Unknown usernames are dropped; matching ignores case.
    async fn resolve_mentions(&mut self, text: &str) -> crate::error::Result<Vec<MemberId>> {
        let tokens = validate::mention_tokens(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        if self.usernames.is_none() {
            let map = self
                .store
                .member_usernames(self.project)
                .await?
                .into_iter()
                .map(|(id, username)| (username.to_lowercase(), id))
                .collect();
            self.usernames = Some(map);
        }

        let mut ids: Vec<MemberId> = Vec::new();
        if let Some(usernames) = &self.usernames {
            for token in tokens {
                if let Some(id) = usernames.get(&token.to_lowercase()) {
                    if !ids.contains(id) {
                        ids.push(*id);
                    }
                }
            }
        }
        Ok(ids)
    }
}
