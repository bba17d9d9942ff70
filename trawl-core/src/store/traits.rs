use crate::types::{
    AccountId, Blocker, BlockerId, Comment, CommentId, Epic, EpicId, Iteration, IterationId,
    Label, LabelId, Member, MemberId, PriorityId, PriorityScaleId, Project, ProjectId, ScaleId,
    StateTypeId, Story, StoryId, StoryTypeId, StoreStats, Task, TaskId, Workspace, WorkspaceId,
};

/// The store abstraction. The mapper and run controller read and write
/// exclusively through this trait.
///
/// Upserts match on the entity's natural key and are idempotent: a second
/// upsert of the same payload changes nothing but clears `expired`, so a
/// row that disappeared upstream and came back is live again. The store
/// owns `id`, `created`, and `expired` on every entity struct.
#[async_trait::async_trait]
pub trait TrackerStore: Send + Sync {
    // ── Lookup tables ──────────────────────────────────────────────

    /// Get or create a story type by name.
    async fn ensure_story_type(&self, name: &str) -> crate::error::Result<StoryTypeId>;

    /// Get or create a story state type by name.
    async fn ensure_state_type(&self, name: &str) -> crate::error::Result<StateTypeId>;

    /// Get or create a priority scale by name.
    async fn ensure_priority_scale(&self, name: &str) -> crate::error::Result<PriorityScaleId>;

    /// Get or create a priority within a scale.
    async fn ensure_priority(
        &self,
        scale: PriorityScaleId,
        name: &str,
        rank: i64,
    ) -> crate::error::Result<PriorityId>;

    /// Get or create an effort scale and its ordered values.
    async fn ensure_effort_scale(
        &self,
        name: &str,
        is_custom: bool,
        values: &[f64],
    ) -> crate::error::Result<ScaleId>;

    /// Insert or revive an account row by source account id.
    async fn upsert_account(
        &self,
        code: i64,
        name: Option<&str>,
    ) -> crate::error::Result<AccountId>;

    // ── Entities ───────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> crate::error::Result<WorkspaceId>;

    async fn upsert_project(&self, project: &Project) -> crate::error::Result<ProjectId>;

    /// Upsert a membership row by `(project, person_code)`. Fields that
    /// are `None` never overwrite stored values, so a skeleton row from
    /// a story reference cannot erase a full membership.
    async fn upsert_member(&self, member: &Member) -> crate::error::Result<MemberId>;

    /// Record a contact value (e.g. kind `email`) for a member.
    async fn ensure_member_contact(
        &self,
        member: MemberId,
        kind: &str,
        value: &str,
    ) -> crate::error::Result<()>;

    async fn upsert_label(&self, label: &Label) -> crate::error::Result<LabelId>;

    async fn upsert_iteration(&self, iteration: &Iteration) -> crate::error::Result<IterationId>;

    async fn upsert_epic(&self, epic: &Epic) -> crate::error::Result<EpicId>;

    async fn upsert_story(&self, story: &Story) -> crate::error::Result<StoryId>;

    async fn upsert_task(&self, task: &Task) -> crate::error::Result<TaskId>;

    async fn upsert_blocker(&self, blocker: &Blocker) -> crate::error::Result<BlockerId>;

    async fn upsert_story_comment(
        &self,
        story: StoryId,
        comment: &Comment,
    ) -> crate::error::Result<CommentId>;

    async fn upsert_epic_comment(
        &self,
        epic: EpicId,
        comment: &Comment,
    ) -> crate::error::Result<CommentId>;

    // ── Link tables ────────────────────────────────────────────────

    /// Record that a project uses a story type.
    async fn link_project_story_type(
        &self,
        project: ProjectId,
        story_type: StoryTypeId,
    ) -> crate::error::Result<()>;

    /// Record that a project uses a story state.
    async fn link_project_state_type(
        &self,
        project: ProjectId,
        state: StateTypeId,
    ) -> crate::error::Result<()>;

    /// Replace a story's label set (delete old links, insert new).
    async fn replace_story_labels(
        &self,
        story: StoryId,
        labels: &[LabelId],
    ) -> crate::error::Result<()>;

    async fn replace_story_owners(
        &self,
        story: StoryId,
        owners: &[MemberId],
    ) -> crate::error::Result<()>;

    async fn replace_story_followers(
        &self,
        story: StoryId,
        followers: &[MemberId],
    ) -> crate::error::Result<()>;

    async fn replace_epic_followers(
        &self,
        epic: EpicId,
        followers: &[MemberId],
    ) -> crate::error::Result<()>;

    async fn replace_story_comment_mentions(
        &self,
        comment: CommentId,
        members: &[MemberId],
    ) -> crate::error::Result<()>;

    async fn replace_epic_comment_mentions(
        &self,
        comment: CommentId,
        members: &[MemberId],
    ) -> crate::error::Result<()>;

    // ── Read-backs ─────────────────────────────────────────────────

    async fn get_project(&self, code: i64) -> crate::error::Result<Option<Project>>;

    async fn get_workspace(&self, code: i64) -> crate::error::Result<Option<Workspace>>;

    async fn get_story(&self, code: i64) -> crate::error::Result<Option<Story>>;

    async fn get_epic(&self, code: i64) -> crate::error::Result<Option<Epic>>;

    async fn get_label(
        &self,
        project: ProjectId,
        name: &str,
    ) -> crate::error::Result<Option<Label>>;

    async fn get_member(
        &self,
        project: ProjectId,
        person_code: i64,
    ) -> crate::error::Result<Option<Member>>;

    async fn get_iteration(
        &self,
        project: ProjectId,
        number: i64,
    ) -> crate::error::Result<Option<Iteration>>;

    async fn get_story_comment(&self, code: i64) -> crate::error::Result<Option<Comment>>;

    async fn get_epic_comment(&self, code: i64) -> crate::error::Result<Option<Comment>>;

    /// Source ids of every project with a row in the store.
    async fn project_codes(&self) -> crate::error::Result<Vec<i64>>;

    /// Source ids of a project's live (non-expired) stories.
    async fn story_codes(&self, project: ProjectId) -> crate::error::Result<Vec<i64>>;

    /// Source ids of a project's live epics.
    async fn epic_codes(&self, project: ProjectId) -> crate::error::Result<Vec<i64>>;

    /// Usernames of a project's members, for mention resolution.
    async fn member_usernames(
        &self,
        project: ProjectId,
    ) -> crate::error::Result<Vec<(MemberId, String)>>;

    async fn story_label_ids(&self, story: StoryId) -> crate::error::Result<Vec<LabelId>>;

    async fn story_owner_ids(&self, story: StoryId) -> crate::error::Result<Vec<MemberId>>;

    async fn story_follower_ids(&self, story: StoryId) -> crate::error::Result<Vec<MemberId>>;

    async fn epic_follower_ids(&self, epic: EpicId) -> crate::error::Result<Vec<MemberId>>;

    async fn story_comment_mention_ids(
        &self,
        comment: CommentId,
    ) -> crate::error::Result<Vec<MemberId>>;

    async fn epic_comment_mention_ids(
        &self,
        comment: CommentId,
    ) -> crate::error::Result<Vec<MemberId>>;

    async fn tasks_for_story(&self, story: StoryId) -> crate::error::Result<Vec<Task>>;

    async fn blockers_for_story(&self, story: StoryId) -> crate::error::Result<Vec<Blocker>>;

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Soft-expire a project's stories whose source ids are not in
    /// `live`. Returns the number of rows expired.
    async fn expire_stories_absent(
        &self,
        project: ProjectId,
        live: &[i64],
    ) -> crate::error::Result<u64>;

    async fn expire_epics_absent(
        &self,
        project: ProjectId,
        live: &[i64],
    ) -> crate::error::Result<u64>;

    /// Soft-expire labels absent from `live_names`.
    async fn expire_labels_absent(
        &self,
        project: ProjectId,
        live_names: &[String],
    ) -> crate::error::Result<u64>;

    /// Soft-expire members absent from `live_person_codes`.
    async fn expire_members_absent(
        &self,
        project: ProjectId,
        live_person_codes: &[i64],
    ) -> crate::error::Result<u64>;

    /// Soft-expire iterations absent from `live_numbers`.
    async fn expire_iterations_absent(
        &self,
        project: ProjectId,
        live_numbers: &[i64],
    ) -> crate::error::Result<u64>;

    /// Physically delete every row scoped to a project, children first.
    /// Shared lookup tables and accounts stay. Returns rows deleted.
    async fn purge_project(&self, code: i64) -> crate::error::Result<u64>;

    // ── Checkpoints ────────────────────────────────────────────────

    /// Get a checkpoint value.
    async fn get_checkpoint(&self, kind: &str) -> crate::error::Result<Option<String>>;

    /// Set a checkpoint value.
    async fn set_checkpoint(&self, kind: &str, value: &str) -> crate::error::Result<()>;

    /// Delete one checkpoint.
    async fn delete_checkpoint(&self, kind: &str) -> crate::error::Result<()>;

    /// Delete every checkpoint namespaced to one project.
    async fn clear_project_checkpoints(&self, project_code: i64) -> crate::error::Result<()>;

    /// Clear all checkpoints (for forced full re-extraction).
    async fn clear_checkpoints(&self) -> crate::error::Result<()>;

    // ── Transactions ──────────────────────────────────────────────

    /// Begin an explicit transaction. Operations between begin and commit
    /// are executed atomically. Default: no-op (each operation auto-commits).
    async fn begin_transaction(&self) -> crate::error::Result<()> {
        Ok(())
    }

    /// Commit the current transaction started by `begin_transaction`.
    async fn commit_transaction(&self) -> crate::error::Result<()> {
        Ok(())
    }

    /// Roll back the current transaction started by `begin_transaction`.
    async fn rollback_transaction(&self) -> crate::error::Result<()> {
        Ok(())
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Per-table row counts and database size.
    async fn stats(&self) -> crate::error::Result<StoreStats>;
}
