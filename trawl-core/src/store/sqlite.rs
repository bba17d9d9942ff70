use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::types::{
    AccountId, Blocker, BlockerId, Comment, CommentId, Epic, EpicId, Iteration, IterationId,
    Label, LabelId, Member, MemberId, PriorityId, PriorityScaleId, Project, ProjectId, ScaleId,
    StateTypeId, Story, StoryId, StoryTypeId, StoreStats, Task, TaskId, Workspace, WorkspaceId,
};

use super::TrackerStore;
use super::schema;

/// SQLite-backed implementation of `TrackerStore`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

/// `?N, ?N+1, ...` for a dynamic IN clause, starting at `first`.
fn numbered_placeholders(first: usize, count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "?{}", first + i);
    }
    out
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");

        // Performance pragmas (skip WAL for in-memory — it's auto)
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StoreError::Sqlite)?;

        // Try WAL mode — silently ignored for in-memory
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");

        conn.execute_batch(schema::SCHEMA_SQL)
            .map_err(StoreError::Sqlite)?;
        conn.execute_batch(schema::VIEWS_SQL)
            .map_err(StoreError::Sqlite)?;

        // Record the schema version on first open, then verify on every
        // open so a database from a newer trawl fails loudly.
        conn.execute(
            "INSERT OR IGNORE INTO trawl_meta (key, value) VALUES ('schema_version', ?1)",
            params![schema::SCHEMA_VERSION],
        )
        .map_err(StoreError::Sqlite)?;

        let version: String = conn
            .query_row(
                "SELECT value FROM trawl_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        if version != schema::SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database has schema version {version}, this build expects {}",
                schema::SCHEMA_VERSION
            ))
            .into());
        }

        Ok(())
    }

    // ── Row mappers ────────────────────────────────────────────────

    fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
        Ok(Project {
            id: ProjectId(row.get("id")?),
            code: row.get("code")?,
            account_id: row.get::<_, Option<i64>>("account_id")?.map(AccountId),
            effort_scale_id: row.get::<_, Option<i64>>("effort_scale_id")?.map(ScaleId),
            name: row.get("name")?,
            description: row.get("description")?,
            public: row.get("public")?,
            week_start_day: row.get("week_start_day")?,
            time_zone: row.get("time_zone")?,
            start_date: row.get("start_date")?,
            initial_velocity: row.get("initial_velocity")?,
            current_velocity: row.get("current_velocity")?,
            velocity_averaged_over: row.get("velocity_averaged_over")?,
            current_iteration_number: row.get("current_iteration_number")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
        Ok(Workspace {
            id: WorkspaceId(row.get("id")?),
            code: row.get("code")?,
            name: row.get("name")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
        Ok(Member {
            id: MemberId(row.get("id")?),
            code: row.get("code")?,
            project_id: ProjectId(row.get("project_id")?),
            person_code: row.get("person_code")?,
            name: row.get("name")?,
            initials: row.get("initials")?,
            username: row.get("username")?,
            role: row.get("role")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_label(row: &rusqlite::Row<'_>) -> rusqlite::Result<Label> {
        Ok(Label {
            id: LabelId(row.get("id")?),
            code: row.get("code")?,
            project_id: ProjectId(row.get("project_id")?),
            name: row.get("name")?,
            description: row.get("description")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_iteration(row: &rusqlite::Row<'_>) -> rusqlite::Result<Iteration> {
        Ok(Iteration {
            id: IterationId(row.get("id")?),
            project_id: ProjectId(row.get("project_id")?),
            number: row.get("number")?,
            kind: row.get("kind")?,
            start: row.get("start")?,
            finish: row.get("finish")?,
            length: row.get("length")?,
            velocity: row.get("velocity")?,
            team_strength: row.get("team_strength")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_epic(row: &rusqlite::Row<'_>) -> rusqlite::Result<Epic> {
        Ok(Epic {
            id: EpicId(row.get("id")?),
            code: row.get("code")?,
            project_id: ProjectId(row.get("project_id")?),
            label_id: row.get::<_, Option<i64>>("label_id")?.map(LabelId),
            name: row.get("name")?,
            description: row.get("description")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<Story> {
        Ok(Story {
            id: StoryId(row.get("id")?),
            code: row.get("code")?,
            project_id: ProjectId(row.get("project_id")?),
            story_type_id: StoryTypeId(row.get("story_type_id")?),
            story_state_type_id: StateTypeId(row.get("story_state_type_id")?),
            priority_id: row.get::<_, Option<i64>>("priority_id")?.map(PriorityId),
            iteration_id: row.get::<_, Option<i64>>("iteration_id")?.map(IterationId),
            requested_by_id: row
                .get::<_, Option<i64>>("requested_by_id")?
                .map(MemberId),
            name: row.get("name")?,
            description: row.get("description")?,
            estimate: row.get("estimate")?,
            icebox: row.get("icebox")?,
            accepted_at: row.get("accepted_at")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        Ok(Task {
            id: TaskId(row.get("id")?),
            code: row.get("code")?,
            story_id: StoryId(row.get("story_id")?),
            description: row.get("description")?,
            complete: row.get("complete")?,
            position: row.get("position")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_blocker(row: &rusqlite::Row<'_>) -> rusqlite::Result<Blocker> {
        Ok(Blocker {
            id: BlockerId(row.get("id")?),
            code: row.get("code")?,
            story_id: StoryId(row.get("story_id")?),
            member_id: row.get::<_, Option<i64>>("member_id")?.map(MemberId),
            description: row.get("description")?,
            resolved: row.get("resolved")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
        Ok(Comment {
            id: CommentId(row.get("id")?),
            code: row.get("code")?,
            member_id: row.get::<_, Option<i64>>("member_id")?.map(MemberId),
            text: row.get("text")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
            created: parse_ts(&row.get::<_, String>("created")?),
            expired: row.get::<_, Option<String>>("expired")?.map(|s| parse_ts(&s)),
        })
    }

    // ── Shared helpers ─────────────────────────────────────────────

    /// Delete a parent's link rows and insert the given replacement set.
    /// Runs in the caller's transaction when one is open.
    fn replace_links(
        conn: &Connection,
        delete_sql: &str,
        insert_sql: &str,
        parent: i64,
        ids: &[i64],
    ) -> Result<(), rusqlite::Error> {
        conn.execute(delete_sql, params![parent])?;
        let mut stmt = conn.prepare_cached(insert_sql)?;
        for id in ids {
            stmt.execute(params![parent, id])?;
        }
        Ok(())
    }

    /// Read the first column of every row as i64.
    fn ids_for(conn: &Connection, sql: &str, parent: i64) -> Result<Vec<i64>, rusqlite::Error> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![parent], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    /// Soft-expire rows of `table` scoped to a project whose `key_col`
    /// is not in the live set. Returns the number of rows expired.
    fn expire_absent(
        conn: &Connection,
        table: &str,
        key_col: &str,
        project: ProjectId,
        live: &[Box<dyn rusqlite::types::ToSql>],
    ) -> Result<u64, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let count = if live.is_empty() {
            conn.execute(
                &format!("UPDATE {table} SET expired = ?1 WHERE project_id = ?2 AND expired IS NULL"),
                params![now, project.0],
            )?
        } else {
            let sql = format!(
                "UPDATE {table} SET expired = ?1
                 WHERE project_id = ?2 AND expired IS NULL AND {key_col} NOT IN ({})",
                numbered_placeholders(3, live.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bound: Vec<&dyn rusqlite::types::ToSql> = vec![&now, &project.0];
            bound.extend(live.iter().map(std::convert::AsRef::as_ref));
            stmt.execute(bound.as_slice())?
        };
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl TrackerStore for SqliteStore {
    // ── Lookup tables ──────────────────────────────────────────────

    async fn ensure_story_type(&self, name: &str) -> crate::error::Result<StoryTypeId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO story_type (name, created) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET expired = NULL",
            params![name, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM story_type WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(StoryTypeId(id))
    }

    async fn ensure_state_type(&self, name: &str) -> crate::error::Result<StateTypeId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO story_state_type (name, created) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET expired = NULL",
            params![name, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM story_state_type WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(StateTypeId(id))
    }

    async fn ensure_priority_scale(&self, name: &str) -> crate::error::Result<PriorityScaleId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO priority_scale (name, created) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET expired = NULL",
            params![name, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM priority_scale WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(PriorityScaleId(id))
    }

    async fn ensure_priority(
        &self,
        scale: PriorityScaleId,
        name: &str,
        rank: i64,
    ) -> crate::error::Result<PriorityId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO priority (priority_scale_id, name, rank, created)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(priority_scale_id, name) DO UPDATE SET
                rank = excluded.rank,
                expired = NULL",
            params![scale.0, name, rank, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM priority WHERE priority_scale_id = ?1 AND name = ?2",
                params![scale.0, name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(PriorityId(id))
    }

    async fn ensure_effort_scale(
        &self,
        name: &str,
        is_custom: bool,
        values: &[f64],
    ) -> crate::error::Result<ScaleId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO effort_scale (name, is_custom, created) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                is_custom = excluded.is_custom,
                expired = NULL",
            params![name, is_custom, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM effort_scale WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;

        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO scale_value (effort_scale_id, value, position, created)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(effort_scale_id, value) DO UPDATE SET
                    position = excluded.position,
                    expired = NULL",
            )
            .map_err(StoreError::Sqlite)?;
        for (position, value) in (0_i64..).zip(values.iter()) {
            stmt.execute(params![id, value, position, now])
                .map_err(StoreError::Sqlite)?;
        }

        Ok(ScaleId(id))
    }

    async fn upsert_account(
        &self,
        code: i64,
        name: Option<&str>,
    ) -> crate::error::Result<AccountId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO account (code, name, created) VALUES (?1, ?2, ?3)
             ON CONFLICT(code) DO UPDATE SET
                name = COALESCE(excluded.name, account.name),
                expired = NULL",
            params![code, name, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM account WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(AccountId(id))
    }

    // ── Entities ───────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> crate::error::Result<WorkspaceId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspace (code, name, created) VALUES (?1, ?2, ?3)
             ON CONFLICT(code) DO UPDATE SET
                name = excluded.name,
                expired = NULL",
            params![workspace.code, workspace.name, now],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM workspace WHERE code = ?1",
                params![workspace.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(WorkspaceId(id))
    }

    async fn upsert_project(&self, project: &Project) -> crate::error::Result<ProjectId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO project (
                code, account_id, effort_scale_id, name, description, public,
                week_start_day, time_zone, start_date, initial_velocity,
                current_velocity, velocity_averaged_over, current_iteration_number,
                source_created_at, source_updated_at, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(code) DO UPDATE SET
                account_id = excluded.account_id,
                effort_scale_id = excluded.effort_scale_id,
                name = excluded.name,
                description = excluded.description,
                public = excluded.public,
                week_start_day = excluded.week_start_day,
                time_zone = excluded.time_zone,
                start_date = excluded.start_date,
                initial_velocity = excluded.initial_velocity,
                current_velocity = excluded.current_velocity,
                velocity_averaged_over = excluded.velocity_averaged_over,
                current_iteration_number = excluded.current_iteration_number,
                source_created_at = excluded.source_created_at,
                source_updated_at = excluded.source_updated_at,
                expired = NULL",
            params![
                project.code,
                project.account_id.map(|id| id.0),
                project.effort_scale_id.map(|id| id.0),
                project.name,
                project.description,
                project.public,
                project.week_start_day,
                project.time_zone,
                project.start_date,
                project.initial_velocity,
                project.current_velocity,
                project.velocity_averaged_over,
                project.current_iteration_number,
                project.source_created_at,
                project.source_updated_at,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;

        // Query the real id rather than last_insert_rowid(), which keeps
        // the previous rowid when ON CONFLICT takes the UPDATE path.
        let id: i64 = conn
            .query_row(
                "SELECT id FROM project WHERE code = ?1",
                params![project.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(ProjectId(id))
    }

    async fn upsert_member(&self, member: &Member) -> crate::error::Result<MemberId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO member (
                code, project_id, person_code, name, initials, username, role, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project_id, person_code) DO UPDATE SET
                code = COALESCE(excluded.code, member.code),
                name = COALESCE(excluded.name, member.name),
                initials = COALESCE(excluded.initials, member.initials),
                username = COALESCE(excluded.username, member.username),
                role = COALESCE(excluded.role, member.role),
                expired = NULL",
            params![
                member.code,
                member.project_id.0,
                member.person_code,
                member.name,
                member.initials,
                member.username,
                member.role,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM member WHERE project_id = ?1 AND person_code = ?2",
                params![member.project_id.0, member.person_code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(MemberId(id))
    }

    async fn ensure_member_contact(
        &self,
        member: MemberId,
        kind: &str,
        value: &str,
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO member_contact (member_id, kind, value, created)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(member_id, kind, value) DO UPDATE SET expired = NULL",
            params![member.0, kind, value, now],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn upsert_label(&self, label: &Label) -> crate::error::Result<LabelId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO label (code, project_id, name, description, created)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project_id, name) DO UPDATE SET
                code = COALESCE(excluded.code, label.code),
                description = COALESCE(excluded.description, label.description),
                expired = NULL",
            params![
                label.code,
                label.project_id.0,
                label.name,
                label.description,
                now
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM label WHERE project_id = ?1 AND name = ?2",
                params![label.project_id.0, label.name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(LabelId(id))
    }

    async fn upsert_iteration(&self, iteration: &Iteration) -> crate::error::Result<IterationId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO iteration (
                project_id, number, kind, start, finish, length, velocity,
                team_strength, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(project_id, number) DO UPDATE SET
                kind = excluded.kind,
                start = excluded.start,
                finish = excluded.finish,
                length = excluded.length,
                velocity = excluded.velocity,
                team_strength = excluded.team_strength,
                expired = NULL",
            params![
                iteration.project_id.0,
                iteration.number,
                iteration.kind,
                iteration.start,
                iteration.finish,
                iteration.length,
                iteration.velocity,
                iteration.team_strength,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM iteration WHERE project_id = ?1 AND number = ?2",
                params![iteration.project_id.0, iteration.number],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(IterationId(id))
    }

    async fn upsert_epic(&self, epic: &Epic) -> crate::error::Result<EpicId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO epic (
                code, project_id, label_id, name, description,
                source_created_at, source_updated_at, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(code) DO UPDATE SET
                project_id = excluded.project_id,
                label_id = excluded.label_id,
                name = excluded.name,
                description = excluded.description,
                source_created_at = excluded.source_created_at,
                source_updated_at = excluded.source_updated_at,
                expired = NULL",
            params![
                epic.code,
                epic.project_id.0,
                epic.label_id.map(|id| id.0),
                epic.name,
                epic.description,
                epic.source_created_at,
                epic.source_updated_at,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM epic WHERE code = ?1",
                params![epic.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(EpicId(id))
    }

    async fn upsert_story(&self, story: &Story) -> crate::error::Result<StoryId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO story (
                code, project_id, story_type_id, story_state_type_id, priority_id,
                iteration_id, requested_by_id, name, description, estimate, icebox,
                accepted_at, source_created_at, source_updated_at, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(code) DO UPDATE SET
                project_id = excluded.project_id,
                story_type_id = excluded.story_type_id,
                story_state_type_id = excluded.story_state_type_id,
                priority_id = excluded.priority_id,
                iteration_id = excluded.iteration_id,
                requested_by_id = excluded.requested_by_id,
                name = excluded.name,
                description = excluded.description,
                estimate = excluded.estimate,
                icebox = excluded.icebox,
                accepted_at = excluded.accepted_at,
                source_created_at = excluded.source_created_at,
                source_updated_at = excluded.source_updated_at,
                expired = NULL",
            params![
                story.code,
                story.project_id.0,
                story.story_type_id.0,
                story.story_state_type_id.0,
                story.priority_id.map(|id| id.0),
                story.iteration_id.map(|id| id.0),
                story.requested_by_id.map(|id| id.0),
                story.name,
                story.description,
                story.estimate,
                story.icebox,
                story.accepted_at,
                story.source_created_at,
                story.source_updated_at,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM story WHERE code = ?1",
                params![story.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(StoryId(id))
    }

    async fn upsert_task(&self, task: &Task) -> crate::error::Result<TaskId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO task (code, story_id, description, complete, position, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(code) DO UPDATE SET
                story_id = excluded.story_id,
                description = excluded.description,
                complete = excluded.complete,
                position = excluded.position,
                expired = NULL",
            params![
                task.code,
                task.story_id.0,
                task.description,
                task.complete,
                task.position,
                now
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM task WHERE code = ?1",
                params![task.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(TaskId(id))
    }

    async fn upsert_blocker(&self, blocker: &Blocker) -> crate::error::Result<BlockerId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO blocker (code, story_id, member_id, description, resolved, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(code) DO UPDATE SET
                story_id = excluded.story_id,
                member_id = excluded.member_id,
                description = excluded.description,
                resolved = excluded.resolved,
                expired = NULL",
            params![
                blocker.code,
                blocker.story_id.0,
                blocker.member_id.map(|id| id.0),
                blocker.description,
                blocker.resolved,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM blocker WHERE code = ?1",
                params![blocker.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(BlockerId(id))
    }

    async fn upsert_story_comment(
        &self,
        story: StoryId,
        comment: &Comment,
    ) -> crate::error::Result<CommentId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO story_comment (
                code, story_id, member_id, text, source_created_at, source_updated_at, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(code) DO UPDATE SET
                story_id = excluded.story_id,
                member_id = excluded.member_id,
                text = excluded.text,
                source_created_at = excluded.source_created_at,
                source_updated_at = excluded.source_updated_at,
                expired = NULL",
            params![
                comment.code,
                story.0,
                comment.member_id.map(|id| id.0),
                comment.text,
                comment.source_created_at,
                comment.source_updated_at,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM story_comment WHERE code = ?1",
                params![comment.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(CommentId(id))
    }

    async fn upsert_epic_comment(
        &self,
        epic: EpicId,
        comment: &Comment,
    ) -> crate::error::Result<CommentId> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO epic_comment (
                code, epic_id, member_id, text, source_created_at, source_updated_at, created
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(code) DO UPDATE SET
                epic_id = excluded.epic_id,
                member_id = excluded.member_id,
                text = excluded.text,
                source_created_at = excluded.source_created_at,
                source_updated_at = excluded.source_updated_at,
                expired = NULL",
            params![
                comment.code,
                epic.0,
                comment.member_id.map(|id| id.0),
                comment.text,
                comment.source_created_at,
                comment.source_updated_at,
                now,
            ],
        )
        .map_err(StoreError::Sqlite)?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM epic_comment WHERE code = ?1",
                params![comment.code],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(CommentId(id))
    }

    // ── Link tables ────────────────────────────────────────────────

    async fn link_project_story_type(
        &self,
        project: ProjectId,
        story_type: StoryTypeId,
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO project_has_story_type (project_id, story_type_id)
             VALUES (?1, ?2)",
            params![project.0, story_type.0],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn link_project_state_type(
        &self,
        project: ProjectId,
        state: StateTypeId,
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO project_has_story_state (project_id, story_state_type_id)
             VALUES (?1, ?2)",
            params![project.0, state.0],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn replace_story_labels(
        &self,
        story: StoryId,
        labels: &[LabelId],
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids: Vec<i64> = labels.iter().map(|id| id.0).collect();
        Self::replace_links(
            &conn,
            "DELETE FROM story_has_label WHERE story_id = ?1",
            "INSERT OR IGNORE INTO story_has_label (story_id, label_id) VALUES (?1, ?2)",
            story.0,
            &ids,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn replace_story_owners(
        &self,
        story: StoryId,
        owners: &[MemberId],
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids: Vec<i64> = owners.iter().map(|id| id.0).collect();
        Self::replace_links(
            &conn,
            "DELETE FROM story_has_owner WHERE story_id = ?1",
            "INSERT OR IGNORE INTO story_has_owner (story_id, member_id) VALUES (?1, ?2)",
            story.0,
            &ids,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn replace_story_followers(
        &self,
        story: StoryId,
        followers: &[MemberId],
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids: Vec<i64> = followers.iter().map(|id| id.0).collect();
        Self::replace_links(
            &conn,
            "DELETE FROM story_has_follower WHERE story_id = ?1",
            "INSERT OR IGNORE INTO story_has_follower (story_id, member_id) VALUES (?1, ?2)",
            story.0,
            &ids,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn replace_epic_followers(
        &self,
        epic: EpicId,
        followers: &[MemberId],
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids: Vec<i64> = followers.iter().map(|id| id.0).collect();
        Self::replace_links(
            &conn,
            "DELETE FROM epic_has_follower WHERE epic_id = ?1",
            "INSERT OR IGNORE INTO epic_has_follower (epic_id, member_id) VALUES (?1, ?2)",
            epic.0,
            &ids,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn replace_story_comment_mentions(
        &self,
        comment: CommentId,
        members: &[MemberId],
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids: Vec<i64> = members.iter().map(|id| id.0).collect();
        Self::replace_links(
            &conn,
            "DELETE FROM story_comment_has_mention WHERE story_comment_id = ?1",
            "INSERT OR IGNORE INTO story_comment_has_mention (story_comment_id, member_id)
             VALUES (?1, ?2)",
            comment.0,
            &ids,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn replace_epic_comment_mentions(
        &self,
        comment: CommentId,
        members: &[MemberId],
    ) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids: Vec<i64> = members.iter().map(|id| id.0).collect();
        Self::replace_links(
            &conn,
            "DELETE FROM epic_comment_has_mention WHERE epic_comment_id = ?1",
            "INSERT OR IGNORE INTO epic_comment_has_mention (epic_comment_id, member_id)
             VALUES (?1, ?2)",
            comment.0,
            &ids,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ── Read-backs ─────────────────────────────────────────────────

    async fn get_project(&self, code: i64) -> crate::error::Result<Option<Project>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM project WHERE code = ?1",
            params![code],
            Self::row_to_project,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_workspace(&self, code: i64) -> crate::error::Result<Option<Workspace>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM workspace WHERE code = ?1",
            params![code],
            Self::row_to_workspace,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_story(&self, code: i64) -> crate::error::Result<Option<Story>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM story WHERE code = ?1",
            params![code],
            Self::row_to_story,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_epic(&self, code: i64) -> crate::error::Result<Option<Epic>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM epic WHERE code = ?1",
            params![code],
            Self::row_to_epic,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_label(
        &self,
        project: ProjectId,
        name: &str,
    ) -> crate::error::Result<Option<Label>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM label WHERE project_id = ?1 AND name = ?2",
            params![project.0, name],
            Self::row_to_label,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_member(
        &self,
        project: ProjectId,
        person_code: i64,
    ) -> crate::error::Result<Option<Member>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM member WHERE project_id = ?1 AND person_code = ?2",
            params![project.0, person_code],
            Self::row_to_member,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_iteration(
        &self,
        project: ProjectId,
        number: i64,
    ) -> crate::error::Result<Option<Iteration>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM iteration WHERE project_id = ?1 AND number = ?2",
            params![project.0, number],
            Self::row_to_iteration,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_story_comment(&self, code: i64) -> crate::error::Result<Option<Comment>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM story_comment WHERE code = ?1",
            params![code],
            Self::row_to_comment,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn get_epic_comment(&self, code: i64) -> crate::error::Result<Option<Comment>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT * FROM epic_comment WHERE code = ?1",
            params![code],
            Self::row_to_comment,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn project_codes(&self) -> crate::error::Result<Vec<i64>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT code FROM project ORDER BY code")
            .map_err(StoreError::Sqlite)?;
        let codes = stmt
            .query_map([], |row| row.get(0))
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(StoreError::Sqlite)?;
        Ok(codes)
    }

    async fn story_codes(&self, project: ProjectId) -> crate::error::Result<Vec<i64>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        Self::ids_for(
            &conn,
            "SELECT code FROM story WHERE project_id = ?1 AND expired IS NULL ORDER BY code",
            project.0,
        )
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn epic_codes(&self, project: ProjectId) -> crate::error::Result<Vec<i64>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        Self::ids_for(
            &conn,
            "SELECT code FROM epic WHERE project_id = ?1 AND expired IS NULL ORDER BY code",
            project.0,
        )
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn member_usernames(
        &self,
        project: ProjectId,
    ) -> crate::error::Result<Vec<(MemberId, String)>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, username FROM member
                 WHERE project_id = ?1 AND username IS NOT NULL AND expired IS NULL",
            )
            .map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map(params![project.0], |row| {
                Ok((MemberId(row.get(0)?), row.get::<_, String>(1)?))
            })
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;
        Ok(rows)
    }

    async fn story_label_ids(&self, story: StoryId) -> crate::error::Result<Vec<LabelId>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids = Self::ids_for(
            &conn,
            "SELECT label_id FROM story_has_label WHERE story_id = ?1 ORDER BY label_id",
            story.0,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(ids.into_iter().map(LabelId).collect())
    }

    async fn story_owner_ids(&self, story: StoryId) -> crate::error::Result<Vec<MemberId>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids = Self::ids_for(
            &conn,
            "SELECT member_id FROM story_has_owner WHERE story_id = ?1 ORDER BY member_id",
            story.0,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(ids.into_iter().map(MemberId).collect())
    }

    async fn story_follower_ids(&self, story: StoryId) -> crate::error::Result<Vec<MemberId>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids = Self::ids_for(
            &conn,
            "SELECT member_id FROM story_has_follower WHERE story_id = ?1 ORDER BY member_id",
            story.0,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(ids.into_iter().map(MemberId).collect())
    }

    async fn epic_follower_ids(&self, epic: EpicId) -> crate::error::Result<Vec<MemberId>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids = Self::ids_for(
            &conn,
            "SELECT member_id FROM epic_has_follower WHERE epic_id = ?1 ORDER BY member_id",
            epic.0,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(ids.into_iter().map(MemberId).collect())
    }

    async fn story_comment_mention_ids(
        &self,
        comment: CommentId,
    ) -> crate::error::Result<Vec<MemberId>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids = Self::ids_for(
            &conn,
            "SELECT member_id FROM story_comment_has_mention
             WHERE story_comment_id = ?1 ORDER BY member_id",
            comment.0,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(ids.into_iter().map(MemberId).collect())
    }

    async fn epic_comment_mention_ids(
        &self,
        comment: CommentId,
    ) -> crate::error::Result<Vec<MemberId>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let ids = Self::ids_for(
            &conn,
            "SELECT member_id FROM epic_comment_has_mention
             WHERE epic_comment_id = ?1 ORDER BY member_id",
            comment.0,
        )
        .map_err(StoreError::Sqlite)?;
        Ok(ids.into_iter().map(MemberId).collect())
    }

    async fn tasks_for_story(&self, story: StoryId) -> crate::error::Result<Vec<Task>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM task WHERE story_id = ?1
                 ORDER BY position IS NULL, position, code",
            )
            .map_err(StoreError::Sqlite)?;
        let tasks = stmt
            .query_map(params![story.0], Self::row_to_task)
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;
        Ok(tasks)
    }

    async fn blockers_for_story(&self, story: StoryId) -> crate::error::Result<Vec<Blocker>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let mut stmt = conn
            .prepare_cached("SELECT * FROM blocker WHERE story_id = ?1 ORDER BY code")
            .map_err(StoreError::Sqlite)?;
        let blockers = stmt
            .query_map(params![story.0], Self::row_to_blocker)
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;
        Ok(blockers)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    async fn expire_stories_absent(
        &self,
        project: ProjectId,
        live: &[i64],
    ) -> crate::error::Result<u64> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let boxed: Vec<Box<dyn rusqlite::types::ToSql>> =
            live.iter().map(|c| Box::new(*c) as _).collect();
        Self::expire_absent(&conn, "story", "code", project, &boxed)
            .map_err(StoreError::Sqlite)
            .map_err(Into::into)
    }

    async fn expire_epics_absent(
        &self,
        project: ProjectId,
        live: &[i64],
    ) -> crate::error::Result<u64> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let boxed: Vec<Box<dyn rusqlite::types::ToSql>> =
            live.iter().map(|c| Box::new(*c) as _).collect();
        Self::expire_absent(&conn, "epic", "code", project, &boxed)
            .map_err(StoreError::Sqlite)
            .map_err(Into::into)
    }

    async fn expire_labels_absent(
        &self,
        project: ProjectId,
        live_names: &[String],
    ) -> crate::error::Result<u64> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let boxed: Vec<Box<dyn rusqlite::types::ToSql>> = live_names
            .iter()
            .map(|n| Box::new(n.clone()) as _)
            .collect();
        Self::expire_absent(&conn, "label", "name", project, &boxed)
            .map_err(StoreError::Sqlite)
            .map_err(Into::into)
    }

    async fn expire_members_absent(
        &self,
        project: ProjectId,
        live_person_codes: &[i64],
    ) -> crate::error::Result<u64> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let boxed: Vec<Box<dyn rusqlite::types::ToSql>> = live_person_codes
            .iter()
            .map(|c| Box::new(*c) as _)
            .collect();
        Self::expire_absent(&conn, "member", "person_code", project, &boxed)
            .map_err(StoreError::Sqlite)
            .map_err(Into::into)
    }

    async fn expire_iterations_absent(
        &self,
        project: ProjectId,
        live_numbers: &[i64],
    ) -> crate::error::Result<u64> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let boxed: Vec<Box<dyn rusqlite::types::ToSql>> = live_numbers
            .iter()
            .map(|n| Box::new(*n) as _)
            .collect();
        Self::expire_absent(&conn, "iteration", "number", project, &boxed)
            .map_err(StoreError::Sqlite)
            .map_err(Into::into)
    }

    async fn purge_project(&self, code: i64) -> crate::error::Result<u64> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(StoreError::Sqlite)?;

        let project_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM project WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Sqlite)?;
        let Some(pid) = project_id else {
            return Ok(0);
        };

        // Children before parents so foreign keys stay satisfied.
        let statements = [
            "DELETE FROM story_comment_has_mention WHERE story_comment_id IN
                (SELECT id FROM story_comment WHERE story_id IN
                    (SELECT id FROM story WHERE project_id = ?1))",
            "DELETE FROM epic_comment_has_mention WHERE epic_comment_id IN
                (SELECT id FROM epic_comment WHERE epic_id IN
                    (SELECT id FROM epic WHERE project_id = ?1))",
            "DELETE FROM story_comment WHERE story_id IN
                (SELECT id FROM story WHERE project_id = ?1)",
            "DELETE FROM epic_comment WHERE epic_id IN
                (SELECT id FROM epic WHERE project_id = ?1)",
            "DELETE FROM task WHERE story_id IN (SELECT id FROM story WHERE project_id = ?1)",
            "DELETE FROM blocker WHERE story_id IN (SELECT id FROM story WHERE project_id = ?1)",
            "DELETE FROM story_has_label WHERE story_id IN
                (SELECT id FROM story WHERE project_id = ?1)",
            "DELETE FROM story_has_owner WHERE story_id IN
                (SELECT id FROM story WHERE project_id = ?1)",
            "DELETE FROM story_has_follower WHERE story_id IN
                (SELECT id FROM story WHERE project_id = ?1)",
            "DELETE FROM epic_has_follower WHERE epic_id IN
                (SELECT id FROM epic WHERE project_id = ?1)",
            "DELETE FROM story WHERE project_id = ?1",
            "DELETE FROM epic WHERE project_id = ?1",
            "DELETE FROM iteration WHERE project_id = ?1",
            "DELETE FROM label WHERE project_id = ?1",
            "DELETE FROM member_contact WHERE member_id IN
                (SELECT id FROM member WHERE project_id = ?1)",
            "DELETE FROM member WHERE project_id = ?1",
            "DELETE FROM project_has_story_type WHERE project_id = ?1",
            "DELETE FROM project_has_story_state WHERE project_id = ?1",
            "DELETE FROM project WHERE id = ?1",
        ];

        let mut deleted = 0usize;
        for sql in statements {
            deleted += tx.execute(sql, params![pid]).map_err(StoreError::Sqlite)?;
        }
        tx.commit().map_err(StoreError::Sqlite)?;

        Ok(deleted as u64)
    }

    // ── Checkpoints ────────────────────────────────────────────────

    async fn get_checkpoint(&self, kind: &str) -> crate::error::Result<Option<String>> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.query_row(
            "SELECT value FROM checkpoints WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(Into::into)
    }

    async fn set_checkpoint(&self, kind: &str, value: &str) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO checkpoints (kind, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![kind, value, now],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn delete_checkpoint(&self, kind: &str) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute("DELETE FROM checkpoints WHERE kind = ?1", params![kind])
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn clear_project_checkpoints(&self, project_code: i64) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute(
            "DELETE FROM checkpoints WHERE kind LIKE ?1",
            params![format!("project:{project_code}:%")],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn clear_checkpoints(&self) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute("DELETE FROM checkpoints", [])
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ── Transactions ──────────────────────────────────────────────

    async fn begin_transaction(&self) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn commit_transaction(&self) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute_batch("COMMIT").map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn rollback_transaction(&self) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");
        conn.execute_batch("ROLLBACK").map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ── Metrics ────────────────────────────────────────────────────

    async fn stats(&self) -> crate::error::Result<StoreStats> {
        let conn = self.conn.lock().expect("trawl store mutex poisoned");

        let mut rows_by_table = Vec::new();
        let mut expired_rows = 0u64;
        for table in schema::ENTITY_TABLES {
            let live: u64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE expired IS NULL"),
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::Sqlite)?;
            let expired: u64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE expired IS NOT NULL"),
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::Sqlite)?;
            rows_by_table.push(((*table).to_string(), live));
            expired_rows += expired;
        }
        for table in schema::LINK_TABLES {
            let count: u64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .map_err(StoreError::Sqlite)?;
            rows_by_table.push(((*table).to_string(), count));
        }

        let db_size_bytes = self
            .db_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len());

        Ok(StoreStats {
            rows_by_table,
            expired_rows,
            db_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_project(code: i64) -> Project {
        Project {
            id: ProjectId(0), // Will be assigned by store
            code,
            account_id: None,
            effort_scale_id: None,
            name: format!("Project {code}"),
            description: None,
            public: Some(false),
            week_start_day: Some("Monday".to_string()),
            time_zone: Some("America/New_York".to_string()),
            start_date: None,
            initial_velocity: Some(10),
            current_velocity: None,
            velocity_averaged_over: Some(3),
            current_iteration_number: None,
            source_created_at: None,
            source_updated_at: None,
            created: Utc::now(),
            expired: None,
        }
    }

    fn make_story(
        code: i64,
        project: ProjectId,
        type_id: StoryTypeId,
        state: StateTypeId,
    ) -> Story {
        Story {
            id: StoryId(0),
            code,
            project_id: project,
            story_type_id: type_id,
            story_state_type_id: state,
            priority_id: None,
            iteration_id: None,
            requested_by_id: None,
            name: format!("Story {code}"),
            description: Some("do the thing".to_string()),
            estimate: Some(2.0),
            icebox: false,
            accepted_at: None,
            source_created_at: None,
            source_updated_at: None,
            created: Utc::now(),
            expired: None,
        }
    }

    async fn seed_project(store: &SqliteStore, code: i64) -> (ProjectId, StoryTypeId, StateTypeId) {
        let project = store.upsert_project(&make_project(code)).await.unwrap();
        let type_id = store.ensure_story_type("feature").await.unwrap();
        let state = store.ensure_state_type("started").await.unwrap();
        (project, type_id, state)
    }

    #[tokio::test]
    async fn upsert_and_get_project() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.upsert_project(&make_project(99)).await.unwrap();
        assert!(id.0 > 0);

        let fetched = store.get_project(99).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.name, "Project 99");
        assert_eq!(fetched.time_zone.as_deref(), Some("America/New_York"));
        assert!(fetched.expired.is_none());
    }

    #[tokio::test]
    async fn upsert_project_updates_on_conflict() {
        let store = SqliteStore::in_memory().unwrap();
        let mut project = make_project(99);
        let id1 = store.upsert_project(&project).await.unwrap();

        project.name = "Renamed".to_string();
        project.current_velocity = Some(12);
        let id2 = store.upsert_project(&project).await.unwrap();

        assert_eq!(id1, id2);
        let fetched = store.get_project(99).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Renamed");
        assert_eq!(fetched.current_velocity, Some(12));
        assert_eq!(store.stats().await.unwrap().table("project"), 1);
    }

    #[tokio::test]
    async fn story_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;

        let story = make_story(501, project, type_id, state);
        let id1 = store.upsert_story(&story).await.unwrap();
        let id2 = store.upsert_story(&story).await.unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.stats().await.unwrap().table("story"), 1);
    }

    #[tokio::test]
    async fn story_with_unknown_project_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let type_id = store.ensure_story_type("bug").await.unwrap();
        let state = store.ensure_state_type("unstarted").await.unwrap();

        let story = make_story(1, ProjectId(999), type_id, state);
        let result = store.upsert_story(&story).await;
        assert!(result.is_err(), "foreign keys should be enforced");
    }

    #[tokio::test]
    async fn lookup_types_deduplicate() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.ensure_story_type("feature").await.unwrap();
        let b = store.ensure_story_type("feature").await.unwrap();
        let c = store.ensure_story_type("bug").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.stats().await.unwrap().table("story_type"), 2);
    }

    #[tokio::test]
    async fn effort_scale_with_values() {
        let store = SqliteStore::in_memory().unwrap();
        let id1 = store
            .ensure_effort_scale("0,1,2,3", false, &[0.0, 1.0, 2.0, 3.0])
            .await
            .unwrap();
        let id2 = store
            .ensure_effort_scale("0,1,2,3", false, &[0.0, 1.0, 2.0, 3.0])
            .await
            .unwrap();
        assert_eq!(id1, id2);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.table("effort_scale"), 1);
        assert_eq!(stats.table("scale_value"), 4);
    }

    #[tokio::test]
    async fn member_skeleton_does_not_erase_details() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, _, _) = seed_project(&store, 1).await;

        let full = Member {
            id: MemberId(0),
            code: Some(7001),
            project_id: project,
            person_code: 42,
            name: Some("Ada".to_string()),
            initials: Some("AL".to_string()),
            username: Some("ada".to_string()),
            role: Some("owner".to_string()),
            created: Utc::now(),
            expired: None,
        };
        let id = store.upsert_member(&full).await.unwrap();

        // A bare reference from a story payload carries only the person code.
        let skeleton = Member {
            code: None,
            name: None,
            initials: None,
            username: None,
            role: None,
            ..full.clone()
        };
        let id2 = store.upsert_member(&skeleton).await.unwrap();

        assert_eq!(id, id2);
        let fetched = store.get_member(project, 42).await.unwrap().unwrap();
        assert_eq!(fetched.name.as_deref(), Some("Ada"));
        assert_eq!(fetched.username.as_deref(), Some("ada"));
        assert_eq!(fetched.code, Some(7001));
    }

    #[tokio::test]
    async fn member_contacts_deduplicate() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, _, _) = seed_project(&store, 1).await;
        let member = Member {
            id: MemberId(0),
            code: None,
            project_id: project,
            person_code: 1,
            name: None,
            initials: None,
            username: None,
            role: None,
            created: Utc::now(),
            expired: None,
        };
        let id = store.upsert_member(&member).await.unwrap();
        store
            .ensure_member_contact(id, "email", "ada@example.com")
            .await
            .unwrap();
        store
            .ensure_member_contact(id, "email", "ada@example.com")
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().table("member_contact"), 1);
    }

    #[tokio::test]
    async fn replace_story_labels_shrinks_the_set() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;
        let story = store
            .upsert_story(&make_story(1, project, type_id, state))
            .await
            .unwrap();

        let mut label = Label {
            id: LabelId(0),
            code: None,
            project_id: project,
            name: "backend".to_string(),
            description: None,
            created: Utc::now(),
            expired: None,
        };
        let backend = store.upsert_label(&label).await.unwrap();
        label.name = "urgent".to_string();
        let urgent = store.upsert_label(&label).await.unwrap();

        store
            .replace_story_labels(story, &[backend, urgent])
            .await
            .unwrap();
        assert_eq!(store.story_label_ids(story).await.unwrap().len(), 2);

        store.replace_story_labels(story, &[backend]).await.unwrap();
        assert_eq!(store.story_label_ids(story).await.unwrap(), vec![backend]);
    }

    #[tokio::test]
    async fn expire_stories_not_seen_upstream() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;
        store
            .upsert_story(&make_story(1, project, type_id, state))
            .await
            .unwrap();
        store
            .upsert_story(&make_story(2, project, type_id, state))
            .await
            .unwrap();

        let expired = store.expire_stories_absent(project, &[1]).await.unwrap();
        assert_eq!(expired, 1);

        let gone = store.get_story(2).await.unwrap().unwrap();
        assert!(gone.expired.is_some());
        assert_eq!(store.story_codes(project).await.unwrap(), vec![1]);
        assert_eq!(store.stats().await.unwrap().expired_rows, 1);
    }

    #[tokio::test]
    async fn reupserting_revives_an_expired_story() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;
        let story = make_story(1, project, type_id, state);
        store.upsert_story(&story).await.unwrap();
        store.expire_stories_absent(project, &[]).await.unwrap();
        assert!(store.get_story(1).await.unwrap().unwrap().expired.is_some());

        store.upsert_story(&story).await.unwrap();
        assert!(store.get_story(1).await.unwrap().unwrap().expired.is_none());
    }

    #[tokio::test]
    async fn purge_removes_project_scope_only() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;
        let (other, _, _) = seed_project(&store, 2).await;

        let story = store
            .upsert_story(&make_story(1, project, type_id, state))
            .await
            .unwrap();
        let label = store
            .upsert_label(&Label {
                id: LabelId(0),
                code: None,
                project_id: project,
                name: "keep-out".to_string(),
                description: None,
                created: Utc::now(),
                expired: None,
            })
            .await
            .unwrap();
        store.replace_story_labels(story, &[label]).await.unwrap();
        store
            .upsert_story(&make_story(2, other, type_id, state))
            .await
            .unwrap();

        let deleted = store.purge_project(1).await.unwrap();
        assert!(deleted >= 3, "expected story, label, link and project rows");

        assert!(store.get_project(1).await.unwrap().is_none());
        assert!(store.get_story(1).await.unwrap().is_none());
        assert!(store.get_story(2).await.unwrap().is_some());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.table("story"), 1);
        assert_eq!(stats.table("label"), 0);
        // Shared lookups survive a purge.
        assert_eq!(stats.table("story_type"), 1);
    }

    #[tokio::test]
    async fn purge_unknown_project_is_a_noop() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.purge_project(12345).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_round_trip_and_scoped_clear() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_checkpoint("project:1:stories_offset", "200")
            .await
            .unwrap();
        store
            .set_checkpoint("project:2:stories_offset", "300")
            .await
            .unwrap();

        assert_eq!(
            store
                .get_checkpoint("project:1:stories_offset")
                .await
                .unwrap()
                .as_deref(),
            Some("200")
        );

        store.clear_project_checkpoints(1).await.unwrap();
        assert!(
            store
                .get_checkpoint("project:1:stories_offset")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store
                .get_checkpoint("project:2:stories_offset")
                .await
                .unwrap()
                .as_deref(),
            Some("300")
        );

        store.clear_checkpoints().await.unwrap();
        assert!(
            store
                .get_checkpoint("project:2:stories_offset")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn rollback_discards_uncommitted_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;

        store.begin_transaction().await.unwrap();
        store
            .upsert_story(&make_story(77, project, type_id, state))
            .await
            .unwrap();
        store.rollback_transaction().await.unwrap();

        assert!(store.get_story(77).await.unwrap().is_none());

        store.begin_transaction().await.unwrap();
        store
            .upsert_story(&make_story(78, project, type_id, state))
            .await
            .unwrap();
        store.commit_transaction().await.unwrap();
        assert!(store.get_story(78).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tasks_come_back_in_position_order() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, type_id, state) = seed_project(&store, 1).await;
        let story = store
            .upsert_story(&make_story(1, project, type_id, state))
            .await
            .unwrap();

        for (code, position) in [(31, 2), (32, 1), (33, 3)] {
            store
                .upsert_task(&Task {
                    id: TaskId(0),
                    code,
                    story_id: story,
                    description: format!("task {code}"),
                    complete: false,
                    position: Some(position),
                    created: Utc::now(),
                    expired: None,
                })
                .await
                .unwrap();
        }

        let tasks = store.tasks_for_story(story).await.unwrap();
        let codes: Vec<i64> = tasks.iter().map(|t| t.code).collect();
        assert_eq!(codes, vec![32, 31, 33]);
    }

    #[tokio::test]
    async fn member_usernames_skips_expired_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let (project, _, _) = seed_project(&store, 1).await;
        for (person, username) in [(1, "ada"), (2, "grace")] {
            store
                .upsert_member(&Member {
                    id: MemberId(0),
                    code: None,
                    project_id: project,
                    person_code: person,
                    name: None,
                    initials: None,
                    username: Some(username.to_string()),
                    role: None,
                    created: Utc::now(),
                    expired: None,
                })
                .await
                .unwrap();
        }
        store.expire_members_absent(project, &[1]).await.unwrap();

        let usernames: Vec<String> = store
            .member_usernames(project)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, u)| u)
            .collect();
        assert_eq!(usernames, vec!["ada".to_string()]);
    }
}
