/// Current schema version.
pub const SCHEMA_VERSION: &str = "1";

/// Entity tables carrying the `created`/`expired` lifecycle columns, in
/// dependency order (parents before children).
pub const ENTITY_TABLES: &[&str] = &[
    "account",
    "workspace",
    "effort_scale",
    "scale_value",
    "priority_scale",
    "priority",
    "story_type",
    "story_state_type",
    "project",
    "member",
    "member_contact",
    "label",
    "iteration",
    "epic",
    "story",
    "task",
    "blocker",
    "story_comment",
    "epic_comment",
];

/// Link tables (plain id pairs, replaced wholesale on re-extraction).
pub const LINK_TABLES: &[&str] = &[
    "project_has_story_type",
    "project_has_story_state",
    "story_has_label",
    "story_has_owner",
    "story_has_follower",
    "epic_has_follower",
    "story_comment_has_mention",
    "epic_comment_has_mention",
];

/// Full SQL schema for Trawl's `SQLite` database.
///
/// Every extracted row keeps the source system's identifier in `code`;
/// the surrogate `id` keys are local and never leave this database.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS trawl_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Billing account a project belongs to
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    name TEXT,
    created TEXT NOT NULL,
    expired TEXT
);

-- Workspaces visible to the credential (project groupings)
CREATE TABLE IF NOT EXISTS workspace (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created TEXT NOT NULL,
    expired TEXT
);

-- Estimation scales, shared across projects with identical point sets
CREATE TABLE IF NOT EXISTS effort_scale (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    is_custom INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    expired TEXT
);

CREATE TABLE IF NOT EXISTS scale_value (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    effort_scale_id INTEGER NOT NULL REFERENCES effort_scale(id) ON DELETE CASCADE,
    value REAL NOT NULL,
    position INTEGER NOT NULL,
    created TEXT NOT NULL,
    expired TEXT,
    UNIQUE(effort_scale_id, value)
);

CREATE TABLE IF NOT EXISTS priority_scale (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL,
    expired TEXT
);

CREATE TABLE IF NOT EXISTS priority (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority_scale_id INTEGER NOT NULL REFERENCES priority_scale(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    rank INTEGER NOT NULL,
    created TEXT NOT NULL,
    expired TEXT,
    UNIQUE(priority_scale_id, name)
);

-- Story classification lookups, shared across projects
CREATE TABLE IF NOT EXISTS story_type (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL,
    expired TEXT
);

CREATE TABLE IF NOT EXISTS story_state_type (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL,
    expired TEXT
);

-- The root scope: everything below hangs off a project
CREATE TABLE IF NOT EXISTS project (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    account_id INTEGER REFERENCES account(id),
    effort_scale_id INTEGER REFERENCES effort_scale(id),
    name TEXT NOT NULL,
    description TEXT,
    public INTEGER,
    week_start_day TEXT,
    time_zone TEXT,
    start_date TEXT,
    initial_velocity INTEGER,
    current_velocity INTEGER,
    velocity_averaged_over INTEGER,
    current_iteration_number INTEGER,
    source_created_at TEXT,
    source_updated_at TEXT,
    created TEXT NOT NULL,
    expired TEXT
);

CREATE TABLE IF NOT EXISTS project_has_story_type (
    project_id INTEGER NOT NULL REFERENCES project(id) ON DELETE CASCADE,
    story_type_id INTEGER NOT NULL REFERENCES story_type(id) ON DELETE CASCADE,
    PRIMARY KEY (project_id, story_type_id)
);

CREATE TABLE IF NOT EXISTS project_has_story_state (
    project_id INTEGER NOT NULL REFERENCES project(id) ON DELETE CASCADE,
    story_state_type_id INTEGER NOT NULL REFERENCES story_state_type(id) ON DELETE CASCADE,
    PRIMARY KEY (project_id, story_state_type_id)
);

-- Project membership: one row per person per project. `code` is the
-- source membership id and is unknown for people seen only through
-- story references.
CREATE TABLE IF NOT EXISTS member (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER,
    project_id INTEGER NOT NULL REFERENCES project(id),
    person_code INTEGER NOT NULL,
    name TEXT,
    initials TEXT,
    username TEXT,
    role TEXT,
    created TEXT NOT NULL,
    expired TEXT,
    UNIQUE(project_id, person_code)
);

CREATE TABLE IF NOT EXISTS member_contact (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id INTEGER NOT NULL REFERENCES member(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    created TEXT NOT NULL,
    expired TEXT,
    UNIQUE(member_id, kind, value)
);

CREATE TABLE IF NOT EXISTS label (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER,
    project_id INTEGER NOT NULL REFERENCES project(id),
    name TEXT NOT NULL,
    description TEXT,
    created TEXT NOT NULL,
    expired TEXT,
    UNIQUE(project_id, name)
);

CREATE TABLE IF NOT EXISTS iteration (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES project(id),
    number INTEGER NOT NULL,
    kind TEXT,
    start TEXT,
    finish TEXT,
    length INTEGER,
    velocity REAL,
    team_strength REAL,
    created TEXT NOT NULL,
    expired TEXT,
    UNIQUE(project_id, number)
);

CREATE TABLE IF NOT EXISTS epic (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    project_id INTEGER NOT NULL REFERENCES project(id),
    label_id INTEGER REFERENCES label(id),
    name TEXT NOT NULL,
    description TEXT,
    source_created_at TEXT,
    source_updated_at TEXT,
    created TEXT NOT NULL,
    expired TEXT
);

CREATE TABLE IF NOT EXISTS story (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    project_id INTEGER NOT NULL REFERENCES project(id),
    story_type_id INTEGER NOT NULL REFERENCES story_type(id),
    story_state_type_id INTEGER NOT NULL REFERENCES story_state_type(id),
    priority_id INTEGER REFERENCES priority(id),
    iteration_id INTEGER REFERENCES iteration(id),
    requested_by_id INTEGER REFERENCES member(id),
    name TEXT NOT NULL,
    description TEXT,
    estimate REAL,
    icebox INTEGER NOT NULL DEFAULT 0,
    accepted_at TEXT,
    source_created_at TEXT,
    source_updated_at TEXT,
    created TEXT NOT NULL,
    expired TEXT
);
CREATE INDEX IF NOT EXISTS idx_story_project ON story(project_id);
CREATE INDEX IF NOT EXISTS idx_story_iteration ON story(iteration_id);

CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    story_id INTEGER NOT NULL REFERENCES story(id) ON DELETE CASCADE,
    description TEXT NOT NULL,
    complete INTEGER NOT NULL DEFAULT 0,
    position INTEGER,
    created TEXT NOT NULL,
    expired TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_story ON task(story_id);

CREATE TABLE IF NOT EXISTS blocker (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    story_id INTEGER NOT NULL REFERENCES story(id) ON DELETE CASCADE,
    member_id INTEGER REFERENCES member(id),
    description TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    expired TEXT
);
CREATE INDEX IF NOT EXISTS idx_blocker_story ON blocker(story_id);

CREATE TABLE IF NOT EXISTS story_comment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    story_id INTEGER NOT NULL REFERENCES story(id) ON DELETE CASCADE,
    member_id INTEGER REFERENCES member(id),
    text TEXT,
    source_created_at TEXT,
    source_updated_at TEXT,
    created TEXT NOT NULL,
    expired TEXT
);
CREATE INDEX IF NOT EXISTS idx_story_comment_story ON story_comment(story_id);

CREATE TABLE IF NOT EXISTS epic_comment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code INTEGER NOT NULL UNIQUE,
    epic_id INTEGER NOT NULL REFERENCES epic(id) ON DELETE CASCADE,
    member_id INTEGER REFERENCES member(id),
    text TEXT,
    source_created_at TEXT,
    source_updated_at TEXT,
    created TEXT NOT NULL,
    expired TEXT
);
CREATE INDEX IF NOT EXISTS idx_epic_comment_epic ON epic_comment(epic_id);

-- Link tables, replaced wholesale when the owning entity re-extracts
CREATE TABLE IF NOT EXISTS story_has_label (
    story_id INTEGER NOT NULL REFERENCES story(id) ON DELETE CASCADE,
    label_id INTEGER NOT NULL REFERENCES label(id) ON DELETE CASCADE,
    PRIMARY KEY (story_id, label_id)
);

CREATE TABLE IF NOT EXISTS story_has_owner (
    story_id INTEGER NOT NULL REFERENCES story(id) ON DELETE CASCADE,
    member_id INTEGER NOT NULL REFERENCES member(id) ON DELETE CASCADE,
    PRIMARY KEY (story_id, member_id)
);

CREATE TABLE IF NOT EXISTS story_has_follower (
    story_id INTEGER NOT NULL REFERENCES story(id) ON DELETE CASCADE,
    member_id INTEGER NOT NULL REFERENCES member(id) ON DELETE CASCADE,
    PRIMARY KEY (story_id, member_id)
);

CREATE TABLE IF NOT EXISTS epic_has_follower (
    epic_id INTEGER NOT NULL REFERENCES epic(id) ON DELETE CASCADE,
    member_id INTEGER NOT NULL REFERENCES member(id) ON DELETE CASCADE,
    PRIMARY KEY (epic_id, member_id)
);

CREATE TABLE IF NOT EXISTS story_comment_has_mention (
    story_comment_id INTEGER NOT NULL REFERENCES story_comment(id) ON DELETE CASCADE,
    member_id INTEGER NOT NULL REFERENCES member(id) ON DELETE CASCADE,
    PRIMARY KEY (story_comment_id, member_id)
);

CREATE TABLE IF NOT EXISTS epic_comment_has_mention (
    epic_comment_id INTEGER NOT NULL REFERENCES epic_comment(id) ON DELETE CASCADE,
    member_id INTEGER NOT NULL REFERENCES member(id) ON DELETE CASCADE,
    PRIMARY KEY (epic_comment_id, member_id)
);

-- Resume checkpoints, namespaced 'project:<code>:<key>'
CREATE TABLE IF NOT EXISTS checkpoints (
    kind TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Projected views for common query patterns.
pub const VIEWS_SQL: &str = r"
-- Stories with their lookups resolved to names
CREATE VIEW IF NOT EXISTS story_detail AS
SELECT
    s.id,
    s.code,
    p.code AS project_code,
    s.name,
    st.name AS story_type,
    ss.name AS state,
    i.number AS iteration_number,
    s.estimate,
    s.icebox,
    s.expired
FROM story s
JOIN project p ON p.id = s.project_id
JOIN story_type st ON st.id = s.story_type_id
JOIN story_state_type ss ON ss.id = s.story_state_type_id
LEFT JOIN iteration i ON i.id = s.iteration_id;

-- Labels with how many stories carry them
CREATE VIEW IF NOT EXISTS label_usage AS
SELECT
    l.id,
    l.project_id,
    l.name,
    COUNT(sl.story_id) AS story_count
FROM label l
LEFT JOIN story_has_label sl ON sl.label_id = l.id
GROUP BY l.id;
";

/// `SQLite` PRAGMAs for performance.
pub const PRAGMAS_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA foreign_keys = ON;
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_executes_on_in_memory_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();

        // Execute pragmas (skip WAL for in-memory)
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();

        // Execute schema
        conn.execute_batch(SCHEMA_SQL).unwrap();

        // Execute views
        conn.execute_batch(VIEWS_SQL).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in ENTITY_TABLES.iter().chain(LINK_TABLES) {
            assert!(
                tables.contains(&(*table).to_string()),
                "missing table {table}"
            );
        }
        assert!(tables.contains(&"trawl_meta".to_string()));
        assert!(tables.contains(&"checkpoints".to_string()));
    }

    #[test]
    fn contract_has_twenty_seven_tables() {
        assert_eq!(ENTITY_TABLES.len() + LINK_TABLES.len(), 27);
    }

    #[test]
    fn entity_tables_carry_lifecycle_columns() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();

        for table in ENTITY_TABLES {
            let columns: Vec<String> = conn
                .prepare(&format!("PRAGMA table_info({table})"))
                .unwrap()
                .query_map([], |row| row.get::<_, String>(1))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            assert!(columns.contains(&"created".to_string()), "{table}");
            assert!(columns.contains(&"expired".to_string()), "{table}");
        }
    }

    #[test]
    fn schema_version_is_set() {
        assert_eq!(SCHEMA_VERSION, "1");
    }
}
