//! Typed views of raw tracker payloads.
//!
//! Each `parse_*` function decodes one `serde_json::Value` into a source
//! struct and enforces the semantic constraints a row must satisfy before
//! mapping. Failures are [`MapError`]s scoped to that one entity: the
//! caller skips it and keeps going.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::MapError;

fn decode<T: DeserializeOwned>(entity: &'static str, value: &Value) -> Result<T, MapError> {
    serde_json::from_value(value.clone()).map_err(|e| MapError::Decode {
        entity,
        message: e.to_string(),
    })
}

/// Project payload from `/projects` or `/projects/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceProject {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub week_start_day: Option<String>,
    /// Comma-separated estimate values, e.g. `"0,1,2,3"`.
    #[serde(default)]
    pub point_scale: Option<String>,
    #[serde(default)]
    pub point_scale_is_custom: Option<bool>,
    /// Older payloads call this `start_time`.
    #[serde(default, alias = "start_time")]
    pub start_date: Option<String>,
    #[serde(default)]
    pub initial_velocity: Option<i64>,
    #[serde(default)]
    pub current_velocity: Option<i64>,
    #[serde(default)]
    pub velocity_averaged_over: Option<i64>,
    #[serde(default)]
    pub current_iteration_number: Option<i64>,
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub time_zone: Option<SourceTimeZone>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Time zone field: either a bare Olson name or an object carrying one.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceTimeZone {
    Name(String),
    Zone {
        #[serde(default)]
        olson_name: Option<String>,
    },
}

impl SourceTimeZone {
    pub fn olson(&self) -> Option<String> {
        match self {
            Self::Name(name) => Some(name.clone()),
            Self::Zone { olson_name } => olson_name.clone(),
        }
    }
}

/// Workspace payload from `/my/workspaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceWorkspace {
    pub id: i64,
    pub name: String,
}

/// Label payload, standalone or embedded in a story or epic.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceLabel {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Membership payload from `/projects/{id}/memberships`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceMembership {
    #[serde(default)]
    pub id: Option<i64>,
    pub person: SourcePerson,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcePerson {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub initials: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Iteration payload. Each iteration embeds stubs of its scheduled
/// stories, which is the only place story scheduling is reported.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceIteration {
    pub number: i64,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub finish: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub velocity: Option<f64>,
    #[serde(default)]
    pub team_strength: Option<f64>,
    #[serde(default)]
    pub stories: Vec<SourceStoryStub>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SourceStoryStub {
    pub id: i64,
}

/// Epic payload. The epic's label arrives embedded.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEpic {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub label: Option<SourceLabel>,
    #[serde(default)]
    pub follower_ids: Vec<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Story payload from `/projects/{id}/stories`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceStory {
    pub id: i64,
    pub name: String,
    pub story_type: String,
    pub current_state: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub estimate: Option<f64>,
    #[serde(default)]
    pub accepted_at: Option<String>,
    #[serde(default)]
    pub requested_by_id: Option<i64>,
    /// `p1`..`p3` when the project uses story priorities.
    #[serde(default)]
    pub story_priority: Option<String>,
    #[serde(default)]
    pub owner_ids: Vec<i64>,
    #[serde(default)]
    pub follower_ids: Vec<i64>,
    #[serde(default)]
    pub labels: Vec<SourceLabel>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Task payload from `/projects/{p}/stories/{s}/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceTask {
    pub id: i64,
    pub description: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub position: Option<i64>,
}

/// Blocker payload from `/projects/{p}/stories/{s}/blockers`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceBlocker {
    pub id: i64,
    pub description: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub person_id: Option<i64>,
}

/// Comment payload (story or epic scoped), with embedded attachments.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceComment {
    pub id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub person_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub file_attachments: Vec<SourceFileAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceFileAttachment {
    pub id: i64,
    pub filename: String,
    pub download_url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub uploader_id: Option<i64>,
}

// ── Parse entry points ─────────────────────────────────────────────

pub fn parse_project(value: &Value) -> Result<SourceProject, MapError> {
    let project: SourceProject = decode("project", value)?;
    if project.name.is_empty() {
        return Err(MapError::Constraint {
            entity: "project",
            message: format!("project {} has an empty name", project.id),
        });
    }
    Ok(project)
}

pub fn parse_workspace(value: &Value) -> Result<SourceWorkspace, MapError> {
    decode("workspace", value)
}

pub fn parse_label(value: &Value) -> Result<SourceLabel, MapError> {
    let label: SourceLabel = decode("label", value)?;
    if label.name.is_empty() {
        return Err(MapError::Constraint {
            entity: "label",
            message: "label has an empty name".to_string(),
        });
    }
    Ok(label)
}

pub fn parse_membership(value: &Value) -> Result<SourceMembership, MapError> {
    decode("membership", value)
}

pub fn parse_iteration(value: &Value) -> Result<SourceIteration, MapError> {
    decode("iteration", value)
}

pub fn parse_epic(value: &Value) -> Result<SourceEpic, MapError> {
    decode("epic", value)
}

pub fn parse_story(value: &Value) -> Result<SourceStory, MapError> {
    let story: SourceStory = decode("story", value)?;
    if story.name.is_empty() {
        return Err(MapError::Constraint {
            entity: "story",
            message: format!("story {} has an empty name", story.id),
        });
    }
    Ok(story)
}

pub fn parse_task(value: &Value) -> Result<SourceTask, MapError> {
    let task: SourceTask = decode("task", value)?;
    if task.description.is_empty() {
        return Err(MapError::Constraint {
            entity: "task",
            message: format!("task {} has an empty description", task.id),
        });
    }
    Ok(task)
}

pub fn parse_blocker(value: &Value) -> Result<SourceBlocker, MapError> {
    decode("blocker", value)
}

pub fn parse_comment(value: &Value) -> Result<SourceComment, MapError> {
    decode("comment", value)
}

// ── Mentions ───────────────────────────────────────────────────────

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Extract `@username` mention tokens from comment text.
///
/// A mention is an `@` at the start of the text or after a non-word
/// character, followed by word characters. `a@b` is an email address,
/// not a mention. Duplicates collapse, first appearance order is kept.
pub fn mention_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();

    for (pos, _) in text.match_indices('@') {
        let bounded = text[..pos].chars().next_back().is_none_or(|c| !is_word_char(c));
        if !bounded {
            continue;
        }
        let name: String = text[pos + 1..]
            .chars()
            .take_while(|c| is_word_char(*c))
            .collect();
        if !name.is_empty() && !tokens.contains(&name) {
            tokens.push(name);
        }
    }

    tokens
}
