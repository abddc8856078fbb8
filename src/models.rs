use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::route::RouteState;

pub const LESSONS_COLLECTION: &str = "lessons";
pub const PROFILES_COLLECTION: &str = "profiles";
pub const NOTES_COLLECTION: &str = "notes";

pub const DEFAULT_DEFENSE_OF_THE_DAY: &str = "Grace fulfills the Law, it does not erase it.";
pub const NOTE_SOURCE_LESSON: &str = "lesson";
pub const NOTE_SOURCE_ASK_SHIELD: &str = "ask-shield";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    Emerald,
    Crimson,
}

impl Theme {
    pub const ALL: [Theme; 4] = [Theme::Light, Theme::Dark, Theme::Emerald, Theme::Crimson];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
            Self::Emerald => "emerald",
            Self::Crimson => "crimson",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|theme| theme.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

pub type ProgressMap = BTreeMap<String, ProgressEntry>;

/// Remote profile record of a signed-in account, stored at `profiles/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    /// Stamp of the local intent that produced `theme`, in epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboarding_complete: Option<bool>,
    pub streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_lesson_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_lesson_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defense_of_the_day: Option<String>,
    pub progress: ProgressMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn percent_for(&self, lesson_id: &str) -> Option<u8> {
        self.progress.get(lesson_id).map(|entry| entry.percent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LessonDifficulty {
    Named(String),
    Rank(u32),
}

impl LessonDifficulty {
    pub fn label(&self) -> String {
        match self {
            Self::Named(name) => name.clone(),
            Self::Rank(0 | 1) => "Beginner".to_string(),
            Self::Rank(2) => "Intermediate".to_string(),
            Self::Rank(_) => "Advanced".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Claim,
    Counter,
    Scripture,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonSection {
    #[serde(rename = "type")]
    pub section_type: SectionType,
    pub content: String,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TheologianInsight {
    pub name: String,
    pub quote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<LessonDifficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
    #[serde(default)]
    pub sections: Vec<LessonSection>,
    #[serde(default)]
    pub theologian_insights: Vec<TheologianInsight>,
}

impl Lesson {
    pub fn duration_label(&self) -> Option<String> {
        self.duration
            .clone()
            .or_else(|| self.estimated_minutes.map(|minutes| format!("{} min", minutes)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub uid: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Note {
    pub fn display_date(&self) -> String {
        self.date
            .clone()
            .or_else(|| self.created_at.map(|at| at.to_rfc3339()))
            .or_else(|| self.updated_at.map(|at| at.to_rfc3339()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub anonymous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpPayload {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInPayload {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdatePayload {
    pub lesson_id: String,
    pub percent: i32,
    #[serde(default)]
    pub current_percent: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SaveNotePayload {
    pub content: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNotePayload {
    pub note_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteSaveStatus {
    Saving,
    Saved,
    Failed,
}

impl NoteSaveStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Saving => "Saving...",
            Self::Saved => "Saved to notes",
            Self::Failed => "Failed to save",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonDetailView {
    pub id: String,
    pub title: String,
    pub category: String,
    pub claim: String,
    pub counter: String,
    pub scripture: String,
    pub sections: Vec<LessonSection>,
    pub theologian_insights: Vec<TheologianInsight>,
    pub progress_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonListItem {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub category: String,
    pub difficulty: String,
    pub duration: Option<String>,
    pub progress_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub user_name: String,
    pub streak: u32,
    pub defense_of_the_day: String,
    pub current_lesson: Option<LessonListItem>,
    pub next_lesson: Option<LessonListItem>,
    pub current_progress: u8,
    /// The next lesson is suggested once the current one is nearly done.
    pub suggest_next_lesson: bool,
    pub lessons_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyStats {
    pub lessons_completed: usize,
    pub tracked_lessons: usize,
    pub notes_saved: usize,
    pub streak: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSnapshot {
    pub route: RouteState,
    pub title: String,
    pub user: Option<AuthUser>,
    pub user_name: String,
    pub user_email: String,
    pub theme: Theme,
    pub onboarding_complete: bool,
    pub lessons_loading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiEvent {
    pub r#type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub event_id: String,
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::{LessonDifficulty, Note, Theme, UserProfile};

    #[test]
    fn theme_parse_accepts_known_values_only() {
        assert_eq!(Theme::parse("Dark"), Some(Theme::Dark));
        assert_eq!(Theme::parse(" emerald "), Some(Theme::Emerald));
        assert_eq!(Theme::parse("neon"), None);
    }

    #[test]
    fn profile_decodes_sparse_documents() {
        let profile: UserProfile = serde_json::from_value(serde_json::json!({
            "name": "Ada",
            "progress": { "law-and-grace-1": { "percent": 40 } }
        }))
        .expect("decode profile");
        assert_eq!(profile.streak, 0);
        assert_eq!(profile.percent_for("law-and-grace-1"), Some(40));
        assert!(profile.onboarding_complete.is_none());
    }

    #[test]
    fn difficulty_accepts_names_and_ranks() {
        let named: LessonDifficulty = serde_json::from_value(serde_json::json!("Advanced")).expect("named");
        let ranked: LessonDifficulty = serde_json::from_value(serde_json::json!(2)).expect("rank");
        assert_eq!(named.label(), "Advanced");
        assert_eq!(ranked.label(), "Intermediate");
    }

    #[test]
    fn note_display_date_falls_back_to_created_at() {
        let note: Note = serde_json::from_value(serde_json::json!({
            "id": "n1",
            "uid": "u1",
            "content": "grace",
            "createdAt": "2024-03-01T10:00:00Z"
        }))
        .expect("decode note");
        assert!(note.display_date().starts_with("2024-03-01T10:00:00"));
    }
}
