use crate::db::Document;
use crate::errors::{AppError, AppResult};
use crate::models::{
    DashboardSummary, Lesson, LessonDetailView, LessonListItem, SectionType, StudyStats, UserProfile,
    DEFAULT_DEFENSE_OF_THE_DAY,
};
use once_cell::sync::Lazy;
use serde_json::{json, Value};

pub const ALL_CATEGORIES: &str = "All";
pub const LESSON_CATEGORIES: [&str; 6] = [
    ALL_CATEGORIES,
    "Law & Grace",
    "Trinity",
    "Israel & the Church",
    "Salvation",
    "Scripture & Authority",
];

const LESSON_NOT_FOUND: &str = "Lesson not found. Please choose another lesson.";
const CLAIM_FALLBACK: &str = "Detailed claim content coming soon.";
const COUNTER_FALLBACK: &str = "No objection recorded for this lesson yet.";
const SCRIPTURE_FALLBACK: &str = "Add scriptural commentary for this lesson.";

/// Progress at which the dashboard starts suggesting the next lesson.
const SUGGEST_NEXT_PERCENT: u8 = 90;

static LESSON_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["id", "title"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "title": { "type": "string", "minLength": 1 },
            "summary": { "type": "string" },
            "category": { "type": "string" },
            "difficulty": { "type": ["string", "integer"] },
            "duration": { "type": "string" },
            "estimatedMinutes": { "type": "integer", "minimum": 0 },
            "sections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type", "content"],
                    "properties": {
                        "type": { "enum": ["claim", "counter", "scripture"] },
                        "content": { "type": "string" },
                        "order": { "type": "integer" }
                    }
                }
            },
            "theologianInsights": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "quote"],
                    "properties": {
                        "name": { "type": "string" },
                        "quote": { "type": "string" }
                    }
                }
            }
        }
    })
});

static LESSON_VALIDATOR: Lazy<Result<jsonschema::JSONSchema, String>> = Lazy::new(|| {
    jsonschema::JSONSchema::compile(&LESSON_SCHEMA)
        .map_err(|error| format!("Failed to compile lesson schema: {}", error))
});

/// Checks a lesson body against the lesson schema, returning every violation found.
pub fn validate_lesson(value: &Value) -> Result<(), Vec<String>> {
    let compiled = LESSON_VALIDATOR.as_ref().map_err(|error| vec![error.clone()])?;

    let errors: Vec<String> = compiled
        .validate(value)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Builds the catalog from lesson documents, skipping the ones that fail validation.
pub fn decode_catalog(documents: &[Document]) -> Vec<Lesson> {
    documents
        .iter()
        .filter_map(|document| {
            let mut body = document.data.clone();
            if let Value::Object(map) = &mut body {
                map.insert("id".to_string(), Value::String(document.id.clone()));
            }
            if let Err(errors) = validate_lesson(&body) {
                tracing::warn!(lesson_id = %document.id, errors = ?errors, "skipping invalid lesson");
                return None;
            }
            match serde_json::from_value::<Lesson>(body) {
                Ok(lesson) => Some(lesson),
                Err(error) => {
                    tracing::warn!(lesson_id = %document.id, error = %error, "skipping undecodable lesson");
                    None
                }
            }
        })
        .collect()
}

pub fn find_lesson<'a>(catalog: &'a [Lesson], lesson_id: &str) -> AppResult<&'a Lesson> {
    catalog
        .iter()
        .find(|lesson| lesson.id == lesson_id)
        .ok_or_else(|| AppError::NotFound(LESSON_NOT_FOUND.to_string()))
}

fn percent_of(profile: Option<&UserProfile>, lesson_id: &str) -> u8 {
    profile.and_then(|profile| profile.percent_for(lesson_id)).unwrap_or(0)
}

pub fn lesson_detail(lesson: &Lesson, profile: Option<&UserProfile>) -> LessonDetailView {
    let mut sections = lesson.sections.clone();
    sections.sort_by_key(|section| section.order);
    let first_of = |kind: SectionType, fallback: &str| {
        sections
            .iter()
            .find(|section| section.section_type == kind)
            .map(|section| section.content.clone())
            .unwrap_or_else(|| fallback.to_string())
    };
    let claim = first_of(SectionType::Claim, CLAIM_FALLBACK);
    let counter = first_of(SectionType::Counter, COUNTER_FALLBACK);
    let scripture = first_of(SectionType::Scripture, SCRIPTURE_FALLBACK);

    LessonDetailView {
        id: lesson.id.clone(),
        title: lesson.title.clone(),
        category: lesson.category.clone().unwrap_or_else(|| "Doctrine".to_string()),
        claim,
        counter,
        scripture,
        sections,
        theologian_insights: lesson.theologian_insights.clone(),
        progress_percent: percent_of(profile, &lesson.id),
    }
}

pub fn list_item(lesson: &Lesson, profile: Option<&UserProfile>) -> LessonListItem {
    LessonListItem {
        id: lesson.id.clone(),
        title: lesson.title.clone(),
        summary: lesson.summary.clone(),
        category: lesson.category.clone().unwrap_or_else(|| "General".to_string()),
        difficulty: lesson
            .difficulty
            .as_ref()
            .map(|difficulty| difficulty.label())
            .unwrap_or_else(|| "All Levels".to_string()),
        duration: lesson.duration_label(),
        progress_percent: percent_of(profile, &lesson.id),
    }
}

/// Category `All` keeps every lesson; search is case-insensitive over title and summary.
pub fn filter_lessons<'a>(catalog: &'a [Lesson], category: &str, search: &str) -> Vec<&'a Lesson> {
    let needle = search.trim().to_lowercase();
    catalog
        .iter()
        .filter(|lesson| category == ALL_CATEGORIES || lesson.category.as_deref() == Some(category))
        .filter(|lesson| {
            needle.is_empty()
                || lesson.title.to_lowercase().contains(&needle)
                || lesson
                    .summary
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase()
                    .contains(&needle)
        })
        .collect()
}

pub fn dashboard_summary(
    catalog: &[Lesson],
    profile: Option<&UserProfile>,
    user_name: &str,
    lessons_loading: bool,
) -> DashboardSummary {
    let current = profile
        .and_then(|profile| profile.current_lesson_id.as_deref())
        .and_then(|id| catalog.iter().find(|lesson| lesson.id == id))
        .or_else(|| catalog.first());
    let next = profile
        .and_then(|profile| profile.next_lesson_id.as_deref())
        .and_then(|id| catalog.iter().find(|lesson| lesson.id == id))
        .or_else(|| {
            catalog
                .iter()
                .find(|lesson| Some(lesson.id.as_str()) != current.map(|current| current.id.as_str()))
        });
    let current_progress = current.map(|lesson| percent_of(profile, &lesson.id)).unwrap_or(0);

    DashboardSummary {
        user_name: user_name.to_string(),
        streak: profile.map(|profile| profile.streak).unwrap_or(0),
        defense_of_the_day: profile
            .and_then(|profile| profile.defense_of_the_day.clone())
            .unwrap_or_else(|| DEFAULT_DEFENSE_OF_THE_DAY.to_string()),
        current_lesson: current.map(|lesson| list_item(lesson, profile)),
        next_lesson: next.map(|lesson| list_item(lesson, profile)),
        current_progress,
        suggest_next_lesson: next.is_some() && current_progress >= SUGGEST_NEXT_PERCENT,
        lessons_loading,
    }
}

pub fn study_stats(catalog: &[Lesson], profile: Option<&UserProfile>, notes_saved: usize) -> StudyStats {
    let progress_count = profile.map(|profile| profile.progress.len()).unwrap_or(0);
    let lessons_completed = profile
        .map(|profile| profile.progress.values().filter(|entry| entry.percent >= 100).count())
        .unwrap_or(0);
    let tracked_lessons = [catalog.len(), progress_count]
        .into_iter()
        .find(|count| *count > 0)
        .unwrap_or(1);

    StudyStats {
        lessons_completed,
        tracked_lessons,
        notes_saved,
        streak: profile.map(|profile| profile.streak).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        dashboard_summary, decode_catalog, filter_lessons, find_lesson, lesson_detail, study_stats, validate_lesson,
        LESSON_VALIDATOR,
    };
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{Lesson, UserProfile};
    use serde_json::json;

    fn lesson(value: serde_json::Value) -> Lesson {
        serde_json::from_value(value).expect("lesson")
    }

    fn catalog() -> Vec<Lesson> {
        vec![
            lesson(json!({ "id": "law-and-grace-1", "title": "Law and Grace", "category": "Law & Grace",
                "summary": "Did Jesus abolish the law?" })),
            lesson(json!({ "id": "trinity-1", "title": "The Trinity", "category": "Trinity", "difficulty": 3 })),
            lesson(json!({ "id": "salvation-1", "title": "Saved by faith", "category": "Salvation" })),
        ]
    }

    fn profile(value: serde_json::Value) -> UserProfile {
        serde_json::from_value(value).expect("profile")
    }

    #[test]
    fn invalid_lessons_are_skipped_from_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("remote.sqlite")).expect("db");
        db.set_document("lessons", "good", json!({ "title": "Good", "sections": [
            { "type": "claim", "content": "c", "order": 1 }
        ] }), false)
        .expect("good");
        db.set_document("lessons", "bad", json!({ "title": "Bad", "sections": [
            { "type": "rebuttal", "content": "x" }
        ] }), false)
        .expect("bad");
        db.set_document("lessons", "untitled", json!({ "summary": "no title" }), false)
            .expect("untitled");

        let lessons = decode_catalog(&db.list_documents("lessons").expect("list"));
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].id, "good");
        assert!(validate_lesson(&json!({ "id": "x" })).is_err());
    }

    #[test]
    fn schema_is_compiled_once_and_reports_paths() {
        assert!(LESSON_VALIDATOR.is_ok());
        let errors = validate_lesson(&json!({ "id": "x", "title": "T", "estimatedMinutes": -1 })).expect_err("invalid");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("/estimatedMinutes"));
        assert!(validate_lesson(&json!({ "id": "x", "title": "T" })).is_ok());
    }

    #[test]
    fn detail_sorts_sections_and_falls_back() {
        let lesson = lesson(json!({
            "id": "law-and-grace-1",
            "title": "Law and Grace",
            "sections": [
                { "type": "claim", "content": "second claim", "order": 2 },
                { "type": "claim", "content": "first claim", "order": 1 },
                { "type": "scripture", "content": "Matthew 5:17", "order": 3 }
            ]
        }));
        let progress = profile(json!({ "progress": { "law-and-grace-1": { "percent": 25 } } }));

        let view = lesson_detail(&lesson, Some(&progress));
        assert_eq!(view.claim, "first claim");
        assert_eq!(view.counter, "No objection recorded for this lesson yet.");
        assert_eq!(view.scripture, "Matthew 5:17");
        assert_eq!(view.category, "Doctrine");
        assert_eq!(view.sections[0].order, 1);
        assert_eq!(view.progress_percent, 25);
    }

    #[test]
    fn missing_lesson_is_not_found() {
        let lessons = catalog();
        match find_lesson(&lessons, "nope") {
            Err(AppError::NotFound(message)) => {
                assert_eq!(message, "Lesson not found. Please choose another lesson.")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn filters_by_category_and_search() {
        let lessons = catalog();
        assert_eq!(filter_lessons(&lessons, "All", "").len(), 3);
        assert_eq!(filter_lessons(&lessons, "Trinity", "").len(), 1);
        let by_summary = filter_lessons(&lessons, "All", "ABOLISH");
        assert_eq!(by_summary.len(), 1);
        assert_eq!(by_summary[0].id, "law-and-grace-1");
        assert!(filter_lessons(&lessons, "Salvation", "trinity").is_empty());
    }

    #[test]
    fn dashboard_resolves_current_and_next_lessons() {
        let lessons = catalog();
        let empty = dashboard_summary(&lessons, None, "Student", false);
        assert_eq!(empty.current_lesson.as_ref().map(|item| item.id.as_str()), Some("law-and-grace-1"));
        assert_eq!(empty.next_lesson.as_ref().map(|item| item.id.as_str()), Some("trinity-1"));
        assert!(!empty.suggest_next_lesson);
        assert_eq!(empty.defense_of_the_day, "Grace fulfills the Law, it does not erase it.");

        let progress = profile(json!({
            "currentLessonId": "trinity-1",
            "nextLessonId": "salvation-1",
            "streak": 4,
            "progress": { "trinity-1": { "percent": 95 } }
        }));
        let summary = dashboard_summary(&lessons, Some(&progress), "Ada", false);
        assert_eq!(summary.current_progress, 95);
        assert_eq!(summary.next_lesson.as_ref().map(|item| item.id.as_str()), Some("salvation-1"));
        assert!(summary.suggest_next_lesson);
        assert_eq!(summary.streak, 4);
    }

    #[test]
    fn stats_count_completed_and_tracked_lessons() {
        let progress = profile(json!({ "progress": {
            "a": { "percent": 100 }, "b": { "percent": 60 }
        } }));
        let stats = study_stats(&catalog(), Some(&progress), 2);
        assert_eq!(stats.lessons_completed, 1);
        assert_eq!(stats.tracked_lessons, 3);
        assert_eq!(stats.notes_saved, 2);

        assert_eq!(study_stats(&[], Some(&progress), 0).tracked_lessons, 2);
        assert_eq!(study_stats(&[], None, 0).tracked_lessons, 1);
    }
}
