use crate::db::{Database, Document};
use crate::errors::AppResult;
use crate::models::{Lesson, ProgressEntry, PROFILES_COLLECTION};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

pub const LESSON_OPENED_PERCENT: i32 = 25;
pub const LESSON_COMPLETE_PERCENT: i32 = 100;

/// `clamp(max(current ?? 0, new), 0, 100)`
pub fn effective_percent(current: Option<i32>, new: i32) -> u8 {
    // Clamped to 0..=100 first, so the narrowing cast is lossless.
    current.unwrap_or(0).max(new).clamp(0, 100) as u8
}

/// First catalog lesson that is not the one just completed, else the completed lesson itself.
pub fn next_lesson_id(catalog: &[Lesson], completed_lesson_id: &str) -> String {
    catalog
        .iter()
        .find(|lesson| lesson.id != completed_lesson_id)
        .map(|lesson| lesson.id.clone())
        .unwrap_or_else(|| completed_lesson_id.to_string())
}

#[derive(Debug, Clone)]
pub struct ProgressWrite {
    pub lesson_id: String,
    pub entry: ProgressEntry,
    pub document: Document,
}

#[derive(Debug, Clone)]
pub struct CompletionWrite {
    pub progress: ProgressWrite,
    pub next_lesson_id: String,
    pub document: Document,
}

#[derive(Clone)]
pub struct ProgressReconciler {
    db: Arc<Database>,
}

impl ProgressReconciler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persists a non-decreasing percent for `lesson_id` and marks it as the current lesson.
    /// Returns `None` without writing when either id is empty.
    pub fn record_progress(
        &self,
        uid: &str,
        lesson_id: &str,
        new_percent: i32,
        current_percent: Option<i32>,
    ) -> AppResult<Option<ProgressWrite>> {
        if uid.trim().is_empty() || lesson_id.trim().is_empty() {
            return Ok(None);
        }

        // Read, merge and write share one transaction so a concurrent completion is never undone.
        let (document, entry) = self.db.merge_with(PROFILES_COLLECTION, uid, |existing| {
            let stored = existing.and_then(|document| stored_percent(document, lesson_id));
            let current = match (current_percent, stored) {
                (Some(given), Some(stored)) => Some(given.max(i32::from(stored))),
                (given, stored) => given.or(stored.map(i32::from)),
            };
            let now = Utc::now();
            let entry = ProgressEntry {
                percent: effective_percent(current, new_percent),
                updated_at: Some(now),
            };
            let patch = json!({
                "progress": { lesson_id: entry },
                "currentLessonId": lesson_id,
                "updatedAt": now,
            });
            Ok((patch, entry))
        })?;
        tracing::debug!(uid, lesson_id, percent = entry.percent, "recorded lesson progress");

        Ok(Some(ProgressWrite {
            lesson_id: lesson_id.to_string(),
            entry,
            document,
        }))
    }

    pub fn complete_lesson(&self, uid: &str, lesson_id: &str, catalog: &[Lesson]) -> AppResult<Option<CompletionWrite>> {
        let Some(progress) = self.record_progress(
            uid,
            lesson_id,
            LESSON_COMPLETE_PERCENT,
            Some(LESSON_COMPLETE_PERCENT),
        )?
        else {
            return Ok(None);
        };

        let next_lesson_id = next_lesson_id(catalog, lesson_id);
        let document = self.db.set_document(
            PROFILES_COLLECTION,
            uid,
            json!({ "nextLessonId": next_lesson_id }),
            true,
        )?;
        tracing::info!(uid, lesson_id, next_lesson_id = %next_lesson_id, "lesson completed");

        Ok(Some(CompletionWrite {
            progress,
            next_lesson_id,
            document,
        }))
    }
}

/// Percent stored for `lesson_id`, read from the raw body so an unrelated malformed field cannot hide it.
fn stored_percent(document: &Document, lesson_id: &str) -> Option<u8> {
    let percent = document.data.get("progress")?.get(lesson_id)?.get("percent")?.as_f64()?;
    Some(percent.clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::{effective_percent, next_lesson_id, ProgressReconciler};
    use crate::db::Database;
    use crate::models::{Lesson, UserProfile, PROFILES_COLLECTION};
    use std::sync::Arc;

    fn lesson(id: &str) -> Lesson {
        serde_json::from_value(serde_json::json!({ "id": id, "title": id })).expect("lesson")
    }

    fn reconciler() -> (tempfile::TempDir, Arc<Database>, ProgressReconciler) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("remote.sqlite")).expect("db"));
        let reconciler = ProgressReconciler::new(db.clone());
        (dir, db, reconciler)
    }

    fn stored_profile(db: &Database, uid: &str) -> UserProfile {
        db.get_document(PROFILES_COLLECTION, uid)
            .expect("read")
            .expect("profile exists")
            .decode()
            .expect("decode")
    }

    #[test]
    fn effective_percent_is_monotonic_and_clamped() {
        assert_eq!(effective_percent(Some(40), 25), 40);
        assert_eq!(effective_percent(Some(0), 25), 25);
        assert_eq!(effective_percent(None, 25), 25);
        assert_eq!(effective_percent(Some(90), 150), 100);
        assert_eq!(effective_percent(None, -10), 0);

        for current in [0, 10, 55, 100] {
            for new in [-5, 0, 30, 100, 250] {
                let result = effective_percent(Some(current), new);
                assert!(result <= 100);
                assert!(i32::from(result) >= current);
            }
        }
    }

    #[test]
    fn record_progress_sets_current_lesson_and_keeps_higher_stored_value() {
        let (_dir, db, reconciler) = reconciler();
        reconciler
            .record_progress("u1", "trinity-1", 60, None)
            .expect("first")
            .expect("written");
        let write = reconciler
            .record_progress("u1", "trinity-1", 25, Some(0))
            .expect("second")
            .expect("written");
        assert_eq!(write.entry.percent, 60);

        let profile = stored_profile(&db, "u1");
        assert_eq!(profile.percent_for("trinity-1"), Some(60));
        assert_eq!(profile.current_lesson_id.as_deref(), Some("trinity-1"));
    }

    #[test]
    fn empty_ids_do_not_write() {
        let (_dir, db, reconciler) = reconciler();
        assert!(reconciler.record_progress("", "l1", 50, None).expect("noop").is_none());
        assert!(reconciler.record_progress("u1", " ", 50, None).expect("noop").is_none());
        assert_eq!(db.current_revision().expect("revision"), 0);
    }

    #[test]
    fn complete_lesson_stores_full_percent_and_next_lesson() {
        let (_dir, db, reconciler) = reconciler();
        reconciler.record_progress("u1", "b", 40, None).expect("partial");
        let catalog = vec![lesson("a"), lesson("b"), lesson("c")];

        let completion = reconciler
            .complete_lesson("u1", "a", &catalog)
            .expect("complete")
            .expect("written");
        assert_eq!(completion.progress.entry.percent, 100);
        assert_eq!(completion.next_lesson_id, "b");

        let profile = stored_profile(&db, "u1");
        assert_eq!(profile.percent_for("a"), Some(100));
        assert_eq!(profile.percent_for("b"), Some(40));
        assert_eq!(profile.next_lesson_id.as_deref(), Some("b"));
    }

    #[test]
    fn next_lesson_falls_back_to_completed_lesson() {
        assert_eq!(next_lesson_id(&[lesson("only")], "only"), "only");
        assert_eq!(next_lesson_id(&[], "x"), "x");
    }

    #[test]
    fn opening_a_lesson_never_undoes_a_concurrent_completion() {
        let (_dir, db, reconciler) = reconciler();
        for round in 0..100 {
            let lesson_id = format!("lesson-{round}");
            let opener = {
                let reconciler = reconciler.clone();
                let lesson_id = lesson_id.clone();
                std::thread::spawn(move || {
                    reconciler.record_progress("u1", &lesson_id, 25, None).expect("open");
                })
            };
            let completer = {
                let reconciler = reconciler.clone();
                let lesson_id = lesson_id.clone();
                std::thread::spawn(move || {
                    reconciler.complete_lesson("u1", &lesson_id, &[]).expect("complete");
                })
            };
            opener.join().expect("opener thread");
            completer.join().expect("completer thread");

            assert_eq!(stored_profile(&db, "u1").percent_for(&lesson_id), Some(100), "round {round}");
        }
    }

    #[test]
    fn stored_percent_survives_unrelated_bad_fields() {
        let (_dir, db, reconciler) = reconciler();
        db.set_document(
            PROFILES_COLLECTION,
            "u1",
            serde_json::json!({ "streak": "many", "progress": { "l1": { "percent": 70 } } }),
            false,
        )
        .expect("seed");
        let write = reconciler
            .record_progress("u1", "l1", 25, None)
            .expect("record")
            .expect("written");
        assert_eq!(write.entry.percent, 70);
    }
}
