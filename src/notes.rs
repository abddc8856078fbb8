use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Note, SaveNotePayload, UpdateNotePayload, NOTES_COLLECTION, NOTE_SOURCE_LESSON};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn clean_tags(tags: Option<Vec<String>>) -> Vec<String> {
    tags.unwrap_or_default()
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Newest first; notes without a timestamp sink to the end.
pub fn sort_newest_first(notes: &mut [Note]) {
    notes.sort_by(|left, right| right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id)));
}

#[derive(Clone)]
pub struct NoteStore {
    db: Arc<Database>,
}

impl NoteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Creates a note owned by `uid`. Blank content is not saved and yields `None`.
    pub fn save_note(&self, uid: &str, payload: SaveNotePayload) -> AppResult<Option<Note>> {
        let content = payload.content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        if uid.trim().is_empty() {
            return Err(AppError::Auth("Sign in to save notes.".to_string()));
        }

        let source = payload
            .source
            .map(|source| source.trim().to_string())
            .filter(|source| !source.is_empty())
            .unwrap_or_else(|| NOTE_SOURCE_LESSON.to_string());
        let document = self.db.add_document(
            NOTES_COLLECTION,
            json!({
                "uid": uid,
                "content": content,
                "tags": clean_tags(payload.tags),
                "source": source,
                "createdAt": Utc::now(),
            }),
        )?;
        tracing::info!(uid, note_id = %document.id, source = %source, "note saved");
        document.decode().map(Some)
    }

    pub fn update_note(&self, uid: &str, payload: UpdateNotePayload) -> AppResult<Note> {
        self.owned_note(uid, &payload.note_id)?;

        let mut fields = Map::new();
        if let Some(content) = payload.content {
            let content = content.trim();
            if content.is_empty() {
                return Err(AppError::Validation("Note content cannot be empty.".to_string()));
            }
            fields.insert("content".to_string(), Value::String(content.to_string()));
        }
        if payload.tags.is_some() {
            fields.insert("tags".to_string(), json!(clean_tags(payload.tags)));
        }
        fields.insert("updatedAt".to_string(), json!(Utc::now()));

        let document = self
            .db
            .update_document(NOTES_COLLECTION, &payload.note_id, Value::Object(fields))?;
        tracing::debug!(uid, note_id = %payload.note_id, "note updated");
        document.decode()
    }

    pub fn delete_note(&self, uid: &str, note_id: &str) -> AppResult<()> {
        self.owned_note(uid, note_id)?;
        self.db.delete_document(NOTES_COLLECTION, note_id)?;
        tracing::info!(uid, note_id, "note deleted");
        Ok(())
    }

    pub fn list_notes(&self, uid: &str) -> AppResult<Vec<Note>> {
        let mut notes = self
            .db
            .query_documents(NOTES_COLLECTION, "uid", &json!(uid))?
            .iter()
            .map(|document| document.decode::<Note>())
            .collect::<AppResult<Vec<_>>>()?;
        sort_newest_first(&mut notes);
        Ok(notes)
    }

    fn owned_note(&self, uid: &str, note_id: &str) -> AppResult<Note> {
        let note = self
            .db
            .get_document(NOTES_COLLECTION, note_id)?
            .ok_or_else(|| AppError::NotFound("Note not found.".to_string()))?
            .decode::<Note>()?;
        if note.uid != uid {
            return Err(AppError::Auth("You can only change your own notes.".to_string()));
        }
        Ok(note)
    }
}
