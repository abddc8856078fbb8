use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// Broadcast after every committed write.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: String,
    pub revision: i64,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub data: Value,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Decodes the document body, exposing the document id as an `id` field when the body lacks one.
    pub fn decode<T: DeserializeOwned>(&self) -> AppResult<T> {
        let mut data = self.data.clone();
        if let Value::Object(map) = &mut data {
            map.entry("id").or_insert_with(|| Value::String(self.id.clone()));
        }
        serde_json::from_value(data).map_err(AppError::from)
    }
}

/// What a listener watches.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Document { collection: String, id: String },
    Collection { collection: String },
    Query { collection: String, field: String, value: Value },
}

impl Target {
    pub fn document(collection: &str, id: &str) -> Self {
        Self::Document {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn collection(collection: &str) -> Self {
        Self::Collection {
            collection: collection.to_string(),
        }
    }

    pub fn query(collection: &str, field: &str, value: Value) -> Self {
        Self::Query {
            collection: collection.to_string(),
            field: field.to_string(),
            value,
        }
    }

    fn collection_name(&self) -> &str {
        match self {
            Self::Document { collection, .. }
            | Self::Collection { collection }
            | Self::Query { collection, .. } => collection,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.collection != self.collection_name() {
            return false;
        }
        match self {
            Self::Document { id, .. } => &event.id == id,
            Self::Collection { .. } | Self::Query { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetData {
    Document(Option<Document>),
    Documents(Vec<Document>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    pub revision: i64,
    pub data: TargetData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub anonymous: bool,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed document store with a change feed.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::with_feed_capacity(path, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(path: &Path, capacity: usize) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        let (changes, _) = broadcast::channel(capacity.max(1));

        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub fn current_revision(&self) -> AppResult<i64> {
        let conn = self.lock()?;
        read_revision(&conn)
    }

    pub fn get_document(&self, collection: &str, id: &str) -> AppResult<Option<Document>> {
        let conn = self.lock()?;
        load_document(&conn, collection, id)
    }

    pub fn list_documents(&self, collection: &str) -> AppResult<Vec<Document>> {
        let conn = self.lock()?;
        load_collection(&conn, collection)
    }

    /// Documents of `collection` whose `field` (dotted paths allowed) equals `value`.
    pub fn query_documents(&self, collection: &str, field: &str, value: &Value) -> AppResult<Vec<Document>> {
        let conn = self.lock()?;
        let documents = load_collection(&conn, collection)?;
        Ok(filter_by_field(documents, field, value))
    }

    /// Writes a whole document. With `merge`, nested objects are merged into the existing body.
    pub fn set_document(&self, collection: &str, id: &str, data: Value, merge: bool) -> AppResult<Document> {
        ensure_object(&data)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing = load_document(&tx, collection, id)?;
        let (body, created_at) = match existing {
            Some(mut current) if merge => {
                merge_json(&mut current.data, data);
                (current.data, Some(current.created_at))
            }
            Some(current) => (data, Some(current.created_at)),
            None => (data, None),
        };
        let document = write_document(&tx, collection, id, body, created_at)?;
        tx.commit()?;
        drop(conn);

        self.publish(&document, ChangeKind::Upsert);
        Ok(document)
    }

    /// Merges a patch computed from the current body into the document, under one lock and
    /// transaction. `build` sees the stored document (if any) and returns the patch plus a value
    /// handed back to the caller.
    pub fn merge_with<R, F>(&self, collection: &str, id: &str, build: F) -> AppResult<(Document, R)>
    where
        F: FnOnce(Option<&Document>) -> AppResult<(Value, R)>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing = load_document(&tx, collection, id)?;
        let (patch, output) = build(existing.as_ref())?;
        ensure_object(&patch)?;
        let (body, created_at) = match existing {
            Some(mut current) => {
                merge_json(&mut current.data, patch);
                (current.data, Some(current.created_at))
            }
            None => (patch, None),
        };
        let document = write_document(&tx, collection, id, body, created_at)?;
        tx.commit()?;
        drop(conn);

        self.publish(&document, ChangeKind::Upsert);
        Ok((document, output))
    }

    /// Applies field updates to an existing document. Keys are dotted field paths.
    pub fn update_document(&self, collection: &str, id: &str, fields: Value) -> AppResult<Document> {
        let Value::Object(fields) = fields else {
            return Err(AppError::Validation("document update must be a JSON object".to_string()));
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let Some(mut current) = load_document(&tx, collection, id)? else {
            return Err(AppError::NotFound(format!("No document {}/{}", collection, id)));
        };
        for (path, value) in fields {
            set_path(&mut current.data, &path, value);
        }
        let document = write_document(&tx, collection, id, current.data, Some(current.created_at))?;
        tx.commit()?;
        drop(conn);

        self.publish(&document, ChangeKind::Upsert);
        Ok(document)
    }

    pub fn add_document(&self, collection: &str, data: Value) -> AppResult<Document> {
        ensure_object(&data)?;
        let id = Uuid::new_v4().to_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let document = write_document(&tx, collection, &id, data, None)?;
        tx.commit()?;
        drop(conn);

        self.publish(&document, ChangeKind::Upsert);
        Ok(document)
    }

    pub fn delete_document(&self, collection: &str, id: &str) -> AppResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        let revision = bump_revision(&tx)?;
        tx.commit()?;
        drop(conn);

        let _ = self.changes.send(ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
            revision,
            kind: ChangeKind::Delete,
        });
        Ok(true)
    }

    /// Reads everything a target covers together with the store revision, under one lock.
    pub fn read_target(&self, target: &Target) -> AppResult<TargetSnapshot> {
        let conn = self.lock()?;
        let revision = read_revision(&conn)?;
        let data = match target {
            Target::Document { collection, id } => TargetData::Document(load_document(&conn, collection, id)?),
            Target::Collection { collection } => TargetData::Documents(load_collection(&conn, collection)?),
            Target::Query {
                collection,
                field,
                value,
            } => TargetData::Documents(filter_by_field(load_collection(&conn, collection)?, field, value)),
        };
        Ok(TargetSnapshot { revision, data })
    }

    pub fn insert_account(
        &self,
        email: Option<&str>,
        display_name: Option<&str>,
        password_hash: Option<&str>,
        anonymous: bool,
    ) -> AppResult<AccountRecord> {
        let uid = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO accounts (uid, email, display_name, password_hash, anonymous, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![uid, email, display_name, password_hash, anonymous, now.to_rfc3339()],
        )?;

        Ok(AccountRecord {
            uid,
            email: email.map(ToString::to_string),
            display_name: display_name.map(ToString::to_string),
            password_hash: password_hash.map(ToString::to_string),
            anonymous,
            created_at: now,
        })
    }

    pub fn get_account(&self, uid: &str) -> AppResult<Option<AccountRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT uid, email, display_name, password_hash, anonymous, created_at FROM accounts WHERE uid = ?1",
            [uid],
            parse_account_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn find_account_by_email(&self, email: &str) -> AppResult<Option<AccountRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT uid, email, display_name, password_hash, anonymous, created_at
             FROM accounts WHERE email = ?1 COLLATE NOCASE",
            [email],
            parse_account_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn publish(&self, document: &Document, kind: ChangeKind) {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.changes.send(ChangeEvent {
            collection: document.collection.clone(),
            id: document.id.clone(),
            revision: document.revision,
            kind,
        });
    }
}

fn write_document(
    tx: &Transaction<'_>,
    collection: &str,
    id: &str,
    data: Value,
    created_at: Option<DateTime<Utc>>,
) -> AppResult<Document> {
    let revision = bump_revision(tx)?;
    let now = Utc::now();
    let created_at = created_at.unwrap_or(now);
    tx.execute(
        "INSERT INTO documents (collection, id, data_json, revision, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(collection, id) DO UPDATE SET
           data_json = excluded.data_json,
           revision = excluded.revision,
           updated_at = excluded.updated_at",
        params![
            collection,
            id,
            serde_json::to_string(&data)?,
            revision,
            created_at.to_rfc3339(),
            now.to_rfc3339()
        ],
    )?;

    Ok(Document {
        collection: collection.to_string(),
        id: id.to_string(),
        data,
        revision,
        created_at,
        updated_at: now,
    })
}

fn bump_revision(conn: &Connection) -> AppResult<i64> {
    conn.execute("UPDATE store_meta SET value = value + 1 WHERE key = 'revision'", [])?;
    read_revision(conn)
}

fn read_revision(conn: &Connection) -> AppResult<i64> {
    conn.query_row("SELECT value FROM store_meta WHERE key = 'revision'", [], |row| row.get(0))
        .map_err(AppError::from)
}

fn load_document(conn: &Connection, collection: &str, id: &str) -> AppResult<Option<Document>> {
    conn.query_row(
        "SELECT collection, id, data_json, revision, created_at, updated_at
         FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, id],
        parse_document_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn load_collection(conn: &Connection, collection: &str) -> AppResult<Vec<Document>> {
    let mut statement = conn.prepare(
        "SELECT collection, id, data_json, revision, created_at, updated_at
         FROM documents WHERE collection = ?1 ORDER BY id ASC",
    )?;
    let rows = statement.query_map([collection], parse_document_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn filter_by_field(documents: Vec<Document>, field: &str, value: &Value) -> Vec<Document> {
    documents
        .into_iter()
        .filter(|document| lookup_path(&document.data, field) == Some(value))
        .collect()
}

fn ensure_object(data: &Value) -> AppResult<()> {
    if data.is_object() {
        Ok(())
    } else {
        Err(AppError::Validation("document body must be a JSON object".to_string()))
    }
}

fn parse_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let raw: String = row.get(2)?;
    let data = serde_json::from_str(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(error))
    })?;
    Ok(Document {
        collection: row.get(0)?,
        id: row.get(1)?,
        data,
        revision: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
    Ok(AccountRecord {
        uid: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        password_hash: row.get(3)?,
        anonymous: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

pub(crate) fn merge_json(target: &mut Value, update: Value) {
    match (target, update) {
        (Value::Object(target_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut cursor = target;
    for segment in path.split('.') {
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        cursor = &mut cursor[segment];
    }
    *cursor = value;
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::{ChangeKind, Database, Target, TargetData};
    use serde_json::json;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("remote.sqlite")).expect("db");
        (dir, db)
    }

    #[test]
    fn merge_set_keeps_untouched_fields() {
        let (_dir, db) = open();
        db.set_document("profiles", "u1", json!({ "name": "Ada", "progress": { "a": { "percent": 10 } } }), false)
            .expect("create");
        let merged = db
            .set_document("profiles", "u1", json!({ "progress": { "b": { "percent": 20 } } }), true)
            .expect("merge");

        assert_eq!(merged.data["name"], "Ada");
        assert_eq!(merged.data["progress"]["a"]["percent"], 10);
        assert_eq!(merged.data["progress"]["b"]["percent"], 20);
    }

    #[test]
    fn merge_with_sees_stored_body_and_can_abort() {
        let (_dir, db) = open();
        let (created, seen) = db
            .merge_with("profiles", "u1", |existing| Ok((json!({ "streak": 1 }), existing.is_some())))
            .expect("create");
        assert!(!seen);
        assert_eq!(created.data["streak"], 1);

        let (merged, previous) = db
            .merge_with("profiles", "u1", |existing| {
                let streak = existing.and_then(|doc| doc.data["streak"].as_i64()).unwrap_or(0);
                Ok((json!({ "streak": streak + 1, "name": "Ada" }), streak))
            })
            .expect("merge");
        assert_eq!(previous, 1);
        assert_eq!(merged.data["streak"], 2);
        assert_eq!(merged.data["name"], "Ada");

        let revision = db.current_revision().expect("revision");
        let aborted = db.merge_with("profiles", "u1", |_| {
            Err::<(serde_json::Value, ()), _>(crate::errors::AppError::Validation("no".to_string()))
        });
        assert!(aborted.is_err());
        assert_eq!(db.current_revision().expect("revision"), revision);
    }

    #[test]
    fn update_expands_dotted_paths_and_requires_existing_document() {
        let (_dir, db) = open();
        let missing = db.update_document("profiles", "nobody", json!({ "theme": "dark" }));
        assert!(missing.is_err());

        db.set_document("profiles", "u1", json!({ "theme": "light" }), false)
            .expect("create");
        let updated = db
            .update_document("profiles", "u1", json!({ "progress.lesson-1.percent": 55, "theme": "dark" }))
            .expect("update");
        assert_eq!(updated.data["progress"]["lesson-1"]["percent"], 55);
        assert_eq!(updated.data["theme"], "dark");
    }

    #[test]
    fn every_write_bumps_the_store_revision() {
        let (_dir, db) = open();
        let first = db.add_document("notes", json!({ "uid": "u1" })).expect("first");
        let second = db.add_document("notes", json!({ "uid": "u2" })).expect("second");
        assert!(second.revision > first.revision);
        assert_eq!(db.current_revision().expect("revision"), second.revision);

        assert!(db.delete_document("notes", &first.id).expect("delete"));
        assert!(db.current_revision().expect("revision") > second.revision);
        assert!(!db.delete_document("notes", &first.id).expect("second delete"));
    }

    #[test]
    fn query_filters_on_field_equality() {
        let (_dir, db) = open();
        db.add_document("notes", json!({ "uid": "u1", "content": "a" })).expect("a");
        db.add_document("notes", json!({ "uid": "u2", "content": "b" })).expect("b");
        db.add_document("notes", json!({ "uid": "u1", "content": "c" })).expect("c");

        let mine = db.query_documents("notes", "uid", &json!("u1")).expect("query");
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|doc| doc.data["uid"] == "u1"));
    }

    #[test]
    fn read_target_reports_missing_documents() {
        let (_dir, db) = open();
        let snapshot = db.read_target(&Target::document("profiles", "ghost")).expect("read");
        assert_eq!(snapshot.data, TargetData::Document(None));
    }

    #[test]
    fn decode_injects_document_id() {
        let (_dir, db) = open();
        let doc = db
            .set_document("lessons", "trinity-1", json!({ "title": "The Trinity" }), false)
            .expect("lesson");
        let decoded: serde_json::Value = doc.decode().expect("decode");
        assert_eq!(decoded["id"], "trinity-1");
    }

    #[tokio::test]
    async fn writes_are_broadcast_to_subscribers() {
        let (_dir, db) = open();
        let mut receiver = db.subscribe_changes();
        let doc = db.set_document("lessons", "l1", json!({ "title": "x" }), false).expect("write");

        let event = receiver.recv().await.expect("event");
        assert_eq!(event.collection, "lessons");
        assert_eq!(event.id, "l1");
        assert_eq!(event.revision, doc.revision);
        assert_eq!(event.kind, ChangeKind::Upsert);
    }

    #[test]
    fn accounts_are_found_by_email_case_insensitively() {
        let (_dir, db) = open();
        let created = db
            .insert_account(Some("ada@example.com"), Some("Ada"), Some("hash"), false)
            .expect("insert");
        let found = db
            .find_account_by_email("ADA@example.com")
            .expect("find")
            .expect("exists");
        assert_eq!(found.uid, created.uid);
        assert_eq!(db.get_account(&created.uid).expect("get").map(|a| a.anonymous), Some(false));
    }
}
