use crate::assistant::{Assistant, ChatMessage, ChatRole, Conversation};
use crate::auth::{resolve_user_email, resolve_user_name, AuthService};
use crate::config::{load_settings, update_settings, AppSettings};
use crate::context_graph::{law_and_grace_graph, ContextGraph};
use crate::db::{Database, Document, Target, TargetData, TargetSnapshot};
use crate::errors::{AppError, AppResult};
use crate::lessons::{dashboard_summary, decode_catalog, filter_lessons, find_lesson, lesson_detail, list_item, study_stats};
use crate::listeners::{decode_document, decode_documents, listen, ListenerRegistry, Mirror, Snapshot};
use crate::local_storage::LocalStorage;
use crate::models::{
    AppSnapshot, AuthUser, DashboardSummary, Lesson, LessonDetailView, LessonListItem, Note, NoteSaveStatus,
    ProgressEntry, ProgressUpdatePayload, SaveNotePayload, SignInPayload, SignUpPayload, StudyStats, Theme,
    UiEvent, UpdateNotePayload, UserProfile, LESSONS_COLLECTION, NOTES_COLLECTION, NOTE_SOURCE_ASK_SHIELD,
    PROFILES_COLLECTION,
};
use crate::notes::{sort_newest_first, NoteStore};
use crate::profile_sync::{OnboardingSync, RemoteOnboarding, RemoteTheme, ThemeSync};
use crate::progress::{ProgressReconciler, LESSON_OPENED_PERCENT};
use crate::route::{NavigateData, Route, RouteState};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Duration;
use uuid::Uuid;

pub const REMOTE_DB_FILE: &str = "remote.sqlite";
pub const DEVICE_DB_FILE: &str = "device.sqlite";

const CATALOG_OWNER: &str = "catalog";
const UI_EVENT_CAPACITY: usize = 512;

fn user_owner(uid: &str) -> String {
    format!("user:{}", uid)
}

pub struct ShieldCore {
    db: Arc<Database>,
    storage: Arc<LocalStorage>,
    settings: RwLock<AppSettings>,
    app_data_dir: PathBuf,
    user: std::sync::RwLock<Option<AuthUser>>,
    route: Mutex<RouteState>,
    conversation: Mutex<Conversation>,
    lessons: Mirror<Vec<Lesson>>,
    profile: Mirror<Option<UserProfile>>,
    notes: Mirror<Vec<Note>>,
    listeners: ListenerRegistry,
    auth: AuthService,
    progress: ProgressReconciler,
    note_store: NoteStore,
    theme: ThemeSync,
    onboarding: OnboardingSync,
    assistant: Arc<dyn Assistant>,
    events: broadcast::Sender<UiEvent>,
    event_seq: AtomicU64,
}

impl ShieldCore {
    pub fn new(app_data_dir: PathBuf, assistant: Arc<dyn Assistant>) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(&app_data_dir)?;
        let storage = Arc::new(LocalStorage::new(&app_data_dir.join(DEVICE_DB_FILE))?);
        let settings = load_settings(&app_data_dir, &storage)?;
        let db = Arc::new(Database::with_feed_capacity(
            &app_data_dir.join(REMOTE_DB_FILE),
            settings.listener_buffer_size,
        )?);
        let theme = ThemeSync::load(db.clone(), storage.clone(), settings.default_theme)?;
        let onboarding = OnboardingSync::load(db.clone(), storage.clone())?;
        let (events, _) = broadcast::channel(UI_EVENT_CAPACITY);

        Ok(Arc::new(Self {
            auth: AuthService::new(db.clone(), storage.clone()),
            progress: ProgressReconciler::new(db.clone()),
            note_store: NoteStore::new(db.clone()),
            db,
            storage,
            settings: RwLock::new(settings),
            app_data_dir,
            user: std::sync::RwLock::new(None),
            route: Mutex::new(RouteState::new()),
            conversation: Mutex::new(Conversation::new()),
            lessons: Mirror::new(),
            profile: Mirror::new(),
            notes: Mirror::new(),
            listeners: ListenerRegistry::new(),
            theme,
            onboarding,
            assistant,
            events,
            event_seq: AtomicU64::new(0),
        }))
    }

    /// Starts the catalog listener and resumes a persisted session.
    pub async fn start(self: &Arc<Self>) -> AppResult<Option<AuthUser>> {
        let weak = Arc::downgrade(self);
        let subscription = listen(
            self.db.clone(),
            "lessons",
            Target::collection(LESSONS_COLLECTION),
            move |snapshot| {
                if let Some(core) = weak.upgrade() {
                    core.on_lessons_snapshot(snapshot);
                }
            },
        );
        self.listeners.attach(CATALOG_OWNER, subscription).await;

        let restored = self.auth.restore_session()?;
        if let Some(user) = restored.clone() {
            tracing::info!(uid = %user.uid, "restoring previous session");
            self.activate_user(user).await?;
        }
        Ok(restored)
    }

    pub async fn shutdown(&self) {
        let closed = self.listeners.close_all().await;
        tracing::info!(listeners = closed, "shield core shut down");
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        match self.user.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn current_uid(&self) -> Option<String> {
        self.current_user().map(|user| user.uid)
    }

    fn is_current_uid(&self, uid: &str) -> bool {
        self.current_uid().as_deref() == Some(uid)
    }

    fn set_user(&self, user: Option<AuthUser>) {
        match self.user.write() {
            Ok(mut guard) => *guard = user,
            Err(poisoned) => *poisoned.into_inner() = user,
        }
    }

    fn require_uid(&self) -> AppResult<String> {
        self.current_uid()
            .ok_or_else(|| AppError::Auth("Sign in to continue.".to_string()))
    }

    fn catalog(&self) -> Vec<Lesson> {
        self.lessons.current().unwrap_or_default()
    }

    fn current_profile(&self) -> Option<UserProfile> {
        self.profile.current().flatten()
    }

    pub async fn snapshot(&self) -> AppResult<AppSnapshot> {
        let route = self.route.lock().await.clone();
        let user = self.current_user();
        let profile = self.current_profile();
        Ok(AppSnapshot {
            title: route.title().to_string(),
            route,
            user_name: resolve_user_name(profile.as_ref(), user.as_ref()),
            user_email: resolve_user_email(profile.as_ref(), user.as_ref()),
            user,
            theme: self.theme.theme()?,
            onboarding_complete: self.onboarding.is_complete(),
            lessons_loading: self.lessons.current().is_none(),
        })
    }

    // Navigation

    pub async fn navigate(&self, route: Route, data: Option<NavigateData>) -> RouteState {
        let state = {
            let mut current = self.route.lock().await;
            current.navigate(route, data);
            current.clone()
        };
        self.emit_route(&state);
        state
    }

    /// Opens the assistant overlay. With a question and an empty transcript the question is asked
    /// right away; the reply arrives as an `assistant.message` event.
    pub async fn open_overlay(self: &Arc<Self>, question: Option<String>) -> RouteState {
        let state = {
            let mut current = self.route.lock().await;
            current.open_overlay(question.clone());
            current.clone()
        };
        self.emit_route(&state);

        let asked = match question {
            Some(question) => {
                let mut conversation = self.conversation.lock().await;
                if conversation.is_empty() {
                    conversation.push_question(&question)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(message) = asked {
            self.emit_event("assistant.message", json!(message));
            let core = self.clone();
            tokio::spawn(async move {
                if let Err(error) = core.reply_to(&message.content).await {
                    tracing::warn!(error = %error, "assistant reply failed");
                }
            });
        }
        state
    }

    pub async fn close_overlay(&self) -> RouteState {
        let state = {
            let mut current = self.route.lock().await;
            current.close_overlay();
            current.clone()
        };
        self.emit_route(&state);
        state
    }

    /// Opens a lesson and records that it was started.
    pub async fn select_lesson(&self, lesson_id: &str) -> RouteState {
        let state = {
            let mut current = self.route.lock().await;
            current.select_lesson(lesson_id);
            current.clone()
        };
        self.emit_route(&state);

        let current_percent = self
            .current_profile()
            .and_then(|profile| profile.percent_for(lesson_id))
            .map(i32::from);
        self.record_progress(ProgressUpdatePayload {
            lesson_id: lesson_id.to_string(),
            percent: LESSON_OPENED_PERCENT,
            current_percent,
        });
        state
    }

    pub async fn clear_lesson(&self) -> RouteState {
        let state = {
            let mut current = self.route.lock().await;
            current.clear_lesson();
            current.clone()
        };
        self.emit_route(&state);
        state
    }

    fn emit_route(&self, state: &RouteState) {
        self.emit_event(
            "route.changed",
            json!({ "route": state, "title": state.title() }),
        );
    }

    // Progress

    /// Failures are logged and reported as `None`.
    pub fn record_progress(&self, payload: ProgressUpdatePayload) -> Option<ProgressEntry> {
        let uid = self.current_uid()?;
        match self
            .progress
            .record_progress(&uid, &payload.lesson_id, payload.percent, payload.current_percent)
        {
            Ok(Some(write)) => {
                self.apply_profile_document(&uid, &write.document);
                self.emit_event(
                    "progress.updated",
                    json!({ "lessonId": write.lesson_id, "percent": write.entry.percent }),
                );
                Some(write.entry)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(uid = %uid, lesson_id = %payload.lesson_id, error = %error, "failed to update progress");
                None
            }
        }
    }

    /// Marks a lesson complete and returns the suggested next lesson id.
    pub fn complete_lesson(&self, lesson_id: &str) -> Option<String> {
        let uid = self.current_uid()?;
        match self.progress.complete_lesson(&uid, lesson_id, &self.catalog()) {
            Ok(Some(completion)) => {
                self.apply_profile_document(&uid, &completion.document);
                self.emit_event(
                    "lesson.completed",
                    json!({
                        "lessonId": lesson_id,
                        "percent": completion.progress.entry.percent,
                        "nextLessonId": completion.next_lesson_id,
                    }),
                );
                Some(completion.next_lesson_id)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(uid = %uid, lesson_id, error = %error, "failed to complete lesson");
                None
            }
        }
    }

    // Theme and onboarding

    pub fn set_theme(&self, theme: Theme) -> AppResult<Theme> {
        let uid = self.current_uid();
        let preference = self.theme.set_theme(uid.as_deref(), theme)?;
        self.emit_event("theme.changed", json!({ "theme": preference.theme }));
        Ok(preference.theme)
    }

    pub fn complete_onboarding(&self) -> AppResult<bool> {
        let uid = self.current_uid();
        if self.onboarding.complete(uid.as_deref())? {
            self.emit_event("onboarding.changed", json!({ "complete": true }));
        }
        Ok(self.onboarding.is_complete())
    }

    // Notes

    pub fn save_note(&self, payload: SaveNotePayload) -> AppResult<Option<Note>> {
        if payload.content.trim().is_empty() {
            return Ok(None);
        }
        self.emit_note_status(NoteSaveStatus::Saving);
        let result = self
            .require_uid()
            .and_then(|uid| self.note_store.save_note(&uid, payload));
        match &result {
            Ok(Some(_)) => self.emit_note_status(NoteSaveStatus::Saved),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(error = %error, "failed to save note");
                self.emit_note_status(NoteSaveStatus::Failed);
            }
        }
        result
    }

    /// Saves a lesson note tagged with the lesson's category.
    pub fn save_lesson_note(&self, lesson_id: &str, content: &str) -> AppResult<Option<Note>> {
        let catalog = self.catalog();
        let category = find_lesson(&catalog, lesson_id)?.category.clone();
        self.save_note(SaveNotePayload {
            content: content.to_string(),
            tags: category.map(|category| vec![category]),
            source: None,
        })
    }

    /// Saves an assistant answer from the transcript, tagged with its related lesson.
    pub async fn save_assistant_note(&self, message_id: &str) -> AppResult<Option<Note>> {
        let message = self
            .conversation
            .lock()
            .await
            .messages()
            .iter()
            .find(|message| message.id == message_id && message.role == ChatRole::Assistant)
            .cloned()
            .ok_or_else(|| AppError::NotFound("Message not found.".to_string()))?;
        self.save_note(SaveNotePayload {
            content: message.content,
            tags: message.related_lesson_id.map(|lesson_id| vec![lesson_id]),
            source: Some(NOTE_SOURCE_ASK_SHIELD.to_string()),
        })
    }

    pub fn update_note(&self, payload: UpdateNotePayload) -> AppResult<Note> {
        let uid = self.require_uid()?;
        self.note_store.update_note(&uid, payload)
    }

    pub fn delete_note(&self, note_id: &str) -> AppResult<()> {
        let uid = self.require_uid()?;
        self.note_store.delete_note(&uid, note_id)
    }

    pub fn notes(&self) -> Vec<Note> {
        self.notes.current().unwrap_or_default()
    }

    fn emit_note_status(&self, status: NoteSaveStatus) {
        self.emit_event(
            "note.status",
            json!({ "status": status, "label": status.label() }),
        );
    }

    // Assistant

    /// Asks the assistant. Blank questions are ignored.
    pub async fn ask_shield(&self, question: &str) -> AppResult<Option<ChatMessage>> {
        let Some(message) = self.conversation.lock().await.push_question(question) else {
            return Ok(None);
        };
        self.emit_event("assistant.message", json!(message));
        self.reply_to(&message.content).await.map(Some)
    }

    async fn reply_to(&self, question: &str) -> AppResult<ChatMessage> {
        self.emit_event("assistant.typing", json!({ "typing": true }));
        let delay = self.settings.read().await.assistant_reply_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let reply = self.assistant.ask(question);
        self.emit_event("assistant.typing", json!({ "typing": false }));
        let message = self.conversation.lock().await.push_reply(reply?);
        self.emit_event("assistant.message", json!(message));
        Ok(message)
    }

    pub async fn conversation(&self) -> Vec<ChatMessage> {
        self.conversation.lock().await.messages().to_vec()
    }

    // Lessons and dashboard

    pub fn lessons(&self, category: &str, search: &str) -> Vec<LessonListItem> {
        let catalog = self.catalog();
        let profile = self.current_profile();
        filter_lessons(&catalog, category, search)
            .into_iter()
            .map(|lesson| list_item(lesson, profile.as_ref()))
            .collect()
    }

    pub fn lesson_detail(&self, lesson_id: &str) -> AppResult<LessonDetailView> {
        let catalog = self.catalog();
        let lesson = find_lesson(&catalog, lesson_id)?;
        Ok(lesson_detail(lesson, self.current_profile().as_ref()))
    }

    pub fn dashboard(&self) -> DashboardSummary {
        let profile = self.current_profile();
        let user = self.current_user();
        dashboard_summary(
            &self.catalog(),
            profile.as_ref(),
            &resolve_user_name(profile.as_ref(), user.as_ref()),
            self.lessons.current().is_none(),
        )
    }

    pub fn study_stats(&self) -> StudyStats {
        study_stats(&self.catalog(), self.current_profile().as_ref(), self.notes().len())
    }

    pub fn context_graph(&self) -> ContextGraph {
        law_and_grace_graph()
    }

    // Settings

    pub async fn settings(&self) -> AppSettings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let mut settings = self.settings.write().await;
        let updated = update_settings(&settings, &self.storage, update)?;
        *settings = updated.clone();
        drop(settings);
        self.emit_event("settings.updated", json!(updated));
        Ok(updated)
    }

    // Auth

    pub async fn sign_up(self: &Arc<Self>, payload: SignUpPayload) -> AppResult<AuthUser> {
        let user = self.auth.sign_up(payload)?;
        self.activate_user(user.clone()).await?;
        Ok(user)
    }

    pub async fn sign_in(self: &Arc<Self>, payload: SignInPayload) -> AppResult<AuthUser> {
        let user = self.auth.sign_in(payload)?;
        self.activate_user(user.clone()).await?;
        Ok(user)
    }

    pub async fn sign_in_guest(self: &Arc<Self>) -> AppResult<AuthUser> {
        let allow_guest = self.settings.read().await.allow_guest;
        let user = self.auth.sign_in_guest(allow_guest)?;
        self.activate_user(user.clone()).await?;
        Ok(user)
    }

    pub async fn sign_out(&self) -> AppResult<()> {
        self.deactivate_user().await;
        self.auth.sign_out()?;
        self.route.lock().await.reset();
        self.conversation.lock().await.clear();
        let state = self.route.lock().await.clone();
        self.emit_route(&state);
        self.emit_event("auth.changed", json!({ "user": null }));
        Ok(())
    }

    async fn activate_user(self: &Arc<Self>, user: AuthUser) -> AppResult<()> {
        if let Some(previous) = self.current_uid() {
            if previous != user.uid {
                self.deactivate_user().await;
            } else {
                return Ok(());
            }
        }

        let default_theme = self.settings.read().await.default_theme;
        let profile = self.auth.ensure_profile(&user, default_theme)?;
        self.set_user(Some(user.clone()));
        self.reconcile_profile(&user.uid, &profile);
        self.attach_user_listeners(&user.uid).await;
        let listeners = self.listeners.active_count(&user_owner(&user.uid)).await;
        tracing::info!(uid = %user.uid, anonymous = user.anonymous, listeners, "user signed in");
        self.emit_event("auth.changed", json!({ "user": user }));
        Ok(())
    }

    async fn deactivate_user(&self) {
        let Some(uid) = self.current_uid() else {
            return;
        };
        // The user goes first: callbacks still in flight re-check it under the mirror lock.
        self.set_user(None);
        self.listeners.close_owner(&user_owner(&uid)).await;
        self.profile.clear();
        self.notes.clear();
        tracing::info!(uid = %uid, "user signed out");
    }

    async fn attach_user_listeners(self: &Arc<Self>, uid: &str) {
        let owner = user_owner(uid);

        let weak = Arc::downgrade(self);
        let profile_uid = uid.to_string();
        let profile = listen(
            self.db.clone(),
            "profile",
            Target::document(PROFILES_COLLECTION, uid),
            move |snapshot| {
                if let Some(core) = weak.upgrade() {
                    core.on_profile_snapshot(&profile_uid, snapshot);
                }
            },
        );
        self.listeners.attach(&owner, profile).await;

        let weak = Arc::downgrade(self);
        let notes_uid = uid.to_string();
        let notes = listen(
            self.db.clone(),
            "notes",
            Target::query(NOTES_COLLECTION, "uid", json!(uid)),
            move |snapshot| {
                if let Some(core) = weak.upgrade() {
                    core.on_notes_snapshot(&notes_uid, snapshot);
                }
            },
        );
        self.listeners.attach(&owner, notes).await;
    }

    // Listener callbacks

    fn on_lessons_snapshot(&self, snapshot: TargetSnapshot) {
        let TargetData::Documents(documents) = &snapshot.data else {
            return;
        };
        let lessons = decode_catalog(documents);
        let count = lessons.len();
        if self.lessons.apply(Snapshot {
            revision: snapshot.revision,
            value: lessons,
        }) {
            self.emit_event("lessons.updated", json!({ "count": count }));
        }
    }

    fn on_profile_snapshot(&self, uid: &str, snapshot: TargetSnapshot) {
        // An undecodable profile is logged by `decode_document`; the last good copy stays.
        let Ok(profile) = decode_document::<UserProfile>(&snapshot) else {
            return;
        };
        let applied = self.profile.apply_if(
            Snapshot {
                revision: snapshot.revision,
                value: profile.clone(),
            },
            || self.is_current_uid(uid),
        );
        if !applied {
            return;
        }
        if let Some(profile) = profile {
            self.reconcile_profile(uid, &profile);
        }
        self.emit_event("profile.updated", json!({ "uid": uid }));
    }

    fn on_notes_snapshot(&self, uid: &str, snapshot: TargetSnapshot) {
        let mut notes = decode_documents::<Note>(&snapshot);
        sort_newest_first(&mut notes);
        let count = notes.len();
        let applied = self.notes.apply_if(
            Snapshot {
                revision: snapshot.revision,
                value: notes,
            },
            || self.is_current_uid(uid),
        );
        if applied {
            self.emit_event("notes.updated", json!({ "count": count }));
        }
    }

    fn reconcile_profile(&self, uid: &str, profile: &UserProfile) {
        match self.theme.apply_remote(uid, profile) {
            Ok(RemoteTheme::Adopted(theme)) => {
                self.emit_event("theme.changed", json!({ "theme": theme }));
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(uid, error = %error, "failed to reconcile theme"),
        }
        match self.onboarding.apply_remote(uid, profile) {
            Ok(RemoteOnboarding::Adopted) => {
                self.emit_event("onboarding.changed", json!({ "complete": true }));
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(uid, error = %error, "failed to reconcile onboarding"),
        }
    }

    /// Applies the document returned by our own write so reads reflect it before the listener fires.
    fn apply_profile_document(&self, uid: &str, document: &Document) {
        match document.decode::<UserProfile>() {
            Ok(profile) => {
                let applied = self.profile.apply_if(
                    Snapshot {
                        revision: document.revision,
                        value: Some(profile),
                    },
                    || self.is_current_uid(uid),
                );
                if applied {
                    self.emit_event("profile.updated", json!({ "uid": uid }));
                }
            }
            Err(error) => tracing::warn!(uid, error = %error, "failed to decode written profile"),
        }
    }

    fn emit_event(&self, event_type: &str, payload: serde_json::Value) {
        let event = UiEvent {
            r#type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            event_id: Uuid::new_v4().to_string(),
            seq: self.event_seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        // No receivers is fine; the shell may not be listening yet.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{user_owner, ShieldCore};
    use crate::assistant::CannedAssistant;
    use crate::models::{
        ProgressUpdatePayload, SaveNotePayload, SignInPayload, SignUpPayload, Theme, PROFILES_COLLECTION,
    };
    use crate::route::Route;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn core_in(dir: &tempfile::TempDir) -> Arc<ShieldCore> {
        std::fs::write(dir.path().join("settings.yaml"), "assistantReplyDelayMs: 0\n").expect("settings");
        let core = ShieldCore::new(dir.path().to_path_buf(), Arc::new(CannedAssistant)).expect("core");
        core.start().await.expect("start");
        core
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    fn sign_up_payload() -> SignUpPayload {
        SignUpPayload {
            email: "ada@example.com".to_string(),
            password: "secret1".to_string(),
            name: Some("Ada".to_string()),
        }
    }

    #[tokio::test]
    async fn selecting_a_lesson_never_lowers_recorded_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_in(&dir).await;
        core.database()
            .set_document("lessons", "law-and-grace-1", json!({ "title": "Law and Grace" }), false)
            .expect("lesson");
        core.sign_up(sign_up_payload()).await.expect("sign up");
        eventually(|| core.lessons("All", "").len() == 1).await;

        core.record_progress(ProgressUpdatePayload {
            lesson_id: "law-and-grace-1".to_string(),
            percent: 60,
            current_percent: None,
        });
        core.select_lesson("law-and-grace-1").await;

        let detail = core.lesson_detail("law-and-grace-1").expect("detail");
        assert_eq!(detail.progress_percent, 60);
        assert_eq!(core.dashboard().current_progress, 60);
        assert!(core.lesson_detail("missing").is_err());
    }

    #[tokio::test]
    async fn theme_choice_survives_profile_echo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_in(&dir).await;
        core.sign_up(sign_up_payload()).await.expect("sign up");

        core.set_theme(Theme::Crimson).expect("theme");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = core.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.theme, Theme::Crimson);
        assert_eq!(snapshot.user_name, "Ada");
    }

    #[tokio::test]
    async fn notes_reach_the_mirror_and_sign_out_resets_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_in(&dir).await;
        core.sign_up(sign_up_payload()).await.expect("sign up");

        assert!(core
            .save_note(SaveNotePayload {
                content: "   ".to_string(),
                ..SaveNotePayload::default()
            })
            .expect("blank")
            .is_none());
        core.save_note(SaveNotePayload {
            content: "Grace fulfills the Law".to_string(),
            ..SaveNotePayload::default()
        })
        .expect("save");
        eventually(|| core.notes().len() == 1).await;

        core.navigate(Route::Notes, None).await;
        core.sign_out().await.expect("sign out");
        let snapshot = core.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.route.active, Route::Home);
        assert!(snapshot.user.is_none());
        assert!(core.notes().is_empty());
    }

    #[tokio::test]
    async fn undecodable_profile_snapshot_keeps_last_good_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_in(&dir).await;
        let user = core.sign_up(sign_up_payload()).await.expect("sign up");
        core.record_progress(ProgressUpdatePayload {
            lesson_id: "trinity-1".to_string(),
            percent: 50,
            current_percent: None,
        })
        .expect("progress");

        core.database()
            .set_document(
                PROFILES_COLLECTION,
                &user.uid,
                json!({ "progress": { "x": { "percent": 50.5 } } }),
                true,
            )
            .expect("malformed write");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let profile = core.current_profile().expect("profile kept");
        assert_eq!(profile.percent_for("trinity-1"), Some(50));

        core.database()
            .set_document(
                PROFILES_COLLECTION,
                &user.uid,
                json!({ "progress": { "x": { "percent": 60 } } }),
                true,
            )
            .expect("repair");
        eventually(|| core.current_profile().and_then(|profile| profile.percent_for("x")) == Some(60)).await;
    }

    #[tokio::test]
    async fn switching_accounts_tears_down_listeners_and_keeps_each_theme() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_in(&dir).await;
        let bea_credentials = SignInPayload {
            email: "bea@example.com".to_string(),
            password: "secret2".to_string(),
        };
        let bea = core
            .sign_up(SignUpPayload {
                email: bea_credentials.email.clone(),
                password: bea_credentials.password.clone(),
                name: Some("Bea".to_string()),
            })
            .await
            .expect("bea");
        core.set_theme(Theme::Emerald).expect("bea theme");
        core.sign_out().await.expect("sign out");

        let ada = core.sign_up(sign_up_payload()).await.expect("ada");
        core.set_theme(Theme::Dark).expect("ada theme");
        core.save_note(SaveNotePayload {
            content: "Ada's note".to_string(),
            ..SaveNotePayload::default()
        })
        .expect("note");
        eventually(|| core.notes().len() == 1).await;

        core.sign_in(bea_credentials).await.expect("switch");
        assert_eq!(core.listeners.active_count(&user_owner(&ada.uid)).await, 0);
        assert_eq!(core.listeners.active_count(&user_owner(&bea.uid)).await, 2);
        assert!(core.notes().is_empty());
        eventually(|| core.current_profile().and_then(|profile| profile.name).as_deref() == Some("Bea")).await;

        let snapshot = core.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.theme, Theme::Emerald);
        let stored_theme = |uid: &str| {
            core.database()
                .get_document(PROFILES_COLLECTION, uid)
                .expect("read")
                .expect("profile")
                .data["theme"]
                .clone()
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stored_theme(&bea.uid), json!("emerald"));
        assert_eq!(stored_theme(&ada.uid), json!("dark"));
    }
}
