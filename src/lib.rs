mod app;
mod assistant;
mod auth;
mod config;
mod context_graph;
mod db;
#[cfg(feature = "desktop")]
mod desktop;
mod errors;
mod lessons;
mod listeners;
mod local_storage;
mod models;
mod notes;
mod profile_sync;
mod progress;
mod route;

pub use crate::app::ShieldCore;
pub use crate::assistant::{Assistant, AssistantReply, CannedAssistant, ChatMessage, ChatRole};
pub use crate::config::AppSettings;
pub use crate::context_graph::{ContextGraph, GraphConnection, GraphNode, NodeKind};
pub use crate::db::{Database, Document};
#[cfg(feature = "desktop")]
pub use crate::desktop::{run, UI_EVENT_CHANNEL};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    AppSnapshot, AuthUser, BooleanResponse, DashboardSummary, Lesson, LessonDetailView, LessonListItem, Note,
    NoteSaveStatus, ProgressEntry, ProgressUpdatePayload, SaveNotePayload, SignInPayload, SignUpPayload, StudyStats,
    Theme, UiEvent, UpdateNotePayload, UserProfile,
};
pub use crate::route::{NavigateData, PrimaryRoute, Route, RouteState};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Handle the UI shell holds for the lifetime of the app.
#[derive(Clone)]
pub struct AppState {
    core: Arc<ShieldCore>,
}

impl AppState {
    pub fn core(&self) -> &Arc<ShieldCore> {
        &self.core
    }
}

pub async fn get_snapshot(state: &AppState) -> Result<AppSnapshot, String> {
    state.core.snapshot().await.map_err(to_client_error)
}

pub fn subscribe_events(state: &AppState) -> broadcast::Receiver<UiEvent> {
    state.core.subscribe_events()
}

pub async fn navigate(state: &AppState, route: Route, data: Option<NavigateData>) -> Result<RouteState, String> {
    Ok(state.core.navigate(route, data).await)
}

pub async fn open_ask_shield(state: &AppState, question: Option<String>) -> Result<RouteState, String> {
    Ok(state.core.open_overlay(question).await)
}

pub async fn close_ask_shield(state: &AppState) -> Result<RouteState, String> {
    Ok(state.core.close_overlay().await)
}

pub async fn select_lesson(state: &AppState, lesson_id: String) -> Result<RouteState, String> {
    Ok(state.core.select_lesson(&lesson_id).await)
}

pub async fn back_to_lessons(state: &AppState) -> Result<RouteState, String> {
    Ok(state.core.clear_lesson().await)
}

pub fn update_lesson_progress(
    state: &AppState,
    payload: ProgressUpdatePayload,
) -> Result<Option<ProgressEntry>, String> {
    Ok(state.core.record_progress(payload))
}

pub fn complete_lesson(state: &AppState, lesson_id: String) -> Result<Option<String>, String> {
    Ok(state.core.complete_lesson(&lesson_id))
}

pub fn list_lessons(state: &AppState, category: String, search: String) -> Result<Vec<LessonListItem>, String> {
    Ok(state.core.lessons(&category, &search))
}

pub fn get_lesson_categories() -> Vec<String> {
    crate::lessons::LESSON_CATEGORIES.iter().map(ToString::to_string).collect()
}

pub fn get_lesson(state: &AppState, lesson_id: String) -> Result<LessonDetailView, String> {
    state.core.lesson_detail(&lesson_id).map_err(to_client_error)
}

pub fn get_dashboard(state: &AppState) -> Result<DashboardSummary, String> {
    Ok(state.core.dashboard())
}

pub fn get_study_stats(state: &AppState) -> Result<StudyStats, String> {
    Ok(state.core.study_stats())
}

pub fn get_context_graph(state: &AppState) -> Result<ContextGraph, String> {
    Ok(state.core.context_graph())
}

pub fn set_theme(state: &AppState, theme: Theme) -> Result<Theme, String> {
    state.core.set_theme(theme).map_err(to_client_error)
}

pub fn complete_onboarding(state: &AppState) -> Result<BooleanResponse, String> {
    state
        .core
        .complete_onboarding()
        .map(|value| BooleanResponse { value })
        .map_err(to_client_error)
}

pub fn save_note(state: &AppState, payload: SaveNotePayload) -> Result<Option<Note>, String> {
    state.core.save_note(payload).map_err(to_client_error)
}

pub fn save_lesson_note(state: &AppState, lesson_id: String, content: String) -> Result<Option<Note>, String> {
    state
        .core
        .save_lesson_note(&lesson_id, &content)
        .map_err(to_client_error)
}

pub async fn save_assistant_note(state: &AppState, message_id: String) -> Result<Option<Note>, String> {
    state
        .core
        .save_assistant_note(&message_id)
        .await
        .map_err(to_client_error)
}

pub fn update_note(state: &AppState, payload: UpdateNotePayload) -> Result<Note, String> {
    state.core.update_note(payload).map_err(to_client_error)
}

pub fn delete_note(state: &AppState, note_id: String) -> Result<BooleanResponse, String> {
    state
        .core
        .delete_note(&note_id)
        .map(|_| BooleanResponse { value: true })
        .map_err(to_client_error)
}

pub fn list_notes(state: &AppState) -> Result<Vec<Note>, String> {
    Ok(state.core.notes())
}

pub async fn ask_shield(state: &AppState, question: String) -> Result<Option<ChatMessage>, String> {
    state.core.ask_shield(&question).await.map_err(to_client_error)
}

pub fn get_suggested_questions() -> Vec<String> {
    crate::assistant::SUGGESTED_QUESTIONS.iter().map(ToString::to_string).collect()
}

pub async fn get_conversation(state: &AppState) -> Result<Vec<ChatMessage>, String> {
    Ok(state.core.conversation().await)
}

pub async fn sign_up(state: &AppState, payload: SignUpPayload) -> Result<AuthUser, String> {
    state.core.sign_up(payload).await.map_err(to_client_error)
}

pub async fn sign_in(state: &AppState, payload: SignInPayload) -> Result<AuthUser, String> {
    state.core.sign_in(payload).await.map_err(to_client_error)
}

pub async fn sign_in_guest(state: &AppState) -> Result<AuthUser, String> {
    state.core.sign_in_guest().await.map_err(to_client_error)
}

pub async fn sign_out(state: &AppState) -> Result<BooleanResponse, String> {
    state
        .core
        .sign_out()
        .await
        .map(|_| BooleanResponse { value: true })
        .map_err(to_client_error)
}

pub async fn get_settings(state: &AppState) -> Result<AppSettings, String> {
    Ok(state.core.settings().await)
}

pub async fn update_settings(state: &AppState, update: serde_json::Value) -> Result<AppSettings, String> {
    state.core.update_settings(update).await.map_err(to_client_error)
}

pub async fn shutdown(state: &AppState) {
    state.core.shutdown().await;
}

/// Opens the stores under `app_data_dir`, starts listeners and resumes any saved session.
pub async fn launch(app_data_dir: PathBuf) -> Result<AppState, String> {
    launch_with_assistant(app_data_dir, Arc::new(CannedAssistant)).await
}

pub async fn launch_with_assistant(app_data_dir: PathBuf, assistant: Arc<dyn Assistant>) -> Result<AppState, String> {
    std::fs::create_dir_all(&app_data_dir).map_err(|error| error.to_string())?;
    let core = ShieldCore::new(app_data_dir, assistant).map_err(to_client_error)?;
    if let Err(error) = init_tracing(core.app_data_dir(), &core.settings().await.log_filter) {
        // A global subscriber may already be installed by the embedding shell.
        eprintln!("tracing not initialised: {}", error);
    }

    match core.start().await {
        Ok(Some(user)) => tracing::info!(uid = %user.uid, "shield core started with restored session"),
        Ok(None) => tracing::info!("shield core started"),
        Err(error) => {
            tracing::warn!(error = %error, "failed to restore previous session");
        }
    }
    Ok(AppState { core })
}

fn init_tracing(app_data_dir: &Path, default_filter: &str) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "shield.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())?;
    let _ = LOG_GUARD.set(guard);
    Ok(())
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}
