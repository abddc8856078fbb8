use crate::context_graph::ContextGraph;
use crate::models::{
    AppSnapshot, AuthUser, BooleanResponse, DashboardSummary, LessonDetailView, LessonListItem, Note, ProgressEntry,
    ProgressUpdatePayload, SaveNotePayload, SignInPayload, SignUpPayload, StudyStats, Theme, UiEvent,
    UpdateNotePayload,
};
use crate::route::{NavigateData, Route, RouteState};
use crate::{AppSettings, AppState, ChatMessage};
use tauri::{Emitter, Manager};
use tokio::sync::broadcast::error::RecvError;

/// Webview event every `UiEvent` is emitted on.
pub const UI_EVENT_CHANNEL: &str = "shield_event";

#[tauri::command]
async fn get_snapshot(state: tauri::State<'_, AppState>) -> Result<AppSnapshot, String> {
    crate::get_snapshot(state.inner()).await
}

#[tauri::command]
async fn navigate(
    state: tauri::State<'_, AppState>,
    route: Route,
    data: Option<NavigateData>,
) -> Result<RouteState, String> {
    crate::navigate(state.inner(), route, data).await
}

#[tauri::command]
async fn open_ask_shield(state: tauri::State<'_, AppState>, question: Option<String>) -> Result<RouteState, String> {
    crate::open_ask_shield(state.inner(), question).await
}

#[tauri::command]
async fn close_ask_shield(state: tauri::State<'_, AppState>) -> Result<RouteState, String> {
    crate::close_ask_shield(state.inner()).await
}

#[tauri::command]
async fn select_lesson(state: tauri::State<'_, AppState>, lesson_id: String) -> Result<RouteState, String> {
    crate::select_lesson(state.inner(), lesson_id).await
}

#[tauri::command]
async fn back_to_lessons(state: tauri::State<'_, AppState>) -> Result<RouteState, String> {
    crate::back_to_lessons(state.inner()).await
}

#[tauri::command]
fn update_lesson_progress(
    state: tauri::State<'_, AppState>,
    payload: ProgressUpdatePayload,
) -> Result<Option<ProgressEntry>, String> {
    crate::update_lesson_progress(state.inner(), payload)
}

#[tauri::command]
fn complete_lesson(state: tauri::State<'_, AppState>, lesson_id: String) -> Result<Option<String>, String> {
    crate::complete_lesson(state.inner(), lesson_id)
}

#[tauri::command]
fn list_lessons(
    state: tauri::State<'_, AppState>,
    category: String,
    search: String,
) -> Result<Vec<LessonListItem>, String> {
    crate::list_lessons(state.inner(), category, search)
}

#[tauri::command]
fn get_lesson_categories() -> Vec<String> {
    crate::get_lesson_categories()
}

#[tauri::command]
fn get_lesson(state: tauri::State<'_, AppState>, lesson_id: String) -> Result<LessonDetailView, String> {
    crate::get_lesson(state.inner(), lesson_id)
}

#[tauri::command]
fn get_dashboard(state: tauri::State<'_, AppState>) -> Result<DashboardSummary, String> {
    crate::get_dashboard(state.inner())
}

#[tauri::command]
fn get_study_stats(state: tauri::State<'_, AppState>) -> Result<StudyStats, String> {
    crate::get_study_stats(state.inner())
}

#[tauri::command]
fn get_context_graph(state: tauri::State<'_, AppState>) -> Result<ContextGraph, String> {
    crate::get_context_graph(state.inner())
}

#[tauri::command]
fn set_theme(state: tauri::State<'_, AppState>, theme: Theme) -> Result<Theme, String> {
    crate::set_theme(state.inner(), theme)
}

#[tauri::command]
fn complete_onboarding(state: tauri::State<'_, AppState>) -> Result<BooleanResponse, String> {
    crate::complete_onboarding(state.inner())
}

#[tauri::command]
fn save_note(state: tauri::State<'_, AppState>, payload: SaveNotePayload) -> Result<Option<Note>, String> {
    crate::save_note(state.inner(), payload)
}

#[tauri::command]
fn save_lesson_note(
    state: tauri::State<'_, AppState>,
    lesson_id: String,
    content: String,
) -> Result<Option<Note>, String> {
    crate::save_lesson_note(state.inner(), lesson_id, content)
}

#[tauri::command]
async fn save_assistant_note(state: tauri::State<'_, AppState>, message_id: String) -> Result<Option<Note>, String> {
    crate::save_assistant_note(state.inner(), message_id).await
}

#[tauri::command]
fn update_note(state: tauri::State<'_, AppState>, payload: UpdateNotePayload) -> Result<Note, String> {
    crate::update_note(state.inner(), payload)
}

#[tauri::command]
fn delete_note(state: tauri::State<'_, AppState>, note_id: String) -> Result<BooleanResponse, String> {
    crate::delete_note(state.inner(), note_id)
}

#[tauri::command]
fn list_notes(state: tauri::State<'_, AppState>) -> Result<Vec<Note>, String> {
    crate::list_notes(state.inner())
}

#[tauri::command]
async fn ask_shield(state: tauri::State<'_, AppState>, question: String) -> Result<Option<ChatMessage>, String> {
    crate::ask_shield(state.inner(), question).await
}

#[tauri::command]
fn get_suggested_questions() -> Vec<String> {
    crate::get_suggested_questions()
}

#[tauri::command]
async fn get_conversation(state: tauri::State<'_, AppState>) -> Result<Vec<ChatMessage>, String> {
    crate::get_conversation(state.inner()).await
}

#[tauri::command]
async fn sign_up(state: tauri::State<'_, AppState>, payload: SignUpPayload) -> Result<AuthUser, String> {
    crate::sign_up(state.inner(), payload).await
}

#[tauri::command]
async fn sign_in(state: tauri::State<'_, AppState>, payload: SignInPayload) -> Result<AuthUser, String> {
    crate::sign_in(state.inner(), payload).await
}

#[tauri::command]
async fn sign_in_guest(state: tauri::State<'_, AppState>) -> Result<AuthUser, String> {
    crate::sign_in_guest(state.inner()).await
}

#[tauri::command]
async fn sign_out(state: tauri::State<'_, AppState>) -> Result<BooleanResponse, String> {
    crate::sign_out(state.inner()).await
}

#[tauri::command]
async fn get_settings(state: tauri::State<'_, AppState>) -> Result<AppSettings, String> {
    crate::get_settings(state.inner()).await
}

#[tauri::command]
async fn update_settings(
    state: tauri::State<'_, AppState>,
    update: serde_json::Value,
) -> Result<AppSettings, String> {
    crate::update_settings(state.inner(), update).await
}

/// Hands every core event to `emit` until the core goes away. Emit failures are logged.
async fn forward_events<F>(state: AppState, emit: F)
where
    F: Fn(UiEvent) -> Result<(), String>,
{
    let mut events = crate::subscribe_events(&state);
    drop(state);
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(error) = emit(event) {
                    tracing::warn!(error = %error, "failed to emit ui event");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "ui event forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub fn run() {
    tauri::Builder::default()
        .setup(|app| {
            let app_data_dir = app.path().app_data_dir().map_err(|error| error.to_string())?;
            let state = tauri::async_runtime::block_on(crate::launch(app_data_dir))?;

            let handle = app.handle().clone();
            tauri::async_runtime::spawn(forward_events(state.clone(), move |event| {
                handle.emit(UI_EVENT_CHANNEL, event).map_err(|error| error.to_string())
            }));

            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_snapshot,
            navigate,
            open_ask_shield,
            close_ask_shield,
            select_lesson,
            back_to_lessons,
            update_lesson_progress,
            complete_lesson,
            list_lessons,
            get_lesson_categories,
            get_lesson,
            get_dashboard,
            get_study_stats,
            get_context_graph,
            set_theme,
            complete_onboarding,
            save_note,
            save_lesson_note,
            save_assistant_note,
            update_note,
            delete_note,
            list_notes,
            ask_shield,
            get_suggested_questions,
            get_conversation,
            sign_up,
            sign_in,
            sign_in_guest,
            sign_out,
            get_settings,
            update_settings
        ])
        .run(tauri::generate_context!())
        .expect("failed to run tauri app");
}
