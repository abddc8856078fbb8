use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::local_storage::{LocalStorage, ONBOARDING_KEY, THEME_KEY};
use crate::models::{Theme, UserProfile, PROFILES_COLLECTION};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Theme intent as stored on the device. `updated_at` is the logical stamp (epoch millis) of the
/// local change; `0` means the theme was never chosen on this device. `owner` is the account that
/// made the choice, `None` when it was made signed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemePreference {
    pub theme: Theme,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl ThemePreference {
    /// Stamp of this intent as seen by `uid`. Another account's choice is no intent at all.
    fn stamp_for(&self, uid: &str) -> i64 {
        match self.owner.as_deref() {
            Some(owner) if owner != uid => 0,
            _ => self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTheme {
    /// Remote value was newer and is now the local theme.
    Adopted(Theme),
    /// Local intent was newer and has been written back to the profile.
    Pushed,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOnboarding {
    Adopted,
    Pushed,
    Unchanged,
}

/// Keeps the theme consistent between device storage, the applied UI theme and the profile.
#[derive(Debug)]
pub struct ThemeSync {
    db: Arc<Database>,
    storage: Arc<LocalStorage>,
    state: Mutex<ThemePreference>,
}

impl ThemeSync {
    pub fn load(db: Arc<Database>, storage: Arc<LocalStorage>, default_theme: Theme) -> AppResult<Self> {
        let stored = match storage.get_item::<ThemePreference>(THEME_KEY)? {
            Some(preference) => preference,
            None => ThemePreference {
                theme: storage
                    .get_item::<String>(THEME_KEY)?
                    .and_then(|raw| Theme::parse(&raw))
                    .unwrap_or(default_theme),
                updated_at: 0,
                owner: None,
            },
        };

        Ok(Self {
            db,
            storage,
            state: Mutex::new(stored),
        })
    }

    pub fn preference(&self) -> AppResult<ThemePreference> {
        Ok(self.lock()?.clone())
    }

    pub fn theme(&self) -> AppResult<Theme> {
        self.preference().map(|preference| preference.theme)
    }

    /// Applies a local theme choice immediately and writes it through to the profile of `uid`.
    /// A failed remote write is logged; the local choice stands.
    pub fn set_theme(&self, uid: Option<&str>, theme: Theme) -> AppResult<ThemePreference> {
        let preference = {
            let mut state = self.lock()?;
            let stamp = Utc::now()
                .timestamp_millis()
                .max(state.updated_at.saturating_add(1));
            *state = ThemePreference {
                theme,
                updated_at: stamp,
                owner: uid.map(ToString::to_string),
            };
            state.clone()
        };
        self.storage.set_item(THEME_KEY, &preference)?;

        if let Some(uid) = uid {
            self.push(uid, &preference);
        }
        Ok(preference)
    }

    /// Reconciles a profile snapshot of `uid`. The remote theme wins when it carries a newer stamp
    /// than the last local intent, or when no local intent of this account exists. A newer local
    /// intent is written back to the profile.
    pub fn apply_remote(&self, uid: &str, profile: &UserProfile) -> AppResult<RemoteTheme> {
        let remote_theme = profile.theme.as_deref().and_then(Theme::parse);
        let remote_stamp = profile.theme_updated_at.unwrap_or(0);

        let (outcome, preference, changed) = {
            let mut state = self.lock()?;
            let before = state.clone();
            let local_stamp = state.stamp_for(uid);
            let outcome = match remote_theme {
                Some(theme) if remote_stamp > local_stamp || local_stamp == 0 => {
                    *state = ThemePreference {
                        theme,
                        updated_at: remote_stamp.max(local_stamp),
                        owner: Some(uid.to_string()),
                    };
                    if theme != before.theme {
                        RemoteTheme::Adopted(theme)
                    } else {
                        RemoteTheme::Unchanged
                    }
                }
                _ if local_stamp > remote_stamp => {
                    state.owner = Some(uid.to_string());
                    RemoteTheme::Pushed
                }
                _ => RemoteTheme::Unchanged,
            };
            (outcome, state.clone(), *state != before)
        };

        if changed {
            self.storage.set_item(THEME_KEY, &preference)?;
        }
        match outcome {
            RemoteTheme::Adopted(theme) => {
                tracing::info!(uid, theme = theme.as_str(), "adopted theme from profile");
            }
            RemoteTheme::Pushed => self.push(uid, &preference),
            RemoteTheme::Unchanged => {}
        }
        Ok(outcome)
    }

    fn push(&self, uid: &str, preference: &ThemePreference) {
        let result = self.db.update_document(
            PROFILES_COLLECTION,
            uid,
            json!({
                "theme": preference.theme.as_str(),
                "themeUpdatedAt": preference.updated_at,
            }),
        );
        if let Err(error) = result {
            tracing::warn!(uid, error = %error, "failed to update theme preference");
        }
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, ThemePreference>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("theme state mutex poisoned".to_string()))
    }
}

/// Onboarding completion. Once complete, it stays complete on the device and on the profile.
#[derive(Debug)]
pub struct OnboardingSync {
    db: Arc<Database>,
    storage: Arc<LocalStorage>,
    complete: AtomicBool,
}

impl OnboardingSync {
    pub fn load(db: Arc<Database>, storage: Arc<LocalStorage>) -> AppResult<Self> {
        let complete = storage.get_item::<bool>(ONBOARDING_KEY)?.unwrap_or(false);
        Ok(Self {
            db,
            storage,
            complete: AtomicBool::new(complete),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Marks onboarding complete locally and, when signed in, on the profile.
    pub fn complete(&self, uid: Option<&str>) -> AppResult<bool> {
        let was_complete = self.complete.swap(true, Ordering::SeqCst);
        self.storage.set_item(ONBOARDING_KEY, &true)?;
        if let Some(uid) = uid {
            self.push(uid);
        }
        Ok(!was_complete)
    }

    pub fn apply_remote(&self, uid: &str, profile: &UserProfile) -> AppResult<RemoteOnboarding> {
        let local = self.is_complete();
        match profile.onboarding_complete {
            Some(true) if !local => {
                self.complete.store(true, Ordering::SeqCst);
                self.storage.set_item(ONBOARDING_KEY, &true)?;
                tracing::info!(uid, "adopted onboarding completion from profile");
                Ok(RemoteOnboarding::Adopted)
            }
            Some(false) | None if local => {
                self.push(uid);
                Ok(RemoteOnboarding::Pushed)
            }
            _ => Ok(RemoteOnboarding::Unchanged),
        }
    }

    fn push(&self, uid: &str) {
        let result = self
            .db
            .update_document(PROFILES_COLLECTION, uid, json!({ "onboardingComplete": true }));
        if let Err(error) = result {
            tracing::warn!(uid, error = %error, "failed to sync onboarding flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OnboardingSync, RemoteOnboarding, RemoteTheme, ThemeSync};
    use crate::db::Database;
    use crate::local_storage::{LocalStorage, THEME_KEY};
    use crate::models::{Theme, UserProfile, PROFILES_COLLECTION};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        storage: Arc<LocalStorage>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("remote.sqlite")).expect("db"));
        let storage = Arc::new(LocalStorage::new(&dir.path().join("device.sqlite")).expect("storage"));
        db.set_document(PROFILES_COLLECTION, "u1", json!({ "theme": "light", "onboardingComplete": false }), false)
            .expect("profile");
        Fixture { _dir: dir, db, storage }
    }

    fn remote_profile(db: &Database) -> UserProfile {
        db.get_document(PROFILES_COLLECTION, "u1")
            .expect("read")
            .expect("exists")
            .decode()
            .expect("decode")
    }

    #[test]
    fn theme_seeds_from_legacy_plain_string() {
        let fx = fixture();
        fx.storage.set_item(THEME_KEY, "crimson").expect("legacy");
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        assert_eq!(sync.theme().expect("theme"), Theme::Crimson);
        assert_eq!(sync.preference().expect("pref").updated_at, 0);
    }

    #[test]
    fn local_theme_survives_older_remote_snapshot() {
        let fx = fixture();
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        let stale = remote_profile(&fx.db);

        let local = sync.set_theme(None, Theme::Dark).expect("set");
        let outcome = sync.apply_remote("u1", &stale).expect("apply");

        assert_eq!(outcome, RemoteTheme::Pushed);
        assert_eq!(sync.theme().expect("theme"), Theme::Dark);
        let remote = remote_profile(&fx.db);
        assert_eq!(remote.theme.as_deref(), Some("dark"));
        assert_eq!(remote.theme_updated_at, Some(local.updated_at));
    }

    #[test]
    fn newer_remote_theme_is_adopted_and_persisted() {
        let fx = fixture();
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        let local = sync.set_theme(Some("u1"), Theme::Dark).expect("set");

        let mut newer = remote_profile(&fx.db);
        newer.theme = Some("emerald".to_string());
        newer.theme_updated_at = Some(local.updated_at + 10);
        assert_eq!(sync.apply_remote("u1", &newer).expect("apply"), RemoteTheme::Adopted(Theme::Emerald));

        let reloaded = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("reload");
        assert_eq!(reloaded.theme().expect("theme"), Theme::Emerald);
    }

    #[test]
    fn echo_of_own_write_changes_nothing() {
        let fx = fixture();
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        sync.set_theme(Some("u1"), Theme::Crimson).expect("set");
        let echo = remote_profile(&fx.db);
        assert_eq!(sync.apply_remote("u1", &echo).expect("apply"), RemoteTheme::Unchanged);
    }

    #[test]
    fn remote_theme_wins_without_local_intent() {
        let fx = fixture();
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        let mut remote = remote_profile(&fx.db);
        remote.theme = Some("dark".to_string());
        assert_eq!(sync.apply_remote("u1", &remote).expect("apply"), RemoteTheme::Adopted(Theme::Dark));
    }

    #[test]
    fn another_accounts_intent_is_never_pushed() {
        let fx = fixture();
        fx.db
            .set_document(
                PROFILES_COLLECTION,
                "u2",
                json!({ "theme": "emerald", "themeUpdatedAt": 5 }),
                false,
            )
            .expect("second profile");
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        sync.set_theme(Some("u1"), Theme::Dark).expect("u1 choice");

        let other: UserProfile = fx
            .db
            .get_document(PROFILES_COLLECTION, "u2")
            .expect("read")
            .expect("exists")
            .decode()
            .expect("decode");
        assert_eq!(sync.apply_remote("u2", &other).expect("apply"), RemoteTheme::Adopted(Theme::Emerald));
        assert_eq!(sync.preference().expect("pref").owner.as_deref(), Some("u2"));

        let stored = fx.db.get_document(PROFILES_COLLECTION, "u2").expect("read").expect("exists");
        assert_eq!(stored.data["theme"], "emerald");
        assert_eq!(stored.data["themeUpdatedAt"], 5);
    }

    #[test]
    fn stamp_stays_ordered_after_extreme_remote_stamp() {
        let fx = fixture();
        let sync = ThemeSync::load(fx.db.clone(), fx.storage.clone(), Theme::Light).expect("load");
        let mut remote = remote_profile(&fx.db);
        remote.theme = Some("dark".to_string());
        remote.theme_updated_at = Some(i64::MAX);
        sync.apply_remote("u1", &remote).expect("adopt");

        let local = sync.set_theme(Some("u1"), Theme::Crimson).expect("set");
        assert_eq!(local.updated_at, i64::MAX);
        assert_eq!(sync.theme().expect("theme"), Theme::Crimson);
    }

    #[test]
    fn onboarding_is_monotonic_in_both_directions() {
        let fx = fixture();
        let sync = OnboardingSync::load(fx.db.clone(), fx.storage.clone()).expect("load");
        assert!(!sync.is_complete());

        let mut remote = remote_profile(&fx.db);
        remote.onboarding_complete = Some(true);
        assert_eq!(sync.apply_remote("u1", &remote).expect("adopt"), RemoteOnboarding::Adopted);
        assert!(sync.is_complete());

        let stale = remote_profile(&fx.db);
        assert_eq!(sync.apply_remote("u1", &stale).expect("push"), RemoteOnboarding::Pushed);
        assert_eq!(remote_profile(&fx.db).onboarding_complete, Some(true));

        let reloaded = OnboardingSync::load(fx.db.clone(), fx.storage.clone()).expect("reload");
        assert!(reloaded.is_complete());
    }

    #[test]
    fn completing_onboarding_offline_keeps_local_flag() {
        let fx = fixture();
        let sync = OnboardingSync::load(fx.db.clone(), fx.storage.clone()).expect("load");
        assert!(sync.complete(Some("missing-user")).expect("complete"));
        assert!(sync.is_complete());
        assert!(!sync.complete(None).expect("again"));
    }
}
