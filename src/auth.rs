use crate::db::{AccountRecord, Database};
use crate::errors::{AppError, AppResult};
use crate::local_storage::{LocalStorage, SESSION_KEY};
use crate::models::{
    AuthUser, SignInPayload, SignUpPayload, Theme, UserProfile, DEFAULT_DEFENSE_OF_THE_DAY, PROFILES_COLLECTION,
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const GUEST_NAME: &str = "Guest";
pub const GUEST_EMAIL: &str = "guest@shield.app";

static EMAIL_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

const INVALID_CREDENTIALS: &str = "Invalid email or password.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    uid: String,
}

impl From<AccountRecord> for AuthUser {
    fn from(value: AccountRecord) -> Self {
        Self {
            uid: value.uid,
            email: value.email,
            display_name: value.display_name,
            anonymous: value.anonymous,
        }
    }
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| AppError::Internal(format!("Failed to hash password: {error}")))
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|error| AppError::Internal(format!("Invalid password hash format: {error}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    if !EMAIL_RE.is_match(&email) {
        return Err(AppError::Auth("Please enter a valid email address.".to_string()));
    }
    Ok(email)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Header name: profile name, account display name, email local part, then "Student".
pub fn resolve_user_name(profile: Option<&UserProfile>, user: Option<&AuthUser>) -> String {
    non_blank(profile.and_then(|profile| profile.name.as_deref()))
        .or_else(|| non_blank(user.and_then(|user| user.display_name.as_deref())))
        .or_else(|| {
            non_blank(user.and_then(|user| user.email.as_deref()))
                .and_then(|email| email.split('@').next())
                .filter(|local| !local.is_empty())
        })
        .unwrap_or("Student")
        .to_string()
}

pub fn resolve_user_email(profile: Option<&UserProfile>, user: Option<&AuthUser>) -> String {
    non_blank(profile.and_then(|profile| profile.email.as_deref()))
        .or_else(|| non_blank(user.and_then(|user| user.email.as_deref())))
        .unwrap_or(GUEST_EMAIL)
        .to_string()
}

/// Local account and session management.
#[derive(Clone)]
pub struct AuthService {
    db: Arc<Database>,
    storage: Arc<LocalStorage>,
}

impl AuthService {
    pub fn new(db: Arc<Database>, storage: Arc<LocalStorage>) -> Self {
        Self { db, storage }
    }

    pub fn sign_up(&self, payload: SignUpPayload) -> AppResult<AuthUser> {
        let email = normalize_email(&payload.email)?;
        if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AppError::Auth(format!(
                "Password should be at least {} characters.",
                MIN_PASSWORD_LENGTH
            )));
        }
        if self.db.find_account_by_email(&email)?.is_some() {
            return Err(AppError::Auth("An account with this email already exists.".to_string()));
        }

        let hash = hash_password(&payload.password)?;
        let account = self
            .db
            .insert_account(Some(&email), non_blank(payload.name.as_deref()), Some(&hash), false)?;
        tracing::info!(uid = %account.uid, "account created");
        self.start_session(account.into())
    }

    pub fn sign_in(&self, payload: SignInPayload) -> AppResult<AuthUser> {
        let email = normalize_email(&payload.email)?;
        let account = self
            .db
            .find_account_by_email(&email)?
            .ok_or_else(|| AppError::Auth(INVALID_CREDENTIALS.to_string()))?;
        let Some(hash) = account.password_hash.as_deref() else {
            return Err(AppError::Auth(INVALID_CREDENTIALS.to_string()));
        };
        if !verify_password(&payload.password, hash)? {
            tracing::warn!(uid = %account.uid, "rejected sign in with wrong password");
            return Err(AppError::Auth(INVALID_CREDENTIALS.to_string()));
        }
        self.start_session(account.into())
    }

    pub fn sign_in_guest(&self, allow_guest: bool) -> AppResult<AuthUser> {
        if !allow_guest {
            return Err(AppError::Auth("Guest mode is disabled.".to_string()));
        }
        let account = self.db.insert_account(None, Some(GUEST_NAME), None, true)?;
        tracing::info!(uid = %account.uid, "guest session started");
        self.start_session(account.into())
    }

    pub fn sign_out(&self) -> AppResult<()> {
        if self.storage.remove_item(SESSION_KEY)? {
            tracing::info!("signed out");
        }
        Ok(())
    }

    /// Signed-in user persisted from a previous run, if its account still exists.
    pub fn restore_session(&self) -> AppResult<Option<AuthUser>> {
        let Some(session) = self.storage.get_item::<PersistedSession>(SESSION_KEY)? else {
            return Ok(None);
        };
        match self.db.get_account(&session.uid)? {
            Some(account) => Ok(Some(account.into())),
            None => {
                tracing::warn!(uid = %session.uid, "dropping session of unknown account");
                self.storage.remove_item(SESSION_KEY)?;
                Ok(None)
            }
        }
    }

    /// Creates `profiles/{uid}` with defaults on first sign in and returns the stored profile.
    pub fn ensure_profile(&self, user: &AuthUser, default_theme: Theme) -> AppResult<UserProfile> {
        if let Some(existing) = self.db.get_document(PROFILES_COLLECTION, &user.uid)? {
            return existing.decode();
        }

        let (name, email) = if user.anonymous {
            (GUEST_NAME.to_string(), GUEST_EMAIL.to_string())
        } else {
            let email = user.email.clone().unwrap_or_default();
            let name = non_blank(user.display_name.as_deref())
                .or_else(|| non_blank(Some(email.as_str())))
                .unwrap_or("Believer")
                .to_string();
            (name, email)
        };
        let document = self.db.set_document(
            PROFILES_COLLECTION,
            &user.uid,
            json!({
                "name": name,
                "email": email,
                "theme": default_theme.as_str(),
                "onboardingComplete": false,
                "streak": 0,
                "progress": {},
                "defenseOfTheDay": DEFAULT_DEFENSE_OF_THE_DAY,
                "createdAt": Utc::now(),
            }),
            false,
        )?;
        tracing::info!(uid = %user.uid, "profile created");
        document.decode()
    }

    fn start_session(&self, user: AuthUser) -> AppResult<AuthUser> {
        self.storage.set_item(
            SESSION_KEY,
            &PersistedSession {
                uid: user.uid.clone(),
            },
        )?;
        Ok(user)
    }
}
