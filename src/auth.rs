//! Authentication module.

use crate::config::{AuthConfig, MailConfig};
use crate::db::{ActivationToken, Database, ROLE_ADMIN, ROLE_USER, Session, User, now_timestamp};
use crate::error::{AppError, Result};
use crate::mail::{ActivationMail, Mailer};
use argon2::{
    Argon2,
    password_hash::{
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        rand_core::{OsRng, RngCore},
    },
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use std::sync::Arc;

/// Minimum password length.
pub const MIN_PASSWORD_LEN: usize = 8;

const ACTIVATION_CODE_LEN: usize = 6;

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a secure random session token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a numeric activation code.
pub fn generate_activation_code() -> String {
    (0..ACTIVATION_CODE_LEN)
        .map(|_| char::from(b'0' + (OsRng.next_u32() % 10) as u8))
        .collect()
}

fn validate_email(email: &str) -> Result<()> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            })
        && !email.chars().any(char::is_whitespace);

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation("Email is not well formatted".to_string()))
    }
}

fn validate_password(password: &str) -> Result<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password should be {} characters long minimum",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Registration payload.
#[derive(Debug, Clone)]
pub struct Registration {
    /// First name.
    pub firstname: String,
    /// Last name.
    pub lastname: String,
    /// Email, used as login name.
    pub email: String,
    /// Plain-text password.
    pub password: String,
}

/// Authentication service.
pub struct AuthService {
    db: Database,
    mailer: Arc<dyn Mailer>,
    session_duration_days: u32,
    activation_minutes: u32,
    registration_enabled: bool,
    activation_url: String,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(db: Database, auth: &AuthConfig, mail: &MailConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            db,
            mailer,
            session_duration_days: auth.session_days,
            activation_minutes: auth.activation_minutes,
            registration_enabled: auth.registration_enabled(),
            activation_url: mail.activation_url.clone(),
        }
    }

    /// Register a new, disabled account and mail it an activation code.
    pub fn register(&self, registration: &Registration) -> Result<User> {
        if !self.registration_enabled {
            return Err(AppError::InvalidOperation(
                "Registration is disabled".to_string(),
            ));
        }

        if registration.firstname.trim().is_empty() {
            return Err(AppError::Validation("Firstname is mandatory".to_string()));
        }
        if registration.lastname.trim().is_empty() {
            return Err(AppError::Validation("Lastname is mandatory".to_string()));
        }
        validate_email(&registration.email)?;
        validate_password(&registration.password)?;

        if self.db.get_user_by_email(&registration.email)?.is_some() {
            return Err(AppError::Conflict(format!(
                "Email '{}' is already registered",
                registration.email
            )));
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            firstname: registration.firstname.trim().to_string(),
            lastname: registration.lastname.trim().to_string(),
            email: registration.email.clone(),
            password_hash: hash_password(&registration.password)?,
            date_of_birth: None,
            account_locked: false,
            enabled: false,
            roles: vec![ROLE_USER.to_string()],
            created_at: now_timestamp(),
            last_login: None,
        };

        self.db.create_user(&user)?;

        // Undo the insert so the email can register again.
        if let Err(e) = self.send_validation_email(&user) {
            tracing::warn!(user_id = %user.id, error = %e, "Activation mail failed, rolling back");
            self.db.delete_user(&user.email)?;
            return Err(e);
        }

        tracing::info!(user_id = %user.id, "Account registered");
        Ok(user)
    }

    /// Issue a fresh activation code and mail it.
    fn send_validation_email(&self, user: &User) -> Result<()> {
        let code = self.issue_activation_code(user)?;

        self.mailer.send_activation(&ActivationMail {
            to: user.email.clone(),
            full_name: user.full_name(),
            activation_url: self.activation_url.clone(),
            code,
            subject: "Account activation".to_string(),
        })
    }

    fn issue_activation_code(&self, user: &User) -> Result<String> {
        let now = now_timestamp();

        // Six digits collide occasionally; retry a few times.
        for _ in 0..5 {
            let token = ActivationToken {
                id: 0,
                token: generate_activation_code(),
                user_id: user.id.clone(),
                created_at: now,
                expires_at: now + self.activation_minutes as i64 * 60,
                validated_at: None,
            };

            match self.db.create_activation_token(&token) {
                Ok(_) => return Ok(token.token),
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal(
            "Could not allocate a unique activation code".to_string(),
        ))
    }

    /// Activate the account owning `code`.
    ///
    /// An expired code triggers a new mail and still fails.
    pub fn activate(&self, code: &str) -> Result<User> {
        let token = self
            .db
            .get_activation_token(code)?
            .ok_or_else(|| AppError::Unauthorized("Invalid activation token".to_string()))?;

        if token.validated_at.is_some() {
            return Err(AppError::Unauthorized(
                "Activation token has already been used".to_string(),
            ));
        }

        let user = self
            .db
            .get_user_by_id(&token.user_id)?
            .ok_or_else(|| AppError::NotFound(format!("User not found: {}", token.user_id)))?;

        if token.expires_at < now_timestamp() {
            self.send_validation_email(&user)?;
            return Err(AppError::Unauthorized(
                "Activation token has expired. A new token has been sent to the same email address"
                    .to_string(),
            ));
        }

        self.db.set_user_enabled(&user.id, true)?;
        self.db.mark_activation_token_validated(token.id)?;

        tracing::info!(user_id = %user.id, "Account activated");
        Ok(User {
            enabled: true,
            ..user
        })
    }

    /// Create a new, enabled user (admin function).
    pub fn create_user(
        &self,
        email: &str,
        firstname: &str,
        lastname: &str,
        password: &str,
        role: &str,
    ) -> Result<User> {
        validate_email(email)?;
        validate_password(password)?;

        // Validate role
        if role != ROLE_ADMIN && role != ROLE_USER {
            return Err(AppError::Validation(
                "Role must be 'admin' or 'user'".to_string(),
            ));
        }

        let mut roles = vec![ROLE_USER.to_string()];
        if role == ROLE_ADMIN {
            roles.push(ROLE_ADMIN.to_string());
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            firstname: firstname.to_string(),
            lastname: lastname.to_string(),
            email: email.to_string(),
            password_hash: hash_password(password)?,
            date_of_birth: None,
            account_locked: false,
            enabled: true,
            roles,
            created_at: now_timestamp(),
            last_login: None,
        };

        self.db.create_user(&user)?;
        Ok(user)
    }

    /// Login and create a session.
    pub fn login(&self, email: &str, password: &str) -> Result<(User, String)> {
        let user = self
            .db
            .get_user_by_email(email)?
            .ok_or_else(|| AppError::Unauthorized("Invalid email or password".to_string()))?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthorized(
                "Invalid email or password".to_string(),
            ));
        }

        if user.account_locked {
            return Err(AppError::AccountLocked);
        }
        if !user.enabled {
            return Err(AppError::AccountDisabled);
        }

        // Update last login
        self.db.update_user_last_login(&user.id)?;

        // Create session
        let token = generate_token();
        let expires_at = now_timestamp() + (self.session_duration_days as i64 * 24 * 60 * 60);

        let session = Session {
            token: token.clone(),
            user_id: user.id.clone(),
            expires_at,
        };

        self.db.create_session(&session)?;

        Ok((user, token))
    }

    /// Validate a session token and return the user.
    pub fn validate_token(&self, token: &str) -> Result<Option<User>> {
        let session = match self.db.get_session(token)? {
            Some(s) => s,
            None => return Ok(None),
        };

        // Check expiration
        if session.expires_at < now_timestamp() {
            self.db.delete_session(token)?;
            return Ok(None);
        }

        let user = self.db.get_user_by_id(&session.user_id)?;
        Ok(user.filter(|u| u.enabled && !u.account_locked))
    }

    /// Logout (delete session).
    pub fn logout(&self, token: &str) -> Result<()> {
        self.db.delete_session(token)
    }

    /// Change user password.
    pub fn change_password(&self, email: &str, new_password: &str) -> Result<bool> {
        validate_password(new_password)?;

        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(email, &password_hash)
    }

    /// Enable an account directly, skipping the activation code.
    pub fn force_activate(&self, email: &str) -> Result<bool> {
        match self.db.get_user_by_email(email)? {
            Some(user) => self.db.set_user_enabled(&user.id, true),
            None => Ok(false),
        }
    }

    /// Delete a user.
    pub fn delete_user(&self, email: &str) -> Result<bool> {
        self.db.delete_user(email)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }

    /// Lock or unlock an account by email.
    pub fn set_account_locked(&self, email: &str, locked: bool) -> Result<bool> {
        match self.db.get_user_by_email(email)? {
            Some(user) => {
                tracing::info!(user_id = %user.id, locked, "Account lock changed");
                self.db.set_user_locked(&user.id, locked)
            }
            None => Ok(false),
        }
    }
}
