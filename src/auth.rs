//! Authentication: credentials, bearer tokens, reset tokens, role checks
//!
//! Passwords are hashed with argon2; bearer and reset tokens are HS256 JWTs
//! signed with the service secret and distinguished by a purpose claim.

use crate::error::{Result, ServiceError};
use crate::settings::SettingsStore;
use crate::store::{NewUser, RecordStore, User, UserView};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::seq::{IndexedRandom, SliceRandom};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

const PURPOSE_ACCESS: &str = "access";
const PURPOSE_RESET: &str = "reset";

const TEMP_PASSWORD_LEN: usize = 12;
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnpqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%^&*-_+=";

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"))
}

/// JWT payload: subject is the username
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub purpose: String,
    pub iat: i64,
    pub exp: i64,
}

/// Outcome of a login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access_token: String,
    pub user: UserView,
}

/// Authentication service
pub struct AuthService {
    store: Arc<RecordStore>,
    settings: Arc<SettingsStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    reset_token_minutes: i64,
}

impl AuthService {
    pub fn new(
        store: Arc<RecordStore>,
        settings: Arc<SettingsStore>,
        jwt_secret: &str,
        reset_token_minutes: i64,
    ) -> Self {
        Self {
            store,
            settings,
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            reset_token_minutes,
        }
    }

    /// Hash a password with a fresh salt
    pub fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ServiceError::Internal(format!("password hashing failed: {}", e)))
    }

    /// Constant-time verification against a stored hash
    pub fn verify_password(password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    fn validate_password(password: &str) -> Result<()> {
        if password.len() < 8 {
            return Err(ServiceError::Validation(
                "password must be at least 8 characters".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_username(username: &str) -> Result<()> {
        if username.len() < 3 || username.len() > 50 {
            return Err(ServiceError::Validation(
                "username must be 3-50 characters".to_string(),
            ));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ServiceError::Validation(
                "username may contain letters, digits, '-' and '_'".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_email(email: &str) -> Result<()> {
        if email.len() > 254 || !email_regex().is_match(email) {
            return Err(ServiceError::Validation(
                "invalid email address".to_string(),
            ));
        }
        Ok(())
    }

    /// Register a new account; uniqueness is enforced on username and email
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        full_name: Option<String>,
    ) -> Result<UserView> {
        Self::validate_username(username)?;
        Self::validate_email(email)?;
        Self::validate_password(password)?;

        let user = self
            .store
            .create_user(NewUser {
                username: username.to_string(),
                email: email.to_string(),
                password_hash: Self::hash_password(password)?,
                full_name,
                is_admin: false,
            })
            .await?;

        info!("Registered user {}", username);
        Ok(UserView::from(&user))
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(format!("token signing failed: {}", e)))
    }

    fn decode_claims(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| ServiceError::Authentication(format!("invalid token: {}", e)))
    }

    /// Issue a bearer token for the user
    pub fn issue_access_token(&self, user: &User) -> Result<String> {
        let now = Utc::now();
        let lifetime = self.settings.snapshot().access_token_expire_minutes();
        self.sign(&Claims {
            sub: user.username.clone(),
            purpose: PURPOSE_ACCESS.to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::minutes(lifetime)).timestamp(),
        })
    }

    /// Log in with username and password
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let user = self
            .store
            .get_user_by_username(username)
            .await?
            .ok_or_else(|| {
                ServiceError::Authentication("invalid username or password".to_string())
            })?;

        if !Self::verify_password(password, &user.password_hash) {
            warn!("Failed login attempt for {}", username);
            return Err(ServiceError::Authentication(
                "invalid username or password".to_string(),
            ));
        }

        if !user.is_active {
            return Err(ServiceError::Authentication(
                "account is deactivated".to_string(),
            ));
        }

        let access_token = self.issue_access_token(&user)?;
        self.store.set_last_login(&user.id).await?;

        debug!("User {} logged in", username);
        let mut view = UserView::from(&user);
        view.last_login = Some(Utc::now());
        Ok(LoginOutcome { access_token, user: view })
    }

    /// Best-effort subject extraction without a store lookup; used for
    /// request attribution in metrics
    pub fn peek_subject(&self, token: &str) -> Option<String> {
        self.decode_claims(token).ok().map(|claims| claims.sub)
    }

    /// Verify a bearer token and resolve the user.
    ///
    /// Rejects on bad signature, expiry, wrong purpose, unknown subject or an
    /// inactive account.
    pub async fn verify_token(&self, token: &str) -> Result<User> {
        let claims = self.decode_claims(token)?;

        if claims.purpose != PURPOSE_ACCESS {
            return Err(ServiceError::Authentication(
                "not an access token".to_string(),
            ));
        }
        if claims.sub.is_empty() {
            return Err(ServiceError::Authentication("missing subject".to_string()));
        }

        let user = self
            .store
            .get_user_by_username(&claims.sub)
            .await?
            .ok_or_else(|| ServiceError::Authentication("user not found".to_string()))?;

        if !user.is_active {
            return Err(ServiceError::Authentication(
                "account is deactivated".to_string(),
            ));
        }

        Ok(user)
    }

    /// Admin-only gate on top of token verification
    pub fn require_admin(user: &User) -> Result<()> {
        if !user.is_admin {
            return Err(ServiceError::Authorization(
                "admin role required".to_string(),
            ));
        }
        Ok(())
    }

    /// Change the password after re-verifying the old one; clears the
    /// forced-reset flag
    pub async fn change_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if !Self::verify_password(old_password, &user.password_hash) {
            return Err(ServiceError::Authentication(
                "current password is incorrect".to_string(),
            ));
        }
        Self::validate_password(new_password)?;

        self.store
            .update_password(&user.id, &Self::hash_password(new_password)?)
            .await?;
        info!("User {} changed password", user.username);
        Ok(())
    }

    /// Step one of the reset flow. Returns the minted token when the email
    /// matched; the caller must answer identically either way.
    pub async fn forgot_password(&self, email: &str) -> Result<Option<String>> {
        let Some(user) = self.store.get_user_by_email(email).await? else {
            debug!("Password reset requested for unknown email");
            return Ok(None);
        };

        let now = Utc::now();
        let token = self.sign(&Claims {
            sub: user.username.clone(),
            purpose: PURPOSE_RESET.to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::minutes(self.reset_token_minutes)).timestamp(),
        })?;

        self.store.set_reset_token(&user.id, &token).await?;
        info!("Issued reset token for {}", user.username);
        Ok(Some(token))
    }

    /// Step two: verify the token, rewrite the hash and clear both reset
    /// fields in one statement so the token is single-use.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<()> {
        Self::validate_password(new_password)?;

        let claims = self.decode_claims(token).map_err(|_| {
            ServiceError::Validation("invalid or expired reset token".to_string())
        })?;
        if claims.purpose != PURPOSE_RESET {
            return Err(ServiceError::Validation(
                "invalid or expired reset token".to_string(),
            ));
        }

        let consumed = self
            .store
            .consume_reset_token(token, &Self::hash_password(new_password)?)
            .await?;
        if !consumed {
            return Err(ServiceError::Validation(
                "invalid or expired reset token".to_string(),
            ));
        }

        info!("Password reset completed for {}", claims.sub);
        Ok(())
    }

    /// 12-character temporary password with at least one character from each
    /// class
    pub fn generate_temp_password() -> String {
        let mut rng = rand::rng();
        let all: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS].concat();

        let mut chars: Vec<u8> = vec![
            *UPPER.choose(&mut rng).expect("class not empty"),
            *LOWER.choose(&mut rng).expect("class not empty"),
            *DIGITS.choose(&mut rng).expect("class not empty"),
            *SYMBOLS.choose(&mut rng).expect("class not empty"),
        ];
        while chars.len() < TEMP_PASSWORD_LEN {
            chars.push(*all.choose(&mut rng).expect("classes not empty"));
        }
        chars.shuffle(&mut rng);

        String::from_utf8(chars).expect("ascii password")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePool;

    async fn test_auth() -> (AuthService, Arc<RecordStore>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(RecordStore::initialize(pool.clone()).await.unwrap());
        let settings = Arc::new(SettingsStore::initialize(pool).await.unwrap());
        let auth = AuthService::new(store.clone(), settings, "test-secret-0123456789", 60);
        (auth, store)
    }

    #[tokio::test]
    async fn test_register_login_roundtrip() {
        let (auth, _) = test_auth().await;

        let view = auth
            .register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();
        assert_eq!(view.username, "alice");
        assert!(!view.is_admin);

        let outcome = auth.login("alice", "Aa1!aa1!").await.unwrap();
        assert!(!outcome.access_token.is_empty());

        let user = auth.verify_token(&outcome.access_token).await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.last_login.is_some());
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let (auth, store) = test_auth().await;
        auth.register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();

        let wrong = auth.login("alice", "wrong-password").await;
        assert!(matches!(wrong, Err(ServiceError::Authentication(_))));

        let unknown = auth.login("nobody", "Aa1!aa1!").await;
        assert!(matches!(unknown, Err(ServiceError::Authentication(_))));

        // Deactivated accounts cannot log in
        let user = store.get_user_by_username("alice").await.unwrap().unwrap();
        let mut tx = store.pool().begin().await.unwrap();
        store.set_active_tx(&mut tx, &user.id, false).await.unwrap();
        tx.commit().await.unwrap();

        let inactive = auth.login("alice", "Aa1!aa1!").await;
        assert!(matches!(inactive, Err(ServiceError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_token_rejections() {
        let (auth, store) = test_auth().await;
        auth.register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();
        let token = auth.login("alice", "Aa1!aa1!").await.unwrap().access_token;

        // Garbage and wrong-signature tokens fail
        assert!(auth.verify_token("not-a-token").await.is_err());
        let other = AuthService::new(
            store.clone(),
            Arc::new(
                SettingsStore::initialize(SqlitePool::connect("sqlite::memory:").await.unwrap())
                    .await
                    .unwrap(),
            ),
            "different-secret-9876543210",
            60,
        );
        assert!(other.verify_token(&token).await.is_err());

        // Reset tokens are not access tokens
        let reset = auth
            .forgot_password("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(auth.verify_token(&reset).await.is_err());

        // Deactivation invalidates outstanding tokens
        let user = store.get_user_by_username("alice").await.unwrap().unwrap();
        let mut tx = store.pool().begin().await.unwrap();
        store.set_active_tx(&mut tx, &user.id, false).await.unwrap();
        tx.commit().await.unwrap();
        assert!(auth.verify_token(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_registration_validation() {
        let (auth, _) = test_auth().await;

        let short_name = auth.register("ab", "a@b.co", "Aa1!aa1!", None).await;
        assert!(matches!(short_name, Err(ServiceError::Validation(_))));

        let bad_email = auth.register("alice", "not-an-email", "Aa1!aa1!", None).await;
        assert!(matches!(bad_email, Err(ServiceError::Validation(_))));

        let short_password = auth
            .register("alice", "alice@example.com", "short", None)
            .await;
        assert!(matches!(short_password, Err(ServiceError::Validation(_))));

        auth.register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();
        let duplicate = auth
            .register("alice", "other@example.com", "Aa1!aa1!", None)
            .await;
        assert!(matches!(duplicate, Err(ServiceError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_change_password() {
        let (auth, _) = test_auth().await;
        auth.register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();
        let user = auth
            .verify_token(&auth.login("alice", "Aa1!aa1!").await.unwrap().access_token)
            .await
            .unwrap();

        let wrong_old = auth.change_password(&user, "nope", "Newpass1!").await;
        assert!(matches!(wrong_old, Err(ServiceError::Authentication(_))));

        auth.change_password(&user, "Aa1!aa1!", "Newpass1!")
            .await
            .unwrap();
        assert!(auth.login("alice", "Aa1!aa1!").await.is_err());
        assert!(auth.login("alice", "Newpass1!").await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_token_single_use() {
        let (auth, _) = test_auth().await;
        auth.register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();

        // Unknown email yields no token, no error
        assert!(auth
            .forgot_password("stranger@example.com")
            .await
            .unwrap()
            .is_none());

        let token = auth
            .forgot_password("alice@example.com")
            .await
            .unwrap()
            .unwrap();

        auth.reset_password(&token, "Newpass1!").await.unwrap();
        assert!(auth.login("alice", "Newpass1!").await.is_ok());

        // Second use of the same token fails
        let again = auth.reset_password(&token, "Another1!").await;
        assert!(matches!(again, Err(ServiceError::Validation(_))));
        assert!(auth.login("alice", "Another1!").await.is_err());
    }

    #[tokio::test]
    async fn test_reset_password_rejects_garbage_token() {
        let (auth, _) = test_auth().await;
        let result = auth.reset_password("garbage", "Newpass1!").await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_newer_reset_token_invalidates_previous() {
        let (auth, _) = test_auth().await;
        auth.register("alice", "alice@example.com", "Aa1!aa1!", None)
            .await
            .unwrap();

        let first = auth
            .forgot_password("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        // Issuing tokens a second later produces a distinct value
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = auth
            .forgot_password("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first, second);

        // Only the most recently persisted token matches the stored value
        assert!(auth.reset_password(&first, "Newpass1!").await.is_err());
        assert!(auth.reset_password(&second, "Newpass1!").await.is_ok());
    }

    #[test]
    fn test_temp_password_shape() {
        for _ in 0..50 {
            let password = AuthService::generate_temp_password();
            assert_eq!(password.len(), 12);
            assert!(password.chars().any(|c| c.is_ascii_uppercase()));
            assert!(password.chars().any(|c| c.is_ascii_lowercase()));
            assert!(password.chars().any(|c| c.is_ascii_digit()));
            assert!(password.chars().any(|c| !c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = AuthService::hash_password("Aa1!aa1!").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(AuthService::verify_password("Aa1!aa1!", &hash));
        assert!(!AuthService::verify_password("other", &hash));
        assert!(!AuthService::verify_password("Aa1!aa1!", "not-a-hash"));
    }

    #[test]
    fn test_require_admin() {
        let mut user = User {
            id: "u1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: String::new(),
            full_name: None,
            is_active: true,
            is_admin: false,
            must_reset: false,
            reset_token: None,
            reset_token_issued_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login: None,
        };

        assert!(matches!(
            AuthService::require_admin(&user),
            Err(ServiceError::Authorization(_))
        ));
        user.is_admin = true;
        assert!(AuthService::require_admin(&user).is_ok());
    }
}
