//! Storage capabilities used by the protocol engines.
//!
//! Consents live in the expiry cache; authorization codes and refresh tokens
//! are relational rows. Each store exposes the single atomic primitive its
//! protocol step needs so that engines never compose a read and an
//! invalidation out of separate calls.

use crate::cache::{CacheKey, KvCache, Namespace, get_json, set_json};
use crate::entity::auth_history::{self, AuthStatus};
use crate::entity::{auth_code, refresh_token};
use crate::error::SsoError;
use crate::oauth2::consent::{Consent, ConsentDecision};
use crate::utils::within;
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn insert(&self, consent: &Consent, ttl: Duration) -> Result<(), SsoError>;

    async fn find(&self, id: &str) -> Result<Option<Consent>, SsoError>;

    /// Moves a pending consent to `decision` in one step.
    ///
    /// Fails `NoRecordFound` when the consent is gone and `InvalidUserInput`
    /// when it was already decided.
    async fn decide(
        &self,
        id: &str,
        decision: ConsentDecision,
        user_id: &str,
        roles: Vec<String>,
    ) -> Result<Consent, SsoError>;

    async fn remove(&self, id: &str) -> Result<(), SsoError>;
}

#[async_trait]
pub trait AuthCodeStore: Send + Sync {
    async fn insert(&self, code: &auth_code::Model) -> Result<(), SsoError>;

    /// Read without consuming.
    async fn find(&self, code: &str) -> Result<Option<auth_code::Model>, SsoError>;

    /// Consume the code. Only one caller ever receives `Some`; expired codes
    /// are removed and reported as `None`.
    async fn redeem(&self, code: &str) -> Result<Option<auth_code::Model>, SsoError>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Persist a newly granted token together with its `authorized` history
    /// record. Either both rows are written or neither is.
    async fn insert(&self, token: &refresh_token::Model) -> Result<(), SsoError>;

    async fn find(&self, token: &str) -> Result<Option<refresh_token::Model>, SsoError>;

    /// Replace `old` with `new` in one durable operation.
    ///
    /// Returns `false` without inserting when `old` no longer exists or has
    /// expired, which is how a replayed token is detected.
    async fn rotate(&self, old: &str, new: &refresh_token::Model) -> Result<bool, SsoError>;

    /// Delete every token of the (user, client) pair and append a revocation record.
    async fn revoke_client(&self, user_id: &str, client_id: &str) -> Result<u64, SsoError>;

    /// Delete a single token owned by `user_id`.
    async fn delete(&self, token: &str, user_id: &str) -> Result<bool, SsoError>;
}

// =============================================================================
// Cache backed stores
// =============================================================================

#[derive(Clone)]
pub struct CacheConsentStore {
    cache: Arc<dyn KvCache>,
    timeout: Duration,
}

impl CacheConsentStore {
    pub fn new(cache: Arc<dyn KvCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    fn key(id: &str) -> CacheKey {
        CacheKey::new(Namespace::Consent, id)
    }

    async fn load(&self, id: &str) -> Result<Option<(Consent, String)>, SsoError> {
        within(
            self.timeout,
            "cache",
            get_json::<Consent>(self.cache.as_ref(), &Self::key(id)),
        )
        .await
    }
}

#[async_trait]
impl ConsentStore for CacheConsentStore {
    async fn insert(&self, consent: &Consent, ttl: Duration) -> Result<(), SsoError> {
        within(
            self.timeout,
            "cache",
            set_json(self.cache.as_ref(), &Self::key(&consent.id), consent, ttl),
        )
        .await
    }

    async fn find(&self, id: &str) -> Result<Option<Consent>, SsoError> {
        Ok(self.load(id).await?.map(|(consent, _)| consent))
    }

    async fn decide(
        &self,
        id: &str,
        decision: ConsentDecision,
        user_id: &str,
        roles: Vec<String>,
    ) -> Result<Consent, SsoError> {
        let (current, raw) = self
            .load(id)
            .await?
            .ok_or_else(|| SsoError::NoRecordFound("consent not found or expired".into()))?;
        if current.approved != ConsentDecision::Pending {
            return Err(SsoError::invalid_field("consentId", "consent already decided"));
        }

        let mut updated = current;
        updated.approved = decision;
        updated.user_id = Some(user_id.to_string());
        updated.roles = roles;
        let encoded = serde_json::to_string(&updated)
            .map_err(|e| SsoError::Internal(format!("consent encoding failed: {e}")))?;

        let swapped = within(
            self.timeout,
            "cache",
            self.cache.replace_if_eq(&Self::key(id), &raw, encoded),
        )
        .await?;
        if swapped {
            return Ok(updated);
        }
        // Lost the race: either someone else decided or the entry expired.
        match self.load(id).await? {
            Some(_) => Err(SsoError::invalid_field("consentId", "consent already decided")),
            None => Err(SsoError::NoRecordFound("consent not found or expired".into())),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SsoError> {
        within(self.timeout, "cache", self.cache.delete(&Self::key(id)))
            .await
            .map(|_| ())
    }
}

/// Authorization codes kept only in the expiry cache.
#[derive(Clone)]
pub struct CacheAuthCodeStore {
    cache: Arc<dyn KvCache>,
    timeout: Duration,
}

impl CacheAuthCodeStore {
    pub fn new(cache: Arc<dyn KvCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    fn key(code: &str) -> CacheKey {
        CacheKey::new(Namespace::AuthCode, code)
    }
}

#[async_trait]
impl AuthCodeStore for CacheAuthCodeStore {
    async fn insert(&self, code: &auth_code::Model) -> Result<(), SsoError> {
        let remaining = (code.expires_at - OffsetDateTime::now_utc()).whole_milliseconds();
        if remaining <= 0 {
            return Err(SsoError::Internal("authorization code already expired".into()));
        }
        let ttl = Duration::from_millis(remaining as u64);
        within(
            self.timeout,
            "cache",
            set_json(self.cache.as_ref(), &Self::key(&code.code), code, ttl),
        )
        .await
    }

    async fn find(&self, code: &str) -> Result<Option<auth_code::Model>, SsoError> {
        let found = within(
            self.timeout,
            "cache",
            get_json::<auth_code::Model>(self.cache.as_ref(), &Self::key(code)),
        )
        .await?;
        Ok(found.map(|(model, _)| model))
    }

    async fn redeem(&self, code: &str) -> Result<Option<auth_code::Model>, SsoError> {
        let raw = within(self.timeout, "cache", self.cache.take(&Self::key(code))).await?;
        match raw {
            Some(raw) => {
                let model: auth_code::Model = serde_json::from_str(&raw)
                    .map_err(|e| SsoError::Internal(format!("auth code decoding failed: {e}")))?;
                Ok((!model.is_expired()).then_some(model))
            }
            None => Ok(None),
        }
    }
}

// =============================================================================
// Database backed stores
// =============================================================================

#[derive(Clone)]
pub struct DbAuthCodeStore {
    db: Arc<DatabaseConnection>,
    timeout: Duration,
}

impl DbAuthCodeStore {
    pub fn new(db: Arc<DatabaseConnection>, timeout: Duration) -> Self {
        Self { db, timeout }
    }
}

#[async_trait]
impl AuthCodeStore for DbAuthCodeStore {
    async fn insert(&self, code: &auth_code::Model) -> Result<(), SsoError> {
        let active = code.clone().into_active_model().reset_all();
        within(self.timeout, "database", active.insert(self.db.as_ref()))
            .await
            .map(|_| ())
    }

    async fn find(&self, code: &str) -> Result<Option<auth_code::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            auth_code::Entity::find_by_id(code).one(self.db.as_ref()),
        )
        .await
    }

    async fn redeem(&self, code: &str) -> Result<Option<auth_code::Model>, SsoError> {
        let code = code.to_string();
        let redeemed = self
            .db
            .transaction::<_, Option<auth_code::Model>, SsoError>(|txn| {
                Box::pin(async move {
                    let Some(found) = auth_code::Entity::find_by_id(&code).one(txn).await? else {
                        return Ok(None);
                    };
                    // The conditional delete is the single-use guard: a concurrent
                    // redeemer blocks on the row and then deletes nothing.
                    let deleted = auth_code::Entity::delete_many()
                        .filter(auth_code::Column::Code.eq(&code))
                        .exec(txn)
                        .await?;
                    if deleted.rows_affected != 1 || found.is_expired() {
                        return Ok(None);
                    }
                    Ok(Some(found))
                })
            });
        within(self.timeout, "database", redeemed).await
    }
}

#[derive(Clone)]
pub struct DbRefreshTokenStore {
    db: Arc<DatabaseConnection>,
    timeout: Duration,
}

impl DbRefreshTokenStore {
    pub fn new(db: Arc<DatabaseConnection>, timeout: Duration) -> Self {
        Self { db, timeout }
    }
}

fn history_row(
    user_id: &str,
    client_id: &str,
    scope: Option<&str>,
    status: AuthStatus,
) -> auth_history::ActiveModel {
    auth_history::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        user_id: Set(user_id.to_string()),
        client_id: Set(client_id.to_string()),
        scope: Set(scope.map(String::from)),
        status: Set(status.as_str().to_string()),
        created_at: Set(OffsetDateTime::now_utc()),
    }
}

#[async_trait]
impl RefreshTokenStore for DbRefreshTokenStore {
    async fn insert(&self, token: &refresh_token::Model) -> Result<(), SsoError> {
        let active = token.clone().into_active_model().reset_all();
        let history = history_row(
            &token.user_id,
            &token.client_id,
            Some(&token.scope),
            AuthStatus::Authorized,
        );
        let inserted = self.db.transaction::<_, (), SsoError>(|txn| {
            Box::pin(async move {
                active.insert(txn).await?;
                history.insert(txn).await?;
                Ok(())
            })
        });
        within(self.timeout, "database", inserted).await
    }

    async fn find(&self, token: &str) -> Result<Option<refresh_token::Model>, SsoError> {
        within(
            self.timeout,
            "database",
            refresh_token::Entity::find()
                .filter(refresh_token::Column::Token.eq(token))
                .one(self.db.as_ref()),
        )
        .await
    }

    async fn rotate(&self, old: &str, new: &refresh_token::Model) -> Result<bool, SsoError> {
        let old = old.to_string();
        let replacement = new.clone().into_active_model().reset_all();
        let rotated = self.db.transaction::<_, bool, SsoError>(|txn| {
            Box::pin(async move {
                let deleted = refresh_token::Entity::delete_many()
                    .filter(refresh_token::Column::Token.eq(&old))
                    .filter(refresh_token::Column::ExpiresAt.gt(OffsetDateTime::now_utc()))
                    .exec(txn)
                    .await?;
                if deleted.rows_affected != 1 {
                    return Ok(false);
                }
                replacement.insert(txn).await?;
                Ok(true)
            })
        });
        within(self.timeout, "database", rotated).await
    }

    async fn revoke_client(&self, user_id: &str, client_id: &str) -> Result<u64, SsoError> {
        let user_id = user_id.to_string();
        let client_id = client_id.to_string();
        let revoked = self.db.transaction::<_, u64, SsoError>(|txn| {
            Box::pin(async move {
                let deleted = refresh_token::Entity::delete_many()
                    .filter(refresh_token::Column::UserId.eq(&user_id))
                    .filter(refresh_token::Column::ClientId.eq(&client_id))
                    .exec(txn)
                    .await?;
                history_row(&user_id, &client_id, None, AuthStatus::Revoked)
                    .insert(txn)
                    .await?;
                Ok(deleted.rows_affected)
            })
        });
        within(self.timeout, "database", revoked).await
    }

    async fn delete(&self, token: &str, user_id: &str) -> Result<bool, SsoError> {
        let deleted = within(
            self.timeout,
            "database",
            refresh_token::Entity::delete_many()
                .filter(refresh_token::Column::Token.eq(token))
                .filter(refresh_token::Column::UserId.eq(user_id))
                .exec(self.db.as_ref()),
        )
        .await?;
        Ok(deleted.rows_affected > 0)
    }
}
