//! Token minting and the token exchange engine.
//!
//! [`TokenService`] turns a [`Grant`] into a signed token set and owns the
//! lifetime rules. [`TokenExchange`] implements the `authorization_code` and
//! `refresh_token` grants plus revocation and logout on top of it.

use crate::config::TtlConfig;
use crate::entity::{client, refresh_token, user};
use crate::error::SsoError;
use crate::oauth2::consent::{Consent, ConsentDecision};
use crate::oauth2::directory::Directory;
use crate::oauth2::password::verify_password;
use crate::oauth2::signer::{AccessClaims, IdClaims, TokenSigner};
use crate::oauth2::store::{AuthCodeStore, RefreshTokenStore};
use crate::utils::generate_token;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa::ToSchema;

pub const TOKEN_TYPE: &str = "Bearer";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Absent only for the implicit flow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Who is being issued tokens, for whom and with what.
#[derive(Clone, Debug)]
pub struct Grant {
    pub user: user::Model,
    pub client_id: String,
    pub scope: String,
    pub roles: Vec<String>,
    pub nonce: Option<String>,
    pub redirect_uri: Option<String>,
    /// Authorization code the grant was redeemed from
    pub code: Option<String>,
}

impl Grant {
    fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }
}

/// Client credentials as presented at the token endpoint.
#[derive(Clone, Debug, Default)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Profile claims released by the granted scopes.
pub fn id_claims_for(user: &user::Model, grant: &Grant, base: IdClaims) -> IdClaims {
    let mut claims = base;
    if grant.has_scope("profile") {
        claims.name = Some(user.full_name());
        claims.given_name = Some(user.first_name.clone());
        claims.middle_name = user.middle_name.clone();
        claims.family_name = Some(user.last_name.clone());
        claims.gender = user.gender.clone();
        claims.picture = user.profile_picture.clone();
    }
    if grant.has_scope("email") {
        claims.email = user.email.clone();
    }
    if grant.has_scope("phone") {
        claims.phone_number = user.phone.clone();
    }
    claims
}

fn seconds(secs: u64) -> Result<time::Duration, SsoError> {
    i64::try_from(secs)
        .map(time::Duration::seconds)
        .map_err(|_| SsoError::Internal("token lifetime out of range".into()))
}

#[derive(Clone)]
pub struct TokenService {
    signer: Arc<dyn TokenSigner>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    directory: Directory,
    ttl: TtlConfig,
    first_party_client_id: String,
    first_party_scope: String,
}

impl TokenService {
    pub fn new(
        signer: Arc<dyn TokenSigner>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        directory: Directory,
        ttl: TtlConfig,
        first_party_client_id: String,
        first_party_scope: String,
    ) -> Self {
        Self {
            signer,
            refresh_tokens,
            directory,
            ttl,
            first_party_client_id,
            first_party_scope,
        }
    }

    pub fn signer(&self) -> &Arc<dyn TokenSigner> {
        &self.signer
    }

    /// Signed access token and, when `openid` was granted, an ID token.
    fn mint(&self, grant: &Grant) -> Result<(String, Option<String>), SsoError> {
        let now = OffsetDateTime::now_utc();
        let iat = now.unix_timestamp();
        let access = AccessClaims {
            iss: self.signer.issuer().to_string(),
            sub: grant.user.id.clone(),
            aud: grant.client_id.clone(),
            exp: (now + seconds(self.ttl.access_token)?).unix_timestamp(),
            nbf: iat,
            iat,
            jti: uuid::Uuid::new_v4().to_string(),
            client_id: grant.client_id.clone(),
            roles: grant.roles.clone(),
            scope: grant.scope.clone(),
        };
        let access_token = self.signer.sign_access(&access)?;

        let id_token = if grant.has_scope("openid") {
            let base = IdClaims {
                iss: access.iss.clone(),
                sub: access.sub.clone(),
                aud: grant.client_id.clone(),
                exp: (now + seconds(self.ttl.id_token)?).unix_timestamp(),
                nbf: iat,
                iat,
                nonce: grant.nonce.clone(),
                ..Default::default()
            };
            Some(self.signer.sign_id(&id_claims_for(&grant.user, grant, base))?)
        } else {
            None
        };
        Ok((access_token, id_token))
    }

    fn refresh_row(&self, grant: &Grant) -> Result<refresh_token::Model, SsoError> {
        let now = OffsetDateTime::now_utc();
        Ok(refresh_token::Model {
            id: uuid::Uuid::new_v4().to_string(),
            token: generate_token()?,
            code: grant.code.clone(),
            user_id: grant.user.id.clone(),
            client_id: grant.client_id.clone(),
            scope: grant.scope.clone(),
            roles: grant.roles.join(" "),
            redirect_uri: grant.redirect_uri.clone(),
            expires_at: now + seconds(self.ttl.refresh_token)?,
            created_at: now,
            updated_at: now,
        })
    }

    fn respond(
        &self,
        grant: &Grant,
        refresh_token: Option<String>,
        state: Option<String>,
    ) -> Result<TokenResponse, SsoError> {
        let (access_token, id_token) = self.mint(grant)?;
        Ok(TokenResponse {
            access_token,
            id_token,
            refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: self.ttl.access_token,
            scope: grant.scope.clone(),
            state,
        })
    }

    /// Mint a full token set, persist its refresh token and record the grant.
    pub async fn issue(
        &self,
        grant: &Grant,
        state: Option<String>,
    ) -> Result<TokenResponse, SsoError> {
        let row = self.refresh_row(grant)?;
        let response = self.respond(grant, Some(row.token.clone()), state)?;
        self.refresh_tokens.insert(&row).await?;
        tracing::info!(user_id = %grant.user.id, client_id = %grant.client_id, "tokens issued");
        Ok(response)
    }

    /// Access (and ID) token only, for an approved `response_type=token` consent.
    pub async fn issue_implicit(&self, consent: &Consent) -> Result<TokenResponse, SsoError> {
        if consent.approved != ConsentDecision::Approved {
            return Err(SsoError::invalid_field("consentId", "consent is not approved"));
        }
        let user_id = consent
            .user_id
            .as_deref()
            .ok_or_else(|| SsoError::invalid_field("consentId", "consent has no deciding user"))?;
        let user = match self.directory.user(user_id).await? {
            Some(u) if u.is_active() => u,
            _ => return Err(SsoError::Unauthorized("user is not active".into())),
        };
        let grant = Grant {
            user,
            client_id: consent.request.client_id.clone(),
            scope: consent.scope_string(),
            roles: consent.roles.clone(),
            nonce: consent.request.nonce.clone(),
            redirect_uri: Some(consent.request.redirect_uri.clone()),
            code: None,
        };
        self.respond(&grant, None, Some(consent.request.state.clone()))
    }

    /// Tokens for the first-party client after a direct or federated login.
    pub async fn issue_for_user(&self, user: user::Model) -> Result<TokenResponse, SsoError> {
        if !user.is_active() {
            return Err(SsoError::Unauthorized("user is not active".into()));
        }
        let roles = self.directory.roles(&user.id).await?;
        let grant = Grant {
            user,
            client_id: self.first_party_client_id.clone(),
            scope: self.first_party_scope.clone(),
            roles,
            nonce: None,
            redirect_uri: None,
            code: None,
        };
        self.issue(&grant, None).await
    }
}

#[derive(Clone)]
pub struct TokenExchange {
    codes: Arc<dyn AuthCodeStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    tokens: TokenService,
    directory: Directory,
}

impl TokenExchange {
    pub fn new(
        codes: Arc<dyn AuthCodeStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        tokens: TokenService,
        directory: Directory,
    ) -> Self {
        Self {
            codes,
            refresh_tokens,
            tokens,
            directory,
        }
    }

    async fn authenticate_client(
        &self,
        creds: &ClientCredentials,
    ) -> Result<client::Model, SsoError> {
        let rejected = || SsoError::Unauthorized("invalid client credentials".into());
        if creds.client_id.is_empty() {
            return Err(rejected());
        }
        let client = match self.directory.client(&creds.client_id).await? {
            Some(c) if c.is_active() => c,
            _ => return Err(rejected()),
        };
        let secret = creds.client_secret.as_deref().ok_or_else(rejected)?;
        if !verify_password(secret, &client.secret_hash) {
            tracing::warn!(client_id = %client.id, "client secret mismatch");
            return Err(rejected());
        }
        Ok(client)
    }

    async fn active_user(&self, user_id: &str) -> Result<user::Model, SsoError> {
        match self.directory.user(user_id).await? {
            Some(u) if u.is_active() => Ok(u),
            _ => Err(SsoError::InvalidGrant("user is not active".into())),
        }
    }

    /// `grant_type=authorization_code`
    #[tracing::instrument(skip_all, fields(client_id = %creds.client_id))]
    pub async fn exchange_code(
        &self,
        creds: &ClientCredentials,
        code: &str,
        redirect_uri: Option<&str>,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, SsoError> {
        let invalid = || SsoError::InvalidGrant("invalid or expired authorization code".into());
        if code.is_empty() {
            return Err(SsoError::invalid_field("code", "code is required"));
        }
        let found = self
            .codes
            .find(code)
            .await?
            .filter(|c| !c.is_expired())
            .ok_or_else(invalid)?;

        let client = self.authenticate_client(creds).await?;
        if found.client_id != client.id {
            return Err(SsoError::InvalidGrant(
                "authorization code was issued to another client".into(),
            ));
        }
        if redirect_uri != Some(found.redirect_uri.as_str()) {
            return Err(SsoError::InvalidGrant("redirect_uri mismatch".into()));
        }
        if !found.verify_pkce(code_verifier) {
            return Err(SsoError::InvalidGrant("PKCE verification failed".into()));
        }

        let redeemed = self.codes.redeem(code).await?.ok_or_else(invalid)?;
        let user = self.active_user(&redeemed.user_id).await?;
        let grant = Grant {
            user,
            client_id: client.id,
            scope: redeemed.scope.clone(),
            roles: redeemed.roles_list(),
            nonce: redeemed.nonce.clone(),
            redirect_uri: Some(redeemed.redirect_uri.clone()),
            code: Some(redeemed.code.clone()),
        };
        self.tokens.issue(&grant, Some(redeemed.state)).await
    }

    /// `grant_type=refresh_token`. The presented token is rotated.
    #[tracing::instrument(skip_all, fields(client_id = %creds.client_id))]
    pub async fn refresh(
        &self,
        creds: &ClientCredentials,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<TokenResponse, SsoError> {
        let invalid = || SsoError::InvalidGrant("invalid or expired refresh token".into());
        if refresh_token.is_empty() {
            return Err(SsoError::invalid_field(
                "refresh_token",
                "refresh_token is required",
            ));
        }
        let row = self
            .refresh_tokens
            .find(refresh_token)
            .await?
            .filter(|r| !r.is_expired())
            .ok_or_else(invalid)?;

        let client = self.authenticate_client(creds).await?;
        if row.client_id != client.id {
            return Err(SsoError::InvalidGrant(
                "refresh token was issued to another client".into(),
            ));
        }

        let scope = match scope.map(str::trim).filter(|s| !s.is_empty()) {
            Some(requested) => {
                if let Some(extra) = requested.split_whitespace().find(|s| !row.has_scope(s)) {
                    return Err(SsoError::InvalidGrant(format!(
                        "scope {extra} was not part of the original grant"
                    )));
                }
                requested.split_whitespace().collect::<Vec<_>>().join(" ")
            }
            None => row.scope.clone(),
        };

        let user = self.active_user(&row.user_id).await?;
        let roles = self.directory.roles(&user.id).await?;
        let grant = Grant {
            user,
            client_id: client.id,
            scope,
            roles,
            nonce: None,
            redirect_uri: row.redirect_uri.clone(),
            code: row.code.clone(),
        };
        let replacement = self.tokens.refresh_row(&grant)?;
        if !self.refresh_tokens.rotate(refresh_token, &replacement).await? {
            tracing::warn!(user_id = %row.user_id, "refresh token replay rejected");
            return Err(invalid());
        }
        self.tokens.respond(&grant, Some(replacement.token), None)
    }

    /// Drop every grant the user gave `client_id`. Safe to repeat.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_client(&self, user_id: &str, client_id: &str) -> Result<(), SsoError> {
        if client_id.trim().is_empty() {
            return Err(SsoError::invalid_field("client_id", "client_id is required"));
        }
        let removed = self.refresh_tokens.revoke_client(user_id, client_id).await?;
        tracing::info!(removed, "client grants revoked");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn logout(&self, user_id: &str, refresh_token: &str) -> Result<(), SsoError> {
        if refresh_token.is_empty() {
            return Err(SsoError::invalid_field(
                "refresh_token",
                "refresh_token is required",
            ));
        }
        if !self.refresh_tokens.delete(refresh_token, user_id).await? {
            tracing::debug!("logout for unknown refresh token");
        }
        Ok(())
    }
}
