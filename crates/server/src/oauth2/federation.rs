//! Login through a trusted external OpenID Connect provider.
//!
//! The browser comes back from the provider with a code. We exchange it at the
//! provider's token endpoint, fetch its userinfo, map the external subject to
//! a local account and mint first-party tokens.

use crate::entity::{identity_provider, ip_access_token, user};
use crate::error::SsoError;
use crate::oauth2::directory::{Directory, IdentityLink, LinkedAccount, NewUser};
use crate::oauth2::token::{TokenResponse, TokenService};
use crate::utils::within;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Token endpoint response of the provider.
#[derive(Clone, Debug, Deserialize)]
pub struct IdpTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub id_token: Option<String>,
}

/// Userinfo of the provider, accepting both plain and OIDC claim names.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IdpUserInfo {
    pub sub: String,
    #[serde(default, alias = "given_name")]
    pub first_name: Option<String>,
    #[serde(default, alias = "family_name")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Only a verified email may match an existing local account.
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, alias = "phone_number")]
    pub phone: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

#[async_trait]
pub trait IdpClient: Send + Sync {
    async fn exchange_code(
        &self,
        provider: &identity_provider::Model,
        code: &str,
    ) -> Result<IdpTokens, SsoError>;

    async fn user_info(
        &self,
        provider: &identity_provider::Model,
        access_token: &str,
    ) -> Result<IdpUserInfo, SsoError>;
}

fn authentication_failed() -> SsoError {
    SsoError::Unauthorized("authentication failed".into())
}

#[derive(Clone, Debug)]
pub struct HttpIdpClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpIdpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl IdpClient for HttpIdpClient {
    #[tracing::instrument(skip_all, fields(provider = %provider.id))]
    async fn exchange_code(
        &self,
        provider: &identity_provider::Model,
        code: &str,
    ) -> Result<IdpTokens, SsoError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ];
        // The deadline covers the response body as well as the headers.
        within(self.timeout, "identity provider", async {
            let response = self
                .http
                .post(&provider.token_endpoint)
                .header("Accept", "application/json")
                .form(&form)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "provider token request failed");
                    authentication_failed()
                })?;
            if !response.status().is_success() {
                tracing::warn!(status = %response.status(), "provider rejected code");
                return Err(authentication_failed());
            }
            let tokens = response.json::<IdpTokens>().await.map_err(|e| {
                tracing::warn!(error = %e, "provider token response malformed");
                authentication_failed()
            })?;
            Ok::<_, SsoError>(tokens)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(provider = %provider.id))]
    async fn user_info(
        &self,
        provider: &identity_provider::Model,
        access_token: &str,
    ) -> Result<IdpUserInfo, SsoError> {
        let info = within(self.timeout, "identity provider", async {
            let response = self
                .http
                .get(&provider.user_info_endpoint)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "provider userinfo request failed");
                    authentication_failed()
                })?;
            if !response.status().is_success() {
                tracing::warn!(status = %response.status(), "provider rejected userinfo request");
                return Err(authentication_failed());
            }
            let info = response.json::<IdpUserInfo>().await.map_err(|e| {
                tracing::warn!(error = %e, "provider userinfo malformed");
                authentication_failed()
            })?;
            Ok::<_, SsoError>(info)
        })
        .await?;
        if info.sub.is_empty() {
            return Err(authentication_failed());
        }
        Ok(info)
    }
}

#[derive(Clone)]
pub struct FederationEngine {
    idp: Arc<dyn IdpClient>,
    directory: Directory,
    tokens: TokenService,
}

impl FederationEngine {
    pub fn new(idp: Arc<dyn IdpClient>, directory: Directory, tokens: TokenService) -> Self {
        Self {
            idp,
            directory,
            tokens,
        }
    }

    /// Existing link first, then an account with the same phone or verified
    /// email, else a new account.
    async fn local_user(
        &self,
        provider: &identity_provider::Model,
        info: &IdpUserInfo,
        tokens: &IdpTokens,
    ) -> Result<user::Model, SsoError> {
        if let Some(link) = self.directory.identity_link(&provider.id, &info.sub).await? {
            return self.linked_user(link, tokens).await;
        }
        let account = self.match_or_create(info).await?;
        let link = IdentityLink {
            provider_id: provider.id.clone(),
            sub_id: info.sub.clone(),
            token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
        };
        match self.directory.link_identity(account, link).await {
            Ok(user) => Ok(user),
            // A concurrent first login may have linked the subject meanwhile.
            Err(e) => match self.directory.identity_link(&provider.id, &info.sub).await? {
                Some(link) => self.linked_user(link, tokens).await,
                None => Err(e),
            },
        }
    }

    async fn linked_user(
        &self,
        link: ip_access_token::Model,
        tokens: &IdpTokens,
    ) -> Result<user::Model, SsoError> {
        let user = self
            .directory
            .user(&link.user_id)
            .await?
            .ok_or_else(|| SsoError::Internal(format!("identity link {} has no user", link.id)))?;
        self.directory
            .refresh_identity_tokens(
                link,
                tokens.access_token.clone(),
                tokens.refresh_token.clone(),
            )
            .await?;
        Ok(user)
    }

    async fn match_or_create(&self, info: &IdpUserInfo) -> Result<LinkedAccount, SsoError> {
        let phone = info.phone.clone().filter(|p| !p.is_empty());
        if let Some(phone) = &phone
            && let Some(user) = self.directory.user_by_phone(phone).await?
        {
            return Ok(LinkedAccount::Existing(user));
        }
        let mut email = info.email.clone().filter(|e| !e.is_empty());
        if let Some(address) = &email
            && let Some(user) = self.directory.user_by_email(address).await?
        {
            if info.email_verified {
                return Ok(LinkedAccount::Existing(user));
            }
            // Taken by another account and not proven by the provider.
            email = None;
        }
        Ok(LinkedAccount::New(NewUser {
            first_name: info.first_name.clone().unwrap_or_default(),
            last_name: info.last_name.clone().unwrap_or_default(),
            email,
            phone,
            gender: info.gender.clone(),
            profile_picture: info.picture.clone(),
            ..Default::default()
        }))
    }

    #[tracing::instrument(skip(self, code))]
    pub async fn login_with_identity_provider(
        &self,
        ip_id: &str,
        code: &str,
    ) -> Result<TokenResponse, SsoError> {
        if code.is_empty() {
            return Err(SsoError::invalid_field("code", "code is required"));
        }
        let provider = match self.directory.identity_provider(ip_id).await? {
            Some(p) if p.is_active() => p,
            _ => return Err(SsoError::invalid_field("ip_id", "unknown identity provider")),
        };

        let tokens = self.idp.exchange_code(&provider, code).await?;
        let info = self.idp.user_info(&provider, &tokens.access_token).await?;
        let user = self.local_user(&provider, &info, &tokens).await?;
        tracing::info!(user_id = %user.id, provider = %provider.id, "federated login");
        self.tokens.issue_for_user(user).await
    }
}
