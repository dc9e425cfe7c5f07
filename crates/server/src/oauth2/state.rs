//! OAuth2 state management.
//!
//! Wires the engines together from the configuration and the backends they
//! run on. Built once at start and shared by every handler.

use crate::cache::KvCache;
use crate::config::AppConfig;
use crate::oauth2::auth_code::AuthCodeIssuer;
use crate::oauth2::consent::ConsentEngine;
use crate::oauth2::directory::Directory;
use crate::oauth2::federation::{FederationEngine, IdpClient};
use crate::oauth2::login::LoginService;
use crate::oauth2::otp::OtpEngine;
use crate::oauth2::signer::TokenSigner;
use crate::oauth2::store::{
    AuthCodeStore, CacheConsentStore, ConsentStore, DbAuthCodeStore, DbRefreshTokenStore,
    RefreshTokenStore,
};
use crate::oauth2::token::{TokenExchange, TokenService};
use crate::sms::SmsSender;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// External collaborators the engines depend on.
#[derive(Clone)]
pub struct Backends {
    pub db: Arc<DatabaseConnection>,
    pub cache: Arc<dyn KvCache>,
    pub signer: Arc<dyn TokenSigner>,
    pub idp: Arc<dyn IdpClient>,
    pub sms: Arc<dyn SmsSender>,
    /// Defaults to the relational store when `None`.
    pub auth_codes: Option<Arc<dyn AuthCodeStore>>,
}

#[derive(Clone)]
pub struct OAuth2State {
    pub config: Arc<AppConfig>,
    pub signer: Arc<dyn TokenSigner>,
    pub directory: Directory,
    pub consent: Arc<ConsentEngine>,
    pub auth_codes: Arc<AuthCodeIssuer>,
    pub tokens: Arc<TokenService>,
    pub exchange: Arc<TokenExchange>,
    pub federation: Arc<FederationEngine>,
    pub otp: Arc<OtpEngine>,
    pub login: Arc<LoginService>,
}

impl OAuth2State {
    pub fn new(config: Arc<AppConfig>, backends: Backends) -> Self {
        let timeout = config.timeouts.external_call();
        let directory = Directory::new(backends.db.clone(), timeout);

        let consents: Arc<dyn ConsentStore> =
            Arc::new(CacheConsentStore::new(backends.cache.clone(), timeout));
        let codes: Arc<dyn AuthCodeStore> = backends
            .auth_codes
            .unwrap_or_else(|| Arc::new(DbAuthCodeStore::new(backends.db.clone(), timeout)));
        let refresh_tokens: Arc<dyn RefreshTokenStore> =
            Arc::new(DbRefreshTokenStore::new(backends.db.clone(), timeout));

        let tokens = TokenService::new(
            backends.signer.clone(),
            refresh_tokens.clone(),
            directory.clone(),
            config.ttl.clone(),
            config.first_party_client_id.clone(),
            config.first_party_scope.clone(),
        );
        let otp = Arc::new(OtpEngine::new(
            backends.cache.clone(),
            backends.sms,
            directory.clone(),
            &config.ttl,
            timeout,
        ));

        Self {
            signer: backends.signer,
            consent: Arc::new(ConsentEngine::new(
                consents.clone(),
                directory.clone(),
                config.ttl.consent(),
            )),
            auth_codes: Arc::new(AuthCodeIssuer::new(
                codes.clone(),
                consents,
                config.ttl.auth_code(),
            )),
            exchange: Arc::new(TokenExchange::new(
                codes,
                refresh_tokens,
                tokens.clone(),
                directory.clone(),
            )),
            federation: Arc::new(FederationEngine::new(
                backends.idp,
                directory.clone(),
                tokens.clone(),
            )),
            login: Arc::new(LoginService::new(
                directory.clone(),
                otp.clone(),
                tokens.clone(),
            )),
            otp,
            tokens: Arc::new(tokens),
            directory,
            config,
        }
    }
}
