//! Turns an approved consent into a single-use authorization code.

use crate::entity::auth_code;
use crate::error::SsoError;
use crate::oauth2::consent::{Consent, ConsentDecision};
use crate::oauth2::store::{AuthCodeStore, ConsentStore};
use crate::utils::generate_token;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct AuthCodeIssuer {
    codes: Arc<dyn AuthCodeStore>,
    consents: Arc<dyn ConsentStore>,
    ttl: Duration,
}

impl AuthCodeIssuer {
    pub fn new(
        codes: Arc<dyn AuthCodeStore>,
        consents: Arc<dyn ConsentStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            codes,
            consents,
            ttl,
        }
    }

    /// Returns the code together with the request's original `state`.
    #[tracing::instrument(skip(self, consent), fields(consent_id = %consent.id))]
    pub async fn issue(&self, consent: &Consent) -> Result<(String, String), SsoError> {
        if consent.approved != ConsentDecision::Approved {
            return Err(SsoError::invalid_field("consentId", "consent is not approved"));
        }
        let user_id = consent
            .user_id
            .clone()
            .ok_or_else(|| SsoError::invalid_field("consentId", "consent has no deciding user"))?;

        let now = OffsetDateTime::now_utc();
        let ttl = time::Duration::try_from(self.ttl)
            .map_err(|e| SsoError::Internal(format!("auth code ttl out of range: {e}")))?;
        let request = &consent.request;
        let code = auth_code::Model {
            code: generate_token()?,
            client_id: request.client_id.clone(),
            user_id,
            redirect_uri: request.redirect_uri.clone(),
            scope: consent.scope_string(),
            state: request.state.clone(),
            roles: consent.roles.join(" "),
            nonce: request.nonce.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request
                .code_challenge
                .as_ref()
                .map(|_| {
                    request
                        .code_challenge_method
                        .clone()
                        .unwrap_or_else(|| "plain".to_string())
                }),
            expires_at: now + ttl,
            created_at: now,
        };
        self.codes.insert(&code).await?;
        self.consents.remove(&consent.id).await?;

        tracing::info!(client_id = %code.client_id, "authorization code issued");
        Ok((code.code, code.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::oauth2::consent::AuthorizationRequestParam;
    use crate::oauth2::store::{CacheAuthCodeStore, CacheConsentStore};

    fn issuer() -> (AuthCodeIssuer, Arc<CacheAuthCodeStore>, Arc<CacheConsentStore>) {
        let cache = Arc::new(MemoryCache::new());
        let codes = Arc::new(CacheAuthCodeStore::new(cache.clone(), Duration::from_secs(1)));
        let consents = Arc::new(CacheConsentStore::new(cache, Duration::from_secs(1)));
        let issuer = AuthCodeIssuer::new(codes.clone(), consents.clone(), Duration::from_secs(300));
        (issuer, codes, consents)
    }

    fn consent(decision: ConsentDecision) -> Consent {
        Consent {
            id: "consent-1".into(),
            request: AuthorizationRequestParam {
                client_id: "client-1".into(),
                response_type: "code".into(),
                state: "xyz".into(),
                scope: "openid profile".into(),
                redirect_uri: "https://client.example.com/cb".into(),
                code_challenge: Some("challenge".into()),
                ..Default::default()
            },
            scopes: vec!["openid".into(), "profile".into()],
            approved: decision,
            user_id: Some("user-1".into()),
            roles: vec!["admin".into(), "user".into()],
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn approved_consent_yields_code_and_is_removed() {
        let (issuer, codes, consents) = issuer();
        let consent = consent(ConsentDecision::Approved);
        consents
            .insert(&consent, Duration::from_secs(60))
            .await
            .unwrap();

        let (code, state) = issuer.issue(&consent).await.unwrap();
        assert_eq!(state, "xyz");

        let stored = codes.find(&code).await.unwrap().unwrap();
        assert_eq!(stored.user_id, "user-1");
        assert_eq!(stored.scope, "openid profile");
        assert_eq!(stored.roles, "admin user");
        assert_eq!(stored.code_challenge_method.as_deref(), Some("plain"));
        assert!(consents.find("consent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_or_denied_consent_is_rejected() {
        let (issuer, _, _) = issuer();
        for decision in [ConsentDecision::Pending, ConsentDecision::Denied] {
            let result = issuer.issue(&consent(decision)).await;
            assert!(matches!(result, Err(SsoError::InvalidUserInput { .. })));
        }
    }
}
