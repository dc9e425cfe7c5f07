//! Consent engine.
//!
//! `/authorize` validates a client's request and parks it as a pending
//! [`Consent`] in the expiry cache. The consent UI reads it back through
//! [`ConsentEngine::get_consent_by_id`] and the user decides it once through
//! [`ConsentEngine::approval`].

use crate::entity::{client, user};
use crate::error::SsoError;
use crate::oauth2::directory::Directory;
use crate::oauth2::store::ConsentStore;
use crate::utils::generate_token;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};

pub const RESPONSE_TYPE_CODE: &str = "code";
pub const RESPONSE_TYPE_TOKEN: &str = "token";

/// Authorization request as sent by the client in the `/authorize` query.
///
/// Every field defaults to empty so that a missing parameter is reported by
/// validation, naming the field, instead of a generic extractor rejection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizationRequestParam {
    /// Client identifier issued during registration
    #[serde(default)]
    pub client_id: String,
    /// `code` for the authorization-code flow, `token` for the implicit flow
    #[serde(default)]
    pub response_type: String,
    /// Opaque value returned unchanged in the redirect
    #[serde(default)]
    pub state: String,
    /// Space-separated list of requested scopes
    #[serde(default)]
    pub scope: String,
    /// Must exactly match one of the client's registered redirect URIs
    #[serde(default)]
    pub redirect_uri: String,
    /// Echoed in the ID token
    pub nonce: Option<String>,
    /// PKCE code challenge
    pub code_challenge: Option<String>,
    /// `S256` or `plain`
    pub code_challenge_method: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConsentDecision {
    Pending,
    Approved,
    Denied,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Consent {
    pub id: String,
    pub request: AuthorizationRequestParam,
    /// Requested scopes that resolved against the registry, in request order
    pub scopes: Vec<String>,
    pub approved: ConsentDecision,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    /// Unix seconds
    pub created_at: i64,
}

impl Consent {
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
}

impl From<client::Model> for ClientSummary {
    fn from(c: client::Model) -> Self {
        Self {
            id: c.id,
            name: c.name,
            description: c.description,
            logo_url: c.logo_url,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ScopeSummary {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    pub id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub profile_picture: Option<String>,
}

impl From<user::Model> for UserProfile {
    fn from(u: user::Model) -> Self {
        Self {
            id: u.id,
            first_name: u.first_name,
            middle_name: u.middle_name,
            last_name: u.last_name,
            email: u.email,
            phone: u.phone,
            profile_picture: u.profile_picture,
        }
    }
}

/// Everything the consent UI needs to render the approval screen.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ConsentData {
    pub consent_id: String,
    pub approved: ConsentDecision,
    pub client: ClientSummary,
    pub scopes: Vec<ScopeSummary>,
    pub user: UserProfile,
}

#[derive(Clone)]
pub struct ConsentEngine {
    consents: Arc<dyn ConsentStore>,
    directory: Directory,
    ttl: Duration,
}

fn require(field: &str, value: &str) -> Result<(), SsoError> {
    if value.trim().is_empty() {
        return Err(SsoError::invalid_field(field, format!("{field} is required")));
    }
    Ok(())
}

/// Field checks that need no lookups, in the order clients are told about them.
pub fn validate_request(req: &AuthorizationRequestParam) -> Result<(), SsoError> {
    require("client_id", &req.client_id)?;
    require("response_type", &req.response_type)?;
    if req.response_type != RESPONSE_TYPE_CODE && req.response_type != RESPONSE_TYPE_TOKEN {
        return Err(SsoError::invalid_field(
            "response_type",
            "response_type must be either code or token",
        ));
    }
    require("state", &req.state)?;
    require("scope", &req.scope)?;
    require("redirect_uri", &req.redirect_uri)?;
    match url::Url::parse(&req.redirect_uri) {
        Ok(u) if u.has_host() => {}
        _ => {
            return Err(SsoError::invalid_field(
                "redirect_uri",
                "redirect_uri is not a valid URL",
            ));
        }
    }
    if let Some(method) = req.code_challenge_method.as_deref()
        && method != "S256"
        && method != "plain"
    {
        return Err(SsoError::invalid_field(
            "code_challenge_method",
            "code_challenge_method must be S256 or plain",
        ));
    }
    Ok(())
}

impl ConsentEngine {
    pub fn new(consents: Arc<dyn ConsentStore>, directory: Directory, ttl: Duration) -> Self {
        Self {
            consents,
            directory,
            ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConsentStore> {
        &self.consents
    }

    async fn active_client(&self, client_id: &str) -> Result<client::Model, SsoError> {
        match self.directory.client(client_id).await? {
            Some(c) if c.is_active() => Ok(c),
            _ => Err(SsoError::invalid_field("client_id", "unknown client")),
        }
    }

    /// Validate the request and park it as a pending consent. Returns the consent id.
    #[tracing::instrument(skip(self, req), fields(client_id = %req.client_id))]
    pub async fn authorize(&self, req: &AuthorizationRequestParam) -> Result<String, SsoError> {
        validate_request(req)?;

        let client = self.active_client(&req.client_id).await?;
        if !client.is_redirect_uri_allowed(&req.redirect_uri) {
            return Err(SsoError::invalid_field(
                "redirect_uri",
                "redirect_uri is not registered for this client",
            ));
        }

        let requested: Vec<String> = req
            .scope
            .split_whitespace()
            .filter(|s| client.is_scope_allowed(s))
            .map(String::from)
            .collect();
        let resolved = self.directory.scopes(&requested).await?;
        if resolved.is_empty() {
            return Err(SsoError::invalid_field("scope", "no requested scope is available"));
        }

        let consent = Consent {
            id: generate_token()?,
            request: req.clone(),
            scopes: resolved.into_iter().map(|s| s.name).collect(),
            approved: ConsentDecision::Pending,
            user_id: None,
            roles: Vec::new(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        };
        self.consents.insert(&consent, self.ttl).await?;
        tracing::info!(scopes = %consent.scope_string(), "consent created");
        Ok(consent.id)
    }

    /// The validated client redirect URI of `req`, if it can be trusted for error redirects.
    pub async fn trusted_redirect(&self, req: &AuthorizationRequestParam) -> Option<String> {
        if req.redirect_uri.is_empty() {
            return None;
        }
        match self.active_client(&req.client_id).await {
            Ok(client) if client.is_redirect_uri_allowed(&req.redirect_uri) => {
                Some(req.redirect_uri.clone())
            }
            _ => None,
        }
    }

    async fn load(&self, consent_id: &str, user_id: &str) -> Result<Consent, SsoError> {
        match self.consents.find(consent_id).await? {
            // A consent decided by someone else is invisible to this user.
            Some(c) if c.user_id.as_deref().is_none_or(|owner| owner == user_id) => Ok(c),
            _ => Err(SsoError::NoRecordFound("consent not found or expired".into())),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_consent_by_id(
        &self,
        consent_id: &str,
        user_id: &str,
    ) -> Result<ConsentData, SsoError> {
        let consent = self.load(consent_id, user_id).await?;
        let client = self
            .directory
            .client(&consent.request.client_id)
            .await?
            .ok_or_else(|| SsoError::NoRecordFound("client not found".into()))?;
        let user = self
            .directory
            .user(user_id)
            .await?
            .ok_or_else(|| SsoError::NoRecordFound("user not found".into()))?;
        let scopes = self
            .directory
            .scopes(&consent.scopes)
            .await?
            .into_iter()
            .map(|s| ScopeSummary {
                name: s.name,
                description: s.description,
            })
            .collect();

        Ok(ConsentData {
            consent_id: consent.id,
            approved: consent.approved,
            client: client.into(),
            scopes,
            user: user.into(),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn approval(
        &self,
        consent_id: &str,
        user_id: &str,
        approve: bool,
    ) -> Result<Consent, SsoError> {
        let user = match self.directory.user(user_id).await? {
            Some(u) if u.is_active() => u,
            _ => return Err(SsoError::Unauthorized("user is not active".into())),
        };
        let roles = self.directory.roles(&user.id).await?;
        let decision = if approve {
            ConsentDecision::Approved
        } else {
            ConsentDecision::Denied
        };
        let consent = self
            .consents
            .decide(consent_id, decision, &user.id, roles)
            .await?;
        tracing::info!(decision = ?consent.approved, "consent decided");
        Ok(consent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AuthorizationRequestParam {
        AuthorizationRequestParam {
            client_id: "client-1".into(),
            response_type: "code".into(),
            state: "xyz".into(),
            scope: "openid profile".into(),
            redirect_uri: "https://client.example.com/cb".into(),
            ..Default::default()
        }
    }

    fn failing_field(req: &AuthorizationRequestParam) -> String {
        match validate_request(req) {
            Err(SsoError::InvalidUserInput { fields, .. }) => fields[0].name.clone(),
            other => panic!("expected invalid input, got {other:?}"),
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(validate_request(&request()).is_ok());
        let mut implicit = request();
        implicit.response_type = "token".into();
        assert!(validate_request(&implicit).is_ok());
    }

    #[test]
    fn first_missing_field_is_reported() {
        let empty = AuthorizationRequestParam::default();
        assert_eq!(failing_field(&empty), "client_id");

        let mut req = request();
        req.state.clear();
        req.scope.clear();
        assert_eq!(failing_field(&req), "state");
    }

    #[test]
    fn unsupported_response_type() {
        let mut req = request();
        req.response_type = "id_token".into();
        assert_eq!(failing_field(&req), "response_type");
    }

    #[test]
    fn malformed_redirect_uri() {
        let mut req = request();
        req.redirect_uri = "not a url".into();
        assert_eq!(failing_field(&req), "redirect_uri");
        req.redirect_uri = "/relative/cb".into();
        assert_eq!(failing_field(&req), "redirect_uri");
    }

    #[test]
    fn unknown_pkce_method() {
        let mut req = request();
        req.code_challenge = Some("abc".into());
        req.code_challenge_method = Some("S1".into());
        assert_eq!(failing_field(&req), "code_challenge_method");
    }

    #[test]
    fn decision_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConsentDecision::Approved).unwrap(),
            "\"approved\""
        );
    }
}
