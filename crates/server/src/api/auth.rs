//! Bearer token extractor.
//!
//! Verifies `Authorization: Bearer <jwt>` access tokens with the signer held
//! in [`AppResources`]. Access tokens are self-contained, so no lookup is made.

use crate::AppResources;
use crate::error::SsoError;
use crate::oauth2::signer::AccessClaims;
use axum::{extract::FromRequestParts, http::request::Parts};

/// Represents the authenticated identity behind an access token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    /// Client the token was issued to
    pub client_id: String,
    pub scopes: Vec<String>,
    pub roles: Vec<String>,
}

impl AuthenticatedUser {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

impl From<AccessClaims> for AuthenticatedUser {
    fn from(claims: AccessClaims) -> Self {
        Self {
            scopes: claims.scopes().map(String::from).collect(),
            user_id: claims.sub,
            client_id: claims.client_id,
            roles: claims.roles,
        }
    }
}

/// Axum extractor that validates bearer access tokens.
///
/// ```ignore
/// async fn handler(BearerAuth(user): BearerAuth) -> impl IntoResponse {
///     format!("Hello, {}", user.user_id)
/// }
/// ```
pub struct BearerAuth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for BearerAuth
where
    S: Send + Sync,
{
    type Rejection = SsoError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = parts
            .extensions
            .get::<AppResources>()
            .cloned()
            .ok_or_else(|| SsoError::Internal("AppResources not found in extensions".into()))?;

        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        let token = match header {
            Some(h) if h.len() > 7 && h[..7].eq_ignore_ascii_case("bearer ") => &h[7..],
            Some(_) => {
                return Err(SsoError::Unauthorized(
                    "Authorization header must use Bearer scheme".into(),
                ));
            }
            None => return Err(SsoError::Unauthorized("Missing Authorization header".into())),
        };

        let claims = resources.signer.verify_access(token.trim())?;
        Ok(BearerAuth(claims.into()))
    }
}

/// Bearer access token that must have been issued to the first-party client.
///
/// Guards the consent UI and account endpoints: a token a third-party client
/// holds for the user cannot decide consents or revoke grants.
pub struct FirstPartyAuth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for FirstPartyAuth
where
    S: Send + Sync,
{
    type Rejection = SsoError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let BearerAuth(user) = BearerAuth::from_request_parts(parts, state).await?;
        let first_party = parts
            .extensions
            .get::<AppResources>()
            .map(|r| r.config.first_party_client_id.clone())
            .ok_or_else(|| SsoError::Internal("AppResources not found in extensions".into()))?;
        if user.client_id != first_party {
            tracing::warn!(client_id = %user.client_id, "third-party token on first-party endpoint");
            return Err(SsoError::Unauthorized(
                "token was not issued to the first-party client".into(),
            ));
        }
        Ok(FirstPartyAuth(user))
    }
}
