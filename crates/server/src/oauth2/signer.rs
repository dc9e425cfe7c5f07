//! JWT signing and verification for access and ID tokens.
//!
//! Tokens are signed with PS512 (RSA-PSS / SHA-512). Every header carries the
//! `kid` of the signing key so that keys can be rotated later without
//! invalidating verification of tokens minted under the previous key.

use crate::error::SsoError;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rsa::{
    RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

const ALGORITHM: Algorithm = Algorithm::PS512;
const LEEWAY_SECS: u64 = 0;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Failed to read signing key {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Signing key is not a valid RSA private key in PKCS#8 or PKCS#1 PEM form")]
    InvalidKey,
    #[error("JWT key error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Claims of a bearer access token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    pub client_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub scope: String,
}

impl AccessClaims {
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }
}

/// OpenID Connect ID token claims.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// A single RSA public key in JWK form.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

pub trait TokenSigner: Send + Sync {
    fn key_id(&self) -> &str;
    fn issuer(&self) -> &str;
    fn sign_access(&self, claims: &AccessClaims) -> Result<String, SsoError>;
    fn sign_id(&self, claims: &IdClaims) -> Result<String, SsoError>;
    /// Checks signature, issuer, expiry and not-before.
    fn verify_access(&self, token: &str) -> Result<AccessClaims, SsoError>;
    /// As `verify_access`, additionally requiring `aud == audience`.
    fn verify_id(&self, token: &str, audience: &str) -> Result<IdClaims, SsoError>;
    fn jwks(&self) -> Jwks;
}

pub struct JwtSigner {
    issuer: String,
    key_id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Jwk,
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("issuer", &self.issuer)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl JwtSigner {
    pub fn from_pem(
        private_pem: &str,
        key_id: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Result<Self, SignerError> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_pem))
            .map_err(|_| SignerError::InvalidKey)?;
        let public = private.to_public_key();

        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let n = b64.encode(public.n().to_bytes_be());
        let e = b64.encode(public.e().to_bytes_be());
        let key_id = key_id.into();

        Ok(Self {
            issuer: issuer.into(),
            encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes())?,
            decoding: DecodingKey::from_rsa_components(&n, &e)?,
            jwk: Jwk {
                kty: "RSA".to_string(),
                key_use: "sig".to_string(),
                alg: "PS512".to_string(),
                kid: key_id.clone(),
                n,
                e,
            },
            key_id,
        })
    }

    /// Load the private key once at process start.
    pub fn from_file(
        path: &str,
        key_id: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Result<Self, SignerError> {
        let pem = std::fs::read_to_string(path).map_err(|source| SignerError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_pem(&pem, key_id, issuer)
    }

    fn header(&self) -> Header {
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(self.key_id.clone());
        header
    }

    fn validation(&self, audience: Option<&str>) -> Validation {
        let mut validation = Validation::new(ALGORITHM);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = LEEWAY_SECS;
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        validation
    }

    fn check_kid(&self, token: &str) -> Result<(), SsoError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| SsoError::Unauthorized("malformed token".into()))?;
        match header.kid {
            Some(kid) if kid != self.key_id => {
                Err(SsoError::Unauthorized("token signed with an unknown key".into()))
            }
            _ => Ok(()),
        }
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, SsoError> {
        encode(&self.header(), claims, &self.encoding)
            .map_err(|e| SsoError::Internal(format!("token signing failed: {e}")))
    }

    fn verify<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<T, SsoError> {
        self.check_kid(token)?;
        decode::<T>(token, &self.decoding, &self.validation(audience))
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "token verification failed");
                SsoError::Unauthorized("invalid or expired token".into())
            })
    }
}

impl TokenSigner for JwtSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn issuer(&self) -> &str {
        &self.issuer
    }

    fn sign_access(&self, claims: &AccessClaims) -> Result<String, SsoError> {
        self.sign(claims)
    }

    fn sign_id(&self, claims: &IdClaims) -> Result<String, SsoError> {
        self.sign(claims)
    }

    fn verify_access(&self, token: &str) -> Result<AccessClaims, SsoError> {
        self.verify(token, None)
    }

    fn verify_id(&self, token: &str, audience: &str) -> Result<IdClaims, SsoError> {
        self.verify(token, Some(audience))
    }

    fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use std::sync::OnceLock;
    use time::OffsetDateTime;

    fn pem(slot: usize) -> &'static str {
        static KEYS: OnceLock<Vec<String>> = OnceLock::new();
        &KEYS.get_or_init(|| {
            (0..2)
                .map(|_| {
                    RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
                        .unwrap()
                        .to_pkcs8_pem(LineEnding::LF)
                        .unwrap()
                        .to_string()
                })
                .collect()
        })[slot]
    }

    fn signer(slot: usize) -> JwtSigner {
        JwtSigner::from_pem(pem(slot), "test-key", "https://sso.test").unwrap()
    }

    fn claims(exp_offset: i64, nbf_offset: i64) -> AccessClaims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        AccessClaims {
            iss: "https://sso.test".into(),
            sub: "user-1".into(),
            aud: "client-1".into(),
            exp: now + exp_offset,
            nbf: now + nbf_offset,
            iat: now,
            jti: "jti-1".into(),
            client_id: "client-1".into(),
            roles: vec!["user".into()],
            scope: "openid profile".into(),
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let signer = signer(0);
        let original = claims(900, 0);
        let token = signer.sign_access(&original).unwrap();
        assert_eq!(signer.verify_access(&token).unwrap(), original);

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::PS512);
        assert_eq!(header.kid.as_deref(), Some("test-key"));
    }

    #[test]
    fn other_key_is_rejected() {
        let token = signer(0).sign_access(&claims(900, 0)).unwrap();
        assert!(matches!(
            signer(1).verify_access(&token),
            Err(SsoError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = signer(0);
        let token = signer.sign_access(&claims(-120, -300)).unwrap();
        assert!(signer.verify_access(&token).is_err());
    }

    #[test]
    fn not_yet_valid_token_is_rejected() {
        let signer = signer(0);
        let token = signer.sign_access(&claims(1200, 600)).unwrap();
        assert!(signer.verify_access(&token).is_err());
    }

    #[test]
    fn no_clock_skew_is_tolerated() {
        let signer = signer(0);
        let just_expired = signer.sign_access(&claims(-2, -600)).unwrap();
        assert!(signer.verify_access(&just_expired).is_err());
        let almost_valid = signer.sign_access(&claims(900, 3)).unwrap();
        assert!(signer.verify_access(&almost_valid).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = signer(0);
        let token = signer.sign_access(&claims(900, 0)).unwrap();
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        let mut forged = claims(900, 0);
        forged.sub = "admin".into();
        parts[1] = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&forged).unwrap());
        assert!(signer.verify_access(&parts.join(".")).is_err());
    }

    #[test]
    fn id_token_requires_audience() {
        let signer = signer(0);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let id = IdClaims {
            iss: "https://sso.test".into(),
            sub: "user-1".into(),
            aud: "client-1".into(),
            exp: now + 900,
            nbf: now,
            iat: now,
            nonce: Some("n-0S6_WzA2Mj".into()),
            ..Default::default()
        };
        let token = signer.sign_id(&id).unwrap();
        assert_eq!(signer.verify_id(&token, "client-1").unwrap(), id);
        assert!(signer.verify_id(&token, "client-2").is_err());
    }

    #[test]
    fn jwks_publishes_key_id() {
        let jwks = signer(0).jwks();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid, "test-key");
        assert_eq!(jwks.keys[0].alg, "PS512");
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(matches!(
            JwtSigner::from_pem("not a key", "k", "iss"),
            Err(SignerError::InvalidKey)
        ));
    }
}
