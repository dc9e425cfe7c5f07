//! OAuth2 / OpenID Connect authorization server.
//!
//! ## Supported Flows
//!
//! - Authorization Code with optional PKCE
//! - Implicit (`response_type=token`)
//! - Refresh Token with rotation
//! - First-party login (password or OTP), signup and identity-provider federation
//!
//! ## Endpoints
//!
//! - `GET /authorize` - Authorization endpoint
//! - `GET /consent/{consent_id}` - Pending consent details
//! - `GET|POST /approval` - Consent decision
//! - `POST /oauth/token` - Token endpoint
//! - `POST /oauth/revokeClient` - Revoke a client's grants
//! - `GET /oauth/userinfo` - OpenID Connect UserInfo
//! - `GET /.well-known/openid-configuration` - OpenID Connect Discovery
//! - `GET /.well-known/jwks.json` - Signing keys

pub mod auth_code;
pub mod consent;
pub mod directory;
pub mod endpoints;
pub mod federation;
pub mod login;
pub mod otp;
pub mod password;
pub mod signer;
mod state;
pub mod store;
pub mod token;

pub use endpoints::router;
pub use password::{hash_password, verify_password};
pub use state::{Backends, OAuth2State};

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";

/// OpenAPI tag for login, signup and password reset
pub const ACCOUNT_TAG: &str = "Account";
