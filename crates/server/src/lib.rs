//! An OAuth2 / OpenID Connect single sign-on server.
//!
//! Issues signed access and ID tokens through consent-based authorization
//! code and implicit flows, rotates refresh tokens, federates logins with
//! external identity providers and verifies phones with one-time passwords.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::oauth2::signer::TokenSigner;

pub mod api;
pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod oauth2;
pub mod sms;
pub mod utils;

/// Shared handles that request extractors reach through extensions.
#[derive(Clone)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub signer: Arc<dyn TokenSigner>,
}
