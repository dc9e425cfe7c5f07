//! SeaORM entities backing the authorization server.

pub mod auth_code;
pub mod auth_history;
pub mod client;
pub mod identity_provider;
pub mod ip_access_token;
pub mod refresh_token;
pub mod scope;
pub mod user;
pub mod user_role;
