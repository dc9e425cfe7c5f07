//! Registered OAuth2 clients.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "client")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Human-readable client name
    pub name: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    /// Argon2id hash of the client secret
    #[serde(skip_serializing)]
    pub secret_hash: String,
    /// JSON array of allowed redirect URIs
    pub redirect_uris: String,
    /// Space-separated list of allowed scopes; empty allows every registered scope
    pub scopes: String,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse redirect URIs from JSON string
    pub fn redirect_uris_list(&self) -> Vec<String> {
        serde_json::from_str(&self.redirect_uris).unwrap_or_default()
    }

    /// Parse scopes from space-separated string
    pub fn scopes_list(&self) -> Vec<String> {
        self.scopes.split_whitespace().map(String::from).collect()
    }

    /// Exact match against the registered redirect URIs
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris_list()
            .iter()
            .any(|allowed| allowed == uri)
    }

    pub fn is_scope_allowed(&self, scope: &str) -> bool {
        let allowed = self.scopes_list();
        allowed.is_empty() || allowed.iter().any(|s| s == scope)
    }

    pub fn is_active(&self) -> bool {
        self.status == super::user::STATUS_ACTIVE
    }
}
