//! Authorization codes, exchanged exactly once for tokens.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "auth_code")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub roles: String,
    /// OpenID Connect nonce
    pub nonce: Option<String>,
    /// PKCE code challenge
    pub code_challenge: Option<String>,
    /// PKCE code challenge method (S256 or plain)
    pub code_challenge_method: Option<String>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }

    pub fn roles_list(&self) -> Vec<String> {
        self.roles.split_whitespace().map(String::from).collect()
    }

    /// Verify PKCE code verifier against stored challenge
    pub fn verify_pkce(&self, code_verifier: Option<&str>) -> bool {
        match (&self.code_challenge, code_verifier) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(challenge), Some(verifier)) => {
                match self.code_challenge_method.as_deref().unwrap_or("plain") {
                    "S256" => {
                        use sha2::{Digest, Sha256};
                        let hash = Sha256::digest(verifier.as_bytes());
                        base64_url_encode(&hash) == *challenge
                    }
                    "plain" => verifier == challenge,
                    _ => false,
                }
            }
        }
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}
