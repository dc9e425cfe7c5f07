//! Shared fixtures for the integration tests.
//!
//! Every test gets its own in-memory SQLite database migrated with the real
//! schema, a fresh expiry cache and an SMS sender that records instead of
//! sending.

#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use migration::{Migrator, MigratorTrait};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, Database, DatabaseConnection};
use sso_server::AppResources;
use sso_server::api::app;
use sso_server::cache::MemoryCache;
use sso_server::config::{AppConfig, KeyConfig, SmsConfig, TimeoutConfig, TtlConfig};
use sso_server::entity::{client, identity_provider, scope, user, user_role};
use sso_server::error::SsoError;
use sso_server::oauth2::federation::HttpIdpClient;
use sso_server::oauth2::hash_password;
use sso_server::oauth2::signer::{AccessClaims, JwtSigner, TokenSigner};
use sso_server::oauth2::store::AuthCodeStore;
use sso_server::oauth2::{Backends, OAuth2State};
use sso_server::sms::SmsSender;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use time::OffsetDateTime;

pub const ISSUER: &str = "https://sso.test";
pub const ERROR_PAGE: &str = "https://accounts.test/error";
pub const CLIENT_ID: &str = "client-1";
pub const CLIENT_SECRET: &str = "client-secret";
pub const REDIRECT_URI: &str = "https://client.example.com/cb";
pub const FIRST_PARTY_CLIENT: &str = "sso-web";

pub const USER_ID: &str = "user-1";
pub const USER_PHONE: &str = "0911223344";
pub const USER_EMAIL: &str = "abebe@example.com";
pub const USER_PASSWORD: &str = "Passw0rd1";

/// One RSA key per test binary; generation is slow.
pub fn test_key_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
            .expect("generate RSA key")
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode RSA key")
            .to_string()
    })
}

pub fn test_signer() -> Arc<JwtSigner> {
    Arc::new(JwtSigner::from_pem(test_key_pem(), "test-key", ISSUER).expect("signer"))
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        listen_addr: "127.0.0.1:0".into(),
        issuer_url: ISSUER.into(),
        frontend_url: "https://accounts.test".into(),
        error_page_url: ERROR_PAGE.into(),
        first_party_client_id: FIRST_PARTY_CLIENT.into(),
        keys: KeyConfig {
            private_key_path: "unused.pem".into(),
            key_id: "test-key".into(),
        },
        ttl: TtlConfig::default(),
        timeouts: TimeoutConfig {
            external_call_ms: 2000,
        },
        sms: SmsConfig {
            endpoint: "https://sms.test/send".into(),
            api_key: "test-key".into(),
            sender: "SSO".into(),
        },
        first_party_scope: "openid profile email phone".into(),
    }
}

/// SMS sender that keeps every message in memory.
#[derive(Default)]
pub struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSms {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// The six digit code of the latest message sent to `phone`.
    pub fn last_code(&self, phone: &str) -> Option<String> {
        self.messages()
            .into_iter()
            .rev()
            .find(|(to, _)| to == phone)
            .and_then(|(_, message)| message.rsplit(' ').next().map(String::from))
    }
}

#[async_trait]
impl SmsSender for RecordingSms {
    async fn send(&self, phone: &str, message: &str) -> Result<(), SsoError> {
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), message.to_string()));
        Ok(())
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: OAuth2State,
    pub db: Arc<DatabaseConnection>,
    pub sms: Arc<RecordingSms>,
    pub signer: Arc<JwtSigner>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_auth_codes(None).await
    }

    pub async fn with_auth_codes(auth_codes: Option<Arc<dyn AuthCodeStore>>) -> Self {
        let db = Arc::new(Database::connect("sqlite::memory:").await.expect("connect"));
        Migrator::up(db.as_ref(), None).await.expect("migrate");
        seed(db.as_ref()).await;

        let config = Arc::new(test_config());
        let signer = test_signer();
        let sms = Arc::new(RecordingSms::default());
        let state = OAuth2State::new(
            config.clone(),
            Backends {
                db: db.clone(),
                cache: Arc::new(MemoryCache::new()),
                signer: signer.clone(),
                idp: Arc::new(HttpIdpClient::new(Duration::from_secs(2))),
                sms: sms.clone(),
                auth_codes,
            },
        );
        let resources = AppResources {
            db: db.clone(),
            config,
            signer: signer.clone(),
        };
        let server = TestServer::new(app(state.clone(), resources)).expect("test server");

        Self {
            server,
            state,
            db,
            sms,
            signer,
        }
    }

    /// Access token for `user_id` as if issued to the first-party client.
    pub fn bearer(&self, user_id: &str, scope: &str) -> String {
        self.bearer_for(user_id, FIRST_PARTY_CLIENT, scope)
    }

    /// Access token for `user_id` as if issued to `client_id`.
    pub fn bearer_for(&self, user_id: &str, client_id: &str, scope: &str) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.signer
            .sign_access(&AccessClaims {
                iss: ISSUER.into(),
                sub: user_id.into(),
                aud: client_id.into(),
                exp: now + 900,
                nbf: now,
                iat: now,
                jti: uuid::Uuid::new_v4().to_string(),
                client_id: client_id.into(),
                roles: vec!["user".into()],
                scope: scope.into(),
            })
            .expect("sign access token")
    }
}

async fn seed(db: &DatabaseConnection) {
    let now = OffsetDateTime::now_utc();

    for (name, description, status) in [
        ("openid", "Sign you in", "active"),
        ("profile", "Your name, gender and picture", "active"),
        ("email", "Your email address", "active"),
        ("phone", "Your phone number", "active"),
        ("payments", "Make payments on your behalf", "inactive"),
    ] {
        scope::ActiveModel {
            name: Set(name.into()),
            description: Set(description.into()),
            status: Set(status.into()),
        }
        .insert(db)
        .await
        .expect("seed scope");
    }

    for (id, name) in [(CLIENT_ID, "Example Client"), (FIRST_PARTY_CLIENT, "SSO Web")] {
        client::ActiveModel {
            id: Set(id.into()),
            name: Set(name.into()),
            description: Set(Some(format!("{name} application"))),
            logo_url: Set(None),
            secret_hash: Set(hash_password(CLIENT_SECRET).expect("hash")),
            redirect_uris: Set(serde_json::json!([REDIRECT_URI]).to_string()),
            scopes: Set(String::new()),
            status: Set("active".into()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .expect("seed client");
    }

    insert_user(
        db,
        USER_ID,
        Some(USER_PHONE),
        Some(USER_EMAIL),
        Some(USER_PASSWORD),
        user::STATUS_ACTIVE,
    )
    .await;
    user_role::ActiveModel {
        user_id: Set(USER_ID.into()),
        role: Set("user".into()),
    }
    .insert(db)
    .await
    .expect("seed role");
}

pub async fn insert_user(
    db: &DatabaseConnection,
    id: &str,
    phone: Option<&str>,
    email: Option<&str>,
    password: Option<&str>,
    status: &str,
) -> user::Model {
    let now = OffsetDateTime::now_utc();
    user::ActiveModel {
        id: Set(id.into()),
        first_name: Set("Abebe".into()),
        middle_name: Set(Some("Kebede".into())),
        last_name: Set("Bikila".into()),
        email: Set(email.map(String::from)),
        phone: Set(phone.map(String::from)),
        gender: Set(Some("male".into())),
        profile_picture: Set(None),
        password_hash: Set(password.map(|p| hash_password(p).expect("hash"))),
        status: Set(status.into()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed user")
}

/// Identity provider whose endpoints live under `base_url`.
pub async fn insert_identity_provider(db: &DatabaseConnection, id: &str, base_url: &str) {
    let now = OffsetDateTime::now_utc();
    identity_provider::ActiveModel {
        id: Set(id.into()),
        name: Set("Example IdP".into()),
        client_id: Set("sso-at-idp".into()),
        client_secret: Set("idp-secret".into()),
        redirect_uri: Set("https://accounts.test/idp/callback".into()),
        authorization_endpoint: Set(format!("{base_url}/authorize")),
        token_endpoint: Set(format!("{base_url}/token")),
        user_info_endpoint: Set(format!("{base_url}/userinfo")),
        logo_uri: Set(None),
        status: Set("active".into()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed identity provider");
}

/// Query parameter `name` of a redirect `Location`, looking in the query and the fragment.
pub fn location_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    let from_query = url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned());
    from_query.or_else(|| {
        url::form_urlencoded::parse(url.fragment()?.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    })
}
