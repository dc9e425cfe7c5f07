use color_eyre::eyre::WrapErr;
use sea_orm::Database;
use sso_server::AppResources;
use sso_server::api::start_webserver;
use sso_server::cache::MemoryCache;
use sso_server::config::load_config_or_panic;
use sso_server::oauth2::federation::HttpIdpClient;
use sso_server::oauth2::signer::JwtSigner;
use sso_server::oauth2::{Backends, OAuth2State};
use sso_server::sms::HttpSmsSender;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "sso_server=info,hyper=warn,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    initialize_tracing();

    // Load config
    let config = Arc::new(load_config_or_panic());
    let timeout = config.timeouts.external_call();

    // Set up SeaORM database connection
    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .wrap_err("Failed to connect to database")?,
    );

    let signer = Arc::new(
        JwtSigner::from_file(
            &config.keys.private_key_path,
            config.keys.key_id.clone(),
            config.issuer_url.clone(),
        )
        .wrap_err("Failed to load signing key")?,
    );
    tracing::info!(kid = %config.keys.key_id, issuer = %config.issuer_url, "signing key loaded");

    let cache = Arc::new(MemoryCache::new());
    let state = OAuth2State::new(
        config.clone(),
        Backends {
            db: db.clone(),
            cache,
            signer: signer.clone(),
            idp: Arc::new(HttpIdpClient::new(timeout)),
            sms: Arc::new(HttpSmsSender::new(config.sms.clone(), timeout)),
            auth_codes: None,
        },
    );

    let resources = AppResources { db, config, signer };
    start_webserver(state, resources).await?;
    Ok(())
}
