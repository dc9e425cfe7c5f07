use config::Config;
use sea_orm_migration::prelude::*;
use std::env;

/// Runs the sea-orm migration CLI against `DATABASE_URL`, falling back to
/// `database_url` from the server's `config.yaml`.
#[tokio::main]
async fn main() {
    if env::var("DATABASE_URL").is_err() {
        let settings = Config::builder()
            .add_source(config::File::with_name("config.yaml").required(false))
            .add_source(config::Environment::default().separator("__"))
            .build();
        match settings.and_then(|s| s.get_string("database_url")) {
            Ok(url) => env::set_var("DATABASE_URL", url),
            Err(e) => eprintln!("database_url not found in config.yaml: {e}"),
        }
    }
    cli::run_cli(migration::Migrator).await;
}
