use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeyConfig {
    /// PEM encoded RSA private key (PKCS#8 or PKCS#1).
    pub private_key_path: String,
    /// Published as `kid` in every token header.
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

/// Lifetimes in seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_consent_ttl")]
    pub consent: u64,
    #[serde(default = "default_auth_code_ttl")]
    pub auth_code: u64,
    #[serde(default = "default_otp_ttl")]
    pub otp: u64,
    #[serde(default = "default_reset_code_ttl")]
    pub reset_code: u64,
    #[serde(default = "default_access_token_ttl")]
    pub access_token: u64,
    #[serde(default = "default_access_token_ttl")]
    pub id_token: u64,
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            consent: default_consent_ttl(),
            auth_code: default_auth_code_ttl(),
            otp: default_otp_ttl(),
            reset_code: default_reset_code_ttl(),
            access_token: default_access_token_ttl(),
            id_token: default_access_token_ttl(),
            refresh_token: default_refresh_token_ttl(),
        }
    }
}

impl TtlConfig {
    pub fn consent(&self) -> Duration {
        Duration::from_secs(self.consent)
    }

    pub fn auth_code(&self) -> Duration {
        Duration::from_secs(self.auth_code)
    }

    pub fn otp(&self) -> Duration {
        Duration::from_secs(self.otp)
    }

    pub fn reset_code(&self) -> Duration {
        Duration::from_secs(self.reset_code)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for every cache, database and outbound HTTP call.
    #[serde(default = "default_external_call_ms")]
    pub external_call_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            external_call_ms: default_external_call_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn external_call(&self) -> Duration {
        Duration::from_millis(self.external_call_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SmsConfig {
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_sms_sender")]
    pub sender: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// `iss` of every token and base of the discovery document.
    pub issuer_url: String,
    /// Consent UI; `/authorize` redirects to `{frontend_url}/consent?consentId=`.
    pub frontend_url: String,
    /// Where browser flows land when no client redirect URI can be trusted yet.
    pub error_page_url: String,
    /// Client that tokens from `/login`, `/signup` and `/loginWithIP` are issued to.
    pub first_party_client_id: String,
    pub keys: KeyConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    pub sms: SmsConfig,
    /// Scope granted to tokens minted after a federated or first-party login.
    #[serde(default = "default_first_party_scope")]
    pub first_party_scope: String,
}

fn default_key_id() -> String {
    "sso-signing-key-1".to_string()
}

fn default_consent_ttl() -> u64 {
    600
}

fn default_auth_code_ttl() -> u64 {
    300
}

fn default_otp_ttl() -> u64 {
    300
}

fn default_reset_code_ttl() -> u64 {
    900
}

fn default_access_token_ttl() -> u64 {
    900 // 15 minutes
}

fn default_refresh_token_ttl() -> u64 {
    86400 * 30
}

fn default_external_call_ms() -> u64 {
    5000
}

fn default_sms_sender() -> String {
    "SSO".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_first_party_scope() -> String {
    "openid profile email phone".to_string()
}

impl AppConfig {
    /// Rejects configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.private_key_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "keys.private_key_path must be set".into(),
            ));
        }
        if self.first_party_client_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "first_party_client_id must be set".into(),
            ));
        }
        for (name, url) in [
            ("issuer_url", &self.issuer_url),
            ("frontend_url", &self.frontend_url),
            ("error_page_url", &self.error_page_url),
            ("sms.endpoint", &self.sms.endpoint),
        ] {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Validation(format!("{name} is not a valid URL: {e}")))?;
        }
        let ttl = &self.ttl;
        if [
            ttl.consent,
            ttl.auth_code,
            ttl.otp,
            ttl.reset_code,
            ttl.access_token,
            ttl.id_token,
            ttl.refresh_token,
        ]
        .contains(&0)
        {
            return Err(ConfigError::Validation("ttl values must be > 0".into()));
        }
        if self.timeouts.external_call_ms == 0 {
            return Err(ConfigError::Validation(
                "timeouts.external_call_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any variable matching the key path separated by double underscores
/// (e.g. `TTL__CONSENT`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config.yaml")
}

pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
database_url: "sqlite::memory:"
issuer_url: "https://sso.example.com"
frontend_url: "https://accounts.example.com"
error_page_url: "https://accounts.example.com/error"
first_party_client_id: "sso-web"
keys:
  private_key_path: "/etc/sso/signing.pem"
sms:
  endpoint: "https://sms.example.com/send"
  api_key: "key"
"#;

    fn parse(yaml: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(YAML);
        assert_eq!(cfg.ttl.access_token, 900);
        assert_eq!(cfg.ttl.auth_code, 300);
        assert_eq!(cfg.keys.key_id, "sso-signing-key-1");
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut cfg = parse(YAML);
        cfg.ttl.otp = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn bad_url_is_rejected() {
        let mut cfg = parse(YAML);
        cfg.error_page_url = "not a url".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("error_page_url"));
    }
}
