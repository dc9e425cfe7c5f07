//! Outbound SMS delivery for OTP and reset codes.

use crate::config::SmsConfig;
use crate::error::SsoError;
use crate::utils::within;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, phone: &str, message: &str) -> Result<(), SsoError>;
}

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    from: &'a str,
    to: &'a str,
    message: &'a str,
}

/// Posts messages as JSON to an HTTP gateway, authenticated with a bearer API key.
#[derive(Clone, Debug)]
pub struct HttpSmsSender {
    http: reqwest::Client,
    config: SmsConfig,
    timeout: Duration,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            timeout,
        }
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    #[tracing::instrument(skip(self, message))]
    async fn send(&self, phone: &str, message: &str) -> Result<(), SsoError> {
        let request = self
            .http
            .post(&self.config.endpoint)
            .header("User-Agent", concat!("sso-server/", env!("CARGO_PKG_VERSION")))
            .bearer_auth(&self.config.api_key)
            .json(&SmsRequest {
                from: &self.config.sender,
                to: phone,
                message,
            })
            .send();
        let response = within(self.timeout, "sms gateway", request).await?;
        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "sms gateway rejected message");
            return Err(SsoError::Internal(format!(
                "sms gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sender(server: &MockServer) -> HttpSmsSender {
        HttpSmsSender::new(
            SmsConfig {
                endpoint: format!("{}/send", server.uri()),
                api_key: "sms-key".into(),
                sender: "SSO".into(),
            },
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn posts_message_to_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer sms-key"))
            .and(body_json(serde_json::json!({
                "from": "SSO",
                "to": "0911223344",
                "message": "hello",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        sender(&server).send("0911223344", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn gateway_failure_is_internal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let result = sender(&server).send("0911223344", "hello").await;
        assert!(matches!(result, Err(SsoError::Internal(_))));
    }
}
