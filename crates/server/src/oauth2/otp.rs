//! Phone one-time passwords and password reset codes.
//!
//! Both live in the expiry cache under their own namespace. Verification is a
//! compare-and-delete, so a code is accepted at most once.

use crate::cache::{CacheKey, KvCache, Namespace};
use crate::config::TtlConfig;
use crate::error::SsoError;
use crate::oauth2::directory::Directory;
use crate::oauth2::password::{hash_password, validate_password_strength};
use crate::sms::SmsSender;
use crate::utils::{generate_numeric_code, is_valid_email, is_valid_phone, within};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

pub const CODE_DIGITS: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OtpPurpose {
    Signup,
    Login,
}

#[derive(Clone)]
pub struct OtpEngine {
    cache: Arc<dyn KvCache>,
    sms: Arc<dyn SmsSender>,
    directory: Directory,
    otp_ttl: Duration,
    reset_ttl: Duration,
    timeout: Duration,
}

fn check_phone(phone: &str) -> Result<(), SsoError> {
    if !is_valid_phone(phone) {
        return Err(SsoError::invalid_field("phone", "phone is not a valid number"));
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), SsoError> {
    if !is_valid_email(email) {
        return Err(SsoError::invalid_field("email", "email is not a valid address"));
    }
    Ok(())
}

impl OtpEngine {
    pub fn new(
        cache: Arc<dyn KvCache>,
        sms: Arc<dyn SmsSender>,
        directory: Directory,
        ttl: &TtlConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            sms,
            directory,
            otp_ttl: ttl.otp(),
            reset_ttl: ttl.reset_code(),
            timeout,
        }
    }

    /// Send a fresh code to `phone`, replacing any earlier one.
    #[tracing::instrument(skip(self))]
    pub async fn request_otp(&self, phone: &str, purpose: OtpPurpose) -> Result<(), SsoError> {
        check_phone(phone)?;
        let existing = self.directory.user_by_phone(phone).await?;
        match (purpose, existing) {
            (OtpPurpose::Signup, Some(_)) => {
                return Err(SsoError::DataExists("phone is already registered".into()));
            }
            (OtpPurpose::Login, None) => {
                return Err(SsoError::NoRecordFound("no account for this phone".into()));
            }
            (OtpPurpose::Login, Some(user)) if !user.is_active() => {
                return Err(SsoError::Unauthorized("user is not active".into()));
            }
            _ => {}
        }

        let code = generate_numeric_code(CODE_DIGITS)?;
        let key = CacheKey::new(Namespace::Otp, phone);
        within(
            self.timeout,
            "cache",
            self.cache.set(&key, code.clone(), self.otp_ttl),
        )
        .await?;
        self.sms
            .send(phone, &format!("Your verification code is {code}"))
            .await?;
        tracing::info!("otp sent");
        Ok(())
    }

    /// Consume the code if it is the latest one sent to `phone`.
    #[tracing::instrument(skip(self, code))]
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<(), SsoError> {
        if code.is_empty() {
            return Err(SsoError::invalid_field("otp", "otp is required"));
        }
        let key = CacheKey::new(Namespace::Otp, phone);
        let matched = within(self.timeout, "cache", self.cache.take_if_eq(&key, code)).await?;
        if !matched {
            return Err(SsoError::invalid_field("otp", "invalid or expired otp"));
        }
        Ok(())
    }

    /// Unknown emails succeed silently and do not reveal which accounts exist.
    #[tracing::instrument(skip(self))]
    pub async fn request_reset_code(&self, email: &str) -> Result<(), SsoError> {
        check_email(email)?;
        let Some(user) = self.directory.user_by_email(email).await? else {
            tracing::debug!("reset requested for unknown email");
            return Ok(());
        };
        let Some(phone) = user.phone.as_deref() else {
            tracing::warn!(user_id = %user.id, "reset requested for account without phone");
            return Ok(());
        };

        let key = CacheKey::new(Namespace::ResetCode, email);
        let candidate = generate_numeric_code(CODE_DIGITS)?;
        let code = within(
            self.timeout,
            "cache",
            self.cache.get_or_insert(&key, candidate, self.reset_ttl),
        )
        .await?;
        self.sms
            .send(phone, &format!("Your password reset code is {code}"))
            .await?;
        tracing::info!(user_id = %user.id, "reset code sent");
        Ok(())
    }

    #[tracing::instrument(skip(self, code, new_password))]
    pub async fn reset_password(
        &self,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> Result<(), SsoError> {
        check_email(email)?;
        if code.is_empty() {
            return Err(SsoError::invalid_field("code", "code is required"));
        }
        validate_password_strength(new_password)?;

        let key = CacheKey::new(Namespace::ResetCode, email);
        let matched = within(self.timeout, "cache", self.cache.take_if_eq(&key, code)).await?;
        if !matched {
            return Err(SsoError::invalid_field("code", "invalid or expired reset code"));
        }
        let user = self
            .directory
            .user_by_email(email)
            .await?
            .ok_or_else(|| SsoError::NoRecordFound("user not found".into()))?;
        let user_id = user.id.clone();
        self.directory
            .set_password_hash(user, hash_password(new_password)?)
            .await?;
        tracing::info!(user_id = %user_id, "password reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_parses_lowercase() {
        let p: OtpPurpose = serde_json::from_str("\"signup\"").unwrap();
        assert_eq!(p, OtpPurpose::Signup);
        assert!(serde_json::from_str::<OtpPurpose>("\"register\"").is_err());
    }

    #[test]
    fn phone_and_email_checks_name_the_field() {
        match check_phone("12") {
            Err(SsoError::InvalidUserInput { fields, .. }) => assert_eq!(fields[0].name, "phone"),
            other => panic!("unexpected {other:?}"),
        }
        match check_email("nope") {
            Err(SsoError::InvalidUserInput { fields, .. }) => assert_eq!(fields[0].name, "email"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
