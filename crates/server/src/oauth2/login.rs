//! First-party login and self registration.
//!
//! Users sign in with a password (by phone or email) or with a phone OTP, and
//! register after proving control of their phone. Tokens are issued to the
//! configured first-party client.

use crate::entity::user;
use crate::error::SsoError;
use crate::oauth2::directory::{Directory, NewUser};
use crate::oauth2::otp::OtpEngine;
use crate::oauth2::password::{hash_password, validate_password_strength, verify_password};
use crate::oauth2::token::{TokenResponse, TokenService};
use crate::utils::is_valid_email;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Either `password` or `otp` must be given
    pub password: Option<String>,
    pub otp: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct SignupRequest {
    #[serde(default)]
    pub first_name: String,
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    /// Code received through `GET /otp?purpose=signup`
    #[serde(default)]
    pub otp: String,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct LoginService {
    directory: Directory,
    otp: Arc<OtpEngine>,
    tokens: TokenService,
}

fn invalid_credentials() -> SsoError {
    SsoError::Unauthorized("invalid credentials".into())
}

impl LoginService {
    pub fn new(directory: Directory, otp: Arc<OtpEngine>, tokens: TokenService) -> Self {
        Self {
            directory,
            otp,
            tokens,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn login(&self, req: &LoginRequest) -> Result<TokenResponse, SsoError> {
        let phone = req.phone.as_deref().filter(|p| !p.is_empty());
        let email = req.email.as_deref().filter(|e| !e.is_empty());

        match (req.password.as_deref(), req.otp.as_deref()) {
            (Some(password), _) => {
                let user = match (phone, email) {
                    (Some(phone), _) => self.directory.user_by_phone(phone).await?,
                    (None, Some(email)) => self.directory.user_by_email(email).await?,
                    (None, None) => {
                        return Err(SsoError::invalid_field("phone", "phone or email is required"));
                    }
                };
                let user = user.ok_or_else(invalid_credentials)?;
                let hash = user.password_hash.as_deref().ok_or_else(invalid_credentials)?;
                if !verify_password(password, hash) {
                    tracing::warn!(user_id = %user.id, "password mismatch");
                    return Err(invalid_credentials());
                }
                self.tokens.issue_for_user(user).await
            }
            (None, Some(otp)) => {
                let phone =
                    phone.ok_or_else(|| SsoError::invalid_field("phone", "phone is required"))?;
                let user = self
                    .directory
                    .user_by_phone(phone)
                    .await?
                    .ok_or_else(|| SsoError::NoRecordFound("no account for this phone".into()))?;
                self.otp.verify_otp(phone, otp).await?;
                self.tokens.issue_for_user(user).await
            }
            (None, None) => Err(SsoError::invalid_field(
                "password",
                "password or otp is required",
            )),
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn signup(&self, req: &SignupRequest) -> Result<TokenResponse, SsoError> {
        for (field, value) in [
            ("first_name", &req.first_name),
            ("last_name", &req.last_name),
            ("phone", &req.phone),
            ("otp", &req.otp),
        ] {
            if value.trim().is_empty() {
                return Err(SsoError::invalid_field(field, format!("{field} is required")));
            }
        }
        let email = req.email.clone().filter(|e| !e.is_empty());
        if let Some(email) = &email
            && !is_valid_email(email)
        {
            return Err(SsoError::invalid_field("email", "email is not a valid address"));
        }
        let password_hash = match req.password.as_deref() {
            Some(password) => {
                validate_password_strength(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };

        self.otp.verify_otp(&req.phone, &req.otp).await?;
        let user: user::Model = self
            .directory
            .create_user(NewUser {
                first_name: req.first_name.trim().to_string(),
                middle_name: req.middle_name.clone(),
                last_name: req.last_name.trim().to_string(),
                email,
                phone: Some(req.phone.clone()),
                gender: req.gender.clone(),
                profile_picture: None,
                password_hash,
            })
            .await?;
        self.tokens.issue_for_user(user).await
    }
}
