//! OAuth2 HTTP endpoints.
//!
//! Browser-facing endpoints (`/authorize`, `/approval`) always answer with a
//! 302: to the client's redirect URI once it has been validated, otherwise to
//! the configured error page. API endpoints answer with JSON and use
//! [`SsoError`] for failures.

use crate::api::auth::{BearerAuth, FirstPartyAuth};
use crate::config::AppConfig;
use crate::error::{ErrorResponse, SsoError};
use crate::oauth2::consent::{
    AuthorizationRequestParam, ConsentData, ConsentDecision, RESPONSE_TYPE_TOKEN,
};
use crate::oauth2::login::{LoginRequest, SignupRequest};
use crate::oauth2::otp::OtpPurpose;
use crate::oauth2::signer::Jwks;
use crate::oauth2::token::{ClientCredentials, TokenResponse};
use crate::oauth2::{ACCOUNT_TAG, OAUTH2_TAG, state::OAuth2State};
use axum::{
    Form, Json,
    extract::{
        Path, Query, State,
        rejection::{FormRejection, JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates the OAuth2 router.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize))
        .routes(routes!(consent_details))
        .routes(routes!(approval))
        .routes(routes!(token))
        .routes(routes!(revoke_client))
        .routes(routes!(userinfo))
        .routes(routes!(login_with_ip))
        .routes(routes!(request_otp))
        .routes(routes!(request_reset_code))
        .routes(routes!(reset_password))
        .routes(routes!(login))
        .routes(routes!(signup))
        .routes(routes!(logout))
        .routes(routes!(openid_configuration))
        .routes(routes!(jwks))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct ApprovalParams {
    /// Consent id received from `/authorize`
    #[serde(rename = "consentId", default)]
    pub consent_id: String,
    /// `true` to approve, `false` to deny
    #[serde(default)]
    pub approved: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeClientRequest {
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginWithIpRequest {
    /// Identity provider id
    #[serde(default)]
    pub ip_id: String,
    /// Authorization code issued by the provider
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OtpParams {
    #[serde(default)]
    pub phone: String,
    /// `signup` or `login`
    pub purpose: Option<OtpPurpose>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ResetCodeParams {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub revocation_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

// =============================================================================
// Endpoints
// =============================================================================

/// OAuth2 Authorization endpoint.
#[tracing::instrument(skip_all, fields(client_id = tracing::field::Empty))]
#[utoipa::path(
    get,
    path = "/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Start an authorization request",
    description = "Validates the authorization request and stores it as a pending consent. \
                   The browser is redirected to the consent UI with `consentId`.\n\n\
                   On failure the browser is redirected to the client's redirect_uri when it is \
                   registered for the client, otherwise to the error page, with `error`, \
                   `error_description` and `state`.\n\n\
                   **PKCE:** pass `code_challenge` and `code_challenge_method` (`S256` recommended).",
    params(AuthorizationRequestParam),
    responses(
        (status = 302, description = "Redirect to the consent UI, or an error redirect"),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    params: Result<Query<AuthorizationRequestParam>, QueryRejection>,
) -> Response {
    let params = match params {
        Ok(Query(params)) => params,
        Err(e) => {
            tracing::info!(error = %e.body_text(), "malformed authorization request");
            return error_page(&state.config, &SsoError::invalid_input(e.body_text()));
        }
    };
    tracing::Span::current().record("client_id", params.client_id.as_str());
    match state.consent.authorize(&params).await {
        Ok(consent_id) => {
            let consent_page = format!(
                "{}/consent",
                state.config.frontend_url.trim_end_matches('/')
            );
            match with_query(&consent_page, &[("consentId", consent_id.as_str())]) {
                Some(url) => found(&url),
                None => error_page(
                    &state.config,
                    &SsoError::Internal("frontend_url is not a valid URL".into()),
                ),
            }
        }
        Err(e) => {
            tracing::info!(error = %e, "authorization request rejected");
            let target = state.consent.trusted_redirect(&params).await;
            let client_state = Some(params.state.as_str()).filter(|s| !s.is_empty());
            error_redirect(
                &state.config,
                target.as_deref(),
                e.message(),
                &e.public_description(),
                client_state,
            )
        }
    }
}

/// Consent details for the consent UI.
#[tracing::instrument(skip(state, user))]
#[utoipa::path(
    get,
    path = "/consent/{consent_id}",
    tag = OAUTH2_TAG,
    operation_id = "Get Consent",
    summary = "Fetch a pending consent",
    description = "Returns the consent together with the requesting client, the resolved scopes \
                   with their descriptions and the signed-in user's profile.",
    params(("consent_id" = String, Path, description = "Consent id received from `/authorize`.")),
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Consent details", body = ConsentData),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
        (status = 404, description = "Consent not found or expired", body = ErrorResponse),
    )
)]
pub async fn consent_details(
    State(state): State<OAuth2State>,
    FirstPartyAuth(user): FirstPartyAuth,
    Path(consent_id): Path<String>,
) -> Result<Json<ConsentData>, SsoError> {
    let data = state
        .consent
        .get_consent_by_id(&consent_id, &user.user_id)
        .await?;
    Ok(Json(data))
}

/// Approve or deny a consent.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    method(get, post),
    path = "/approval",
    tag = OAUTH2_TAG,
    operation_id = "Consent Approval",
    summary = "Record the user's decision and redirect to the client",
    description = "Decides a pending consent exactly once.\n\n\
                   - Approved `code` requests redirect to the client with `code` and `state`.\n\
                   - Approved `token` requests redirect with the access token in the URL fragment.\n\
                   - Denied requests redirect with `error=access_denied`.\n\n\
                   Failures before the consent is known redirect to the error page.\n\n\
                   `POST` also accepts the parameters as a form body.",
    params(ApprovalParams),
    security(("bearer_auth" = [])),
    responses(
        (status = 302, description = "Redirect to the client or to the error page"),
    )
)]
pub async fn approval(
    State(state): State<OAuth2State>,
    auth: Result<FirstPartyAuth, SsoError>,
    query: Result<Query<ApprovalParams>, QueryRejection>,
    form: Result<Form<ApprovalParams>, FormRejection>,
) -> Response {
    let user = match auth {
        Ok(FirstPartyAuth(user)) => user,
        Err(e) => return error_page(&state.config, &e),
    };
    let params = match approval_params(query, form) {
        Ok(params) => params,
        Err(e) => return error_page(&state.config, &e),
    };
    if params.consent_id.is_empty() {
        return error_page(
            &state.config,
            &SsoError::invalid_field("consentId", "consentId is required"),
        );
    }

    let consent = match state
        .consent
        .approval(&params.consent_id, &user.user_id, params.approved)
        .await
    {
        Ok(consent) => consent,
        Err(e) => return error_page(&state.config, &e),
    };

    let redirect_uri = consent.request.redirect_uri.as_str();
    let client_state = Some(consent.request.state.as_str()).filter(|s| !s.is_empty());

    if consent.approved == ConsentDecision::Denied {
        if let Err(e) = state.consent.store().remove(&consent.id).await {
            tracing::warn!(error = %e, "failed to remove denied consent");
        }
        return error_redirect(
            &state.config,
            Some(redirect_uri),
            "access_denied",
            "the user denied the request",
            client_state,
        );
    }

    if consent.request.response_type == RESPONSE_TYPE_TOKEN {
        let issued = state.tokens.issue_implicit(&consent).await;
        if let Err(e) = state.consent.store().remove(&consent.id).await {
            tracing::warn!(error = %e, "failed to remove consent after implicit grant");
        }
        return match issued {
            Ok(tokens) => match with_fragment(redirect_uri, &tokens) {
                Some(url) => found(&url),
                None => error_page(
                    &state.config,
                    &SsoError::Internal("stored redirect_uri is invalid".into()),
                ),
            },
            Err(e) => error_redirect(
                &state.config,
                Some(redirect_uri),
                e.message(),
                &e.public_description(),
                client_state,
            ),
        };
    }

    match state.auth_codes.issue(&consent).await {
        Ok((code, code_state)) => {
            let mut pairs = vec![("code", code.as_str())];
            if !code_state.is_empty() {
                pairs.push(("state", code_state.as_str()));
            }
            match with_query(redirect_uri, &pairs) {
                Some(url) => found(&url),
                None => error_page(
                    &state.config,
                    &SsoError::Internal("stored redirect_uri is invalid".into()),
                ),
            }
        }
        Err(e) => error_redirect(
            &state.config,
            Some(redirect_uri),
            e.message(),
            &e.public_description(),
            client_state,
        ),
    }
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip(state, headers, form))]
#[utoipa::path(
    post,
    path = "/oauth/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange an authorization code or refresh token for tokens",
    description = "**Supported grant types:**\n\
                   - `authorization_code`: redeems a code exactly once; `redirect_uri` must match and \
                   `code_verifier` is required when a PKCE challenge was bound\n\
                   - `refresh_token`: rotates the refresh token; the old one stops working\n\n\
                   **Client authentication:** HTTP Basic, or `client_id`/`client_secret` form fields.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid request or grant", body = ErrorResponse),
        (status = 401, description = "Invalid client credentials", body = ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response, SsoError> {
    let Form(params) = form.map_err(|e| SsoError::invalid_input(e.body_text()))?;
    let creds = extract_client_credentials(&headers, &params);

    let tokens = match params.grant_type.as_deref() {
        Some("authorization_code") => {
            state
                .exchange
                .exchange_code(
                    &creds,
                    params.code.as_deref().unwrap_or_default(),
                    params.redirect_uri.as_deref(),
                    params.code_verifier.as_deref(),
                )
                .await?
        }
        Some("refresh_token") => {
            state
                .exchange
                .refresh(
                    &creds,
                    params.refresh_token.as_deref().unwrap_or_default(),
                    params.scope.as_deref(),
                )
                .await?
        }
        Some(other) => {
            return Err(SsoError::invalid_field(
                "grant_type",
                format!("unsupported grant_type {other}"),
            ));
        }
        None => return Err(SsoError::invalid_field("grant_type", "grant_type is required")),
    };

    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(tokens),
    )
        .into_response())
}

/// Revoke every grant the caller gave a client.
#[tracing::instrument(skip(state, user, body))]
#[utoipa::path(
    post,
    path = "/oauth/revokeClient",
    tag = OAUTH2_TAG,
    operation_id = "Revoke Client",
    summary = "Revoke a client's access",
    description = "Deletes all refresh tokens the signed-in user issued to `client_id` and records \
                   the revocation. Repeating the call is harmless.",
    request_body = RevokeClientRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Client access revoked"),
        (status = 400, description = "Missing client_id", body = ErrorResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
    )
)]
pub async fn revoke_client(
    State(state): State<OAuth2State>,
    FirstPartyAuth(user): FirstPartyAuth,
    body: Result<Json<RevokeClientRequest>, JsonRejection>,
) -> Result<StatusCode, SsoError> {
    let req = json_body(body)?;
    state
        .exchange
        .revoke_client(&user.user_id, &req.client_id)
        .await?;
    Ok(StatusCode::OK)
}

/// OpenID Connect UserInfo endpoint.
#[tracing::instrument(skip(state, user))]
#[utoipa::path(
    get,
    path = "/oauth/userinfo",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Connect UserInfo",
    summary = "Get the authenticated user's claims",
    description = "Requires an access token carrying the `openid` scope.\n\n\
                   **Returned claims depend on granted scopes:**\n\
                   - `openid`: `sub`\n\
                   - `profile`: `name`, `given_name`, `middle_name`, `family_name`, `gender`, `picture`\n\
                   - `email`: `email`\n\
                   - `phone`: `phone_number`",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "User claims", body = UserInfoResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
    )
)]
pub async fn userinfo(
    State(state): State<OAuth2State>,
    BearerAuth(user): BearerAuth,
) -> Result<Json<UserInfoResponse>, SsoError> {
    if !user.has_scope("openid") {
        return Err(SsoError::Unauthorized(
            "token does not carry the openid scope".into(),
        ));
    }
    let profile = state
        .directory
        .user(&user.user_id)
        .await?
        .ok_or_else(|| SsoError::Unauthorized("user no longer exists".into()))?;

    let mut response = UserInfoResponse {
        sub: profile.id.clone(),
        ..Default::default()
    };
    if user.has_scope("profile") {
        response.name = Some(profile.full_name());
        response.given_name = Some(profile.first_name);
        response.middle_name = profile.middle_name;
        response.family_name = Some(profile.last_name);
        response.gender = profile.gender;
        response.picture = profile.profile_picture;
    }
    if user.has_scope("email") {
        response.email = profile.email;
    }
    if user.has_scope("phone") {
        response.phone_number = profile.phone;
    }
    Ok(Json(response))
}

/// Federated login.
#[tracing::instrument(skip(state, body))]
#[utoipa::path(
    post,
    path = "/loginWithIP",
    tag = ACCOUNT_TAG,
    operation_id = "Login With Identity Provider",
    summary = "Sign in with an external identity provider",
    description = "Exchanges the provider's authorization code, fetches the provider's userinfo, \
                   links or creates the local account and returns first-party tokens.",
    request_body = LoginWithIpRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Unknown identity provider or missing code", body = ErrorResponse),
        (status = 401, description = "The provider rejected the code", body = ErrorResponse),
    )
)]
pub async fn login_with_ip(
    State(state): State<OAuth2State>,
    body: Result<Json<LoginWithIpRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, SsoError> {
    let req = json_body(body)?;
    let tokens = state
        .federation
        .login_with_identity_provider(&req.ip_id, &req.code)
        .await?;
    Ok(Json(tokens))
}

/// Request a phone OTP.
#[tracing::instrument(skip(state, params))]
#[utoipa::path(
    get,
    path = "/otp",
    tag = ACCOUNT_TAG,
    operation_id = "Request OTP",
    summary = "Send a one-time password by SMS",
    description = "For `purpose=signup` the phone must not be registered yet; for `purpose=login` \
                   it must belong to an active account. A new request replaces the previous code.",
    params(OtpParams),
    responses(
        (status = 200, description = "Code sent", body = bool, example = true),
        (status = 400, description = "Invalid phone or purpose, or phone already registered", body = ErrorResponse),
        (status = 404, description = "No account for this phone", body = ErrorResponse),
    )
)]
pub async fn request_otp(
    State(state): State<OAuth2State>,
    params: Result<Query<OtpParams>, QueryRejection>,
) -> Result<Json<bool>, SsoError> {
    let Query(params) = params.map_err(|e| SsoError::invalid_input(e.body_text()))?;
    let purpose = params
        .purpose
        .ok_or_else(|| SsoError::invalid_field("purpose", "purpose is required"))?;
    state.otp.request_otp(&params.phone, purpose).await?;
    Ok(Json(true))
}

/// Request a password reset code.
#[tracing::instrument(skip(state, params))]
#[utoipa::path(
    get,
    path = "/resetCode",
    tag = ACCOUNT_TAG,
    operation_id = "Request Reset Code",
    summary = "Send a password reset code",
    description = "Sends a reset code to the phone of the account with this email. A pending code \
                   is re-sent instead of replaced. Unknown emails also answer `true`.",
    params(ResetCodeParams),
    responses(
        (status = 200, description = "Request accepted", body = bool, example = true),
        (status = 400, description = "Invalid email", body = ErrorResponse),
    )
)]
pub async fn request_reset_code(
    State(state): State<OAuth2State>,
    params: Result<Query<ResetCodeParams>, QueryRejection>,
) -> Result<Json<bool>, SsoError> {
    let Query(params) = params.map_err(|e| SsoError::invalid_input(e.body_text()))?;
    state.otp.request_reset_code(&params.email).await?;
    Ok(Json(true))
}

/// Reset a password.
#[tracing::instrument(skip(state, body))]
#[utoipa::path(
    post,
    path = "/resetPassword",
    tag = ACCOUNT_TAG,
    operation_id = "Reset Password",
    summary = "Set a new password with a reset code",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = bool, example = true),
        (status = 400, description = "Wrong code or weak password", body = ErrorResponse),
        (status = 404, description = "Unknown account", body = ErrorResponse),
    )
)]
pub async fn reset_password(
    State(state): State<OAuth2State>,
    body: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> Result<Json<bool>, SsoError> {
    let req = json_body(body)?;
    state
        .otp
        .reset_password(&req.email, &req.code, &req.password)
        .await?;
    Ok(Json(true))
}

/// First-party login.
#[tracing::instrument(skip(state, body))]
#[utoipa::path(
    post,
    path = "/login",
    tag = ACCOUNT_TAG,
    operation_id = "Login",
    summary = "Sign in with a password or an OTP",
    description = "Password login accepts a phone or an email. OTP login needs the phone and a \
                   code from `GET /otp?purpose=login`.",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Missing fields or wrong OTP", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 404, description = "No account for this phone", body = ErrorResponse),
    )
)]
pub async fn login(
    State(state): State<OAuth2State>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, SsoError> {
    let req = json_body(body)?;
    Ok(Json(state.login.login(&req).await?))
}

/// Self registration.
#[tracing::instrument(skip(state, body))]
#[utoipa::path(
    post,
    path = "/signup",
    tag = ACCOUNT_TAG,
    operation_id = "Signup",
    summary = "Create an account with a verified phone",
    request_body = SignupRequest,
    responses(
        (status = 200, description = "Account created and tokens issued", body = TokenResponse),
        (status = 400, description = "Missing fields, wrong OTP, or already registered", body = ErrorResponse),
    )
)]
pub async fn signup(
    State(state): State<OAuth2State>,
    body: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, SsoError> {
    let req = json_body(body)?;
    Ok(Json(state.login.signup(&req).await?))
}

/// Log out.
#[tracing::instrument(skip(state, user, body))]
#[utoipa::path(
    post,
    path = "/logout",
    tag = ACCOUNT_TAG,
    operation_id = "Logout",
    summary = "Delete the caller's refresh token",
    request_body = LogoutRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Logged out"),
        (status = 400, description = "Missing refresh_token", body = ErrorResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
    )
)]
pub async fn logout(
    State(state): State<OAuth2State>,
    FirstPartyAuth(user): FirstPartyAuth,
    body: Result<Json<LogoutRequest>, JsonRejection>,
) -> Result<StatusCode, SsoError> {
    let req = json_body(body)?;
    state
        .exchange
        .logout(&user.user_id, &req.refresh_token)
        .await?;
    Ok(StatusCode::OK)
}

/// OpenID Connect Discovery document.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Connect Discovery",
    summary = "OpenID Connect Discovery document",
    responses(
        (status = 200, description = "OpenID Connect configuration document", body = OpenIdConfiguration),
    )
)]
pub async fn openid_configuration(State(state): State<OAuth2State>) -> Json<OpenIdConfiguration> {
    let issuer = state.config.issuer_url.trim_end_matches('/');
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    Json(OpenIdConfiguration {
        issuer: issuer.to_string(),
        authorization_endpoint: format!("{issuer}/authorize"),
        token_endpoint: format!("{issuer}/oauth/token"),
        userinfo_endpoint: format!("{issuer}/oauth/userinfo"),
        revocation_endpoint: format!("{issuer}/oauth/revokeClient"),
        jwks_uri: format!("{issuer}/.well-known/jwks.json"),
        response_types_supported: strings(&["code", "token"]),
        grant_types_supported: strings(&["authorization_code", "refresh_token", "implicit"]),
        subject_types_supported: strings(&["public"]),
        id_token_signing_alg_values_supported: strings(&["PS512"]),
        scopes_supported: strings(&["openid", "profile", "email", "phone"]),
        claims_supported: strings(&[
            "sub",
            "name",
            "given_name",
            "middle_name",
            "family_name",
            "gender",
            "picture",
            "email",
            "phone_number",
            "nonce",
        ]),
        token_endpoint_auth_methods_supported: strings(&[
            "client_secret_basic",
            "client_secret_post",
        ]),
        code_challenge_methods_supported: strings(&["S256", "plain"]),
    })
}

/// Public signing keys.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = OAUTH2_TAG,
    operation_id = "JSON Web Key Set",
    summary = "Keys that verify access and ID tokens",
    responses(
        (status = 200, description = "JWKS document", body = Jwks),
    )
)]
pub async fn jwks(State(state): State<OAuth2State>) -> Json<Jwks> {
    Json(state.signer.jwks())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn extract_client_credentials(headers: &HeaderMap, params: &TokenRequest) -> ClientCredentials {
    // Try Basic auth first
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        && let Ok(decoded) =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, auth.trim())
        && let Ok(creds) = String::from_utf8(decoded)
        && let Some((id, secret)) = creds.split_once(':')
    {
        return ClientCredentials {
            client_id: urlencoding::decode(id)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| id.to_string()),
            client_secret: Some(
                urlencoding::decode(secret)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| secret.to_string()),
            ),
        };
    }

    // Fall back to form body
    ClientCredentials {
        client_id: params.client_id.clone().unwrap_or_default(),
        client_secret: params.client_secret.clone(),
    }
}

/// Form body when one was sent with a consent id, otherwise the query string.
fn approval_params(
    query: Result<Query<ApprovalParams>, QueryRejection>,
    form: Result<Form<ApprovalParams>, FormRejection>,
) -> Result<ApprovalParams, SsoError> {
    match form {
        Ok(Form(params)) if !params.consent_id.is_empty() => Ok(params),
        Ok(_) | Err(FormRejection::InvalidFormContentType(_)) => query
            .map(|Query(params)| params)
            .map_err(|e| SsoError::invalid_input(e.body_text())),
        Err(e) => Err(SsoError::invalid_input(e.body_text())),
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, SsoError> {
    body.map(|Json(v)| v)
        .map_err(|e| SsoError::invalid_input(e.body_text()))
}

/// 302 with a `Location` header.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> Option<String> {
    let mut url = url::Url::parse(base).ok()?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs {
            query.append_pair(key, value);
        }
    }
    Some(url.into())
}

fn with_fragment(base: &str, tokens: &TokenResponse) -> Option<String> {
    let mut url = url::Url::parse(base).ok()?;
    let expires_in = tokens.expires_in.to_string();
    let mut fragment = url::form_urlencoded::Serializer::new(String::new());
    fragment
        .append_pair("access_token", &tokens.access_token)
        .append_pair("token_type", &tokens.token_type)
        .append_pair("expires_in", &expires_in)
        .append_pair("scope", &tokens.scope);
    if let Some(id_token) = &tokens.id_token {
        fragment.append_pair("id_token", id_token);
    }
    if let Some(state) = tokens.state.as_deref().filter(|s| !s.is_empty()) {
        fragment.append_pair("state", state);
    }
    url.set_fragment(Some(&fragment.finish()));
    Some(url.into())
}

fn error_page(config: &AppConfig, err: &SsoError) -> Response {
    error_redirect(config, None, err.message(), &err.public_description(), None)
}

fn error_redirect(
    config: &AppConfig,
    redirect_uri: Option<&str>,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> Response {
    let mut pairs = vec![("error", error), ("error_description", description)];
    if let Some(s) = state {
        pairs.push(("state", s));
    }
    let target = redirect_uri.unwrap_or(&config.error_page_url);
    match with_query(target, &pairs).or_else(|| with_query(&config.error_page_url, &pairs)) {
        Some(url) => found(&url),
        None => SsoError::invalid_input(description.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn basic_auth_wins_over_form_fields() {
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("client-1:s3cret");
        headers.insert(
            "authorization",
            format!("Basic {encoded}").parse().unwrap(),
        );
        let params = TokenRequest {
            client_id: Some("other".into()),
            client_secret: Some("other-secret".into()),
            ..Default::default()
        };
        let creds = extract_client_credentials(&headers, &params);
        assert_eq!(creds.client_id, "client-1");
        assert_eq!(creds.client_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn form_credentials_are_the_fallback() {
        let params = TokenRequest {
            client_id: Some("client-1".into()),
            client_secret: Some("s3cret".into()),
            ..Default::default()
        };
        let creds = extract_client_credentials(&HeaderMap::new(), &params);
        assert_eq!(creds.client_id, "client-1");
        assert_eq!(creds.client_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn query_is_appended_and_encoded() {
        let url = with_query(
            "https://client.example.com/cb?keep=1",
            &[("code", "a b"), ("state", "x&y")],
        )
        .unwrap();
        assert_eq!(url, "https://client.example.com/cb?keep=1&code=a+b&state=x%26y");
    }

    #[test]
    fn implicit_tokens_go_in_the_fragment() {
        let tokens = TokenResponse {
            access_token: "at".into(),
            id_token: None,
            refresh_token: None,
            token_type: "Bearer".into(),
            expires_in: 900,
            scope: "openid".into(),
            state: Some("xyz".into()),
        };
        let url = with_fragment("https://client.example.com/cb", &tokens).unwrap();
        assert_eq!(
            url,
            "https://client.example.com/cb#access_token=at&token_type=Bearer&expires_in=900&scope=openid&state=xyz"
        );
    }

    #[test]
    fn found_uses_302() {
        let response = found("https://example.com");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.com"
        );
    }
}
