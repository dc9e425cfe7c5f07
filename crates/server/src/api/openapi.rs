//! OpenAPI/Utoipa configuration.

use crate::api::health::MISC_TAG;
use crate::oauth2::{ACCOUNT_TAG, OAUTH2_TAG};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, OAuth2, Scopes, SecurityScheme},
};

/// Security addon for OpenAPI documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            let bearer = HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .description(Some(
                    "Access token obtained from `/oauth/token`, `/login`, `/signup` or `/loginWithIP`.",
                ))
                .build();
            components.add_security_scheme("bearer_auth", SecurityScheme::Http(bearer));

            let oauth2 = OAuth2::new([utoipa::openapi::security::Flow::AuthorizationCode(
                utoipa::openapi::security::AuthorizationCode::new(
                    "/authorize",
                    "/oauth/token",
                    Scopes::from_iter([
                        ("openid", "OpenID Connect scope"),
                        ("profile", "Access to the user's name, gender and picture"),
                        ("email", "Access to the user's email address"),
                        ("phone", "Access to the user's phone number"),
                    ]),
                ),
            )]);
            components.add_security_scheme("OAuth2", SecurityScheme::OAuth2(oauth2));
        }
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "SSO Authorization Server",
        version = "1.0.0",
        description = "OAuth2 / OpenID Connect authorization server with consent, federation and OTP login."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = OAUTH2_TAG, description = "OAuth2 and OpenID Connect endpoints"),
        (name = ACCOUNT_TAG, description = "Login, registration and password reset")
    )
)]
pub struct ApiDoc;
