//! Identity-provider login against a mocked provider.

mod common;

use axum::http::StatusCode;
use common::*;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{Value, json};
use sso_server::entity::{ip_access_token, user};
use sso_server::oauth2::signer::TokenSigner;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IDP: &str = "example-idp";

async fn provider(userinfo: Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=idp-code"))
        .and(body_string_contains("client_id=sso-at-idp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "idp-access",
            "refresh_token": "idp-refresh",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer idp-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(userinfo))
        .mount(&server)
        .await;
    server
}

async fn login(app: &TestApp, ip_id: &str, code: &str) -> axum_test::TestResponse {
    app.server
        .post("/loginWithIP")
        .json(&json!({ "ip_id": ip_id, "code": code }))
        .await
}

#[tokio::test]
async fn first_login_creates_and_links_an_account() {
    let app = TestApp::new().await;
    let idp = provider(json!({
        "sub": "ext-42",
        "given_name": "Sara",
        "family_name": "Tesfaye",
        "email": "sara@example.org"
    }))
    .await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let response = login(&app, IDP, "idp-code").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let claims = app
        .signer
        .verify_access(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.client_id, FIRST_PARTY_CLIENT);
    assert!(body["refresh_token"].as_str().is_some());

    let created = user::Entity::find_by_id(claims.sub.clone())
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.first_name, "Sara");
    assert_eq!(created.email.as_deref(), Some("sara@example.org"));
    assert!(created.phone.is_none());

    let link = ip_access_token::Entity::find()
        .filter(ip_access_token::Column::IdentityProviderId.eq(IDP))
        .filter(ip_access_token::Column::SubId.eq("ext-42"))
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.user_id, created.id);
    assert_eq!(link.token, "idp-access");
    assert_eq!(link.refresh_token.as_deref(), Some("idp-refresh"));
}

#[tokio::test]
async fn repeated_login_reuses_the_linked_account() {
    let app = TestApp::new().await;
    let idp = provider(json!({ "sub": "ext-42", "given_name": "Sara", "family_name": "Tesfaye" }))
        .await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let first: Value = login(&app, IDP, "idp-code").await.json();
    let second: Value = login(&app, IDP, "idp-code").await.json();
    let sub = |body: &Value| {
        app.signer
            .verify_access(body["access_token"].as_str().unwrap())
            .unwrap()
            .sub
    };
    assert_eq!(sub(&first), sub(&second));

    let users = user::Entity::find().count(app.db.as_ref()).await.unwrap();
    assert_eq!(users, 2);
    let links = ip_access_token::Entity::find()
        .count(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(links, 1);
}

#[tokio::test]
async fn matching_phone_links_the_existing_account() {
    let app = TestApp::new().await;
    let idp = provider(json!({
        "sub": "ext-7",
        "given_name": "Abebe",
        "family_name": "Bikila",
        "phone_number": USER_PHONE
    }))
    .await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let body: Value = login(&app, IDP, "idp-code").await.json();
    let claims = app
        .signer
        .verify_access(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.sub, USER_ID);
    assert_eq!(claims.roles, vec!["user".to_string()]);
}

#[tokio::test]
async fn unverified_email_does_not_claim_an_existing_account() {
    let app = TestApp::new().await;
    let idp = provider(json!({
        "sub": "ext-9",
        "given_name": "Someone",
        "family_name": "Else",
        "email": USER_EMAIL
    }))
    .await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let body: Value = login(&app, IDP, "idp-code").await.json();
    let claims = app
        .signer
        .verify_access(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_ne!(claims.sub, USER_ID);

    let created = user::Entity::find_by_id(claims.sub)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert!(created.email.is_none());
}

#[tokio::test]
async fn verified_email_links_the_existing_account() {
    let app = TestApp::new().await;
    let idp = provider(json!({
        "sub": "ext-9",
        "given_name": "Abebe",
        "family_name": "Bikila",
        "email": USER_EMAIL,
        "email_verified": true
    }))
    .await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let body: Value = login(&app, IDP, "idp-code").await.json();
    let claims = app
        .signer
        .verify_access(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.sub, USER_ID);
}

#[tokio::test]
async fn concurrent_first_logins_create_one_account() {
    let app = TestApp::new().await;
    let idp = provider(json!({ "sub": "ext-42", "given_name": "Sara", "family_name": "Tesfaye" }))
        .await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let federation = &app.state.federation;
    let (a, b) = tokio::join!(
        federation.login_with_identity_provider(IDP, "idp-code"),
        federation.login_with_identity_provider(IDP, "idp-code"),
    );
    let sub = |tokens: sso_server::oauth2::token::TokenResponse| {
        app.signer.verify_access(&tokens.access_token).unwrap().sub
    };
    assert_eq!(sub(a.unwrap()), sub(b.unwrap()));

    let users = user::Entity::find().count(app.db.as_ref()).await.unwrap();
    assert_eq!(users, 2);
    let links = ip_access_token::Entity::find()
        .count(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(links, 1);
}

#[tokio::test]
async fn rejected_code_is_unauthorized() {
    let app = TestApp::new().await;
    let idp = provider(json!({ "sub": "ext-42" })).await;
    insert_identity_provider(app.db.as_ref(), IDP, &idp.uri()).await;

    let response = login(&app, IDP, "wrong-code").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let users = user::Entity::find().count(app.db.as_ref()).await.unwrap();
    assert_eq!(users, 1);
}

#[tokio::test]
async fn unknown_provider_names_the_field() {
    let app = TestApp::new().await;
    let response = login(&app, "nobody", "idp-code").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["field_error"][0]["name"], "ip_id");
}
