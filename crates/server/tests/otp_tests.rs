//! OTP login, signup and password reset.

mod common;

use axum::http::StatusCode;
use common::*;
use sea_orm::EntityTrait;
use serde_json::{Value, json};
use sso_server::entity::user;
use sso_server::error::SsoError;
use sso_server::oauth2::otp::OtpPurpose;
use sso_server::oauth2::verify_password;

const NEW_PHONE: &str = "0922334455";

async fn password_hash(app: &TestApp) -> String {
    user::Entity::find_by_id(USER_ID)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap()
        .password_hash
        .unwrap()
}

#[tokio::test]
async fn signup_with_a_verified_phone() {
    let app = TestApp::new().await;
    let response = app
        .server
        .get("/otp")
        .add_query_param("phone", NEW_PHONE)
        .add_query_param("purpose", "signup")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let code = app.sms.last_code(NEW_PHONE).expect("otp sent");
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| c.is_ascii_digit()));

    let response = app
        .server
        .post("/signup")
        .json(&json!({
            "first_name": "Sara",
            "last_name": "Tesfaye",
            "phone": NEW_PHONE,
            "otp": code,
            "password": "Secret123"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert!(body["access_token"].as_str().is_some());

    // The code is gone after a successful signup.
    let again = app
        .server
        .post("/signup")
        .json(&json!({
            "first_name": "Sara",
            "last_name": "Tesfaye",
            "phone": NEW_PHONE,
            "otp": code
        }))
        .await;
    assert_eq!(again.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signup_otp_for_registered_phone_is_refused() {
    let app = TestApp::new().await;
    let result = app
        .state
        .otp
        .request_otp(USER_PHONE, OtpPurpose::Signup)
        .await;
    assert!(matches!(result, Err(SsoError::DataExists(_))));
    assert!(app.sms.messages().is_empty());
}

#[tokio::test]
async fn login_otp_for_unknown_phone_is_not_found() {
    let app = TestApp::new().await;
    let response = app
        .server
        .get("/otp")
        .add_query_param("phone", NEW_PHONE)
        .add_query_param("purpose", "login")
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn newer_otp_replaces_the_older_one() {
    let app = TestApp::new().await;
    let otp = &app.state.otp;
    otp.request_otp(USER_PHONE, OtpPurpose::Login).await.unwrap();
    let first = app.sms.last_code(USER_PHONE).unwrap();
    otp.request_otp(USER_PHONE, OtpPurpose::Login).await.unwrap();
    let second = app.sms.last_code(USER_PHONE).unwrap();

    if first != second {
        assert!(otp.verify_otp(USER_PHONE, &first).await.is_err());
    }
    assert!(otp.verify_otp(USER_PHONE, &second).await.is_ok());
    // Consumed on success.
    assert!(otp.verify_otp(USER_PHONE, &second).await.is_err());
}

#[tokio::test]
async fn login_with_otp() {
    let app = TestApp::new().await;
    app.state
        .otp
        .request_otp(USER_PHONE, OtpPurpose::Login)
        .await
        .unwrap();
    let code = app.sms.last_code(USER_PHONE).unwrap();

    let response = app
        .server
        .post("/login")
        .json(&json!({ "phone": USER_PHONE, "otp": code }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn login_with_password_by_phone_or_email() {
    let app = TestApp::new().await;
    for credentials in [
        json!({ "phone": USER_PHONE, "password": USER_PASSWORD }),
        json!({ "email": USER_EMAIL, "password": USER_PASSWORD }),
    ] {
        let response = app.server.post("/login").json(&credentials).await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    let wrong = app
        .server
        .post("/login")
        .json(&json!({ "phone": USER_PHONE, "password": "nope12345" }))
        .await;
    assert_eq!(wrong.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_reset_with_code() {
    let app = TestApp::new().await;
    let response = app
        .server
        .get("/resetCode")
        .add_query_param("email", USER_EMAIL)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let code = app.sms.last_code(USER_PHONE).expect("reset code sent");

    let response = app
        .server
        .post("/resetPassword")
        .json(&json!({ "email": USER_EMAIL, "code": code, "password": "NewPass1" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(verify_password("NewPass1", &password_hash(&app).await));

    // Single use.
    let replay = app
        .server
        .post("/resetPassword")
        .json(&json!({ "email": USER_EMAIL, "code": code, "password": "Other123" }))
        .await;
    assert_eq!(replay.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pending_reset_code_is_resent_not_replaced() {
    let app = TestApp::new().await;
    let otp = &app.state.otp;
    otp.request_reset_code(USER_EMAIL).await.unwrap();
    otp.request_reset_code(USER_EMAIL).await.unwrap();

    let messages = app.sms.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].1, messages[1].1);
}

#[tokio::test]
async fn wrong_reset_code_leaves_password_unchanged() {
    let app = TestApp::new().await;
    let before = password_hash(&app).await;
    app.state.otp.request_reset_code(USER_EMAIL).await.unwrap();
    let code = app.sms.last_code(USER_PHONE).unwrap();
    let wrong = if code == "482913" { "482914" } else { "482913" };

    let response = app
        .server
        .post("/resetPassword")
        .json(&json!({ "email": USER_EMAIL, "code": wrong, "password": "NewPass1" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["field_error"][0]["name"], "code");
    assert_eq!(password_hash(&app).await, before);
    assert!(verify_password(USER_PASSWORD, &before));
}

#[tokio::test]
async fn weak_password_is_rejected_before_the_code_is_spent() {
    let app = TestApp::new().await;
    app.state.otp.request_reset_code(USER_EMAIL).await.unwrap();
    let code = app.sms.last_code(USER_PHONE).unwrap();

    let weak = app
        .state
        .otp
        .reset_password(USER_EMAIL, &code, "short")
        .await;
    assert!(matches!(weak, Err(SsoError::InvalidUserInput { .. })));
    assert!(
        app.state
            .otp
            .reset_password(USER_EMAIL, &code, "NewPass1")
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn reset_for_unknown_email_sends_nothing() {
    let app = TestApp::new().await;
    let response = app
        .server
        .get("/resetCode")
        .add_query_param("email", "nobody@example.com")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(app.sms.messages().is_empty());
}
