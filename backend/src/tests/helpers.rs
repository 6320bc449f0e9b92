use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use chrono::Duration;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use crate::auth::JwtKeys;
use crate::tests::TEST_JWT_SECRET;

/// A caller with a signed token.
#[derive(Debug, Clone)]
pub struct TestUser {
    pub user_id: Uuid,
    pub role_ids: Vec<Uuid>,
    pub token: String,
}

pub fn create_test_user(role_names: &[&str], role_ids: Vec<Uuid>) -> TestUser {
    let user_id = Uuid::new_v4();
    let token = JwtKeys::from_secret(TEST_JWT_SECRET)
        .issue(
            user_id,
            role_ids.clone(),
            role_names.iter().map(|r| r.to_string()).collect(),
            Duration::hours(1),
        )
        .expect("Failed to create test JWT");
    TestUser {
        user_id,
        role_ids,
        token,
    }
}

pub fn create_admin_user() -> TestUser {
    create_test_user(&["admin"], vec![Uuid::new_v4()])
}

/// Sends one request through the router and returns status plus JSON body
/// (`Value::Null` when the body is empty).
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&TestUser>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", user.token));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

pub async fn get(app: &Router, uri: &str, user: &TestUser) -> (StatusCode, Value) {
    send(app, Method::GET, uri, Some(user), None).await
}

pub async fn post(app: &Router, uri: &str, user: &TestUser, body: Value) -> (StatusCode, Value) {
    send(app, Method::POST, uri, Some(user), Some(body)).await
}

pub fn id_of(body: &Value) -> Uuid {
    body["id"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .expect("response has an id")
}
