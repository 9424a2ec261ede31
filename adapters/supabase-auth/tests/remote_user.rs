//! Remote validation against a stand-in for `GET /auth/v1/user`.

use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use supabase_auth::{AuthError, SupabaseAuth};

async fn user(headers: HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let apikey = headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if apikey != "anon-key" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"message": "No API key found in request"})),
        );
    }
    match auth {
        "Bearer good-token" => (
            StatusCode::OK,
            Json(serde_json::json!({
                "id": "6f1c2c1e-0000-4000-8000-000000000001",
                "aud": "authenticated",
                "email": "reader@example.com"
            })),
        ),
        "Bearer broken-upstream" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"message": "boom"})),
        ),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"message": "invalid JWT"})),
        ),
    }
}

async fn serve() -> String {
    let app = Router::new().route("/auth/v1/user", get(user));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn known_token_resolves_user() {
    let base = serve().await;
    let auth = SupabaseAuth::remote(&base, "anon-key");
    let user = auth
        .validate_user_and_token(Some("Bearer good-token"))
        .await
        .unwrap();
    assert_eq!(user.id, "6f1c2c1e-0000-4000-8000-000000000001");
    assert_eq!(user.email.as_deref(), Some("reader@example.com"));
    assert_eq!(user.token, "good-token");
}

#[tokio::test]
async fn rejected_token_and_upstream_failure() {
    let base = serve().await;
    let auth = SupabaseAuth::remote(&format!("{base}/"), "anon-key");

    let err = auth
        .validate_user_and_token(Some("Bearer nope"))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Rejected);

    let err = auth
        .validate_user_and_token(Some("Bearer broken-upstream"))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Upstream(500));

    let err = auth.validate_user_and_token(None).await.unwrap_err();
    assert_eq!(err, AuthError::MissingToken);
}

#[tokio::test]
async fn unreachable_auth_server_is_network_error() {
    // Bind then drop so the port is closed.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let auth = SupabaseAuth::remote(&format!("http://{addr}"), "anon-key");
    let err = auth
        .validate_user_and_token(Some("Bearer good-token"))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Network);
}
