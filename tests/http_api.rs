mod common;

use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use tower::ServiceExt;

use common::{body_json, get, json_request, test_state};
use userland_gateway::routes::router;

async fn login(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            None,
            r#"{"username":"alice","password":"wonderland"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn proxy_token(app: &axum::Router, session: &str) -> String {
    let response = app
        .clone()
        .oneshot(get("/api/terminal/url", Some(session)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let url = body_json(response).await["url"].as_str().unwrap().to_string();
    url.split("token=").nth(1).unwrap().to_string()
}

#[tokio::test]
async fn test_health_is_public() {
    let (state, _) = test_state();
    let response = router(state)
        .oneshot(get("/api/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].as_u64().unwrap() > 0);
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_login_success_returns_session_token() {
    let (state, _) = test_state();
    let app = router(state.clone());
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            None,
            r#"{"username":"alice","password":"wonderland"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["username"], "alice");
    assert_eq!(body["message"], "Login successful");
    assert!(!body["token"].as_str().unwrap().is_empty());
    assert_eq!(state.gate.token_count(), 1);
}

#[tokio::test]
async fn test_login_wrong_password_is_401() {
    let (state, _) = test_state();
    let app = router(state.clone());
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            None,
            r#"{"username":"alice","password":"nope"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await["error"],
        "Invalid username or password"
    );
    assert_eq!(state.gate.token_count(), 0);
}

#[tokio::test]
async fn test_login_missing_fields_is_400() {
    let (state, _) = test_state();
    let app = router(state);
    for body in [r#"{"username":"alice"}"#, r#"{"password":"x"}"#, "not json"] {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/auth/login", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
        assert_eq!(
            body_json(response).await["error"],
            "Username and password required"
        );
    }
}

#[tokio::test]
async fn test_protected_route_requires_token() {
    let (state, _) = test_state();
    let app = router(state);

    let response = app
        .clone()
        .oneshot(get("/api/system/cpu", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(get("/api/system/cpu", Some("bogus")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = login(&app).await;
    let response = app
        .oneshot(get("/api/system/cpu", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["cpu"], 42.0);
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let (state, _) = test_state();
    let app = router(state);
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/auth/logout", Some(&token), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "Logout successful");

    let response = app
        .oneshot(get("/api/system/memory", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_system_endpoints() {
    let (state, collector) = test_state();
    let app = router(state);
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(get("/api/system/all", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["memory"]["usagePercent"], 25.0);
    assert!(body["load"]["load1"].is_number());

    let response = app
        .clone()
        .oneshot(get("/api/system/ports", Some(&token)))
        .await
        .unwrap();
    assert_eq!(body_json(response).await, serde_json::json!([]));

    collector.failing.store(true, Ordering::SeqCst);
    let response = app
        .oneshot(get("/api/system/all", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("permission denied"));
}

#[tokio::test]
async fn test_terminal_url_embeds_proxy_token() {
    let (state, _) = test_state();
    let app = router(state);
    let token = login(&app).await;

    let request = axum::http::Request::builder()
        .uri("/api/terminal/url")
        .header("authorization", format!("Bearer {token}"))
        .header("host", "phone.local:3001")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let url = body_json(response).await["url"].as_str().unwrap().to_string();
    assert!(url.starts_with("http://phone.local:3001/ttyd/?token="), "{url}");

    // The proxy token is not a session token.
    let proxy = url.split("token=").nth(1).unwrap();
    let response = app
        .oneshot(get("/api/system/cpu", Some(proxy)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_proxy_rejects_missing_and_wrong_class_tokens() {
    let (state, _) = test_state();
    let app = router(state);

    let response = app.clone().oneshot(get("/ttyd/", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(get("/ttyd/?token=bogus", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let session = login(&app).await;
    let response = app
        .oneshot(get(&format!("/ttyd/?token={session}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_proxy_unreachable_backend_is_502() {
    let (state, _) = test_state();
    let app = router(state);
    let session = login(&app).await;
    let proxy = proxy_token(&app, &session).await;

    let response = app
        .oneshot(get(&format!("/ttyd/index.html?token={proxy}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["error"], "Bad gateway");
}

#[tokio::test]
async fn test_unknown_path_is_404_not_proxied() {
    let (state, _) = test_state();
    let app = router(state);
    let response = app.oneshot(get("/ttydx", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_security_headers() {
    let (state, _) = test_state();
    let app = router(state);

    let response = app
        .clone()
        .oneshot(get("/api/health", None))
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
    assert!(headers.contains_key("strict-transport-security"));

    let response = app.oneshot(get("/ttyd/", None)).await.unwrap();
    let headers = response.headers();
    assert!(!headers.contains_key("x-frame-options"));
    assert!(headers["content-security-policy"]
        .to_str()
        .unwrap()
        .contains("wss:"));
}

#[tokio::test]
async fn test_distro_lifecycle() {
    let (state, _) = test_state();
    let app = router(state);
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/proot/create",
            Some(&token),
            r#"{"name":"ubuntu"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Name and port required");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/proot/create",
            Some(&token),
            r#"{"name":"ubuntu","port":"8022"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["port"], 8022);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/proot/create",
            Some(&token),
            r#"{"name":"debian","port":8022}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/proot/create",
            Some(&token),
            r#"{"name":"bad name","port":9000}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(get("/api/proot/list", Some(&token)))
        .await
        .unwrap();
    let list = body_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["name"], "ubuntu");

    let delete = |name: &str| {
        axum::http::Request::builder()
            .method("DELETE")
            .uri(format!("/api/proot/delete/{name}"))
            .header("authorization", format!("Bearer {token}"))
            .body(axum::body::Body::empty())
            .unwrap()
    };
    let response = app.clone().oneshot(delete("ubuntu")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["name"], "ubuntu");

    let response = app.oneshot(delete("ubuntu")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ws_rejects_bad_token_before_upgrade() {
    let (state, _) = test_state();
    let app = router(state);
    let request = axum::http::Request::builder()
        .uri("/ws?token=bogus")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
