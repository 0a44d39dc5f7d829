use crate::config::ConvoQueueConfig;
use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

const BATCH_INSPECT_PREFIX: &str = "/api/v1/queue/batches/";

#[derive(Debug, Clone)]
pub struct AdminAuthPolicy {
    pub admin_token: Option<String>,
    /// Mutating paths callable without a token: ingest and the scheduler trigger.
    pub open_mutating_paths: Vec<String>,
}

impl Default for AdminAuthPolicy {
    fn default() -> Self {
        Self {
            admin_token: None,
            open_mutating_paths: vec![
                "/api/v1/queue/messages".to_string(),
                "/api/v1/queue/flush-check".to_string(),
            ],
        }
    }
}

impl AdminAuthPolicy {
    pub fn from_config(cfg: &ConvoQueueConfig) -> Self {
        Self {
            admin_token: cfg
                .security
                .admin_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned),
            ..Self::default()
        }
    }

    fn requires_admin(&self, method: &Method, path: &str) -> bool {
        if path.starts_with(BATCH_INSPECT_PREFIX) {
            return true;
        }
        is_mutating(method) && !self.open_mutating_paths.iter().any(|open| open == path)
    }
}

#[derive(Debug, Clone)]
pub struct AdminAuthPolicyExt(pub AdminAuthPolicy);

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn unauthorized(code: &str, message: &str) -> Response {
    tracing::warn!(error_code = code, error = %message, "admin auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "status": "error",
            "error": message,
            "error_code": code,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_admin_auth(req: Request<Body>, next: Next) -> Response {
    let policy = req
        .extensions()
        .get::<AdminAuthPolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();
    let Some(expected) = policy.admin_token.as_deref() else {
        return next.run(req).await;
    };
    if !policy.requires_admin(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    let Some(provided) = parse_bearer_token(req.headers()) else {
        return unauthorized("missing_bearer_token", "missing bearer token");
    };
    if provided != expected {
        return unauthorized("invalid_bearer_token", "invalid bearer token");
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::to_bytes;
    use axum::routing::{get, post};
    use axum::{Extension, middleware};
    use tower::util::ServiceExt;

    fn build_auth_test_router(policy: AdminAuthPolicy) -> Router {
        let ok = || async { Json(json!({ "status": "ok" })) };
        Router::new()
            .route("/api/v1/queue/messages", post(ok))
            .route("/api/v1/queue/cleanup", post(ok))
            .route("/api/v1/queue/health", get(ok))
            .route("/api/v1/queue/batches/{key}", get(ok))
            .layer(middleware::from_fn(require_admin_auth))
            .layer(Extension(AdminAuthPolicyExt(policy)))
    }

    fn with_token() -> AdminAuthPolicy {
        AdminAuthPolicy {
            admin_token: Some("s3cret".to_string()),
            ..AdminAuthPolicy::default()
        }
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        (status, serde_json::from_slice(&body).expect("response json"))
    }

    fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    #[test]
    fn parse_bearer_token_accepts_case_insensitive_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "bearer   abc ".parse().expect("header"));
        assert_eq!(parse_bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert(AUTHORIZATION, "Basic abc".parse().expect("header"));
        assert_eq!(parse_bearer_token(&headers), None);
    }

    #[test]
    fn blank_admin_token_disables_auth() {
        let mut cfg = ConvoQueueConfig::default();
        cfg.security.admin_token = Some("  ".to_string());
        assert_eq!(AdminAuthPolicy::from_config(&cfg).admin_token, None);
    }

    #[tokio::test]
    async fn admin_routes_open_without_configured_token() {
        let router = build_auth_test_router(AdminAuthPolicy::default());
        let (status, _) = call(router, request(Method::POST, "/api/v1/queue/cleanup", None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn cleanup_requires_token_when_configured() {
        let router = build_auth_test_router(with_token());
        let (status, body) =
            call(router.clone(), request(Method::POST, "/api/v1/queue/cleanup", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "missing_bearer_token");

        let (status, body) = call(
            router.clone(),
            request(Method::POST, "/api/v1/queue/cleanup", Some("nope")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "invalid_bearer_token");

        let (status, _) = call(
            router,
            request(Method::POST, "/api/v1/queue/cleanup", Some("s3cret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ingest_and_health_stay_open() {
        let router = build_auth_test_router(with_token());
        let (status, _) =
            call(router.clone(), request(Method::POST, "/api/v1/queue/messages", None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(router, request(Method::GET, "/api/v1/queue/health", None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn batch_inspection_is_admin_only() {
        let router = build_auth_test_router(with_token());
        let (status, _) = call(
            router.clone(),
            request(Method::GET, "/api/v1/queue/batches/sms:1", None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(
            router,
            request(Method::GET, "/api/v1/queue/batches/sms:1", Some("s3cret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
