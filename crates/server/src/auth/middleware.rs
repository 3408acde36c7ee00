use crate::{
    auth::jwt::{Identity, JwtIdentityService},
    error::{ApiError, ErrorCode},
};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub username: String,
}

impl From<Identity> for AuthenticatedUser {
    fn from(identity: Identity) -> Self {
        Self { user_id: identity.user_id, username: identity.username }
    }
}

pub async fn require_bearer_auth(
    State(identity_service): State<Arc<JwtIdentityService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer_token_from_headers(request.headers()) {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let identity = match identity_service.verify_credential(token) {
        Ok(identity) => identity,
        Err(error) => {
            tracing::debug!(error = %error, "rejected bearer credential");
            return unauthorized_response("invalid bearer token");
        }
    };

    request.extensions_mut().insert(AuthenticatedUser::from(identity));

    next.run(request).await
}

/// Bearer credential from the `Authorization` header, if present and well formed.
pub(crate) fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    ApiError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::{extract_bearer_token, require_bearer_auth, AuthenticatedUser};
    use crate::auth::jwt::JwtIdentityService;
    use axum::{
        body::Body,
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "syncroom_test_secret_that_is_definitely_long_enough";

    fn protected_app(identity_service: Arc<JwtIdentityService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(user): Extension<AuthenticatedUser>| async move {
                    format!("{}:{}", user.user_id, user.username)
                }),
            )
            .layer(middleware::from_fn_with_state(identity_service, require_bearer_auth))
    }

    fn service() -> Arc<JwtIdentityService> {
        Arc::new(JwtIdentityService::new(TEST_SECRET).expect("service should initialize"))
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer   "), None);
    }

    #[tokio::test]
    async fn rejects_requests_without_bearer_token() {
        let response = protected_app(service())
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_bearer_token() {
        let response = protected_app(service())
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, "Bearer invalid-token")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn injects_authenticated_user_for_valid_bearer_token() {
        let service = service();
        let user_id = Uuid::new_v4();
        let token = service.issue_token(user_id, "alice", None).expect("token should be issued");

        let response = protected_app(service)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        assert_eq!(body, format!("{user_id}:alice").as_bytes());
    }
}
