//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Token extraction (header, cookie, precedence)
//! - Local HS256 verification (valid, expired, wrong audience, wrong secret)
//! - Supabase API fallback (success, rejection, caching)

#[cfg(test)]
mod tests {
    use super::super::middleware::*;
    use axum::{body::Body, extract::Request, http::StatusCode, response::IntoResponse};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use time::OffsetDateTime;

    const JWT_SECRET: &str = "test-supabase-jwt-secret-for-testing-only";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        email: &'a str,
        aud: &'a str,
        exp: i64,
    }

    fn token(secret: &str, sub: &str, aud: &str, expires_in: i64) -> String {
        let claims = TestClaims {
            sub,
            email: "owner@studio.test",
            aud,
            exp: OffsetDateTime::now_utc().unix_timestamp() + expires_in,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn local_only_state() -> AuthState {
        AuthState::new("", "", Some(JWT_SECRET.to_string()), reqwest::Client::new())
    }

    fn request_with(header: Option<(&str, &str)>) -> Request {
        let mut builder = Request::builder().uri("/api/v1/billing/subscription");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_bearer_from_header() {
        let request = request_with(Some(("Authorization", "Bearer abc.def.ghi")));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_extract_bearer_from_cookie() {
        let request = request_with(Some(("Cookie", "theme=dark; sb-access-token=tok123; other=1")));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let request = Request::builder()
            .header("Authorization", "Bearer from-header")
            .header("Cookie", "sb-access-token=from-cookie")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_no_token() {
        assert!(extract_bearer_token(&request_with(None)).is_none());
        // Basic auth is not a bearer token, and a similarly named cookie does not count
        assert!(extract_bearer_token(&request_with(Some(("Authorization", "Basic dXNlcg==")))).is_none());
        assert!(extract_bearer_token(&request_with(Some(("Cookie", "sb-access-token-old=x")))).is_none());
    }

    #[tokio::test]
    async fn test_local_jwt_accepted() {
        let state = local_only_state();
        let user = authenticate(&state, &token(JWT_SECRET, "user_123", "authenticated", 3600))
            .await
            .unwrap();

        assert_eq!(user.user_id, "user_123");
        assert_eq!(user.email.as_deref(), Some("owner@studio.test"));
        assert_eq!(user.auth_method, AuthMethod::LocalJwt);
    }

    #[tokio::test]
    async fn test_expired_jwt_rejected() {
        let state = local_only_state();
        let result = authenticate(&state, &token(JWT_SECRET, "user_123", "authenticated", -3600)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let state = local_only_state();
        let result = authenticate(&state, &token(JWT_SECRET, "user_123", "anon", 3600)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let state = local_only_state();
        let result = authenticate(&state, &token("some-other-secret", "user_123", "authenticated", 3600)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_supabase_fallback_and_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/v1/user")
            .match_header("apikey", "test-anon-key")
            .match_header("authorization", "Bearer opaque-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"user_remote","email":"remote@studio.test"}"#)
            .expect(1)
            .create_async()
            .await;

        let state = AuthState::new(server.url(), "test-anon-key", None, reqwest::Client::new());

        let first = authenticate(&state, "opaque-token").await.unwrap();
        assert_eq!(first.user_id, "user_remote");
        assert_eq!(first.auth_method, AuthMethod::SupabaseApi);

        // Second call is served from the cache
        let second = authenticate(&state, "opaque-token").await.unwrap();
        assert_eq!(second.user_id, "user_remote");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_local_failure_falls_back_to_supabase() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/v1/user")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"user_rotated","email":null}"#)
            .create_async()
            .await;

        // Token signed with a rotated secret the server does not know yet
        let state = AuthState::new(
            server.url(),
            "test-anon-key",
            Some(JWT_SECRET.to_string()),
            reqwest::Client::new(),
        );
        let user = authenticate(&state, &token("rotated-secret", "user_rotated", "authenticated", 3600))
            .await
            .unwrap();

        assert_eq!(user.user_id, "user_rotated");
        assert_eq!(user.auth_method, AuthMethod::SupabaseApi);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_supabase_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/auth/v1/user")
            .with_status(401)
            .with_body(r#"{"message":"invalid JWT"}"#)
            .create_async()
            .await;

        let state = AuthState::new(server.url(), "test-anon-key", None, reqwest::Client::new());
        let result = authenticate(&state, "revoked-token").await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_auth_error_responses() {
        assert_eq!(AuthError::MissingAuth.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidToken.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
