use crate::extractors::RejectionType;
use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
        StatusCode,
    },
};
use events::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::*;
use serde::Deserialize;
use service::AppState;
use std::collections::HashMap;

/// The identity a stream or dispatch request acts as.
///
/// The auth provider itself lives outside this service; requests arrive
/// carrying a signed token whose subject is the user id. Identity is
/// resolved in precedence order:
///
/// 1. `session` cookie holding a signed token
/// 2. `Authorization: Bearer <token>` header
/// 3. `token` query parameter (the browser `EventSource` API cannot set
///    request headers)
/// 4. `user_id` query parameter, accepted outside production only
pub(crate) struct AuthenticatedUser(pub UserId);

const SESSION_COOKIE: &str = "session";

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Verifies an HS256 bearer token and returns its subject.
fn verify_token(token: &str, secret: &str) -> Option<UserId> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| debug!("Bearer token rejected: {e}"))
    .ok()
    .map(|data| data.claims.sub)
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

fn cookie_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (key, value) = pair.trim().split_once('=')?;
                (key == name).then(|| value.to_string())
            })
        })
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = RejectionType;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let query: HashMap<String, String> = Query::from_request_parts(parts, state)
            .await
            .map(|Query(params)| params)
            .unwrap_or_default();

        let token = cookie_value(parts, SESSION_COOKIE)
            .or_else(|| bearer_token(parts))
            .or_else(|| query.get("token").cloned());

        if let Some(token) = token {
            let Some(secret) = state.config.token_signing_secret() else {
                warn!("Bearer token presented but no signing secret is configured");
                return Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()));
            };
            return match verify_token(&token, &secret) {
                Some(user_id) => Ok(AuthenticatedUser(user_id)),
                None => Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string())),
            };
        }

        // Unsigned identity is a development convenience only.
        if !state.config.is_production() {
            if let Some(user_id) = query.get("user_id") {
                debug!("Accepting unsigned user_id query identity (non-production)");
                return Ok(AuthenticatedUser(user_id.clone()));
            }
        }

        Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    fn token_for(sub: &str, secret: &str, exp: i64) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_string(),
                exp: exp as usize,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_valid_token_yields_subject() {
        let token = token_for("u1", "secret", future_exp());
        assert_eq!(verify_token(&token, "secret"), Some("u1".to_string()));
    }

    #[test]
    fn test_token_with_wrong_secret_is_rejected() {
        let token = token_for("u1", "secret", future_exp());
        assert_eq!(verify_token(&token, "other-secret"), None);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = token_for("u1", "secret", chrono::Utc::now().timestamp() - 3600);
        assert_eq!(verify_token(&token, "secret"), None);
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert_eq!(verify_token("not-a-jwt", "secret"), None);
    }

    fn parts_with_headers(headers: &[(axum::http::HeaderName, &str)]) -> Parts {
        let mut builder = axum::http::Request::builder();
        for (name, value) in headers {
            builder = builder.header(name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_session_cookie_is_found_among_others() {
        let parts = parts_with_headers(&[(COOKIE, "theme=dark; session=tok123; lang=en")]);
        assert_eq!(
            cookie_value(&parts, SESSION_COOKIE),
            Some("tok123".to_string())
        );
    }

    #[test]
    fn test_missing_session_cookie_yields_none() {
        let parts = parts_with_headers(&[(COOKIE, "theme=dark")]);
        assert_eq!(cookie_value(&parts, SESSION_COOKIE), None);
    }

    #[test]
    fn test_session_cookie_outranks_bearer_header() {
        let parts = parts_with_headers(&[
            (COOKIE, "session=cookie-token"),
            (AUTHORIZATION, "Bearer header-token"),
        ]);
        let token = cookie_value(&parts, SESSION_COOKIE).or_else(|| bearer_token(&parts));
        assert_eq!(token, Some("cookie-token".to_string()));
    }
}
