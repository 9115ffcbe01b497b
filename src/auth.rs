//! Bearer-token authorization for routes.

use crate::http::detail_response;
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Whatever the authorizer returned for an accepted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthContext(pub Value);

impl AuthContext {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Convert into a typed claims struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }
}

/// Decides whether a bearer token may call a route.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `None` rejects the token.
    async fn authorize(&self, token: &str) -> Option<AuthContext>;
}

/// Adapter for plain functions and closures, sync or async.
pub struct FnAuthorizer<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Authorizer for FnAuthorizer<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Option<AuthContext>> + Send,
{
    async fn authorize(&self, token: &str) -> Option<AuthContext> {
        (self.f)(token.to_string()).await
    }
}

/// Wrap an async function as an [`Authorizer`].
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Authorizer>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<AuthContext>> + Send + 'static,
{
    Arc::new(FnAuthorizer {
        f,
        _marker: PhantomData,
    })
}

/// Wrap a synchronous check as an [`Authorizer`].
pub fn from_sync_fn<F>(f: F) -> Arc<dyn Authorizer>
where
    F: Fn(&str) -> Option<AuthContext> + Send + Sync + 'static,
{
    from_fn(move |token: String| std::future::ready(f(&token)))
}

/// Accepts exactly one token.
pub struct StaticToken {
    token: String,
    context: AuthContext,
}

impl StaticToken {
    pub fn new(token: impl Into<String>, context: AuthContext) -> Self {
        Self {
            token: token.into(),
            context,
        }
    }
}

#[async_trait]
impl Authorizer for StaticToken {
    async fn authorize(&self, token: &str) -> Option<AuthContext> {
        (token == self.token).then(|| self.context.clone())
    }
}

/// Why a request was not let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Bearer token required")]
    Missing,
    #[error("Invalid authentication credentials")]
    Malformed,
    #[error("Invalid bearer token")]
    Rejected,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Missing | AuthError::Rejected => StatusCode::UNAUTHORIZED,
            AuthError::Malformed => StatusCode::FORBIDDEN,
        }
    }

    /// Reason sent with the policy-violation close frame on WebSocket routes.
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "Not authenticated",
            AuthError::Malformed => "Unauthorized",
            AuthError::Rejected => "Invalid bearer token",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        detail_response(self.status(), self.to_string())
    }
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::Missing)?;
    let (scheme, token) = header.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token)
}

/// Run the header through `authorizer`.
pub async fn authorize(
    authorizer: &dyn Authorizer,
    header: Option<&str>,
) -> Result<AuthContext, AuthError> {
    let token = bearer_token(header)?;
    authorizer.authorize(token).await.ok_or(AuthError::Rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(Some("bearer  abc ")), Ok("abc"));
        assert_eq!(bearer_token(None), Err(AuthError::Missing));
        assert_eq!(bearer_token(Some("Basic abc")), Err(AuthError::Malformed));
        assert_eq!(bearer_token(Some("Bearer")), Err(AuthError::Malformed));
    }

    #[tokio::test]
    async fn test_authorize_with_fn() {
        let authorizer = from_sync_fn(|token| {
            (token == "secret").then(|| AuthContext::new(json!({"user": "alice"})))
        });
        let ctx = authorize(authorizer.as_ref(), Some("Bearer secret"))
            .await
            .unwrap();
        assert_eq!(ctx.get("user"), Some(&json!("alice")));
        assert_eq!(
            authorize(authorizer.as_ref(), Some("Bearer nope")).await,
            Err(AuthError::Rejected)
        );
    }

    #[test]
    fn test_static_token() {
        let authorizer = StaticToken::new("t0k", AuthContext::new("svc"));
        assert!(tokio_test::block_on(authorizer.authorize("t0k")).is_some());
        assert!(tokio_test::block_on(authorizer.authorize("other")).is_none());
    }

    #[test]
    fn test_status_and_close_reasons() {
        assert_eq!(AuthError::Missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Malformed.status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::Rejected.close_reason(), "Invalid bearer token");
    }
}
