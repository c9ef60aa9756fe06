//! JWT authentication middleware and handler-side extractors.
//!
//! The middleware verifies the Authorization header (when present) and adds
//! an `AuthUser` to request extensions; handlers opt into authentication by
//! extracting `AuthUser` (401 when missing) or `AdminUser` (403 when the
//! operator is not an admin).

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::server::app::AppState;
use crate::server::error::ApiError;

/// Authenticated operator extracted from the JWT.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub username: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Verifies the bearer token and stashes the operator in extensions.
/// Requests without a valid token continue unauthenticated; protected
/// handlers reject them via the extractors below.
pub async fn jwt_auth_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(user) = extract_auth_user(&request, &state) {
        debug!(username = %user.username, role = %user.role, "authenticated operator");
        request.extensions_mut().insert(user);
    }
    next.run(request).await
}

fn extract_auth_user(
    request: &axum::http::Request<axum::body::Body>,
    state: &AppState,
) -> Option<AuthUser> {
    let auth_header = request.headers().get("authorization")?.to_str().ok()?;
    let token = auth_header.strip_prefix("Bearer ").unwrap_or(auth_header);
    let claims = state.jwt.verify_token(token).ok()?;
    Some(AuthUser {
        username: claims.sub,
        role: claims.role,
    })
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

/// Extractor for admin-only endpoints.
#[derive(Clone, Debug)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::Forbidden);
        }
        Ok(AdminUser(user))
    }
}
