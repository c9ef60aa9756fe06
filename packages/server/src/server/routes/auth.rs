//! Operator login and identity.

use axum::extract::State;
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::jwt::verify_password;
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::AuthUser;

#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

/// POST /api/v1/auth/login
pub async fn login_handler(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .kernel
        .store
        .get_user_by_username(&form.username)
        .await?;
    let Some(user) = user else {
        return Err(ApiError::Unauthorized);
    };
    if !verify_password(&form.password, &user.password) {
        return Err(ApiError::Unauthorized);
    }

    let expire_minutes = state
        .kernel
        .settings
        .system()
        .auth
        .access_token_expire_minutes;
    let token = state
        .jwt
        .create_token(&user.username, &user.role, expire_minutes)?;

    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "user": {
            "id": user.id,
            "username": user.username,
            "role": user.role,
        },
    })))
}

/// GET /api/v1/auth/me
pub async fn me_handler(user: AuthUser) -> Json<serde_json::Value> {
    Json(json!({
        "username": user.username,
        "role": user.role,
    }))
}
