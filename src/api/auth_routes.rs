//! Registration, login and password flow handlers

use crate::api::{ApiError, ApiResult, AppState, AuthUserAllowReset, RequestContext};
use crate::store::UserView;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct RegisterRequest {
    #[schema(example = "alice")]
    pub username: String,
    #[schema(example = "alice@example.com")]
    pub email: String,
    #[schema(example = "Aa1!aa1!")]
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    #[schema(example = "bearer")]
    pub token_type: String,
    pub user: UserView,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ForgotPasswordResponse {
    pub message: String,
    /// Present only when the server runs in debug mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SimpleResponse {
    pub success: bool,
    pub message: String,
}

/// Register a new account
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = UserView),
        (status = 400, description = "Invalid input or duplicate username/email", body = super::ErrorResponse)
    )
)]
pub async fn register_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<UserView>)> {
    let view = state
        .auth
        .register(
            request.username.trim(),
            request.email.trim(),
            &request.password,
            request.full_name,
        )
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok((StatusCode::CREATED, Json(view)))
}

/// Log in with username and password
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Bearer token issued", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = super::ErrorResponse)
    )
)]
pub async fn login_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let outcome = state
        .auth
        .login(request.username.trim(), &request.password)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(LoginResponse {
        access_token: outcome.access_token,
        token_type: "bearer".to_string(),
        user: outcome.user,
    }))
}

/// Begin the password reset flow.
///
/// The reply does not reveal whether the email exists; debug mode echoes the
/// token so the flow can be exercised without a mail channel.
#[utoipa::path(
    post,
    path = "/api/v1/auth/forgot-password",
    tag = "auth",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Reset initiated when the email matches", body = ForgotPasswordResponse)
    )
)]
pub async fn forgot_password_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<ForgotPasswordRequest>,
) -> ApiResult<Json<ForgotPasswordResponse>> {
    let token = state
        .auth
        .forgot_password(request.email.trim())
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(ForgotPasswordResponse {
        message: "If that email is registered, a reset link has been sent.".to_string(),
        reset_token: if state.config.server.debug {
            token
        } else {
            None
        },
    }))
}

/// Complete the password reset with a single-use token
#[utoipa::path(
    post,
    path = "/api/v1/auth/reset-password",
    tag = "auth",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password updated", body = SimpleResponse),
        (status = 400, description = "Invalid, expired or used token", body = super::ErrorResponse)
    )
)]
pub async fn reset_password_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<ResetPasswordRequest>,
) -> ApiResult<Json<SimpleResponse>> {
    state
        .auth
        .reset_password(&request.token, &request.new_password)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(SimpleResponse {
        success: true,
        message: "Password has been reset.".to_string(),
    }))
}

/// The authenticated user's own view
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "auth",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Current user", body = UserView),
        (status = 401, description = "Missing or invalid token", body = super::ErrorResponse)
    )
)]
pub async fn me_handler(
    AuthUserAllowReset(user): AuthUserAllowReset,
) -> Json<UserView> {
    Json(UserView::from(&user))
}

/// Change the password; clears a forced-reset flag
#[utoipa::path(
    post,
    path = "/api/v1/auth/change-password",
    tag = "auth",
    security(("bearer" = [])),
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = SimpleResponse),
        (status = 401, description = "Old password incorrect", body = super::ErrorResponse)
    )
)]
pub async fn change_password_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthUserAllowReset(user): AuthUserAllowReset,
    Json(request): Json<ChangePasswordRequest>,
) -> ApiResult<Json<SimpleResponse>> {
    state
        .auth
        .change_password(&user, &request.old_password, &request.new_password)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(SimpleResponse {
        success: true,
        message: "Password changed.".to_string(),
    }))
}
