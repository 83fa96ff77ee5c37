/// Authentication Routes
///
/// Thin HTTP layer over `SessionService`: request schemas, refresh cookie
/// handling and response bodies. All failures are `AppError`s and are turned
/// into JSON error responses by its `ResponseError` impl.

use actix_web::cookie::{time, Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::Claims;
use crate::configuration::RefreshTokenSettings;
use crate::email_client::EmailClient;
use crate::error::{AppError, AuthError};
use crate::session::{SessionService, SessionTokens};

/// How password-reset tokens reach the user
pub enum ResetDelivery {
    /// Returned in the response body (minimal deployments only)
    Inline,
    /// Mailed as a link; the response carries no token
    Email(EmailClient),
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

/// Access token body; the refresh token travels only in the cookie
#[derive(Serialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Serialize)]
pub struct ForgotPasswordResponse {
    pub reset_token: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: String,
}

fn client_origin(req: &HttpRequest) -> Option<String> {
    req.peer_addr().map(|addr| addr.ip().to_string())
}

fn refresh_cookie(settings: &RefreshTokenSettings, value: String) -> Cookie<'static> {
    Cookie::build(settings.cookie_name.clone(), value)
        .path(settings.cookie_path.clone())
        .http_only(true)
        .secure(settings.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(settings.expiry_days))
        .finish()
}

fn removal_cookie(settings: &RefreshTokenSettings) -> Cookie<'static> {
    let mut cookie = refresh_cookie(settings, String::new());
    cookie.make_removal();
    cookie
}

fn presented_refresh_token(req: &HttpRequest, settings: &RefreshTokenSettings) -> Option<String> {
    req.cookie(&settings.cookie_name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

fn session_response(
    status: actix_web::http::StatusCode,
    tokens: SessionTokens,
    settings: &RefreshTokenSettings,
) -> HttpResponse {
    HttpResponse::build(status)
        .cookie(refresh_cookie(settings, tokens.refresh_token))
        .json(AccessTokenResponse {
            access_token: tokens.access_token,
            token_type: "Bearer".to_string(),
            expires_in: tokens.access_expires_in,
        })
}

/// POST /auth/register
///
/// # Errors
/// - 400: Validation error or email already registered
/// - 500: Internal server error
pub async fn register(
    form: web::Json<RegisterRequest>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    let user = service.register(&form.email, &form.password).await?;

    tracing::info!(
        user_id = %user.id,
        "Registration completed"
    );
    Ok(HttpResponse::Created().json(StatusResponse::new("user created")))
}

/// POST /auth/login
///
/// Returns an access token in the body and sets the refresh cookie, scoped to
/// the refresh path.
///
/// # Errors
/// - 401: Invalid credentials (same response for unknown email and wrong password)
/// - 403: Account is inactive
pub async fn login(
    req: HttpRequest,
    form: web::Json<LoginRequest>,
    service: web::Data<SessionService>,
    cookie_settings: web::Data<RefreshTokenSettings>,
) -> Result<HttpResponse, AppError> {
    let tokens = service
        .login(&form.email, &form.password, client_origin(&req))
        .await?;

    tracing::info!(
        user_id = %tokens.user_id,
        "Login completed"
    );
    Ok(session_response(
        actix_web::http::StatusCode::OK,
        tokens,
        cookie_settings.get_ref(),
    ))
}

/// POST /auth/refresh
///
/// Rotates the refresh cookie and returns a new access token.
///
/// # Errors
/// - 401: Missing, unknown, reused or expired refresh token
/// - 403: Associated account is inactive
pub async fn refresh(
    req: HttpRequest,
    service: web::Data<SessionService>,
    cookie_settings: web::Data<RefreshTokenSettings>,
) -> Result<HttpResponse, AppError> {
    let presented = presented_refresh_token(&req, cookie_settings.get_ref())
        .ok_or(AppError::Auth(AuthError::MissingToken))?;

    let tokens = service.refresh(&presented, client_origin(&req)).await?;

    tracing::info!(
        user_id = %tokens.user_id,
        "Token refresh completed"
    );
    Ok(session_response(
        actix_web::http::StatusCode::OK,
        tokens,
        cookie_settings.get_ref(),
    ))
}

/// POST /auth/logout
///
/// Always clears the refresh cookie and reports success, whether or not the
/// presented token was still valid.
pub async fn logout(
    req: HttpRequest,
    service: web::Data<SessionService>,
    cookie_settings: web::Data<RefreshTokenSettings>,
) -> Result<HttpResponse, AppError> {
    if let Some(presented) = presented_refresh_token(&req, cookie_settings.get_ref()) {
        service.logout(&presented).await?;
    }

    Ok(HttpResponse::Ok()
        .cookie(removal_cookie(cookie_settings.get_ref()))
        .json(StatusResponse::new("logged out")))
}

/// POST /auth/forgot-password
///
/// # Errors
/// - 404: No account with this email
/// - 503: Mail delivery failed
pub async fn forgot_password(
    form: web::Json<ForgotPasswordRequest>,
    service: web::Data<SessionService>,
    delivery: web::Data<ResetDelivery>,
) -> Result<HttpResponse, AppError> {
    let (user, reset_token) = service.request_password_reset(&form.email).await?;

    match delivery.get_ref() {
        ResetDelivery::Inline => {
            Ok(HttpResponse::Ok().json(ForgotPasswordResponse { reset_token }))
        }
        ResetDelivery::Email(client) => {
            client.send_password_reset(&user.email, &reset_token).await?;
            Ok(HttpResponse::Ok().json(StatusResponse::new("reset link sent")))
        }
    }
}

/// POST /auth/change-password
///
/// # Errors
/// - 400: Invalid or expired reset token, or new password outside policy
/// - 404: User behind the token no longer exists
pub async fn change_password(
    form: web::Json<ChangePasswordRequest>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    service
        .complete_password_reset(&form.token, &form.new_password)
        .await?;

    Ok(HttpResponse::Ok().json(StatusResponse::new("password changed")))
}

/// GET /api/me
///
/// **Requires valid access token**; claims are injected by `JwtMiddleware`.
pub async fn get_current_user(
    claims: web::ReqData<Claims>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    let user = service.current_user(claims.user_id()?).await?;

    Ok(HttpResponse::Ok().json(UserResponse {
        id: user.id.to_string(),
        email: user.email,
        is_active: user.is_active,
        is_superuser: user.is_superuser,
        created_at: user.created_at.to_rfc3339(),
    }))
}
