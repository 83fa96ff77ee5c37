/// Middleware module
///
/// Bearer access token guard for the protected `/api` scope. The access log
/// middleware lives in `logger`.

mod jwt_middleware;

pub use jwt_middleware::JwtMiddleware;
