use actix_web::dev::Server;
use actix_web::{error, middleware::Logger, web, App, HttpServer};
use std::net::TcpListener;

use crate::configuration::RefreshTokenSettings;
use crate::error::{AppError, ValidationError};
use crate::logger::LoggerMiddleware;
use crate::middleware::JwtMiddleware;
use crate::routes::{
    change_password, forgot_password, get_current_user, health_check, login, logout, refresh,
    register, ResetDelivery,
};
use crate::session::SessionService;

const JSON_BODY_LIMIT: usize = 4096;

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(JSON_BODY_LIMIT)
        .error_handler(|err, _req| {
            tracing::debug!(error = %err, "Rejected request body");
            let app_error = AppError::Validation(ValidationError::InvalidFormat(
                "Request body is not valid JSON for this endpoint".to_string(),
            ));
            error::Error::from(app_error)
        })
}

pub fn run(
    listener: TcpListener,
    service: SessionService,
    cookie_settings: RefreshTokenSettings,
    reset_delivery: ResetDelivery,
) -> Result<Server, std::io::Error> {
    let service = web::Data::new(service);
    let cookie_settings = web::Data::new(cookie_settings);
    let reset_delivery = web::Data::new(reset_delivery);

    let server = HttpServer::new(move || {
        App::new()
            // Global middleware
            .wrap(Logger::default())
            .wrap(LoggerMiddleware)

            // Shared state
            .app_data(json_config())
            .app_data(service.clone())
            .app_data(cookie_settings.clone())
            .app_data(reset_delivery.clone())

            // Public routes
            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/auth")
                    .route("/register", web::post().to(register))
                    .route("/login", web::post().to(login))
                    .route("/refresh", web::post().to(refresh))
                    .route("/logout", web::post().to(logout))
                    .route("/forgot-password", web::post().to(forgot_password))
                    .route("/change-password", web::post().to(change_password)),
            )

            // Protected routes (require an access token)
            .service(
                web::scope("/api")
                    .wrap(JwtMiddleware::new(service.clone()))
                    .route("/me", web::get().to(get_current_user)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
