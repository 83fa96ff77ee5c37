use authcore::clock::SystemClock;
use authcore::configuration::get_configuration;
use authcore::email_client::EmailClient;
use authcore::routes::ResetDelivery;
use authcore::session::SessionService;
use authcore::startup::run;
use authcore::store::{PgRefreshTokenStore, PgUserStore};
use authcore::telemetry::init_telemetry;
use sqlx::postgres::PgPoolOptions;
use std::net::TcpListener;
use std::sync::Arc;

fn startup_error(kind: std::io::ErrorKind, message: &str) -> std::io::Error {
    std::io::Error::new(kind, message.to_string())
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    tracing::info!("Starting application");

    let configuration = get_configuration().map_err(|e| {
        tracing::error!("Failed to read configuration: {}", e);
        startup_error(std::io::ErrorKind::InvalidInput, "Configuration error")
    })?;
    tracing::info!("Configuration loaded successfully");

    tracing::info!("Attempting to connect to database");
    let pool = PgPoolOptions::new()
        .max_connections(configuration.database.max_connections)
        .connect(&configuration.database.connection_string())
        .await
        .map_err(|e| {
            tracing::error!("Failed to create connection pool: {}", e);
            startup_error(std::io::ErrorKind::ConnectionRefused, "Database connection error")
        })?;

    tracing::info!("Database connection pool created successfully");

    let service = SessionService::from_settings(
        &configuration,
        Arc::new(PgUserStore::new(pool.clone())),
        Arc::new(PgRefreshTokenStore::new(pool)),
        Arc::new(SystemClock),
    )
    .map_err(|e| {
        tracing::error!("Failed to build session service: {}", e);
        startup_error(std::io::ErrorKind::InvalidInput, "Configuration error")
    })?;

    let reset_delivery = match &configuration.email_client {
        Some(settings) => {
            let client = EmailClient::from_settings(settings).map_err(|e| {
                tracing::error!("Failed to build email client: {}", e);
                startup_error(std::io::ErrorKind::InvalidInput, "Email client error")
            })?;
            ResetDelivery::Email(client)
        }
        None => {
            tracing::warn!("No email client configured; reset tokens are returned in responses");
            ResetDelivery::Inline
        }
    };

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!("Server listening on: {}", address);

    let server = run(listener, service, configuration.refresh.clone(), reset_delivery)?;
    server.await
}
