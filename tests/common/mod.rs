#![allow(dead_code)]

use authcore::clock::ManualClock;
use authcore::configuration::{
    ApplicationSettings, DatabaseSettings, JwtSettings, PasswordSettings, RefreshTokenSettings,
    Settings,
};
use authcore::routes::ResetDelivery;
use authcore::session::SessionService;
use authcore::startup::run;
use authcore::store::{InMemoryRefreshTokenStore, InMemoryUserStore};
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::sync::Arc;

pub const REFRESH_COOKIE: &str = "refresh_token";

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub clock: Arc<ManualClock>,
    pub users: Arc<InMemoryUserStore>,
    pub tokens: Arc<InMemoryRefreshTokenStore>,
}

pub fn test_settings() -> Settings {
    Settings {
        database: DatabaseSettings {
            url: Some("postgres://unused".to_string()),
            username: String::new(),
            password: String::new(),
            port: 5432,
            host: "localhost".to_string(),
            database_name: String::new(),
            max_connections: 1,
        },
        application: ApplicationSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        jwt: JwtSettings {
            access_secret: "integration-access-secret-0123456789abcdef".to_string(),
            reset_secret: "integration-reset-secret-0123456789abcdef".to_string(),
            algorithm: "HS256".to_string(),
            issuer: "authcore-integration".to_string(),
            access_token_expiry_minutes: 30,
            reset_token_expiry_seconds: 900,
        },
        refresh: RefreshTokenSettings {
            expiry_days: 7,
            cookie_name: REFRESH_COOKIE.to_string(),
            cookie_path: "/auth".to_string(),
            cookie_secure: false,
            revoke_family_on_reuse: true,
            reuse_grace_seconds: 5,
        },
        password: PasswordSettings {
            min_length: 3,
            require_character_classes: false,
            memory_kib: 1024,
            iterations: 1,
            ..PasswordSettings::default()
        },
        email_client: None,
    }
}

/// Start the server on a random port against in-memory stores and a
/// manually advanced clock.
pub fn spawn_app() -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    let settings = test_settings();
    let clock = Arc::new(ManualClock::default());
    let users = Arc::new(InMemoryUserStore::new());
    let tokens = Arc::new(InMemoryRefreshTokenStore::new());

    let service =
        SessionService::from_settings(&settings, users.clone(), tokens.clone(), clock.clone())
            .expect("Failed to build session service");
    let server = run(listener, service, settings.refresh.clone(), ResetDelivery::Inline)
        .expect("Failed to bind address");
    let _ = tokio::spawn(server);

    TestApp {
        address,
        client: reqwest::Client::new(),
        clock,
        users,
        tokens,
    }
}

/// Value of the refresh cookie set by a response, if any
pub fn refresh_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{}=", REFRESH_COOKIE)))
        .and_then(|value| value.split(';').next())
        .map(|pair| pair[REFRESH_COOKIE.len() + 1..].to_string())
}

/// Full `Set-Cookie` header for the refresh cookie
pub fn raw_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{}=", REFRESH_COOKIE)))
        .map(|value| value.to_string())
}

impl TestApp {
    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(&format!("{}{}", self.address, path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn register(&self, email: &str, password: &str) -> reqwest::Response {
        self.post_json("/auth/register", &json!({ "email": email, "password": password }))
            .await
    }

    pub async fn login(&self, email: &str, password: &str) -> reqwest::Response {
        self.post_json("/auth/login", &json!({ "email": email, "password": password }))
            .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> reqwest::Response {
        self.client
            .post(&format!("{}/auth/refresh", self.address))
            .header("Cookie", format!("{}={}", REFRESH_COOKIE, refresh_token))
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn logout(&self, refresh_token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.post(&format!("{}/auth/logout", self.address));
        if let Some(token) = refresh_token {
            request = request.header("Cookie", format!("{}={}", REFRESH_COOKIE, token));
        }
        request.send().await.expect("Failed to execute request.")
    }

    pub async fn me(&self, access_token: &str) -> reqwest::Response {
        self.client
            .get(&format!("{}/api/me", self.address))
            .bearer_auth(access_token)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    /// Register and log in, returning (access token, refresh token)
    pub async fn signed_in(&self, email: &str, password: &str) -> (String, String) {
        assert_eq!(201, self.register(email, password).await.status().as_u16());
        let response = self.login(email, password).await;
        assert_eq!(200, response.status().as_u16());

        let refresh_token = refresh_cookie(response.headers()).expect("Missing refresh cookie");
        let body: Value = response.json().await.expect("Failed to parse response");
        let access_token = body["access_token"].as_str().unwrap().to_string();
        (access_token, refresh_token)
    }
}
