use serde::Serialize;

use crate::configuration::EmailClientSettings;
use crate::error::{AppError, EmailError};
use crate::validators::normalize_email;

/// HTTP mail API client used to deliver password-reset links out of band
#[derive(Clone)]
pub struct EmailClient {
    http_client: reqwest::Client,
    base_url: String,
    sender: SenderEmail,
    reset_link_template: String,
}

#[derive(Clone, Debug)]
pub struct SenderEmail(String);

impl SenderEmail {
    pub fn parse(s: &str) -> Result<Self, EmailError> {
        let email = normalize_email(s).map_err(|e| EmailError::InvalidRecipient(e.to_string()))?;
        Ok(Self(email))
    }

    pub fn inner(&self) -> &str {
        &self.0
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "Html")]
    html: &'a str,
    #[serde(rename = "Text")]
    text: &'a str,
}

impl EmailClient {
    pub fn from_settings(settings: &EmailClientSettings) -> Result<Self, AppError> {
        let sender = SenderEmail::parse(&settings.sender_email)?;
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(settings.timeout_milliseconds))
            .build()
            .map_err(|e| AppError::Email(EmailError::SendFailed(e.to_string())))?;

        Ok(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            sender,
            reset_link_template: settings.reset_link_template.clone(),
        })
    }

    fn reset_link(&self, reset_token: &str) -> String {
        self.reset_link_template.replace("{token}", reset_token)
    }

    /// Send the password-reset link for `reset_token` to `recipient`
    pub async fn send_password_reset(&self, recipient: &str, reset_token: &str) -> Result<(), AppError> {
        let link = self.reset_link(reset_token);
        let html = format!(
            "Use <a href=\"{}\">this link</a> to choose a new password. It expires shortly.",
            link
        );
        let text = format!("Visit {} to choose a new password. It expires shortly.", link);

        self.send_email(recipient, "Reset your password", &html, &text).await
    }

    async fn send_email(
        &self,
        recipient: &str,
        subject: &str,
        html_content: &str,
        text_content: &str,
    ) -> Result<(), AppError> {
        let url = format!("{}/email", self.base_url);
        let request = SendEmailRequest {
            from: self.sender.inner(),
            to: recipient,
            subject,
            html: html_content,
            text: text_content,
        };

        self.http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send email");
                AppError::Email(EmailError::SendFailed(e.to_string()))
            })?
            .error_for_status()
            .map_err(|e| {
                tracing::error!(error = %e, "Email service returned error");
                AppError::Email(EmailError::SendFailed(e.to_string()))
            })?;

        Ok(())
    }
}
