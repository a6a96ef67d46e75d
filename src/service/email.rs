use crate::config::EmailConfig;
use crate::error::app_error::AppError;
use chrono::{DateTime, Utc};
use html_escape::{encode_double_quoted_attribute, encode_text};
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Everything the account owner needs to decide about a new device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeviceAlert {
    pub recipient: String,
    pub device_id: String,
    pub requested_at: DateTime<Utc>,
    pub confirm_url: String,
    pub reject_url: String,
}

#[async_trait::async_trait]
pub trait DeviceAlertNotifier: Send + Sync {
    async fn send_new_device_alert(&self, alert: &NewDeviceAlert) -> Result<(), AppError>;
}

pub struct EmailService {
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn generate_alert_html(&self, alert: &NewDeviceAlert) -> String {
        format!(
            r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>New sign-in request</title>
    <style>
        body {{
            margin: 0;
            padding: 0;
            background-color: #FAFBFC;
            color: #141517;
            font-family: Inter, -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif;
            line-height: 1.6;
        }}
        .card {{
            max-width: 560px;
            margin: 28px auto;
            background-color: #FFFFFF;
            border: 1px solid rgba(0, 0, 0, 0.08);
            border-radius: 16px;
            padding: 24px;
        }}
        .meta {{
            background-color: #F3F4F6;
            border-radius: 8px;
            padding: 12px 16px;
            font-family: ui-monospace, Menlo, monospace;
            font-size: 13px;
        }}
        .button {{
            display: inline-block;
            padding: 10px 18px;
            border-radius: 8px;
            text-decoration: none;
            font-weight: 600;
            margin-right: 8px;
        }}
        .confirm {{ background-color: #141517; color: #FFFFFF !important; }}
        .reject {{ border: 1px solid #D92D20; color: #D92D20 !important; }}
    </style>
</head>
<body>
    <div class="card">
        <h1 style="font-size: 20px;">New sign-in request</h1>
        <p>A device that is not trusted yet tried to sign in to your account.
        Your account already uses all of its trusted device slots, so the
        oldest trusted device will be signed out if you approve.</p>
        <p class="meta">Device: {device_id}<br>Requested at: {requested_at}</p>
        <p>
            <a class="button confirm" href="{confirm_url}">Yes, this was me</a>
            <a class="button reject" href="{reject_url}">No, block it</a>
        </p>
        <p style="font-size: 13px; color: #6B7280;">If you do nothing the request expires on its own.</p>
    </div>
</body>
</html>"##,
            // device_id is client supplied
            device_id = encode_text(&alert.device_id),
            requested_at = alert.requested_at.to_rfc2822(),
            confirm_url = encode_double_quoted_attribute(&alert.confirm_url),
            reject_url = encode_double_quoted_attribute(&alert.reject_url),
        )
    }

    fn generate_alert_text(&self, alert: &NewDeviceAlert) -> String {
        format!(
            "A device that is not trusted yet tried to sign in to your account.\n\n\
             Device: {}\n\
             Requested at: {}\n\n\
             Approve it (your oldest trusted device will be signed out):\n{}\n\n\
             Block it:\n{}\n\n\
             If you do nothing the request expires on its own.\n",
            alert.device_id,
            alert.requested_at.to_rfc2822(),
            alert.confirm_url,
            alert.reject_url,
        )
    }

    async fn send_email(&self, to_email: &str, subject: &str, html_body: String, text_body: String) -> Result<(), AppError> {
        let email = Message::builder()
            .from(
                format!("{} <{}>", self.config.from_name, self.config.from_address)
                    .parse()
                    .map_err(|e| AppError::email(format!("Invalid from address: {}", e)))?,
            )
            .to(to_email.parse().map_err(|e| AppError::email(format!("Invalid to address: {}", e)))?)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(text_body, html_body))
            .map_err(|e| AppError::email(format!("Failed to build email: {}", e)))?;

        let creds = Credentials::new(self.config.smtp_username.clone(), self.config.smtp_password.clone());

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)
            .map_err(|e| AppError::email(format!("Failed to create SMTP transport: {}", e)))?
            .credentials(creds)
            .port(self.config.smtp_port)
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| AppError::email(format!("Failed to send email: {}", e)))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl DeviceAlertNotifier for EmailService {
    async fn send_new_device_alert(&self, alert: &NewDeviceAlert) -> Result<(), AppError> {
        if !self.config.enabled {
            tracing::warn!(device_id = %alert.device_id, "Email service is disabled, skipping new device alert");
            return Ok(());
        }

        let html_body = self.generate_alert_html(alert);
        let text_body = self.generate_alert_text(alert);
        self.send_email(&alert.recipient, "New sign-in request", html_body, text_body).await?;

        tracing::info!(device_id = %alert.device_id, "New device alert sent");
        Ok(())
    }
}
