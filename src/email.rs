//! Outgoing email: message building and the Brevo transactional API client.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::metrics;

/// Content id referenced by the inline `<img>` tag in the report body.
const METEOGRAM_CONTENT_ID: &str = "meteogram-image";

/// Inline attachment carried with a message.
#[derive(Debug, Clone, Serialize)]
pub struct EmailAttachment {
    pub name: String,
    /// Base64-encoded file content
    pub content_base64: String,
    pub content_id: String,
}

impl EmailAttachment {
    pub fn meteogram(png: &[u8]) -> Self {
        use base64::Engine;
        Self {
            name: "meteogram_thermal.png".to_string(),
            content_base64: base64::engine::general_purpose::STANDARD.encode(png),
            content_id: METEOGRAM_CONTENT_ID.to_string(),
        }
    }
}

/// A fully rendered outgoing message.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub attachment: Option<EmailAttachment>,
}

/// Build the report delivery email. The attachment, when present, is the
/// thermal meteogram the body's inline image points at.
pub fn report_email(
    to: &str,
    lat: f64,
    lon: f64,
    report_text: &str,
    meteogram: Option<EmailAttachment>,
) -> EmailMessage {
    let subject = format!("Your Flight Report: {}", Utc::now().format("%Y-%m-%d"));

    let report_html = html_escape(report_text).replace('\n', "<br>\n");
    let meteogram_section = if meteogram.is_some() {
        format!(
            "<div class=\"section-title\">Thermal Meteogram</div>\n\
             <div class=\"meteogram\"><img src=\"cid:{METEOGRAM_CONTENT_ID}\" alt=\"Thermal Meteogram\"></div>\n"
        )
    } else {
        String::new()
    };

    let html_body = format!(
        "<!DOCTYPE html>\n\
<html>\n\
<head>\n\
<meta charset=\"UTF-8\">\n\
<style>\n\
    body {{ font-family: 'Helvetica Neue', Helvetica, Arial, sans-serif; background-color: #f4f4f4; color: #333; margin: 0; padding: 20px; }}\n\
    .container {{ max-width: 600px; margin: 0 auto; background: #ffffff; border-radius: 12px; overflow: hidden; }}\n\
    .header {{ background: linear-gradient(135deg, #007bff, #0056b3); padding: 30px 20px; text-align: center; color: white; }}\n\
    .content {{ padding: 30px; line-height: 1.6; }}\n\
    .coords {{ text-align: center; font-size: 14px; color: #666; margin-bottom: 20px; }}\n\
    .section-title {{ border-bottom: 2px solid #eee; padding-bottom: 10px; margin-top: 30px; margin-bottom: 15px; color: #2c3e50; font-size: 18px; font-weight: bold; }}\n\
    .meteogram {{ text-align: center; margin-top: 20px; border: 1px solid #e0e0e0; border-radius: 8px; padding: 10px; }}\n\
    .meteogram img {{ width: 100%; height: auto; border-radius: 4px; }}\n\
    .footer {{ background-color: #f8f9fa; text-align: center; padding: 20px; font-size: 12px; color: #888; }}\n\
</style>\n\
</head>\n\
<body>\n\
    <div class=\"container\">\n\
        <div class=\"header\"><h1>Flight Report</h1></div>\n\
        <div class=\"content\">\n\
            <div class=\"coords\">{lat:.4}, {lon:.4}</div>\n\
            <div class=\"section-title\">AI Analysis</div>\n\
            <div class=\"interpretation\">{report_html}</div>\n\
            {meteogram_section}\
        </div>\n\
        <div class=\"footer\">\n\
            <p>Based on Open-Meteo and Meteoblue data.</p>\n\
            <p>Fly safe!</p>\n\
        </div>\n\
    </div>\n\
</body>\n\
</html>\n"
    );

    EmailMessage {
        to: to.to_string(),
        subject,
        html_body,
        attachment: meteogram,
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Delivers outgoing messages.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Brevo transactional email client.
pub struct BrevoClient {
    client: reqwest::Client,
    api_key: String,
    sender_email: String,
    sender_name: String,
    base_url: String,
}

impl BrevoClient {
    pub fn new(
        api_key: &str,
        sender_email: &str,
        sender_name: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key: api_key.to_string(),
            sender_email: sender_email.to_string(),
            sender_name: sender_name.to_string(),
            base_url: "https://api.brevo.com/v3".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Mailer for BrevoClient {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let mut body = json!({
            "sender": { "name": self.sender_name, "email": self.sender_email },
            "to": [{ "email": message.to }],
            "subject": message.subject,
            "htmlContent": message.html_body,
        });
        if let Some(attachment) = &message.attachment {
            body["attachment"] = json!([{
                "name": attachment.name,
                "content": attachment.content_base64,
                "contentId": attachment.content_id,
            }]);
        }

        let response = self
            .client
            .post(format!("{}/smtp/email", self.base_url))
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match response {
            Ok(_) => {
                metrics::record_upstream_call("brevo", "ok");
                metrics::record_email("sent");
                info!(to = %message.to, "Report email sent");
                Ok(())
            }
            Err(e) => {
                metrics::record_upstream_call("brevo", "error");
                metrics::record_email("failed");
                Err(Error::Http(e))
            }
        }
    }
}
