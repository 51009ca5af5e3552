use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{DeliveryError, NotificationSink, PostNotification, StatusMessage};

/// Posts chat embeds to a webhook (Discord-compatible JSON).
///
/// The webhook URL embeds its credential, so it is kept as a
/// [`SecretString`] and never logged.
pub struct WebhookSink {
    client: reqwest::Client,
    url: SecretString,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: SecretString) -> Self {
        Self { client, url }
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.url.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DeliveryError::Transient(format!("webhook returned {status}")));
        }

        // Other 4xx: the payload itself was rejected, resending will not help
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(200).collect();
        Err(DeliveryError::Permanent(format!(
            "webhook returned {status}: {body}"
        )))
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    embeds: [Embed<'a>; 1],
}

#[derive(Serialize)]
struct Embed<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<EmbedAuthor<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<EmbedField<'a>>,
}

#[derive(Serialize)]
struct EmbedAuthor<'a> {
    name: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_url: Option<&'a str>,
}

#[derive(Serialize)]
struct EmbedImage<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct EmbedField<'a> {
    name: &'a str,
    value: &'a str,
    inline: bool,
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, post: &PostNotification) -> Result<(), DeliveryError> {
        let embed = Embed {
            title: &post.title,
            url: post.url.as_deref(),
            description: post.description.as_deref(),
            timestamp: post.published_at.map(|d| d.to_rfc3339()),
            author: Some(EmbedAuthor {
                name: &post.account_name,
                url: &post.account_url,
                icon_url: post.account_icon_url.as_deref(),
            }),
            image: post.image_url.as_deref().map(|url| EmbedImage { url }),
            fields: Vec::new(),
        };

        self.post(&WebhookPayload { embeds: [embed] }).await?;
        tracing::debug!(account = %post.account_name, id = %post.external_id, "Webhook delivered post");
        Ok(())
    }

    async fn report_status(&self, status: &StatusMessage) -> Result<(), DeliveryError> {
        let embed = Embed {
            title: &status.title,
            url: status.url.as_deref(),
            description: None,
            timestamp: None,
            author: None,
            image: status.image_url.as_deref().map(|url| EmbedImage { url }),
            fields: status
                .fields
                .iter()
                .map(|(name, value)| EmbedField {
                    name,
                    value,
                    inline: false,
                })
                .collect(),
        };

        self.post(&WebhookPayload { embeds: [embed] }).await
    }
}
