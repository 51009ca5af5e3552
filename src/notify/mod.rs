//! Notification sinks: where new posts and status messages go.
//!
//! The engine talks to the [`NotificationSink`] trait only. Two
//! implementations ship with the crate:
//!
//! - [`WebhookSink`] posts chat embeds to a webhook URL
//! - [`LogSink`] writes notifications to the tracing log (dry runs)

mod logging;
mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::storage::{Account, Item};
use crate::util::{sanitize_text, truncate_description, MAX_DESCRIPTION_LENGTH};

pub use logging::LogSink;
pub use webhook::WebhookSink;

/// Why a delivery attempt did not go through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Rate limit, timeout, server error: retrying may succeed
    #[error("Transient delivery failure: {0}")]
    Transient(String),
    /// The sink will never accept this payload
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// A new post ready to hand to a sink.
///
/// Text fields are already sanitized and the description is already
/// shortened, so sinks can render them as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostNotification {
    pub external_id: String,
    pub account_name: String,
    pub account_url: String,
    pub account_icon_url: Option<String>,
    pub title: String,
    pub url: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl PostNotification {
    pub fn new(account: &Account, item: &Item) -> Self {
        let description = item.description.as_deref().map(|d| {
            let clean = sanitize_text(d);
            truncate_description(&clean, MAX_DESCRIPTION_LENGTH).into_owned()
        });

        Self {
            external_id: item.external_id.clone(),
            account_name: account.name.clone(),
            account_url: account.profile_url.clone(),
            account_icon_url: account.icon_url.clone(),
            title: sanitize_text(&item.title).into_owned(),
            url: item.url.clone(),
            description,
            image_url: item.image_url.clone(),
            published_at: item
                .published_at
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        }
    }
}

/// Operator-facing text that is not a post ("already watching alice").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusMessage {
    pub title: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    /// Name/value rows, e.g. one per watched account
    pub fields: Vec<(String, String)>,
}

impl StatusMessage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_account(mut self, account: &Account) -> Self {
        self.url = Some(account.profile_url.clone());
        self.image_url = account.icon_url.clone();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// Delivers posts and status messages to an operator-facing channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one post. `Ok(())` means the sink confirmed receipt.
    async fn deliver(&self, post: &PostNotification) -> Result<(), DeliveryError>;

    /// Deliver a status message. Callers log failures and move on.
    async fn report_status(&self, status: &StatusMessage) -> Result<(), DeliveryError>;
}
