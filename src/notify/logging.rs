use async_trait::async_trait;

use super::{DeliveryError, NotificationSink, PostNotification, StatusMessage};

/// Sink that only logs. Used for `--dry-run` and when no webhook is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, post: &PostNotification) -> Result<(), DeliveryError> {
        tracing::info!(
            account = %post.account_name,
            id = %post.external_id,
            title = %post.title,
            url = post.url.as_deref().unwrap_or(""),
            "New post"
        );
        Ok(())
    }

    async fn report_status(&self, status: &StatusMessage) -> Result<(), DeliveryError> {
        tracing::info!(fields = status.fields.len(), "{}", status.title);
        for (name, value) in &status.fields {
            tracing::info!("  {name}: {value}");
        }
        Ok(())
    }
}
