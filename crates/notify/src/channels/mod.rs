//! Notification channel implementations.

pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::message::AnalysisMessage;

/// Trait for notification channels (Slack, etc.).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send an analysis to `target` (a channel id or name), falling back to the
    /// channel's own default when `target` is `None`.
    async fn send(&self, target: Option<&str>, message: &AnalysisMessage)
        -> Result<(), ChannelError>;
}
