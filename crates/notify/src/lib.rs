//! Notification delivery for rollout, alert and namespace analyses.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Notifier, RetryPolicy, SlackChannel, SlackConfig};
//! use std::sync::Arc;
//!
//! # async fn run(message: notify::AnalysisMessage) {
//! let slack = SlackChannel::new(SlackConfig {
//!     bot_token: std::env::var("SLACK_BOT_TOKEN").ok(),
//!     default_channel: Some("#deployments".to_string()),
//!     ..SlackConfig::default()
//! });
//! let notifier = Notifier::new(Arc::new(slack), RetryPolicy::default());
//!
//! let sent = notifier.deliver(None, &message).await;
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`SlackChannel`] implements Slack delivery
//! - [`Notifier`] wraps one channel with bounded retries and reports a plain
//!   sent / not-sent outcome; delivery errors never reach the caller

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod message;

pub use channels::slack::{SlackChannel, SlackConfig};
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use message::{AnalysisMessage, Severity};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on a server-requested retry delay.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Bounded retry settings for a single delivery.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Fixed pause between attempts
    pub backoff: Duration,
    /// Deadline for each attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Delivers analyses through one channel.
pub struct Notifier {
    channel: Option<Arc<dyn NotifyChannel>>,
    retry: RetryPolicy,
}

impl Notifier {
    #[must_use]
    pub fn new(channel: Arc<dyn NotifyChannel>, retry: RetryPolicy) -> Self {
        if channel.enabled() {
            info!(channel = channel.name(), "Notification channel initialized");
        } else {
            warn!(channel = channel.name(), "Notification channel is not configured");
        }
        Self {
            channel: Some(channel),
            retry,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channel: None,
            retry: RetryPolicy {
                attempts: 1,
                backoff: Duration::ZERO,
                timeout: Duration::ZERO,
            },
        }
    }

    /// Check if a usable channel is configured.
    #[must_use]
    pub fn has_channel(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.enabled())
    }

    /// Deliver `message` to `target`, retrying a fixed number of times.
    ///
    /// Returns whether the message was sent. Failures are logged, never raised.
    pub async fn deliver(&self, target: Option<&str>, message: &AnalysisMessage) -> bool {
        let Some(channel) = self.channel.as_ref().filter(|c| c.enabled()) else {
            debug!(reference = %message.reference, "No notification channel, skipping");
            return false;
        };

        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(self.retry.timeout, channel.send(target, message))
                .await
                .unwrap_or_else(|_| {
                    Err(ChannelError::Timeout(
                        u64::try_from(self.retry.timeout.as_millis()).unwrap_or(u64::MAX),
                    ))
                });

            match outcome {
                Ok(()) => {
                    debug!(channel = channel.name(), attempt, "Notification sent");
                    return true;
                }
                Err(e) => {
                    warn!(
                        channel = channel.name(),
                        attempt,
                        attempts,
                        error = %e,
                        reference = %message.reference,
                        "Failed to send notification"
                    );
                    if attempt == attempts {
                        break;
                    }
                    let pause = match e {
                        ChannelError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(retry_after_secs).min(MAX_RETRY_AFTER)
                        }
                        _ => self.retry.backoff,
                    };
                    tokio::time::sleep(pause).await;
                }
            }
        }

        false
    }
}
