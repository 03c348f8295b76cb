//! Notification fallback for recipients without a live delivery.
//!
//! Pushes run as a background task set detached from the request. Each
//! attempt's outcome is collected into a [`PushReport`]; endpoints the
//! provider reports as gone or rejected are pruned from the store, transient
//! failures are only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::constants::PUSH_BODY_PREVIEW_LEN;
use parley_shared::{ConversationRef, MessageId, UserId};
use parley_store::Message;

use crate::error::DeliveryWarning;
use crate::storage::{with_db, SharedDatabase};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("endpoint no longer exists")]
    Gone,

    #[error("provider rejected the notification with status {0}")]
    Rejected(u16),

    #[error("endpoint cannot be addressed: {0}")]
    InvalidEndpoint(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl PushError {
    /// Whether the subscription should be dropped after this failure.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PushError::Gone | PushError::Rejected(_) | PushError::InvalidEndpoint(_)
        )
    }
}

/// Body POSTed to a push endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub conversation: ConversationRef,
    pub message_id: MessageId,
    pub sender_id: UserId,
}

impl PushNotification {
    pub fn for_message(message: &Message) -> Self {
        let title = if message.conversation.is_group() {
            "New group message"
        } else {
            "New message"
        };

        let body = match &message.text {
            Some(text) => preview(text),
            None => "Sent an image".to_string(),
        };

        Self {
            title: title.to_string(),
            body,
            conversation: message.conversation,
            message_id: message.id,
            sender_id: message.sender_id,
        }
    }

    pub fn for_reaction(
        conversation: ConversationRef,
        message_id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> Self {
        Self {
            title: "New reaction".to_string(),
            body: format!("Reacted {emoji} to a message"),
            conversation,
            message_id,
            sender_id: user,
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PUSH_BODY_PREVIEW_LEN {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(PUSH_BODY_PREVIEW_LEN).collect();
    cut.push('…');
    cut
}

/// Delivers one notification to one endpoint.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, endpoint: &str, notification: &PushNotification) -> Result<(), PushError>;
}

/// POSTs the notification as JSON to the subscription endpoint.
pub struct WebhookGateway {
    client: reqwest::Client,
}

impl WebhookGateway {
    pub fn new(timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushGateway for WebhookGateway {
    async fn send(&self, endpoint: &str, notification: &PushNotification) -> Result<(), PushError> {
        let response = self
            .client
            .post(endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    PushError::InvalidEndpoint(e.to_string())
                } else {
                    PushError::Transport(e.to_string())
                }
            })?;

        classify(response.status())
    }
}

fn classify(status: StatusCode) -> Result<(), PushError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        Err(PushError::Gone)
    } else if status.is_client_error() {
        Err(PushError::Rejected(status.as_u16()))
    } else {
        Err(PushError::Transport(format!("unexpected status {status}")))
    }
}

/// Used when push is disabled: records what would have been sent.
pub struct LogGateway;

#[async_trait]
impl PushGateway for LogGateway {
    async fn send(&self, endpoint: &str, notification: &PushNotification) -> Result<(), PushError> {
        info!(
            endpoint = %endpoint,
            title = %notification.title,
            message = %notification.message_id,
            "Push disabled, notification not sent"
        );
        Ok(())
    }
}

/// Outcome of one fallback dispatch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub delivered: usize,
    pub failed: usize,
    pub pruned: usize,
}

#[derive(Clone)]
pub struct NotificationFallback {
    db: SharedDatabase,
    gateway: Arc<dyn PushGateway>,
}

impl NotificationFallback {
    pub fn new(db: SharedDatabase, gateway: Arc<dyn PushGateway>) -> Self {
        Self { db, gateway }
    }

    /// Push `notification` to every subscription of `recipients` in the
    /// background. The handle resolves once all attempts have finished.
    pub fn dispatch(
        &self,
        recipients: Vec<UserId>,
        notification: PushNotification,
    ) -> JoinHandle<PushReport> {
        let fallback = self.clone();
        tokio::spawn(async move { fallback.deliver(recipients, notification).await })
    }

    async fn deliver(&self, recipients: Vec<UserId>, notification: PushNotification) -> PushReport {
        let mut report = PushReport::default();
        if recipients.is_empty() {
            return report;
        }

        let subscriptions =
            match with_db(&self.db, move |db| db.push_subscriptions_for(&recipients)).await {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    warn!(error = %e, "Failed to load push subscriptions");
                    return report;
                }
            };

        if subscriptions.is_empty() {
            debug!(message = %notification.message_id, "No push subscriptions for offline recipients");
            return report;
        }

        let notification = Arc::new(notification);
        let mut attempts = JoinSet::new();
        for subscription in subscriptions {
            let gateway = Arc::clone(&self.gateway);
            let notification = Arc::clone(&notification);
            attempts.spawn(async move {
                let result = gateway.send(&subscription.endpoint, &notification).await;
                (subscription, result)
            });
        }

        let mut stale: Vec<Uuid> = Vec::new();
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((subscription, Err(source))) => {
                    report.failed += 1;
                    let permanent = source.is_permanent();
                    if permanent {
                        stale.push(subscription.id);
                    }
                    let warning = DeliveryWarning::Push {
                        user: subscription.user_id,
                        endpoint: subscription.endpoint,
                        source,
                    };
                    warn!(warning = %warning, prune = permanent, "Push delivery failed");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Push task aborted");
                }
            }
        }

        if !stale.is_empty() {
            let result = with_db(&self.db, move |db| {
                let mut removed = 0usize;
                for id in &stale {
                    if db.remove_push_subscription(id)? {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await;

            match result {
                Ok(removed) => {
                    report.pruned = removed;
                    info!(pruned = removed, "Pruned dead push subscriptions");
                }
                Err(e) => warn!(error = %e, "Failed to prune push subscriptions"),
            }
        }

        report
    }
}
