use std::{fmt::Display, future::Future, pin::Pin, sync::Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Result type for publish operations.
pub type PublishResult<T> = Result<T, PublishError>;

/// Boxed future type for publish operations, enabling object safety.
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = PublishResult<()>> + Send + 'a>>;

/// Errors that can occur while publishing a notification.
#[derive(Debug)]
pub enum PublishError {
    /// The notification could not be serialized.
    Serialization(String),
    /// The backend could not be reached.
    Connection(String),
    /// The backend refused the notification.
    Publish(String),
}

impl Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            PublishError::Connection(msg) => write!(f, "Connection error: {msg}"),
            PublishError::Publish(msg) => write!(f, "Publish error: {msg}"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Notification published for every route that matched a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub date: String,
    /// Link to the stored raw message carrying its expiry, and a
    /// signature when the store signs its links.
    pub presigned_url: String,
}

impl NotificationMessage {
    pub fn to_json(&self) -> PublishResult<String> {
        serde_json::to_string(self).map_err(|e| PublishError::Serialization(e.to_string()))
    }
}

/// Trait for topic based notification backends.
pub trait Publisher: Send + Sync {
    /// Publishes `message` on `topic`.
    fn publish<'a>(&'a self, topic: &'a str, message: &'a NotificationMessage)
        -> PublishFuture<'a>;

    /// Returns the name of this publisher.
    fn name(&self) -> &str;
}

/// Publisher writing every notification to the log.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a NotificationMessage,
    ) -> PublishFuture<'a> {
        Box::pin(async move {
            let json = message.to_json()?;
            info!(topic = %topic, message_id = %message.id, payload = %json, "Notification");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// In-memory publisher recording `(topic, message)` pairs.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, NotificationMessage)>>,
    failing: bool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a publisher that rejects every notification.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<(String, NotificationMessage)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Publisher for MemoryPublisher {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a NotificationMessage,
    ) -> PublishFuture<'a> {
        Box::pin(async move {
            if self.failing {
                return Err(PublishError::Publish(format!("topic {topic} unavailable")));
            }
            self.published
                .lock()
                .map_err(|_| PublishError::Publish("memory publisher lock poisoned".to_string()))?
                .push((topic.to_string(), message.clone()));
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(feature = "redis")]
pub use self::redis_publisher::RedisPublisher;

#[cfg(feature = "redis")]
mod redis_publisher {
    use tracing::{debug, error, info};

    use super::{NotificationMessage, PublishError, PublishFuture, Publisher};

    /// Publisher sending notifications with `PUBLISH`, one channel per topic.
    pub struct RedisPublisher {
        client: redis::Client,
    }

    impl RedisPublisher {
        /// Creates a new [`RedisPublisher`] for the given Redis URL.
        pub fn new(url: &str) -> Result<Self, PublishError> {
            let client = redis::Client::open(url).map_err(|e| {
                error!(url = %url, error = %e, "Failed to create Redis client");
                PublishError::Connection(format!("Failed to create Redis client: {e}"))
            })?;
            info!(url = %url, "Redis publisher initialized");
            Ok(Self { client })
        }
    }

    impl Publisher for RedisPublisher {
        fn publish<'a>(
            &'a self,
            topic: &'a str,
            message: &'a NotificationMessage,
        ) -> PublishFuture<'a> {
            Box::pin(async move {
                let json = message.to_json()?;

                debug!(
                    message_id = %message.id,
                    topic = %topic,
                    size = json.len(),
                    "Connecting to Redis"
                );

                let mut conn = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| {
                        error!(error = %e, "Failed to connect to Redis");
                        PublishError::Connection(format!("Failed to connect to Redis: {e}"))
                    })?;

                redis::cmd("PUBLISH")
                    .arg(topic)
                    .arg(&json)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| {
                        error!(
                            topic = %topic,
                            message_id = %message.id,
                            error = %e,
                            "Failed to PUBLISH to Redis"
                        );
                        PublishError::Publish(format!("Failed to publish to Redis: {e}"))
                    })?;

                info!(message_id = %message.id, topic = %topic, "Published notification");
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "redis"
        }
    }
}
