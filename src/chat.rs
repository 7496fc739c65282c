use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

pub type ChatSender = broadcast::Sender<String>;
pub type ChatReceiver = broadcast::Receiver<String>;

/// Events relayed over the chat socket. REST writes go through the same
/// payloads so both transports stay in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message { message: ChatMessagePayload },
    Typing { conversation_id: Uuid, from_user_id: Uuid },
    Read { conversation_id: Uuid, by_user_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// In-process presence registry: user_id -> broadcast sender feeding that
/// user's open sockets. Nothing survives a restart; clients reconnect and
/// re-fetch history over REST.
pub struct ChatRegistry {
    channels: RwLock<HashMap<Uuid, ChatSender>>,
}

impl ChatRegistry {
    pub fn new() -> Self {
        ChatRegistry {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// A user may hold several sockets (tabs); they share one channel.
    pub async fn subscribe(&self, user_id: Uuid) -> ChatReceiver {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(100).0)
            .subscribe()
    }

    /// Best-effort delivery; an offline peer just misses the live event.
    pub async fn send_to(&self, user_id: Uuid, event: &ChatEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                debug!("chat event serialization failed: {e}");
                return;
            }
        };
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&user_id) {
            if sender.send(payload).is_err() {
                debug!("no live sockets for user {user_id}");
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let channels = self.channels.read().await;
        channels
            .get(&user_id)
            .map(|s| s.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Drop the channel once the last socket hangs up.
    pub async fn reap(&self, user_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&user_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&user_id);
                debug!("reaped chat channel for user {user_id}");
            }
        }
    }
}

impl Default for ChatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events() {
        let registry = ChatRegistry::new();
        let user = Uuid::new_v4();
        let mut rx = registry.subscribe(user).await;

        registry
            .send_to(
                user,
                &ChatEvent::Typing {
                    conversation_id: Uuid::new_v4(),
                    from_user_id: Uuid::new_v4(),
                },
            )
            .await;

        let raw = rx.recv().await.unwrap();
        assert!(raw.contains("\"type\":\"typing\""));
    }

    #[tokio::test]
    async fn presence_tracks_receivers() {
        let registry = ChatRegistry::new();
        let user = Uuid::new_v4();
        assert!(!registry.is_online(user).await);

        let rx = registry.subscribe(user).await;
        assert!(registry.is_online(user).await);

        drop(rx);
        assert!(!registry.is_online(user).await);
        registry.reap(user).await;
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_a_noop() {
        let registry = ChatRegistry::new();
        registry
            .send_to(
                Uuid::new_v4(),
                &ChatEvent::Read {
                    conversation_id: Uuid::new_v4(),
                    by_user_id: Uuid::new_v4(),
                },
            )
            .await;
    }
}
