use std::collections::HashSet;

use async_trait::async_trait;
use shared::{
    channels::ChannelName,
    protocol::{ChannelEvent, Envelope, PresenceMember},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const LOCAL_BUS_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport rejected publish to channel {channel}: {reason}")]
    Rejected { channel: String, reason: String },
}

/// Server-side sink: one fire-and-forget publish per (channel, event).
/// Implementations must keep publishes to distinct channels independent; a
/// failure for one recipient channel never affects another.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &ChannelName, event: ChannelEvent) -> Result<(), PublishError>;
}

/// Client-side subscription surface. `incoming` yields every event delivered
/// to any channel this transport is subscribed to; delivery order is
/// guaranteed only within a single channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn subscribe(&self, channel: &ChannelName) -> anyhow::Result<()>;
    async fn unsubscribe(&self, channel: &ChannelName) -> anyhow::Result<()>;
    fn incoming(&self) -> broadcast::Receiver<Envelope>;
}

pub struct MissingTransport;

#[async_trait]
impl ChannelTransport for MissingTransport {
    async fn subscribe(&self, channel: &ChannelName) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("transport unavailable for channel {channel}"))
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("transport unavailable for channel {channel}"))
    }

    fn incoming(&self) -> broadcast::Receiver<Envelope> {
        broadcast::channel(1).1
    }
}

struct LocalBusState {
    subscribed: HashSet<ChannelName>,
    presence_roster: Vec<String>,
    fail_subscribe_to: HashSet<ChannelName>,
    fail_publish_to: HashSet<ChannelName>,
}

/// In-process pub/sub bus implementing both halves of the transport seam.
/// Embeddings and tests wire a publisher and a subscriber to the same bus
/// and get real fan-out semantics without a network.
pub struct LocalBus {
    state: Mutex<LocalBusState>,
    /// Handle of the user this bus represents on the presence channel.
    identity: Option<String>,
    events: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_identity(None)
    }

    /// A bus that joins the presence channel as `identity` on subscribe.
    pub fn with_identity(identity: Option<String>) -> Self {
        let (events, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self {
            state: Mutex::new(LocalBusState {
                subscribed: HashSet::new(),
                presence_roster: Vec::new(),
                fail_subscribe_to: HashSet::new(),
                fail_publish_to: HashSet::new(),
            }),
            identity,
            events,
        }
    }

    /// Seed the roster handed out in `subscription_succeeded`.
    pub async fn set_presence_roster(&self, members: Vec<String>) {
        self.state.lock().await.presence_roster = members;
    }

    /// Make the next subscribes to `channel` fail until cleared.
    pub async fn fail_subscribe_to(&self, channel: ChannelName) {
        self.state.lock().await.fail_subscribe_to.insert(channel);
    }

    pub async fn clear_subscribe_failures(&self) {
        self.state.lock().await.fail_subscribe_to.clear();
    }

    /// Make publishes to `channel` fail; used to exercise per-recipient
    /// publish isolation.
    pub async fn fail_publish_to(&self, channel: ChannelName) {
        self.state.lock().await.fail_publish_to.insert(channel);
    }

    pub async fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.state.lock().await.subscribed.contains(channel)
    }

    fn deliver(&self, channel: &ChannelName, event: ChannelEvent) {
        // No receivers is not an error: the channel simply has no audience.
        let _ = self.events.send(Envelope {
            channel: channel.clone(),
            event,
        });
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for LocalBus {
    async fn publish(&self, channel: &ChannelName, event: ChannelEvent) -> Result<(), PublishError> {
        let subscribed = {
            let state = self.state.lock().await;
            if state.fail_publish_to.contains(channel) {
                return Err(PublishError::Rejected {
                    channel: channel.to_string(),
                    reason: "injected publish failure".to_owned(),
                });
            }
            state.subscribed.contains(channel)
        };
        debug!(channel = %channel, event = event.name(), subscribed, "local bus publish");
        if subscribed {
            self.deliver(channel, event);
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelTransport for LocalBus {
    async fn subscribe(&self, channel: &ChannelName) -> anyhow::Result<()> {
        let roster = {
            let mut state = self.state.lock().await;
            if state.fail_subscribe_to.contains(channel) {
                return Err(anyhow::anyhow!("subscribe to {channel} failed"));
            }
            state.subscribed.insert(channel.clone());
            if !channel.is_presence() {
                return Ok(());
            }
            if let Some(identity) = &self.identity {
                if !state.presence_roster.iter().any(|m| m == identity) {
                    state.presence_roster.push(identity.clone());
                }
            }
            state.presence_roster.clone()
        };
        self.deliver(
            channel,
            ChannelEvent::SubscriptionSucceeded(
                roster.into_iter().map(|id| PresenceMember { id }).collect(),
            ),
        );
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.subscribed.remove(channel);
        if channel.is_presence() {
            if let Some(identity) = &self.identity {
                state.presence_roster.retain(|m| m != identity);
            }
        }
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::ConversationId;

    fn member_event(id: &str) -> ChannelEvent {
        ChannelEvent::MemberAdded(PresenceMember { id: id.to_owned() })
    }

    #[tokio::test]
    async fn publish_reaches_only_subscribed_channels() {
        let bus = LocalBus::new();
        let channel = ChannelName::conversation(&ConversationId::from("c1"));
        let mut incoming = bus.incoming();

        bus.publish(&channel, member_event("x")).await.expect("publish");
        bus.subscribe(&channel).await.expect("subscribe");
        bus.publish(&channel, member_event("y")).await.expect("publish");

        let envelope = incoming.recv().await.expect("event");
        assert_eq!(envelope.event, member_event("y"));
    }

    #[tokio::test]
    async fn presence_subscribe_yields_snapshot_including_self() {
        let bus = LocalBus::with_identity(Some("ada@mail.io".to_owned()));
        bus.set_presence_roster(vec!["grace@mail.io".to_owned()]).await;
        let mut incoming = bus.incoming();

        bus.subscribe(&ChannelName::presence()).await.expect("subscribe");

        let envelope = incoming.recv().await.expect("snapshot");
        match envelope.event {
            ChannelEvent::SubscriptionSucceeded(members) => {
                let ids: Vec<_> = members.into_iter().map(|m| m.id).collect();
                assert_eq!(ids, vec!["grace@mail.io", "ada@mail.io"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_publish_failure_is_scoped_to_one_channel() {
        let bus = LocalBus::new();
        let healthy = ChannelName::user("a@mail.io");
        let broken = ChannelName::user("b@mail.io");
        bus.subscribe(&healthy).await.expect("subscribe");
        bus.subscribe(&broken).await.expect("subscribe");
        bus.fail_publish_to(broken.clone()).await;

        assert!(bus.publish(&broken, member_event("x")).await.is_err());
        bus.publish(&healthy, member_event("x")).await.expect("publish");
    }
}
