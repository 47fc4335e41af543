use std::collections::HashSet;

use shared::{channels::ChannelName, domain::ConversationId};
use tracing::warn;
use transport::ChannelTransport;

/// Channels a signed-in context must hold: the personal channel, the shared
/// presence channel, and the open conversation's channel when there is one.
pub fn channels_for_context(
    handle: &str,
    open_conversation: Option<&ConversationId>,
) -> HashSet<ChannelName> {
    let mut channels = HashSet::from([ChannelName::user(handle), ChannelName::presence()]);
    if let Some(conversation_id) = open_conversation {
        channels.insert(ChannelName::conversation(conversation_id));
    }
    channels
}

/// Owns the live subscription set: at most one subscription per channel
/// name, exactly one unsubscribe per teardown. Reconciled against the
/// desired set on every context change.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    active: HashSet<ChannelName>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, channel: &ChannelName) -> bool {
        self.active.contains(channel)
    }

    pub fn active(&self) -> &HashSet<ChannelName> {
        &self.active
    }

    /// Diff the active set against `desired`: leave shared channels alone,
    /// unsubscribe the ones that left the context, subscribe the new ones.
    /// A failed subscribe stays inactive and is retried on the next context
    /// change, never on a timer. Returns the newly subscribed channels.
    pub async fn apply(
        &mut self,
        transport: &dyn ChannelTransport,
        desired: HashSet<ChannelName>,
    ) -> Vec<ChannelName> {
        let to_drop: Vec<_> = self.active.difference(&desired).cloned().collect();
        for channel in to_drop {
            self.active.remove(&channel);
            if let Err(error) = transport.unsubscribe(&channel).await {
                warn!(%channel, %error, "unsubscribe failed");
            }
        }

        let to_add: Vec<_> = desired.difference(&self.active).cloned().collect();
        let mut subscribed = Vec::new();
        for channel in to_add {
            match transport.subscribe(&channel).await {
                Ok(()) => {
                    self.active.insert(channel.clone());
                    subscribed.push(channel);
                }
                Err(error) => {
                    warn!(%channel, %error, "subscribe failed; will retry on next context change");
                }
            }
        }
        subscribed
    }

    /// Drop every subscription (logout / shutdown).
    pub async fn teardown(&mut self, transport: &dyn ChannelTransport) {
        self.apply(transport, HashSet::new()).await;
    }
}
