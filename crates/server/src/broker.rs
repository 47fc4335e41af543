use std::collections::HashMap;

use async_trait::async_trait;
use shared::{
    channels::ChannelName,
    protocol::{ChannelEvent, Envelope},
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use transport::{EventPublisher, PublishError};

const CHANNEL_CAPACITY: usize = 256;

struct BrokerState {
    channels: HashMap<ChannelName, broadcast::Sender<Envelope>>,
    /// Open sessions per presence handle. A user is online while at least
    /// one of their sessions holds the presence channel.
    presence_sessions: HashMap<String, usize>,
}

/// Per-channel fan-out hub. Events published to a channel reach every
/// websocket currently attached to it, in publish order; distinct channels
/// give no relative ordering.
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                channels: HashMap::new(),
                presence_sessions: HashMap::new(),
            }),
        }
    }

    /// Attach a receiver to `channel`, creating the channel on first use.
    pub async fn attach(&self, channel: &ChannelName) -> broadcast::Receiver<Envelope> {
        let mut state = self.state.lock().await;
        state
            .channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the channel's sender once the last receiver is gone.
    pub async fn prune(&self, channel: &ChannelName) {
        let mut state = self.state.lock().await;
        if let Some(sender) = state.channels.get(channel) {
            if sender.receiver_count() == 0 {
                state.channels.remove(channel);
            }
        }
    }

    /// Register one more open session for `handle`. Returns the online
    /// snapshot and whether the user just came online.
    pub async fn presence_join(&self, handle: &str) -> (Vec<String>, bool) {
        let mut state = self.state.lock().await;
        let sessions = state
            .presence_sessions
            .entry(handle.to_owned())
            .or_insert(0);
        *sessions += 1;
        let newly_online = *sessions == 1;
        let mut snapshot: Vec<String> = state.presence_sessions.keys().cloned().collect();
        snapshot.sort();
        debug!(handle, newly_online, online = snapshot.len(), "presence join");
        (snapshot, newly_online)
    }

    /// Unregister one session for `handle`. Returns true when that was the
    /// last one and the user went offline.
    pub async fn presence_leave(&self, handle: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.presence_sessions.get_mut(handle) {
            Some(sessions) if *sessions > 1 => {
                *sessions -= 1;
                false
            }
            Some(_) => {
                state.presence_sessions.remove(handle);
                debug!(handle, "presence leave; user offline");
                true
            }
            None => false,
        }
    }

    async fn send(&self, channel: &ChannelName, event: ChannelEvent) {
        let sender = {
            let state = self.state.lock().await;
            state.channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // An empty audience is not an error.
            let _ = sender.send(Envelope {
                channel: channel.clone(),
                event,
            });
        }
    }

    /// Broadcast outside the publisher seam (presence membership events).
    pub async fn announce(&self, channel: &ChannelName, event: ChannelEvent) {
        self.send(channel, event).await;
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for Broker {
    async fn publish(&self, channel: &ChannelName, event: ChannelEvent) -> Result<(), PublishError> {
        self.send(channel, event).await;
        Ok(())
    }
}
