use serde::{Deserialize, Serialize};

use crate::domain::ConversationId;

/// The single shared channel whose membership mirrors which users currently
/// hold an open session.
pub const PRESENCE_CHANNEL: &str = "presence-messenger";

/// Name of a broadcast topic on the pub/sub transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(pub String);

impl ChannelName {
    /// Per-user channel keyed by the member's email handle; carries
    /// conversation lifecycle events addressed to that member.
    pub fn user(handle: &str) -> Self {
        Self(handle.to_owned())
    }

    /// Per-conversation channel; carries message events.
    pub fn conversation(id: &ConversationId) -> Self {
        Self(id.0.clone())
    }

    pub fn presence() -> Self {
        Self(PRESENCE_CHANNEL.to_owned())
    }

    pub fn is_presence(&self) -> bool {
        self.0 == PRESENCE_CHANNEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
