//! Notifications raised by the control plane while a voice join is negotiated.

use super::id::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};

/// A voice-state change for some user. Only the one for this bot in the
/// target channel carries the session id we need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: String,
}

/// Voice server assignment for a guild. `endpoint` is `None` while the
/// platform is reallocating the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    pub token: String,
    pub endpoint: Option<String>,
}

/// Who is joining where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceTarget {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
}

impl VoiceTarget {
    pub fn new(
        guild_id: impl Into<GuildId>,
        channel_id: impl Into<ChannelId>,
        user_id: impl Into<UserId>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn matches_state(&self, update: &VoiceStateUpdate) -> bool {
        update.user_id == self.user_id
            && update.guild_id == self.guild_id
            && update.channel_id == Some(self.channel_id)
    }

    pub fn matches_server(&self, update: &VoiceServerUpdate) -> bool {
        update.guild_id == self.guild_id
            && update.endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }
}
