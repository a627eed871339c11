//! Seam to the main gateway connection that owns the "join voice" intent.

use async_trait::async_trait;
use log::debug;
use tokio::sync::broadcast;
use voicecore::types::{VoiceServerUpdate, VoiceStateUpdate, VoiceTarget};

const NOTIFICATION_CAPACITY: usize = 64;

/// Sends the join intent over the main gateway. The two notifications it
/// causes are fed back through a [`NotificationHub`].
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn request_join(&self, target: &VoiceTarget) -> anyhow::Result<()>;
}

/// Fan-out of control plane notifications to whoever is waiting on them.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    states: broadcast::Sender<VoiceStateUpdate>,
    servers: broadcast::Sender<VoiceServerUpdate>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (states, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (servers, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { states, servers }
    }

    /// Returns how many subscribers saw the update.
    pub fn publish_voice_state(&self, update: VoiceStateUpdate) -> usize {
        self.states.send(update).unwrap_or_else(|_| {
            debug!(target: "Voice/Control", "Voice state update dropped, nobody is waiting");
            0
        })
    }

    pub fn publish_voice_server(&self, update: VoiceServerUpdate) -> usize {
        self.servers.send(update).unwrap_or_else(|_| {
            debug!(target: "Voice/Control", "Voice server update dropped, nobody is waiting");
            0
        })
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<VoiceStateUpdate> {
        self.states.subscribe()
    }

    pub fn subscribe_servers(&self) -> broadcast::Receiver<VoiceServerUpdate> {
        self.servers.subscribe()
    }
}

/// Answers a join request with credentials obtained out of band, for setups
/// where another process already holds the main gateway session.
pub struct ForwardedCredentials {
    hub: NotificationHub,
    state: VoiceStateUpdate,
    server: VoiceServerUpdate,
}

impl ForwardedCredentials {
    pub fn new(hub: NotificationHub, state: VoiceStateUpdate, server: VoiceServerUpdate) -> Self {
        Self { hub, state, server }
    }
}

#[async_trait]
impl ControlPlane for ForwardedCredentials {
    async fn request_join(&self, target: &VoiceTarget) -> anyhow::Result<()> {
        if !target.matches_state(&self.state) {
            anyhow::bail!(
                "forwarded voice state does not belong to channel {} in guild {}",
                target.channel_id,
                target.guild_id
            );
        }
        self.hub.publish_voice_server(self.server.clone());
        self.hub.publish_voice_state(self.state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voicecore::types::{ChannelId, GuildId, UserId};

    fn target() -> VoiceTarget {
        VoiceTarget::new(GuildId(1), ChannelId(2), UserId(3))
    }

    fn state(channel: u64) -> VoiceStateUpdate {
        VoiceStateUpdate {
            guild_id: GuildId(1),
            channel_id: Some(ChannelId(channel)),
            user_id: UserId(3),
            session_id: "sess".into(),
        }
    }

    fn server() -> VoiceServerUpdate {
        VoiceServerUpdate {
            guild_id: GuildId(1),
            token: "tok".into(),
            endpoint: Some("voice.example.net".into()),
        }
    }

    #[tokio::test]
    async fn test_forwarded_credentials_publish_both() {
        let hub = NotificationHub::new();
        let mut states = hub.subscribe_states();
        let mut servers = hub.subscribe_servers();
        let control = ForwardedCredentials::new(hub.clone(), state(2), server());

        control.request_join(&target()).await.unwrap();
        assert_eq!(states.recv().await.unwrap(), state(2));
        assert_eq!(servers.recv().await.unwrap(), server());
    }

    #[tokio::test]
    async fn test_forwarded_credentials_reject_other_channel() {
        let hub = NotificationHub::new();
        let control = ForwardedCredentials::new(hub, state(99), server());
        assert!(control.request_join(&target()).await.is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = NotificationHub::new();
        assert_eq!(hub.publish_voice_state(state(2)), 0);
        let _rx = hub.subscribe_servers();
        assert_eq!(hub.publish_voice_server(server()), 1);
    }
}
