pub mod events;
pub mod id;

pub use events::{VoiceServerUpdate, VoiceStateUpdate, VoiceTarget};
pub use id::{ChannelId, GuildId, UserId};
