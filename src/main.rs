use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use voicelink::frames::load_frames;
use voicelink::public_ip::PublicIpResolver;
use voicelink::{
    ChannelId, ForwardedCredentials, GuildId, NotificationHub, UserId, VoiceClient, VoiceConfig,
    VoiceServerUpdate, VoiceStateUpdate, VoiceTarget,
};

// Plays a frame file into a voice channel using credentials obtained
// elsewhere, e.g. by a bot that already holds the main gateway session.
//
// Usage:
//   cargo run -- --endpoint host:443 --token T --session-id S \
//       --guild 1 --channel 2 --user 3 --frames song.frames

#[derive(Debug, Parser)]
#[command(version, about = "Stream pre-encoded audio into a voice channel")]
struct Args {
    /// Voice server endpoint from the voice server update.
    #[arg(long)]
    endpoint: String,
    /// Voice token from the voice server update.
    #[arg(long)]
    token: String,
    /// Session id from the voice state update.
    #[arg(long)]
    session_id: String,
    #[arg(long)]
    guild: u64,
    #[arg(long)]
    channel: u64,
    #[arg(long)]
    user: u64,
    /// Length-prefixed file of encoded audio frames.
    #[arg(short, long)]
    frames: PathBuf,
    /// JSON file with voice settings.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Skip the public address lookup.
    #[arg(long)]
    public_ip: Option<IpAddr>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => VoiceConfig::from_json_file(path)?,
        None => VoiceConfig::default(),
    };
    let frames = load_frames(&args.frames)
        .await
        .with_context(|| format!("Failed to read frames from {}", args.frames.display()))?;
    info!("Loaded {} frames from {}", frames.len(), args.frames.display());

    let target = VoiceTarget::new(
        GuildId(args.guild),
        ChannelId(args.channel),
        UserId(args.user),
    );
    let hub = NotificationHub::new();
    let control = ForwardedCredentials::new(
        hub.clone(),
        VoiceStateUpdate {
            guild_id: target.guild_id,
            channel_id: Some(target.channel_id),
            user_id: target.user_id,
            session_id: args.session_id,
        },
        VoiceServerUpdate {
            guild_id: target.guild_id,
            token: args.token,
            endpoint: Some(args.endpoint),
        },
    );

    let mut builder = VoiceClient::builder(target)
        .with_config(config)
        .with_control_plane(Arc::new(control))
        .with_notification_hub(hub);
    if let Some(ip) = args.public_ip {
        builder = builder.with_public_ip(Arc::new(PublicIpResolver::with_fixed(ip)));
    }
    let client = builder.build()?;

    client.connect().await?;
    info!("Connected, streaming {} frames", frames.len());

    let playback = client.play(&frames);
    let result = tokio::select! {
        result = playback => Some(result),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, leaving the channel");
            None
        }
    };

    match result {
        Some(Ok(report)) => info!(
            "Done: {} frames in {} packets, {} retries",
            report.frames_sent, report.packets_sent, report.retries
        ),
        Some(Err(e)) => error!("Playback failed: {e}"),
        None => {}
    }
    client.dispose().await;
    Ok(())
}
