use crate::context::VoiceContext;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voicecore::protocol::VoiceMessage;

/// Unacknowledged beats after which the connection is considered dead.
pub const MAX_MISSED_ACKS: u32 = 2;

#[derive(Debug, Default)]
struct MonitorState {
    pending: Option<(u64, DateTime<Utc>)>,
    missed: u32,
    latency: Option<Duration>,
}

/// Tracks heartbeats in flight and the round trip of the last acknowledged one.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    state: Mutex<MonitorState>,
}

impl HeartbeatMonitor {
    fn with_state<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Called when a beat is due. Returns how many earlier beats went unanswered.
    pub fn beat_due(&self) -> u32 {
        self.with_state(|s| {
            if s.pending.is_some() {
                s.missed += 1;
            }
            s.missed
        })
    }

    pub fn beat_sent(&self, nonce: u64, at: DateTime<Utc>) {
        self.with_state(|s| s.pending = Some((nonce, at)));
    }

    /// Returns the round trip if `nonce` answers the beat in flight.
    pub fn ack(&self, nonce: u64, at: DateTime<Utc>) -> Option<Duration> {
        self.with_state(|s| match s.pending {
            Some((sent_nonce, sent_at)) if sent_nonce == nonce => {
                let rtt = (at - sent_at).to_std().unwrap_or_default();
                s.pending = None;
                s.missed = 0;
                s.latency = Some(rtt);
                Some(rtt)
            }
            _ => None,
        })
    }

    pub fn latency(&self) -> Option<Duration> {
        self.with_state(|s| s.latency)
    }

    pub fn reset(&self) {
        self.with_state(|s| {
            s.pending = None;
            s.missed = 0;
        });
    }
}

pub(crate) fn spawn_heartbeat(
    ctx: Arc<VoiceContext>,
    interval: Duration,
    connection: CancellationToken,
) {
    tokio::spawn(heartbeat_loop(ctx, interval, connection));
}

/// Beats on the server's interval until the connection token is cancelled.
/// The first beat goes out after a random fraction of the interval.
async fn heartbeat_loop(ctx: Arc<VoiceContext>, interval: Duration, connection: CancellationToken) {
    ctx.heartbeat.reset();
    let mut wait = interval.mul_f64(rand::rng().random_range(0.0..1.0));
    info!(target: "Voice/Keepalive", "Heartbeating every {} ms", interval.as_millis());

    loop {
        tokio::select! {
            biased;
            _ = connection.cancelled() => {
                debug!(target: "Voice/Keepalive", "Connection closed, exiting heartbeat loop.");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }
        wait = interval;

        let missed = ctx.heartbeat.beat_due();
        if missed >= MAX_MISSED_ACKS {
            warn!(
                target: "Voice/Keepalive",
                "{missed} heartbeats unanswered, closing signaling socket"
            );
            ctx.signaling.close().await;
            return;
        }

        let now = Utc::now();
        let nonce = now.timestamp_millis().unsigned_abs();
        ctx.heartbeat.beat_sent(nonce, now);
        if let Err(e) = ctx.signaling.send(&VoiceMessage::Heartbeat(nonce)).await {
            // The receive loop sees the same loss and drives recovery.
            warn!(target: "Voice/Keepalive", "Heartbeat send failed: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_measures_round_trip() {
        let monitor = HeartbeatMonitor::default();
        let sent = Utc::now();
        assert_eq!(monitor.beat_due(), 0);
        monitor.beat_sent(7, sent);

        assert_eq!(monitor.ack(8, sent), None);
        let rtt = monitor
            .ack(7, sent + chrono::Duration::milliseconds(35))
            .unwrap();
        assert_eq!(rtt, Duration::from_millis(35));
        assert_eq!(monitor.latency(), Some(Duration::from_millis(35)));
    }

    #[test]
    fn test_unanswered_beats_accumulate() {
        let monitor = HeartbeatMonitor::default();
        let now = Utc::now();
        monitor.beat_sent(1, now);
        assert_eq!(monitor.beat_due(), 1);
        monitor.beat_sent(2, now);
        assert_eq!(monitor.beat_due(), 2);

        monitor.beat_sent(3, now);
        monitor.ack(3, now);
        assert_eq!(monitor.beat_due(), 0);
    }

    #[test]
    fn test_reset_keeps_latency() {
        let monitor = HeartbeatMonitor::default();
        let now = Utc::now();
        monitor.beat_sent(1, now);
        monitor.ack(1, now);
        monitor.beat_sent(2, now);
        monitor.reset();
        assert_eq!(monitor.beat_due(), 0);
        assert_eq!(monitor.latency(), Some(Duration::ZERO));
    }
}
