//! Paced, encrypted transmission of pre-encoded audio frames.

use crate::config::{SilencePreamble, VoiceConfig};
use crate::error::{FatalError, TransmitError, TransportError};
use crate::udp::MediaSocket;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use voicecore::packet::{PacketError, build_packet_with};
use voicecore::session::VoiceSession;

/// What the transmitter needs from the connection it streams over.
#[async_trait]
pub trait TransmitLink: Send + Sync {
    fn session(&self) -> Arc<VoiceSession>;
    fn is_paused(&self) -> bool;
    /// The connection is gone for good and a pause will never lift.
    fn is_faulted(&self) -> bool;
    fn generation(&self) -> u64;
    /// Moves the session's sequence offset back by one before a retry.
    fn rewind_sequence(&self);
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError>;
    async fn recover(&self, error: TransportError, generation: u64) -> Result<bool, FatalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub frame_duration: Duration,
    pub poll: Duration,
    /// Every this many packets, one longer nap if there is time to spare.
    pub batch_frames: u32,
    pub batch_wait: Duration,
    pub samples_per_frame: u32,
}

impl Pacing {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            frame_duration: config.frame_duration(),
            poll: config.pacing_poll(),
            batch_frames: config.batch_frames,
            batch_wait: config.batch_wait(),
            samples_per_frame: config.samples_per_frame,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitReport {
    /// Audio frames sent, preamble excluded.
    pub frames_sent: usize,
    pub packets_sent: usize,
    pub retries: usize,
    pub cancelled: bool,
}

enum Slot {
    Ready,
    Paused,
    Cancelled,
}

/// Deadline for packet `n` is `start + paused + n * frame_duration`.
struct PacingClock {
    pacing: Pacing,
    start: Instant,
    paused: Duration,
}

impl PacingClock {
    fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            start: Instant::now(),
            paused: Duration::ZERO,
        }
    }

    fn deadline(&self, index: i64) -> Instant {
        let packets = u32::try_from(index).unwrap_or(u32::MAX);
        self.start + self.paused + self.pacing.frame_duration.saturating_mul(packets)
    }

    async fn wait_for_slot(
        &self,
        index: i64,
        link: &dyn TransmitLink,
        cancel: &CancellationToken,
    ) -> Slot {
        let deadline = self.deadline(index);
        let batch = self.pacing.batch_frames as i64;
        let mut batch_nap = batch > 0 && index > 0 && index % batch == 0;

        loop {
            if cancel.is_cancelled() {
                return Slot::Cancelled;
            }
            if link.is_paused() {
                return Slot::Paused;
            }
            let now = Instant::now();
            if now >= deadline {
                return Slot::Ready;
            }
            let remaining = deadline - now;
            let nap = if batch_nap && remaining > self.pacing.batch_wait {
                batch_nap = false;
                self.pacing.batch_wait
            } else {
                self.pacing.poll.min(remaining)
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Slot::Cancelled,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Waits out a pause; the time spent does not count against pacing.
    /// Returns `Ok(false)` if cancelled meanwhile.
    async fn hold_while_paused(
        &mut self,
        link: &dyn TransmitLink,
        cancel: &CancellationToken,
    ) -> Result<bool, TransmitError> {
        let started = Instant::now();
        let outcome = loop {
            if !link.is_paused() {
                break Ok(true);
            }
            if link.is_faulted() {
                break Err(TransmitError::Faulted);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(false),
                _ = tokio::time::sleep(self.pacing.poll) => {}
            }
        };
        self.paused += started.elapsed();
        outcome
    }
}

struct Run {
    clock: PacingClock,
    index: i64,
    report: TransmitReport,
    resend_speaking: bool,
}

pub struct AudioTransmitter {
    link: Arc<dyn TransmitLink>,
    socket: Arc<dyn MediaSocket>,
    pacing: Pacing,
    preamble: SilencePreamble,
}

impl AudioTransmitter {
    pub fn new(
        link: Arc<dyn TransmitLink>,
        socket: Arc<dyn MediaSocket>,
        pacing: Pacing,
        preamble: SilencePreamble,
    ) -> Self {
        Self {
            link,
            socket,
            pacing,
            preamble,
        }
    }

    /// Streams `frames` in order. Speaking is switched off again on every
    /// exit path.
    pub async fn transmit<I>(
        &self,
        frames: I,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport, TransmitError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut run = Run {
            clock: PacingClock::new(self.pacing),
            index: 0,
            report: TransmitReport::default(),
            resend_speaking: false,
        };

        let result = self.run(frames, cancel, &mut run).await;
        if let Err(e) = self.link.set_speaking(false).await {
            debug!(target: "Voice/Transmit", "Could not clear speaking state: {e}");
        }

        let report = run.report;
        match &result {
            Ok(()) => info!(
                target: "Voice/Transmit",
                "Transmission {}: {} frames, {} packets, {} retries",
                if report.cancelled { "cancelled" } else { "finished" },
                report.frames_sent,
                report.packets_sent,
                report.retries
            ),
            Err(e) => warn!(
                target: "Voice/Transmit",
                "Transmission aborted after {} frames: {e}", report.frames_sent
            ),
        }
        result.map(|()| report)
    }

    async fn run<I>(
        &self,
        frames: I,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<(), TransmitError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        if !run.clock.hold_while_paused(&*self.link, cancel).await? {
            run.report.cancelled = true;
            return Ok(());
        }
        self.link.set_speaking(true).await?;

        let preamble = self.preamble.load().await.unwrap_or_else(|e| {
            warn!(target: "Voice/Transmit", "Skipping silence preamble: {e}");
            Vec::new()
        });
        for frame in &preamble {
            if !self.send_frame(frame, run, cancel).await? {
                run.report.cancelled = true;
                return Ok(());
            }
        }

        for frame in frames {
            if !self.send_frame(frame.as_ref(), run, cancel).await? {
                run.report.cancelled = true;
                return Ok(());
            }
            run.report.frames_sent += 1;
        }
        Ok(())
    }

    /// Sends one frame, retrying it once after a recovery. `Ok(false)` on
    /// cancellation.
    async fn send_frame(
        &self,
        frame: &[u8],
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<bool, TransmitError> {
        let link = &*self.link;
        let mut retried = false;
        loop {
            if link.is_paused() {
                run.resend_speaking = true;
                if !run.clock.hold_while_paused(link, cancel).await? {
                    return Ok(false);
                }
            }
            if run.resend_speaking {
                link.set_speaking(true).await?;
                run.resend_speaking = false;
            }
            match run.clock.wait_for_slot(run.index, link, cancel).await {
                Slot::Ready => {}
                Slot::Paused => continue,
                Slot::Cancelled => return Ok(false),
            }

            let generation = link.generation();
            let session = link.session();
            let media = session.media.as_ref().ok_or(PacketError::MissingMedia)?;
            let packet =
                build_packet_with(&session, frame, run.index, self.pacing.samples_per_frame)?;

            match self.socket.send_to(&packet, media.target).await {
                Ok(_) => {
                    run.index += 1;
                    run.report.packets_sent += 1;
                    return Ok(true);
                }
                Err(e) if !retried => {
                    warn!(target: "Voice/Transmit", "Media send failed for packet {}: {e}", run.index);
                    retried = true;
                    run.report.retries += 1;
                    let started = Instant::now();
                    let recovered = link.recover(TransportError::Media(e), generation).await;
                    // Recovery holds the link like a pause does.
                    run.clock.paused += started.elapsed();
                    if !recovered? {
                        return Err(TransmitError::RecoveryFailed);
                    }
                    link.rewind_sequence();
                    run.resend_speaking = true;
                }
                Err(e) => return Err(TransmitError::SendFailed(e)),
            }
        }
    }
}
