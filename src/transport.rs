//! Transport PCM collaborator interface
//!
//! The transport PCM is the codec I/O thread bound to one Bluetooth audio
//! stream. It owns format, rate, channel and volume configuration; the
//! multi-client engine reads them at attach time and talks back through
//! [`TransportSignal`]s.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::audio::{ChannelVolume, PcmParams};
use crate::constants::MAX_CHANNELS;

/// Direction of a transport PCM as seen by local applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcmDirection {
    /// Applications write, audio goes over the air (BlueALSA "sink" mode)
    Playback,
    /// Audio comes from the air, applications read (BlueALSA "source" mode)
    Capture,
}

/// Notifications sent from the engine to the transport I/O thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportSignal {
    Open,
    Close,
    Pause,
    Resume,
    Drop,
}

/// The codec side of one Bluetooth audio stream
pub trait TransportPcm: Send + Sync {
    fn direction(&self) -> PcmDirection;

    /// Negotiated format, channel count and rate
    fn params(&self) -> PcmParams;

    /// True when the stream belongs to an A2DP profile
    fn is_a2dp(&self) -> bool;

    /// True when the remote device drives the PCM lifecycle (A2DP sink,
    /// hands-free); such transports keep their clients across a reset
    fn is_target(&self) -> bool;

    /// Whether volume is applied in software rather than by the device
    fn soft_volume(&self) -> bool;

    /// Current volume of `channel`
    fn volume(&self, channel: usize) -> ChannelVolume;

    /// Deliver a signal to the I/O thread
    fn signal(&self, signal: TransportSignal);

    /// Release the transport side of the PCM
    fn release(&self);
}

/// Transport stand-in that forwards signals over a channel
pub struct ChannelTransport {
    direction: PcmDirection,
    params: PcmParams,
    a2dp: bool,
    target: bool,
    soft_volume: AtomicBool,
    volumes: RwLock<[ChannelVolume; MAX_CHANNELS]>,
    signal_tx: Sender<TransportSignal>,
    releases: AtomicUsize,
}

impl ChannelTransport {
    pub fn new(direction: PcmDirection, params: PcmParams) -> (Self, Receiver<TransportSignal>) {
        let (signal_tx, signal_rx) = unbounded();
        let transport = Self {
            direction,
            params,
            a2dp: true,
            target: false,
            soft_volume: AtomicBool::new(true),
            volumes: RwLock::new([ChannelVolume::unity(); MAX_CHANNELS]),
            signal_tx,
            releases: AtomicUsize::new(0),
        };
        (transport, signal_rx)
    }

    /// Mark the transport as driven by the remote device
    pub fn with_target(mut self, target: bool) -> Self {
        self.target = target;
        self
    }

    pub fn with_a2dp(mut self, a2dp: bool) -> Self {
        self.a2dp = a2dp;
        self
    }

    pub fn set_soft_volume(&self, enabled: bool) {
        self.soft_volume.store(enabled, Ordering::Relaxed);
    }

    pub fn set_volume(&self, channel: usize, volume: ChannelVolume) {
        if let Some(slot) = self.volumes.write().get_mut(channel) {
            *slot = volume;
        }
    }

    /// How many times the engine released the transport
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl TransportPcm for ChannelTransport {
    fn direction(&self) -> PcmDirection {
        self.direction
    }

    fn params(&self) -> PcmParams {
        self.params
    }

    fn is_a2dp(&self) -> bool {
        self.a2dp
    }

    fn is_target(&self) -> bool {
        self.target
    }

    fn soft_volume(&self) -> bool {
        self.soft_volume.load(Ordering::Relaxed)
    }

    fn volume(&self, channel: usize) -> ChannelVolume {
        self.volumes
            .read()
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    fn signal(&self, signal: TransportSignal) {
        tracing::trace!("transport signal {:?}", signal);
        let _ = self.signal_tx.send(signal);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    #[test]
    fn test_signals_are_forwarded() {
        let params = PcmParams::new(SampleFormat::S16Le, 2, 48_000);
        let (transport, rx) = ChannelTransport::new(PcmDirection::Playback, params);
        transport.signal(TransportSignal::Open);
        transport.signal(TransportSignal::Close);
        assert_eq!(rx.try_recv().unwrap(), TransportSignal::Open);
        assert_eq!(rx.try_recv().unwrap(), TransportSignal::Close);

        transport.set_volume(1, ChannelVolume::new(0, true));
        assert!(transport.volume(1).muted);
        assert!(!transport.volume(0).muted);
        assert!(!transport.volume(MAX_CHANNELS + 1).muted);
    }
}
