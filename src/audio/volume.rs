//! Per-channel volume as configured on the transport PCM

use serde::{Deserialize, Serialize};

use crate::constants::MAX_CHANNELS;

/// Volume of one PCM channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelVolume {
    /// Level change in dB * 100
    pub level: i32,
    /// Channel mute switch
    pub muted: bool,
}

impl ChannelVolume {
    pub fn new(level: i32, muted: bool) -> Self {
        Self { level, muted }
    }

    /// 0 dB, not muted
    pub fn unity() -> Self {
        Self::new(0, false)
    }

    /// Linear scale factor, `10^(dB/20)`, zero when muted
    pub fn scale(&self) -> f64 {
        if self.muted {
            0.0
        } else {
            10f64.powf(self.level as f64 / 100.0 / 20.0)
        }
    }
}

impl Default for ChannelVolume {
    fn default() -> Self {
        Self::unity()
    }
}

/// Scale factors applied when reading the mix.
///
/// With software volume the transport's own per-channel scale is applied.
/// In pass-through mode the device applies volume itself, so only mute is
/// honoured and unmuted channels get the configured `native_volume`.
pub fn mix_scales(
    volumes: &[ChannelVolume],
    soft_volume: bool,
    native_volume: f64,
) -> [f64; MAX_CHANNELS] {
    let mut scales = [1.0; MAX_CHANNELS];
    for (scale, volume) in scales.iter_mut().zip(volumes) {
        *scale = if soft_volume {
            volume.scale()
        } else if volume.muted {
            0.0
        } else {
            native_volume
        };
    }
    scales
}
