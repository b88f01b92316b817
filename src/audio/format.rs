//! PCM sample formats negotiated by the transport
//!
//! All formats are little-endian on the wire. Samples are widened to `i64`
//! for mixing and clamped back to the format range on the way out.

use serde::{Deserialize, Serialize};

/// Sample format of a transport PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Unsigned 8-bit, offset binary
    U8,
    /// Signed 16-bit in 2 bytes
    S16Le,
    /// Signed 24-bit packed in 3 bytes
    S24_3Le,
    /// Signed 24-bit in the low bits of a 4-byte container
    S24_4Le,
    /// Signed 32-bit in 4 bytes
    S32Le,
}

impl SampleFormat {
    /// Physical bytes per sample
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S24_3Le => 3,
            SampleFormat::S24_4Le | SampleFormat::S32Le => 4,
        }
    }

    /// Significant bits per sample
    pub fn width(self) -> u32 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::S16Le => 16,
            SampleFormat::S24_3Le | SampleFormat::S24_4Le => 24,
            SampleFormat::S32Le => 32,
        }
    }

    /// Whether the mix buffer can sum this format
    pub fn is_mixable(self) -> bool {
        !matches!(self, SampleFormat::S24_3Le)
    }

    /// Smallest representable sample value (signed domain)
    pub fn min_value(self) -> i64 {
        -(1i64 << (self.width() - 1))
    }

    /// Largest representable sample value (signed domain)
    pub fn max_value(self) -> i64 {
        (1i64 << (self.width() - 1)) - 1
    }

    /// Clamp a widened value into this format's range
    pub fn saturate(self, value: i64) -> i64 {
        value.clamp(self.min_value(), self.max_value())
    }

    /// Decode one sample from `raw` (at least `bytes()` long) into the signed domain
    pub fn decode(self, raw: &[u8]) -> i64 {
        match self {
            SampleFormat::U8 => raw[0] as i64 - 0x80,
            SampleFormat::S16Le => i16::from_le_bytes([raw[0], raw[1]]) as i64,
            SampleFormat::S24_3Le => {
                let v = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]);
                sign_extend_24(v) as i64
            }
            SampleFormat::S24_4Le => {
                let v = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                sign_extend_24(v & 0x00FF_FFFF) as i64
            }
            SampleFormat::S32Le => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
        }
    }

    /// Encode a signed-domain value into `out`, saturating to the format range
    pub fn encode(self, value: i64, out: &mut [u8]) {
        let v = self.saturate(value);
        match self {
            SampleFormat::U8 => out[0] = (v + 0x80) as u8,
            SampleFormat::S16Le => out[..2].copy_from_slice(&(v as i16).to_le_bytes()),
            SampleFormat::S24_3Le => out[..3].copy_from_slice(&(v as i32).to_le_bytes()[..3]),
            SampleFormat::S24_4Le => {
                let packed = (v as i32 as u32) & 0x00FF_FFFF;
                let packed = if v < 0 { packed | 0xFF00_0000 } else { packed };
                out[..4].copy_from_slice(&packed.to_le_bytes());
            }
            SampleFormat::S32Le => out[..4].copy_from_slice(&(v as i32).to_le_bytes()),
        }
    }

    /// The byte value of digital silence for this format
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }
}

fn sign_extend_24(v: u32) -> i32 {
    ((v << 8) as i32) >> 8
}

/// Negotiated PCM stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmParams {
    pub format: SampleFormat,
    pub channels: u8,
    pub rate: u32,
}

impl PcmParams {
    pub fn new(format: SampleFormat, channels: u8, rate: u32) -> Self {
        Self {
            format,
            channels,
            rate,
        }
    }

    /// Bytes in one interleaved frame
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes() * self.channels as usize
    }

    /// Frames in `ms` milliseconds
    pub fn frames_for_ms(&self, ms: u32) -> usize {
        (self.rate as u64 * ms as u64 / 1000) as usize
    }
}
