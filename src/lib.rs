//! # bluemix
//!
//! Multi-client PCM mixing and fan-out engine for a Bluetooth audio bridge.
//!
//! Several local applications share one Bluetooth transport PCM. Playback
//! clients are summed into a shared mix buffer that the codec thread pulls
//! from; a capture stream decoded by the codec thread is copied to every
//! reading client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                          PLAYBACK (mix thread)                         │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐                              │
//! │  │  App 0   │  │  App 1   │  │  App N   │   pcm pipe + control socket  │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘                              │
//! │       ▼             ▼             ▼                                    │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐                              │
//! │  │ Client 0 │  │ Client 1 │  │ Client N │   client::Client             │
//! │  │  cursor  │  │  cursor  │  │  cursor  │   (epoll, one thread)        │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘                              │
//! │       └──────── add ┼ (saturating sum) ───┐                            │
//! │                     ▼                     ▼                            │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │             MixBuffer (audio::mix_buffer) ring of i64            │  │
//! │  └──────────────────────────────┬───────────────────────────────────┘  │
//! │                   wake ▲        │ read (per-channel scale)              │
//! │                        │        ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │         Transport PCM encoder thread  ── Multi::read ──          │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │                          CAPTURE (snoop thread)                        │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │         Transport PCM decoder thread  ── Multi::write ──         │  │
//! │  └───────┬──────────────────┬──────────────────┬────────────────────┘  │
//! │          ▼                  ▼                  ▼   (drop on full pipe) │
//! │     Client 0           Client 1           Client N                     │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod multi;
pub mod sys;
pub mod transport;

pub use error::{Error, Result};

/// Engine-wide constants
pub mod constants {
    /// Default sample rate for the demo transport
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u8 = 2;

    /// Most channels a transport PCM may carry
    pub const MAX_CHANNELS: usize = 8;

    /// Internal period time in milliseconds
    pub const DEFAULT_PERIOD_MS: u32 = 20;

    /// Mix buffer capacity, in periods
    pub const DEFAULT_BUFFER_PERIODS: usize = 16;

    /// Mixed periods needed before the transport is started
    pub const MIX_THRESHOLD_PERIODS: usize = 4;

    /// Periods a playback client buffers before joining the mix
    pub const CLIENT_THRESHOLD_PERIODS: usize = 2;

    /// Maximum number of clients per transport PCM
    pub const DEFAULT_MAX_CLIENTS: usize = 32;

    /// Wait before acknowledging a drain, lets the device play out
    pub const DEFAULT_DRAIN_SETTLE_MS: u64 = 300;

    /// Wake value that stops the multi thread
    pub const POISON: u64 = 0xDEAD_0000;

    /// Bytes thrown away from a client pipe on Drop
    pub const DROP_DISCARD_BYTES: usize = 32 * 1024;

    /// Longest control command accepted in one read
    pub const CONTROL_BUFFER_LEN: usize = 32;
}
