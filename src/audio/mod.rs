//! Audio subsystem module

pub mod format;
pub mod mix_buffer;
pub mod volume;

pub use format::{PcmParams, SampleFormat};
pub use mix_buffer::MixBuffer;
pub use volume::{mix_scales, ChannelVolume};
