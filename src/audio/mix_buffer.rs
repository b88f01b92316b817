//! Additive ring buffer shared by all playback clients
//!
//! Every client owns a writer cursor; the transport owns the single read
//! cursor (`mix_offset`). Cursors live on an unbounded frame timeline and
//! map onto the ring by `cursor mod capacity`.
//!
//! ```text
//!            mix_offset                      end
//!                 │                           │
//!   ... read ...  ▼   unread (mixed) frames   ▼    free
//!  ───────────────┬───────────────────────────┬──────────────
//!                 │◄──── threshold window ────────────►│
//!                 client cursors may not pass this ────┘
//! ```
//!
//! A negative writer cursor is a pending relative position: `-n` means
//! "n frames ahead of the read cursor" and is resolved on the next `add`.

use crate::audio::format::SampleFormat;
use crate::constants::MIX_THRESHOLD_PERIODS;
use crate::error::MixError;

/// Per-channel scale at or above which samples pass through unscaled
const UNITY_SCALE: f64 = 0.99;

/// Shared playback mix
pub struct MixBuffer {
    format: SampleFormat,
    channels: usize,
    frame_bytes: usize,
    /// Ring capacity in frames
    capacity: usize,
    /// Frames transferred per transport read
    period: usize,
    /// Write-ahead window and start threshold, in frames
    threshold: usize,
    /// Widened accumulators, `capacity * channels` long
    data: Vec<i64>,
    /// Next frame the transport will read
    mix_offset: i64,
    /// One past the furthest frame written by any client
    end: i64,
    /// Frames discarded because their writer lagged more than one buffer
    late_frames: u64,
}

impl MixBuffer {
    /// Allocate a zeroed mix buffer.
    ///
    /// Fails if the format cannot be mixed, the geometry is inconsistent, or
    /// the allocation cannot be satisfied.
    pub fn new(
        format: SampleFormat,
        channels: u8,
        capacity_frames: usize,
        period_frames: usize,
    ) -> Result<Self, MixError> {
        Self::with_threshold(
            format,
            channels,
            capacity_frames,
            period_frames,
            MIX_THRESHOLD_PERIODS,
        )
    }

    /// Allocate a mix buffer with a custom start threshold, in periods.
    pub fn with_threshold(
        format: SampleFormat,
        channels: u8,
        capacity_frames: usize,
        period_frames: usize,
        threshold_periods: usize,
    ) -> Result<Self, MixError> {
        if !format.is_mixable() {
            return Err(MixError::UnsupportedFormat(format));
        }
        if channels == 0 || period_frames == 0 || threshold_periods == 0 {
            return Err(MixError::InvalidGeometry(format!(
                "channels={} period={} threshold={}",
                channels, period_frames, threshold_periods
            )));
        }
        let threshold = period_frames * threshold_periods;
        if threshold > capacity_frames {
            return Err(MixError::InvalidGeometry(format!(
                "threshold of {} frames exceeds capacity of {} frames",
                threshold, capacity_frames
            )));
        }

        let channels = channels as usize;
        let samples = capacity_frames
            .checked_mul(channels)
            .ok_or_else(|| MixError::InvalidGeometry("capacity overflow".into()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(samples).map_err(|_| MixError::Allocation {
            bytes: samples.saturating_mul(std::mem::size_of::<i64>()),
        })?;
        data.resize(samples, 0);

        Ok(Self {
            format,
            channels,
            frame_bytes: format.bytes() * channels,
            capacity: capacity_frames,
            period: period_frames,
            threshold,
            data,
            mix_offset: 0,
            end: 0,
            late_frames: 0,
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn threshold_frames(&self) -> usize {
        self.threshold
    }

    pub fn mix_offset(&self) -> i64 {
        self.mix_offset
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn late_frames(&self) -> u64 {
        self.late_frames
    }

    /// Frames from `start` up to `end`, zero if `end` is not ahead of `start`
    pub fn calc_avail(&self, start: i64, end: i64) -> usize {
        (end - start).max(0) as usize
    }

    /// Unread frames waiting for the transport
    pub fn available(&self) -> usize {
        self.calc_avail(self.mix_offset, self.end)
    }

    /// Lag between the read cursor and `cursor`.
    ///
    /// A pending relative cursor reports its requested distance.
    pub fn delay(&self, cursor: i64) -> usize {
        if cursor < 0 {
            (-cursor) as usize
        } else {
            self.calc_avail(self.mix_offset, cursor)
        }
    }

    /// True once enough frames are mixed to start the transport
    pub fn at_threshold(&self) -> bool {
        self.capacity > 0 && self.available() >= self.threshold
    }

    pub fn is_empty(&self) -> bool {
        self.mix_offset >= self.end
    }

    #[inline]
    fn slot(&self, position: i64) -> usize {
        position.rem_euclid(self.capacity as i64) as usize * self.channels
    }

    /// Sum whole frames from `data` into the mix at `*cursor`.
    ///
    /// Returns the number of frames consumed from `data`. Frames beyond the
    /// write-ahead window are not consumed and must be offered again later.
    /// A cursor more than one buffer length behind the read cursor loses the
    /// frames older than that, the remainder is re-anchored at the read cursor.
    pub fn add(&mut self, cursor: &mut i64, data: &[u8]) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        let frames = data.len() / self.frame_bytes;
        if frames == 0 {
            return 0;
        }

        if *cursor < 0 {
            let ahead = (-*cursor).min(self.capacity as i64);
            *cursor = self.mix_offset + ahead;
        }

        let mut consumed = 0;
        if *cursor < self.mix_offset {
            let lag = (self.mix_offset - *cursor) as usize;
            if lag > self.capacity {
                let lost = (lag - self.capacity).min(frames);
                self.late_frames += lost as u64;
                consumed = lost;
                *cursor += lost as i64;
                if consumed == frames {
                    return consumed;
                }
            }
            *cursor = self.mix_offset;
        }

        let limit = self.mix_offset + self.threshold as i64;
        if *cursor >= limit {
            return consumed;
        }
        let count = ((limit - *cursor) as usize).min(frames - consumed);

        let sample_bytes = self.format.bytes();
        let src = &data[consumed * self.frame_bytes..];
        for i in 0..count {
            let slot = self.slot(*cursor + i as i64);
            let frame = &src[i * self.frame_bytes..(i + 1) * self.frame_bytes];
            for (c, raw) in frame.chunks_exact(sample_bytes).enumerate() {
                let acc = &mut self.data[slot + c];
                *acc = acc.saturating_add(self.format.decode(raw));
            }
        }

        *cursor += count as i64;
        if *cursor > self.end {
            self.end = *cursor;
        }
        consumed + count
    }

    /// Copy out at most one period of mixed frames into `out`.
    ///
    /// `scale` holds one factor per channel (missing entries mean unity, 0.0
    /// mutes). The consumed region is zeroed for future additions. Returns 0
    /// when nothing is left to read.
    pub fn read(&mut self, out: &mut [u8], frames: usize, scale: &[f64]) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        let frames = frames
            .min(out.len() / self.frame_bytes)
            .min(self.period)
            .min(self.available());

        let sample_bytes = self.format.bytes();
        for i in 0..frames {
            let slot = self.slot(self.mix_offset + i as i64);
            let dest = &mut out[i * self.frame_bytes..(i + 1) * self.frame_bytes];
            for (c, raw) in dest.chunks_exact_mut(sample_bytes).enumerate() {
                let value = std::mem::take(&mut self.data[slot + c]);
                let factor = scale.get(c).copied().unwrap_or(1.0);
                self.format.encode(apply_scale(value, factor), raw);
            }
        }

        self.mix_offset += frames as i64;
        frames
    }

    /// Discard all unread frames; the timeline keeps its position.
    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|s| *s = 0);
        self.end = self.mix_offset;
    }

    /// Free the storage. Subsequent adds and reads transfer nothing.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
        self.mix_offset = 0;
        self.end = 0;
    }
}

fn apply_scale(value: i64, factor: f64) -> i64 {
    if factor == 0.0 {
        0
    } else if factor >= UNITY_SCALE {
        value
    } else {
        (value as f64 * factor) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn s16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn from_s16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn stereo_buffer() -> MixBuffer {
        // 4 periods of 4 frames make the threshold, 8 periods of capacity
        MixBuffer::new(SampleFormat::S16Le, 2, 32, 4).unwrap()
    }

    #[test]
    fn test_two_writers_sum() {
        let mut mix = stereo_buffer();
        let mut a = 0i64;
        let mut b = 0i64;

        assert_eq!(mix.add(&mut a, &s16(&[100, -100, 200, -200])), 2);
        assert_eq!(mix.add(&mut b, &s16(&[1, 2, 3, 4])), 2);
        assert_eq!(mix.end(), 2);

        let mut out = vec![0u8; 8];
        assert_eq!(mix.read(&mut out, 2, &[1.0, 1.0]), 2);
        assert_eq!(from_s16(&out), vec![101, -98, 203, -196]);
        assert!(mix.is_empty());
    }

    #[test]
    fn test_saturates_instead_of_wrapping() {
        let mut mix = stereo_buffer();
        for _ in 0..3 {
            let mut cursor = 0i64;
            mix.add(&mut cursor, &s16(&[i16::MAX, i16::MIN]));
        }
        let mut out = vec![0u8; 4];
        assert_eq!(mix.read(&mut out, 1, &[1.0, 1.0]), 1);
        assert_eq!(from_s16(&out), vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_channel_scale_and_mute() {
        let mut mix = stereo_buffer();
        let mut cursor = 0i64;
        mix.add(&mut cursor, &s16(&[1000, 1000]));
        let mut out = vec![0u8; 4];
        mix.read(&mut out, 1, &[0.5, 0.0]);
        assert_eq!(from_s16(&out), vec![500, 0]);
    }

    #[test]
    fn test_write_ahead_limited_to_threshold() {
        let mut mix = stereo_buffer();
        let mut cursor = 0i64;
        let data = s16(&[1; 2 * 20]);

        // threshold is 16 frames
        assert_eq!(mix.add(&mut cursor, &data), 16);
        assert!(mix.at_threshold());
        assert_eq!(mix.add(&mut cursor, &data[16 * 4..]), 0);

        let mut out = vec![0u8; 64];
        assert_eq!(mix.read(&mut out, 16, &[1.0, 1.0]), 4);
        assert_eq!(mix.add(&mut cursor, &data[16 * 4..]), 4);
    }

    #[test]
    fn test_read_limited_to_one_period() {
        let mut mix = stereo_buffer();
        let mut cursor = 0i64;
        mix.add(&mut cursor, &s16(&[7; 2 * 10]));
        let mut out = vec![0u8; 4 * 10];
        assert_eq!(mix.read(&mut out, 10, &[1.0, 1.0]), 4);
        assert_eq!(mix.available(), 6);
    }

    #[test]
    fn test_empty_read_then_resume() {
        let mut mix = stereo_buffer();
        let mut out = vec![0u8; 16];
        assert_eq!(mix.read(&mut out, 4, &[1.0, 1.0]), 0);

        let mut cursor = 0i64;
        mix.add(&mut cursor, &s16(&[5, -5]));
        assert_eq!(mix.read(&mut out, 4, &[1.0, 1.0]), 1);
        assert_eq!(from_s16(&out[..4]), vec![5, -5]);
        assert_eq!(mix.read(&mut out, 4, &[1.0, 1.0]), 0);
    }

    #[test]
    fn test_consumed_region_is_zeroed() {
        let mut mix = MixBuffer::with_threshold(SampleFormat::S16Le, 1, 4, 1, 4).unwrap();
        let mut cursor = 0i64;
        let mut out = vec![0u8; 2];
        for round in 0..3i16 {
            for _ in 0..4 {
                mix.add(&mut cursor, &s16(&[round + 1]));
                mix.read(&mut out, 1, &[1.0]);
                assert_eq!(from_s16(&out), vec![round + 1]);
            }
        }
        assert_eq!(mix.mix_offset(), 12);
    }

    #[test]
    fn test_relative_cursor_resolves_ahead_of_reader() {
        let mut mix = stereo_buffer();
        let mut cursor = -3i64;
        assert_eq!(mix.delay(cursor), 3);
        mix.add(&mut cursor, &s16(&[9, 9]));
        assert_eq!(cursor, 4);
        assert_eq!(mix.end(), 4);

        let mut out = vec![0u8; 16];
        assert_eq!(mix.read(&mut out, 4, &[1.0, 1.0]), 4);
        assert_eq!(from_s16(&out), vec![0, 0, 0, 0, 0, 0, 9, 9]);
    }

    #[test]
    fn test_lagging_writer_loses_only_frames_older_than_buffer() {
        let mut mix = MixBuffer::with_threshold(SampleFormat::S16Le, 1, 8, 2, 4).unwrap();
        let mut leader = 0i64;
        let mut out = vec![0u8; 4];
        // advance the reader to frame 12
        for _ in 0..6 {
            mix.add(&mut leader, &s16(&[0, 0]));
            mix.read(&mut out, 2, &[1.0]);
        }
        assert_eq!(mix.mix_offset(), 12);

        // cursor at 2 lags by 10 frames, 2 more than the capacity of 8
        let mut lagger = 2i64;
        let consumed = mix.add(&mut lagger, &s16(&[1, 2, 3, 4, 5]));
        assert_eq!(consumed, 5);
        assert_eq!(mix.late_frames(), 2);
        assert_eq!(lagger, 15);

        mix.read(&mut out, 2, &[1.0]);
        assert_eq!(from_s16(&out), vec![3, 4]);
    }

    #[test]
    fn test_lag_within_buffer_is_reanchored() {
        let mut mix = MixBuffer::with_threshold(SampleFormat::S16Le, 1, 8, 2, 4).unwrap();
        let mut leader = 0i64;
        let mut out = vec![0u8; 4];
        mix.add(&mut leader, &s16(&[0, 0, 0, 0]));
        mix.read(&mut out, 2, &[1.0]);
        mix.read(&mut out, 2, &[1.0]);

        let mut lagger = 1i64;
        assert_eq!(mix.add(&mut lagger, &s16(&[6, 7])), 2);
        assert_eq!(mix.late_frames(), 0);
        assert_eq!(mix.calc_avail(mix.mix_offset(), lagger), 2);
    }

    #[test]
    fn test_clear_keeps_timeline() {
        let mut mix = stereo_buffer();
        let mut cursor = 0i64;
        mix.add(&mut cursor, &s16(&[1; 2 * 8]));
        let mut out = vec![0u8; 16];
        mix.read(&mut out, 4, &[1.0, 1.0]);
        mix.clear();
        assert!(mix.is_empty());
        assert_eq!(mix.mix_offset(), 4);
        assert_eq!(mix.end(), 4);
        assert_eq!(mix.read(&mut out, 4, &[1.0, 1.0]), 0);
    }

    #[test]
    fn test_release_disables_transfer() {
        let mut mix = stereo_buffer();
        mix.release();
        let mut cursor = 0i64;
        assert_eq!(mix.add(&mut cursor, &s16(&[1, 1])), 0);
        assert!(!mix.at_threshold());
    }

    #[test]
    fn test_rejects_packed_24bit() {
        assert!(matches!(
            MixBuffer::new(SampleFormat::S24_3Le, 2, 64, 4),
            Err(MixError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            MixBuffer::new(SampleFormat::S16Le, 2, 8, 4),
            Err(MixError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_u8_mixing_around_midpoint() {
        let mut mix = MixBuffer::with_threshold(SampleFormat::U8, 1, 8, 2, 4).unwrap();
        let mut a = 0i64;
        let mut b = 0i64;
        mix.add(&mut a, &[0x90, 0x70]);
        mix.add(&mut b, &[0x90, 0x80]);
        let mut out = [0u8; 2];
        mix.read(&mut out, 2, &[1.0]);
        assert_eq!(out, [0xA0, 0x70]);
    }

    proptest! {
        #[test]
        fn prop_read_is_saturated_scaled_sum(
            writers in proptest::collection::vec(
                proptest::collection::vec(any::<i16>(), 8), 1..6),
            left in 0.0f64..1.0,
        ) {
            let mut mix = MixBuffer::with_threshold(SampleFormat::S16Le, 2, 16, 4, 4).unwrap();
            for w in &writers {
                let mut cursor = 0i64;
                prop_assert_eq!(mix.add(&mut cursor, &s16(w)), 4);
            }
            let mut out = vec![0u8; 16];
            prop_assert_eq!(mix.read(&mut out, 4, &[left, 1.0]), 4);
            let got = from_s16(&out);
            for (i, sample) in got.iter().enumerate() {
                let sum: i64 = writers.iter().map(|w| w[i] as i64).sum();
                let scaled = if i % 2 == 0 { apply_scale(sum, left) } else { sum };
                let expected = scaled.clamp(i16::MIN as i64, i16::MAX as i64);
                prop_assert_eq!(*sample as i64, expected);
            }
        }
    }
}
