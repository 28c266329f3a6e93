use std::sync::atomic::{AtomicUsize, Ordering};

// -------------------------------------------------------------------------------------------------

/// A unique id of a sounding object, as created via [`unique_source_id`].
pub type SourceId = usize;

/// Generates a new unique source id, by simply counting atomically upwards from 1.
pub(crate) fn unique_source_id() -> SourceId {
    static SOURCE_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);
    SOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// -------------------------------------------------------------------------------------------------

/// Time of a [`Source`]'s `write` call in the audio output stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceTime {
    /// Position of the first frame in the output buffer, in sample frames since the
    /// output stream started.
    pub pos_in_frames: u64,
}

impl SourceTime {
    /// Create a copy of this time with the given amount of frames added.
    pub fn with_added_frames(&self, frames: u64) -> Self {
        Self {
            pos_in_frames: self.pos_in_frames + frames,
        }
    }

    /// This time's stream position in seconds at the given sample rate.
    pub fn pos_in_seconds(&self, sample_rate: u32) -> f64 {
        debug_assert!(sample_rate > 0, "Invalid sample rate");
        self.pos_in_frames as f64 / sample_rate as f64
    }
}

// -------------------------------------------------------------------------------------------------

/// Types that can produce interleaved audio samples in `f32` format, scheduled against a
/// shared, sample-accurate output stream time. `Send`able across threads.
pub trait Source: Send + 'static {
    /// Write at most `output.len()` samples into `output`, which starts at the given
    /// stream time. Returns the number of written samples. Should take care to always
    /// write full frames, and should _never_ block.
    fn write(&mut self, output: &mut [f32], time: &SourceTime) -> usize;

    /// Number of interleaved channels this source produces.
    fn channel_count(&self) -> usize;
    /// Output sample rate this source produces samples with.
    fn sample_rate(&self) -> u32;

    /// Returns true when the source finished playback and can be dropped.
    fn is_exhausted(&self) -> bool;
}
