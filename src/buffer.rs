use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

/// A shared, lazily loaded mono sample buffer, read by all grain voices of a player.
///
/// `SampleBuffer` is a cheaply clonable handle: clones share the same underlying sample
/// data, so a buffer can be loaded once and then be handed to any number of concurrently
/// sounding voices. The buffer starts out empty and unloaded, unless it's created from
/// already decoded sample data. Loading swaps in the new sample data and flips the
/// `loaded` flag, which players observe to resolve their duration queries.
///
/// The `reverse` flag is the only mutable playback property of the buffer. Toggling it
/// is observable by every voice which keeps reading the buffer afterwards, including
/// voices that already are in flight.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    inner: Arc<BufferInner>,
}

#[derive(Debug)]
struct BufferInner {
    samples: RwLock<Arc<Vec<f32>>>,
    sample_rate: AtomicU32,
    loaded: AtomicBool,
    reverse: AtomicBool,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleBuffer {
    /// Create a new empty, unloaded buffer. Its duration is 0 until sample data got
    /// applied via [`SampleBuffer::set_samples`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BufferInner {
                samples: RwLock::new(Arc::new(Vec::new())),
                sample_rate: AtomicU32::new(0),
                loaded: AtomicBool::new(false),
                reverse: AtomicBool::new(false),
            }),
        }
    }

    /// Create a new buffer from already decoded mono sample data.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Result<Self, Error> {
        if sample_rate == 0 {
            return Err(Error::ParameterError(
                "buffer sample rate must not be 0".to_string(),
            ));
        }
        let buffer = Self::new();
        buffer.set_samples(samples, sample_rate);
        Ok(buffer)
    }

    /// Create a new buffer from the given WAV file. Multi-channel files are downmixed
    /// to mono.
    #[cfg(feature = "wav")]
    pub fn from_wav_file(file_path: &str) -> Result<Self, Error> {
        let (samples, sample_rate) = decode_wav_file(file_path)?;
        Self::from_samples(samples, sample_rate)
    }

    /// Complete a load: swap in new sample data and mark the buffer as loaded.
    /// Voices spawned afterwards will read the new data.
    pub fn set_samples(&self, samples: Vec<f32>, sample_rate: u32) {
        debug_assert!(sample_rate > 0, "Invalid sample rate");
        let mut lock = self
            .inner
            .samples
            .write()
            .unwrap_or_else(|err| err.into_inner());
        *lock = Arc::new(samples);
        self.inner.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.inner.loaded.store(true, Ordering::Release);
    }

    /// A snapshot of the buffer's current sample data, for voice readers.
    pub fn samples(&self) -> Arc<Vec<f32>> {
        let lock = self
            .inner
            .samples
            .read()
            .unwrap_or_else(|err| err.into_inner());
        Arc::clone(&lock)
    }

    /// The buffer's source sample rate. 0 until loaded.
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::Relaxed)
    }

    /// The buffer's duration in seconds. Only meaningful once loaded: 0 until then.
    pub fn duration(&self) -> f64 {
        let sample_rate = self.sample_rate();
        if sample_rate == 0 {
            return 0.0;
        }
        self.samples().len() as f64 / sample_rate as f64
    }

    /// Returns true once sample data got applied to the buffer.
    pub fn loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// Whether the buffer currently is read back to front.
    pub fn reverse(&self) -> bool {
        self.inner.reverse.load(Ordering::Relaxed)
    }

    /// Flip the buffer's read direction. Observable by all voices reading the buffer
    /// from now on - voices already in flight are not rewound.
    pub fn set_reverse(&self, reverse: bool) {
        self.inner.reverse.store(reverse, Ordering::Relaxed);
    }
}

// -------------------------------------------------------------------------------------------------

/// Decode a WAV file into mono f32 samples, averaging all channels.
#[cfg(feature = "wav")]
pub(crate) fn decode_wav_file(file_path: &str) -> Result<(Vec<f32>, u32), Error> {
    let mut reader = hound::WavReader::open(file_path)?;
    let spec = reader.spec();
    let channel_count = spec.channels.max(1) as usize;
    let frame_count = reader.duration() as usize;

    let mut samples = Vec::with_capacity(frame_count);
    match spec.sample_format {
        hound::SampleFormat::Float => {
            let mut frame_sum = 0.0f32;
            let mut channel = 0;
            for sample in reader.samples::<f32>() {
                frame_sum += sample?;
                channel += 1;
                if channel == channel_count {
                    samples.push(frame_sum / channel_count as f32);
                    frame_sum = 0.0;
                    channel = 0;
                }
            }
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u32 << (spec.bits_per_sample - 1)) as f32;
            let mut frame_sum = 0.0f32;
            let mut channel = 0;
            for sample in reader.samples::<i32>() {
                frame_sum += sample? as f32 * scale;
                channel += 1;
                if channel == channel_count {
                    samples.push(frame_sum / channel_count as f32);
                    frame_sum = 0.0;
                    channel = 0;
                }
            }
        }
    }
    Ok((samples, spec.sample_rate))
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer() {
        let buffer = SampleBuffer::new();
        assert!(!buffer.loaded());
        assert_eq!(buffer.duration(), 0.0);
        assert!(buffer.samples().is_empty());
    }

    #[test]
    fn loaded_buffer() {
        let buffer = SampleBuffer::from_samples(vec![0.0; 44100], 44100).unwrap();
        assert!(buffer.loaded());
        assert!((buffer.duration() - 1.0).abs() < 1e-9);

        assert!(SampleBuffer::from_samples(vec![0.0; 10], 0).is_err());
    }

    #[test]
    fn deferred_load() {
        let buffer = SampleBuffer::new();
        let clone = buffer.clone();
        buffer.set_samples(vec![0.5; 22050], 44100);
        // clones share the same sample data
        assert!(clone.loaded());
        assert!((clone.duration() - 0.5).abs() < 1e-9);
        assert_eq!(clone.samples()[0], 0.5);
    }

    #[test]
    fn reverse_flag() {
        let buffer = SampleBuffer::from_samples(vec![0.0; 10], 44100).unwrap();
        let clone = buffer.clone();
        assert!(!buffer.reverse());
        buffer.set_reverse(true);
        assert!(clone.reverse());
    }

    #[cfg(feature = "wav")]
    #[test]
    fn wav_decoding() {
        let path = std::env::temp_dir().join("grainplay_buffer_test.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..2205 {
            writer.write_sample(8192_i16).unwrap(); // left
            writer.write_sample(-8192_i16).unwrap(); // right
        }
        writer.finalize().unwrap();

        let buffer = SampleBuffer::from_wav_file(path.to_str().unwrap()).unwrap();
        assert_eq!(buffer.sample_rate(), 22050);
        assert_eq!(buffer.samples().len(), 2205);
        assert!((buffer.duration() - 0.1).abs() < 1e-9);
        // stereo downmix averages both channels to silence here
        assert!(buffer.samples().iter().all(|s| s.abs() < 1e-6));

        let _ = std::fs::remove_file(&path);
    }
}
