//! One-shot grain voice playback.

use crate::{
    buffer::SampleBuffer,
    source::{unique_source_id, Source, SourceId, SourceTime},
};

// -------------------------------------------------------------------------------------------------

/// A disposable, one-shot grain playback unit.
///
/// A voice is bound to a shared [`SampleBuffer`] and plays a single windowed fragment of
/// it: scheduled sample-accurately via [`GrainVoice::start`] and [`GrainVoice::stop`]
/// against the output stream time, shaped by a linear fade-in/fade-out envelope, pitched
/// by a playback rate multiplier, and optionally looping inside the buffer's loop region.
///
/// The voice's sound fully ends at `stop time + fade out`. Once its `write` calls run
/// past that point it flags itself as exhausted, which is the completion notification
/// its owner reacts to. [`GrainVoice::force_stop`] cancels all remaining sound at the
/// given time with a zero fade-out.
///
/// `write` mixes *additively* into the passed output buffer, so any number of
/// overlapping voices can share one output sink.
#[derive(Debug, Clone)]
pub struct GrainVoice {
    voice_id: SourceId,
    buffer: SampleBuffer,
    fade_in: f64,
    fade_out: f64,
    looped: bool,
    loop_start: f64,
    loop_end: f64,
    playback_rate: f64,
    channel_count: usize,
    sample_rate: u32,
    start_time: f64,
    stop_time: f64,
    start_frame: u64,
    end_frame: u64,
    position: f64,
    started: bool,
    finished: bool,
}

impl GrainVoice {
    /// Create a new unscheduled voice reading from the given buffer.
    ///
    /// `fade_in` and `fade_out` are linear envelope edge durations in seconds.
    /// `loop_start`/`loop_end` bound the buffer's loop region in seconds and only apply
    /// with `looped` set. `playback_rate` is the voice's own rate multiplier, on top of
    /// the buffer's natural rate.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: SampleBuffer,
        fade_in: f64,
        fade_out: f64,
        looped: bool,
        loop_start: f64,
        loop_end: f64,
        playback_rate: f64,
        channel_count: usize,
        sample_rate: u32,
    ) -> Self {
        debug_assert!(fade_in >= 0.0 && fade_out >= 0.0, "Invalid fade durations");
        debug_assert!(playback_rate > 0.0, "Invalid playback rate");
        debug_assert!(
            channel_count > 0 && sample_rate > 0,
            "Invalid output signal specs"
        );
        Self {
            voice_id: unique_source_id(),
            buffer,
            fade_in,
            fade_out,
            looped,
            loop_start,
            loop_end,
            playback_rate,
            channel_count,
            sample_rate,
            start_time: 0.0,
            stop_time: f64::MAX,
            start_frame: 0,
            end_frame: u64::MAX,
            position: 0.0,
            started: false,
            finished: false,
        }
    }

    /// The voice's unique id, used by owners to track completions.
    pub fn id(&self) -> SourceId {
        self.voice_id
    }

    /// Fade-in duration in seconds.
    pub fn fade_in(&self) -> f64 {
        self.fade_in
    }
    /// Fade-out duration in seconds.
    pub fn fade_out(&self) -> f64 {
        self.fade_out
    }
    /// The voice's own playback rate multiplier.
    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Schedule the voice to start sounding at the given stream time, reading the
    /// buffer from the given offset in seconds.
    pub fn start(&mut self, at_time: f64, buffer_offset: f64) {
        debug_assert!(!self.started, "Voices can only be scheduled once");
        self.started = true;
        self.start_time = at_time;
        self.start_frame = time_to_frame(at_time, self.sample_rate);
        self.position = buffer_offset;
    }

    /// Schedule the voice to stop at the given stream time. The fade-out envelope
    /// starts at the stop time, so sound fully ends at `at_time + fade_out`.
    pub fn stop(&mut self, at_time: f64) {
        self.stop_time = at_time;
        self.end_frame = time_to_frame(at_time + self.fade_out, self.sample_rate);
    }

    /// Immediately cancel all sound remaining at and after the given time: the
    /// fade-out is zeroed out and the stop moved up, trading the crossfade's
    /// smoothness for a guaranteed silent stop boundary.
    pub fn force_stop(&mut self, at_time: f64) {
        self.fade_out = 0.0;
        self.stop_time = self.stop_time.min(at_time);
        self.end_frame = time_to_frame(self.stop_time, self.sample_rate);
    }

    /// Linear envelope value at the given stream time.
    fn envelope_at(&self, time: f64) -> f32 {
        let mut envelope = 1.0;
        if self.fade_in > 0.0 {
            let elapsed = time - self.start_time;
            if elapsed < self.fade_in {
                envelope *= (elapsed / self.fade_in) as f32;
            }
        }
        if time >= self.stop_time {
            if self.fade_out > 0.0 {
                let remaining = (self.stop_time + self.fade_out - time) / self.fade_out;
                envelope *= remaining.clamp(0.0, 1.0) as f32;
            } else {
                envelope = 0.0;
            }
        }
        envelope
    }

    /// Read the buffer at the voice's current position with linear interpolation,
    /// honoring the buffer's live reverse flag. Positions outside the buffer are
    /// silent.
    fn read_buffer(&self, samples: &[f32], buffer_rate: u32, reverse: bool) -> f32 {
        if samples.is_empty() || buffer_rate == 0 {
            return 0.0;
        }
        let max_index = (samples.len() - 1) as f64;
        let mut float_index = self.position * buffer_rate as f64;
        if reverse {
            float_index = max_index - float_index;
        }
        if float_index < 0.0 || float_index > max_index {
            return 0.0;
        }
        let index = float_index as usize;
        let fraction = (float_index - index as f64) as f32;
        let value = samples[index];
        let next_value = samples[(index + 1).min(samples.len() - 1)];
        value + (next_value - value) * fraction
    }

    /// Advance the read position by one output frame, wrapping inside the loop region.
    fn advance_position(&mut self) {
        self.position += self.playback_rate / self.sample_rate as f64;
        if self.looped {
            let loop_len = self.loop_end - self.loop_start;
            if loop_len > 0.0 && self.position >= self.loop_end {
                self.position = self.loop_start + (self.position - self.loop_end) % loop_len;
            }
        }
    }
}

impl Source for GrainVoice {
    fn write(&mut self, output: &mut [f32], time: &SourceTime) -> usize {
        debug_assert!(self.started, "Should only write scheduled voices");
        if self.finished {
            return 0;
        }

        let samples = self.buffer.samples();
        let buffer_rate = self.buffer.sample_rate();
        let sample_rate = self.sample_rate as f64;

        let frame_count = output.len() / self.channel_count;
        for (frame_index, frame) in output.chunks_exact_mut(self.channel_count).enumerate() {
            let abs_frame = time.pos_in_frames + frame_index as u64;
            if abs_frame < self.start_frame {
                continue;
            }
            if abs_frame >= self.end_frame {
                self.finished = true;
                break;
            }
            let frame_time = abs_frame as f64 / sample_rate;
            let envelope = self.envelope_at(frame_time);
            let sample =
                self.read_buffer(&samples, buffer_rate, self.buffer.reverse()) * envelope;
            for channel_sample in frame.iter_mut() {
                *channel_sample += sample;
            }
            self.advance_position();
        }

        if time.pos_in_frames + frame_count as u64 >= self.end_frame {
            self.finished = true;
        }
        output.len()
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_exhausted(&self) -> bool {
        self.finished
    }
}

// -------------------------------------------------------------------------------------------------

/// Convert a stream time in seconds to the nearest sample frame.
pub(crate) fn time_to_frame(time: f64, sample_rate: u32) -> u64 {
    debug_assert!(sample_rate > 0, "Invalid sample rate");
    (time.max(0.0) * sample_rate as f64).round() as u64
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 100;

    fn test_voice(fade_in: f64, fade_out: f64) -> GrainVoice {
        let buffer = SampleBuffer::from_samples(vec![1.0; 100], SAMPLE_RATE).unwrap();
        GrainVoice::new(
            buffer,
            fade_in,
            fade_out,
            false,
            0.0,
            0.0,
            1.0,
            1,
            SAMPLE_RATE,
        )
    }

    #[test]
    fn envelope_fades() {
        let mut voice = test_voice(0.1, 0.1);
        voice.start(0.0, 0.0);
        voice.stop(0.3);

        let mut output = vec![0.0; 50];
        voice.write(&mut output, &SourceTime::default());
        // linear fade in over the first 0.1s
        assert_eq!(output[0], 0.0);
        assert!((output[5] - 0.5).abs() < 1e-6);
        assert!((output[10] - 1.0).abs() < 1e-6);
        // sustained until the stop time
        assert!((output[29] - 1.0).abs() < 1e-6);
        // linear fade out from the stop time until stop + fade_out
        assert!((output[35] - 0.5).abs() < 1e-6);
        assert!(output[39] > 0.0);
        assert_eq!(output[45], 0.0);
        assert!(voice.is_exhausted());
    }

    #[test]
    fn zero_fade_in_starts_at_full_level() {
        let mut voice = test_voice(0.0, 0.1);
        voice.start(0.0, 0.0);
        voice.stop(0.3);

        let mut output = vec![0.0; 10];
        voice.write(&mut output, &SourceTime::default());
        assert!((output[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scheduled_start_is_sample_accurate() {
        let mut voice = test_voice(0.0, 0.0);
        voice.start(0.1, 0.0);
        voice.stop(0.2);

        let mut output = vec![0.0; 15];
        voice.write(&mut output, &SourceTime::default());
        assert_eq!(output[9], 0.0);
        assert!((output[10] - 1.0).abs() < 1e-6);
        assert!(!voice.is_exhausted());

        // continue in a second block: the stop frame is exclusive
        let mut output = vec![0.0; 15];
        voice.write(&mut output, &SourceTime { pos_in_frames: 15 });
        assert!((output[4] - 1.0).abs() < 1e-6);
        assert_eq!(output[5], 0.0);
        assert!(voice.is_exhausted());
    }

    #[test]
    fn force_stop_cancels_remaining_sound() {
        let mut voice = test_voice(0.0, 0.1);
        voice.start(0.0, 0.0);
        voice.stop(0.3);
        voice.force_stop(0.1);
        assert_eq!(voice.fade_out(), 0.0);

        let mut output = vec![0.0; 50];
        voice.write(&mut output, &SourceTime::default());
        assert!((output[9] - 1.0).abs() < 1e-6);
        assert_eq!(output[10], 0.0);
        assert!(voice.is_exhausted());
    }

    #[test]
    fn additive_mixing() {
        let mut voice = test_voice(0.0, 0.0);
        voice.start(0.0, 0.0);
        voice.stop(0.1);

        let mut output = vec![0.25; 10];
        voice.write(&mut output, &SourceTime::default());
        assert!((output[0] - 1.25).abs() < 1e-6);
    }

    #[test]
    fn loop_region_wraps() {
        // a ramp buffer so read values identify positions
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let buffer = SampleBuffer::from_samples(samples, SAMPLE_RATE).unwrap();
        let mut voice = GrainVoice::new(buffer, 0.0, 0.0, true, 0.2, 0.4, 1.0, 1, SAMPLE_RATE);
        voice.start(0.0, 0.3);
        voice.stop(1.0);

        let mut output = vec![0.0; 50];
        voice.write(&mut output, &SourceTime::default());
        // reads 0.3..0.4, then wraps back to the loop start at 0.2
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert!((output[9] - 0.39).abs() < 1e-6);
        assert!((output[10] - 0.2).abs() < 1e-6);
        assert!((output[30] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn reverse_flips_read_direction() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let buffer = SampleBuffer::from_samples(samples, SAMPLE_RATE).unwrap();
        buffer.set_reverse(true);
        let mut voice =
            GrainVoice::new(buffer.clone(), 0.0, 0.0, false, 0.0, 0.0, 1.0, 1, SAMPLE_RATE);
        voice.start(0.0, 0.0);
        voice.stop(0.2);

        let mut output = vec![0.0; 20];
        voice.write(&mut output, &SourceTime::default());
        // position 0 reads the buffer's last sample when reversed
        assert!((output[0] - 0.99).abs() < 1e-6);
        assert!((output[10] - 0.89).abs() < 1e-6);
    }

    #[test]
    fn unloaded_buffer_is_silent() {
        let buffer = SampleBuffer::new();
        let mut voice = GrainVoice::new(buffer, 0.0, 0.0, false, 0.0, 0.0, 1.0, 1, SAMPLE_RATE);
        voice.start(0.0, 0.0);
        voice.stop(0.1);

        let mut output = vec![0.0; 20];
        voice.write(&mut output, &SourceTime::default());
        assert!(output.iter().all(|sample| *sample == 0.0));
        assert!(voice.is_exhausted());
    }
}
