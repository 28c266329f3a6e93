//! The grain scheduling engine.

use std::collections::VecDeque;

use crossbeam_channel::Sender;

use crate::{
    buffer::SampleBuffer,
    clock::{ClockEvent, TickClock},
    error::Error,
    grain::{time_to_frame, GrainVoice},
    source::{Source, SourceId, SourceTime},
    utils::{cents_to_ratio, db_to_linear},
};

// -------------------------------------------------------------------------------------------------

/// Playback state of a [`GrainPlayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PlaybackState {
    /// Not playing: the initial state, and the state after an explicit stop or after
    /// playback naturally ran past the end of a non-looped buffer.
    Stopped,
    /// The tick clock runs and spawns grain voices.
    Started,
}

// -------------------------------------------------------------------------------------------------

/// Status events emitted by a [`GrainPlayer`] via its optional status channel sender.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackStatusEvent {
    /// The player's sample buffer finished loading.
    Loaded,
    /// The player's sample buffer failed to load.
    LoadFailed { message: String },
    /// Playback stopped at the given stream time, after an explicit stop, a scheduled
    /// stop duration, a restart, or the natural end of a non-looped buffer.
    Stopped { time: f64 },
}

// -------------------------------------------------------------------------------------------------

/// Options to initialize playback properties of a [`GrainPlayer`].
#[derive(Debug, Clone, Copy)]
pub struct GrainPlayerOptions {
    /// By default 1.0: overall playback speed, as a multiplier of the buffer's natural
    /// rate. Controls grain spacing, not grain pitch. Must exceed 0.001.
    pub playback_rate: f64,
    /// By default 0.2 seconds: nominal duration of a single grain's content window.
    pub grain_size: f64,
    /// By default 0.1 seconds: crossfade duration applied to each grain's edges.
    /// Semantically at most `grain_size`.
    pub overlap: f64,
    /// By default 0.0: pitch offset in cents, applied per grain, independent of
    /// `playback_rate`.
    pub detune: f64,
    /// By default false: whether each grain voice loops inside the buffer's loop region.
    pub looped: bool,
    /// Loop region start in seconds.
    pub loop_start: f64,
    /// Loop region end in seconds. 0.0 resolves to the buffer's end.
    pub loop_end: f64,
    /// By default false: play the buffer back to front.
    pub reverse: bool,
    /// By default 1.0: the player's output volume.
    pub volume: f32,
}

impl Default for GrainPlayerOptions {
    fn default() -> Self {
        Self {
            playback_rate: 1.0,
            grain_size: 0.2,
            overlap: 0.1,
            detune: 0.0,
            looped: false,
            loop_start: 0.0,
            loop_end: 0.0,
            reverse: false,
            volume: 1.0,
        }
    }
}

impl GrainPlayerOptions {
    pub fn playback_rate(mut self, playback_rate: f64) -> Self {
        self.playback_rate = playback_rate;
        self
    }
    pub fn grain_size(mut self, grain_size: f64) -> Self {
        self.grain_size = grain_size;
        self
    }
    pub fn overlap(mut self, overlap: f64) -> Self {
        self.overlap = overlap;
        self
    }
    pub fn detune(mut self, detune: f64) -> Self {
        self.detune = detune;
        self
    }
    pub fn looped(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }
    pub fn loop_range(mut self, loop_start: f64, loop_end: f64) -> Self {
        self.loop_start = loop_start;
        self.loop_end = loop_end;
        self
    }
    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }
    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }
    pub fn volume_db(mut self, volume_db: f32) -> Self {
        self.volume = db_to_linear(volume_db);
        self
    }

    /// Validate all parameters. Returns [`Error::ParameterError`] on errors.
    pub fn validate(&self) -> Result<(), Error> {
        validate_playback_rate(self.playback_rate)?;
        validate_grain_size(self.grain_size)?;
        validate_overlap(self.overlap)?;
        validate_detune(self.detune)?;
        validate_loop_bound("loop start", self.loop_start)?;
        validate_loop_bound("loop end", self.loop_end)?;
        if self.volume < 0.0 || self.volume.is_nan() {
            return Err(Error::ParameterError(format!(
                "volume must be a positive number, but is '{}'",
                self.volume
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

fn validate_playback_rate(playback_rate: f64) -> Result<(), Error> {
    if !playback_rate.is_finite() || playback_rate <= GrainPlayer::MIN_PLAYBACK_RATE {
        return Err(Error::ParameterError(format!(
            "playback rate must exceed {}, but is '{playback_rate}'",
            GrainPlayer::MIN_PLAYBACK_RATE
        )));
    }
    Ok(())
}

fn validate_grain_size(grain_size: f64) -> Result<(), Error> {
    if !grain_size.is_finite() || grain_size <= 0.0 {
        return Err(Error::ParameterError(format!(
            "grain size must be a positive number of seconds, but is '{grain_size}'"
        )));
    }
    Ok(())
}

fn validate_overlap(overlap: f64) -> Result<(), Error> {
    if !overlap.is_finite() || overlap < 0.0 {
        return Err(Error::ParameterError(format!(
            "overlap must be a positive number of seconds, but is '{overlap}'"
        )));
    }
    Ok(())
}

fn validate_detune(detune: f64) -> Result<(), Error> {
    if !detune.is_finite() {
        return Err(Error::ParameterError(format!(
            "detune must be a finite number of cents, but is '{detune}'"
        )));
    }
    Ok(())
}

fn validate_loop_bound(name: &str, value: f64) -> Result<(), Error> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::ParameterError(format!(
            "{name} must be a positive number of seconds, but is '{value}'"
        )));
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------

/// Granular synthesis playback engine: plays a [`SampleBuffer`] as a continuous stream
/// of short, overlapping, cross-faded [`GrainVoice`]s, with playback speed and pitch
/// controllable independently of each other.
///
/// The player owns a [`TickClock`] running at `playback_rate / grain_size` Hz. Every
/// clock tick spawns exactly one grain voice: the tick count determines the voice's
/// read offset into the buffer, the `overlap` parameter its fade envelope, and `detune`
/// its pitch - so tick *spacing* encodes playback speed while each voice's own rate
/// encodes pitch. Spawned voices are tracked in spawn order until their completion
/// notification retires them.
///
/// All playback parameters can be changed while the player runs. Changes take effect
/// for voices spawned afterwards and never retroactively alter voices already sounding.
///
/// The player implements [`Source`]: its `write` call is the single driver which
/// advances the clock, spawns and mixes voices and applies scheduled stops, all
/// sample-accurately against the output stream time. Control calls (`start`, `stop`,
/// parameter setters) only schedule: they never block, and they must be serialized
/// with `write` by the caller (single control thread).
pub struct GrainPlayer {
    buffer: SampleBuffer,
    clock: TickClock,
    playback_rate: f64,
    grain_size: f64,
    overlap: f64,
    detune: f64,
    looped: bool,
    loop_start: f64,
    loop_end: f64,
    volume: f32,
    state: PlaybackState,
    voices: VecDeque<GrainVoice>,
    pending_restart: Option<(f64, Option<f64>, Option<f64>)>,
    spawned_voices: usize,
    status_send: Option<Sender<PlaybackStatusEvent>>,
    channel_count: usize,
    sample_rate: u32,
    stream_frame: u64,
    disposed: bool,
}

impl GrainPlayer {
    /// Lowest allowed playback rate. Setting a rate at or below this floor is rejected.
    pub const MIN_PLAYBACK_RATE: f64 = 0.001;

    /// Create a new player for the given buffer with the given playback options and
    /// output signal specs. Status events are emitted via the optional sender.
    pub fn new(
        buffer: SampleBuffer,
        options: GrainPlayerOptions,
        sample_rate: u32,
        channel_count: usize,
        status_send: Option<Sender<PlaybackStatusEvent>>,
    ) -> Result<Self, Error> {
        options.validate()?;
        if sample_rate == 0 || channel_count == 0 {
            return Err(Error::ParameterError(format!(
                "invalid output signal specs: {channel_count} channels at {sample_rate} Hz"
            )));
        }
        buffer.set_reverse(options.reverse);
        let clock = TickClock::new(options.playback_rate / options.grain_size);
        Ok(Self {
            buffer,
            clock,
            playback_rate: options.playback_rate,
            grain_size: options.grain_size,
            overlap: options.overlap,
            detune: options.detune,
            looped: options.looped,
            loop_start: options.loop_start,
            loop_end: options.loop_end,
            volume: options.volume,
            state: PlaybackState::Stopped,
            voices: VecDeque::new(),
            pending_restart: None,
            spawned_voices: 0,
            status_send,
            channel_count,
            sample_rate,
            stream_frame: 0,
            disposed: false,
        })
    }

    /// The player's current playback state.
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// The player's stream time in seconds: the time of the next sample to render.
    /// Control calls without an explicit time resolve to this.
    pub fn current_time(&self) -> f64 {
        self.stream_frame as f64 / self.sample_rate as f64
    }

    /// The player's sample buffer.
    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Returns true once the player's sample buffer finished loading.
    pub fn loaded(&self) -> bool {
        self.buffer.loaded()
    }

    /// Number of grain voices currently sounding.
    pub fn active_voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Number of grain voices spawned since the last start.
    pub fn spawned_voice_count(&self) -> usize {
        self.spawned_voices
    }

    // ---------------------------------------------------------------------------------------------
    // Playback parameters

    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }
    /// Set a new playback rate, effective for all following ticks: this recomputes the
    /// tick clock's frequency as `playback_rate / grain_size`.
    pub fn set_playback_rate(&mut self, playback_rate: f64) -> Result<(), Error> {
        validate_playback_rate(playback_rate)?;
        self.playback_rate = playback_rate;
        self.update_clock_frequency();
        Ok(())
    }

    pub fn grain_size(&self) -> f64 {
        self.grain_size
    }
    /// Set a new grain size, effective for all following ticks: this recomputes the
    /// tick clock's frequency as `playback_rate / grain_size`.
    pub fn set_grain_size(&mut self, grain_size: f64) -> Result<(), Error> {
        validate_grain_size(grain_size)?;
        self.grain_size = grain_size;
        self.update_clock_frequency();
        Ok(())
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }
    /// Set a new grain edge crossfade duration, applied to voices spawned afterwards.
    pub fn set_overlap(&mut self, overlap: f64) -> Result<(), Error> {
        validate_overlap(overlap)?;
        self.overlap = overlap;
        Ok(())
    }

    pub fn detune(&self) -> f64 {
        self.detune
    }
    /// Set a new pitch offset in cents, applied to voices spawned afterwards.
    pub fn set_detune(&mut self, detune: f64) -> Result<(), Error> {
        validate_detune(detune)?;
        self.detune = detune;
        Ok(())
    }

    pub fn looped(&self) -> bool {
        self.looped
    }
    /// Set whether voices loop inside the buffer's loop region. Also disables the
    /// player's natural stop at the buffer's end.
    pub fn set_looped(&mut self, looped: bool) {
        self.looped = looped;
    }

    pub fn loop_start(&self) -> f64 {
        self.loop_start
    }
    pub fn set_loop_start(&mut self, loop_start: f64) -> Result<(), Error> {
        validate_loop_bound("loop start", loop_start)?;
        self.loop_start = loop_start;
        Ok(())
    }

    pub fn loop_end(&self) -> f64 {
        self.loop_end
    }
    pub fn set_loop_end(&mut self, loop_end: f64) -> Result<(), Error> {
        validate_loop_bound("loop end", loop_end)?;
        self.loop_end = loop_end;
        Ok(())
    }

    pub fn reverse(&self) -> bool {
        self.buffer.reverse()
    }
    /// Flip the buffer's read direction. This mutates the shared buffer and thus is
    /// observable by all voices, including voices already in flight.
    pub fn set_reverse(&mut self, reverse: bool) {
        self.buffer.set_reverse(reverse);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }
    pub fn set_volume(&mut self, volume: f32) -> Result<(), Error> {
        if volume < 0.0 || volume.is_nan() {
            return Err(Error::ParameterError(format!(
                "volume must be a positive number, but is '{volume}'"
            )));
        }
        self.volume = volume;
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Transport

    /// Start playback at the given stream time (by default now), reading the buffer
    /// from the given offset in seconds (by default 0). When a duration is given, a
    /// stop is scheduled at `time + duration`.
    ///
    /// Ignored with a debug log when the player already is started.
    pub fn start(&mut self, time: Option<f64>, offset: Option<f64>, duration: Option<f64>) {
        if self.disposed {
            log::debug!("ignoring start: player is disposed");
            return;
        }
        if self.state == PlaybackState::Started {
            log::debug!("ignoring start: player already is {}", self.state);
            return;
        }
        let now = self.current_time();
        let time = time.unwrap_or(now).max(now);
        let offset = offset.unwrap_or(0.0).max(0.0);
        // convert the requested sample offset into an equivalent initial tick count
        let grain_duration = 1.0 / self.clock.frequency_at(time);
        let initial_ticks = offset / grain_duration;
        self.clock.start(time, initial_ticks);
        if let Some(duration) = duration {
            self.clock.stop(time + duration);
        }
        self.spawned_voices = 0;
        self.state = PlaybackState::Started;
    }

    /// Schedule a stop at the given stream time (by default now). The stop handler
    /// force-stops every voice still sounding at the stop time with a zero fade-out,
    /// so no grain keeps ringing past the stop boundary, and then emits a
    /// [`PlaybackStatusEvent::Stopped`] notification.
    ///
    /// Ignored with a debug log when the player is not started.
    pub fn stop(&mut self, time: Option<f64>) {
        if self.disposed {
            log::debug!("ignoring stop: player is disposed");
            return;
        }
        if self.state != PlaybackState::Started {
            log::debug!("ignoring stop: player is {}", self.state);
            return;
        }
        let now = self.current_time();
        let time = time.unwrap_or(now).max(now);
        // an explicit stop cancels a previously scheduled restart
        self.pending_restart = None;
        self.clock.stop(time);
    }

    /// Stop and start again in one step, both effective at the very same time (by
    /// default now): ticks keep firing and voices keep fading normally until that
    /// time, then the voices still in flight are force-stopped without a fade-out
    /// and playback resumes from the given buffer offset.
    ///
    /// A no-op when the player is not started.
    pub fn restart(&mut self, time: Option<f64>, offset: Option<f64>, duration: Option<f64>) {
        if self.disposed {
            log::debug!("ignoring restart: player is disposed");
            return;
        }
        if self.state != PlaybackState::Started {
            log::debug!("ignoring restart: player is {}", self.state);
            return;
        }
        let now = self.current_time();
        let time = time.unwrap_or(now).max(now);
        if time > now {
            // keep playing until the restart time: the scheduled stop fires through
            // the clock, then the pending start resumes at the very same instant
            self.pending_restart = Some((time, offset, duration));
            self.clock.stop(time);
            return;
        }
        // immediate stop: no round trip through the clock's stopped notification
        self.pending_restart = None;
        for voice in &mut self.voices {
            voice.force_stop(time);
        }
        self.clock.halt();
        self.state = PlaybackState::Stopped;
        self.send_status(PlaybackStatusEvent::Stopped { time });
        self.start(Some(time), offset, duration);
    }

    /// Release all of the player's resources: halts the clock, cancels all voices
    /// mid-playback and disconnects the status channel, so that no notification fires
    /// after disposal. A disposed player stays silent forever.
    pub fn dispose(&mut self) {
        let now = self.current_time();
        self.clock.halt();
        self.pending_restart = None;
        for mut voice in self.voices.drain(..) {
            voice.force_stop(now);
        }
        self.buffer = SampleBuffer::new();
        self.status_send = None;
        self.state = PlaybackState::Stopped;
        self.disposed = true;
    }

    /// Load the player's sample buffer from the given WAV file on a background thread.
    /// Completion is signaled with a [`PlaybackStatusEvent::Loaded`] or
    /// [`PlaybackStatusEvent::LoadFailed`] event.
    #[cfg(feature = "wav")]
    pub fn load_wav_file(&self, file_path: &str) {
        let buffer = self.buffer.clone();
        let status_send = self.status_send.clone();
        let file_path = file_path.to_string();
        std::thread::spawn(move || match crate::buffer::decode_wav_file(&file_path) {
            Ok((samples, sample_rate)) => {
                buffer.set_samples(samples, sample_rate);
                if let Some(sender) = status_send {
                    if let Err(err) = sender.try_send(PlaybackStatusEvent::Loaded) {
                        log::warn!("Failed to send playback status event: {err}");
                    }
                }
            }
            Err(err) => {
                log::warn!("Failed to load sample file '{file_path}': {err}");
                if let Some(sender) = status_send {
                    let _ = sender.try_send(PlaybackStatusEvent::LoadFailed {
                        message: err.to_string(),
                    });
                }
            }
        });
    }

    // ---------------------------------------------------------------------------------------------
    // Scheduling internals

    /// Recompute and apply the tick clock's frequency from the current playback rate
    /// and grain size, effective at the current time. The single derivation step shared
    /// by all setters in the derivation's input set.
    fn update_clock_frequency(&mut self) {
        let frequency = self.playback_rate / self.grain_size;
        self.clock.set_frequency(frequency, self.current_time());
    }

    /// The loop region's end in seconds, resolving 0 to the buffer's end.
    fn resolved_loop_end(&self) -> f64 {
        if self.loop_end > 0.0 {
            self.loop_end
        } else {
            self.buffer.duration()
        }
    }

    /// Spawn one grain voice for the clock tick at the given time. Returns false when
    /// playback instead naturally ended past a non-looped buffer, halting the clock.
    fn handle_tick(&mut self, count: f64, time: f64, frequency: f64) -> bool {
        let grain_duration = 1.0 / frequency;
        let offset = count * grain_duration;
        if !self.looped && offset > self.buffer.duration() {
            // ran past the end of the buffer: stop instead of spawning a grain
            self.finish_playback(time);
            return false;
        }
        // the very first grain of the buffer needs no incoming crossfade
        let fade_in = if offset < self.overlap { 0.0 } else { self.overlap };
        let mut voice = GrainVoice::new(
            self.buffer.clone(),
            fade_in,
            self.overlap,
            self.looped,
            self.loop_start,
            self.resolved_loop_end(),
            // pitch is the voice's own rate; speed is already encoded in tick spacing
            cents_to_ratio(self.detune),
            self.channel_count,
            self.sample_rate,
        );
        voice.start(time, self.grain_size * count);
        voice.stop(time + self.grain_size / self.playback_rate);
        self.voices.push_back(voice);
        self.spawned_voices += 1;
        true
    }

    /// The stop handler, invoked once per clock halt: force-stops every voice still
    /// sounding with a zero fade-out and notifies the stop time.
    fn finish_playback(&mut self, time: f64) {
        for mut voice in self.voices.drain(..) {
            voice.force_stop(time);
        }
        self.state = PlaybackState::Stopped;
        self.send_status(PlaybackStatusEvent::Stopped { time });
    }

    /// A voice's completion notification: remove it from the active set. Tolerates
    /// voices which already got removed, so duplicate or out-of-order notifications
    /// are no-ops.
    fn on_voice_ended(&mut self, voice_id: SourceId) {
        if let Some(index) = self.voices.iter().position(|voice| voice.id() == voice_id) {
            self.voices.remove(index);
        }
    }

    /// Retire all voices whose sound fully ended.
    fn retire_finished_voices(&mut self) {
        while let Some(index) = self.voices.iter().position(|voice| voice.is_exhausted()) {
            let voice_id = self.voices[index].id();
            self.on_voice_ended(voice_id);
        }
    }

    fn on_clock_event(&mut self, event: ClockEvent) -> bool {
        match event {
            ClockEvent::Tick {
                count,
                time,
                frequency,
            } => self.handle_tick(count, time, frequency),
            ClockEvent::Stopped { time } => {
                self.finish_playback(time);
                true
            }
        }
    }

    /// Pump all due clock events up to the given time horizon.
    fn process_clock(&mut self, until: f64) {
        loop {
            // temporarily move the clock out to process events against &mut self
            let mut clock = std::mem::take(&mut self.clock);
            clock.process(until, |event| self.on_clock_event(event));
            self.clock = clock;
            // a restart scheduled for the future resumes as soon as its stop got
            // applied, then the pump runs again to pick up the tick at the restart
            if self.state == PlaybackState::Stopped {
                if let Some((time, offset, duration)) = self.pending_restart.take() {
                    self.start(Some(time), offset, duration);
                    continue;
                }
            }
            break;
        }
    }

    fn send_status(&mut self, event: PlaybackStatusEvent) {
        if let Some(sender) = &self.status_send {
            if let Err(err) = sender.try_send(event) {
                log::warn!("Failed to send playback status event: {err}");
            }
        }
    }
}

impl Source for GrainPlayer {
    fn write(&mut self, output: &mut [f32], time: &SourceTime) -> usize {
        output.fill(0.0);
        if self.disposed {
            return 0;
        }

        let channel_count = self.channel_count;
        let frame_count = output.len() / channel_count;
        let sample_rate = self.sample_rate as f64;
        let block_start = time.pos_in_frames;

        let mut frames_done = 0;
        while frames_done < frame_count {
            // process all clock events due at the current render position. the half
            // frame tolerance catches events whose time rounds to the current frame
            let now = (block_start + frames_done as u64) as f64 / sample_rate;
            self.process_clock(now + 0.5 / sample_rate);

            // render voices up to the next scheduled event, or the block's end
            let chunk_end = match self.clock.next_due_time() {
                Some(event_time) => {
                    let event_frame = time_to_frame(event_time, self.sample_rate);
                    (event_frame.saturating_sub(block_start) as usize)
                        .clamp(frames_done + 1, frame_count)
                }
                None => frame_count,
            };
            let chunk = &mut output[frames_done * channel_count..chunk_end * channel_count];
            let chunk_time = time.with_added_frames(frames_done as u64);
            for voice in &mut self.voices {
                voice.write(chunk, &chunk_time);
            }
            self.retire_finished_voices();
            frames_done = chunk_end;
        }
        self.stream_frame = block_start + frame_count as u64;

        if (self.volume - 1.0).abs() > 0.0001 {
            for sample in output.iter_mut() {
                *sample *= self.volume;
            }
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
        self.disposed
    }
}

// -------------------------------------------------------------------------------------------------
