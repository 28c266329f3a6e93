//! Periodic tick clock, the scheduling heartbeat of the grain player.

// -------------------------------------------------------------------------------------------------

/// A single frequency automation point of a [`TickClock`].
#[derive(Debug, Clone, Copy)]
struct FrequencySetting {
    time: f64,
    frequency: f64,
}

// -------------------------------------------------------------------------------------------------

/// Events emitted by [`TickClock::process`], in strictly increasing time order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ClockEvent {
    /// A tick fired. `count` is the tick count reachable at `time` (fractional when the
    /// clock got started with a fractional initial count). `frequency` is the clock
    /// frequency at the tick's time, which also fixes the period up to the next tick.
    Tick { count: f64, time: f64, frequency: f64 },
    /// A scheduled stop got crossed. Emitted exactly once per [`TickClock::stop`].
    Stopped { time: f64 },
}

// -------------------------------------------------------------------------------------------------

/// A periodic clock which emits ticks at a live-changeable frequency against a shared
/// stream timeline, measured in seconds.
///
/// The clock never runs on its own: a driver repeatedly calls [`TickClock::process`]
/// with an advancing time horizon, and the clock invokes the given callback once per
/// tick that is due before the horizon. All "waiting" is expressed as future tick
/// times, never as a blocking operation.
///
/// Frequency changes are recorded as piecewise-constant automation: each tick's period
/// is fixed by the frequency value at the instant the tick fires, so changing the
/// frequency mid-period never reschedules the tick already in flight, only the spacing
/// of later ticks. [`TickClock::ticks_at`] replays the same schedule, so tick queries
/// and emissions can't disagree.
#[derive(Debug, Clone)]
pub(crate) struct TickClock {
    automation: Vec<FrequencySetting>,
    started: bool,
    start_time: f64,
    initial_ticks: f64,
    ticks_emitted: u64,
    next_tick_time: f64,
    pending_stop: Option<f64>,
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl TickClock {
    /// Create a new stopped clock with the given initial tick frequency in Hz.
    pub fn new(frequency: f64) -> Self {
        debug_assert!(frequency > 0.0, "Invalid clock frequency");
        Self {
            automation: vec![FrequencySetting {
                time: 0.0,
                frequency,
            }],
            started: false,
            start_time: 0.0,
            initial_ticks: 0.0,
            ticks_emitted: 0,
            next_tick_time: 0.0,
            pending_stop: None,
        }
    }

    /// Whether the clock currently emits ticks.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Record a new tick frequency, effective at the given time. Ticks already in
    /// flight keep their period; later ticks use the new spacing.
    pub fn set_frequency(&mut self, frequency: f64, at_time: f64) {
        debug_assert!(frequency > 0.0, "Invalid clock frequency");
        if at_time <= 0.0 {
            self.automation[0].frequency = frequency;
            return;
        }
        // replace an existing setting at the same time, else insert sorted
        self.automation.retain(|setting| setting.time != at_time);
        let insert_pos = self
            .automation
            .partition_point(|setting| setting.time < at_time);
        self.automation.insert(
            insert_pos,
            FrequencySetting {
                time: at_time,
                frequency,
            },
        );
    }

    /// The clock's instantaneous frequency at the given time.
    pub fn frequency_at(&self, time: f64) -> f64 {
        self.automation
            .iter()
            .rev()
            .find(|setting| setting.time <= time)
            .unwrap_or(&self.automation[0])
            .frequency
    }

    /// Start emitting ticks at the given time, with the given (possibly fractional)
    /// initial tick count. The first tick fires exactly at `at_time`.
    pub fn start(&mut self, at_time: f64, initial_ticks: f64) {
        // drop stale automation: of the settings at or before the start time, only
        // the latest one can still be consulted
        let first_relevant = self
            .automation
            .partition_point(|setting| setting.time <= at_time)
            .saturating_sub(1);
        self.automation.drain(..first_relevant);
        self.started = true;
        self.start_time = at_time;
        self.initial_ticks = initial_ticks;
        self.ticks_emitted = 0;
        self.next_tick_time = at_time;
        self.pending_stop = None;
    }

    /// Schedule a halt: no tick at or after the given time fires, and a single
    /// [`ClockEvent::Stopped`] is emitted when processing crosses the stop time.
    /// An earlier already pending stop wins.
    pub fn stop(&mut self, at_time: f64) {
        if !self.started {
            return;
        }
        self.pending_stop = Some(match self.pending_stop {
            Some(pending) => pending.min(at_time),
            None => at_time,
        });
    }

    /// Stop immediately, without emitting a stopped notification.
    pub fn halt(&mut self) {
        self.started = false;
        self.pending_stop = None;
    }

    /// Time of the next due tick or stop event, if any.
    pub fn next_due_time(&self) -> Option<f64> {
        if !self.started {
            return None;
        }
        match self.pending_stop {
            Some(stop_time) => Some(stop_time.min(self.next_tick_time)),
            None => Some(self.next_tick_time),
        }
    }

    /// The tick count reachable at an arbitrary past or future time, by replaying the
    /// recorded frequency automation from the clock's start time. Times before the
    /// start resolve to the initial tick count, times after a pending stop are frozen
    /// at the stop time.
    pub fn ticks_at(&self, time: f64) -> f64 {
        if !self.started {
            return self.initial_ticks;
        }
        let end = match self.pending_stop {
            Some(stop_time) => time.min(stop_time),
            None => time,
        };
        if end <= self.start_time {
            return self.initial_ticks;
        }
        let mut tick_time = self.start_time;
        let mut count = self.initial_ticks;
        loop {
            let period = 1.0 / self.frequency_at(tick_time);
            if tick_time + period <= end {
                tick_time += period;
                count += 1.0;
            } else {
                return count + (end - tick_time) / period;
            }
        }
    }

    /// Drive the clock up to, but not including, the given time horizon. Invokes the
    /// callback once per due event, in time order. When the callback returns `false`
    /// the clock halts immediately and no further events fire.
    pub fn process(&mut self, until: f64, mut callback: impl FnMut(ClockEvent) -> bool) {
        while self.started {
            // a stop wins over a tick at the same instant
            if let Some(stop_time) = self.pending_stop {
                if stop_time <= self.next_tick_time {
                    if stop_time < until {
                        self.halt();
                        callback(ClockEvent::Stopped { time: stop_time });
                    }
                    break;
                }
            }
            if self.next_tick_time >= until {
                break;
            }
            let time = self.next_tick_time;
            let frequency = self.frequency_at(time);
            let count = self.initial_ticks + self.ticks_emitted as f64;
            self.ticks_emitted += 1;
            self.next_tick_time = time + 1.0 / frequency;
            if !callback(ClockEvent::Tick {
                count,
                time,
                frequency,
            }) {
                self.halt();
                break;
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_events(clock: &mut TickClock, until: f64) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        clock.process(until, |event| {
            events.push(event);
            true
        });
        events
    }

    #[test]
    fn tick_emission() {
        let mut clock = TickClock::new(5.0);
        clock.start(0.0, 0.0);

        let events = collect_events(&mut clock, 0.5);
        assert_eq!(events.len(), 3); // ticks at 0.0, 0.2, 0.4
        for (tick, event) in events.iter().enumerate() {
            match event {
                ClockEvent::Tick { count, time, .. } => {
                    assert_eq!(*count, tick as f64);
                    assert!((time - tick as f64 * 0.2).abs() < 1e-9);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        // processing is incremental, the horizon is exclusive
        let events = collect_events(&mut clock, 0.6000001);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ClockEvent::Tick { count, .. } if count == 3.0));
    }

    #[test]
    fn fractional_initial_ticks() {
        let mut clock = TickClock::new(5.0);
        clock.start(1.0, 2.5);

        let events = collect_events(&mut clock, 1.5);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ClockEvent::Tick { count, time, .. }
            if count == 2.5 && time == 1.0));
        assert!(matches!(events[2], ClockEvent::Tick { count, .. } if count == 4.5));
    }

    #[test]
    fn frequency_change_keeps_tick_in_flight() {
        let mut clock = TickClock::new(5.0);
        clock.start(0.0, 0.0);
        assert_eq!(collect_events(&mut clock, 0.01).len(), 1); // tick at 0.0

        // change frequency mid-period: the tick at 0.2 is unaffected,
        // spacing changes afterwards
        clock.set_frequency(10.0, 0.1);
        let events = collect_events(&mut clock, 0.45);
        let times: Vec<f64> = events
            .iter()
            .map(|event| match event {
                ClockEvent::Tick { time, .. } => *time,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(times.len(), 3);
        assert!((times[0] - 0.2).abs() < 1e-9);
        assert!((times[1] - 0.3).abs() < 1e-9);
        assert!((times[2] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn tick_queries_match_emissions() {
        let mut clock = TickClock::new(5.0);
        clock.start(0.25, 1.0);
        clock.set_frequency(10.0, 0.5);

        assert_eq!(clock.ticks_at(0.0), 1.0); // before start
        assert_eq!(clock.ticks_at(0.25), 1.0);
        assert!((clock.ticks_at(0.45) - 2.0).abs() < 1e-9);
        // period of the tick at 0.45 was fixed before the frequency change
        assert!((clock.ticks_at(0.65) - 3.0).abs() < 1e-9);
        assert!((clock.ticks_at(0.75) - 4.0).abs() < 1e-9);
        // fractional progress into the current period
        assert!((clock.ticks_at(0.80) - 4.5).abs() < 1e-9);

        let events = collect_events(&mut clock, 0.76);
        let clock_after = clock.clone();
        for event in events {
            if let ClockEvent::Tick { count, time, .. } = event {
                assert!((clock_after.ticks_at(time) - count).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn start_prunes_stale_automation() {
        let mut clock = TickClock::new(5.0);
        for step in 1..100 {
            clock.set_frequency(5.0 + step as f64, step as f64 * 0.01);
        }
        clock.set_frequency(10.0, 2.0);
        clock.start(1.0, 0.0);

        // of the 100 settings at or before the start time only the latest survives
        assert_eq!(clock.automation.len(), 2);
        assert!((clock.frequency_at(1.0) - 104.0).abs() < 1e-9);
        assert!((clock.frequency_at(2.5) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn scheduled_stop() {
        let mut clock = TickClock::new(5.0);
        clock.start(0.0, 0.0);
        clock.stop(0.4);

        // the tick which would fire exactly at the stop time is suppressed
        let events = collect_events(&mut clock, 1.0);
        assert_eq!(
            events,
            vec![
                ClockEvent::Tick {
                    count: 0.0,
                    time: 0.0,
                    frequency: 5.0
                },
                ClockEvent::Tick {
                    count: 1.0,
                    time: 0.2,
                    frequency: 5.0
                },
                ClockEvent::Stopped { time: 0.4 },
            ]
        );
        assert!(!clock.is_started());

        // stopping a stopped clock is a no-op
        clock.stop(0.5);
        assert!(collect_events(&mut clock, 1.0).is_empty());
    }

    #[test]
    fn earlier_stop_wins() {
        let mut clock = TickClock::new(5.0);
        clock.start(0.0, 0.0);
        clock.stop(0.5);
        clock.stop(0.3);
        clock.stop(0.8);

        let events = collect_events(&mut clock, 1.0);
        assert_eq!(*events.last().unwrap(), ClockEvent::Stopped { time: 0.3 });
    }

    #[test]
    fn callback_halt() {
        let mut clock = TickClock::new(5.0);
        clock.start(0.0, 0.0);

        let mut ticks = 0;
        clock.process(1.0, |_| {
            ticks += 1;
            ticks < 2
        });
        assert_eq!(ticks, 2);
        assert!(!clock.is_started());
    }
}
