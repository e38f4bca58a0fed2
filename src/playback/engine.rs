//! The playback thread: event scheduling and the transport state machine.
//!
//! The engine never looks at the wall clock. Every event is scheduled on a
//! sequencer queue at its own tick, and an echo scheduled one tick after the
//! last event tells the engine when the queue's clock has reached the end.

use super::channel::{ChannelError, Command, Endpoint};
use super::{PlaybackState, SharedState};
use crate::midi::{
    master_volume_sysex, Cursor, EventList, TimedEvent, CMD_BENDER, CMD_CONTROL, CMD_NOTE_OFF,
    CMD_NOTE_ON, CMD_NOTE_PRESSURE, CMD_PGM_CHANGE, CTL_ALL_NOTES_OFF, CTL_ALL_SOUNDS_OFF,
    CTL_RESET_CONTROLLERS, CTL_SUSTAIN, DEFAULT_TEMPO_US, MAX_DATA, META_EVENT, META_TEMPO,
    MIDI_CHANNELS,
};
use crate::sequencer::{
    Address, Drain, Output, PollDescriptors, QueueId, SeqEvent, SeqEventKind, Sequencer,
    SequencerError, Tick,
};
use crossbeam_channel::{Select, TryRecvError};
use std::cmp::Ordering;
use std::sync::Arc;

/// Controllers reset on every channel at shutdown, in order.
pub(crate) const PANIC_CONTROLLERS: [u8; 4] = [
    CTL_SUSTAIN,
    CTL_ALL_NOTES_OFF,
    CTL_RESET_CONTROLLERS,
    CTL_ALL_SOUNDS_OFF,
];

/// What the engine hands back to its song when the thread ends.
pub(crate) struct EngineResources {
    pub seq: Box<dyn Sequencer>,
    pub endpoint: Endpoint,
    /// Why the run never got to play, if it didn't.
    pub init_error: Option<SequencerError>,
}

/// Readiness reported by one wake of the multiplexed wait.
#[derive(Debug, Clone, Copy, Default)]
struct Revents {
    command: bool,
    input: bool,
    output: bool,
}

impl Revents {
    fn any(&self) -> bool {
        self.command || self.input || self.output
    }
}

/// Loop-local transport state.
#[derive(Debug)]
struct Transport {
    cursor: Cursor,
    finished: bool,
    volume: u8,
    paused: bool,
    want_output: bool,
}

/// One playback run over an event list.
pub(crate) struct PlaybackEngine {
    seq: Box<dyn Sequencer>,
    endpoint: Endpoint,
    events: Arc<EventList>,
    state: Arc<SharedState>,
    dest: Address,
    ppqn: u16,
    end_tick: Tick,
    loops: i32,
}

/// Translates a timed event into a sequencer payload.
///
/// Returns None for events the sequencer cannot play (non-tempo meta
/// events, SysEx, channel pressure, malformed tempo).
pub(crate) fn translate(event: &TimedEvent, queue: QueueId) -> Option<SeqEventKind> {
    let channel = event.channel();
    let [d0, d1] = event.data;

    let kind = match event.command() {
        CMD_NOTE_ON => SeqEventKind::NoteOn {
            channel,
            note: d0,
            velocity: d1,
        },
        CMD_NOTE_OFF => SeqEventKind::NoteOff {
            channel,
            note: d0,
            velocity: d1,
        },
        CMD_CONTROL => SeqEventKind::Controller {
            channel,
            param: d0,
            value: d1,
        },
        CMD_NOTE_PRESSURE => SeqEventKind::KeyPressure {
            channel,
            note: d0,
            velocity: d1,
        },
        CMD_PGM_CHANGE => SeqEventKind::ProgramChange {
            channel,
            program: d0,
        },
        CMD_BENDER => SeqEventKind::PitchBend {
            channel,
            value: ((((d1 as i32) << 7) | (d0 as i32 & 0x7F)) - 8192) as i16,
        },
        _ if event.status == META_EVENT && d0 == META_TEMPO && event.extra.len() == 3 => {
            let t = &event.extra;
            SeqEventKind::Tempo {
                queue,
                micros_per_quarter: (t[0] as u32) << 16 | (t[1] as u32) << 8 | t[2] as u32,
            }
        }
        _ => return None,
    };
    Some(kind)
}

impl PlaybackEngine {
    pub(crate) fn new(
        seq: Box<dyn Sequencer>,
        endpoint: Endpoint,
        events: Arc<EventList>,
        state: Arc<SharedState>,
        dest: Address,
        ppqn: u16,
        loops: i32,
    ) -> Self {
        let end_tick = events.end_tick();
        Self {
            seq,
            endpoint,
            events,
            state,
            dest,
            ppqn,
            end_tick,
            loops,
        }
    }

    /// Runs playback to completion and returns the borrowed resources.
    ///
    /// The state is `Stopped` when this returns, whatever ended the run.
    pub(crate) fn run(mut self) -> EngineResources {
        let mut init_error = None;
        match self.init() {
            Ok(queue) => {
                self.play(queue);
                self.shutdown(queue);
            }
            Err(e) => {
                tracing::error!("Playback initialization failed: {}", e);
                self.state.set(PlaybackState::Stopped);
                init_error = Some(e);
            }
        }
        tracing::debug!("Playback thread returns");
        EngineResources {
            seq: self.seq,
            endpoint: self.endpoint,
            init_error,
        }
    }

    fn init(&mut self) -> Result<QueueId, SequencerError> {
        let queue = self.seq.alloc_queue()?;
        if let Err(e) = self.prepare_queue(queue) {
            let _ = self.seq.free_queue(queue);
            return Err(e);
        }
        self.state.set(PlaybackState::Playing);
        Ok(queue)
    }

    /// The tick right after the last event. `EventList` keeps the last
    /// event at or below `MAX_TICK`, so this cannot overflow.
    fn echo_tick(&self) -> Tick {
        self.end_tick + 1
    }

    fn prepare_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        self.seq.start_queue(queue)?;
        self.seq.set_nonblocking(true);
        self.seq.set_queue_tempo(queue, DEFAULT_TEMPO_US, self.ppqn)?;
        // The only end-of-playback signal
        self.seq.enqueue_echo(queue, self.echo_tick())
    }

    fn play(&mut self, queue: QueueId) {
        let fds = self.seq.poll_descriptors();
        let events = Arc::clone(&self.events);
        let mut t = Transport {
            cursor: Cursor::new(),
            finished: false,
            volume: MAX_DATA,
            paused: false,
            want_output: true,
        };

        loop {
            tracing::trace!("Poll...");
            let Some(revents) = self.wait(&fds, t.want_output) else {
                tracing::error!("Sequencer wait set hung up");
                break;
            };
            tracing::trace!("revents: {:?}", revents);

            if revents.command {
                self.read_command(queue, &mut t);
            }

            if revents.input {
                if let Some(ev) = self.seq.event_input() {
                    // Only our own echo marks the end
                    if ev.kind == SeqEventKind::Echo && ev.source == self.seq.source() {
                        t.finished = true;
                    }
                }
            }

            if t.cursor.is_exhausted(&events) {
                if t.finished {
                    if self.loops == 0 {
                        break;
                    }
                    tracing::debug!("Playback is looping");
                    t.cursor.rewind();

                    // Ticks restart from zero on every repeat
                    let rearm = self
                        .seq
                        .reset_queue_position(queue)
                        .and_then(|_| self.seq.enqueue_echo(queue, self.echo_tick()));
                    if let Err(e) = rearm {
                        tracing::error!("Cannot restart queue for looping: {}", e);
                        break;
                    }

                    match self.loops.cmp(&0) {
                        Ordering::Greater => self.loops -= 1,
                        // Negative repeats forever; zero already stopped above
                        Ordering::Less | Ordering::Equal => {}
                    }

                    t.finished = false;
                    t.want_output = true;
                } else {
                    // Keep draining or the echo never comes back
                    tracing::trace!("Draining output");
                    match self.seq.drain_output() {
                        Ok(Drain::Done) => t.want_output = false,
                        Ok(Drain::Pending) => {}
                        Err(e) => {
                            tracing::error!("Draining output failed: {}", e);
                            break;
                        }
                    }
                    continue;
                }
            }

            if !revents.output {
                continue;
            }

            let Some(event) = t.cursor.current(&events) else {
                continue;
            };

            let Some(kind) = translate(event, queue) else {
                tracing::debug!(
                    "Unhandled {}: {:x} {:x} {:x} (extraLen {})",
                    event.tick,
                    event.status,
                    event.data[0],
                    event.data[1],
                    event.extra.len()
                );
                t.cursor.advance();
                continue;
            };

            let dest = match kind {
                SeqEventKind::Tempo { .. } => Address::SYSTEM_TIMER,
                _ => self.dest,
            };
            let out = SeqEvent::new(kind, self.seq.source(), dest).at(queue, event.tick);

            match self.seq.event_output(&out) {
                Ok(Output::Busy) => {}
                Ok(Output::Queued) => {
                    tracing::debug!(
                        "Event {}: {:x} {:x} {:x} (extraLen {})",
                        event.tick,
                        event.status,
                        event.data[0],
                        event.data[1],
                        event.extra.len()
                    );
                    t.cursor.advance();
                }
                Err(e) => {
                    tracing::warn!("Dropping event at {}: {}", event.tick, e);
                    t.cursor.advance();
                }
            }
        }
    }

    /// Consumes exactly one command frame and applies it.
    fn read_command(&mut self, queue: QueueId, t: &mut Transport) {
        let command = match self.endpoint.try_receive() {
            Ok(Some(frame)) => match Command::decode(frame) {
                Ok(command) => command,
                Err(e) => {
                    tracing::warn!("Dropping control frame {:?}: {}", frame, e);
                    return;
                }
            },
            Ok(None) => return,
            Err(ChannelError::Closed) => {
                tracing::warn!("Controller hung up, stopping playback");
                Command::Quit
            }
            Err(e) => {
                tracing::warn!("Control channel error: {}", e);
                return;
            }
        };
        tracing::debug!("Got control {:?}", command);

        match command {
            Command::Quit => {
                t.cursor.exhaust();
                self.loops = 0;
                t.finished = true;
            }
            Command::SetVolume(volume) => {
                t.volume = volume;
                // Stay muted until resumed
                if !t.paused {
                    self.send_volume(volume);
                }
            }
            Command::Pause => {
                self.send_volume(0);
                if let Err(e) = self.seq.stop_queue(queue) {
                    tracing::warn!("Cannot stop queue: {}", e);
                }
                t.paused = true;
                self.state.set(PlaybackState::Paused);
            }
            Command::Resume => {
                if let Err(e) = self.seq.continue_queue(queue) {
                    tracing::warn!("Cannot continue queue: {}", e);
                }
                self.send_volume(t.volume);
                t.paused = false;
                self.state.set(PlaybackState::Playing);
            }
        }
    }

    /// Blocks until a command, sequencer input or (if wanted) output space
    /// is available. Returns None if the sequencer's wait set hung up.
    fn wait(&self, fds: &PollDescriptors, want_output: bool) -> Option<Revents> {
        let commands = self.endpoint.receiver();
        loop {
            let revents = Revents {
                command: !commands.is_empty(),
                input: self.seq.input_pending(),
                output: want_output && self.seq.output_ready(),
            };
            if revents.any() {
                return Some(revents);
            }

            let mut sel = Select::new();
            let cmd_index = sel.recv(commands);
            let input_index = sel.recv(&fds.input);
            let output_index = want_output.then(|| sel.recv(&fds.output));
            let index = sel.ready();

            if index == cmd_index {
                if commands.is_empty() {
                    // Ready and empty means the controller is gone
                    return Some(Revents {
                        command: true,
                        ..Revents::default()
                    });
                }
            } else if index == input_index {
                if let Err(TryRecvError::Disconnected) = fds.input.try_recv() {
                    return None;
                }
            } else if Some(index) == output_index {
                if let Err(TryRecvError::Disconnected) = fds.output.try_recv() {
                    return None;
                }
            }
        }
    }

    fn send_volume(&mut self, volume: u8) {
        let sysex = SeqEventKind::SysEx(master_volume_sysex(volume).to_vec());
        let ev = SeqEvent::new(sysex, self.seq.source(), self.dest);
        if let Err(e) = self.seq.event_output_direct(&ev) {
            tracing::warn!("Cannot send volume: {}", e);
        }
    }

    fn shutdown(&mut self, queue: QueueId) {
        self.state.set(PlaybackState::Stopped);

        // Back to blocking mode and drop everything
        self.seq.set_nonblocking(false);
        self.seq.drop_output();
        if let Err(e) = self.seq.stop_queue(queue) {
            tracing::warn!("Cannot stop queue: {}", e);
        }
        if let Err(e) = self.seq.drain_output() {
            tracing::warn!("Cannot drain output: {}", e);
        }
        if let Err(e) = self.seq.free_queue(queue) {
            tracing::warn!("Cannot free queue: {}", e);
        }

        // Some of these are bound to work
        let source = self.seq.source();
        for channel in 0..MIDI_CHANNELS {
            for param in PANIC_CONTROLLERS {
                let kind = SeqEventKind::Controller {
                    channel,
                    param,
                    value: 0,
                };
                if let Err(e) = self
                    .seq
                    .event_output_direct(&SeqEvent::new(kind, source, self.dest))
                {
                    tracing::debug!("Panic message on channel {} failed: {}", channel, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{CMD_CHANNEL_PRESSURE, MAX_TICK, META_TEXT, SYSEX};
    use crate::playback::channel::{self, Command};
    use crate::sequencer::{Record, RecordingLog, RecordingSequencer};

    const Q: QueueId = QueueId(0);

    fn two_notes() -> Arc<EventList> {
        Arc::new(
            EventList::from_events(vec![
                TimedEvent::new(0, CMD_NOTE_ON, 60, 100),
                TimedEvent::new(480, CMD_NOTE_OFF, 60, 0),
            ])
            .unwrap(),
        )
    }

    struct Harness {
        engine: PlaybackEngine,
        controller: Endpoint,
        log: RecordingLog,
        state: Arc<SharedState>,
    }

    fn harness(events: Arc<EventList>, loops: i32) -> Harness {
        let (seq, log) = RecordingSequencer::new();
        let (controller, endpoint) = channel::pair();
        let state = Arc::new(SharedState::new());
        state.set(PlaybackState::Starting);
        let engine = PlaybackEngine::new(
            Box::new(seq),
            endpoint,
            events,
            Arc::clone(&state),
            Address::SUBSCRIBERS,
            480,
            loops,
        );
        Harness {
            engine,
            controller,
            log,
            state,
        }
    }

    fn note_ticks(log: &RecordingLog) -> Vec<(Tick, SeqEventKind)> {
        log.queued()
            .into_iter()
            .filter(|(_, k)| {
                matches!(
                    k,
                    SeqEventKind::NoteOn { .. } | SeqEventKind::NoteOff { .. }
                )
            })
            .collect()
    }

    fn panic_sequence() -> Vec<SeqEventKind> {
        (0..MIDI_CHANNELS)
            .flat_map(|channel| {
                PANIC_CONTROLLERS.map(|param| SeqEventKind::Controller {
                    channel,
                    param,
                    value: 0,
                })
            })
            .collect()
    }

    #[test]
    fn test_translate_channel_messages() {
        let on = TimedEvent::new(0, CMD_NOTE_ON | 5, 64, 90);
        assert_eq!(
            translate(&on, Q),
            Some(SeqEventKind::NoteOn {
                channel: 5,
                note: 64,
                velocity: 90
            })
        );

        let pgm = TimedEvent::new(0, CMD_PGM_CHANGE | 9, 33, 0);
        assert_eq!(
            translate(&pgm, Q),
            Some(SeqEventKind::ProgramChange {
                channel: 9,
                program: 33
            })
        );

        let center = TimedEvent::new(0, CMD_BENDER, 0x00, 0x40);
        assert_eq!(
            translate(&center, Q),
            Some(SeqEventKind::PitchBend {
                channel: 0,
                value: 0
            })
        );
        let top = TimedEvent::new(0, CMD_BENDER, 0x7F, 0x7F);
        assert_eq!(
            translate(&top, Q),
            Some(SeqEventKind::PitchBend {
                channel: 0,
                value: 8191
            })
        );
    }

    #[test]
    fn test_translate_tempo() {
        let tempo = TimedEvent::tempo(0, 600_000);
        assert_eq!(
            translate(&tempo, Q),
            Some(SeqEventKind::Tempo {
                queue: Q,
                micros_per_quarter: 600_000
            })
        );

        // A tempo payload must be exactly three bytes
        let short = TimedEvent::meta(0, META_TEMPO, vec![0x07, 0xA1]);
        assert_eq!(translate(&short, Q), None);
        let long = TimedEvent::meta(0, META_TEMPO, vec![0, 0x07, 0xA1, 0x20]);
        assert_eq!(translate(&long, Q), None);
    }

    #[test]
    fn test_translate_unhandled() {
        assert_eq!(translate(&TimedEvent::meta(0, META_TEXT, b"hi".to_vec()), Q), None);
        assert_eq!(translate(&TimedEvent::new(0, CMD_CHANNEL_PRESSURE, 10, 0), Q), None);
        assert_eq!(translate(&TimedEvent::new(0, SYSEX, 0, 0), Q), None);
    }

    #[test]
    fn test_play_once() {
        let h = harness(two_notes(), 0);
        let Harness {
            engine,
            controller: _controller,
            log,
            state,
        } = h;

        engine.run();

        assert_eq!(state.get(), PlaybackState::Stopped);
        let queued = log.queued();
        assert_eq!(queued[0], (481, SeqEventKind::Echo));
        assert_eq!(
            note_ticks(&log),
            vec![
                (
                    0,
                    SeqEventKind::NoteOn {
                        channel: 0,
                        note: 60,
                        velocity: 100
                    }
                ),
                (
                    480,
                    SeqEventKind::NoteOff {
                        channel: 0,
                        note: 60,
                        velocity: 0
                    }
                ),
            ]
        );
        assert_eq!(log.direct(), panic_sequence());
    }

    #[test]
    fn test_end_marker_after_latest_tick() {
        let events = EventList::from_events(vec![
            TimedEvent::new(0, CMD_NOTE_ON, 60, 100),
            TimedEvent::new(MAX_TICK, CMD_NOTE_OFF, 60, 0),
        ])
        .unwrap();
        let Harness {
            engine,
            controller: _controller,
            log,
            state,
        } = harness(Arc::new(events), 0);

        engine.run();

        assert_eq!(state.get(), PlaybackState::Stopped);
        assert_eq!(log.queued()[0], (u32::MAX, SeqEventKind::Echo));
        assert_eq!(note_ticks(&log).last().map(|(tick, _)| *tick), Some(MAX_TICK));
        assert_eq!(log.direct(), panic_sequence());
    }

    #[test]
    fn test_init_failure_returns_error() {
        let h = harness(two_notes(), 0);
        h.log.refuse_queues();
        let log = h.log.clone();
        let state = Arc::clone(&h.state);

        let resources = h.engine.run();

        assert_eq!(state.get(), PlaybackState::Stopped);
        assert!(matches!(resources.init_error, Some(SequencerError::Open(_))));
        assert!(log.queued().is_empty());
        assert!(log.direct().is_empty());
    }

    #[test]
    fn test_queue_lifecycle_order() {
        let h = harness(two_notes(), 0);
        let log = h.log.clone();
        h.engine.run();

        let ops: Vec<Record> = log
            .records()
            .into_iter()
            .filter(|r| !matches!(r, Record::Queued { .. } | Record::Direct { .. }))
            .collect();
        assert_eq!(
            ops,
            vec![
                Record::AllocQueue(Q),
                Record::StartQueue,
                Record::QueueTempo {
                    micros_per_quarter: DEFAULT_TEMPO_US,
                    ppqn: 480
                },
                Record::DropOutput { dropped: 0 },
                Record::StopQueue,
                Record::FreeQueue,
            ]
        );

        // The panic burst comes after the queue is gone
        let records = log.records();
        let free = records.iter().position(|r| *r == Record::FreeQueue).unwrap();
        assert!(records[free + 1..]
            .iter()
            .all(|r| matches!(r, Record::Direct { .. })));
    }

    #[test]
    fn test_loop_count_repeats() {
        let h = harness(two_notes(), 2);
        let log = h.log.clone();
        h.engine.run();

        let notes = note_ticks(&log);
        assert_eq!(notes.len(), 6);
        // Every repeat starts again at the same ticks
        let ticks: Vec<Tick> = notes.iter().map(|(t, _)| *t).collect();
        assert_eq!(ticks, vec![0, 480, 0, 480, 0, 480]);

        let resets = log
            .queued()
            .into_iter()
            .filter(|(tick, k)| {
                *tick == 0 && matches!(k, SeqEventKind::QueuePosition { tick: 0, .. })
            })
            .count();
        assert_eq!(resets, 2);

        let echoes = log
            .queued()
            .into_iter()
            .filter(|(tick, k)| *tick == 481 && *k == SeqEventKind::Echo)
            .count();
        assert_eq!(echoes, 3);
    }

    #[test]
    fn test_quit_before_playback() {
        let h = harness(two_notes(), -1);
        h.controller.send(Command::Quit).unwrap();
        let log = h.log.clone();
        let state = Arc::clone(&h.state);

        h.engine.run();

        assert_eq!(state.get(), PlaybackState::Stopped);
        assert!(note_ticks(&log).is_empty());
        assert_eq!(log.direct(), panic_sequence());
    }

    #[test]
    fn test_infinite_loop_runs_until_quit() {
        let h = harness(two_notes(), -1);
        let log = h.log.clone();
        let state = Arc::clone(&h.state);
        let controller = h.controller;
        let engine = h.engine;

        let handle = std::thread::spawn(move || engine.run());

        // Wait for several repeats without ever stopping on its own
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while note_ticks(&log).len() < 20 {
            assert!(std::time::Instant::now() < deadline, "playback stalled");
            assert_ne!(state.get(), PlaybackState::Stopped);
            std::thread::yield_now();
        }

        controller.send(Command::Quit).unwrap();
        handle.join().unwrap();

        assert_eq!(state.get(), PlaybackState::Stopped);
        let direct = log.direct();
        assert_eq!(direct[direct.len() - 64..], panic_sequence()[..]);
    }

    #[test]
    fn test_busy_output_retried_without_duplicates() {
        let events: Vec<TimedEvent> = (0..50)
            .map(|i| TimedEvent::new(i * 10, CMD_NOTE_ON, 60, 100))
            .collect();
        let h = harness(Arc::new(EventList::from_events(events).unwrap()), 0);
        h.log.set_output_capacity(3);
        let log = h.log.clone();

        h.engine.run();

        let ticks: Vec<Tick> = note_ticks(&log).iter().map(|(t, _)| *t).collect();
        let expected: Vec<Tick> = (0..50).map(|i| i * 10).collect();
        assert_eq!(ticks, expected);
    }

    #[test]
    fn test_tempo_event_reaches_queue() {
        let events = vec![
            TimedEvent::tempo(0, 250_000),
            TimedEvent::meta(0, META_TEMPO, vec![0x01]),
            TimedEvent::new(96, CMD_NOTE_ON, 60, 100),
        ];
        let h = harness(Arc::new(EventList::from_events(events).unwrap()), 0);
        let log = h.log.clone();
        h.engine.run();

        let tempos: Vec<(Tick, SeqEventKind)> = log
            .queued()
            .into_iter()
            .filter(|(_, k)| matches!(k, SeqEventKind::Tempo { .. }))
            .collect();
        assert_eq!(
            tempos,
            vec![(
                0,
                SeqEventKind::Tempo {
                    queue: Q,
                    micros_per_quarter: 250_000
                }
            )]
        );
        assert_eq!(note_ticks(&log).len(), 1);
    }

    #[test]
    fn test_volume_commands() {
        let h = harness(two_notes(), 0);
        // Queued before the run, applied in order on the first wakes
        h.controller.send(Command::SetVolume(100)).unwrap();
        h.controller.send(Command::Pause).unwrap();
        h.controller.send(Command::SetVolume(50)).unwrap();
        h.controller.send(Command::Resume).unwrap();
        let log = h.log.clone();

        h.engine.run();

        let volumes: Vec<u8> = log
            .direct()
            .into_iter()
            .filter_map(|k| match k {
                SeqEventKind::SysEx(data) => Some(data[6]),
                _ => None,
            })
            .collect();
        // Muted on pause, the level set while paused is applied on resume
        assert_eq!(volumes, vec![100, 0, 50]);

        let records = log.records();
        assert!(records.contains(&Record::ContinueQueue));
        let stops = records.iter().filter(|r| **r == Record::StopQueue).count();
        assert_eq!(stops, 2);
    }

    #[test]
    fn test_unknown_frame_dropped() {
        let h = harness(two_notes(), 0);
        h.controller.send_frame([0x7E, 0]).unwrap();
        let log = h.log.clone();
        h.engine.run();
        assert_eq!(note_ticks(&log).len(), 2);
    }
}
