//! Sequencer endpoint adapter.
//!
//! The playback engine talks to a sequencing service through the
//! `Sequencer` trait: a client with one duplex port, tick-clocked queues,
//! a non-blocking output buffer and an input side used for echo
//! notifications. Implementations:
//! - `SoftSequencer`: a software sequencing service with a clock thread
//!   that delivers events to `MidiSink`s (synthesizer or MIDI ports)
//! - `RecordingSequencer`: a headless double that records what it is given

pub mod destination;
pub mod recording;
pub mod sink;
pub mod soft;

pub use destination::{resolve_destination, Capability, Destination, PortInfo, PortType};
pub use recording::{Record, RecordingLog, RecordingSequencer};
pub use sink::{MidiSink, MidirSink, SinkError, SinkInfo, SynthSink};
pub use soft::SoftSequencer;

use crate::midi::{
    CMD_BENDER, CMD_CONTROL, CMD_NOTE_OFF, CMD_NOTE_ON, CMD_NOTE_PRESSURE, CMD_PGM_CHANGE,
};
use crossbeam_channel::Receiver;
use std::fmt;
use thiserror::Error;

/// Queue time in ticks.
pub type Tick = u32;

/// A client:port pair identifying a sequencer port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub client: u8,
    pub port: u8,
}

impl Address {
    /// Broadcast to every port subscribed to the source port.
    pub const SUBSCRIBERS: Address = Address {
        client: 254,
        port: 253,
    };

    /// The system timer port, target of queue control events.
    pub const SYSTEM_TIMER: Address = Address { client: 0, port: 0 };

    pub const fn new(client: u8, port: u8) -> Self {
        Self { client, port }
    }

    /// Parses a numeric address: `client:port`, `client.port` or `client`.
    ///
    /// Name lookups need the port catalog and are done by
    /// `Sequencer::parse_address`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (client, port) = match s.split_once([':', '.']) {
            Some((c, p)) => (c.trim(), p.trim()),
            None => (s, "0"),
        };
        Some(Self {
            client: client.parse().ok()?,
            port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.port)
    }
}

/// Identifier of an allocated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u8);

/// When an event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Bypass the queue and deliver immediately.
    Direct,
    /// Deliver when the queue's clock reaches `tick`.
    Tick { queue: QueueId, tick: Tick },
}

/// Sequencer event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqEventKind {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    KeyPressure { channel: u8, note: u8, velocity: u8 },
    Controller { channel: u8, param: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Signed bend, centered on zero (-8192..=8191).
    PitchBend { channel: u8, value: i16 },
    /// A complete SysEx message including the 0xF0/0xF7 framing.
    SysEx(Vec<u8>),
    /// Change a queue's tempo (microseconds per quarter note).
    Tempo { queue: QueueId, micros_per_quarter: u32 },
    /// Move a queue's position.
    QueuePosition { queue: QueueId, tick: Tick },
    /// Marker delivered back to its destination client.
    Echo,
}

impl SeqEventKind {
    /// Raw MIDI bytes for events that reach a MIDI device.
    ///
    /// Queue control and echo events have no wire form and return None.
    pub fn to_midi_bytes(&self) -> Option<Vec<u8>> {
        let bytes = match *self {
            SeqEventKind::NoteOn {
                channel,
                note,
                velocity,
            } => vec![CMD_NOTE_ON | channel, note, velocity],
            SeqEventKind::NoteOff {
                channel,
                note,
                velocity,
            } => vec![CMD_NOTE_OFF | channel, note, velocity],
            SeqEventKind::KeyPressure {
                channel,
                note,
                velocity,
            } => vec![CMD_NOTE_PRESSURE | channel, note, velocity],
            SeqEventKind::Controller {
                channel,
                param,
                value,
            } => vec![CMD_CONTROL | channel, param, value],
            SeqEventKind::ProgramChange { channel, program } => {
                vec![CMD_PGM_CHANGE | channel, program]
            }
            SeqEventKind::PitchBend { channel, value } => {
                let raw = (value as i32 + 8192).clamp(0, 0x3FFF) as u16;
                vec![CMD_BENDER | channel, (raw & 0x7F) as u8, (raw >> 7) as u8]
            }
            SeqEventKind::SysEx(ref data) => data.clone(),
            SeqEventKind::Tempo { .. } | SeqEventKind::QueuePosition { .. } | SeqEventKind::Echo => {
                return None
            }
        };
        Some(bytes)
    }
}

/// An event travelling through the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqEvent {
    pub kind: SeqEventKind,
    pub source: Address,
    pub dest: Address,
    pub schedule: Schedule,
}

impl SeqEvent {
    /// Creates a direct (unscheduled) event.
    pub fn new(kind: SeqEventKind, source: Address, dest: Address) -> Self {
        Self {
            kind,
            source,
            dest,
            schedule: Schedule::Direct,
        }
    }

    /// Schedules the event on a queue at an absolute tick.
    pub fn at(mut self, queue: QueueId, tick: Tick) -> Self {
        self.schedule = Schedule::Tick { queue, tick };
        self
    }
}

/// Result of a non-blocking output attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// The event was accepted.
    Queued,
    /// No room right now; retry the same event later.
    Busy,
}

/// Result of draining the output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    Done,
    Pending,
}

/// Wake-up sources a sequencer contributes to the engine's wait set.
///
/// Each receiver is a doorbell: a unit value arrives when input becomes
/// available or output space is freed. Readiness itself is checked with
/// `Sequencer::input_pending` and `Sequencer::output_ready`.
#[derive(Debug, Clone)]
pub struct PollDescriptors {
    pub input: Receiver<()>,
    pub output: Receiver<()>,
}

/// Errors reported by a sequencer implementation.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("sequencer open failed: {0}")]
    Open(String),
    #[error("sequencer port creation failed: {0}")]
    PortCreate(String),
    #[error("no such queue {0:?}")]
    NoSuchQueue(QueueId),
    #[error("cannot connect to {0}: {1}")]
    Connect(Address, String),
    #[error("sequencer service has shut down")]
    Closed,
}

/// A sequencing service client with one duplex port.
pub trait Sequencer: Send {
    /// Address of this client's own port.
    fn source(&self) -> Address;

    /// Every port known to the service, in ascending client then port order.
    fn ports(&self) -> Vec<PortInfo>;

    /// Subscribes `dest` to this client's port.
    fn connect_to(&mut self, dest: Address) -> Result<(), SequencerError>;

    /// Allocates a new stopped queue.
    fn alloc_queue(&mut self) -> Result<QueueId, SequencerError>;

    /// Sets tempo (microseconds per quarter note) and resolution of a queue.
    fn set_queue_tempo(
        &mut self,
        queue: QueueId,
        micros_per_quarter: u32,
        ppqn: u16,
    ) -> Result<(), SequencerError>;

    /// Starts a queue from tick zero.
    fn start_queue(&mut self, queue: QueueId) -> Result<(), SequencerError>;

    /// Stops a queue's clock, keeping its position.
    fn stop_queue(&mut self, queue: QueueId) -> Result<(), SequencerError>;

    /// Restarts a stopped queue's clock from its current position.
    fn continue_queue(&mut self, queue: QueueId) -> Result<(), SequencerError>;

    /// Releases a queue and discards its pending events.
    fn free_queue(&mut self, queue: QueueId) -> Result<(), SequencerError>;

    /// Buffers an event for delivery. Never blocks in non-blocking mode.
    fn event_output(&mut self, event: &SeqEvent) -> Result<Output, SequencerError>;

    /// Delivers an event immediately, bypassing the buffer and queues.
    fn event_output_direct(&mut self, event: &SeqEvent) -> Result<(), SequencerError>;

    /// Pushes buffered events to the service.
    fn drain_output(&mut self) -> Result<Drain, SequencerError>;

    /// Discards buffered events that were not yet pushed.
    fn drop_output(&mut self);

    fn set_nonblocking(&mut self, nonblocking: bool);

    fn poll_descriptors(&self) -> PollDescriptors;

    /// True when `event_output` can accept an event.
    fn output_ready(&self) -> bool;

    /// True when `event_input` has an event to return.
    fn input_pending(&self) -> bool;

    /// Reads one incoming event, if any.
    fn event_input(&mut self) -> Option<SeqEvent>;

    /// Resolves an address string, also accepting a client name prefix.
    fn parse_address(&self, s: &str) -> Option<Address> {
        if let Some(addr) = Address::parse(s) {
            return Some(addr);
        }
        let (name, port) = match s.rsplit_once(':') {
            Some((name, port)) => (name, port.trim().parse().ok()?),
            None => (s, 0),
        };
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.ports()
            .into_iter()
            .find(|p| p.client_name.starts_with(name) && p.addr.port == port)
            .map(|p| p.addr)
    }

    /// Outputs an event, spinning while the service reports busy.
    fn output_retrying(&mut self, event: &SeqEvent) -> Result<(), SequencerError> {
        loop {
            match self.event_output(event)? {
                Output::Queued => return Ok(()),
                Output::Busy => std::hint::spin_loop(),
            }
        }
    }

    /// Rewinds a queue to tick zero.
    ///
    /// The position event is scheduled at tick zero, which is already in the
    /// past, so it takes effect before anything scheduled after it.
    fn reset_queue_position(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        let event = SeqEvent::new(
            SeqEventKind::QueuePosition { queue, tick: 0 },
            self.source(),
            Address::SYSTEM_TIMER,
        )
        .at(queue, 0);
        self.output_retrying(&event)
    }

    /// Schedules an echo back to this client's own port.
    fn enqueue_echo(&mut self, queue: QueueId, tick: Tick) -> Result<(), SequencerError> {
        let source = self.source();
        let event = SeqEvent::new(SeqEventKind::Echo, source, source).at(queue, tick);
        self.output_retrying(&event)
    }
}
