//! midiplay - Real-time MIDI file playback through a tick-clocked sequencer.
//!
//! This library provides the playback core: the event list and its parser,
//! the sequencer adapter (with a software sequencer and a recording double),
//! the playback engine and the `Song` handle that drives it.

pub mod config;
pub mod error;
pub mod midi;
pub mod playback;
pub mod sequencer;

// Re-export commonly used types
pub use config::PlayerConfig;
pub use error::MidiError;
pub use midi::{EventList, TimedEvent};
pub use playback::{PlaybackState, Song};
pub use sequencer::{Sequencer, SoftSequencer};
