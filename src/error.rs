//! Error types for loading and controlling songs.

use crate::midi::MidiImportError;
use crate::playback::{ChannelError, Command};
use crate::sequencer::SequencerError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the playback library.
#[derive(Debug, Error)]
pub enum MidiError {
    /// Memory for the song could not be reserved.
    #[error("Out of memory")]
    OutOfMemory,

    /// The MIDI data could not be turned into an event list.
    #[error("Failed to create MIDI event list: {0}")]
    Import(MidiImportError),

    /// The sequencer could not be opened or configured.
    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// The playback thread could not be created.
    #[error("Failed to spawn playback thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A transport command could not reach the playback thread.
    #[error("Failed to send {0:?} to playback thread: {1}")]
    Control(Command, #[source] ChannelError),

    /// The playback thread died without handing back its resources.
    #[error("Playback thread panicked")]
    PlaybackPanicked,

    /// The song's sequencer was lost with a panicked playback thread.
    #[error("Sequencer is no longer available")]
    SequencerLost,

    /// A configuration file could not be read or parsed.
    #[error("Failed to load config {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl From<MidiImportError> for MidiError {
    fn from(e: MidiImportError) -> Self {
        match e {
            MidiImportError::OutOfMemory => MidiError::OutOfMemory,
            other => MidiError::Import(other),
        }
    }
}
