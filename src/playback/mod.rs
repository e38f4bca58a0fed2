//! Real-time playback of an event list through a sequencer.
//!
//! A `Song` owns everything a playback needs and spawns one playback thread
//! per `start`. The thread runs the engine loop, multiplexing transport
//! commands from the control channel with the sequencer's input and output
//! readiness. The only state shared with the controller is the atomic
//! playback state.

pub mod channel;
mod engine;
mod song;

pub use channel::{ChannelError, Command};
pub use song::Song;

use std::sync::atomic::{AtomicU8, Ordering};

/// Represents the current playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PlaybackState {
    /// No playback thread is in its main loop.
    Stopped = 0,
    /// A playback thread was requested and is initializing.
    Starting = 1,
    /// Events are being scheduled.
    Playing = 2,
    /// Muted with the queue transport stopped.
    Paused = 3,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Starting,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Playback state readable from any thread.
///
/// Written by the playback thread, except for the single `Starting` write
/// the controller makes right before spawning it.
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Stopped as u8),
        }
    }

    pub(crate) fn get(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        let shared = SharedState::new();
        assert_eq!(shared.get(), PlaybackState::Stopped);

        for state in [
            PlaybackState::Starting,
            PlaybackState::Playing,
            PlaybackState::Paused,
            PlaybackState::Stopped,
        ] {
            shared.set(state);
            assert_eq!(shared.get(), state);
        }
    }

    #[test]
    fn test_active_ordering() {
        assert!(PlaybackState::Starting > PlaybackState::Stopped);
        assert!(PlaybackState::Paused > PlaybackState::Stopped);
    }
}
