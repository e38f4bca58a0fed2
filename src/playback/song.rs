//! Song handle: owns a loaded event list and drives its playback thread.

use super::channel::{self, Command, Endpoint};
use super::engine::{EngineResources, PlaybackEngine};
use super::{PlaybackState, SharedState};
use crate::config::PlayerConfig;
use crate::error::MidiError;
use crate::midi::{self, EventList, MAX_DATA};
use crate::sequencer::{resolve_destination, Destination, Sequencer, Tick};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A loaded song ready to be played.
///
/// Each `start` spawns one playback thread. While it runs, the thread owns the
/// sequencer and the engine side of the control channel; they come back to
/// the song when the thread is joined by `stop` or the next `start`.
pub struct Song {
    // Fields drop in declaration order: sequencer, channel, event list.
    /// Present whenever no playback thread holds them.
    idle: Option<EngineResources>,
    handle: Option<JoinHandle<EngineResources>>,
    controller: Endpoint,
    events: Arc<EventList>,
    ppqn: u16,
    end_tick: Tick,
    allow_pause: bool,
    destination: Destination,
    state: Arc<SharedState>,
    last_error: Option<String>,
}

impl Song {
    /// Parses Standard MIDI File bytes and prepares them for playback.
    ///
    /// # Arguments
    ///
    /// * `data` - The raw file contents
    /// * `config` - Destination and pause policy
    /// * `seq` - The sequencer the song will play through
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be parsed or memory runs out.
    /// The sequencer is dropped on failure.
    pub fn load(
        data: &[u8],
        config: &PlayerConfig,
        seq: Box<dyn Sequencer>,
    ) -> Result<Self, MidiError> {
        let (events, ppqn) = midi::parse(data)?;
        Self::from_event_list(events, ppqn, config, seq)
    }

    /// Reads and loads a Standard MIDI File from disk.
    pub fn load_file<P: AsRef<Path>>(
        path: P,
        config: &PlayerConfig,
        seq: Box<dyn Sequencer>,
    ) -> Result<Self, MidiError> {
        let (events, ppqn) = midi::parse_file(path)?;
        Self::from_event_list(events, ppqn, config, seq)
    }

    /// Prepares an already built event list for playback.
    pub fn from_event_list(
        events: EventList,
        ppqn: u16,
        config: &PlayerConfig,
        mut seq: Box<dyn Sequencer>,
    ) -> Result<Self, MidiError> {
        let (controller, endpoint) = channel::pair();

        let destination = resolve_destination(
            seq.as_mut(),
            config.output_ports.as_deref(),
            config.no_connect_ports,
        );
        let end_tick = events.end_tick();
        tracing::info!(
            "Loaded {} events, ppqn {}, end tick {}",
            events.len(),
            ppqn,
            end_tick
        );

        Ok(Self {
            events: Arc::new(events),
            ppqn,
            end_tick,
            allow_pause: config.allow_pause,
            destination,
            state: Arc::new(SharedState::new()),
            controller,
            idle: Some(EngineResources {
                seq,
                endpoint,
                init_error: None,
            }),
            handle: None,
            last_error: None,
        })
    }

    /// Starts playback from the beginning.
    ///
    /// A playback thread that is still running is told to quit and joined
    /// first. `loops` < 0 repeats forever, 0 plays once and N plays N more
    /// times after the first pass. Failures are reported via `last_error`.
    pub fn start(&mut self, loops: i32) {
        if let Err(e) = self.join_playback() {
            tracing::error!("Cannot start playback: {}", e);
            self.last_error = Some(e.to_string());
            return;
        }

        let Some(resources) = self.idle.take() else {
            self.last_error = Some(MidiError::SequencerLost.to_string());
            return;
        };

        let engine = PlaybackEngine::new(
            resources.seq,
            resources.endpoint,
            Arc::clone(&self.events),
            Arc::clone(&self.state),
            self.destination.address,
            self.ppqn,
            loops,
        );

        // Visible to the caller before the thread gets scheduled
        self.state.set(PlaybackState::Starting);
        let spawned = thread::Builder::new()
            .name("midiplay-playback".to_string())
            .spawn(move || engine.run());

        match spawned {
            Ok(handle) => {
                tracing::debug!("Playback thread started, loops {}", loops);
                self.handle = Some(handle);
            }
            Err(e) => {
                self.state.set(PlaybackState::Stopped);
                let e = MidiError::Spawn(e);
                tracing::error!("{}", e);
                self.last_error = Some(e.to_string());
            }
        }
    }

    /// Stops playback and waits for the playback thread to exit.
    pub fn stop(&mut self) {
        if let Err(e) = self.join_playback() {
            tracing::error!("Cannot stop playback: {}", e);
            self.last_error = Some(e.to_string());
        }
    }

    /// Pauses the queue transport.
    ///
    /// Ignored unless pausing is allowed and playback is active.
    pub fn pause(&self) {
        if !self.allow_pause || self.state.get() == PlaybackState::Stopped {
            return;
        }
        if let Err(e) = self.controller.send(Command::Pause) {
            tracing::debug!("Pause not delivered: {}", e);
        }
    }

    /// Resumes a paused transport.
    ///
    /// Ignored unless pausing is allowed and playback is paused.
    pub fn resume(&self) {
        if !self.allow_pause || self.state.get() != PlaybackState::Paused {
            return;
        }
        if let Err(e) = self.controller.send(Command::Resume) {
            tracing::debug!("Resume not delivered: {}", e);
        }
    }

    /// Sets the master volume, clamped to 0-127.
    ///
    /// Takes effect while playing or paused. A level set while paused is
    /// applied when playback resumes.
    pub fn set_volume(&self, volume: i32) {
        if !matches!(
            self.state.get(),
            PlaybackState::Playing | PlaybackState::Paused
        ) {
            return;
        }
        let volume = volume.clamp(0, MAX_DATA as i32) as u8;
        if let Err(e) = self.controller.send(Command::SetVolume(volume)) {
            tracing::debug!("Volume not delivered: {}", e);
        }
    }

    /// True from `start` until the playback thread has fully stopped.
    pub fn is_active(&self) -> bool {
        self.state.get() != PlaybackState::Stopped
    }

    pub fn state(&self) -> PlaybackState {
        self.state.get()
    }

    /// The most recent start or stop failure, if any.
    ///
    /// A run that could not set up its queue is reported once its thread
    /// has been joined by `stop` or the next `start`.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn ppqn(&self) -> u16 {
        self.ppqn
    }

    pub fn end_tick(&self) -> Tick {
        self.end_tick
    }

    /// Stops playback and releases the sequencer, the channel and the
    /// event list, in that order.
    pub fn free(mut self) {
        self.stop();
        drop(self.idle.take());
        tracing::debug!("Song freed");
    }

    /// Asks a running playback thread to quit and joins it.
    ///
    /// On success the engine's resources are back in `idle`. If Quit cannot
    /// be delivered the thread is left running and nothing changes.
    fn join_playback(&mut self) -> Result<(), MidiError> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };

        // A finished thread has nothing left to tell
        if !handle.is_finished() {
            self.controller
                .send_waiting(Command::Quit)
                .map_err(|e| MidiError::Control(Command::Quit, e))?;
        }

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(mut resources) => {
                // Frames the engine never read must not reach the next run
                while let Ok(Some(frame)) = resources.endpoint.try_receive() {
                    tracing::trace!("Discarding stale control frame {:?}", frame);
                }
                if let Some(e) = resources.init_error.take() {
                    self.last_error = Some(MidiError::from(e).to_string());
                }
                self.idle = Some(resources);
                Ok(())
            }
            Err(_) => {
                self.state.set(PlaybackState::Stopped);
                Err(MidiError::PlaybackPanicked)
            }
        }
    }
}

impl Drop for Song {
    fn drop(&mut self) {
        self.stop();
    }
}
