//! Output sinks: where the software sequencer delivers MIDI bytes.
//!
//! `SynthSink` renders with rustysynth through a rodio output stream.
//! `MidirSink` forwards to a hardware or virtual MIDI port.

use super::PortType;
use crate::midi::{SYSEX, SYSEX_END};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use midir::{MidiOutput, MidiOutputConnection, MidiOutputPort};
use rodio::{OutputStream, Source};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Sample rate for audio synthesis (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Audio buffer size for low-latency playback.
const BUFFER_SIZE: usize = 256;

/// Master volume the synthesizer uses at full MIDI level.
const FULL_MASTER_VOLUME: f32 = 0.5;

/// Errors reported by a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot open MIDI output: {0}")]
    Init(String),
    #[error("cannot connect to {port}: {message}")]
    Connect { port: String, message: String },
    #[error("cannot send to {port}: {message}")]
    Send { port: String, message: String },
}

/// How a sink presents itself in the port catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInfo {
    pub client_name: String,
    pub port_name: String,
    pub port_type: PortType,
}

/// Something that plays raw MIDI messages.
pub trait MidiSink: Send {
    /// Name and type advertised to other clients.
    fn port_info(&self) -> SinkInfo;

    /// Called when the sink gets subscribed to a sequencer port.
    fn subscribe(&mut self) -> Result<(), SinkError>;

    /// Plays one complete MIDI message.
    fn send(&mut self, message: &[u8]) -> Result<(), SinkError>;
}

/// Extracts the level from a universal master volume SysEx.
pub fn master_volume_level(message: &[u8]) -> Option<u8> {
    match message {
        [SYSEX, 0x7F, _, 0x04, 0x01, _, msb, SYSEX_END] => Some(*msb),
        _ => None,
    }
}

/// Interleaved stereo stream rendered block by block from the synthesizer.
///
/// rodio pulls one sample at a time; a whole block is rendered whenever the
/// previous one has been handed out.
struct SynthSource {
    /// Shared with the sink, which feeds it MIDI messages.
    synth: Arc<Mutex<Synthesizer>>,
    /// Current block, left and right samples alternating.
    block: Vec<f32>,
    /// Scratch buffers the synthesizer renders into.
    left: Vec<f32>,
    right: Vec<f32>,
    /// Next sample of `block` to hand out.
    pos: usize,
}

impl SynthSource {
    fn new(synth: Arc<Mutex<Synthesizer>>) -> Self {
        Self {
            synth,
            block: vec![0.0; BUFFER_SIZE * 2],
            left: vec![0.0; BUFFER_SIZE],
            right: vec![0.0; BUFFER_SIZE],
            pos: BUFFER_SIZE * 2,
        }
    }

    fn render_block(&mut self) {
        match self.synth.lock() {
            Ok(mut synth) => synth.render(&mut self.left, &mut self.right),
            // A poisoned synth plays silence
            Err(_) => {
                self.left.fill(0.0);
                self.right.fill(0.0);
            }
        }
        interleave(&self.left, &self.right, &mut self.block);
        self.pos = 0;
    }
}

/// Writes `left` and `right` into `out` as alternating stereo frames.
fn interleave(left: &[f32], right: &[f32], out: &mut [f32]) {
    for (frame, (l, r)) in out.chunks_exact_mut(2).zip(left.iter().zip(right)) {
        frame[0] = *l;
        frame[1] = *r;
    }
}

impl Iterator for SynthSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.pos >= self.block.len() {
            self.render_block();
        }
        let sample = self.block[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for SynthSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// A SoundFont synthesizer played through the default audio device.
///
/// The rodio stream lives on its own thread so the sink can be moved to
/// the sequencer's clock thread.
pub struct SynthSink {
    synth: Arc<Mutex<Synthesizer>>,
    name: String,
    /// Dropping this ends the audio thread.
    audio_stop: Option<Sender<()>>,
    audio_thread: Option<JoinHandle<()>>,
}

impl SynthSink {
    /// Loads a SoundFont and starts audio output.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The SoundFont file cannot be read or is invalid
    /// - Audio output cannot be initialized
    pub fn new<P: AsRef<Path>>(soundfont_path: P) -> Result<Self> {
        let path = soundfont_path.as_ref();
        let mut file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open SoundFont: {}", path.display()))?,
        );
        let soundfont = Arc::new(
            SoundFont::new(&mut file)
                .map_err(|e| anyhow::anyhow!("Failed to load SoundFont: {:?}", e))?,
        );

        let settings = SynthesizerSettings::new(SAMPLE_RATE as i32);
        let synth = Synthesizer::new(&soundfont, &settings)
            .map_err(|e| anyhow::anyhow!("Failed to create synthesizer: {:?}", e))?;
        let synth = Arc::new(Mutex::new(synth));

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let source = SynthSource::new(Arc::clone(&synth));
        let audio_thread = thread::Builder::new()
            .name("midiplay-audio".to_string())
            .spawn(move || run_audio(source, ready_tx, stop_rx))
            .context("Failed to spawn audio thread")?;

        ready_rx
            .recv()
            .context("Audio thread exited during startup")?
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to open audio output")?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "SoundFont".to_string());
        tracing::info!("Synthesizer ready with {}", name);

        Ok(Self {
            synth,
            name,
            audio_stop: Some(stop_tx),
            audio_thread: Some(audio_thread),
        })
    }
}

/// Owns the output stream until the sink is dropped.
fn run_audio(source: SynthSource, ready: Sender<Result<(), String>>, stop: Receiver<()>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    if let Err(e) = handle.play_raw(source) {
        let _ = ready.send(Err(e.to_string()));
        return;
    }
    let _ = ready.send(Ok(()));
    // Returns once the sender side is dropped
    let _ = stop.recv();
    tracing::debug!("Audio output closed");
}

impl MidiSink for SynthSink {
    fn port_info(&self) -> SinkInfo {
        SinkInfo {
            client_name: format!("Synth ({})", self.name),
            port_name: "Synth input".to_string(),
            port_type: PortType::MIDI_GENERIC
                | PortType::MIDI_GM
                | PortType::SOFTWARE
                | PortType::SYNTHESIZER,
        }
    }

    fn subscribe(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn send(&mut self, message: &[u8]) -> Result<(), SinkError> {
        let Ok(mut synth) = self.synth.lock() else {
            return Ok(());
        };

        if let Some(level) = master_volume_level(message) {
            synth.set_master_volume(FULL_MASTER_VOLUME * level as f32 / 127.0);
            return Ok(());
        }

        match *message {
            [status, d0, d1] if status < SYSEX => {
                synth.process_midi_message(
                    (status & 0x0F) as i32,
                    (status & 0xF0) as i32,
                    d0 as i32,
                    d1 as i32,
                );
            }
            [status, d0] if status < SYSEX => {
                synth.process_midi_message(
                    (status & 0x0F) as i32,
                    (status & 0xF0) as i32,
                    d0 as i32,
                    0,
                );
            }
            _ => tracing::trace!("Synth ignores {:02x?}", message),
        }
        Ok(())
    }
}

impl Drop for SynthSink {
    fn drop(&mut self) {
        if let Ok(mut synth) = self.synth.lock() {
            synth.note_off_all(true);
        }
        drop(self.audio_stop.take());
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
        }
    }
}

/// An output port reached through midir.
///
/// The connection is opened on first subscription.
pub struct MidirSink {
    app_name: String,
    port: MidiOutputPort,
    port_name: String,
    connection: Option<MidiOutputConnection>,
}

impl MidirSink {
    /// Lists the available MIDI output ports as unconnected sinks.
    pub fn list(app_name: &str) -> Result<Vec<MidirSink>, SinkError> {
        let midi_out = MidiOutput::new(app_name).map_err(|e| SinkError::Init(e.to_string()))?;
        let sinks = midi_out
            .ports()
            .into_iter()
            .map(|port| {
                let port_name = midi_out
                    .port_name(&port)
                    .unwrap_or_else(|_| "Unknown".to_string());
                MidirSink {
                    app_name: app_name.to_string(),
                    port,
                    port_name,
                    connection: None,
                }
            })
            .collect();
        Ok(sinks)
    }
}

impl MidiSink for MidirSink {
    fn port_info(&self) -> SinkInfo {
        SinkInfo {
            client_name: self.port_name.clone(),
            port_name: self.port_name.clone(),
            port_type: PortType::MIDI_GENERIC | PortType::PORT,
        }
    }

    fn subscribe(&mut self) -> Result<(), SinkError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let connect_error = |message: String| SinkError::Connect {
            port: self.port_name.clone(),
            message,
        };
        let midi_out =
            MidiOutput::new(&self.app_name).map_err(|e| connect_error(e.to_string()))?;
        let connection = midi_out
            .connect(&self.port, &self.app_name)
            .map_err(|e| connect_error(e.to_string()))?;
        tracing::info!("Connected to MIDI port: {}", self.port_name);
        self.connection = Some(connection);
        Ok(())
    }

    fn send(&mut self, message: &[u8]) -> Result<(), SinkError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        connection.send(message).map_err(|e| SinkError::Send {
            port: self.port_name.clone(),
            message: e.to_string(),
        })
    }
}

impl Drop for MidirSink {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}
